//! MEM-AP memory engine.
//!
//! Word transfers program CSW and TAR defensively on every operation and
//! move data through DRW. Byte-granular access is layered on top of aligned
//! words: reads copy the covered bytes out, writes use a full-word fast path
//! when a word is completely overwritten and fall back to read-modify-write
//! for unaligned prefixes and suffixes. The fast path deliberately performs
//! no read, so that memory-mapped registers with read side effects can be
//! overwritten safely.

use bitfield::bitfield;

use crate::architecture::arm::dp::ArmDebugInterface;
use crate::architecture::arm::{ArmError, MemoryMappedRegister};

/// AP register byte offsets within the MEM-AP.
const MEM_AP_CSW: u8 = 0x00;
const MEM_AP_TAR: u8 = 0x04;
const MEM_AP_DRW: u8 = 0x0C;

bitfield! {
    /// MEM-AP Control/Status Word.
    #[derive(Clone, Copy)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub tr_in_prog, _: 7;
    pub dev_en, _: 6;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    /// 32-bit accesses, single auto-increment, with the bus protection
    /// value most AHB-APs accept for debugger traffic.
    pub fn word_access() -> Self {
        let mut csw = Csw(0);
        csw.set_prot(0x23);
        csw.set_addr_inc(1);
        csw.set_size(2);
        csw
    }
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl ArmDebugInterface<'_> {
    /// Read one aligned word through an explicit AP.
    pub fn read_word_ap(&mut self, ap_sel: u8, addr: u32) -> Result<u32, ArmError> {
        self.ap_write(ap_sel, MEM_AP_CSW, Csw::word_access().into())?;
        self.ap_write(ap_sel, MEM_AP_TAR, addr)?;
        self.ap_read(ap_sel, MEM_AP_DRW)
    }

    /// Write one aligned word through an explicit AP.
    pub fn write_word_ap(&mut self, ap_sel: u8, addr: u32, value: u32) -> Result<(), ArmError> {
        self.ap_write(ap_sel, MEM_AP_CSW, Csw::word_access().into())?;
        self.ap_write(ap_sel, MEM_AP_TAR, addr)?;
        self.ap_write(ap_sel, MEM_AP_DRW, value)
    }

    /// Read one aligned word through the active MEM-AP.
    pub fn read_word(&mut self, addr: u32) -> Result<u32, ArmError> {
        let ap_sel = self.state.memory_ap;
        self.read_word_ap(ap_sel, addr)
    }

    /// Write one aligned word through the active MEM-AP.
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), ArmError> {
        let ap_sel = self.state.memory_ap;
        self.write_word_ap(ap_sel, addr, value)
    }

    /// Read a typed memory-mapped register.
    pub(crate) fn read_mmio<R: MemoryMappedRegister>(&mut self) -> Result<R, ArmError> {
        self.read_word(R::ADDRESS).map(R::from)
    }

    /// Write a typed memory-mapped register.
    pub(crate) fn write_mmio<R: MemoryMappedRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.write_word(R::ADDRESS, register.into())
    }

    /// Byte-granular read: one aligned word read per covered word, bytes
    /// copied out in address order.
    pub fn read_8(&mut self, mut addr: u32, buf: &mut [u8]) -> Result<(), ArmError> {
        let mut index = 0;
        while index < buf.len() {
            let word = self.read_word(addr & !3)?;
            let mut byte = (addr & 3) as usize;
            while byte < 4 && index < buf.len() {
                buf[index] = (word >> (8 * byte)) as u8;
                index += 1;
                addr = addr.wrapping_add(1);
                byte += 1;
            }
        }
        Ok(())
    }

    /// Byte-granular write. Fully covered words are written directly
    /// without reading; partial words at the edges are read-modify-written.
    pub fn write_8(&mut self, mut addr: u32, mut data: &[u8]) -> Result<(), ArmError> {
        while !data.is_empty() {
            let offset = (addr & 3) as usize;

            if offset == 0 && data.len() >= 4 {
                let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.write_word(addr, word)?;
                addr = addr.wrapping_add(4);
                data = &data[4..];
                continue;
            }

            let aligned = addr & !3;
            let mut word = self.read_word(aligned)?;
            let mut byte = offset;
            while byte < 4 && !data.is_empty() {
                let mask = 0xFFu32 << (8 * byte);
                word = (word & !mask) | ((data[0] as u32) << (8 * byte));
                data = &data[1..];
                addr = addr.wrapping_add(1);
                byte += 1;
            }
            self.write_word(aligned, word)?;
        }
        Ok(())
    }
}
