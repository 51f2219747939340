//! Wire-level JTAG target simulator with a RISC-V DTM and Debug Module.
//!
//! Implements the IEEE 1149.1 TAP behavior bit by bit (TDO changes on the
//! rising TCK edge the probe samples on), a 5-bit IR with IDCODE, DTMCS and
//! DMI registers, and a Debug Module per RISC-V debug 0.13 with abstract
//! register access, System Bus Access and a small trigger module.

use std::collections::BTreeMap;

use tinydap::probe::jtag::TapState;

use crate::common::swd_sim::Access;

const IR_IDCODE: u32 = 0x01;
const IR_DTMCS: u32 = 0x10;
const IR_DMI: u32 = 0x11;
const IR_LEN: usize = 5;
const ABITS: u32 = 7;

/// RISC-V Debug Module model behind the DMI.
#[derive(Debug)]
pub struct DebugModule {
    pub regs: [u32; 32],
    pub dpc: u32,
    pub dcsr: u32,
    pub halted: bool,
    pub num_triggers: usize,
    pub tdata1: [u32; 4],
    pub tdata2: [u32; 4],
    pub mem: BTreeMap<u32, u32>,
    pub log: Vec<Access>,

    dmactive: bool,
    resumeack: bool,
    cmderr: u32,
    data0: u32,
    data1: u32,
    sbcs_ctl: u32,
    sbaddress: u32,
    sbdata: u32,
    tselect: u32,
}

impl DebugModule {
    fn new() -> Self {
        Self {
            regs: [0; 32],
            dpc: 0,
            dcsr: 0,
            halted: false,
            num_triggers: 2,
            // Address/data match triggers report type 2.
            tdata1: [2 << 28; 4],
            tdata2: [0; 4],
            mem: BTreeMap::new(),
            log: Vec::new(),
            dmactive: false,
            resumeack: false,
            cmderr: 0,
            data0: 0,
            data1: 0,
            sbcs_ctl: 0,
            sbaddress: 0,
            sbdata: 0,
            tselect: 0,
        }
    }

    fn set_cause(&mut self, cause: u32) {
        self.dcsr = (self.dcsr & !(7 << 6)) | (cause << 6);
    }

    pub fn mem_word(&self, addr: u32) -> u32 {
        self.mem.get(&(addr & !3)).copied().unwrap_or(0)
    }

    pub fn set_mem_word(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr & !3, value);
    }

    fn mem_read(&mut self, addr: u32) -> u32 {
        self.log.push(Access { write: false, addr });
        self.mem_word(addr)
    }

    fn mem_write(&mut self, addr: u32, value: u32) {
        self.log.push(Access { write: true, addr });
        self.mem.insert(addr & !3, value);
    }

    /// Halt as if the configured trigger `index` had fired.
    pub fn trigger_hit(&mut self, index: usize) {
        self.tdata1[index] |= 1 << 20;
        self.halted = true;
        self.set_cause(2);
    }

    /// Halt as if the hart had executed an ebreak.
    pub fn halt_with_ebreak(&mut self) {
        self.halted = true;
        self.set_cause(1);
    }

    fn read(&mut self, addr: u32) -> u32 {
        match addr {
            0x04 => self.data0,
            0x05 => self.data1,
            0x10 => self.dmactive as u32,
            0x11 => {
                let mut status = 2; // version 0.13
                status |= 1 << 7; // authenticated
                if self.halted {
                    status |= 3 << 8;
                } else {
                    status |= 3 << 10;
                }
                if self.resumeack {
                    status |= 3 << 16;
                }
                status
            }
            0x16 => (self.cmderr << 8) | 1,
            0x38 => self.sbcs_ctl | (1 << 2) | (32 << 5),
            0x39 => self.sbaddress,
            0x3C => self.sbdata,
            _ => 0,
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        match addr {
            0x04 => self.data0 = value,
            0x05 => self.data1 = value,
            0x10 => {
                self.dmactive = value & 1 != 0;
                if value & (1 << 31) != 0 {
                    self.halted = true;
                    self.resumeack = false;
                    self.set_cause(3);
                } else if value & (1 << 30) != 0 {
                    if self.dcsr & (1 << 2) != 0 {
                        // Single step: one instruction retires, the hart
                        // re-enters debug mode.
                        self.dpc = self.dpc.wrapping_add(4);
                        self.halted = true;
                        self.set_cause(4);
                    } else {
                        self.halted = false;
                    }
                    self.resumeack = true;
                }
            }
            0x16 => self.cmderr &= !((value >> 8) & 7),
            0x17 => self.execute_command(value),
            0x38 => {
                self.sbcs_ctl = value & ((1 << 20) | (1 << 16) | (1 << 15) | (7 << 17));
            }
            0x39 => {
                self.sbaddress = value;
                if self.sbcs_ctl & (1 << 20) != 0 {
                    // sbreadonaddr
                    self.sbdata = self.mem_read(self.sbaddress);
                    if self.sbcs_ctl & (1 << 16) != 0 {
                        self.sbaddress = self.sbaddress.wrapping_add(4);
                    }
                }
            }
            0x3C => {
                self.sbdata = value;
                self.mem_write(self.sbaddress, value);
                if self.sbcs_ctl & (1 << 16) != 0 {
                    self.sbaddress = self.sbaddress.wrapping_add(4);
                }
            }
            _ => {}
        }
    }

    fn execute_command(&mut self, command: u32) {
        match command >> 24 {
            0 => {
                if (command >> 20) & 7 != 2 {
                    self.cmderr = 2;
                    return;
                }
                if (command >> 17) & 1 == 0 {
                    return;
                }
                let regno = command & 0xFFFF;
                if (command >> 16) & 1 != 0 {
                    let value = self.data0;
                    self.reg_write(regno, value);
                } else {
                    self.data0 = self.reg_read(regno);
                }
            }
            2 => {
                if (command >> 20) & 7 != 0 {
                    self.cmderr = 2;
                    return;
                }
                let addr = self.data1;
                let word_addr = addr & !3;
                let shift = 8 * (addr & 3);
                if (command >> 16) & 1 != 0 {
                    let mut word = self.mem_word(word_addr);
                    word = (word & !(0xFF << shift)) | ((self.data0 & 0xFF) << shift);
                    self.mem_write(word_addr, word);
                } else {
                    let word = self.mem_read(word_addr);
                    self.data0 = (word >> shift) & 0xFF;
                }
            }
            _ => self.cmderr = 2,
        }
    }

    fn reg_read(&mut self, regno: u32) -> u32 {
        match regno {
            0x1000..=0x101F => self.regs[(regno - 0x1000) as usize],
            0x7B0 => self.dcsr,
            0x7B1 => self.dpc,
            0x7A0 => self.tselect,
            0x7A1 => {
                if (self.tselect as usize) < self.num_triggers {
                    self.tdata1[self.tselect as usize]
                } else {
                    0
                }
            }
            0x7A2 => {
                if (self.tselect as usize) < self.num_triggers {
                    self.tdata2[self.tselect as usize]
                } else {
                    0
                }
            }
            _ => {
                self.cmderr = 2;
                0
            }
        }
    }

    fn reg_write(&mut self, regno: u32, value: u32) {
        match regno {
            0x1000 => {} // x0 is hardwired to zero
            0x1001..=0x101F => self.regs[(regno - 0x1000) as usize] = value,
            // dcsr.cause is read-only to the debugger.
            0x7B0 => self.dcsr = (value & !(7 << 6)) | (self.dcsr & (7 << 6)),
            0x7B1 => self.dpc = value,
            0x7A0 => self.tselect = value,
            0x7A1 => {
                if (self.tselect as usize) < self.num_triggers {
                    self.tdata1[self.tselect as usize] = value;
                }
            }
            0x7A2 => {
                if (self.tselect as usize) < self.num_triggers {
                    self.tdata2[self.tselect as usize] = value;
                }
            }
            _ => self.cmderr = 2,
        }
    }
}

/// The JTAG wire decoder: TAP FSM, IR and the DTM data registers.
#[derive(Debug)]
pub struct JtagTarget {
    pub dm: DebugModule,
    pub idcode: u32,

    tck: bool,
    tms: bool,
    tdi: bool,
    tdo: bool,
    state: TapState,
    ir: u32,
    ir_shift: u32,
    dr_shift: u64,
    /// Response captured by the next DMI scan; set by Update-DR.
    pending_dmi: u64,
}

impl JtagTarget {
    pub fn new(idcode: u32) -> Self {
        Self {
            dm: DebugModule::new(),
            idcode,
            tck: false,
            tms: false,
            tdi: false,
            tdo: false,
            state: TapState::TestLogicReset,
            ir: IR_IDCODE,
            ir_shift: 0,
            dr_shift: 0,
            pending_dmi: 0,
        }
    }

    pub fn tck_write(&mut self, high: bool) {
        let rising = high && !self.tck;
        self.tck = high;
        if rising {
            self.rising_edge();
        }
    }

    pub fn tms_write(&mut self, high: bool) {
        self.tms = high;
    }

    pub fn tdi_write(&mut self, high: bool) {
        self.tdi = high;
    }

    pub fn tdo_read(&self) -> bool {
        self.tdo
    }

    fn dr_width(&self) -> usize {
        match self.ir {
            IR_IDCODE | IR_DTMCS => 32,
            IR_DMI => 34 + ABITS as usize,
            _ => 1,
        }
    }

    fn capture_dr(&self) -> u64 {
        match self.ir {
            IR_IDCODE => self.idcode as u64,
            IR_DTMCS => (1 | (ABITS << 4)) as u64,
            IR_DMI => self.pending_dmi,
            _ => 0,
        }
    }

    fn update_dr(&mut self) {
        if self.ir != IR_DMI {
            return;
        }
        let value = self.dr_shift;
        let op = value & 0x3;
        let data = ((value >> 2) & 0xFFFF_FFFF) as u32;
        let addr = ((value >> 34) & ((1 << ABITS) - 1)) as u32;
        match op {
            1 => {
                let result = self.dm.read(addr);
                self.pending_dmi = (result as u64) << 2;
            }
            2 => {
                self.dm.write(addr, data);
                self.pending_dmi = 0;
            }
            _ => {}
        }
    }

    fn rising_edge(&mut self) {
        match self.state {
            TapState::ShiftIr => {
                self.tdo = self.ir_shift & 1 != 0;
                self.ir_shift =
                    (self.ir_shift >> 1) | ((self.tdi as u32) << (IR_LEN - 1));
            }
            TapState::ShiftDr => {
                self.tdo = self.dr_shift & 1 != 0;
                self.dr_shift =
                    (self.dr_shift >> 1) | ((self.tdi as u64) << (self.dr_width() - 1));
            }
            _ => {}
        }

        self.state = self.state.step(self.tms);

        match self.state {
            TapState::TestLogicReset => self.ir = IR_IDCODE,
            TapState::CaptureIr => self.ir_shift = 0b00001,
            TapState::CaptureDr => self.dr_shift = self.capture_dr(),
            TapState::UpdateIr => self.ir = self.ir_shift & 0x1F,
            TapState::UpdateDr => self.update_dr(),
            _ => {}
        }
    }
}
