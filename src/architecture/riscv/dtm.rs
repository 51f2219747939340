//! Debug Transport Module access: DTMCS and DMI registers of the RISC-V
//! JTAG TAP.
//!
//! The DMI data register carries `[address:abits][data:32][op:2]`,
//! LSB-first on the wire. A DMI read is two shifts: the read request and a
//! nop that clocks out the response. The number of address bits is learned
//! from DTMCS at attach time.

use bitfield::bitfield;
use bitvec::prelude::*;

use crate::architecture::riscv::{RiscvError, RiscvInterface};

/// JTAG instruction register values of the RISC-V DTM. The IR is 5 bits.
pub const IR_IDCODE: u32 = 0x01;
pub const IR_DTMCS: u32 = 0x10;
pub const IR_DMI: u32 = 0x11;
pub const IR_LEN: usize = 5;

/// Default DMI address width used until DTMCS has been read, and when
/// DTMCS reports zero.
const DEFAULT_ABITS: u32 = 7;

bitfield! {
    /// DTM control and status.
    #[derive(Clone, Copy)]
    pub struct Dtmcs(u32);
    impl Debug;
    pub _, set_dmihardreset: 17;
    /// Clears the sticky DMI error state without touching DMI registers.
    pub _, set_dmireset: 16;
    pub u8, idle, _: 14, 12;
    pub u8, dmistat, _: 11, 10;
    pub u32, abits, _: 9, 4;
    pub u8, version, _: 3, 0;
}

impl From<u32> for Dtmcs {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dtmcs> for u32 {
    fn from(raw: Dtmcs) -> Self {
        raw.0
    }
}

/// One operation on the DMI register.
#[derive(Debug, Clone, Copy)]
pub enum DmiOperation {
    NoOp,
    Read { address: u32 },
    Write { address: u32, value: u32 },
}

impl DmiOperation {
    fn opcode(&self) -> u64 {
        match self {
            DmiOperation::NoOp => 0,
            DmiOperation::Read { .. } => 1,
            DmiOperation::Write { .. } => 2,
        }
    }

    /// The raw shift value: `op` in bits [1:0], data in [33:2], address
    /// from bit 34 upwards.
    fn register_value(&self) -> u64 {
        let (address, value) = match *self {
            DmiOperation::NoOp => (0, 0),
            DmiOperation::Read { address } => (address, 0),
            DmiOperation::Write { address, value } => (address, value),
        };
        self.opcode() | ((value as u64) << 2) | ((address as u64) << 34)
    }
}

/// Status returned in the op field of a DMI response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiOperationStatus {
    Ok = 0,
    Reserved = 1,
    OperationFailed = 2,
    RequestInProgress = 3,
}

impl DmiOperationStatus {
    fn parse(value: u8) -> Self {
        match value {
            0 => DmiOperationStatus::Ok,
            1 => DmiOperationStatus::Reserved,
            2 => DmiOperationStatus::OperationFailed,
            _ => DmiOperationStatus::RequestInProgress,
        }
    }
}

/// Persistent DTM state.
#[derive(Debug)]
pub struct DtmState {
    pub(crate) abits: u32,
    /// Retry a busy DMI operation once after a dmireset. Leaving this off
    /// reports busy as a failure immediately.
    pub retry_on_busy: bool,
}

impl DtmState {
    pub fn new() -> Self {
        Self {
            abits: DEFAULT_ABITS,
            retry_on_busy: true,
        }
    }
}

impl Default for DtmState {
    fn default() -> Self {
        Self::new()
    }
}

impl RiscvInterface<'_> {
    /// Read the TAP IDCODE.
    pub(crate) fn read_idcode(&mut self) -> u32 {
        self.state.phy.write_ir(self.io, IR_IDCODE, IR_LEN);
        self.state.phy.read_dr32(self.io, 32)
    }

    /// Read DTMCS and capture the DMI address width.
    pub(crate) fn read_dtmcs(&mut self) -> Dtmcs {
        self.state.phy.write_ir(self.io, IR_DTMCS, IR_LEN);
        let dtmcs = Dtmcs(self.state.phy.read_dr32(self.io, 32));

        self.state.dtm.abits = match dtmcs.abits() {
            0 => DEFAULT_ABITS,
            abits => abits,
        };
        dtmcs
    }

    /// Clear the sticky DMI error/busy state through DTMCS.
    pub(crate) fn dmi_reset(&mut self) {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);
        self.state.phy.write_ir(self.io, IR_DTMCS, IR_LEN);

        let mut tdi: BitVec<u8, Lsb0> = BitVec::repeat(false, 32);
        tdi.store_le::<u32>(dtmcs.into());
        self.state.phy.transfer_dr(self.io, &tdi);
    }

    /// One shift through the DMI register. Returns the status and data
    /// captured by this shift, which belong to the *previous* operation.
    fn dmi_shift(&mut self, op: DmiOperation) -> (DmiOperationStatus, u32) {
        self.state.phy.write_ir(self.io, IR_DMI, IR_LEN);

        let bits = 34 + self.state.dtm.abits as usize;
        let mut tdi: BitVec<u8, Lsb0> = BitVec::repeat(false, bits);
        tdi.store_le(op.register_value());

        let tdo = self.state.phy.transfer_dr(self.io, &tdi);
        let response = tdo.load_le::<u64>();

        let status = DmiOperationStatus::parse((response & 0x3) as u8);
        let value = (response >> 2) as u32;
        (status, value)
    }

    fn dmi_execute(&mut self, op: DmiOperation) -> Result<u32, RiscvError> {
        let (status, value) = match op {
            DmiOperation::Read { .. } => {
                // The read request only starts the access; a nop shift
                // clocks out its result.
                self.dmi_shift(op);
                self.dmi_shift(DmiOperation::NoOp)
            }
            _ => self.dmi_shift(op),
        };

        match status {
            DmiOperationStatus::Ok => Ok(value),
            DmiOperationStatus::RequestInProgress => Err(RiscvError::DtmBusy),
            _ => Err(RiscvError::DtmOperationFailed),
        }
    }

    /// Perform a DMI operation, optionally retrying once after a dmireset
    /// when the DTM reports busy.
    fn dmi_op(&mut self, op: DmiOperation) -> Result<u32, RiscvError> {
        match self.dmi_execute(op) {
            Err(RiscvError::DtmBusy) if self.state.dtm.retry_on_busy => {
                tracing::debug!("DMI busy, resetting and retrying once");
                self.dmi_reset();
                self.dmi_execute(op)
            }
            result => result,
        }
    }

    /// Read a Debug Module register over DMI.
    pub(crate) fn dmi_read(&mut self, address: u32) -> Result<u32, RiscvError> {
        self.dmi_op(DmiOperation::Read { address })
    }

    /// Write a Debug Module register over DMI.
    pub(crate) fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        self.dmi_op(DmiOperation::Write { address, value })
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{DmiOperation, DmiOperationStatus};

    #[test]
    fn dmi_wire_word_layout() {
        let op = DmiOperation::Write {
            address: 0x10,
            value: 0x8000_0001,
        };
        let raw = op.register_value();
        assert_eq!(raw & 0x3, 2);
        assert_eq!((raw >> 2) & 0xFFFF_FFFF, 0x8000_0001);
        assert_eq!(raw >> 34, 0x10);
    }

    #[test]
    fn status_parsing() {
        assert_eq!(DmiOperationStatus::parse(0), DmiOperationStatus::Ok);
        assert_eq!(
            DmiOperationStatus::parse(2),
            DmiOperationStatus::OperationFailed
        );
        assert_eq!(
            DmiOperationStatus::parse(3),
            DmiOperationStatus::RequestInProgress
        );
    }
}
