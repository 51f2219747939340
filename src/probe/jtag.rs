//! Bit-banged JTAG wire layer: IEEE 1149.1 TAP state machine and IR/DR
//! shifting.
//!
//! Data is shifted LSB-first. TDO is captured on the rising TCK edge. All
//! public shift operations start from Run-Test/Idle and return there through
//! Exit1 and Update.

use bitvec::prelude::*;

use crate::probe::ProbeIo;

/// The 16 states of the TAP controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// The deterministic state transition for one TCK cycle with the given
    /// TMS level.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::{
            CaptureDr, CaptureIr, Exit1Dr, Exit1Ir, Exit2Dr, Exit2Ir, PauseDr, PauseIr,
            RunTestIdle, SelectDrScan, SelectIrScan, ShiftDr, ShiftIr, TestLogicReset, UpdateDr,
            UpdateIr,
        };

        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true) => TestLogicReset,
            (RunTestIdle, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (SelectDrScan, false) => CaptureDr,
            (SelectDrScan, true) => SelectIrScan,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => RunTestIdle,
            (UpdateDr, true) => SelectDrScan,
            (SelectIrScan, false) => CaptureIr,
            (SelectIrScan, true) => TestLogicReset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => RunTestIdle,
            (UpdateIr, true) => SelectDrScan,
        }
    }
}

/// Bit-banged JTAG PHY with the current TAP state and the quarter-period
/// delay shared with the SWD PHY.
#[derive(Debug)]
pub struct JtagPhy {
    state: TapState,
    pub delay_us: u32,
}

impl JtagPhy {
    pub fn new(delay_us: u32) -> Self {
        Self {
            state: TapState::TestLogicReset,
            delay_us,
        }
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    fn delay(&self, io: &mut dyn ProbeIo) {
        if self.delay_us != 0 {
            io.delay_us(self.delay_us);
        }
    }

    /// One TCK cycle: set TMS/TDI, rising edge, capture TDO, falling edge.
    fn clock(&mut self, io: &mut dyn ProbeIo, tms: bool, tdi: bool) -> bool {
        io.tms_write(tms);
        io.tdi_write(tdi);
        self.delay(io);
        io.tck_write(true);
        let tdo = io.tdo_read();
        self.delay(io);
        io.tck_write(false);

        self.state = self.state.step(tms);
        tdo
    }

    fn write_tms(&mut self, io: &mut dyn ProbeIo, levels: &[bool]) {
        for &tms in levels {
            self.clock(io, tms, false);
        }
    }

    /// Force the TAP into Test-Logic-Reset from any state: six cycles with
    /// TMS high are guaranteed to get there.
    pub fn tap_reset(&mut self, io: &mut dyn ProbeIo) {
        io.tck_write(false);
        self.write_tms(io, &[true; 6]);
        debug_assert_eq!(self.state, TapState::TestLogicReset);
    }

    /// Move to Run-Test/Idle from any state, resetting first if needed.
    pub fn goto_idle(&mut self, io: &mut dyn ProbeIo) {
        if self.state != TapState::RunTestIdle {
            if self.state != TapState::TestLogicReset {
                self.tap_reset(io);
            }
            self.write_tms(io, &[false]);
        }
    }

    /// Shift `tdi` through the register selected by the current scan chain
    /// column, starting from Shift-IR/DR. The final bit is clocked with
    /// TMS=1, leaving the TAP in Exit1.
    fn shift(&mut self, io: &mut dyn ProbeIo, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        let mut tdo = BitVec::with_capacity(tdi.len());
        if tdi.is_empty() {
            return tdo;
        }
        let last = tdi.len() - 1;
        for (i, bit) in tdi.iter().by_vals().enumerate() {
            tdo.push(self.clock(io, i == last, bit));
        }
        tdo
    }

    /// Write the instruction register and return to Run-Test/Idle.
    pub fn write_ir(&mut self, io: &mut dyn ProbeIo, value: u32, bits: usize) {
        self.goto_idle(io);
        // Idle -> Select-DR -> Select-IR -> Capture-IR -> Shift-IR
        self.write_tms(io, &[true, true, false, false]);

        let mut tdi: BitVec<u8, Lsb0> = BitVec::repeat(false, bits);
        tdi.store_le(value);
        self.shift(io, &tdi);

        // Exit1-IR -> Update-IR -> Idle
        self.write_tms(io, &[true, false]);
    }

    /// Shift `tdi` through the currently selected data register and return
    /// the captured bits, ending back in Run-Test/Idle.
    pub fn transfer_dr(&mut self, io: &mut dyn ProbeIo, tdi: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        self.goto_idle(io);
        // Idle -> Select-DR -> Capture-DR -> Shift-DR
        self.write_tms(io, &[true, false, false]);

        let tdo = self.shift(io, tdi);

        // Exit1-DR -> Update-DR -> Idle
        self.write_tms(io, &[true, false]);
        tdo
    }

    /// Read a data register of up to 32 bits, shifting in zeros.
    pub fn read_dr32(&mut self, io: &mut dyn ProbeIo, bits: usize) -> u32 {
        let tdi: BitVec<u8, Lsb0> = BitVec::repeat(false, bits.min(32));
        self.transfer_dr(io, &tdi).load_le::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use super::TapState;

    #[test]
    fn five_tms_ones_reset_from_any_state() {
        let all = [
            TapState::TestLogicReset,
            TapState::RunTestIdle,
            TapState::SelectDrScan,
            TapState::CaptureDr,
            TapState::ShiftDr,
            TapState::Exit1Dr,
            TapState::PauseDr,
            TapState::Exit2Dr,
            TapState::UpdateDr,
            TapState::SelectIrScan,
            TapState::CaptureIr,
            TapState::ShiftIr,
            TapState::Exit1Ir,
            TapState::PauseIr,
            TapState::Exit2Ir,
            TapState::UpdateIr,
        ];
        for start in all {
            let mut state = start;
            for _ in 0..5 {
                state = state.step(true);
            }
            assert_eq!(state, TapState::TestLogicReset, "from {start:?}");
        }
    }

    #[test]
    fn canonical_dr_scan_path() {
        let mut state = TapState::RunTestIdle;
        for tms in [true, false, false] {
            state = state.step(tms);
        }
        assert_eq!(state, TapState::ShiftDr);

        // last shifted bit exits, then update and idle
        state = state.step(true);
        assert_eq!(state, TapState::Exit1Dr);
        state = state.step(true);
        assert_eq!(state, TapState::UpdateDr);
        state = state.step(false);
        assert_eq!(state, TapState::RunTestIdle);
    }

    #[test]
    fn canonical_ir_scan_path() {
        let mut state = TapState::RunTestIdle;
        for tms in [true, true, false, false] {
            state = state.step(tms);
        }
        assert_eq!(state, TapState::ShiftIr);
    }

    #[test]
    fn pause_and_resume_shifting() {
        let mut state = TapState::ShiftDr;
        state = state.step(true); // Exit1-DR
        state = state.step(false); // Pause-DR
        assert_eq!(state, TapState::PauseDr);
        state = state.step(false);
        assert_eq!(state, TapState::PauseDr);
        state = state.step(true); // Exit2-DR
        state = state.step(false); // back to Shift-DR
        assert_eq!(state, TapState::ShiftDr);
    }
}
