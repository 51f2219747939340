//! ADIv5 Debug Port and Access Port transaction layer.
//!
//! Maintains the SELECT register shadow so AP accesses only reprogram the
//! bank when it actually changes, implements the posted-read contract for AP
//! reads (issue the read, fetch the result from RDBUFF), and owns the WAIT
//! retry and FAULT recovery policy on top of the raw PHY.

use bitfield::bitfield;

use crate::architecture::arm::cortex_m::CortexMState;
use crate::architecture::arm::{ArmError, DpRegister};
use crate::probe::swd::{DapError, SwdPhy};
use crate::probe::{PortType, ProbeIo, TransferDirection};

/// How often a transfer is retried when the target answers WAIT before the
/// layer gives up and issues a DAP abort.
const WAIT_RETRIES: usize = 8;

/// Iterations of the debug power-up ACK poll, at 100 µs cadence (~20 ms).
const POWER_UP_POLLS: usize = 200;

bitfield! {
    /// DPIDR, the Debug Port identification register.
    #[derive(Clone, Copy)]
    pub struct DpIdr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub u16, designer, _: 11, 1;
}

impl From<u32> for DpIdr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<DpIdr> for u32 {
    fn from(raw: DpIdr) -> Self {
        raw.0
    }
}

impl DpRegister for DpIdr {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}

bitfield! {
    /// ABORT, write-only at DP address 0. Writing the five clear bits
    /// removes all sticky error state.
    #[derive(Clone, Copy)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl Abort {
    /// The pattern clearing every sticky error flag.
    pub fn clear_all() -> Self {
        let mut abort = Abort(0);
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        abort.set_dapabort(true);
        abort
    }
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl DpRegister for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// CTRL/STAT at DP address 0x4.
    #[derive(Clone, Copy)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl DpRegister for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// SELECT at DP address 0x8: AP selector and AP register bank.
    #[derive(Clone, Copy, PartialEq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl DpRegister for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

/// RDBUFF at DP address 0xC: returns the result of the previous posted AP
/// read without initiating a new access.
#[derive(Debug, Clone, Copy)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl DpRegister for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

/// Persistent state of the ARM debug connection. Owned by the target facade
/// for the lifetime of the probe; reset on link bring-up.
#[derive(Debug)]
pub struct ArmDebugState {
    pub phy: SwdPhy,
    /// Shadow of the DP SELECT register. `None` forces the next AP access
    /// to reprogram it.
    select: Option<u32>,
    /// APSEL of the MEM-AP all implicit memory accesses go through.
    pub(crate) memory_ap: u8,
    /// Cortex-M engine state (profile, FPB and DWT allocations).
    pub(crate) core: CortexMState,
}

impl ArmDebugState {
    pub fn new(phy: SwdPhy) -> Self {
        Self {
            phy,
            select: None,
            memory_ap: 0,
            core: CortexMState::new(),
        }
    }
}

/// Short-lived interface value combining the wire with the persistent state,
/// constructed by the facade for each operation.
pub struct ArmDebugInterface<'a> {
    pub(crate) io: &'a mut dyn ProbeIo,
    pub(crate) state: &'a mut ArmDebugState,
}

impl<'a> ArmDebugInterface<'a> {
    pub fn new(io: &'a mut dyn ProbeIo, state: &'a mut ArmDebugState) -> Self {
        Self { io, state }
    }

    /// Raw transfer with bounded WAIT retry. Any failure invalidates the
    /// SELECT shadow so the next AP access re-synchronizes; FAULT
    /// additionally clears the sticky error flags.
    fn raw_transfer(
        &mut self,
        port: PortType,
        direction: TransferDirection,
        a23: u8,
        value: u32,
    ) -> Result<u32, ArmError> {
        let mut attempts = 0;
        loop {
            match self.state.phy.transfer(self.io, port, direction, a23, value) {
                Ok(value) => return Ok(value),
                Err(DapError::WaitResponse) if attempts < WAIT_RETRIES => {
                    attempts += 1;
                }
                Err(error) => {
                    self.state.select = None;
                    match error {
                        DapError::WaitResponse => {
                            // The target kept us waiting past the retry
                            // budget; abort the stuck transaction.
                            tracing::warn!("transfer stuck in WAIT, aborting");
                            let mut abort = Abort(0);
                            abort.set_dapabort(true);
                            let _ = self.state.phy.transfer(
                                self.io,
                                PortType::DebugPort,
                                TransferDirection::Write,
                                Abort::ADDRESS >> 2,
                                abort.into(),
                            );
                        }
                        DapError::FaultResponse => {
                            tracing::debug!("transfer FAULT, clearing sticky errors");
                            self.clear_errors();
                        }
                        _ => {}
                    }
                    return Err(error.into());
                }
            }
        }
    }

    /// Read a DP register.
    pub fn dp_read<R: DpRegister>(&mut self) -> Result<R, ArmError> {
        self.raw_transfer(
            PortType::DebugPort,
            TransferDirection::Read,
            R::ADDRESS >> 2,
            0,
        )
        .map(R::from)
    }

    /// Write a DP register.
    pub fn dp_write<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.raw_transfer(
            PortType::DebugPort,
            TransferDirection::Write,
            R::ADDRESS >> 2,
            register.into(),
        )
        .map(|_| ())
    }

    /// Make sure SELECT addresses the given AP and register bank, going
    /// through the shadow to avoid a redundant DP write.
    fn select_ap_bank(&mut self, ap_sel: u8, addr: u8) -> Result<(), ArmError> {
        let mut select = Select(0);
        select.set_ap_sel(ap_sel);
        select.set_ap_bank_sel((addr >> 4) & 0xF);

        if self.state.select == Some(select.0) {
            return Ok(());
        }

        tracing::trace!("SELECT <- {:#010x}", select.0);
        self.dp_write(select)?;
        self.state.select = Some(select.0);
        Ok(())
    }

    /// Write an AP register, addressed by its byte offset within the AP.
    pub fn ap_write(&mut self, ap_sel: u8, addr: u8, value: u32) -> Result<(), ArmError> {
        self.select_ap_bank(ap_sel, addr)?;
        self.raw_transfer(
            PortType::AccessPort,
            TransferDirection::Write,
            (addr >> 2) & 0x3,
            value,
        )
        .map(|_| ())
    }

    /// Read an AP register. AP reads are posted: the first transfer only
    /// initiates the access, the value is collected from RDBUFF.
    pub fn ap_read(&mut self, ap_sel: u8, addr: u8) -> Result<u32, ArmError> {
        self.select_ap_bank(ap_sel, addr)?;
        self.raw_transfer(
            PortType::AccessPort,
            TransferDirection::Read,
            (addr >> 2) & 0x3,
            0,
        )?;
        Ok(self.dp_read::<RdBuff>()?.0)
    }

    /// Bring up the SWD link: switch the SWJ-DP to SWD, confirm it by
    /// reading DPIDR, clear sticky errors and request debug power-up.
    pub fn init(&mut self) -> Result<(), ArmError> {
        self.state.select = None;
        self.state.core = CortexMState::new();

        let phy = self.state.phy;
        phy.jtag_to_swd(self.io);

        let idcode = self.dp_read::<DpIdr>()?;
        tracing::info!("DPIDR = {:#010x} ({:?})", idcode.0, idcode);

        self.dp_write(Abort::clear_all())?;

        let mut ctrl = Ctrl(0);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.dp_write(ctrl)?;

        let mut powered = false;
        for _ in 0..POWER_UP_POLLS {
            if let Ok(status) = self.dp_read::<Ctrl>() {
                if status.cdbgpwrupack() && status.csyspwrupack() {
                    powered = true;
                    break;
                }
            }
            self.io.delay_us(100);
        }
        if !powered {
            tracing::warn!("debug power-up request not acknowledged");
        }

        Ok(())
    }

    /// Clear all sticky error flags through ABORT. Best effort; used from
    /// FAULT recovery where the write itself may fail as well.
    pub fn clear_errors(&mut self) {
        let _ = self.state.phy.transfer(
            self.io,
            PortType::DebugPort,
            TransferDirection::Write,
            Abort::ADDRESS >> 2,
            Abort::clear_all().into(),
        );
    }

    /// The SELECT shadow, exposed for invariants in tests.
    pub fn select_shadow(&self) -> Option<u32> {
        self.state.select
    }
}
