//! RISC-V debug stack: the Debug Module driver on top of the JTAG Debug
//! Transport Module.
//!
//! Implements RISC-V Debug Specification 0.13 semantics for a single hart:
//! DM activation, halt/resume/step, register access through abstract
//! commands, memory through System Bus Access (with an abstract-command
//! fallback) and hardware breakpoints/watchpoints through the trigger
//! module.

pub mod dtm;

use bitfield::bitfield;

use crate::architecture::riscv::dtm::DtmState;
use crate::probe::jtag::JtagPhy;
use crate::probe::ProbeIo;
use crate::target::WatchKind;

/// Wall-clock bound for waits on the Debug Module, in microseconds.
const DM_TIMEOUT_US: u32 = 100_000;

/// Local trigger slot table capacity.
const MAX_TRIGGERS: usize = 4;

/// Number of GDB registers for RV32: x0..x31 and pc.
pub const GDB_REG_COUNT: usize = 33;

/// Abstract-command register number space.
const REGNO_GPR_BASE: u32 = 0x1000;
const CSR_DCSR: u32 = 0x7B0;
const CSR_DPC: u32 = 0x7B1;
const CSR_TSELECT: u32 = 0x7A0;
const CSR_TDATA1: u32 = 0x7A1;
const CSR_TDATA2: u32 = 0x7A2;

/// Minimal RV32 target description; register layout follows the
/// architecture default, so only the architecture element is needed.
const TARGET_XML_RV32: &str = concat!(
    "<?xml version=\"1.0\"?>",
    "<!DOCTYPE target SYSTEM \"gdb-target.dtd\">",
    "<target version=\"1.0\">",
    "<architecture>riscv:rv32</architecture>",
    "</target>",
);

/// Errors of the RISC-V debug stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RiscvError {
    #[error("no RISC-V target detected on the JTAG scan chain")]
    NoTarget,

    #[error("unsupported debug module version {0}")]
    UnsupportedVersion(u8),

    #[error("debug module requires authentication")]
    NotAuthenticated,

    #[error("DMI operation failed")]
    DtmOperationFailed,

    #[error("DMI operation still in progress")]
    DtmBusy,

    #[error("abstract command failed with cmderr {0}")]
    AbstractCommand(u8),

    #[error("system bus access failed with sberror {0}")]
    SystemBus(u8),

    #[error("timeout while waiting for the debug module")]
    Timeout,

    #[error("no free trigger slot")]
    NoFreeTrigger,

    #[error("register {0} is not accessible")]
    UnsupportedRegister(u32),
}

/// A Debug Module register, addressed over DMI.
pub trait DmRegister: From<u32> + Into<u32> + Sized {
    const ADDRESS: u32;
    const NAME: &'static str;
}

/// Abstract command / system bus argument registers.
#[derive(Debug, Clone, Copy)]
pub struct Data0(pub u32);

impl From<u32> for Data0 {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Data0> for u32 {
    fn from(raw: Data0) -> Self {
        raw.0
    }
}

impl DmRegister for Data0 {
    const ADDRESS: u32 = 0x04;
    const NAME: &'static str = "data0";
}

#[derive(Debug, Clone, Copy)]
pub struct Data1(pub u32);

impl From<u32> for Data1 {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Data1> for u32 {
    fn from(raw: Data1) -> Self {
        raw.0
    }
}

impl DmRegister for Data1 {
    const ADDRESS: u32 = 0x05;
    const NAME: &'static str = "data1";
}

bitfield! {
    /// Debug Module control.
    #[derive(Clone, Copy)]
    pub struct Dmcontrol(u32);
    impl Debug;
    pub _, set_haltreq: 31;
    pub _, set_resumereq: 30;
    pub _, set_hartreset: 29;
    pub _, set_ackhavereset: 28;
    pub _, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl From<u32> for Dmcontrol {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dmcontrol> for u32 {
    fn from(raw: Dmcontrol) -> Self {
        raw.0
    }
}

impl DmRegister for Dmcontrol {
    const ADDRESS: u32 = 0x10;
    const NAME: &'static str = "dmcontrol";
}

bitfield! {
    /// Debug Module status.
    #[derive(Clone, Copy)]
    pub struct Dmstatus(u32);
    impl Debug;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub u8, version, _: 3, 0;
}

impl From<u32> for Dmstatus {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dmstatus> for u32 {
    fn from(raw: Dmstatus) -> Self {
        raw.0
    }
}

impl DmRegister for Dmstatus {
    const ADDRESS: u32 = 0x11;
    const NAME: &'static str = "dmstatus";
}

bitfield! {
    /// Abstract control and status.
    #[derive(Clone, Copy)]
    pub struct Abstractcs(u32);
    impl Debug;
    pub u8, progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub u8, cmderr, set_cmderr: 10, 8;
    pub u8, datacount, _: 3, 0;
}

impl Abstractcs {
    /// Write-1-to-clear pattern for the cmderr field.
    fn clear_cmderr() -> Self {
        let mut abstractcs = Abstractcs(0);
        abstractcs.set_cmderr(0x7);
        abstractcs
    }
}

impl From<u32> for Abstractcs {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Abstractcs> for u32 {
    fn from(raw: Abstractcs) -> Self {
        raw.0
    }
}

impl DmRegister for Abstractcs {
    const ADDRESS: u32 = 0x16;
    const NAME: &'static str = "abstractcs";
}

bitfield! {
    /// Access Register abstract command (cmdtype 0).
    #[derive(Clone, Copy)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;
    pub u8, _, set_cmd_type: 31, 24;
    pub u8, _, set_aarsize: 22, 20;
    pub _, set_postexec: 18;
    pub _, set_transfer: 17;
    pub _, set_write: 16;
    pub u16, _, set_regno: 15, 0;
}

impl AccessRegisterCommand {
    fn access(regno: u32, write: bool) -> Self {
        let mut command = AccessRegisterCommand(0);
        command.set_aarsize(2);
        command.set_transfer(true);
        command.set_write(write);
        command.set_regno(regno as u16);
        command
    }
}

impl From<u32> for AccessRegisterCommand {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<AccessRegisterCommand> for u32 {
    fn from(raw: AccessRegisterCommand) -> Self {
        raw.0
    }
}

impl DmRegister for AccessRegisterCommand {
    const ADDRESS: u32 = 0x17;
    const NAME: &'static str = "command";
}

bitfield! {
    /// Access Memory abstract command (cmdtype 2). The address goes to
    /// data1, the value to data0.
    #[derive(Clone, Copy)]
    pub struct AccessMemoryCommand(u32);
    impl Debug;
    u8, _, set_cmd_type: 31, 24;
    pub u8, _, set_aamsize: 22, 20;
    pub _, set_aampostincrement: 19;
    pub _, set_write: 16;
}

impl AccessMemoryCommand {
    fn byte_access(write: bool) -> Self {
        let mut command = AccessMemoryCommand(0);
        command.set_cmd_type(2);
        command.set_aamsize(0);
        command.set_write(write);
        command
    }
}

impl From<u32> for AccessMemoryCommand {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<AccessMemoryCommand> for u32 {
    fn from(raw: AccessMemoryCommand) -> Self {
        raw.0
    }
}

impl DmRegister for AccessMemoryCommand {
    const ADDRESS: u32 = 0x17;
    const NAME: &'static str = "command";
}

bitfield! {
    /// System Bus Access control and status.
    #[derive(Clone, Copy)]
    pub struct Sbcs(u32);
    impl Debug;
    pub u8, sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub u8, sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub u8, sberror, set_sberror: 14, 12;
    pub u8, sbasize, _: 11, 5;
    pub sbaccess32, _: 2;
}

impl Sbcs {
    fn word_access() -> Self {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(2);
        sbcs
    }
}

impl From<u32> for Sbcs {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Sbcs> for u32 {
    fn from(raw: Sbcs) -> Self {
        raw.0
    }
}

impl DmRegister for Sbcs {
    const ADDRESS: u32 = 0x38;
    const NAME: &'static str = "sbcs";
}

#[derive(Debug, Clone, Copy)]
pub struct Sbaddress0(pub u32);

impl From<u32> for Sbaddress0 {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Sbaddress0> for u32 {
    fn from(raw: Sbaddress0) -> Self {
        raw.0
    }
}

impl DmRegister for Sbaddress0 {
    const ADDRESS: u32 = 0x39;
    const NAME: &'static str = "sbaddress0";
}

#[derive(Debug, Clone, Copy)]
pub struct Sbdata0(pub u32);

impl From<u32> for Sbdata0 {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Sbdata0> for u32 {
    fn from(raw: Sbdata0) -> Self {
        raw.0
    }
}

impl DmRegister for Sbdata0 {
    const ADDRESS: u32 = 0x3C;
    const NAME: &'static str = "sbdata0";
}

bitfield! {
    /// Debug control and status CSR (0x7B0).
    #[derive(Clone, Copy)]
    pub struct Dcsr(u32);
    impl Debug;
    pub u8, cause, _: 8, 6;
    pub step, set_step: 2;
}

impl From<u32> for Dcsr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dcsr> for u32 {
    fn from(raw: Dcsr) -> Self {
        raw.0
    }
}

bitfield! {
    /// Address/data match trigger configuration (tdata1 with type 2).
    #[derive(Clone, Copy)]
    pub struct Mcontrol(u32);
    impl Debug;
    pub u8, type_, set_type: 31, 28;
    pub dmode, set_dmode: 27;
    pub hit, set_hit: 20;
    pub u8, action, set_action: 15, 12;
    pub m, set_m: 6;
    pub u, set_u: 3;
    pub execute, set_execute: 2;
    pub store, set_store: 1;
    pub load, set_load: 0;
}

impl Mcontrol {
    /// Debug-mode trigger matching in M and U mode, firing a debug-mode
    /// entry on match.
    fn debug_trigger() -> Self {
        let mut mcontrol = Mcontrol(0);
        mcontrol.set_type(2);
        mcontrol.set_dmode(true);
        mcontrol.set_action(1);
        mcontrol.set_m(true);
        mcontrol.set_u(true);
        mcontrol
    }
}

impl From<u32> for Mcontrol {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Mcontrol> for u32 {
    fn from(raw: Mcontrol) -> Self {
        raw.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerRole {
    Breakpoint,
    Watchpoint(WatchKind),
}

#[derive(Debug, Clone, Copy)]
struct TriggerSlot {
    addr: u32,
    role: TriggerRole,
}

/// Persistent state of the RISC-V debug connection.
#[derive(Debug)]
pub struct RiscvState {
    pub phy: JtagPhy,
    pub dtm: DtmState,
    active: bool,
    has_sba: bool,
    progbuf_size: u8,
    data_count: u8,
    triggers_probed: bool,
    trigger_count: usize,
    triggers: [Option<TriggerSlot>; MAX_TRIGGERS],
}

impl RiscvState {
    pub fn new(phy: JtagPhy) -> Self {
        Self {
            phy,
            dtm: DtmState::new(),
            active: false,
            has_sba: false,
            progbuf_size: 0,
            data_count: 0,
            triggers_probed: false,
            trigger_count: 0,
            triggers: [None; MAX_TRIGGERS],
        }
    }
}

/// Short-lived interface combining the wire with the persistent state.
pub struct RiscvInterface<'a> {
    pub(crate) io: &'a mut dyn ProbeIo,
    pub(crate) state: &'a mut RiscvState,
}

impl<'a> RiscvInterface<'a> {
    pub fn new(io: &'a mut dyn ProbeIo, state: &'a mut RiscvState) -> Self {
        Self { io, state }
    }

    fn dm_read<R: DmRegister>(&mut self) -> Result<R, RiscvError> {
        self.dmi_read(R::ADDRESS).map(R::from)
    }

    fn dm_write<R: DmRegister>(&mut self, register: R) -> Result<(), RiscvError> {
        self.dmi_write(R::ADDRESS, register.into())
    }

    /// Attach to the target: verify the TAP, learn the DMI geometry,
    /// activate the Debug Module and read its capabilities.
    pub fn init(&mut self) -> Result<(), RiscvError> {
        self.state.active = false;
        self.state.triggers_probed = false;
        self.state.trigger_count = 0;
        self.state.triggers = [None; MAX_TRIGGERS];

        self.state.phy.tap_reset(self.io);

        let idcode = self.read_idcode();
        if idcode == 0 || idcode == 0xFFFF_FFFF {
            return Err(RiscvError::NoTarget);
        }
        tracing::info!("JTAG IDCODE = {idcode:#010x}");

        let dtmcs = self.read_dtmcs();
        if dtmcs.version() == 0 {
            return Err(RiscvError::NoTarget);
        }
        tracing::debug!("DTMCS = {dtmcs:?}, abits = {}", self.state.dtm.abits);

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.dm_write(dmcontrol)?;

        let dmstatus = self.dm_read::<Dmstatus>()?;
        if dmstatus.version() < 2 {
            return Err(RiscvError::UnsupportedVersion(dmstatus.version()));
        }
        if !dmstatus.authenticated() {
            return Err(RiscvError::NotAuthenticated);
        }

        let abstractcs = self.dm_read::<Abstractcs>()?;
        self.state.data_count = abstractcs.datacount();
        self.state.progbuf_size = abstractcs.progbufsize();

        // A DM without a system bus reads SBCS as zero.
        self.state.has_sba = match self.dm_read::<Sbcs>() {
            Ok(sbcs) => sbcs.0 != 0,
            Err(_) => false,
        };

        tracing::info!(
            "debug module v{}: datacount={}, progbufsize={}, sba={}",
            dmstatus.version(),
            self.state.data_count,
            self.state.progbuf_size,
            self.state.has_sba
        );

        self.state.active = true;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    fn require_active(&self) -> Result<(), RiscvError> {
        if self.state.active {
            Ok(())
        } else {
            Err(RiscvError::NoTarget)
        }
    }

    fn dmcontrol_base() -> Dmcontrol {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol
    }

    pub fn core_halted(&mut self) -> Result<bool, RiscvError> {
        self.require_active()?;
        Ok(self.dm_read::<Dmstatus>()?.allhalted())
    }

    /// Request a halt and wait for ALLHALTED, clearing HALTREQ either way.
    pub fn halt_core(&mut self) -> Result<(), RiscvError> {
        self.require_active()?;

        let mut dmcontrol = Self::dmcontrol_base();
        dmcontrol.set_haltreq(true);
        self.dm_write(dmcontrol)?;

        let start = self.io.time_us();
        let halted = loop {
            if self.dm_read::<Dmstatus>()?.allhalted() {
                break true;
            }
            if self.io.time_us().wrapping_sub(start) > DM_TIMEOUT_US {
                break false;
            }
        };

        self.dm_write(Self::dmcontrol_base())?;
        if halted {
            Ok(())
        } else {
            Err(RiscvError::Timeout)
        }
    }

    /// Request a resume and wait for ALLRESUMEACK, clearing RESUMEREQ
    /// either way.
    pub fn resume_core(&mut self) -> Result<(), RiscvError> {
        self.require_active()?;

        let mut dmcontrol = Self::dmcontrol_base();
        dmcontrol.set_resumereq(true);
        self.dm_write(dmcontrol)?;

        let start = self.io.time_us();
        let resumed = loop {
            if self.dm_read::<Dmstatus>()?.allresumeack() {
                break true;
            }
            if self.io.time_us().wrapping_sub(start) > DM_TIMEOUT_US {
                break false;
            }
        };

        self.dm_write(Self::dmcontrol_base())?;
        if resumed {
            Ok(())
        } else {
            Err(RiscvError::Timeout)
        }
    }

    /// Execute one instruction: set dcsr.step, resume, wait for the halt
    /// re-entry, clear dcsr.step.
    pub fn step_core(&mut self) -> Result<(), RiscvError> {
        self.require_active()?;

        if !self.core_halted()? {
            self.halt_core()?;
        }

        let mut dcsr = Dcsr(self.read_csr(CSR_DCSR)?);
        dcsr.set_step(true);
        self.write_csr(CSR_DCSR, dcsr.into())?;

        self.resume_core()?;

        let start = self.io.time_us();
        loop {
            if self.core_halted()? {
                break;
            }
            if self.io.time_us().wrapping_sub(start) > DM_TIMEOUT_US {
                return Err(RiscvError::Timeout);
            }
        }

        dcsr.set_step(false);
        self.write_csr(CSR_DCSR, dcsr.into())
    }

    /// Run one abstract command to completion and check cmderr.
    fn execute_abstract(&mut self, command: u32) -> Result<(), RiscvError> {
        self.dm_write(Abstractcs::clear_cmderr())?;
        self.dmi_write(AccessRegisterCommand::ADDRESS, command)?;

        let start = self.io.time_us();
        let abstractcs = loop {
            let abstractcs = self.dm_read::<Abstractcs>()?;
            if !abstractcs.busy() {
                break abstractcs;
            }
            if self.io.time_us().wrapping_sub(start) > DM_TIMEOUT_US {
                return Err(RiscvError::Timeout);
            }
        };

        if abstractcs.cmderr() != 0 {
            let cmderr = abstractcs.cmderr();
            self.dm_write(Abstractcs::clear_cmderr())?;
            return Err(RiscvError::AbstractCommand(cmderr));
        }
        Ok(())
    }

    /// Read a register by abstract-command number (GPRs at 0x1000+, CSRs
    /// at their CSR number).
    fn read_abstract_reg(&mut self, regno: u32) -> Result<u32, RiscvError> {
        self.execute_abstract(AccessRegisterCommand::access(regno, false).into())?;
        Ok(self.dm_read::<Data0>()?.0)
    }

    fn write_abstract_reg(&mut self, regno: u32, value: u32) -> Result<(), RiscvError> {
        self.dm_write(Data0(value))?;
        self.execute_abstract(AccessRegisterCommand::access(regno, true).into())
    }

    fn read_csr(&mut self, csr: u32) -> Result<u32, RiscvError> {
        self.read_abstract_reg(csr)
    }

    fn write_csr(&mut self, csr: u32, value: u32) -> Result<(), RiscvError> {
        self.write_abstract_reg(csr, value)
    }

    fn gdb_regno(regnum: u32) -> Result<u32, RiscvError> {
        match regnum {
            0..=31 => Ok(REGNO_GPR_BASE + regnum),
            32 => Ok(CSR_DPC),
            other => Err(RiscvError::UnsupportedRegister(other)),
        }
    }

    /// Read a register by GDB number: x0..x31, then pc (dpc).
    pub fn read_core_reg(&mut self, regnum: u32) -> Result<u32, RiscvError> {
        self.require_active()?;
        let regno = Self::gdb_regno(regnum)?;
        self.read_abstract_reg(regno)
    }

    /// Write a register by GDB number.
    pub fn write_core_reg(&mut self, regnum: u32, value: u32) -> Result<(), RiscvError> {
        self.require_active()?;
        let regno = Self::gdb_regno(regnum)?;
        self.write_abstract_reg(regno, value)
    }

    pub fn read_gdb_regs(&mut self, regs: &mut [u32; GDB_REG_COUNT]) -> Result<(), RiscvError> {
        for (regnum, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_core_reg(regnum as u32)?;
        }
        Ok(())
    }

    /// Write the GDB register block; x0 is hardwired to zero and skipped.
    pub fn write_gdb_regs(&mut self, regs: &[u32; GDB_REG_COUNT]) -> Result<(), RiscvError> {
        for (regnum, value) in regs.iter().enumerate().skip(1) {
            self.write_core_reg(regnum as u32, *value)?;
        }
        Ok(())
    }

    /// Wait for the system bus to go idle and check for errors, clearing
    /// them by writing the status back.
    fn sba_wait(&mut self) -> Result<(), RiscvError> {
        let start = self.io.time_us();
        let sbcs = loop {
            let sbcs = self.dm_read::<Sbcs>()?;
            if !sbcs.sbbusy() {
                break sbcs;
            }
            if self.io.time_us().wrapping_sub(start) > DM_TIMEOUT_US {
                return Err(RiscvError::Timeout);
            }
        };

        if sbcs.sberror() != 0 {
            self.dm_write(sbcs)?;
            return Err(RiscvError::SystemBus(sbcs.sberror()));
        }
        Ok(())
    }

    /// One aligned word read over the system bus.
    fn sba_read_word(&mut self, addr: u32) -> Result<u32, RiscvError> {
        let mut sbcs = Sbcs::word_access();
        sbcs.set_sbreadonaddr(true);
        self.dm_write(sbcs)?;
        self.dm_write(Sbaddress0(addr))?;
        self.sba_wait()?;
        Ok(self.dm_read::<Sbdata0>()?.0)
    }

    /// One aligned word write over the system bus.
    fn sba_write_word(&mut self, addr: u32, value: u32) -> Result<(), RiscvError> {
        self.dm_write(Sbcs::word_access())?;
        self.dm_write(Sbaddress0(addr))?;
        self.dm_write(Sbdata0(value))?;
        self.sba_wait()
    }

    /// Byte-granular memory read: system bus words when available, byte
    /// abstract memory commands otherwise.
    pub fn read_mem(&mut self, mut addr: u32, buf: &mut [u8]) -> Result<(), RiscvError> {
        self.require_active()?;

        if !self.state.has_sba {
            for (index, byte) in buf.iter_mut().enumerate() {
                self.dm_write(Data1(addr.wrapping_add(index as u32)))?;
                self.execute_abstract(AccessMemoryCommand::byte_access(false).into())?;
                *byte = self.dm_read::<Data0>()?.0 as u8;
            }
            return Ok(());
        }

        let mut index = 0;
        while index < buf.len() {
            let word = self.sba_read_word(addr & !3)?;
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

    /// Byte-granular memory write. Fully covered words go straight to the
    /// bus; partial words are read-modify-written.
    pub fn write_mem(&mut self, mut addr: u32, mut data: &[u8]) -> Result<(), RiscvError> {
        self.require_active()?;

        if !self.state.has_sba {
            for byte in data {
                self.dm_write(Data0(*byte as u32))?;
                self.dm_write(Data1(addr))?;
                self.execute_abstract(AccessMemoryCommand::byte_access(true).into())?;
                addr = addr.wrapping_add(1);
            }
            return Ok(());
        }

        while !data.is_empty() {
            let offset = (addr & 3) as usize;

            if offset == 0 && data.len() >= 4 {
                let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.sba_write_word(addr, word)?;
                addr = addr.wrapping_add(4);
                data = &data[4..];
                continue;
            }

            let aligned = addr & !3;
            let mut word = self.sba_read_word(aligned)?;
            let mut byte = offset;
            while byte < 4 && !data.is_empty() {
                let mask = 0xFFu32 << (8 * byte);
                word = (word & !mask) | ((data[0] as u32) << (8 * byte));
                data = &data[1..];
                addr = addr.wrapping_add(1);
                byte += 1;
            }
            self.sba_write_word(aligned, word)?;
        }
        Ok(())
    }

    /// Count the implemented triggers by selecting indices until tselect
    /// stops reading back or tdata1 reports no trigger.
    fn probe_triggers(&mut self) -> Result<usize, RiscvError> {
        if self.state.triggers_probed {
            return Ok(self.state.trigger_count);
        }
        self.state.triggers_probed = true;
        self.state.trigger_count = 0;
        self.state.triggers = [None; MAX_TRIGGERS];

        for index in 0..MAX_TRIGGERS as u32 {
            if self.write_csr(CSR_TSELECT, index).is_err() {
                break;
            }
            let Ok(selected) = self.read_csr(CSR_TSELECT) else {
                break;
            };
            if selected != index {
                break;
            }
            let Ok(tdata1) = self.read_csr(CSR_TDATA1) else {
                break;
            };
            if (tdata1 >> 28) & 0xF == 0 {
                break;
            }
            self.state.trigger_count = index as usize + 1;
        }

        tracing::debug!("{} hardware triggers", self.state.trigger_count);
        Ok(self.state.trigger_count)
    }

    fn install_trigger(&mut self, role: TriggerRole, addr: u32) -> Result<(), RiscvError> {
        self.require_active()?;
        let count = self.probe_triggers()?;
        if count == 0 {
            return Err(RiscvError::NoFreeTrigger);
        }

        for slot in self.state.triggers[..count].iter().flatten() {
            if slot.role == role && slot.addr == addr {
                return Ok(());
            }
        }

        let Some(index) = self.state.triggers[..count]
            .iter()
            .position(|slot| slot.is_none())
        else {
            return Err(RiscvError::NoFreeTrigger);
        };

        self.write_csr(CSR_TSELECT, index as u32)?;
        // Disarm before reprogramming the address.
        self.write_csr(CSR_TDATA1, 0)?;
        self.write_csr(CSR_TDATA2, addr)?;

        let mut mcontrol = Mcontrol::debug_trigger();
        match role {
            TriggerRole::Breakpoint => mcontrol.set_execute(true),
            TriggerRole::Watchpoint(WatchKind::Write) => mcontrol.set_store(true),
            TriggerRole::Watchpoint(WatchKind::Read) => mcontrol.set_load(true),
            TriggerRole::Watchpoint(WatchKind::Access) => {
                mcontrol.set_load(true);
                mcontrol.set_store(true);
            }
        }
        self.write_csr(CSR_TDATA1, mcontrol.into())?;

        self.state.triggers[index] = Some(TriggerSlot { addr, role });
        Ok(())
    }

    fn remove_trigger(&mut self, role: TriggerRole, addr: u32) -> Result<(), RiscvError> {
        self.require_active()?;
        let count = self.probe_triggers()?;

        for index in 0..count {
            let matches = self.state.triggers[index]
                .is_some_and(|slot| slot.role == role && slot.addr == addr);
            if matches {
                self.write_csr(CSR_TSELECT, index as u32)?;
                self.write_csr(CSR_TDATA1, 0)?;
                self.state.triggers[index] = None;
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn breakpoint_insert(&mut self, addr: u32) -> Result<(), RiscvError> {
        self.install_trigger(TriggerRole::Breakpoint, addr)
    }

    pub fn breakpoint_remove(&mut self, addr: u32) -> Result<(), RiscvError> {
        self.remove_trigger(TriggerRole::Breakpoint, addr)
    }

    pub fn watchpoints_supported(&mut self) -> Result<bool, RiscvError> {
        self.require_active()?;
        Ok(self.probe_triggers()? > 0)
    }

    pub fn watchpoint_insert(&mut self, kind: WatchKind, addr: u32) -> Result<(), RiscvError> {
        self.install_trigger(TriggerRole::Watchpoint(kind), addr)
    }

    pub fn watchpoint_remove(&mut self, kind: WatchKind, addr: u32) -> Result<(), RiscvError> {
        self.remove_trigger(TriggerRole::Watchpoint(kind), addr)
    }

    /// Find a watchpoint trigger with its HIT flag set, clearing the flag.
    pub fn watchpoint_hit(&mut self) -> Result<Option<(WatchKind, u32)>, RiscvError> {
        self.require_active()?;
        let count = self.probe_triggers()?;

        for index in 0..count {
            let Some(slot) = self.state.triggers[index] else {
                continue;
            };
            let TriggerRole::Watchpoint(kind) = slot.role else {
                continue;
            };

            if self.write_csr(CSR_TSELECT, index as u32).is_err() {
                continue;
            }
            let mut tdata1 = Mcontrol(self.read_csr(CSR_TDATA1)?);
            if tdata1.hit() {
                tdata1.set_hit(false);
                self.write_csr(CSR_TDATA1, tdata1.into())?;
                return Ok(Some((kind, slot.addr)));
            }
        }
        Ok(None)
    }

    /// Map dcsr.cause to the GDB stop signal: ebreak/trigger/step report
    /// SIGTRAP, an explicit halt request reports SIGSTOP.
    pub fn stop_signal(&mut self) -> u8 {
        const SIGTRAP: u8 = 5;
        const SIGSTOP: u8 = 17;

        let Ok(dcsr) = self.read_csr(CSR_DCSR) else {
            return SIGTRAP;
        };
        match Dcsr(dcsr).cause() {
            3 => SIGSTOP,
            _ => SIGTRAP,
        }
    }

    pub fn target_description(&self) -> &'static str {
        TARGET_XML_RV32
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessRegisterCommand, Mcontrol, REGNO_GPR_BASE};

    #[test]
    fn access_register_command_encoding() {
        let read_x5: u32 = AccessRegisterCommand::access(REGNO_GPR_BASE + 5, false).into();
        assert_eq!(read_x5, (2 << 20) | (1 << 17) | 0x1005);

        let write_dpc: u32 = AccessRegisterCommand::access(0x7B1, true).into();
        assert_eq!(write_dpc, (2 << 20) | (1 << 17) | (1 << 16) | 0x7B1);
    }

    #[test]
    fn mcontrol_breakpoint_encoding() {
        let mut mcontrol = Mcontrol::debug_trigger();
        mcontrol.set_execute(true);
        let raw: u32 = mcontrol.into();
        assert_eq!(
            raw,
            (2 << 28) | (1 << 27) | (1 << 12) | (1 << 6) | (1 << 3) | (1 << 2)
        );
    }
}
