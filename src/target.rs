//! Unified target facade over the Cortex-M and RISC-V backends.
//!
//! Attach tries Cortex-M over SWD first and falls back to RISC-V over JTAG;
//! all later operations dispatch to the backend selected at attach time.
//! Capabilities a backend does not implement surface as
//! [`TargetError::Unsupported`], which the RSP layer answers with an empty
//! reply instead of an error.

use crate::architecture::arm::{ArmDebugInterface, ArmDebugState, ArmError};
use crate::architecture::riscv::{RiscvError, RiscvInterface, RiscvState};
use crate::probe::jtag::JtagPhy;
use crate::probe::swd::SwdPhy;
use crate::probe::ProbeIo;

/// Kind of data access a watchpoint matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Write,
    Read,
    Access,
}

/// The backend the facade selected at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    CortexM,
    Riscv,
}

/// Facade-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error(transparent)]
    Arm(#[from] ArmError),

    #[error(transparent)]
    Riscv(#[from] RiscvError),

    #[error("no target attached")]
    NotAttached,

    /// The selected backend does not implement this capability.
    #[error("operation not supported by this target")]
    Unsupported,
}

/// GDB stop signal numbers.
pub(crate) const SIGTRAP: u8 = 5;

/// The debug target: both backend states plus the arch selector. Owned by
/// the session for the lifetime of the probe.
#[derive(Debug)]
pub struct Target {
    arch: Option<Architecture>,
    arm: ArmDebugState,
    riscv: RiscvState,
    /// Whether attach may fall back to the RISC-V JTAG path.
    pub riscv_fallback: bool,
}

impl Target {
    pub fn new(swd: SwdPhy, jtag: JtagPhy) -> Self {
        Self {
            arch: None,
            arm: ArmDebugState::new(swd),
            riscv: RiscvState::new(jtag),
            riscv_fallback: true,
        }
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.arch
    }

    fn arm<'a>(&'a mut self, io: &'a mut dyn ProbeIo) -> ArmDebugInterface<'a> {
        ArmDebugInterface::new(io, &mut self.arm)
    }

    fn riscv<'a>(&'a mut self, io: &'a mut dyn ProbeIo) -> RiscvInterface<'a> {
        RiscvInterface::new(io, &mut self.riscv)
    }

    /// Select the active backend: bring up ADIv5 over SWD and look for a
    /// Cortex-M core; if that fails and the fallback is enabled, probe for
    /// a RISC-V debug module over JTAG.
    pub fn attach(&mut self, io: &mut dyn ProbeIo) -> Result<Architecture, TargetError> {
        self.arch = None;

        let mut swd_result = self.arm(io).init();
        if swd_result.is_ok() {
            swd_result = self.arm(io).attach_core().map(|_| ());
        }
        match swd_result {
            Ok(()) => {
                self.arch = Some(Architecture::CortexM);
                return Ok(Architecture::CortexM);
            }
            Err(error) => {
                tracing::debug!("no Cortex-M target over SWD: {error}");
            }
        }

        if self.riscv_fallback {
            match self.riscv(io).init() {
                Ok(()) => {
                    self.arch = Some(Architecture::Riscv);
                    return Ok(Architecture::Riscv);
                }
                Err(error) => {
                    tracing::debug!("no RISC-V target over JTAG: {error}");
                }
            }
        }

        Err(TargetError::NotAttached)
    }

    fn arch(&self) -> Result<Architecture, TargetError> {
        self.arch.ok_or(TargetError::NotAttached)
    }

    /// Probe and enable the breakpoint/watchpoint resources of the active
    /// backend, so slot counts are known before the first GDB request.
    pub fn init_break_support(&mut self, io: &mut dyn ProbeIo) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => {
                let mut arm = self.arm(io);
                arm.breakpoints_init()?;
                arm.watchpoints_init()?;
            }
            Architecture::Riscv => {
                let mut riscv = self.riscv(io);
                let _ = riscv.watchpoints_supported()?;
            }
        }
        Ok(())
    }

    pub fn halt(&mut self, io: &mut dyn ProbeIo) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).halt_core().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).halt_core().map_err(Into::into),
        }
    }

    pub fn resume(&mut self, io: &mut dyn ProbeIo) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).run_core().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).resume_core().map_err(Into::into),
        }
    }

    pub fn step(&mut self, io: &mut dyn ProbeIo) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).step_core().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).step_core().map_err(Into::into),
        }
    }

    pub fn is_halted(&mut self, io: &mut dyn ProbeIo) -> Result<bool, TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).core_halted().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).core_halted().map_err(Into::into),
        }
    }

    /// Number of registers in the GDB `g` block: r0..r15 + xPSR on
    /// Cortex-M, x0..x31 + pc on RV32.
    pub fn gdb_reg_count(&self) -> Result<usize, TargetError> {
        match self.arch()? {
            Architecture::CortexM => Ok(17),
            Architecture::Riscv => Ok(crate::architecture::riscv::GDB_REG_COUNT),
        }
    }

    /// GDB register number of the program counter.
    pub fn pc_regnum(&self) -> Result<u32, TargetError> {
        match self.arch()? {
            Architecture::CortexM => Ok(15),
            Architecture::Riscv => Ok(32),
        }
    }

    pub fn read_reg(&mut self, io: &mut dyn ProbeIo, regnum: u32) -> Result<u32, TargetError> {
        match self.arch()? {
            Architecture::CortexM => {
                if regnum > 16 {
                    return Err(TargetError::Unsupported);
                }
                self.arm(io).read_core_reg(regnum as u8).map_err(Into::into)
            }
            Architecture::Riscv => match self.riscv(io).read_core_reg(regnum) {
                Err(RiscvError::UnsupportedRegister(_)) => Err(TargetError::Unsupported),
                result => result.map_err(Into::into),
            },
        }
    }

    pub fn write_reg(
        &mut self,
        io: &mut dyn ProbeIo,
        regnum: u32,
        value: u32,
    ) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => {
                if regnum > 16 {
                    return Err(TargetError::Unsupported);
                }
                self.arm(io)
                    .write_core_reg(regnum as u8, value)
                    .map_err(Into::into)
            }
            Architecture::Riscv => match self.riscv(io).write_core_reg(regnum, value) {
                Err(RiscvError::UnsupportedRegister(_)) => Err(TargetError::Unsupported),
                result => result.map_err(Into::into),
            },
        }
    }

    /// Read the full GDB register block into `regs`; returns the register
    /// count.
    pub fn read_gdb_regs(
        &mut self,
        io: &mut dyn ProbeIo,
        regs: &mut [u32; 33],
    ) -> Result<usize, TargetError> {
        match self.arch()? {
            Architecture::CortexM => {
                let mut block = [0u32; 17];
                self.arm(io).read_gdb_regs(&mut block)?;
                regs[..17].copy_from_slice(&block);
                Ok(17)
            }
            Architecture::Riscv => {
                self.riscv(io).read_gdb_regs(regs)?;
                Ok(33)
            }
        }
    }

    /// Write the full GDB register block.
    pub fn write_gdb_regs(
        &mut self,
        io: &mut dyn ProbeIo,
        regs: &[u32],
    ) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => {
                let block: &[u32; 17] = regs
                    .get(..17)
                    .and_then(|block| block.try_into().ok())
                    .ok_or(TargetError::Unsupported)?;
                self.arm(io).write_gdb_regs(block).map_err(Into::into)
            }
            Architecture::Riscv => {
                let block: &[u32; 33] = regs
                    .get(..33)
                    .and_then(|block| block.try_into().ok())
                    .ok_or(TargetError::Unsupported)?;
                self.riscv(io).write_gdb_regs(block).map_err(Into::into)
            }
        }
    }

    pub fn read_mem(
        &mut self,
        io: &mut dyn ProbeIo,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).read_8(addr, buf).map_err(Into::into),
            Architecture::Riscv => self.riscv(io).read_mem(addr, buf).map_err(Into::into),
        }
    }

    pub fn write_mem(
        &mut self,
        io: &mut dyn ProbeIo,
        addr: u32,
        data: &[u8],
    ) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).write_8(addr, data).map_err(Into::into),
            Architecture::Riscv => self.riscv(io).write_mem(addr, data).map_err(Into::into),
        }
    }

    pub fn breakpoint_insert(&mut self, io: &mut dyn ProbeIo, addr: u32) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).breakpoint_insert(addr).map_err(Into::into),
            Architecture::Riscv => self.riscv(io).breakpoint_insert(addr).map_err(Into::into),
        }
    }

    pub fn breakpoint_remove(&mut self, io: &mut dyn ProbeIo, addr: u32) -> Result<(), TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).breakpoint_remove(addr).map_err(Into::into),
            Architecture::Riscv => self.riscv(io).breakpoint_remove(addr).map_err(Into::into),
        }
    }

    pub fn watchpoints_supported(&mut self, io: &mut dyn ProbeIo) -> Result<bool, TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).watchpoints_supported().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).watchpoints_supported().map_err(Into::into),
        }
    }

    pub fn watchpoint_insert(
        &mut self,
        io: &mut dyn ProbeIo,
        kind: WatchKind,
        addr: u32,
        len: u32,
    ) -> Result<(), TargetError> {
        if !self.watchpoints_supported(io)? {
            return Err(TargetError::Unsupported);
        }
        match self.arch()? {
            Architecture::CortexM => self
                .arm(io)
                .watchpoint_insert(kind, addr, len)
                .map_err(Into::into),
            // The trigger module matches a single address; the length is
            // accepted and ignored.
            Architecture::Riscv => self
                .riscv(io)
                .watchpoint_insert(kind, addr)
                .map_err(Into::into),
        }
    }

    pub fn watchpoint_remove(
        &mut self,
        io: &mut dyn ProbeIo,
        kind: WatchKind,
        addr: u32,
        len: u32,
    ) -> Result<(), TargetError> {
        if !self.watchpoints_supported(io)? {
            return Err(TargetError::Unsupported);
        }
        match self.arch()? {
            Architecture::CortexM => self
                .arm(io)
                .watchpoint_remove(kind, addr, len)
                .map_err(Into::into),
            Architecture::Riscv => self
                .riscv(io)
                .watchpoint_remove(kind, addr)
                .map_err(Into::into),
        }
    }

    /// Which watchpoint caused the last halt, if any.
    pub fn watchpoint_hit(
        &mut self,
        io: &mut dyn ProbeIo,
    ) -> Result<Option<(WatchKind, u32)>, TargetError> {
        match self.arch()? {
            Architecture::CortexM => self.arm(io).watchpoint_hit().map_err(Into::into),
            Architecture::Riscv => self.riscv(io).watchpoint_hit().map_err(Into::into),
        }
    }

    /// GDB signal number describing the last stop.
    pub fn stop_signal(&mut self, io: &mut dyn ProbeIo) -> u8 {
        match self.arch {
            Some(Architecture::CortexM) | None => SIGTRAP,
            Some(Architecture::Riscv) => self.riscv(io).stop_signal(),
        }
    }

    /// The GDB target description XML for the active backend.
    pub fn target_description(&mut self, io: &mut dyn ProbeIo) -> Result<&'static str, TargetError> {
        match self.arch()? {
            Architecture::CortexM => Ok(self.arm(io).target_description()),
            Architecture::Riscv => Ok(self.riscv(io).target_description()),
        }
    }
}
