//! Probe orchestration: boot sequence and the cooperative main loop.
//!
//! A [`Session`] owns the wire I/O, the host link, the target facade and
//! the RSP engine. Firmware calls [`Session::attach`] once at boot and then
//! [`Session::poll`] forever; everything else happens inside.

use crate::gdb_server::GdbServer;
use crate::probe::jtag::JtagPhy;
use crate::probe::swd::SwdPhy;
use crate::probe::{HostLink, ProbeIo};
use crate::target::{Architecture, Target, TargetError};

/// Session configuration knobs.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Quarter-period delay for both bit-banged wires, in microseconds.
    /// 0 clocks as fast as the GPIO allows.
    pub wire_delay_us: u32,
    /// Whether attach may fall back to RISC-V over JTAG when no Cortex-M
    /// core is found.
    pub riscv_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wire_delay_us: 0,
            riscv_fallback: true,
        }
    }
}

/// The complete probe: all process-wide state lives here, owned by the
/// main loop.
pub struct Session<IO: ProbeIo, H: HostLink> {
    io: IO,
    host: H,
    target: Target,
    gdb: GdbServer,
}

impl<IO: ProbeIo, H: HostLink> Session<IO, H> {
    pub fn new(io: IO, host: H) -> Self {
        Self::with_config(io, host, SessionConfig::default())
    }

    pub fn with_config(io: IO, host: H, config: SessionConfig) -> Self {
        let mut target = Target::new(
            SwdPhy::new(config.wire_delay_us),
            JtagPhy::new(config.wire_delay_us),
        );
        target.riscv_fallback = config.riscv_fallback;

        Self {
            io,
            host,
            target,
            gdb: GdbServer::new(),
        }
    }

    /// Boot sequence: reset the RSP state, pulse nRESET, bring up the
    /// debug link, halt the target and probe its breakpoint resources.
    ///
    /// A failed attach is not fatal: the session keeps serving RSP and
    /// answers commands with errors until the host retries via
    /// `monitor reset`.
    pub fn attach(&mut self) -> Result<Architecture, TargetError> {
        self.gdb.reset();

        self.io.nreset_write(false);
        self.io.delay_us(1_000);
        self.io.nreset_write(true);
        self.io.delay_us(1_000);

        let arch = self.target.attach(&mut self.io)?;
        tracing::info!("attached to {arch:?} target");

        self.target.halt(&mut self.io)?;
        self.target.init_break_support(&mut self.io)?;
        Ok(arch)
    }

    /// One main-loop iteration: pump all pending host bytes through the
    /// RSP framer, then surface asynchronous stop events.
    pub fn poll(&mut self) {
        loop {
            let Some(byte) = self.host.read_byte() else {
                break;
            };
            self.gdb
                .process_byte(byte, &mut self.target, &mut self.io, &mut self.host);
        }
        self.gdb.poll(&mut self.target, &mut self.io, &mut self.host);
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut Target {
        &mut self.target
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}
