//! An on-target debug probe core.
//!
//! `tinydap` is the board-independent heart of a small debug probe
//! firmware: it speaks the GDB Remote Serial Protocol on one side and
//! drives a target microcontroller's debug interface on the other, over
//! bit-banged SWD (ARM ADIv5, Cortex-M) or bit-banged JTAG (RISC-V debug
//! 0.13).
//!
//! The crate contains no board code. A port supplies the pin, clock and
//! host-link primitives by implementing [`ProbeIo`] and [`HostLink`], then
//! runs:
//!
//! ```no_run
//! # struct Board;
//! # impl tinydap::ProbeIo for Board {
//! #     fn swclk_write(&mut self, _: bool) {}
//! #     fn swdio_write(&mut self, _: bool) {}
//! #     fn swdio_read(&mut self) -> bool { true }
//! #     fn swdio_dir_out(&mut self) {}
//! #     fn swdio_dir_in(&mut self) {}
//! #     fn nreset_write(&mut self, _: bool) {}
//! #     fn time_us(&mut self) -> u32 { 0 }
//! #     fn delay_us(&mut self, _: u32) {}
//! # }
//! # struct Uart;
//! # impl tinydap::HostLink for Uart {
//! #     fn read_byte(&mut self) -> Option<u8> { None }
//! #     fn write_byte(&mut self, _: u8) {}
//! # }
//! let mut session = tinydap::Session::new(Board, Uart);
//! let _ = session.attach();
//! loop {
//!     session.poll();
//! }
//! ```
//!
//! All waits on the target are bounded, no operation blocks indefinitely,
//! and every failure is recoverable from the host side: the probe never
//! resets itself on a protocol error.

pub mod architecture;
pub mod gdb_server;
pub mod probe;
pub mod session;
pub mod target;

pub use architecture::arm::{ArmError, CortexMProfile};
pub use architecture::riscv::RiscvError;
pub use gdb_server::GdbServer;
pub use probe::swd::DapError;
pub use probe::{HostLink, ProbeIo};
pub use session::{Session, SessionConfig};
pub use target::{Architecture, Target, TargetError, WatchKind};
