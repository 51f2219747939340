//! Bit-banged SWD wire layer.
//!
//! Implements the ADIv5 serial wire line protocol: an 8-bit request header,
//! a turnaround cycle, a 3-bit ACK and a 32-bit data phase with even parity.
//! All multi-bit fields are shifted LSB-first. SWDIO is set up before the
//! rising SWCLK edge when the probe drives, and sampled on the rising edge
//! when the target drives.
//!
//! This layer does not retry: WAIT and FAULT are reported to the caller,
//! which owns the DP ABORT recovery policy.

use crate::probe::{parity_u32, PortType, ProbeIo, TransferDirection};

/// ACK values defined by ADIv5.
const ACK_OK: u8 = 0b001;
const ACK_WAIT: u8 = 0b010;
const ACK_FAULT: u8 = 0b100;

/// Wire-level transfer outcome other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DapError {
    /// Target responded with WAIT; the transaction may be retried.
    #[error("target is not ready yet (WAIT response)")]
    WaitResponse,
    /// Target responded with FAULT; sticky error bits must be cleared
    /// through DP ABORT before further AP access.
    #[error("target returned a FAULT response")]
    FaultResponse,
    /// The ACK field was neither OK, WAIT nor FAULT. Usually means the
    /// target is absent or the line is out of sync.
    #[error("invalid ACK on the wire")]
    NoAcknowledge,
    /// Read data failed the even-parity check.
    #[error("incorrect parity on read data")]
    IncorrectParity,
}

/// Bit-banged SWD PHY.
///
/// `delay_us` is the quarter-period delay inserted around each clock edge;
/// 0 runs the wire as fast as the GPIO allows.
#[derive(Debug, Clone, Copy)]
pub struct SwdPhy {
    pub delay_us: u32,
}

impl Default for SwdPhy {
    fn default() -> Self {
        Self { delay_us: 0 }
    }
}

impl SwdPhy {
    pub fn new(delay_us: u32) -> Self {
        Self { delay_us }
    }

    fn delay(&self, io: &mut dyn ProbeIo) {
        if self.delay_us != 0 {
            io.delay_us(self.delay_us);
        }
    }

    /// One full clock cycle, SWDIO unchanged.
    fn clock_cycle(&self, io: &mut dyn ProbeIo) {
        io.swclk_write(false);
        self.delay(io);
        io.swclk_write(true);
        self.delay(io);
    }

    /// Drive one bit onto SWDIO. The target samples on the rising edge.
    fn write_bit(&self, io: &mut dyn ProbeIo, bit: bool) {
        io.swdio_write(bit);
        self.clock_cycle(io);
    }

    /// Sample one bit from SWDIO on the rising edge.
    fn read_bit(&self, io: &mut dyn ProbeIo) -> bool {
        io.swclk_write(false);
        self.delay(io);
        io.swclk_write(true);
        let bit = io.swdio_read();
        self.delay(io);
        bit
    }

    /// Turnaround cycle handing the line to the target.
    fn turnaround_to_read(&self, io: &mut dyn ProbeIo) {
        io.swdio_dir_in();
        self.clock_cycle(io);
    }

    /// Turnaround cycle taking the line back from the target.
    fn turnaround_to_write(&self, io: &mut dyn ProbeIo) {
        self.clock_cycle(io);
        io.swdio_dir_out();
    }

    /// One idle cycle with the probe driving the line high, leaving the bus
    /// in a safe state for the next request header.
    fn idle_cycle(&self, io: &mut dyn ProbeIo) {
        io.swdio_write(true);
        self.clock_cycle(io);
    }

    /// Line reset: at least 50 clocks with SWDIO held high.
    pub fn line_reset(&self, io: &mut dyn ProbeIo) {
        io.swdio_dir_out();
        io.swdio_write(true);
        for _ in 0..60 {
            self.clock_cycle(io);
        }
    }

    /// Switch a SWJ-DP from JTAG to SWD operation: line reset, the 16-bit
    /// 0xE79E selection sequence (LSB-first), another line reset and two
    /// idle cycles.
    pub fn jtag_to_swd(&self, io: &mut dyn ProbeIo) {
        self.line_reset(io);

        let sequence: u16 = 0xE79E;
        for i in 0..16 {
            self.write_bit(io, (sequence >> i) & 1 != 0);
        }

        self.line_reset(io);

        self.idle_cycle(io);
        self.idle_cycle(io);

        tracing::debug!("sent JTAG-to-SWD switch sequence");
    }

    fn read_ack(&self, io: &mut dyn ProbeIo) -> u8 {
        let mut ack = 0;
        for i in 0..3 {
            ack |= (self.read_bit(io) as u8) << i;
        }
        ack
    }

    fn read_word(&self, io: &mut dyn ProbeIo) -> Result<u32, DapError> {
        let mut value = 0;
        for i in 0..32 {
            value |= (self.read_bit(io) as u32) << i;
        }
        let parity = self.read_bit(io);

        // Take the line back and leave one idle cycle before reporting the
        // outcome, so the bus is ready for the next header either way.
        self.turnaround_to_write(io);
        self.idle_cycle(io);

        if parity != parity_u32(value) {
            return Err(DapError::IncorrectParity);
        }
        Ok(value)
    }

    fn write_word(&self, io: &mut dyn ProbeIo, value: u32) {
        for i in 0..32 {
            self.write_bit(io, (value >> i) & 1 != 0);
        }
        self.write_bit(io, parity_u32(value));
        self.idle_cycle(io);
    }

    /// Perform one SWD transfer.
    ///
    /// `a23` is bits `[3:2]` of the register address. On a successful read
    /// the received word is returned; on a successful write the passed
    /// `value` has been shifted out. WAIT and FAULT abort the data phase,
    /// but the bus is always left idle with the probe driving.
    pub fn transfer(
        &self,
        io: &mut dyn ProbeIo,
        port: PortType,
        direction: TransferDirection,
        a23: u8,
        value: u32,
    ) -> Result<u32, DapError> {
        let ap = port == PortType::AccessPort;
        let rnw = direction == TransferDirection::Read;
        let a2 = a23 & 1 != 0;
        let a3 = a23 & 2 != 0;
        let parity = (ap as u8 + rnw as u8 + a2 as u8 + a3 as u8) % 2 != 0;

        // start, APnDP, RnW, A2, A3, parity, stop, park
        let request = [true, ap, rnw, a2, a3, parity, false, true];

        io.swdio_dir_out();
        for bit in request {
            self.write_bit(io, bit);
        }

        self.turnaround_to_read(io);
        let ack = self.read_ack(io);

        match ack {
            ACK_OK => {}
            other => {
                self.turnaround_to_write(io);
                self.idle_cycle(io);
                return Err(match other {
                    ACK_WAIT => DapError::WaitResponse,
                    ACK_FAULT => DapError::FaultResponse,
                    _ => DapError::NoAcknowledge,
                });
            }
        }

        if rnw {
            self.read_word(io)
        } else {
            self.turnaround_to_write(io);
            self.write_word(io, value);
            Ok(0)
        }
    }
}
