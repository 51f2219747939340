//! Shared test support: wire-level target simulators, a loopback host link
//! and RSP client helpers.

#![allow(dead_code)]

pub mod jtag_sim;
pub mod swd_sim;

use std::collections::VecDeque;

use tinydap::{HostLink, ProbeIo, Session};

use self::jtag_sim::JtagTarget;
use self::swd_sim::SwdTarget;

/// Simulated probe I/O: optional SWD and JTAG targets behind the pins,
/// plus a synthetic microsecond clock.
pub struct SimIo {
    pub swd: Option<SwdTarget>,
    pub jtag: Option<JtagTarget>,
    pub nreset: bool,
    time: u32,
}

impl SimIo {
    /// A Cortex-M target on the SWD pins, nothing on JTAG.
    pub fn cortex(dpidr: u32, cpuid: u32) -> Self {
        Self {
            swd: Some(SwdTarget::new(dpidr, cpuid)),
            jtag: None,
            nreset: true,
            time: 0,
        }
    }

    /// A RISC-V target on the JTAG pins, nothing answering on SWD.
    pub fn riscv(idcode: u32) -> Self {
        Self {
            swd: None,
            jtag: Some(JtagTarget::new(idcode)),
            nreset: true,
            time: 0,
        }
    }

    pub fn swd(&mut self) -> &mut SwdTarget {
        self.swd.as_mut().expect("no SWD target configured")
    }

    pub fn jtag(&mut self) -> &mut JtagTarget {
        self.jtag.as_mut().expect("no JTAG target configured")
    }
}

impl ProbeIo for SimIo {
    fn swclk_write(&mut self, high: bool) {
        if let Some(swd) = &mut self.swd {
            swd.swclk_write(high);
        }
    }

    fn swdio_write(&mut self, high: bool) {
        if let Some(swd) = &mut self.swd {
            swd.swdio_write(high);
        }
    }

    fn swdio_read(&mut self) -> bool {
        match &mut self.swd {
            Some(swd) => swd.swdio_read(),
            // Pulled up, nothing drives the line.
            None => true,
        }
    }

    fn swdio_dir_out(&mut self) {
        if let Some(swd) = &mut self.swd {
            swd.swdio_dir_out();
        }
    }

    fn swdio_dir_in(&mut self) {
        if let Some(swd) = &mut self.swd {
            swd.swdio_dir_in();
        }
    }

    fn nreset_write(&mut self, high: bool) {
        self.nreset = high;
    }

    fn tck_write(&mut self, high: bool) {
        if let Some(jtag) = &mut self.jtag {
            jtag.tck_write(high);
        }
    }

    fn tms_write(&mut self, high: bool) {
        if let Some(jtag) = &mut self.jtag {
            jtag.tms_write(high);
        }
    }

    fn tdi_write(&mut self, high: bool) {
        if let Some(jtag) = &mut self.jtag {
            jtag.tdi_write(high);
        }
    }

    fn tdo_read(&mut self) -> bool {
        match &self.jtag {
            Some(jtag) => jtag.tdo_read(),
            None => false,
        }
    }

    fn time_us(&mut self) -> u32 {
        self.time = self.time.wrapping_add(7);
        self.time
    }

    fn delay_us(&mut self, us: u32) {
        self.time = self.time.wrapping_add(us);
    }
}

/// Loopback host link: tests push request bytes, the probe's replies
/// accumulate in `tx`.
#[derive(Debug, Default)]
pub struct SimHost {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Frame and queue one RSP packet.
    pub fn push_packet(&mut self, payload: &[u8]) {
        self.rx.push_back(b'$');
        self.rx.extend(payload);
        self.rx.push_back(b'#');
        let sum = checksum(payload);
        self.rx.extend(format!("{sum:02x}").bytes());
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl HostLink for SimHost {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx.push(byte);
    }
}

pub type SimSession = Session<SimIo, SimHost>;

pub fn checksum(payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Everything the probe produced, split into acknowledgements and verified
/// packet payloads.
#[derive(Debug, PartialEq, Eq)]
pub struct Replies {
    pub acks: Vec<u8>,
    pub packets: Vec<String>,
}

pub fn parse_replies(raw: &[u8]) -> Replies {
    let mut acks = Vec::new();
    let mut packets = Vec::new();
    let mut index = 0;

    while index < raw.len() {
        match raw[index] {
            b'+' | b'-' => {
                acks.push(raw[index]);
                index += 1;
            }
            b'$' => {
                let hash = raw[index..]
                    .iter()
                    .position(|&byte| byte == b'#')
                    .expect("unterminated packet")
                    + index;
                let payload = &raw[index + 1..hash];
                let sum_text =
                    std::str::from_utf8(&raw[hash + 1..hash + 3]).expect("bad checksum bytes");
                let sum = u8::from_str_radix(sum_text, 16).expect("bad checksum hex");
                assert_eq!(sum, checksum(payload), "reply checksum mismatch");
                packets.push(String::from_utf8(payload.to_vec()).expect("non-utf8 payload"));
                index = hash + 3;
            }
            other => panic!("unexpected byte {other:#04x} on the host link"),
        }
    }

    Replies { acks, packets }
}

/// Send one command and return the single reply payload.
pub fn exchange(session: &mut SimSession, payload: &[u8]) -> String {
    session.host_mut().push_packet(payload);
    session.poll();
    let raw = session.host_mut().take_tx();
    let replies = parse_replies(&raw);
    assert_eq!(replies.acks, vec![b'+'], "command was not acknowledged");
    assert_eq!(
        replies.packets.len(),
        1,
        "expected exactly one reply, got {replies:?}"
    );
    replies.packets.into_iter().next().unwrap()
}

/// Send one command that produces no immediate reply (`c`).
pub fn exchange_no_reply(session: &mut SimSession, payload: &[u8]) {
    session.host_mut().push_packet(payload);
    session.poll();
    let raw = session.host_mut().take_tx();
    let replies = parse_replies(&raw);
    assert_eq!(replies.acks, vec![b'+']);
    assert!(
        replies.packets.is_empty(),
        "unexpected reply: {replies:?}"
    );
}
