//! GDB Remote Serial Protocol engine.
//!
//! A byte-wise framer accumulates `$<payload>#<checksum>` packets from the
//! host link, acknowledges them with `+`/`-` and dispatches well-formed
//! payloads to the command handlers. Replies stream back through the same
//! link with a running mod-256 checksum, so no reply buffer is needed.
//!
//! Ctrl-C (0x03) is handled out of band: it halts the target and produces
//! an immediate stop reply. After a `c`/`s` resume, [`GdbServer::poll`]
//! watches for the halt and emits the asynchronous stop reply, including
//! the `watch`/`rwatch`/`awatch` annotation when a watchpoint fired.

use crate::probe::{HostLink, ProbeIo};
use crate::target::{Target, TargetError, WatchKind};

/// Maximum RSP payload, advertised to the host in `qSupported`. The hex
/// advertisement must match this buffer size exactly.
const MAX_PACKET_SIZE: usize = 512;
const PACKET_SIZE_HEX: &str = "200";

/// Upper bound on the data bytes of one `m`/`M` transfer; a reply encodes
/// two hex characters per byte.
const MAX_MEM_CHUNK: usize = MAX_PACKET_SIZE / 2;

/// Framer states of the incoming byte machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Idle,
    Payload,
    ChecksumHi,
    ChecksumLo,
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn nibble_hex(nibble: u8) -> u8 {
    match nibble & 0xF {
        n @ 0..=9 => b'0' + n,
        n => b'a' + n - 10,
    }
}

/// Parse a non-empty, all-hex big-endian number.
fn parse_u32_hex(text: &[u8]) -> Option<u32> {
    if text.is_empty() || text.len() > 8 {
        return None;
    }
    let mut value = 0u32;
    for &byte in text {
        value = (value << 4) | hex_nibble(byte)? as u32;
    }
    Some(value)
}

/// Parse exactly eight hex characters as a little-endian u32, the encoding
/// registers use in `P` and `p` payloads.
fn parse_u32_le_hex(text: &[u8]) -> Option<u32> {
    let bytes = parse_hex_bytes(text)?;
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn parse_hex_bytes(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.chunks_exact(2)
        .map(|pair| Some((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?))
        .collect()
}

fn split_once(text: &[u8], separator: u8) -> Option<(&[u8], &[u8])> {
    let index = text.iter().position(|&byte| byte == separator)?;
    Some((&text[..index], &text[index + 1..]))
}

/// Streaming writer for one outgoing packet: emits `$`, accumulates the
/// checksum over the payload bytes and closes with `#` and two hex digits.
struct PacketWriter<'a> {
    host: &'a mut dyn HostLink,
    sum: u8,
}

impl<'a> PacketWriter<'a> {
    fn new(host: &'a mut dyn HostLink) -> Self {
        host.write_byte(b'$');
        Self { host, sum: 0 }
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.sum = self.sum.wrapping_add(byte);
            self.host.write_byte(byte);
        }
    }

    fn write_hex_u8(&mut self, value: u8) {
        self.write(&[nibble_hex(value >> 4), nibble_hex(value)]);
    }

    /// A 32-bit value as eight hex characters, least significant byte
    /// first, as the `g`/`p` register encodings require.
    fn write_hex_u32_le(&mut self, value: u32) {
        for byte in value.to_le_bytes() {
            self.write_hex_u8(byte);
        }
    }

    fn finish(self) {
        self.host.write_byte(b'#');
        self.host.write_byte(nibble_hex(self.sum >> 4));
        self.host.write_byte(nibble_hex(self.sum));
    }
}

fn send_packet(host: &mut dyn HostLink, payload: &[u8]) {
    let mut writer = PacketWriter::new(host);
    writer.write(payload);
    writer.finish();
}

fn send_ok(host: &mut dyn HostLink) {
    send_packet(host, b"OK");
}

fn send_error(host: &mut dyn HostLink) {
    send_packet(host, b"E01");
}

fn send_empty(host: &mut dyn HostLink) {
    send_packet(host, b"");
}

/// Reply with `OK` on success, an empty packet for unsupported
/// capabilities and `E01` for failures, per the GDB conventions.
fn send_result(host: &mut dyn HostLink, result: Result<(), TargetError>) {
    match result {
        Ok(()) => send_ok(host),
        Err(TargetError::Unsupported) => send_empty(host),
        Err(_) => send_error(host),
    }
}

/// RSP engine state: the framer, its payload buffer and the running flag
/// set between a resume and the next observed halt.
#[derive(Debug)]
pub struct GdbServer {
    state: FramerState,
    payload: Vec<u8>,
    sum: u8,
    rx_checksum: u8,
    running: bool,
}

impl GdbServer {
    pub fn new() -> Self {
        Self {
            state: FramerState::Idle,
            payload: Vec::with_capacity(MAX_PACKET_SIZE),
            sum: 0,
            rx_checksum: 0,
            running: false,
        }
    }

    /// Reset the framer and the running flag, as on link bring-up.
    pub fn reset(&mut self) {
        self.state = FramerState::Idle;
        self.payload.clear();
        self.sum = 0;
        self.rx_checksum = 0;
        self.running = false;
    }

    /// Whether a resume is outstanding and the poll phase should watch for
    /// a halt.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Feed one byte from the host into the framer.
    pub fn process_byte(
        &mut self,
        byte: u8,
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        // Ctrl-C preempts whatever the framer was doing.
        if byte == 0x03 {
            tracing::debug!("host interrupt");
            self.running = false;
            let _ = target.halt(io);
            self.send_stop_reply(target, io, host);
            self.state = FramerState::Idle;
            self.payload.clear();
            return;
        }

        match self.state {
            FramerState::Idle => {
                if byte == b'$' {
                    self.state = FramerState::Payload;
                    self.payload.clear();
                    self.sum = 0;
                }
            }
            FramerState::Payload => {
                if byte == b'#' {
                    self.state = FramerState::ChecksumHi;
                } else if self.payload.len() < MAX_PACKET_SIZE {
                    self.payload.push(byte);
                    self.sum = self.sum.wrapping_add(byte);
                } else {
                    tracing::warn!("oversized packet dropped");
                    self.state = FramerState::Idle;
                    self.payload.clear();
                }
            }
            FramerState::ChecksumHi => match hex_nibble(byte) {
                Some(nibble) => {
                    self.rx_checksum = nibble << 4;
                    self.state = FramerState::ChecksumLo;
                }
                None => self.state = FramerState::Idle,
            },
            FramerState::ChecksumLo => {
                if let Some(nibble) = hex_nibble(byte) {
                    self.rx_checksum |= nibble;
                    if self.rx_checksum == self.sum {
                        host.write_byte(b'+');
                        self.handle_packet(target, io, host);
                    } else {
                        tracing::warn!(
                            "checksum mismatch: got {:#04x}, computed {:#04x}",
                            self.rx_checksum,
                            self.sum
                        );
                        host.write_byte(b'-');
                    }
                }
                self.state = FramerState::Idle;
                self.payload.clear();
            }
        }
    }

    /// Surface a pending asynchronous stop: called once per main-loop
    /// iteration after the input bytes have been pumped.
    pub fn poll(&mut self, target: &mut Target, io: &mut dyn ProbeIo, host: &mut dyn HostLink) {
        if !self.running {
            return;
        }
        match target.is_halted(io) {
            Ok(true) => {
                self.running = false;
                self.send_stop_reply(target, io, host);
            }
            Ok(false) | Err(_) => {}
        }
    }

    /// `T05watch:<addr>;` style reply when a watchpoint fired, `S<signal>`
    /// otherwise.
    fn send_stop_reply(&mut self, target: &mut Target, io: &mut dyn ProbeIo, host: &mut dyn HostLink) {
        if let Ok(Some((kind, addr))) = target.watchpoint_hit(io) {
            let tag: &[u8] = match kind {
                WatchKind::Write => b"watch",
                WatchKind::Read => b"rwatch",
                WatchKind::Access => b"awatch",
            };
            let mut writer = PacketWriter::new(host);
            writer.write(b"T05");
            writer.write(tag);
            writer.write(b":");
            for shift in (0..8).rev() {
                writer.write(&[nibble_hex((addr >> (4 * shift)) as u8)]);
            }
            writer.write(b";");
            writer.finish();
            return;
        }

        let signal = target.stop_signal(io);
        let mut writer = PacketWriter::new(host);
        writer.write(b"S");
        writer.write_hex_u8(signal);
        writer.finish();
    }

    fn handle_packet(&mut self, target: &mut Target, io: &mut dyn ProbeIo, host: &mut dyn HostLink) {
        let payload = core::mem::take(&mut self.payload);
        tracing::debug!("packet: {}", String::from_utf8_lossy(&payload));

        match payload.split_first() {
            Some((b'?', [])) => self.send_stop_reply(target, io, host),
            Some((b'g', [])) => handle_read_registers(target, io, host),
            Some((b'G', rest)) => handle_write_registers(rest, target, io, host),
            Some((b'm', rest)) => handle_read_memory(rest, target, io, host),
            Some((b'M', rest)) => handle_write_memory(rest, target, io, host),
            Some((b'p', rest)) => handle_read_register(rest, target, io, host),
            Some((b'P', rest)) => handle_write_register(rest, target, io, host),
            Some((b'c', rest)) => self.handle_continue(rest, target, io, host),
            Some((b's', rest)) => self.handle_step(rest, target, io, host),
            Some((b'Z', rest)) => handle_breakpoint(true, rest, target, io, host),
            Some((b'z', rest)) => handle_breakpoint(false, rest, target, io, host),
            Some((b'q', _)) => self.handle_query(&payload, target, io, host),
            Some((b'v', _)) => self.handle_v_packet(&payload, target, io, host),
            Some((b'D', _)) | Some((b'k', _)) => {
                // Detach/kill: let the target run and drop the session
                // state; the host may reconnect at any time.
                self.running = false;
                let _ = target.resume(io);
                send_ok(host);
            }
            _ => send_empty(host),
        }

        self.payload = payload;
    }

    /// `c [addr]`: optionally redirect the PC, then resume. No reply until
    /// the next stop event.
    fn handle_continue(
        &mut self,
        args: &[u8],
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        if !args.is_empty() {
            let (Some(addr), Ok(pc)) = (parse_u32_hex(args), target.pc_regnum()) else {
                send_error(host);
                return;
            };
            if target.write_reg(io, pc, addr).is_err() {
                send_error(host);
                return;
            }
        }

        match target.resume(io) {
            Ok(()) => self.running = true,
            Err(_) => send_error(host),
        }
    }

    /// `s [addr]`: single instruction step with an immediate stop reply.
    fn handle_step(
        &mut self,
        args: &[u8],
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        if !args.is_empty() {
            let (Some(addr), Ok(pc)) = (parse_u32_hex(args), target.pc_regnum()) else {
                send_error(host);
                return;
            };
            if target.write_reg(io, pc, addr).is_err() {
                send_error(host);
                return;
            }
        }

        match target.step(io) {
            Ok(()) => self.send_stop_reply(target, io, host),
            Err(_) => send_error(host),
        }
    }

    /// `vCont` subset: advertise and accept plain continue/step actions.
    fn handle_v_packet(
        &mut self,
        payload: &[u8],
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        if payload == b"vCont?" {
            send_packet(host, b"vCont;c;s");
            return;
        }

        if let Some(actions) = payload.strip_prefix(b"vCont;") {
            // Only the first action matters for a single-thread target;
            // thread suffixes are ignored.
            match actions.first() {
                Some(b'c') => self.handle_continue(b"", target, io, host),
                Some(b's') => self.handle_step(b"", target, io, host),
                _ => send_empty(host),
            }
            return;
        }

        send_empty(host);
    }
}

impl Default for GdbServer {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_read_registers(target: &mut Target, io: &mut dyn ProbeIo, host: &mut dyn HostLink) {
    if target.halt(io).is_err() {
        send_error(host);
        return;
    }

    let mut regs = [0u32; 33];
    match target.read_gdb_regs(io, &mut regs) {
        Ok(count) => {
            let mut writer = PacketWriter::new(host);
            for value in &regs[..count] {
                writer.write_hex_u32_le(*value);
            }
            writer.finish();
        }
        Err(_) => send_error(host),
    }
}

fn handle_write_registers(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Ok(count) = target.gdb_reg_count() else {
        send_error(host);
        return;
    };
    if args.len() != count * 8 {
        send_error(host);
        return;
    }
    if target.halt(io).is_err() {
        send_error(host);
        return;
    }

    let mut regs = [0u32; 33];
    for (index, chunk) in args.chunks_exact(8).enumerate() {
        match parse_u32_le_hex(chunk) {
            Some(value) => regs[index] = value,
            None => {
                send_error(host);
                return;
            }
        }
    }

    send_result(host, target.write_gdb_regs(io, &regs[..count]));
}

fn handle_read_memory(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some((addr, len)) = split_once(args, b',') else {
        send_error(host);
        return;
    };
    let (Some(addr), Some(len)) = (parse_u32_hex(addr), parse_u32_hex(len)) else {
        send_error(host);
        return;
    };

    if len as usize > MAX_MEM_CHUNK {
        send_error(host);
        return;
    }

    let mut buf = vec![0u8; len as usize];
    match target.read_mem(io, addr, &mut buf) {
        Ok(()) => {
            let mut writer = PacketWriter::new(host);
            for byte in &buf {
                writer.write_hex_u8(*byte);
            }
            writer.finish();
        }
        Err(_) => send_error(host),
    }
}

fn handle_write_memory(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some((addr, rest)) = split_once(args, b',') else {
        send_error(host);
        return;
    };
    let Some((len, data)) = split_once(rest, b':') else {
        send_error(host);
        return;
    };
    let (Some(addr), Some(len)) = (parse_u32_hex(addr), parse_u32_hex(len)) else {
        send_error(host);
        return;
    };

    if len as usize > MAX_MEM_CHUNK {
        send_error(host);
        return;
    }
    let Some(bytes) = parse_hex_bytes(data) else {
        send_error(host);
        return;
    };
    if bytes.len() != len as usize {
        send_error(host);
        return;
    }

    send_result(host, target.write_mem(io, addr, &bytes));
}

/// Translate a GDB register number to the facade numbering, keeping the
/// historical alias of 25 (CPSR) to xPSR on M-profile cores.
fn effective_regnum(target: &Target, regnum: u32) -> u32 {
    match target.architecture() {
        Some(crate::target::Architecture::CortexM) if regnum == 25 => 16,
        _ => regnum,
    }
}

fn handle_read_register(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some(regnum) = parse_u32_hex(args) else {
        send_error(host);
        return;
    };
    if target.halt(io).is_err() {
        send_error(host);
        return;
    }

    match target.read_reg(io, effective_regnum(target, regnum)) {
        Ok(value) => {
            let mut writer = PacketWriter::new(host);
            writer.write_hex_u32_le(value);
            writer.finish();
        }
        Err(TargetError::Unsupported) => send_empty(host),
        Err(_) => send_error(host),
    }
}

fn handle_write_register(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some((regnum, value)) = split_once(args, b'=') else {
        send_error(host);
        return;
    };
    let (Some(regnum), Some(value)) = (parse_u32_hex(regnum), parse_u32_le_hex(value)) else {
        send_error(host);
        return;
    };
    if target.halt(io).is_err() {
        send_error(host);
        return;
    }

    send_result(
        host,
        target.write_reg(io, effective_regnum(target, regnum), value),
    );
}

/// `Z`/`z`: insert or remove breakpoints (types 0 and 1) and watchpoints
/// (types 2..4). Unknown types and missing capabilities reply empty.
fn handle_breakpoint(
    insert: bool,
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some((type_, rest)) = split_once(args, b',') else {
        send_error(host);
        return;
    };
    let Some((addr, kind)) = split_once(rest, b',') else {
        send_error(host);
        return;
    };
    let (Some(type_), Some(addr), Some(kind)) = (
        parse_u32_hex(type_),
        parse_u32_hex(addr),
        parse_u32_hex(kind),
    ) else {
        send_error(host);
        return;
    };

    match type_ {
        // Software and hardware breakpoints both map to the hardware unit;
        // there is no code patching path.
        0 | 1 => {
            let result = if insert {
                target.breakpoint_insert(io, addr)
            } else {
                target.breakpoint_remove(io, addr)
            };
            match result {
                Ok(()) => send_ok(host),
                Err(_) => send_error(host),
            }
        }
        2..=4 => {
            let watch = match type_ {
                2 => WatchKind::Write,
                3 => WatchKind::Read,
                _ => WatchKind::Access,
            };
            let result = if insert {
                target.watchpoint_insert(io, watch, addr, kind)
            } else {
                target.watchpoint_remove(io, watch, addr, kind)
            };
            send_result(host, result);
        }
        _ => send_empty(host),
    }
}

impl GdbServer {
    fn handle_query(
        &mut self,
        payload: &[u8],
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        if payload.starts_with(b"qSupported") {
            let mut writer = PacketWriter::new(host);
            writer.write(b"PacketSize=");
            writer.write(PACKET_SIZE_HEX.as_bytes());
            writer.write(b";swbreak+;hwbreak+;qXfer:features:read+");
            writer.finish();
            return;
        }

        if payload.starts_with(b"qAttached") {
            send_packet(host, b"1");
            return;
        }

        if let Some(args) = payload.strip_prefix(b"qXfer:features:read:".as_slice()) {
            handle_features_read(args, target, io, host);
            return;
        }

        if let Some(command) = payload.strip_prefix(b"qRcmd,".as_slice()) {
            self.handle_monitor_command(command, target, io, host);
            return;
        }

        send_empty(host);
    }

    /// `qRcmd,<hex>`: `monitor` commands. `reset` pulses nRESET and
    /// re-attaches the target halted.
    fn handle_monitor_command(
        &mut self,
        command: &[u8],
        target: &mut Target,
        io: &mut dyn ProbeIo,
        host: &mut dyn HostLink,
    ) {
        let Some(command) = parse_hex_bytes(command) else {
            send_error(host);
            return;
        };

        if command == b"reset" {
            tracing::info!("monitor reset");
            self.running = false;
            io.nreset_write(false);
            io.delay_us(1_000);
            io.nreset_write(true);
            io.delay_us(1_000);

            let result = target
                .attach(io)
                .map(|_| ())
                .and_then(|()| target.halt(io));
            match result {
                Ok(()) => send_ok(host),
                Err(_) => send_error(host),
            }
            return;
        }

        tracing::debug!(
            "unknown monitor command: {}",
            String::from_utf8_lossy(&command)
        );
        send_empty(host);
    }
}

/// `qXfer:features:read:<annex>:<offset>,<length>`: slice the target
/// description, prefixing `m` while more remains and `l` on the final
/// chunk.
fn handle_features_read(
    args: &[u8],
    target: &mut Target,
    io: &mut dyn ProbeIo,
    host: &mut dyn HostLink,
) {
    let Some((annex, range)) = split_once(args, b':') else {
        send_error(host);
        return;
    };
    if annex != b"target.xml" {
        send_empty(host);
        return;
    }
    let Some((offset, length)) = split_once(range, b',') else {
        send_error(host);
        return;
    };
    let (Some(offset), Some(length)) = (parse_u32_hex(offset), parse_u32_hex(length)) else {
        send_error(host);
        return;
    };

    let Ok(xml) = target.target_description(io) else {
        send_empty(host);
        return;
    };
    let xml = xml.as_bytes();

    let offset = offset as usize;
    if offset >= xml.len() {
        send_packet(host, b"l");
        return;
    }

    let length = (length as usize)
        .min(xml.len() - offset)
        .min(MAX_PACKET_SIZE - 1);
    let more = offset + length < xml.len();

    let mut writer = PacketWriter::new(host);
    writer.write(if more { b"m" } else { b"l" });
    writer.write(&xml[offset..offset + length]);
    writer.finish();
}
