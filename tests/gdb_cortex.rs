//! End-to-end scenarios against the wire-level SWD simulator: bring-up,
//! register and memory traffic, breakpoints, watchpoints and the RSP
//! framing behaviors.

mod common;

use common::swd_sim::Access;
use common::{exchange, exchange_no_reply, parse_replies, SimHost, SimIo, SimSession};
use pretty_assertions::assert_eq;
use tinydap::Architecture;

const DPIDR_M4: u32 = 0x2BA0_1477;
const CPUID_M4: u32 = 0x410F_C241;

fn attach_m4() -> SimSession {
    let mut session = SimSession::new(SimIo::cortex(DPIDR_M4, CPUID_M4), SimHost::new());
    let arch = session.attach().expect("attach failed");
    assert_eq!(arch, Architecture::CortexM);
    session
}

#[test]
fn bring_up_detects_cortex_m4() {
    let mut session = attach_m4();

    // The core is halted after attach and the FPB/DWT have been probed.
    assert!(session.io_mut().swd().core.halted);
    assert_eq!(session.io_mut().swd().core.demcr & (1 << 24), 1 << 24);

    // An M4 advertises the v7E-M description.
    let reply = exchange(&mut session, b"qXfer:features:read:target.xml:0,ffff");
    assert!(reply.starts_with('l') || reply.starts_with('m'));
    assert!(reply.contains("armv7e-m"), "unexpected description: {reply}");
}

#[test]
fn query_packets() {
    let mut session = attach_m4();

    assert_eq!(
        exchange(&mut session, b"qSupported:multiprocess+"),
        "PacketSize=200;swbreak+;hwbreak+;qXfer:features:read+"
    );
    assert_eq!(exchange(&mut session, b"qAttached"), "1");
    assert_eq!(exchange(&mut session, b"?"), "S05");
    assert_eq!(exchange(&mut session, b"qUnknownThing"), "");
}

#[test]
fn register_dump_matches_core_state() {
    let mut session = attach_m4();
    {
        let core = &mut session.io_mut().swd().core;
        for (index, reg) in core.regs[..16].iter_mut().enumerate() {
            *reg = index as u32;
        }
        core.regs[16] = 0x0100_0000;
    }

    let mut expected = String::new();
    for index in 0..16u32 {
        for byte in index.to_le_bytes() {
            expected.push_str(&format!("{byte:02x}"));
        }
    }
    expected.push_str("00000001");

    assert_eq!(exchange(&mut session, b"g"), expected);
}

#[test]
fn register_block_write_then_read_round_trips() {
    let mut session = attach_m4();

    let mut payload = b"G".to_vec();
    for index in 0..17u32 {
        let value = 0x1111_1111u32.wrapping_mul(index);
        for byte in value.to_le_bytes() {
            payload.extend(format!("{byte:02x}").bytes());
        }
    }
    assert_eq!(exchange(&mut session, &payload), "OK");

    let readback = exchange(&mut session, b"g");
    assert_eq!(readback, String::from_utf8_lossy(&payload[1..]));
}

#[test]
fn single_register_access_and_xpsr_alias() {
    let mut session = attach_m4();
    session.io_mut().swd().core.regs[16] = 0xDEAD_BEEF;

    // GDB's historical CPSR number 25 aliases to xPSR on M-profile.
    assert_eq!(exchange(&mut session, b"p19"), "efbeadde");

    assert_eq!(exchange(&mut session, b"P0=78563412"), "OK");
    assert_eq!(session.io_mut().swd().core.regs[0], 0x1234_5678);

    // Out-of-range registers are unsupported, not an error.
    assert_eq!(exchange(&mut session, b"p40"), "");
}

#[test]
fn unaligned_memory_write_does_one_rmw_per_partial_word() {
    let mut session = attach_m4();
    session.io_mut().swd().core.log.clear();

    assert_eq!(exchange(&mut session, b"M20000003,5:aabbccddee"), "OK");

    let writes = session.io_mut().swd().core.ram_accesses();
    assert_eq!(
        writes,
        vec![
            // Partial word: read-modify-write.
            Access { write: false, addr: 0x2000_0000 },
            Access { write: true, addr: 0x2000_0000 },
            // Fully covered word: direct write, no read.
            Access { write: true, addr: 0x2000_0004 },
        ]
    );

    assert_eq!(session.io_mut().swd().core.ram_word(0x2000_0000), 0xAA00_0000);
    assert_eq!(session.io_mut().swd().core.ram_word(0x2000_0004), 0xEEDD_CCBB);

    session.io_mut().swd().core.log.clear();
    assert_eq!(exchange(&mut session, b"m20000003,5"), "aabbccddee");

    let reads = session.io_mut().swd().core.ram_accesses();
    assert_eq!(
        reads,
        vec![
            Access { write: false, addr: 0x2000_0000 },
            Access { write: false, addr: 0x2000_0004 },
        ]
    );
}

#[test]
fn memory_boundaries() {
    let mut session = attach_m4();

    // Zero length reads back an empty hex string, not an error.
    assert_eq!(exchange(&mut session, b"m20000000,0"), "");

    // Longer than the packet buffer can carry back.
    assert_eq!(exchange(&mut session, b"m20000000,101"), "E01");
    assert_eq!(exchange(&mut session, b"M20000000,101:00"), "E01");

    // Malformed packets.
    assert_eq!(exchange(&mut session, b"m20000000"), "E01");
    assert_eq!(exchange(&mut session, b"M20000000,2:zz"), "E01");
}

#[test]
fn continue_reports_async_breakpoint_stop() {
    let mut session = attach_m4();

    assert_eq!(exchange(&mut session, b"Z1,08000100,2"), "OK");
    // Lower halfword comparator for an address with bit 1 clear.
    assert_eq!(
        session.io_mut().swd().core.fp_comp[0],
        (0x0800_0100 >> 2) << 2 | (0b01 << 30) | 1
    );

    exchange_no_reply(&mut session, b"c");
    assert!(!session.io_mut().swd().core.halted);

    // Nothing to report while the target runs.
    session.poll();
    assert!(session.host_mut().take_tx().is_empty());

    session.io_mut().swd().core.halt_for_breakpoint();
    session.poll();
    let replies = parse_replies(&session.host_mut().take_tx());
    assert_eq!(replies.packets, vec!["S05".to_string()]);

    // The stop is reported exactly once.
    session.poll();
    assert!(session.host_mut().take_tx().is_empty());
}

#[test]
fn breakpoint_insert_is_idempotent_and_remove_is_silent() {
    let mut session = attach_m4();

    assert_eq!(exchange(&mut session, b"Z1,08000100,2"), "OK");
    assert_eq!(exchange(&mut session, b"Z1,08000100,2"), "OK");
    // The second insert did not claim another comparator.
    assert_eq!(session.io_mut().swd().core.fp_comp[1], 0);

    assert_eq!(exchange(&mut session, b"z1,08000100,2"), "OK");
    assert_eq!(session.io_mut().swd().core.fp_comp[0], 0);

    // Removing an address that is not installed still succeeds.
    assert_eq!(exchange(&mut session, b"z1,08000100,2"), "OK");
}

#[test]
fn watchpoint_hit_is_annotated() {
    let mut session = attach_m4();

    assert_eq!(exchange(&mut session, b"Z2,20000010,4"), "OK");
    // v1 comparator: address, power-of-two mask, write-match function
    // with word DATAVSIZE.
    assert_eq!(session.io_mut().swd().core.dwt_comp[0], 0x2000_0010);
    assert_eq!(session.io_mut().swd().core.dwt_mask[0], 2);
    assert_eq!(
        session.io_mut().swd().core.dwt_function[0],
        0b0110 | (2 << 10)
    );

    exchange_no_reply(&mut session, b"c");
    session.io_mut().swd().core.trigger_watchpoint(0);
    session.poll();

    let replies = parse_replies(&session.host_mut().take_tx());
    assert_eq!(replies.packets, vec!["T05watch:20000010;".to_string()]);
}

#[test]
fn dwt_v1_rejects_non_power_of_two_length() {
    let mut session = attach_m4();
    assert_eq!(exchange(&mut session, b"Z2,20000010,3"), "E01");
}

#[test]
fn watchpoints_without_comparators_are_unsupported() {
    let mut session = SimSession::new(SimIo::cortex(DPIDR_M4, CPUID_M4), SimHost::new());
    session.io_mut().swd().core.dwt_ctrl = 0;
    session.attach().expect("attach failed");

    // Empty reply, not E01: GDB falls back to software watchpoints.
    assert_eq!(exchange(&mut session, b"Z2,20000010,4"), "");
    // Unknown breakpoint types as well.
    assert_eq!(exchange(&mut session, b"Z5,20000010,4"), "");
}

#[test]
fn step_replies_with_trap_and_advances_the_core() {
    let mut session = attach_m4();
    session.io_mut().swd().core.regs[15] = 0x0800_0000;

    assert_eq!(exchange(&mut session, b"s"), "S05");
    assert_eq!(session.io_mut().swd().core.regs[15], 0x0800_0002);
    assert!(session.io_mut().swd().core.halted);
}

#[test]
fn continue_with_address_redirects_pc() {
    let mut session = attach_m4();

    exchange_no_reply(&mut session, b"c08001000");
    assert_eq!(session.io_mut().swd().core.regs[15], 0x0800_1000);
    assert!(!session.io_mut().swd().core.halted);
}

#[test]
fn interrupt_halts_and_reports() {
    let mut session = attach_m4();

    exchange_no_reply(&mut session, b"c");
    session.host_mut().push_bytes(&[0x03]);
    session.poll();

    let replies = parse_replies(&session.host_mut().take_tx());
    assert_eq!(replies.packets, vec!["S05".to_string()]);
    assert!(session.io_mut().swd().core.halted);
}

#[test]
fn bad_checksum_is_nacked_and_not_dispatched() {
    let mut session = attach_m4();

    session.host_mut().push_bytes(b"$g#00");
    session.poll();
    let raw = session.host_mut().take_tx();
    assert_eq!(raw, b"-");

    // The framer recovers: the next well-formed packet goes through.
    assert_eq!(exchange(&mut session, b"?"), "S05");
}

#[test]
fn noise_between_packets_is_ignored() {
    let mut session = attach_m4();

    session.host_mut().push_bytes(b"+++garbage");
    session.host_mut().push_packet(b"?");
    session.poll();
    let replies = parse_replies(&session.host_mut().take_tx());
    assert_eq!(replies.acks, vec![b'+']);
    assert_eq!(replies.packets, vec!["S05".to_string()]);
}

#[test]
fn target_description_reassembles_from_chunks() {
    let mut session = attach_m4();

    let mut assembled = String::new();
    let mut offset = 0usize;
    loop {
        let request = format!("qXfer:features:read:target.xml:{offset:x},20");
        let reply = exchange(&mut session, request.as_bytes());
        let (marker, chunk) = reply.split_at(1);
        assembled.push_str(chunk);
        offset += chunk.len();
        match marker {
            "m" => continue,
            "l" => break,
            other => panic!("unexpected chunk marker {other}"),
        }
    }

    assert!(assembled.starts_with("<?xml"));
    assert!(assembled.contains("armv7e-m"));
    assert!(assembled.contains("<reg name=\"xpsr\""));
    assert!(assembled.ends_with("</target>\n"));

    // Unknown annexes produce an empty reply.
    assert_eq!(
        exchange(&mut session, b"qXfer:features:read:nope.xml:0,20"),
        ""
    );
}

#[test]
fn vcont_subset() {
    let mut session = attach_m4();

    assert_eq!(exchange(&mut session, b"vCont?"), "vCont;c;s");
    assert_eq!(exchange(&mut session, b"vCont;s:1"), "S05");

    exchange_no_reply(&mut session, b"vCont;c");
    assert!(!session.io_mut().swd().core.halted);
}

#[test]
fn detach_resumes_the_target() {
    let mut session = attach_m4();

    assert_eq!(exchange(&mut session, b"D"), "OK");
    assert!(!session.io_mut().swd().core.halted);
}

#[test]
fn monitor_reset_reattaches_halted() {
    let mut session = attach_m4();

    exchange_no_reply(&mut session, b"c");
    assert!(!session.io_mut().swd().core.halted);

    // "reset" hex-encoded.
    assert_eq!(exchange(&mut session, b"qRcmd,7265736574"), "OK");
    assert!(session.io_mut().swd().core.halted);
}
