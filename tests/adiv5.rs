//! Layer-level invariants of the ADIv5 stack, exercised over the wire
//! simulator: SELECT shadowing, posted AP reads, the byte-access RMW rules
//! and WAIT recovery.

mod common;

use common::SimIo;
use pretty_assertions::assert_eq;
use tinydap::architecture::arm::dp::{ArmDebugInterface, ArmDebugState, DpIdr};
use tinydap::probe::swd::SwdPhy;

const DPIDR: u32 = 0x2BA0_1477;
const CPUID: u32 = 0x410F_C241;

fn bring_up(io: &mut SimIo, state: &mut ArmDebugState) {
    ArmDebugInterface::new(io, state)
        .init()
        .expect("link bring-up failed");
}

#[test]
fn dpidr_reads_back_after_switch_sequence() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    let idcode = ArmDebugInterface::new(&mut io, &mut state)
        .dp_read::<DpIdr>()
        .expect("DPIDR read failed");
    let raw: u32 = idcode.into();
    assert_eq!(raw, DPIDR);

    // Bring-up cleared the sticky error flags exactly once.
    assert_eq!(io.swd().abort_writes, 1);
}

#[test]
fn ap_access_maintains_the_select_shadow() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    let mut interface = ArmDebugInterface::new(&mut io, &mut state);
    let cpuid = interface.read_word_ap(0, 0xE000_ED00).unwrap();
    assert_eq!(cpuid, CPUID);

    // CSW/TAR/DRW live in bank 0 of AP 0.
    assert_eq!(interface.select_shadow(), Some(0));
    drop(interface);
    assert_eq!(io.swd().select_raw(), 0);

    // A different AP reprograms SELECT and the shadow follows.
    let mut interface = ArmDebugInterface::new(&mut io, &mut state);
    let _ = interface.read_word_ap(3, 0xE000_ED00);
    assert_eq!(interface.select_shadow(), Some(3 << 24));
}

#[test]
fn byte_round_trip_across_alignments() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    let pattern = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
    for start in 0..4u32 {
        let addr = 0x2000_0100 + start;
        for len in 1..=pattern.len() {
            let mut interface = ArmDebugInterface::new(&mut io, &mut state);
            interface.write_8(addr, &pattern[..len]).unwrap();

            let mut readback = vec![0u8; len];
            interface.read_8(addr, &mut readback).unwrap();
            assert_eq!(readback, pattern[..len], "addr {addr:#x} len {len}");
        }
    }
}

#[test]
fn aligned_full_word_write_never_reads() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    io.swd().core.log.clear();
    ArmDebugInterface::new(&mut io, &mut state)
        .write_8(0x2000_0200, &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();

    let accesses = io.swd().core.ram_accesses();
    assert!(
        accesses.iter().all(|access| access.write),
        "full-word path must not read: {accesses:?}"
    );
    assert_eq!(accesses.len(), 2);
}

#[test]
fn wait_responses_are_retried_transparently() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    io.swd().core.set_ram_word(0x2000_0000, 0xCAFE_F00D);
    io.swd().wait_responses = 3;

    let word = ArmDebugInterface::new(&mut io, &mut state)
        .read_word_ap(0, 0x2000_0000)
        .unwrap();
    assert_eq!(word, 0xCAFE_F00D);
    assert_eq!(io.swd().wait_responses, 0);
}

#[test]
fn exhausted_wait_retries_fail_and_recover() {
    let mut io = SimIo::cortex(DPIDR, CPUID);
    let mut state = ArmDebugState::new(SwdPhy::new(0));
    bring_up(&mut io, &mut state);

    io.swd().core.set_ram_word(0x2000_0000, 0x1234_5678);
    io.swd().wait_responses = 100;

    ArmDebugInterface::new(&mut io, &mut state)
        .read_word_ap(0, 0x2000_0000)
        .unwrap_err();

    // Once the target stops waiting, the layer re-synchronizes SELECT by
    // itself and the next access succeeds.
    io.swd().wait_responses = 0;
    let word = ArmDebugInterface::new(&mut io, &mut state)
        .read_word_ap(0, 0x2000_0000)
        .unwrap();
    assert_eq!(word, 0x1234_5678);
}
