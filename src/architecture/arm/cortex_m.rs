//! Cortex-M core engine.
//!
//! Drives the core debug registers (DHCSR/DCRSR/DCRDR) for halt, step,
//! resume and register transfer, and manages the comparator allocations of
//! the FPB (instruction breakpoints) and the DWT (data watchpoints) across
//! the v6-M / v7-M / v8-M profiles.

use bitfield::bitfield;

use crate::architecture::arm::dp::ArmDebugInterface;
use crate::architecture::arm::{ArmError, MemoryMappedRegister};
use crate::target::WatchKind;

/// Number of DHCSR polls while waiting for S_REGRDY or S_HALT.
const CORE_POLLS: usize = 10_000;

/// Local FPB slot table capacity; NUM_CODE is capped to this.
const FPB_MAX_SLOTS: usize = 8;

/// Local DWT slot table capacity; NUMCOMP is capped to this.
const DWT_MAX_SLOTS: usize = 4;

/// Core profile derived from CPUID.PARTNO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CortexMProfile {
    #[default]
    Unknown,
    M0,
    M0Plus,
    M3,
    M4,
    M7,
    M23,
    M33,
    M55,
}

impl CortexMProfile {
    fn from_partno(partno: u16) -> Self {
        match partno {
            0xC20 => CortexMProfile::M0,
            0xC60 => CortexMProfile::M0Plus,
            0xC23 => CortexMProfile::M3,
            0xC24 => CortexMProfile::M4,
            0xC27 => CortexMProfile::M7,
            0xD20 => CortexMProfile::M23,
            0xD21 => CortexMProfile::M33,
            0xD22 => CortexMProfile::M55,
            _ => CortexMProfile::Unknown,
        }
    }

    /// v8-M cores use the v2 comparator layouts in both the FPB and DWT.
    fn is_v8m(self) -> bool {
        matches!(
            self,
            CortexMProfile::M23 | CortexMProfile::M33 | CortexMProfile::M55
        )
    }

    /// Baseline v6-M cores have no DWT data-value sizing.
    fn is_v6m(self) -> bool {
        matches!(
            self,
            CortexMProfile::M0 | CortexMProfile::M0Plus | CortexMProfile::Unknown
        )
    }
}

bitfield! {
    /// CPUID at 0xE000ED00.
    #[derive(Clone, Copy)]
    pub struct Cpuid(u32);
    impl Debug;
    pub u8, implementer, _: 31, 24;
    pub u8, variant, _: 23, 20;
    pub u16, partno, _: 15, 4;
    pub u8, revision, _: 3, 0;
}

impl Cpuid {
    /// Implementer code for Arm Limited.
    pub const IMPLEMENTER_ARM: u8 = 0x41;
}

impl From<u32> for Cpuid {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Cpuid> for u32 {
    fn from(raw: Cpuid) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Cpuid {
    const ADDRESS: u32 = 0xE000_ED00;
    const NAME: &'static str = "CPUID";
}

bitfield! {
    /// Debug Halting Control and Status Register.
    ///
    /// Writes take effect only with the debug key set; use
    /// [`Dhcsr::enable_write`] before writing.
    #[derive(Clone, Copy)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Place the DBGKEY value in bits [31:16]; without it the write is
    /// ignored by the core.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0xA05F << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dhcsr> for u32 {
    fn from(raw: Dhcsr) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: u32 = 0xE000_EDF0;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register. Write-only.
    #[derive(Clone, Copy)]
    pub struct Dcrsr(u32);
    impl Debug;
    pub _, set_regwnr: 16;
    pub u8, _, set_regsel: 4, 0;
}

impl From<u32> for Dcrsr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dcrsr> for u32 {
    fn from(raw: Dcrsr) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: u32 = 0xE000_EDF4;
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register.
#[derive(Debug, Clone, Copy)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dcrdr> for u32 {
    fn from(raw: Dcrdr) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Dcrdr {
    const ADDRESS: u32 = 0xE000_EDF8;
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Clone, Copy)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global enable for the DWT (and ITM on cores that have it).
    pub trcena, set_trcena: 24;
    pub vc_harderr, set_vc_harderr: 10;
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Demcr> for u32 {
    fn from(raw: Demcr) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Demcr {
    const ADDRESS: u32 = 0xE000_EDFC;
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Debug Fault Status Register. All bits are sticky, write-1-to-clear.
    #[derive(Clone, Copy)]
    pub struct Dfsr(u32);
    impl Debug;
    pub external, _: 4;
    pub vcatch, _: 3;
    pub dwttrap, set_dwttrap: 2;
    pub bkpt, _: 1;
    pub halted, _: 0;
}

impl From<u32> for Dfsr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Dfsr> for u32 {
    fn from(raw: Dfsr) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for Dfsr {
    const ADDRESS: u32 = 0xE000_ED30;
    const NAME: &'static str = "DFSR";
}

bitfield! {
    /// Flash Patch Control Register.
    #[derive(Clone, Copy)]
    pub struct FpCtrl(u32);
    impl Debug;
    /// 0: FPB version 1. 1: FPB version 2 (breakpoints anywhere in the
    /// 4 GiB address range).
    pub u8, rev, _: 31, 28;
    u8, num_code_1, _: 14, 12;
    pub u8, num_lit, _: 11, 8;
    u8, num_code_0, _: 7, 4;
    /// Must be written as 1 for the write to take effect.
    pub _, set_key: 1;
    pub enable, set_enable: 0;
}

impl FpCtrl {
    pub fn num_code(&self) -> u8 {
        (self.num_code_1() << 4) | self.num_code_0()
    }
}

impl From<u32> for FpCtrl {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<FpCtrl> for u32 {
    fn from(raw: FpCtrl) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for FpCtrl {
    const ADDRESS: u32 = 0xE000_2000;
    const NAME: &'static str = "FP_CTRL";
}

/// Base address of the FPB comparator array.
const FP_COMP_BASE: u32 = 0xE000_2008;

bitfield! {
    /// FPB version 1 comparator: word-address compare with a REPLACE field
    /// selecting the lower (0b01) or upper (0b10) halfword.
    #[derive(Clone, Copy)]
    pub struct FpRev1CompX(u32);
    impl Debug;
    pub u8, replace, set_replace: 31, 30;
    pub u32, comp, set_comp: 28, 2;
    pub enable, set_enable: 0;
}

impl FpRev1CompX {
    /// Comparator value breaking on the instruction at `addr`. Only
    /// addresses in the code region (below 0x2000_0000) can be matched.
    fn breakpoint_configuration(addr: u32) -> Result<Self, ArmError> {
        if addr >= 0x2000_0000 {
            return Err(ArmError::UnsupportedBreakpointAddress(addr));
        }
        let mut comp = FpRev1CompX(0);
        comp.set_comp((addr & 0x1FFF_FFFC) >> 2);
        comp.set_replace(if addr & 0x2 == 0 { 0b01 } else { 0b10 });
        comp.set_enable(true);
        Ok(comp)
    }
}

impl From<u32> for FpRev1CompX {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<FpRev1CompX> for u32 {
    fn from(raw: FpRev1CompX) -> Self {
        raw.0
    }
}

bitfield! {
    /// FPB version 2 comparator: full instruction address in BPADDR.
    #[derive(Clone, Copy)]
    pub struct FpRev2CompX(u32);
    impl Debug;
    pub u32, bpaddr, set_bpaddr: 31, 1;
    pub enable, set_enable: 0;
}

impl FpRev2CompX {
    fn breakpoint_configuration(addr: u32) -> Self {
        let mut comp = FpRev2CompX(0);
        comp.set_bpaddr(addr >> 1);
        comp.set_enable(true);
        comp
    }
}

impl From<u32> for FpRev2CompX {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<FpRev2CompX> for u32 {
    fn from(raw: FpRev2CompX) -> Self {
        raw.0
    }
}

bitfield! {
    /// DWT control register.
    #[derive(Clone, Copy)]
    pub struct DwtCtrl(u32);
    impl Debug;
    pub u8, numcomp, _: 31, 28;
}

impl From<u32> for DwtCtrl {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<DwtCtrl> for u32 {
    fn from(raw: DwtCtrl) -> Self {
        raw.0
    }
}

impl MemoryMappedRegister for DwtCtrl {
    const ADDRESS: u32 = 0xE000_1000;
    const NAME: &'static str = "DWT_CTRL";
}

/// DWT comparator register block base; each comparator occupies 16 bytes
/// (COMP, MASK, FUNCTION, reserved).
const DWT_COMP_BASE: u32 = 0xE000_1020;

fn dwt_comp_addr(index: usize) -> u32 {
    DWT_COMP_BASE + 16 * index as u32
}

fn dwt_mask_addr(index: usize) -> u32 {
    DWT_COMP_BASE + 4 + 16 * index as u32
}

fn dwt_function_addr(index: usize) -> u32 {
    DWT_COMP_BASE + 8 + 16 * index as u32
}

bitfield! {
    /// DWT comparator function register. The MATCHED flag is set when the
    /// comparator fired and clears on read.
    #[derive(Clone, Copy)]
    pub struct DwtFunction(u32);
    impl Debug;
    pub matched, _: 24;
    pub u8, datavsize, set_datavsize: 11, 10;
    pub u8, action, set_action: 5, 4;
    pub u8, function, set_function: 3, 0;
}

impl DwtFunction {
    /// v1 (v6-M/v7-M) function encoding for an address watchpoint.
    fn v1_watch(kind: WatchKind, datavsize: u8) -> Self {
        let mut function = DwtFunction(0);
        function.set_function(match kind {
            WatchKind::Read => 0b0101,
            WatchKind::Write => 0b0110,
            WatchKind::Access => 0b0111,
        });
        function.set_datavsize(datavsize);
        function
    }

    /// v2 (v8-M) match encoding, with ACTION = generate debug event and the
    /// byte length folded into DATAVSIZE.
    fn v2_watch(kind: WatchKind, len: u32) -> Self {
        let mut function = DwtFunction(0);
        function.set_function(match kind {
            WatchKind::Read => 0b0110,
            WatchKind::Write => 0b0101,
            WatchKind::Access => 0b0100,
        });
        function.set_action(0b01);
        function.set_datavsize(((len >> 1) & 0x3) as u8);
        function
    }
}

impl From<u32> for DwtFunction {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<DwtFunction> for u32 {
    fn from(raw: DwtFunction) -> Self {
        raw.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FpbSlot {
    addr: u32,
    used: bool,
}

#[derive(Debug, Clone, Copy)]
struct DwtSlot {
    addr: u32,
    len: u32,
    kind: WatchKind,
}

/// Persistent Cortex-M engine state: detected profile and the comparator
/// allocation tables. Reset on link bring-up.
#[derive(Debug)]
pub struct CortexMState {
    profile: CortexMProfile,
    fpb_initialized: bool,
    fpb_rev: u8,
    fpb_num_code: usize,
    fpb_slots: [FpbSlot; FPB_MAX_SLOTS],
    dwt_initialized: bool,
    dwt_num_comp: usize,
    dwt_slots: [Option<DwtSlot>; DWT_MAX_SLOTS],
}

impl CortexMState {
    pub fn new() -> Self {
        Self {
            profile: CortexMProfile::Unknown,
            fpb_initialized: false,
            fpb_rev: 0,
            fpb_num_code: 0,
            fpb_slots: [FpbSlot::default(); FPB_MAX_SLOTS],
            dwt_initialized: false,
            dwt_num_comp: 0,
            dwt_slots: [None; DWT_MAX_SLOTS],
        }
    }
}

impl Default for CortexMState {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! m_profile_description {
    ($architecture:literal) => {
        concat!(
            "<?xml version=\"1.0\"?>\n",
            "<!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n",
            "<target>\n",
            "  <architecture>",
            $architecture,
            "</architecture>\n",
            "  <feature name=\"org.gnu.gdb.arm.m-profile\">\n",
            "    <reg name=\"r0\" bitsize=\"32\"/>\n",
            "    <reg name=\"r1\" bitsize=\"32\"/>\n",
            "    <reg name=\"r2\" bitsize=\"32\"/>\n",
            "    <reg name=\"r3\" bitsize=\"32\"/>\n",
            "    <reg name=\"r4\" bitsize=\"32\"/>\n",
            "    <reg name=\"r5\" bitsize=\"32\"/>\n",
            "    <reg name=\"r6\" bitsize=\"32\"/>\n",
            "    <reg name=\"r7\" bitsize=\"32\"/>\n",
            "    <reg name=\"r8\" bitsize=\"32\"/>\n",
            "    <reg name=\"r9\" bitsize=\"32\"/>\n",
            "    <reg name=\"r10\" bitsize=\"32\"/>\n",
            "    <reg name=\"r11\" bitsize=\"32\"/>\n",
            "    <reg name=\"r12\" bitsize=\"32\"/>\n",
            "    <reg name=\"sp\" bitsize=\"32\" type=\"data_ptr\"/>\n",
            "    <reg name=\"lr\" bitsize=\"32\"/>\n",
            "    <reg name=\"pc\" bitsize=\"32\" type=\"code_ptr\"/>\n",
            "    <reg name=\"xpsr\" bitsize=\"32\"/>\n",
            "  </feature>\n",
            "</target>\n",
        )
    };
}

const TARGET_XML_V6M: &str = m_profile_description!("armv6-m");
const TARGET_XML_V7M: &str = m_profile_description!("armv7-m");
const TARGET_XML_V7EM: &str = m_profile_description!("armv7e-m");
const TARGET_XML_V8M_BASE: &str = m_profile_description!("armv8-m.base");
const TARGET_XML_V8M_MAIN: &str = m_profile_description!("armv8-m.main");

impl ArmDebugInterface<'_> {
    /// Locate a MEM-AP behind which a Cortex-M core answers with a valid
    /// CPUID and derive the core profile. The previously active AP is tried
    /// first; on failure APSEL 0..15 are scanned.
    pub fn attach_core(&mut self) -> Result<CortexMProfile, ArmError> {
        let cached = self.state.memory_ap;
        let candidates = core::iter::once(cached).chain((0..16).filter(|ap| *ap != cached));

        for ap_sel in candidates {
            let Ok(raw) = self.read_word_ap(ap_sel, Cpuid::ADDRESS) else {
                continue;
            };
            let cpuid = Cpuid::from(raw);
            if cpuid.implementer() != Cpuid::IMPLEMENTER_ARM {
                continue;
            }

            let profile = CortexMProfile::from_partno(cpuid.partno());
            tracing::info!(
                "found {:?} (CPUID {:#010x}) behind AP{}",
                profile,
                raw,
                ap_sel
            );
            self.state.memory_ap = ap_sel;
            self.state.core.profile = profile;
            return Ok(profile);
        }

        Err(ArmError::NoCoreFound)
    }

    pub fn core_profile(&self) -> CortexMProfile {
        self.state.core.profile
    }

    /// The GDB target description for the detected profile. Unknown cores
    /// fall back to the baseline M-profile description, which is valid for
    /// basic debug on every M-profile core.
    pub fn target_description(&self) -> &'static str {
        match self.state.core.profile {
            CortexMProfile::M0 | CortexMProfile::M0Plus => TARGET_XML_V6M,
            CortexMProfile::M3 => TARGET_XML_V7M,
            CortexMProfile::M4 | CortexMProfile::M7 => TARGET_XML_V7EM,
            CortexMProfile::M23 => TARGET_XML_V8M_BASE,
            CortexMProfile::M33 | CortexMProfile::M55 => TARGET_XML_V8M_MAIN,
            CortexMProfile::Unknown => TARGET_XML_V6M,
        }
    }

    fn write_dhcsr(&mut self, configure: impl FnOnce(&mut Dhcsr)) -> Result<(), ArmError> {
        let mut dhcsr = Dhcsr(0);
        configure(&mut dhcsr);
        dhcsr.enable_write();
        self.write_mmio(dhcsr)
    }

    pub fn core_halted(&mut self) -> Result<bool, ArmError> {
        Ok(self.read_mmio::<Dhcsr>()?.s_halt())
    }

    fn wait_for_core_halted(&mut self) -> Result<(), ArmError> {
        for _ in 0..CORE_POLLS {
            if self.core_halted()? {
                return Ok(());
            }
        }
        Err(ArmError::Timeout)
    }

    /// Halt the core and wait for S_HALT.
    pub fn halt_core(&mut self) -> Result<(), ArmError> {
        self.write_dhcsr(|dhcsr| {
            dhcsr.set_c_debugen(true);
            dhcsr.set_c_halt(true);
        })?;
        self.wait_for_core_halted()
    }

    /// Resume execution, clearing halt and step.
    pub fn run_core(&mut self) -> Result<(), ArmError> {
        self.write_dhcsr(|dhcsr| dhcsr.set_c_debugen(true))
    }

    /// Execute a single instruction: from the halted state, pulse C_STEP,
    /// then re-enter halt.
    pub fn step_core(&mut self) -> Result<(), ArmError> {
        self.halt_core()?;
        self.write_dhcsr(|dhcsr| {
            dhcsr.set_c_debugen(true);
            dhcsr.set_c_step(true);
        })?;
        self.halt_core()
    }

    fn wait_for_regrdy(&mut self) -> Result<(), ArmError> {
        for _ in 0..CORE_POLLS {
            if self.read_mmio::<Dhcsr>()?.s_regrdy() {
                return Ok(());
            }
        }
        Err(ArmError::Timeout)
    }

    /// Read a core register through the DCRSR/DCRDR transfer window.
    /// Register 16 is xPSR.
    pub fn read_core_reg(&mut self, regnum: u8) -> Result<u32, ArmError> {
        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regsel(regnum & 0x1F);
        self.write_mmio(dcrsr)?;
        self.wait_for_regrdy()?;
        Ok(self.read_mmio::<Dcrdr>()?.0)
    }

    /// Write a core register through the DCRSR/DCRDR transfer window.
    pub fn write_core_reg(&mut self, regnum: u8, value: u32) -> Result<(), ArmError> {
        self.write_mmio(Dcrdr(value))?;
        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regsel(regnum & 0x1F);
        dcrsr.set_regwnr(true);
        self.write_mmio(dcrsr)?;
        self.wait_for_regrdy()
    }

    /// Read the GDB register block: r0..r15 followed by xPSR.
    pub fn read_gdb_regs(&mut self, regs: &mut [u32; 17]) -> Result<(), ArmError> {
        for (regnum, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_core_reg(regnum as u8)?;
        }
        Ok(())
    }

    /// Write the GDB register block: r0..r15 followed by xPSR.
    pub fn write_gdb_regs(&mut self, regs: &[u32; 17]) -> Result<(), ArmError> {
        for (regnum, value) in regs.iter().enumerate() {
            self.write_core_reg(regnum as u8, *value)?;
        }
        Ok(())
    }

    /// Discover and enable the FPB: read NUM_CODE, cap it to the local
    /// table, enable the unit and clear stale comparators.
    pub fn breakpoints_init(&mut self) -> Result<(), ArmError> {
        if self.state.core.fpb_initialized {
            return Ok(());
        }
        self.state.core.fpb_initialized = true;
        self.state.core.fpb_slots = [FpbSlot::default(); FPB_MAX_SLOTS];

        let ctrl = match self.read_mmio::<FpCtrl>() {
            Ok(ctrl) => ctrl,
            Err(error) => {
                tracing::warn!("FPB not readable: {error}");
                self.state.core.fpb_num_code = 0;
                return Ok(());
            }
        };

        self.state.core.fpb_rev = ctrl.rev();
        self.state.core.fpb_num_code = (ctrl.num_code() as usize).min(FPB_MAX_SLOTS);
        tracing::debug!(
            "FPB rev {} with {} code comparators",
            ctrl.rev(),
            self.state.core.fpb_num_code
        );

        if self.state.core.fpb_num_code == 0 {
            return Ok(());
        }

        let mut enable = ctrl;
        enable.set_key(true);
        enable.set_enable(true);
        self.write_mmio(enable)?;

        for index in 0..self.state.core.fpb_num_code {
            self.write_word(FP_COMP_BASE + 4 * index as u32, 0)?;
        }
        Ok(())
    }

    /// Install an instruction breakpoint. Re-inserting an installed address
    /// succeeds without touching the hardware.
    pub fn breakpoint_insert(&mut self, addr: u32) -> Result<(), ArmError> {
        self.breakpoints_init()?;
        let num_code = self.state.core.fpb_num_code;
        if num_code == 0 {
            return Err(ArmError::NoFreeComparator);
        }

        if self.state.core.fpb_slots[..num_code]
            .iter()
            .any(|slot| slot.used && slot.addr == addr)
        {
            return Ok(());
        }

        let comp: u32 = if self.state.core.fpb_rev == 0 {
            FpRev1CompX::breakpoint_configuration(addr)?.into()
        } else {
            FpRev2CompX::breakpoint_configuration(addr).into()
        };

        let Some(index) = self.state.core.fpb_slots[..num_code]
            .iter()
            .position(|slot| !slot.used)
        else {
            return Err(ArmError::NoFreeComparator);
        };

        self.write_word(FP_COMP_BASE + 4 * index as u32, comp)?;
        self.state.core.fpb_slots[index] = FpbSlot { addr, used: true };
        Ok(())
    }

    /// Remove an instruction breakpoint. Removing an absent address
    /// succeeds silently.
    pub fn breakpoint_remove(&mut self, addr: u32) -> Result<(), ArmError> {
        self.breakpoints_init()?;
        let num_code = self.state.core.fpb_num_code;

        for index in 0..num_code {
            let slot = self.state.core.fpb_slots[index];
            if slot.used && slot.addr == addr {
                self.write_word(FP_COMP_BASE + 4 * index as u32, 0)?;
                self.state.core.fpb_slots[index] = FpbSlot::default();
                return Ok(());
            }
        }
        Ok(())
    }

    /// Discover the DWT: enable TRCENA and read NUMCOMP.
    pub fn watchpoints_init(&mut self) -> Result<(), ArmError> {
        if self.state.core.dwt_initialized {
            return Ok(());
        }
        self.state.core.dwt_initialized = true;
        self.state.core.dwt_slots = [None; DWT_MAX_SLOTS];

        let mut demcr = self.read_mmio::<Demcr>()?;
        demcr.set_trcena(true);
        self.write_mmio(demcr)?;

        let ctrl = match self.read_mmio::<DwtCtrl>() {
            Ok(ctrl) => ctrl,
            Err(error) => {
                tracing::warn!("DWT not readable: {error}");
                self.state.core.dwt_num_comp = 0;
                return Ok(());
            }
        };
        self.state.core.dwt_num_comp = (ctrl.numcomp() as usize).min(DWT_MAX_SLOTS);
        tracing::debug!("DWT with {} comparators", self.state.core.dwt_num_comp);
        Ok(())
    }

    pub fn watchpoints_supported(&mut self) -> Result<bool, ArmError> {
        self.watchpoints_init()?;
        Ok(self.state.core.dwt_num_comp > 0)
    }

    /// Install a data watchpoint over `[addr, addr + len)`.
    ///
    /// On v6-M/v7-M (DWT v1) the range must be a power-of-two sized,
    /// naturally aligned block expressed through the MASK register. v8-M
    /// (DWT v2) takes the address and length directly.
    pub fn watchpoint_insert(
        &mut self,
        kind: WatchKind,
        addr: u32,
        len: u32,
    ) -> Result<(), ArmError> {
        self.watchpoints_init()?;
        let num_comp = self.state.core.dwt_num_comp;
        if num_comp == 0 {
            return Err(ArmError::NoFreeComparator);
        }

        let v8m = self.state.core.profile.is_v8m();
        if !v8m && (len == 0 || !len.is_power_of_two()) {
            return Err(ArmError::InvalidWatchpointLength(len));
        }

        for slot in self.state.core.dwt_slots[..num_comp].iter().flatten() {
            if slot.kind == kind && slot.addr == addr && slot.len == len {
                return Ok(());
            }
        }

        let Some(index) = self.state.core.dwt_slots[..num_comp]
            .iter()
            .position(|slot| slot.is_none())
        else {
            return Err(ArmError::NoFreeComparator);
        };

        if v8m {
            self.write_word(dwt_comp_addr(index), addr)?;
            self.write_word(dwt_function_addr(index), DwtFunction::v2_watch(kind, len).into())?;
        } else {
            let datavsize = if self.state.core.profile.is_v6m() {
                0
            } else {
                (len.trailing_zeros() as u8).min(2)
            };
            self.write_word(dwt_comp_addr(index), addr & !(len - 1))?;
            self.write_word(dwt_mask_addr(index), len.trailing_zeros())?;
            self.write_word(
                dwt_function_addr(index),
                DwtFunction::v1_watch(kind, datavsize).into(),
            )?;
        }

        self.state.core.dwt_slots[index] = Some(DwtSlot { addr, len, kind });
        Ok(())
    }

    /// Remove a data watchpoint. Absent watchpoints succeed silently.
    pub fn watchpoint_remove(
        &mut self,
        kind: WatchKind,
        addr: u32,
        len: u32,
    ) -> Result<(), ArmError> {
        self.watchpoints_init()?;
        let num_comp = self.state.core.dwt_num_comp;

        for index in 0..num_comp {
            let matches = self.state.core.dwt_slots[index]
                .is_some_and(|slot| slot.kind == kind && slot.addr == addr && slot.len == len);
            if matches {
                self.write_word(dwt_function_addr(index), 0)?;
                self.state.core.dwt_slots[index] = None;
                return Ok(());
            }
        }
        Ok(())
    }

    /// If the last halt was caused by a DWT comparator, return which kind
    /// of access matched and the watched address, clearing the sticky
    /// DWTTRAP flag.
    pub fn watchpoint_hit(&mut self) -> Result<Option<(WatchKind, u32)>, ArmError> {
        if !self.state.core.dwt_initialized || self.state.core.dwt_num_comp == 0 {
            return Ok(None);
        }

        let dfsr = self.read_mmio::<Dfsr>()?;
        if !dfsr.dwttrap() {
            return Ok(None);
        }

        let mut hit = None;
        for index in 0..self.state.core.dwt_num_comp {
            let Some(slot) = self.state.core.dwt_slots[index] else {
                continue;
            };
            let function = DwtFunction::from(self.read_word(dwt_function_addr(index))?);
            if function.matched() {
                hit = Some((slot.kind, slot.addr));
                break;
            }
        }

        let mut clear = Dfsr(0);
        clear.set_dwttrap(true);
        self.write_mmio(clear)?;

        Ok(hit)
    }
}
