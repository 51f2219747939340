//! Target architecture stacks: ARM (SWD + ADIv5 + Cortex-M) and RISC-V
//! (JTAG + DTM + Debug Module).

pub mod arm;
pub mod riscv;
