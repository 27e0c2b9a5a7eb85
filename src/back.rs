//! The back-end of the compiler: abstract assembly, the two instruction
//! selectors, liveness analysis, graph-colouring register allocation and
//! final emission.

pub mod arm64;
pub mod assem;
pub mod emit;
pub mod graph;
pub mod liveness;
pub mod regalloc;
pub mod target;
pub mod x86_64;

pub use assem::*;
pub use emit::compile_fragments;
pub use target::{Target, TARGET_ARM64, TARGET_X86_64};

#[cfg(test)]
mod tests;
