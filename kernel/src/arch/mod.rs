//! Architecture support
//!
//! Machine-dependent code lives behind this module boundary; the rest of
//! the kernel sees per-core descriptors, trap frames and mapping
//! primitives, never instructions.

pub mod x86_64;
