//! Register allocator for a 32-bit ARM backend.
//!
//! The allocator merges two assignment strategies in a single rewrite pass:
//! long-lived values arrive pre-colored by a graph-coloring pass and map onto
//! the callee-saved registers, while short-lived transients are placed by a
//! local linear scan over the caller-saved set. When pressure exceeds the
//! physical registers, values are spilled to stack slots and reloaded on
//! demand, and the frame prologue/epilogue is finalized to match the
//! registers actually used.

mod analysis;
pub mod arm;
pub mod interface;
mod linear_scan;

pub use crate::interface::*;
