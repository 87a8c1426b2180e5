//! Public interface of the allocator library.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::arm::{ArmCode, Function, Reg};
use crate::linear_scan;

pub use crate::analysis::Interval;

pub type Map<K, V> = FxHashMap<K, V>;
pub type Set<T> = FxHashSet<T>;

/// Identifier of a MIR variable, the key space of the side inputs produced
/// by earlier passes.
pub type VarId = u32;

/// Result of the graph-coloring pass: a color index into the callee-saved
/// register file, or `-1` for values that must live in memory across blocks.
pub type ColorMap = Map<VarId, i32>;

/// The MIR-to-virtual-register mapping produced by instruction lowering.
/// Ordered so that stack-slot assignment is deterministic.
pub type VregMap = BTreeMap<VarId, Reg>;

/// Register allocation can fail; there is no local recovery, the caller is
/// expected to abandon the compilation.
#[derive(Debug)]
pub enum RegAllocError {
    /// No physical register is free and no binding is available to evict.
    /// Carries the active set at the point of failure.
    OutOfRegisters { active: Vec<(Reg, Interval)> },
    /// The rewrite pass met an instruction shape it does not support.
    NotImplemented(&'static str),
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegAllocError::OutOfRegisters { active } => {
                writeln!(fmt, "failed to allocate: all active registers are temporary!")?;
                writeln!(fmt, "dump:")?;
                for (reg, interval) in active {
                    writeln!(fmt, "{:?}: {:?}", reg, interval)?;
                }
                Ok(())
            }
            RegAllocError::NotImplemented(what) => {
                write!(fmt, "not implemented: {}", what)
            }
        }
    }
}

impl std::error::Error for RegAllocError {}

/// Rewrites one function so that every operand names a hardware register,
/// inserting spill code where pressure demands it and finalizing the frame
/// prologue/epilogue.
pub fn allocate_function(
    f: &mut Function,
    colors: &ColorMap,
    vregs: &VregMap,
) -> Result<(), RegAllocError> {
    linear_scan::run(f, colors, vregs)
}

/// Allocates every function of a translation unit, looking up each one's
/// color map and vreg mapping by name. Functions without side inputs (for
/// example, already-allocated ones) pass through with frame finalization
/// only.
pub fn allocate_program(
    code: &mut ArmCode,
    coloring: &Map<String, ColorMap>,
    vreg_maps: &Map<String, VregMap>,
) -> Result<(), RegAllocError> {
    let no_colors = ColorMap::default();
    let no_vregs = VregMap::new();
    for f in code.functions.iter_mut() {
        debug!("allocating registers for {}", f.name);
        let colors = coloring.get(&f.name).unwrap_or(&no_colors);
        let vregs = vreg_maps.get(&f.name).unwrap_or(&no_vregs);
        allocate_function(f, colors, vregs)?;
    }
    Ok(())
}
