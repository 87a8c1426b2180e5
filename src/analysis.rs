//! Live-interval model and the liveness scan over a function's instruction
//! stream.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::warn;

use crate::arm::{Inst, Mem, MemOffset, MemoryOperand, OpCode, Operand2, Reg};
use crate::interface::Map;

/// A semi-open interval `[start, end)` where `start` is the point a value is
/// first written and `end` the point it is last read.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub fn point(pt: u32) -> Interval {
        Interval { start: pt, end: pt }
    }

    pub fn span(start: u32, end: u32) -> Interval {
        let end = if end < start { start } else { end };
        Interval { start, end }
    }

    /// Lowers `start` to `pt` if it is earlier.
    pub fn extend_start(&mut self, pt: u32) {
        if pt < self.start {
            self.start = pt;
        }
    }

    /// Raises `end` to `pt` if it is later.
    pub fn extend_end(&mut self, pt: u32) {
        if pt > self.end {
            self.end = pt;
        }
    }

    pub fn with_start(self, start: u32) -> Interval {
        Interval { start, end: self.end }
    }

    pub fn with_end(self, end: u32) -> Interval {
        Interval { start: self.start, end }
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.end > other.start && self.start < other.end
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "[{}, {})", self.start, self.end)
    }
}

/// The facts the first pass collects about a function: per-register live
/// intervals, write-site counts, copy-affinity candidates, call sites and
/// basic-block boundaries.
#[derive(Default)]
pub struct Liveness {
    pub intervals: Map<Reg, Interval>,
    pub assign_count: Map<Reg, u32>,
    /// `dst -> src` pairs harvested from plain register moves; the first
    /// recorded pair per destination wins.
    pub affinities: Map<Reg, Reg>,
    pub call_points: BTreeSet<u32>,
    /// Instruction index of each basic-block label, mapped to the block id
    /// parsed from its `$<id>` suffix.
    pub block_starts: BTreeMap<u32, u32>,
}

impl Liveness {
    fn read(&mut self, reg: Reg, pt: u32) {
        self.intervals
            .entry(reg)
            .and_modify(|iv| iv.extend_end(pt))
            .or_insert_with(|| Interval::point(pt));
    }

    fn write(&mut self, reg: Reg, pt: u32) {
        self.intervals
            .entry(reg)
            .and_modify(|iv| iv.extend_start(pt))
            .or_insert_with(|| Interval::point(pt));
        *self.assign_count.entry(reg).or_insert(0) += 1;
    }

    fn read_op2(&mut self, op: &Operand2, pt: u32) {
        if let Operand2::Reg(ro) = op {
            self.read(ro.reg, pt);
        }
    }

    fn read_mem(&mut self, mem: &MemoryOperand, pt: u32) {
        self.read(mem.base, pt);
        if let MemOffset::Reg(ro) = &mem.offset {
            self.read(ro.reg, pt);
        }
    }
}

/// Walks the instruction stream once, classifying each instruction's operands
/// as reads and writes.
pub(crate) fn scan(insts: &[Inst]) -> Liveness {
    let mut lv = Liveness::default();
    for (i, inst) in insts.iter().enumerate() {
        let pt = i as u32;
        match inst {
            Inst::Pure { .. } => {}
            Inst::Arith4 { rd, r1, r2, r3, .. } => {
                lv.read(*r1, pt);
                lv.read(*r2, pt);
                lv.read(*r3, pt);
                lv.write(*rd, pt);
            }
            Inst::Arith3 { rd, r1, r2, .. } => {
                lv.read(*r1, pt);
                lv.read_op2(r2, pt);
                lv.write(*rd, pt);
            }
            Inst::Arith2 { op, r1, r2, .. } => {
                if let OpCode::Mov | OpCode::MovT | OpCode::Mvn = op {
                    lv.write(*r1, pt);
                    if let (OpCode::Mov, Operand2::Reg(ro)) = (op, r2) {
                        if ro.shift_amount == 0
                            && !r1.is_virtual()
                            && !ro.reg.is_virtual()
                        {
                            lv.affinities.entry(*r1).or_insert(ro.reg);
                        }
                    }
                } else {
                    lv.read(*r1, pt);
                }
                lv.read_op2(r2, pt);
            }
            Inst::Branch { op, .. } => {
                if *op == OpCode::Bl {
                    lv.call_points.insert(pt);
                }
            }
            Inst::LoadStore { op, rd, mem, .. } => {
                if *op == OpCode::LdR {
                    lv.write(*rd, pt);
                } else {
                    lv.read(*rd, pt);
                }
                if let Mem::Offset(m) = mem {
                    lv.read_mem(m, pt);
                }
            }
            Inst::MultLoadStore { op, rn, regs, .. } => {
                for r in regs {
                    if *op == OpCode::LdM {
                        lv.write(*r, pt);
                    } else {
                        lv.read(*r, pt);
                    }
                }
                lv.read(*rn, pt);
            }
            Inst::PushPop { op, regs, .. } => {
                for r in regs {
                    if *op == OpCode::Push {
                        lv.write(*r, pt);
                    } else {
                        lv.read(*r, pt);
                    }
                }
            }
            Inst::Label(label) => {
                if label.starts_with(".bb_") {
                    let id = label
                        .rfind('$')
                        .and_then(|ix| label[ix + 1..].parse::<u32>().ok());
                    match id {
                        Some(id) => {
                            lv.block_starts.insert(pt, id);
                        }
                        None => {
                            warn!("malformed basic-block label {:?}", label)
                        }
                    }
                }
            }
            Inst::Ctrl { .. } => {}
        }
    }
    lv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ConditionCode::Always;
    use crate::arm::RegisterOperand;

    fn mov(r1: Reg, r2: Operand2) -> Inst {
        Inst::Arith2 { op: OpCode::Mov, r1, r2, cond: Always }
    }

    fn add(rd: Reg, r1: Reg, r2: Operand2) -> Inst {
        Inst::Arith3 { op: OpCode::Add, rd, r1, r2, cond: Always }
    }

    #[test]
    fn interval_construction_normalizes() {
        let iv = Interval::span(5, 3);
        assert_eq!(iv, Interval::point(5));
        assert_eq!(Interval::span(3, 5), Interval { start: 3, end: 5 });
    }

    #[test]
    fn interval_extension_is_directional() {
        let mut iv = Interval::point(4);
        iv.extend_start(6);
        iv.extend_end(2);
        assert_eq!(iv, Interval::point(4));
        iv.extend_start(2);
        iv.extend_end(6);
        assert_eq!(iv, Interval::span(2, 6));
    }

    #[test]
    fn interval_overlap_is_semi_open() {
        let a = Interval::span(0, 4);
        let b = Interval::span(4, 8);
        let c = Interval::span(3, 5);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        // An empty interval overlaps nothing, itself included.
        let empty = Interval::point(2);
        assert!(!empty.overlaps(&a));
        assert!(!empty.overlaps(&empty));
    }

    #[test]
    fn with_point_helpers_return_copies() {
        let iv = Interval::span(2, 6);
        assert_eq!(iv.with_start(4), Interval::span(4, 6));
        assert_eq!(iv.with_end(9), Interval::span(2, 9));
        assert_eq!(iv, Interval::span(2, 6));
    }

    #[test]
    fn writes_then_reads_shape_intervals() {
        let v0 = Reg::virt(0);
        let v1 = Reg::virt(1);
        let insts = vec![
            mov(v0, Operand2::Imm(1)),
            mov(v1, Operand2::Imm(2)),
            add(v0, v0, Operand2::reg(v1)),
        ];
        let lv = scan(&insts);
        assert_eq!(lv.intervals[&v0], Interval::span(0, 2));
        assert_eq!(lv.intervals[&v1], Interval::span(1, 2));
        assert_eq!(lv.assign_count[&v0], 2);
        assert_eq!(lv.assign_count[&v1], 1);
    }

    #[test]
    fn stores_read_their_source() {
        let v0 = Reg::virt(0);
        let insts = vec![
            mov(v0, Operand2::Imm(1)),
            Inst::store(v0, MemoryOperand::sp_offset(8), Always),
        ];
        let lv = scan(&insts);
        assert_eq!(lv.intervals[&v0], Interval::span(0, 1));
        assert_eq!(lv.intervals[&crate::arm::REG_SP], Interval::point(1));
    }

    #[test]
    fn affinity_only_for_plain_physical_moves() {
        let r0 = Reg::gp(0);
        let r4 = Reg::gp(4);
        let v0 = Reg::virt(0);
        let shifted = Operand2::Reg(RegisterOperand {
            reg: r0,
            shift: crate::arm::ShiftKind::Lsl,
            shift_amount: 2,
        });
        let insts = vec![
            mov(r4, Operand2::reg(r0)),
            mov(r4, shifted),
            mov(v0, Operand2::reg(r0)),
            mov(r4, Operand2::reg(v0)),
        ];
        let lv = scan(&insts);
        assert_eq!(lv.affinities.len(), 1);
        assert_eq!(lv.affinities[&r4], r0);
    }

    #[test]
    fn call_sites_and_block_starts_are_recorded() {
        let insts = vec![
            Inst::Label(".bb_main$3".to_string()),
            Inst::Branch {
                op: OpCode::Bl,
                target: "callee".to_string(),
                param_cnt: 1,
                cond: Always,
            },
            Inst::Label(".bb_main$4".to_string()),
            Inst::Label(".bb_broken".to_string()),
            Inst::Label(".ld_pc_0".to_string()),
        ];
        let lv = scan(&insts);
        assert!(lv.call_points.contains(&1));
        assert_eq!(lv.block_starts.get(&0), Some(&3));
        assert_eq!(lv.block_starts.get(&2), Some(&4));
        // The malformed `.bb_` label warns and is skipped; other labels are
        // opaque.
        assert_eq!(lv.block_starts.len(), 2);
    }
}
