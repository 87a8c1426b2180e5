//! The allocator core: assignment construction from the graph-coloring
//! result, affinity collapse, the linear-scan rewrite of the instruction
//! stream, and frame finalization.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::analysis::{self, Interval};
use crate::arm::{
    ConditionCode, CtrlOp, Function, Inst, Mem, MemOffset, MemoryOperand, OpCode, Operand2, Reg,
    GLOB_REGS, REG_FP, REG_LR, REG_SCRATCH, REG_SP, TEMP_REGS,
};
use crate::interface::{ColorMap, Map, RegAllocError, Set, VregMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Phys,
    Graph,
    Spill,
    Transient,
}

/// Outcome of resolving a write operand before the instruction is emitted;
/// consumed again for post-write bookkeeping once it has been.
#[derive(Clone, Copy, Debug)]
struct WriteAction {
    from: Reg,
    replace_with: Reg,
    kind: WriteKind,
}

struct Allocator<'a> {
    f: &'a mut Function,
    colors: &'a ColorMap,
    vregs: &'a VregMap,

    // Results of the liveness scan.
    live_intervals: Map<Reg, Interval>,
    assign_count: Map<Reg, u32>,
    affinities: Map<Reg, Reg>,
    call_points: BTreeSet<u32>,
    block_starts: BTreeMap<u32, u32>,

    // The graph-coloring assignment.
    reg_map: Map<Reg, Reg>,
    reg_reverse_map: Map<Reg, SmallVec<[Reg; 4]>>,
    spilled_cross_block: Set<Reg>,
    collapse: Map<Reg, Reg>,

    // Linear-scan state, mutated at every rewrite step.
    active: Map<Reg, Interval>,
    active_bindings: VecDeque<(Reg, Reg)>,
    spilled_regs: Map<Reg, Interval>,
    spill_positions: Map<Reg, u32>,
    used_globals: BTreeSet<Reg>,
    used_temps: BTreeSet<Reg>,
    wrote_to: Set<Reg>,
    delayed_store: Option<(Reg, Reg)>,
    inst_sink: Vec<Inst>,

    stack_size: u32,
    stack_offset: i32,
    cur_cond: ConditionCode,
    bb_reset: bool,
    is_leaf_func: bool,
}

pub(crate) fn run(
    f: &mut Function,
    colors: &ColorMap,
    vregs: &VregMap,
) -> Result<(), RegAllocError> {
    let mut alloc = Allocator::new(f, colors, vregs);
    alloc.construct_reg_map();
    alloc.scan_liveness();
    alloc.collapse_affinities();
    alloc.rewrite()?;
    alloc.finalize_frame();
    alloc.f.stack_size = alloc.stack_size;
    Ok(())
}

impl<'a> Allocator<'a> {
    fn new(f: &'a mut Function, colors: &'a ColorMap, vregs: &'a VregMap) -> Allocator<'a> {
        let stack_size = f.stack_size;
        Allocator {
            f,
            colors,
            vregs,
            live_intervals: Map::default(),
            assign_count: Map::default(),
            affinities: Map::default(),
            call_points: BTreeSet::new(),
            block_starts: BTreeMap::new(),
            reg_map: Map::default(),
            reg_reverse_map: Map::default(),
            spilled_cross_block: Set::default(),
            collapse: Map::default(),
            active: Map::default(),
            active_bindings: VecDeque::new(),
            spilled_regs: Map::default(),
            spill_positions: Map::default(),
            used_globals: BTreeSet::new(),
            used_temps: BTreeSet::new(),
            wrote_to: Set::default(),
            delayed_store: None,
            inst_sink: Vec::new(),
            stack_size,
            stack_offset: 0,
            cur_cond: ConditionCode::Always,
            bb_reset: true,
            is_leaf_func: true,
        }
    }

    /// Binds every graph-colored virtual to its callee-saved register and
    /// reserves a stack slot for every virtual the coloring pass spilled.
    fn construct_reg_map(&mut self) {
        for (&var, &vreg) in self.vregs.iter() {
            match self.colors.get(&var) {
                Some(&color) if color != -1 => {
                    let phys = GLOB_REGS[color as usize];
                    self.reg_map.insert(vreg, phys);
                    self.reg_reverse_map.entry(phys).or_default().push(vreg);
                    self.used_globals.insert(phys);
                    trace!("${} <- {:?} <- {:?}", var, vreg, phys);
                }
                Some(_) => {
                    self.spill_positions.insert(vreg, self.stack_size);
                    trace!("${} <- {:?} <- sp + {}", var, vreg, self.stack_size);
                    self.stack_size += 4;
                    self.spilled_cross_block.insert(vreg);
                }
                None => {
                    trace!("${} <- {:?} <- local", var, vreg);
                }
            }
        }
    }

    fn scan_liveness(&mut self) {
        let lv = analysis::scan(&self.f.inst);
        self.live_intervals = lv.intervals;
        self.assign_count = lv.assign_count;
        self.affinities = lv.affinities;
        self.call_points = lv.call_points;
        self.block_starts = lv.block_starts;
        for (pt, bb) in self.block_starts.iter() {
            trace!("block start {} -> bb{}", pt, bb);
        }
    }

    /// Follows collapse chains to their representative, compressing the
    /// visited path so repeated lookups are O(1).
    fn resolve_collapse(&mut self, r: Reg) -> Reg {
        let mut root = r;
        while let Some(&next) = self.collapse.get(&root) {
            root = next;
        }
        let mut cur = r;
        while cur != root {
            match self.collapse.insert(cur, root) {
                Some(next) => cur = next,
                None => break,
            }
        }
        root
    }

    /// Fuses register pairs connected by a no-op copy when their allocation
    /// states are compatible and their live ranges do not overlap.
    fn collapse_affinities(&mut self) {
        let pairs: Vec<(Reg, Reg)> =
            self.affinities.iter().map(|(&dst, &src)| (dst, src)).collect();
        for (dst, src) in pairs {
            let src_mapped = self.reg_map.get(&src).copied();
            let dst_mapped = self.reg_map.get(&dst).copied();
            if src_mapped.is_some()
                && dst_mapped.is_none()
                && !self.spilled_cross_block.contains(&dst)
                && self.assign_count.get(&dst).copied() == Some(1)
            {
                let phys = src_mapped.unwrap_or(src);
                let li_dst = self.live_intervals[&dst];
                if !self.colored_siblings_overlap(phys, src, li_dst) {
                    trace!("collapse {:?} -> {:?}", dst, src);
                    self.collapse.insert(dst, src);
                }
            } else if dst_mapped.is_some()
                && src_mapped.is_none()
                && !self.spilled_cross_block.contains(&src)
                && self.assign_count.get(&src).copied() == Some(1)
            {
                let phys = dst_mapped.unwrap_or(dst);
                let li_src = self.live_intervals[&src];
                if !self.colored_siblings_overlap(phys, src, li_src) {
                    trace!("collapse {:?} -> {:?}", src, dst);
                    self.collapse.insert(src, dst);
                }
            } else if src_mapped.is_none()
                && dst_mapped.is_none()
                && !self.spilled_cross_block.contains(&src)
                && !self.spilled_cross_block.contains(&dst)
            {
                // Both are transients; fuse them when their lifetimes are
                // disjoint.
                let src_root = self.resolve_collapse(src);
                let dst_root = self.resolve_collapse(dst);
                if src_root == dst_root {
                    continue;
                }
                let li_src = self.live_intervals[&src_root];
                let li_dst = self.live_intervals[&dst_root];
                if !li_src.overlaps(&li_dst) {
                    let merged = self.live_intervals.get_mut(&src_root);
                    if let Some(iv) = merged {
                        iv.extend_start(li_dst.start);
                        iv.extend_end(li_dst.end);
                    }
                    trace!("collapse {:?} -> {:?}", dst_root, src_root);
                    self.collapse.insert(dst_root, src_root);
                }
            }
        }
    }

    /// True if any other virtual colored to `phys` is live during `interval`.
    fn colored_siblings_overlap(&self, phys: Reg, skip: Reg, interval: Interval) -> bool {
        match self.reg_reverse_map.get(&phys) {
            Some(siblings) => siblings.iter().any(|&vr| {
                vr != skip && self.live_intervals[&vr].overlaps(&interval)
            }),
            None => false,
        }
    }

    fn spill_slot(&mut self, r: Reg) -> u32 {
        if let Some(&pos) = self.spill_positions.get(&r) {
            return pos;
        }
        let pos = self.stack_size;
        self.stack_size += 4;
        self.spill_positions.insert(r, pos);
        pos
    }

    fn pick_temp(&self) -> Option<Reg> {
        TEMP_REGS.iter().copied().find(|r| !self.active.contains_key(r))
    }

    fn pick_glob(&self) -> Option<Reg> {
        GLOB_REGS
            .iter()
            .copied()
            .find(|r| !self.active.contains_key(r) && !self.used_globals.contains(r))
    }

    /// Selects a physical register for a transient value living through
    /// `interval`. Prefers the binding `orig` already holds; otherwise picks
    /// a free register (callee-saved first when the interval crosses a call,
    /// so the value survives it), and as a last resort evicts the oldest
    /// binding.
    fn alloc_transient(
        &mut self,
        interval: Interval,
        orig: Option<Reg>,
    ) -> Result<Reg, RegAllocError> {
        if let Some(orig) = orig {
            if let Some(ix) = self.active_bindings.iter().position(|&(v, _)| v == orig) {
                let entry = self.active_bindings[ix];
                let _ = self.active_bindings.remove(ix);
                self.active_bindings.push_back(entry);
                trace!("orig {:?} kept in {:?}", orig, entry.1);
                return Ok(entry.1);
            }
        }

        let crosses_call = self
            .call_points
            .range(interval.start..=interval.end)
            .next()
            .is_some();
        let mut chosen = None;
        if crosses_call {
            if let Some(r) = self.pick_glob() {
                self.used_temps.insert(r);
                chosen = Some(r);
            }
            if chosen.is_none() {
                chosen = self.pick_temp();
            }
        } else {
            chosen = self.pick_temp();
            if chosen.is_none() {
                if let Some(r) = self.pick_glob() {
                    self.used_temps.insert(r);
                    chosen = Some(r);
                }
            }
        }

        let r = match chosen {
            Some(r) => r,
            None => self.evict_oldest(interval, orig)?,
        };
        self.active.insert(r, interval);
        if let Some(orig) = orig {
            self.active_bindings.push_back((orig, r));
        }
        trace!("-> {:?}", r);
        trace!("active: {:?}; map: {:?}", self.active, self.active_bindings);
        Ok(r)
    }

    /// Evicts the oldest binding, storing its value back to its spill slot,
    /// and hands out the freed register.
    fn evict_oldest(
        &mut self,
        interval: Interval,
        orig: Option<Reg>,
    ) -> Result<Reg, RegAllocError> {
        let (victim_virt, victim_phys) = match self.active_bindings.pop_front() {
            Some(pair) => pair,
            None => {
                let mut dump: Vec<(Reg, Interval)> =
                    self.active.iter().map(|(&r, &iv)| (r, iv)).collect();
                dump.sort_by_key(|&(r, _)| r);
                return Err(RegAllocError::OutOfRegisters { active: dump });
            }
        };
        let spilled = self.active[&victim_phys].with_start(interval.start);
        let pos = self.spill_slot(victim_virt);
        self.inst_sink.push(Inst::store(
            victim_phys,
            MemoryOperand::sp_offset(pos as i32 + self.stack_offset),
            self.cur_cond,
        ));
        trace!("spilling {:?} -> {:?} -> {}", victim_phys, victim_virt, pos);
        self.spilled_regs.insert(victim_virt, spilled);
        if let Some(orig) = orig {
            if let Some(ix) = self.active_bindings.iter().position(|&(v, _)| v == orig) {
                let _ = self.active_bindings.remove(ix);
            }
        }
        self.active.remove(&victim_phys);
        Ok(victim_phys)
    }

    /// Drops every active entry whose value cannot be read at or after `pos`.
    fn invalidate_expired(&mut self, pos: u32) {
        let expired: Vec<Reg> = self
            .active
            .iter()
            .filter(|&(_, iv)| iv.end <= pos)
            .map(|(&r, _)| r)
            .collect();
        if expired.is_empty() {
            return;
        }
        debug!("invalidating {:?}", expired);
        for phys in expired {
            self.active.remove(&phys);
            if let Some(ix) = self.active_bindings.iter().position(|&(_, p)| p == phys) {
                let _ = self.active_bindings.remove(ix);
            }
        }
    }

    /// Frees `r` by storing the value bound to it back to its spill slot.
    /// A physical with an active entry but no binding is owned by an explicit
    /// write and is left in place.
    fn force_free(&mut self, r: Reg, erase_binding: bool, write_back: bool) {
        let interval = match self.active.get(&r) {
            Some(&iv) => iv,
            None => {
                trace!("{:?} (not using)", r);
                return;
            }
        };
        match self.active_bindings.iter().position(|&(_, p)| p == r) {
            Some(ix) => {
                let (virt, _) = self.active_bindings[ix];
                let pos = self.spill_slot(virt);
                if write_back {
                    self.inst_sink.push(Inst::store(
                        r,
                        MemoryOperand::sp_offset(pos as i32 + self.stack_offset),
                        self.cur_cond,
                    ));
                }
                self.spilled_regs.insert(virt, interval);
                trace!("{:?}: {:?} @ {}", r, virt, pos as i32 + self.stack_offset);
                self.active.remove(&r);
                if erase_binding {
                    let _ = self.active_bindings.remove(ix);
                }
            }
            None => trace!("{:?}: no binding in active", r),
        }
    }

    /// Rewrites a read operand in place so it names a physical register,
    /// reloading from the spill slot when the value has been evicted.
    fn replace_read_reg(&mut self, r: &mut Reg, at: u32) -> Result<(), RegAllocError> {
        *r = self.resolve_collapse(*r);
        if !r.is_virtual() {
            trace!("{:?} at {}: phys", r, at);
            return Ok(());
        }
        if let Some(&phys) = self.reg_map.get(r) {
            trace!("{:?} at {}: graph {:?}", r, at, phys);
            *r = phys;
            return Ok(());
        }
        if let Some(&spilled) = self.spilled_regs.get(r) {
            let virt = *r;
            let pos = self.spill_slot(virt);
            let interval = spilled.with_start(at);
            self.spilled_regs.remove(&virt);
            let rd = self.alloc_transient(interval, Some(virt))?;

            let mem = MemoryOperand::sp_offset(pos as i32 + self.stack_offset);
            let cur_cond = self.cur_cond;
            let elide = matches!(
                self.inst_sink.last(),
                Some(Inst::LoadStore { op: OpCode::StR, rd: prev_rd, mem: Mem::Offset(prev_mem), cond })
                    if *prev_rd == rd && *prev_mem == mem && *cond == cur_cond
            );
            if elide {
                self.inst_sink.pop();
                self.delayed_store = Some((virt, rd));
            } else {
                self.inst_sink.push(Inst::load(rd, mem, cur_cond));
            }
            trace!("{:?} at {}: spill {} with rd={:?}", virt, at, pos, rd);
            *r = rd;
            return Ok(());
        }
        let virt = *r;
        let interval = self.live_intervals[&virt];
        *r = self.alloc_transient(interval, Some(virt))?;
        trace!("{:?} at {}: transient {:?}", virt, at, r);
        Ok(())
    }

    fn replace_read_op2(&mut self, op: &mut Operand2, at: u32) -> Result<(), RegAllocError> {
        if let Operand2::Reg(ro) = op {
            self.replace_read_reg(&mut ro.reg, at)?;
        }
        Ok(())
    }

    fn replace_read_mem(&mut self, mem: &mut MemoryOperand, at: u32) -> Result<(), RegAllocError> {
        self.replace_read_reg(&mut mem.base, at)?;
        if let MemOffset::Reg(ro) = &mut mem.offset {
            self.replace_read_reg(&mut ro.reg, at)?;
        }
        Ok(())
    }

    /// Resolves a write operand to a physical register before the
    /// instruction is emitted. Cross-block values get their store-back
    /// recorded by [`Allocator::apply_write`] once the instruction is out.
    fn pre_replace_write(
        &mut self,
        r: &mut Reg,
        at: u32,
        pre_alloc: Option<Reg>,
    ) -> Result<WriteAction, RegAllocError> {
        *r = self.resolve_collapse(*r);
        let orig = *r;
        if !r.is_virtual() {
            // An explicit physical write claims the register outright.
            self.force_free(*r, true, true);
            return Ok(WriteAction { from: orig, replace_with: orig, kind: WriteKind::Phys });
        }
        if let Some(&phys) = self.reg_map.get(r) {
            *r = phys;
            return Ok(WriteAction { from: orig, replace_with: phys, kind: WriteKind::Graph });
        }
        if self.spilled_cross_block.contains(r) {
            let rd = match pre_alloc {
                Some(p) => p,
                None => {
                    match self.active_bindings.iter().position(|&(v, _)| v == orig) {
                        Some(ix) => {
                            let entry = self.active_bindings[ix];
                            let _ = self.active_bindings.remove(ix);
                            self.active_bindings.push_back(entry);
                            entry.1
                        }
                        None => {
                            let interval = self.live_intervals[&orig].with_start(at);
                            self.alloc_transient(interval, Some(orig))?
                        }
                    }
                }
            };
            *r = rd;
            trace!("{:?} at {}: to be spilled", orig, at);
            return Ok(WriteAction { from: orig, replace_with: rd, kind: WriteKind::Spill });
        }
        if let Some(&spilled) = self.spilled_regs.get(r) {
            let pos = self.spill_slot(orig);
            let interval = spilled.with_start(at);
            self.spilled_regs.remove(&orig);
            let rd = match pre_alloc {
                Some(p) => p,
                None => self.alloc_transient(interval, Some(orig))?,
            };
            *r = rd;
            trace!("{:?} at {}: spill {}", orig, at, pos);
            return Ok(WriteAction { from: orig, replace_with: rd, kind: WriteKind::Spill });
        }
        let interval = self.live_intervals[&orig];
        let rd = self.alloc_transient(interval, Some(orig))?;
        *r = rd;
        Ok(WriteAction { from: orig, replace_with: rd, kind: WriteKind::Transient })
    }

    /// Post-write bookkeeping, run after the rewritten instruction has been
    /// emitted: physical writes occupy their register until invalidated, and
    /// cross-block writes are stored back to their slot immediately (unless
    /// the preceding emitted instruction already is that exact store).
    fn apply_write(&mut self, action: WriteAction, at: u32) {
        match action.kind {
            WriteKind::Phys => {
                self.active.insert(action.replace_with, Interval::span(at, u32::MAX));
                trace!("{:?} at {}: phys {:?}", action.from, at, action.replace_with);
            }
            WriteKind::Graph => {
                trace!("{:?} at {}: graph", action.from, at);
            }
            WriteKind::Spill => {
                let rd = action.replace_with;
                let pos = self.spill_slot(action.from);
                let mem = MemoryOperand::sp_offset(pos as i32 + self.stack_offset);
                let cur_cond = self.cur_cond;
                let redundant = matches!(
                    self.inst_sink.last(),
                    Some(Inst::LoadStore { op: OpCode::StR, rd: prev_rd, mem: Mem::Offset(prev_mem), cond })
                        if *prev_rd == rd && *prev_mem == mem && *cond == cur_cond
                );
                if !redundant {
                    self.inst_sink.push(Inst::store(rd, mem, cur_cond));
                }
                self.wrote_to.remove(&action.from);
                trace!("{:?} at {}: spill {} (elided: {})", action.from, at, pos, redundant);
            }
            WriteKind::Transient => {
                trace!("{:?} at {}: temp", action.from, at);
            }
        }
    }

    /// The second linear pass: rewrites every instruction operand-by-operand
    /// into the sink, then swaps the sink in as the function body.
    fn rewrite(&mut self) -> Result<(), RegAllocError> {
        let insts = mem::take(&mut self.f.inst);
        self.inst_sink = Vec::with_capacity(insts.len());
        for (i, inst) in insts.into_iter().enumerate() {
            let at = i as u32;
            self.cur_cond = inst.cond();
            trace!("rewriting {:?}", inst);
            match inst {
                Inst::Arith3 { op, mut rd, mut r1, mut r2, cond } => {
                    self.replace_read_reg(&mut r1, at)?;
                    self.replace_read_op2(&mut r2, at)?;
                    self.invalidate_expired(at);
                    self.wrote_to.insert(rd);
                    let action = self.pre_replace_write(&mut rd, at, None)?;
                    self.inst_sink.push(Inst::Arith3 { op, rd, r1, r2, cond });
                    self.apply_write(action, at);
                }
                Inst::Arith4 { op, mut rd, mut r1, mut r2, mut r3, cond } => {
                    self.replace_read_reg(&mut r1, at)?;
                    self.replace_read_reg(&mut r2, at)?;
                    self.replace_read_reg(&mut r3, at)?;
                    self.invalidate_expired(at);
                    self.wrote_to.insert(rd);
                    let action = self.pre_replace_write(&mut rd, at, None)?;
                    self.inst_sink.push(Inst::Arith4 { op, rd, r1, r2, r3, cond });
                    self.apply_write(action, at);
                }
                Inst::Arith2 { op, mut r1, mut r2, cond } => match op {
                    OpCode::Mov | OpCode::Mvn => {
                        self.replace_read_op2(&mut r2, at)?;
                        self.invalidate_expired(at);
                        self.wrote_to.insert(r1);
                        let action = self.pre_replace_write(&mut r1, at, None)?;
                        self.inst_sink.push(Inst::Arith2 { op, r1, r2, cond });
                        self.apply_write(action, at);
                    }
                    OpCode::MovT => {
                        // MOVT modifies r1: resolve it as a read first, then
                        // route the write through the same register.
                        let orig = r1;
                        self.replace_read_reg(&mut r1, at)?;
                        self.invalidate_expired(at);
                        self.wrote_to.insert(r1);
                        let mut w = orig;
                        let action = self.pre_replace_write(&mut w, at, Some(r1))?;
                        self.inst_sink.push(Inst::Arith2 { op, r1, r2, cond });
                        self.apply_write(action, at);
                    }
                    _ => {
                        self.replace_read_reg(&mut r1, at)?;
                        self.replace_read_op2(&mut r2, at)?;
                        self.invalidate_expired(at);
                        self.inst_sink.push(Inst::Arith2 { op, r1, r2, cond });
                    }
                },
                Inst::LoadStore { op, mut rd, mut mem, cond } => {
                    if let Mem::Offset(m) = &mut mem {
                        self.replace_read_mem(m, at)?;
                    }
                    if op == OpCode::LdR {
                        self.invalidate_expired(at);
                        self.wrote_to.insert(rd);
                        let action = self.pre_replace_write(&mut rd, at, None)?;
                        self.inst_sink.push(Inst::LoadStore { op, rd, mem, cond });
                        self.apply_write(action, at);
                    } else {
                        self.replace_read_reg(&mut rd, at)?;
                        self.invalidate_expired(at);
                        self.inst_sink.push(Inst::LoadStore { op, rd, mem, cond });
                    }
                }
                Inst::MultLoadStore { .. } => {
                    return Err(RegAllocError::NotImplemented(
                        "multi-register load/store in the rewrite pass",
                    ));
                }
                Inst::PushPop { .. } | Inst::Pure { .. } => {
                    self.invalidate_expired(at);
                    self.inst_sink.push(inst);
                }
                Inst::Label(label) => {
                    self.invalidate_expired(at);
                    let is_ld_pc = label.starts_with(".ld_pc");
                    let is_bb = label.starts_with(".bb");
                    self.inst_sink.push(Inst::Label(label));
                    if is_ld_pc {
                        // Keep the literal load next to its anchor label.
                        let n = self.inst_sink.len();
                        if n >= 2 && matches!(self.inst_sink[n - 2], Inst::LoadStore { .. }) {
                            self.inst_sink.swap(n - 2, n - 1);
                        }
                    }
                    if is_bb {
                        self.bb_reset = true;
                    }
                }
                Inst::Branch { op, target, param_cnt, cond } => {
                    self.invalidate_expired(at);
                    match op {
                        OpCode::Bl => {
                            self.is_leaf_func = false;
                            let reg_cnt = param_cnt.min(4);
                            // Argument registers are consumed by the call and
                            // need no store-back.
                            for n in 0..reg_cnt {
                                self.active.remove(&Reg::gp(n as u32));
                            }
                            for n in reg_cnt..4 {
                                self.force_free(Reg::gp(n as u32), true, true);
                            }
                            self.force_free(REG_SCRATCH, true, true);
                            self.force_free(REG_LR, true, true);
                            self.inst_sink.push(Inst::Branch { op, target, param_cnt, cond });
                            for r in TEMP_REGS.iter() {
                                self.active.remove(r);
                            }
                            self.active.remove(&REG_SCRATCH);
                            self.active.remove(&REG_LR);
                        }
                        OpCode::B => {
                            if self.bb_reset {
                                self.block_boundary_reset();
                            }
                            self.inst_sink.push(Inst::Branch { op, target, param_cnt, cond });
                        }
                        _ => {
                            self.inst_sink.push(Inst::Branch { op, target, param_cnt, cond });
                        }
                    }
                }
                Inst::Ctrl { op, cond } => {
                    let CtrlOp::StackOffset(delta) = op;
                    self.stack_offset += delta;
                    self.invalidate_expired(at);
                    self.inst_sink.push(Inst::Ctrl { op, cond });
                }
            }
            if let Some((virt, rd)) = self.delayed_store.take() {
                self.apply_write(
                    WriteAction { from: virt, replace_with: rd, kind: WriteKind::Spill },
                    at,
                );
            }
        }
        if self.is_leaf_func {
            trace!("{}: leaf function, no call sites emitted", self.f.name);
        }
        self.f.inst = mem::take(&mut self.inst_sink);
        Ok(())
    }

    /// Evicts cross-block values at the end of a basic block, storing back
    /// only the ones whose binding still carries an unflushed write.
    fn block_boundary_reset(&mut self) {
        let mut ix = 0;
        while ix < self.active_bindings.len() {
            let (virt, phys) = self.active_bindings[ix];
            if self.spilled_cross_block.contains(&virt) {
                let write_back = self.wrote_to.contains(&virt);
                self.force_free(phys, false, write_back);
                self.active.remove(&phys);
                let _ = self.active_bindings.remove(ix);
            } else {
                ix += 1;
            }
        }
        self.wrote_to.clear();
        self.bb_reset = false;
    }

    fn is_fp_save(inst: &Inst) -> bool {
        matches!(
            inst,
            Inst::Arith2 { op: OpCode::Mov, r1, r2: Operand2::Reg(ro), .. }
                if *r1 == REG_FP && ro.reg == REG_SP
        )
    }

    fn is_fp_restore(inst: &Inst) -> bool {
        matches!(
            inst,
            Inst::Arith2 { op: OpCode::Mov, r1, r2: Operand2::Reg(ro), .. }
                if *r1 == REG_SP && ro.reg == REG_FP
        )
    }

    /// Sets the final push/pop register lists, inserts the stack-pointer
    /// adjustment, and deletes the frame-pointer bookkeeping when the
    /// function neither spills nor takes stack parameters.
    fn finalize_frame(&mut self) {
        let used: Vec<Reg> = self
            .used_globals
            .iter()
            .chain(self.used_temps.iter())
            .copied()
            .collect();
        if let Some(Inst::PushPop { regs, .. }) = self.f.inst.first_mut() {
            regs.extend(used.iter().copied());
        }
        if let Some(Inst::PushPop { regs, .. }) = self.f.inst.last_mut() {
            regs.extend(used.iter().copied());
        }

        let use_stack_param = self.f.param_count > 4;
        let offset_size = match self.f.inst.first() {
            Some(Inst::PushPop { regs, .. }) => regs.len() as i32 * 4,
            _ => 0,
        };

        if !use_stack_param && self.stack_size == 0 {
            if let Some(Inst::PushPop { regs, .. }) = self.f.inst.first_mut() {
                regs.remove(&REG_FP);
            }
            if let Some(Inst::PushPop { regs, .. }) = self.f.inst.last_mut() {
                regs.remove(&REG_FP);
            }
        }

        if use_stack_param {
            // FP must skip the push area to address incoming stack arguments.
            self.f.inst.insert(
                2,
                Inst::Arith3 {
                    op: OpCode::Add,
                    rd: REG_FP,
                    r1: REG_FP,
                    r2: Operand2::Imm(offset_size),
                    cond: ConditionCode::Always,
                },
            );
        }

        if self.stack_size == 0 {
            if !use_stack_param
                && self.f.inst.get(1).map_or(false, Self::is_fp_save)
            {
                self.f.inst.remove(1);
            }
        } else if self.stack_size < 1024 {
            self.f.inst.insert(
                2,
                Inst::Arith3 {
                    op: OpCode::Sub,
                    rd: REG_SP,
                    r1: REG_SP,
                    r2: Operand2::Imm(self.stack_size as i32),
                    cond: ConditionCode::Always,
                },
            );
        } else {
            // Too large for an immediate operand; go through the scratch
            // register.
            self.f.inst.insert(
                2,
                Inst::Arith2 {
                    op: OpCode::Mov,
                    r1: REG_SCRATCH,
                    r2: Operand2::Imm(self.stack_size as i32),
                    cond: ConditionCode::Always,
                },
            );
            self.f.inst.insert(
                3,
                Inst::Arith3 {
                    op: OpCode::Sub,
                    rd: REG_SP,
                    r1: REG_SP,
                    r2: Operand2::reg(REG_SCRATCH),
                    cond: ConditionCode::Always,
                },
            );
        }

        if !use_stack_param && self.stack_size == 0 {
            let n = self.f.inst.len();
            if n >= 2 && Self::is_fp_restore(&self.f.inst[n - 2]) {
                self.f.inst.remove(n - 2);
            }
        }

        if use_stack_param {
            let n = self.f.inst.len();
            self.f.inst.insert(
                n - 2,
                Inst::Arith3 {
                    op: OpCode::Sub,
                    rd: REG_FP,
                    r1: REG_FP,
                    r2: Operand2::Imm(offset_size),
                    cond: ConditionCode::Always,
                },
            );
        }

        if matches!(self.f.inst.first(), Some(Inst::PushPop { regs, .. }) if regs.is_empty()) {
            self.f.inst.remove(0);
        }
        if matches!(self.f.inst.last(), Some(Inst::PushPop { regs, .. }) if regs.is_empty()) {
            let n = self.f.inst.len();
            self.f.inst.remove(n - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ConditionCode::Always;

    fn empty_function() -> Function {
        Function { name: "f".to_string(), param_count: 0, stack_size: 0, inst: Vec::new() }
    }

    fn allocator<'a>(
        f: &'a mut Function,
        colors: &'a ColorMap,
        vregs: &'a VregMap,
    ) -> Allocator<'a> {
        Allocator::new(f, colors, vregs)
    }

    #[test]
    fn collapse_into_graph_assigned_source() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v_src = Reg::virt(0);
        let v_dst = Reg::virt(1);
        a.reg_map.insert(v_src, Reg::gp(4));
        a.reg_reverse_map.entry(Reg::gp(4)).or_default().push(v_src);
        a.live_intervals.insert(v_src, Interval::span(0, 2));
        a.live_intervals.insert(v_dst, Interval::span(3, 5));
        a.assign_count.insert(v_dst, 1);
        a.affinities.insert(v_dst, v_src);

        a.collapse_affinities();
        assert_eq!(a.collapse.get(&v_dst), Some(&v_src));
        assert_eq!(a.resolve_collapse(v_dst), v_src);
    }

    #[test]
    fn collapse_blocked_by_overlapping_sibling() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v_src = Reg::virt(0);
        let v_dst = Reg::virt(1);
        let v_other = Reg::virt(2);
        a.reg_map.insert(v_src, Reg::gp(4));
        a.reg_map.insert(v_other, Reg::gp(4));
        a.reg_reverse_map.entry(Reg::gp(4)).or_default().push(v_src);
        a.reg_reverse_map.entry(Reg::gp(4)).or_default().push(v_other);
        a.live_intervals.insert(v_src, Interval::span(0, 2));
        a.live_intervals.insert(v_other, Interval::span(3, 6));
        a.live_intervals.insert(v_dst, Interval::span(4, 5));
        a.assign_count.insert(v_dst, 1);
        a.affinities.insert(v_dst, v_src);

        a.collapse_affinities();
        assert!(a.collapse.is_empty());
    }

    #[test]
    fn collapse_into_graph_assigned_destination() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v_dst = Reg::virt(0);
        let v_src = Reg::virt(1);
        a.reg_map.insert(v_dst, Reg::gp(5));
        a.reg_reverse_map.entry(Reg::gp(5)).or_default().push(v_dst);
        a.live_intervals.insert(v_dst, Interval::span(0, 2));
        a.live_intervals.insert(v_src, Interval::span(3, 5));
        a.assign_count.insert(v_src, 1);
        a.affinities.insert(v_dst, v_src);

        a.collapse_affinities();
        assert_eq!(a.collapse.get(&v_src), Some(&v_dst));
    }

    #[test]
    fn collapse_fuses_disjoint_transients() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v_src = Reg::virt(0);
        let v_dst = Reg::virt(1);
        a.live_intervals.insert(v_src, Interval::span(0, 3));
        a.live_intervals.insert(v_dst, Interval::span(4, 8));
        a.affinities.insert(v_dst, v_src);

        a.collapse_affinities();
        assert_eq!(a.collapse.get(&v_dst), Some(&v_src));
        // The survivor's interval now covers both lifetimes.
        assert_eq!(a.live_intervals[&v_src], Interval::span(0, 8));
    }

    #[test]
    fn resolve_collapse_is_idempotent_and_compresses() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let (v0, v1, v2) = (Reg::virt(0), Reg::virt(1), Reg::virt(2));
        a.collapse.insert(v0, v1);
        a.collapse.insert(v1, v2);

        let once = a.resolve_collapse(v0);
        assert_eq!(once, v2);
        // The chain is now compressed to point straight at the root.
        assert_eq!(a.collapse.get(&v0), Some(&v2));
        assert_eq!(a.resolve_collapse(once), once);
        assert_eq!(a.resolve_collapse(v0), once);
    }

    #[test]
    fn reload_after_matching_store_becomes_delayed() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v = Reg::virt(0);
        a.spill_positions.insert(v, 0);
        a.spilled_regs.insert(v, Interval::span(0, 6));
        a.inst_sink.push(Inst::store(Reg::gp(0), MemoryOperand::sp_offset(0), Always));

        let mut r = v;
        a.replace_read_reg(&mut r, 3).unwrap();
        assert_eq!(r, Reg::gp(0));
        assert!(a.inst_sink.is_empty());
        assert_eq!(a.delayed_store, Some((v, Reg::gp(0))));

        // Draining the pending store re-emits it.
        let (virt, rd) = a.delayed_store.take().unwrap();
        a.apply_write(WriteAction { from: virt, replace_with: rd, kind: WriteKind::Spill }, 3);
        assert_eq!(
            a.inst_sink,
            vec![Inst::store(Reg::gp(0), MemoryOperand::sp_offset(0), Always)]
        );
    }

    #[test]
    fn mismatched_store_is_not_elided() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        let v = Reg::virt(0);
        a.spill_positions.insert(v, 4);
        a.spilled_regs.insert(v, Interval::span(0, 6));
        // A store to a different slot must not satisfy the reload.
        a.inst_sink.push(Inst::store(Reg::gp(0), MemoryOperand::sp_offset(0), Always));

        let mut r = v;
        a.replace_read_reg(&mut r, 3).unwrap();
        assert_eq!(a.inst_sink.len(), 2);
        assert_eq!(
            a.inst_sink[1],
            Inst::load(Reg::gp(0), MemoryOperand::sp_offset(4), Always)
        );
        assert_eq!(a.delayed_store, None);
    }

    #[test]
    fn transient_allocation_prefers_callee_saved_across_calls() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        a.call_points.insert(5);
        let v = Reg::virt(0);
        let r = a.alloc_transient(Interval::span(4, 7), Some(v)).unwrap();
        assert_eq!(r, Reg::gp(4));
        assert!(a.used_temps.contains(&Reg::gp(4)));

        // A call-free interval takes a caller-saved register instead.
        let w = Reg::virt(1);
        let r = a.alloc_transient(Interval::span(6, 7), Some(w)).unwrap();
        assert_eq!(r, Reg::gp(0));
    }

    #[test]
    fn eviction_picks_the_oldest_binding() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        for n in 0..11 {
            let v = Reg::virt(n);
            a.alloc_transient(Interval::span(0, 20), Some(v)).unwrap();
        }
        assert_eq!(a.active.len(), 11);

        let v_new = Reg::virt(100);
        let r = a.alloc_transient(Interval::span(10, 12), Some(v_new)).unwrap();
        // v0 held r0 and was allocated first, so it is the victim.
        assert_eq!(r, Reg::gp(0));
        assert!(a.spilled_regs.contains_key(&Reg::virt(0)));
        assert_eq!(
            a.inst_sink,
            vec![Inst::store(Reg::gp(0), MemoryOperand::sp_offset(0), Always)]
        );
        assert_eq!(a.spill_positions[&Reg::virt(0)], 0);
        assert_eq!(a.stack_size, 4);
    }

    #[test]
    fn exhaustion_reports_the_active_set() {
        let mut f = empty_function();
        let colors = ColorMap::default();
        let vregs = VregMap::new();
        let mut a = allocator(&mut f, &colors, &vregs);

        // Orphan physicals (explicit writes) occupy everything, leaving no
        // binding to evict.
        for r in TEMP_REGS.iter().chain(GLOB_REGS.iter()) {
            a.active.insert(*r, Interval::span(0, u32::MAX));
        }
        let err = a.alloc_transient(Interval::span(1, 2), Some(Reg::virt(0)));
        match err {
            Err(RegAllocError::OutOfRegisters { active }) => {
                assert_eq!(active.len(), 11);
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
    }
}
