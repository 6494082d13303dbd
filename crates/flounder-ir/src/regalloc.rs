//! Marker-driven register allocation with spill code generation.
//!
//! Every vreg is bracketed by explicit `request`/`clear` markers in the IR.
//! The allocator walks the line list once: at a request it binds the vreg to
//! a free machine register (callee-save preferred) or a spill slot; at a
//! clear it releases the binding; at any other line it substitutes vreg
//! operands in place and surrounds the instruction with spill loads/stores
//! through the reserved rax/rcx/rdx.

use std::collections::{BTreeMap, VecDeque};

use crate::abi::{ALLOCATION_MREGS, CALLER_SAVE_MASK, NUM_ALLOCATION_MREGS, NUM_MREGS, SPILL_LOAD_REGS};
use crate::arena::{IrArena, NodeId, NodeKind};
use crate::asm::Mreg;
use crate::lang::{can_use_memory_operand, instr_reads, instr_writes};

/// Allocation state of all vregs of one query.
///
/// `allocation[i]` is 0 when vreg `i` is unallocated, `m + 1` when bound to
/// machine register `m`, and `-slot` when spilled to stack slot `slot`.
#[derive(Debug)]
pub struct RegisterAllocationState {
    pub allocation: Vec<i32>,
    pub currently_allocated: Vec<bool>,
    pub explicit_alloc: Vec<bool>,
    pub num_mregs_used: usize,
    pub mreg_in_use: [bool; NUM_MREGS],
    /// Spill slots are not reassigned across a query unless freed.
    pub num_spill_slots: i32,
    pub spill_size: usize,
    pub num_spill_access: usize,
    pub allocated_vregs: BTreeMap<u32, NodeId>,
    free_spill_slots: VecDeque<i32>,
}

impl RegisterAllocationState {
    pub fn new(num_vregs: usize) -> Self {
        Self {
            allocation: vec![0; num_vregs],
            currently_allocated: vec![false; num_vregs],
            explicit_alloc: vec![false; num_vregs],
            num_mregs_used: 0,
            mreg_in_use: [false; NUM_MREGS],
            num_spill_slots: 0,
            spill_size: 0,
            num_spill_access: 0,
            allocated_vregs: BTreeMap::new(),
            free_spill_slots: VecDeque::new(),
        }
    }

    fn free_mreg_id(&self) -> usize {
        // prefer callee-save registers to minimize save traffic on calls
        for i in 0..NUM_MREGS {
            if !self.mreg_in_use[i] && ALLOCATION_MREGS[i] && !CALLER_SAVE_MASK[i] {
                return i;
            }
        }
        for i in 0..NUM_MREGS {
            if !self.mreg_in_use[i] && ALLOCATION_MREGS[i] {
                return i;
            }
        }
        unreachable!("no free machine register despite free count");
    }

    pub fn allocate(&mut self, arena: &IrArena, vreg: NodeId) {
        let vid = arena.node(vreg).id as usize;
        if self.num_mregs_used < NUM_ALLOCATION_MREGS {
            self.num_mregs_used += 1;
            let mreg = self.free_mreg_id();
            self.allocation[vid] = mreg as i32 + 1;
            self.mreg_in_use[mreg] = true;
            tracing::trace!(vreg = vid, mreg, "allocated");
        } else {
            let slot = match self.free_spill_slots.pop_front() {
                Some(slot) => slot,
                None => {
                    self.num_spill_slots += 1;
                    -self.num_spill_slots
                }
            };
            self.allocation[vid] = slot;
            self.spill_size += arena.vreg_byte_size(vreg);
            tracing::trace!(vreg = vid, slot = -slot, "spilled");
        }
        self.currently_allocated[vid] = true;
    }

    pub fn free(&mut self, arena: &IrArena, vreg: NodeId) {
        let vid = arena.node(vreg).id as usize;
        let alloc = self.allocation[vid];
        if alloc > 0 {
            self.mreg_in_use[(alloc - 1) as usize] = false;
            self.num_mregs_used -= 1;
        }
        if alloc < 0 {
            self.free_spill_slots.push_back(alloc);
        }
        self.allocation[vid] = 0;
        self.currently_allocated[vid] = false;
    }

    fn allocated_machine_register(&self, arena: &mut IrArena, vreg: NodeId) -> NodeId {
        let id = (self.allocation[arena.node(vreg).id as usize] - 1) as u8;
        match arena.node(vreg).kind {
            NodeKind::Vreg8 => arena.reg8(id),
            NodeKind::Vreg32 => arena.reg32(id),
            NodeKind::Vreg64 => arena.reg64(id),
            other => panic!("machine register for {other:?}"),
        }
    }
}

/// One spilled operand of the current instruction: the expression node
/// (vreg or const-load), its immediate parent, its spill slot, and the
/// operand position within the parent.
#[derive(Debug, Clone, Copy)]
struct SpillAccess {
    expr: NodeId,
    parent: NodeId,
    spill_id: i32,
    param_idx: usize,
}

/// Spill loads and stores of one instruction. At most 3 operands can be
/// spilled simultaneously (7 for managed calls).
#[derive(Debug, Default)]
struct SpillAccessStack {
    content: Vec<SpillAccess>,
}

impl SpillAccessStack {
    fn mark(&mut self, parent: NodeId, expr: NodeId, alloc: i32, param_idx: usize) {
        assert!(self.content.len() < 7, "too many spilled operands");
        self.content.push(SpillAccess {
            expr,
            parent,
            spill_id: -alloc,
            param_idx,
        });
    }
}

fn replace_operands_descend(
    arena: &mut IrArena,
    node: NodeId,
    state: &mut RegisterAllocationState,
    stack: &mut SpillAccessStack,
) -> Result<(), String> {
    let mut child = arena.node(node).first_child;
    let mut param_idx = 0usize;
    while let Some(c) = child {
        let next = arena.node(c).next;
        if arena.is_vreg(c) {
            let vid = arena.node(c).id as usize;
            let alloc = state.allocation[vid];
            if alloc == 0 {
                return Err(format!("access to unallocated vreg in {}", arena.emit(node)));
            }
            if alloc > 0 {
                let mreg = state.allocated_machine_register(arena, c);
                arena.replace_child(node, c, mreg);
            } else {
                stack.mark(node, c, alloc, param_idx);
            }
        } else if arena.node(c).kind == NodeKind::ConstLoad {
            let constant = arena.node(c).first_child.expect("const load child");
            if arena.const_byte_size(constant) > 4 {
                // 64-bit immediates go through a spill register
                stack.mark(node, c, 0, param_idx);
            } else {
                arena.replace_child(node, c, constant);
            }
        }
        replace_operands_descend(arena, c, state, stack)?;
        child = next;
        param_idx += 1;
    }
    Ok(())
}

/// Stack location of a spill slot: `[rsp + slot*8 - 8]` within the frame
/// reserved by the callee-save prologue.
fn access_spill_slot(arena: &mut IrArena, spill_id: i32) -> NodeId {
    let rsp = arena.mreg64(Mreg::Rsp);
    let off = arena.const_i32(spill_id * 8 - 8);
    arena.mem_at_add(rsp, off)
}

fn spill_load_reg(arena: &mut IrArena, expr: NodeId, i: usize) -> NodeId {
    let id = SPILL_LOAD_REGS[i];
    match arena.node(expr).kind {
        NodeKind::Vreg8 => arena.reg8(id),
        NodeKind::Vreg32 => arena.reg32(id),
        NodeKind::Vreg64 => arena.reg64(id),
        // constants always load into 64-bit registers
        _ => arena.reg64(id),
    }
}

fn emit_spill_code(
    arena: &mut IrArena,
    base: NodeId,
    instr: NodeId,
    stack: &SpillAccessStack,
    state: &mut RegisterAllocationState,
) {
    for (i, entry) in stack.content.iter().enumerate() {
        // stack access for regular spills, the constant itself for loads
        let spill_access = if arena.node(entry.expr).kind == NodeKind::ConstLoad {
            arena.node(entry.expr).first_child.expect("const load child")
        } else {
            access_spill_slot(arena, entry.spill_id)
        };

        if arena.node(spill_access).kind == NodeKind::MemAt
            && can_use_memory_operand(arena, entry.parent, entry.expr)
        {
            arena.replace_child(entry.parent, entry.expr, spill_access);
            continue;
        }

        if instr_reads(arena, entry.parent, entry.param_idx) {
            let reg = spill_load_reg(arena, entry.expr, i);
            let load = arena.mov(reg, spill_access);
            arena.insert_before_child(base, instr, load);
            if arena.node(entry.expr).kind != NodeKind::ConstLoad {
                state.num_spill_access += 1;
            }
        }

        if instr_writes(arena, entry.parent, entry.param_idx) {
            let reg = spill_load_reg(arena, entry.expr, i);
            let store = arena.mov(spill_access, reg);
            arena.insert_after_child(base, instr, store);
            state.num_spill_access += 1;
        }

        let reg = spill_load_reg(arena, entry.expr, i);
        arena.replace_child(entry.parent, entry.expr, reg);
    }
}

fn alloc_explicit(
    arena: &mut IrArena,
    base: NodeId,
    line: NodeId,
    state: &mut RegisterAllocationState,
) {
    let vreg = arena.node(line).first_child.expect("marker target");
    match arena.node(line).kind {
        NodeKind::ReqVreg => {
            state.allocate(arena, vreg);
            arena.remove_child(base, line);
            let vid = arena.node(vreg).id;
            state.explicit_alloc[vid as usize] = true;
            state.allocated_vregs.insert(vid, vreg);
        }
        NodeKind::ClearVreg => {
            let vid = arena.node(vreg).id;
            debug_assert!(
                state.explicit_alloc[vid as usize],
                "cleared vreg was never requested"
            );
            state.free(arena, vreg);
            arena.remove_child(base, line);
            state.allocated_vregs.remove(&vid);
        }
        _ => unreachable!(),
    }
}

/// Process one line: markers update the allocation state; all other lines
/// get their operands substituted and spill traffic inserted around them.
pub fn handle_register_allocation(
    arena: &mut IrArena,
    base: NodeId,
    line: NodeId,
    state: &mut RegisterAllocationState,
) -> Result<(), String> {
    match arena.node(line).kind {
        NodeKind::ReqVreg | NodeKind::ClearVreg => {
            alloc_explicit(arena, base, line, state);
            Ok(())
        }
        _ => {
            let mut stack = SpillAccessStack::default();
            replace_operands_descend(arena, line, state, &mut stack)?;
            emit_spill_code(arena, base, line, &stack, state);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callee_save_registers_are_preferred() {
        let mut a = IrArena::new();
        let v = a.vreg64("v");
        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        state.allocate(&a, v);
        let mreg = state.allocation[0] - 1;
        // rbx is the first callee-save allocation register
        assert_eq!(mreg, Mreg::Rbx as i32);
    }

    #[test]
    fn thirteenth_vreg_spills() {
        let mut a = IrArena::new();
        let vregs: Vec<NodeId> = (0..13).map(|i| a.vreg64(&format!("v{i}"))).collect();
        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        for &v in &vregs {
            state.allocate(&a, v);
        }
        assert_eq!(state.num_mregs_used, NUM_ALLOCATION_MREGS);
        assert_eq!(state.allocation[12], -1);
        assert_eq!(state.num_spill_slots, 1);
    }

    #[test]
    fn freed_registers_are_reused() {
        let mut a = IrArena::new();
        let v1 = a.vreg64("v1");
        let v2 = a.vreg64("v2");
        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        state.allocate(&a, v1);
        let first = state.allocation[0];
        state.free(&a, v1);
        state.allocate(&a, v2);
        assert_eq!(state.allocation[1], first);
    }

    #[test]
    fn operands_are_replaced_in_place() {
        let mut a = IrArena::new();
        let root = a.root();
        let v = a.vreg64("v");
        let req = a.request_marker(v);
        a.add_child(root, req);
        let c = a.const_i64(7);
        let m = a.mov(v, c);
        a.add_child(root, m);
        let clr = a.clear_marker(v);
        a.add_child(root, clr);

        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        let mut line = a.node(root).first_child;
        while let Some(l) = line {
            let next = a.node(l).next;
            handle_register_allocation(&mut a, root, l, &mut state).unwrap();
            line = next;
        }
        let text = a.emit(root);
        assert!(text.contains("rbx"));
        assert!(!text.contains("{v(0)}"));
        assert!(!text.contains("vreg"));
        assert!(!text.contains("clear"));
    }

    #[test]
    fn spilled_operand_goes_through_spill_register() {
        let mut a = IrArena::new();
        let root = a.root();
        // fill all 12 allocation registers
        let mut fillers = Vec::new();
        for i in 0..12 {
            let v = a.vreg64(&format!("f{i}"));
            let req = a.request_marker(v);
            a.add_child(root, req);
            fillers.push(v);
        }
        let v = a.vreg64("spilled");
        let req = a.request_marker(v);
        a.add_child(root, req);
        // add v, v reads and writes a spilled operand
        let m = a.add(v, v);
        a.add_child(root, m);

        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        let mut line = a.node(root).first_child;
        while let Some(l) = line {
            let next = a.node(l).next;
            handle_register_allocation(&mut a, root, l, &mut state).unwrap();
            line = next;
        }
        let text = a.emit(root);
        // load before, store after, both through rax ([rsp+0] is slot 1)
        assert!(text.contains("[rsp+0]"), "spill slot access in:\n{text}");
        assert!(text.contains("rax"));
        assert!(state.num_spill_access >= 2);
    }

    #[test]
    fn unallocated_access_is_an_error() {
        let mut a = IrArena::new();
        let root = a.root();
        let v = a.vreg64("v");
        let c = a.const_i64(1);
        let m = a.mov(v, c);
        a.add_child(root, m);
        let mut state = RegisterAllocationState::new(a.vreg_count as usize);
        let line = a.node(root).first_child.unwrap();
        assert!(handle_register_allocation(&mut a, root, line, &mut state).is_err());
    }
}
