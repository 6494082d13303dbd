//! Lowering of managed-call pseudo instructions into ABI-compliant code:
//! caller-save spills, parameter-register moves, stack alignment, the real
//! `call`/`syscall`, restores, and the return-value move.

use crate::abi::{
    CALLER_SAVE_MASK, IS_PARAM_REG_CALL, NUM_MREGS, PARAM_ORDER_CALL, PARAM_ORDER_SYSCALL,
};
use crate::arena::{IrArena, NodeId, NodeKind};
use crate::asm::Mreg;
use crate::regalloc::RegisterAllocationState;

/// Caller-save registers parked on the stack around one call.
#[derive(Debug, Default)]
struct StackSavedRegisters {
    saved: [bool; NUM_MREGS],
    stack_offset: [i32; NUM_MREGS],
    stack_end: i32,
}

fn save_caller_save_registers(
    arena: &mut IrArena,
    base: NodeId,
    mut insert_pos: NodeId,
    state: &RegisterAllocationState,
) -> (NodeId, StackSavedRegisters) {
    let mut saved = StackSavedRegisters::default();
    let mut stack_pos = 0i32;
    for i in 0..NUM_MREGS {
        if CALLER_SAVE_MASK[i] && state.mreg_in_use[i] {
            stack_pos += 8;
            saved.saved[i] = true;
            saved.stack_offset[i] = stack_pos;
            let rsp = arena.mreg64(Mreg::Rsp);
            let off = arena.const_i32(stack_pos);
            let slot = arena.mem_at_sub(rsp, off);
            let reg = arena.reg64(i as u8);
            let mov = arena.mov(slot, reg);
            insert_pos = arena.insert_after_child(base, insert_pos, mov);
        }
    }
    saved.stack_end = stack_pos;
    (insert_pos, saved)
}

fn restore_caller_save_registers(
    arena: &mut IrArena,
    base: NodeId,
    mut insert_pos: NodeId,
    saved: &StackSavedRegisters,
) -> NodeId {
    for i in 0..NUM_MREGS {
        if saved.saved[i] {
            let reg = arena.reg64(i as u8);
            let rsp = arena.mreg64(Mreg::Rsp);
            let off = arena.const_i32(saved.stack_offset[i]);
            let slot = arena.mem_at_sub(rsp, off);
            let mov = arena.mov(reg, slot);
            insert_pos = arena.insert_after_child(base, insert_pos, mov);
        }
    }
    insert_pos
}

/// Move one parameter into its ABI register, substituting the stack-saved
/// value when this call's own move chain already overwrote the source.
fn assign_param_reg(
    arena: &mut IrArena,
    base: NodeId,
    mut insert_pos: NodeId,
    param: NodeId,
    param_idx: usize,
    param_order: &[u8; 7],
    saved: &StackSavedRegisters,
    reg_write_set: &mut [bool; NUM_MREGS],
) -> NodeId {
    let target_id = param_order[param_idx] as usize;
    let param_reg = arena.reg64(target_id as u8);
    reg_write_set[target_id] = true;
    let src_id = arena.node(param).id as usize;
    if src_id == target_id {
        return insert_pos;
    }
    if reg_write_set[src_id] {
        let rsp = arena.mreg64(Mreg::Rsp);
        let off = arena.const_i32(saved.stack_offset[src_id]);
        let slot = arena.mem_at_sub(rsp, off);
        let mov = arena.mov(param_reg, slot);
        insert_pos = arena.insert_after_child(base, insert_pos, mov);
    } else {
        let mov = arena.scale_mov_sx(param_reg, param);
        insert_pos = arena.insert_after_child(base, insert_pos, mov);
    }
    insert_pos
}

/// Assign all parameters. Parameter-passing registers move first (they will
/// be overwritten), then other registers, finally non-register sources
/// (constants, spilled locations).
fn set_parameter_registers(
    arena: &mut IrArena,
    base: NodeId,
    mut insert_pos: NodeId,
    params: &[NodeId],
    param_order: &[u8; 7],
    saved: &StackSavedRegisters,
) -> NodeId {
    let mut reg_write_set = [false; NUM_MREGS];

    for (p, &param) in params.iter().enumerate() {
        if arena.is_reg(param) && IS_PARAM_REG_CALL[arena.node(param).id as usize] {
            insert_pos = assign_param_reg(
                arena,
                base,
                insert_pos,
                param,
                p,
                param_order,
                saved,
                &mut reg_write_set,
            );
        }
    }

    for (p, &param) in params.iter().enumerate() {
        if arena.is_reg(param) && !IS_PARAM_REG_CALL[arena.node(param).id as usize] {
            insert_pos = assign_param_reg(
                arena,
                base,
                insert_pos,
                param,
                p,
                param_order,
                saved,
                &mut reg_write_set,
            );
        }
    }

    for (p, &param) in params.iter().enumerate() {
        if !arena.is_reg(param) {
            let target = arena.reg64(param_order[p]);
            let mov = arena.mov(target, param);
            insert_pos = arena.insert_after_child(base, insert_pos, mov);
        }
    }

    insert_pos
}

fn insert_step_into_function(
    arena: &mut IrArena,
    base: NodeId,
    mut insert_pos: NodeId,
    call_kind: NodeKind,
    func_address: Option<NodeId>,
    stack_adjust: i32,
) -> NodeId {
    // keep the stack 16-byte aligned at the call site, below the saved regs
    let align = ((stack_adjust + 15) / 16) * 16 + 8;
    let rsp = arena.mreg64(Mreg::Rsp);
    let amount = arena.const_i32(align);
    let sub = arena.sub(rsp, amount);
    insert_pos = arena.insert_after_child(base, insert_pos, sub);

    match call_kind {
        NodeKind::ManagedSyscall => {
            let sc = arena.syscall_instr();
            insert_pos = arena.insert_after_child(base, insert_pos, sc);
        }
        NodeKind::ManagedCall => {
            let rax = arena.mreg64(Mreg::Rax);
            let addr = func_address.expect("managed call without function address");
            let mov = arena.mov(rax, addr);
            insert_pos = arena.insert_after_child(base, insert_pos, mov);
            let rax2 = arena.mreg64(Mreg::Rax);
            let call = arena.call(rax2);
            insert_pos = arena.insert_after_child(base, insert_pos, call);
        }
        other => panic!("not a managed call: {other:?}"),
    }

    let rsp = arena.mreg64(Mreg::Rsp);
    let amount = arena.const_i32(align);
    let add = arena.add(rsp, amount);
    arena.insert_after_child(base, insert_pos, add)
}

/// Replace one managed-call line with the full call-convention sequence.
pub fn place_managed_call(
    arena: &mut IrArena,
    base: NodeId,
    call_line: NodeId,
    state: &RegisterAllocationState,
) {
    assert!(arena.node(call_line).n_children > 0, "empty managed call");
    let call_kind = arena.node(call_line).kind;

    // remove the pseudo instruction, remember the insertion cursor
    let removed_prev = arena.remove_child(base, call_line);
    let mut insert_pos = match removed_prev {
        Some(p) => p,
        None => {
            // the call was the first line; anchor on a leading comment
            let anchor = arena.comment_line(" func call");
            match arena.node(base).first_child {
                Some(first) => arena.insert_before_child(base, first, anchor),
                None => arena.add_child(base, anchor),
            }
        }
    };

    // decode children: calls carry (retval, address, params...), syscalls
    // carry parameters only
    let children: Vec<NodeId> = arena.children(call_line).collect();
    let (param_order, ret_val, func_address, params) = match call_kind {
        NodeKind::ManagedSyscall => (&PARAM_ORDER_SYSCALL, None, None, children.as_slice()),
        NodeKind::ManagedCall => (
            &PARAM_ORDER_CALL,
            Some(children[0]),
            Some(children[1]),
            &children[2..],
        ),
        other => panic!("not a managed call: {other:?}"),
    };

    let open = arena.comment_line(" func call {");
    insert_pos = arena.insert_after_child(base, insert_pos, open);

    // save in-use caller-save registers on the stack
    let (pos, saved) = save_caller_save_registers(arena, base, insert_pos, state);
    insert_pos = pos;

    // parameter moves per the call convention
    insert_pos = set_parameter_registers(arena, base, insert_pos, params, param_order, &saved);

    // the call itself, with stack adjustment
    insert_pos = insert_step_into_function(
        arena,
        base,
        insert_pos,
        call_kind,
        func_address,
        saved.stack_end,
    );

    // restore caller-save registers
    insert_pos = restore_caller_save_registers(arena, base, insert_pos, &saved);

    // retrieve the return value, sized by the destination
    if let Some(ret_val) = ret_val {
        let ret_reg = match arena.node(ret_val).kind {
            NodeKind::Reg8 => arena.reg8(Mreg::Rax as u8),
            NodeKind::Reg32 => arena.reg32(Mreg::Rax as u8),
            // 64-bit default also covers spilled (memory) destinations
            _ => arena.reg64(Mreg::Rax as u8),
        };
        let mov = arena.mov(ret_val, ret_reg);
        insert_pos = arena.insert_after_child(base, insert_pos, mov);
    }

    let close = arena.comment_line(" } end call");
    arena.insert_after_child(base, insert_pos, close);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regalloc::handle_register_allocation;

    fn lower_all(arena: &mut IrArena, root: NodeId) {
        let mut state = RegisterAllocationState::new(arena.vreg_count as usize);
        let mut line = arena.node(root).first_child;
        while let Some(l) = line {
            let next = arena.node(l).next;
            handle_register_allocation(arena, root, l, &mut state).unwrap();
            if crate::lang::is_managed_call(arena.node(l).kind) {
                place_managed_call(arena, root, l, &state);
            }
            line = next;
        }
    }

    #[test]
    fn call_lowering_produces_mov_call_sequence() {
        let mut a = IrArena::new();
        let root = a.root();
        let ret = a.vreg64("ret");
        let arg = a.vreg64("arg");
        let req1 = a.request_marker(ret);
        a.add_child(root, req1);
        let req2 = a.request_marker(arg);
        a.add_child(root, req2);
        let seven = a.const_i64(7);
        let init = a.mov(arg, seven);
        a.add_child(root, init);
        let mc = a.mcall(ret, 0xdeadbeef, &[arg]);
        a.add_child(root, mc);

        lower_all(&mut a, root);
        let text = a.emit(root);
        assert!(!text.contains("mcall"));
        assert!(text.contains("call"));
        assert!(text.contains("3735928559") || text.contains("0xdeadbeef"));
        // first parameter lands in rdi
        assert!(text.contains("rdi"));
        // return value read from rax
        let call_pos = text.find("call").unwrap();
        let rax_ret = text.rfind("rax").unwrap();
        assert!(rax_ret > call_pos);
        // stack stays 16-byte aligned around the call
        assert!(text.contains("sub            rsp,"));
        assert!(text.contains("add            rsp,"));
    }

    #[test]
    fn syscall_lowering_uses_the_syscall_parameter_order() {
        let mut a = IrArena::new();
        let root = a.root();
        let nr = a.vreg64("nr");
        let req = a.request_marker(nr);
        a.add_child(root, req);
        let sixty = a.const_i64(60);
        let init = a.mov(nr, sixty);
        a.add_child(root, init);
        let ms = a.msyscall(&[nr]);
        a.add_child(root, ms);

        lower_all(&mut a, root);
        let text = a.emit(root);
        assert!(!text.contains("msyscall"));
        assert!(text.contains("syscall"));
        // the first syscall parameter lands in rax
        let mov_rax = text.find("mov            rax,").unwrap();
        let syscall_pos = text.find("syscall\n").unwrap();
        assert!(mov_rax < syscall_pos);
    }

    #[test]
    fn in_use_caller_save_registers_are_preserved() {
        let mut a = IrArena::new();
        let root = a.root();
        // burn the 6 callee-save allocation registers so the next vreg takes
        // a caller-save one
        let mut burners = Vec::new();
        for i in 0..6 {
            let v = a.vreg64(&format!("b{i}"));
            let req = a.request_marker(v);
            a.add_child(root, req);
            burners.push(v);
        }
        let live = a.vreg64("live");
        let req = a.request_marker(live);
        a.add_child(root, req);
        let one = a.const_i64(1);
        let init = a.mov(live, one);
        a.add_child(root, init);

        let ret = a.vreg64("ret");
        let reqr = a.request_marker(ret);
        a.add_child(root, reqr);
        let mc = a.mcall(ret, 0x1000, &[]);
        a.add_child(root, mc);

        lower_all(&mut a, root);
        let text = a.emit(root);
        // 'live' went to rsi (first caller-save allocation register), which
        // must be saved to and restored from the stack around the call
        assert!(text.contains("[rsp-8]"), "caller save slot in:\n{text}");
        let save = text.find("[rsp-8],").unwrap();
        let call_pos = text.find("call").unwrap();
        assert!(save < call_pos);
    }
}
