//! The Flounder → x86-64 translation driver: optimization, register
//! allocation, call lowering, loop-marker removal, and the callee-save
//! frame.

use flounder_error::{FlounderError, Result};

use crate::arena::{IrArena, NodeId, NodeKind};
use crate::asm::Mreg;
use crate::lang::is_managed_call;
use crate::optimize::optimize;
use crate::regalloc::{handle_register_allocation, RegisterAllocationState};
use crate::simd::{apply_simd_fusion, SimdLevel};

/// Options for one translation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateOptions {
    pub optimize: bool,
    pub simd: Option<SimdLevel>,
    pub print_flounder: bool,
    pub print_assembly: bool,
}

fn ceil_to_multiple_of(val: i32, multiple: i32) -> i32 {
    ((val + multiple - 1) / multiple) * multiple
}

/// Wrap the translated body in the callee-save prologue/epilogue and reserve
/// the 16-byte aligned spill frame.
fn add_callee_save(arena: &mut IrArena, base: NodeId, state: &RegisterAllocationState) {
    let stack_size = ceil_to_multiple_of(state.num_spill_slots * 8, 16);

    let save = arena.root();
    let bits = arena.bits64();
    arena.add_child(save, bits);
    for reg in [Mreg::Rbp, Mreg::Rbx, Mreg::R12, Mreg::R13, Mreg::R14, Mreg::R15] {
        let r = arena.mreg64(reg);
        let push = arena.push_instr(r);
        arena.add_child(save, push);
    }
    let rsp = arena.mreg64(Mreg::Rsp);
    let amount = arena.const_i32(stack_size);
    let sub = arena.sub(rsp, amount);
    arena.add_child(save, sub);
    arena.transfer_children(base, None, save);

    let restore = arena.root();
    let rsp = arena.mreg64(Mreg::Rsp);
    let amount = arena.const_i32(stack_size);
    let add = arena.add(rsp, amount);
    arena.add_child(restore, add);
    for reg in [Mreg::R15, Mreg::R14, Mreg::R13, Mreg::R12, Mreg::Rbx, Mreg::Rbp] {
        let r = arena.mreg64(reg);
        let pop = arena.pop_instr(r);
        arena.add_child(restore, pop);
    }
    // before the trailing ret
    let last = arena.node(base).last_child.expect("code ends with ret");
    let anchor = arena.node(last).prev.expect("ret is not the only line");
    arena.transfer_children(base, Some(anchor), restore);
}

/// One linear pass over the line list: explicit allocation, operand
/// substitution with spill code, managed-call lowering, marker removal.
fn translation_pass(arena: &mut IrArena, base: NodeId) -> Result<RegisterAllocationState> {
    let mut state = RegisterAllocationState::new(arena.vreg_count as usize);

    let mut line = arena.node(base).first_child;
    while let Some(l) = line {
        // save the successor to survive deletions and skip inserted code
        let next = arena.node(l).next;

        handle_register_allocation(arena, base, l, &mut state)
            .map_err(FlounderError::Codegen)?;

        if is_managed_call(arena.node(l).kind) {
            crate::callconv::place_managed_call(arena, base, l, &state);
        }

        if matches!(arena.node(l).kind, NodeKind::OpenLoop | NodeKind::CloseLoop) {
            arena.remove_child(base, l);
        }

        line = next;
    }

    if !state.allocated_vregs.is_empty() {
        for (id, node) in &state.allocated_vregs {
            tracing::warn!(vreg = id, text = %arena.emit(*node), "vreg never deallocated");
        }
    }

    add_callee_save(arena, base, &state);
    Ok(state)
}

/// Indent the Flounder text by loop nesting for readable dumps.
pub fn print_formatted_flounder(code: &str, indent: bool) -> String {
    let mut out = String::new();
    let mut prefix = String::new();
    for line in code.lines() {
        if indent && line.starts_with("closeLoop") {
            prefix.truncate(prefix.len().saturating_sub(4));
        }
        out.push_str(&prefix);
        out.push_str(line);
        out.push('\n');
        if indent && line.starts_with("openLoop") {
            prefix.push_str("    ");
        }
    }
    out
}

/// Rewrite the Flounder code tree into legal x86-64. Returns the report text
/// accumulated from the requested dumps.
pub fn translate_to_machine_ir(
    arena: &mut IrArena,
    code_tree: NodeId,
    options: &TranslateOptions,
) -> Result<String> {
    let mut report = String::new();

    if options.print_flounder {
        report.push_str("--------------------- FLOUNDER IR ---------------------\n");
        let code = arena.emit(code_tree);
        report.push_str(&print_formatted_flounder(&code, true));
    }

    if options.optimize {
        tracing::debug!("optimizing");
        optimize(arena, code_tree);
        if let Some(level) = options.simd {
            apply_simd_fusion(arena, code_tree, level, true);
        }
        if options.print_flounder {
            report.push_str("----------------- OPTIMIZED FLOUNDER IR -----------------\n");
            let code = arena.emit(code_tree);
            report.push_str(&print_formatted_flounder(&code, true));
        }
    }

    translation_pass(arena, code_tree)?;

    if options.print_assembly {
        report.push_str("----------------- MACHINE ASSEMBLY X64 --------------------\n");
        report.push_str(&arena.emit(code_tree));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a tiny function: v = 2; v += 3; store to a fake output; ret.
    fn tiny_function(arena: &mut IrArena) -> NodeId {
        let root = arena.root();
        let v = arena.vreg64("v");
        let req = arena.request_marker(v);
        arena.add_child(root, req);
        let two = arena.const_i64(2);
        let init = arena.mov(v, two);
        arena.add_child(root, init);
        let three = arena.const_i64(3);
        let acc = arena.add(v, three);
        arena.add_child(root, acc);
        let clr = arena.clear_marker(v);
        arena.add_child(root, clr);
        let ret = arena.ret();
        arena.add_child(root, ret);
        root
    }

    #[test]
    fn translation_removes_all_pseudo_ops() {
        let mut a = IrArena::new();
        let root = tiny_function(&mut a);
        let report = translate_to_machine_ir(&mut a, root, &TranslateOptions::default()).unwrap();
        assert!(report.is_empty());
        let text = a.emit(root);
        assert!(!text.contains("vreg"));
        assert!(!text.contains("clear"));
        assert!(!text.contains('{'));
        assert!(text.contains("push"));
        assert!(text.contains("pop"));
        assert!(text.contains("ret"));
        // prologue first, epilogue right before ret
        let push_pos = text.find("push").unwrap();
        let mov_pos = text.find("mov").unwrap();
        assert!(push_pos < mov_pos);
    }

    #[test]
    fn loop_markers_are_stripped() {
        let mut a = IrArena::new();
        let root = a.root();
        let open = a.open_loop(0);
        a.add_child(root, open);
        let close = a.close_loop(0);
        a.add_child(root, close);
        let ret = a.ret();
        a.add_child(root, ret);
        translate_to_machine_ir(&mut a, root, &TranslateOptions::default()).unwrap();
        let text = a.emit(root);
        assert!(!text.contains("openLoop"));
        assert!(!text.contains("closeLoop"));
    }

    #[test]
    fn report_contains_requested_dumps() {
        let mut a = IrArena::new();
        let root = tiny_function(&mut a);
        let options = TranslateOptions {
            print_flounder: true,
            print_assembly: true,
            ..Default::default()
        };
        let report = translate_to_machine_ir(&mut a, root, &options).unwrap();
        assert!(report.contains("FLOUNDER IR"));
        assert!(report.contains("MACHINE ASSEMBLY"));
    }

    #[test]
    fn formatted_output_indents_loop_bodies() {
        let code = "openLoop0\nmov a, b\ncloseLoop0\n";
        let formatted = print_formatted_flounder(code, true);
        assert!(formatted.contains("    mov"));
    }
}
