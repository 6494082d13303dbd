//! Flounder-level optimization passes, applied before translation:
//! aliasing, load delaying, lifetime shrink-wrapping, and mov-combining.

use std::collections::{BTreeMap, BTreeSet};

use crate::analyze::{analyze_code, CodeAnalysis, LineInfo};
use crate::arena::{IrArena, NodeId, NodeKind};

/// Relocate each `mov v, [m]` whose target is read exactly once to just
/// before that use. Each vreg is delayed at most once to avoid loops.
fn delay_loads(arena: &mut IrArena, base: NodeId) {
    tracing::debug!("delay loads");
    let analysis = analyze_code(arena, base);

    let mut delayed: BTreeSet<u32> = BTreeSet::new();
    let mut instr = arena.node(base).first_child;
    while let Some(i) = instr {
        let next = arena.node(i).next;
        if arena.node(i).kind == NodeKind::Mov {
            let first = arena.node(i).first_child.expect("mov first operand");
            let second = arena.node(i).last_child.expect("mov second operand");
            let vid = arena.node(first).id;
            if arena.is_vreg(first)
                && arena.node(second).kind == NodeKind::MemAt
                && !delayed.contains(&vid)
                && analysis.is_read(vid)
                && analysis.write_count(vid) == 1
            {
                let first_read = analysis.first_read(vid).expect("read exists").line.node;
                if first_read != i {
                    if let Some(anchor) = arena.node(first_read).prev {
                        if anchor != i {
                            delayed.insert(vid);
                            arena.remove_child(base, i);
                            arena.insert_after_child(base, anchor, i);
                        }
                    }
                }
            }
        }
        instr = next;
    }
}

/// Tighten each `request`/`clear` pair around the actual first write and
/// last read, keeping both markers outside every loop whose body touches the
/// vreg. Vregs that are never read lose their defining mov entirely (unless
/// it is a call).
fn shrink_wrap_usage_ranges(arena: &mut IrArena, base: NodeId) {
    tracing::debug!("shrink wrap");
    let analysis = analyze_code(arena, base);

    let requests: Vec<(u32, LineInfo)> = analysis
        .vreg_requests
        .iter()
        .map(|(&id, &info)| (id, info))
        .collect();

    for (vid, req) in requests {
        let Some(&clear) = analysis.vreg_clears.get(&vid) else {
            continue;
        };
        let Some(first_write) = analysis.first_write(vid) else {
            continue;
        };

        if !analysis.is_read(vid) {
            // dead value: drop the whole range unless the write has side
            // effects (managed call)
            if arena.node(first_write.line.node).kind != NodeKind::ManagedCall {
                tracing::debug!(vreg = vid, "never read, removing");
                arena.remove_child(base, req.node);
                arena.remove_child(base, first_write.line.node);
                arena.remove_child(base, clear.node);
            }
            continue;
        }

        let mut request_before = first_write.line;
        let mut clear_after = analysis.last_read(vid).expect("read exists").line;

        // expand so that every loop inside the original range is fully
        // contained
        for (&open_line, open) in analysis
            .loop_open_markers
            .range(req.num..=clear.num)
        {
            let Some(&close) = analysis.loop_close_markers.get(&arena.node(open.node).id) else {
                continue;
            };
            if open_line < request_before.num {
                if close.num < request_before.num {
                    // the whole loop closes before the first use
                    continue;
                }
                request_before = *open;
            }
            if close.num > clear_after.num {
                clear_after = close;
            }
        }

        arena.remove_child(base, req.node);
        match arena.node(request_before.node).prev {
            Some(anchor) => {
                arena.insert_after_child(base, anchor, req.node);
            }
            None => {
                let first = arena.node(base).first_child.expect("non-empty code");
                arena.insert_before_child(base, first, req.node);
            }
        }

        arena.remove_child(base, clear.node);
        arena.insert_after_child(base, clear_after.node, clear.node);
    }
}

fn rewrite_alias_everywhere(arena: &mut IrArena, base: NodeId, alias_map: &BTreeMap<u32, u32>) {
    rewrite_alias_descend(arena, base, alias_map);
}

fn rewrite_alias_descend(arena: &mut IrArena, node: NodeId, alias_map: &BTreeMap<u32, u32>) {
    let mut child = arena.node(node).first_child;
    while let Some(c) = child {
        let next = arena.node(c).next;
        if arena.is_vreg(c) {
            if let Some(&target) = alias_map.get(&arena.node(c).id) {
                let n = arena.node_mut(c);
                n.id = target;
                n.ident = Some(format!("{{_({target})}}").into());
            }
        }
        rewrite_alias_descend(arena, c, alias_map);

        // drop movs that became self-moves
        if arena.node(c).kind == NodeKind::Mov {
            let first = arena.node(c).first_child.expect("mov first operand");
            let last = arena.node(c).last_child.expect("mov second operand");
            if arena.is_vreg(first)
                && arena.is_vreg(last)
                && arena.node(first).id == arena.node(last).id
            {
                arena.remove_child(node, c);
            }
        }
        child = next;
    }
}

/// Merge the request/clear ranges of two vregs: keep the earlier request and
/// the later clear, renaming both markers to `id2`.
fn merge_vreg_ranges(
    arena: &mut IrArena,
    base: NodeId,
    analysis: &mut CodeAnalysis,
    id1: u32,
    id2: u32,
) {
    let req = analysis.vreg_requests[&id1];
    let clear = analysis.vreg_clears[&id1];
    let alias_req = analysis.vreg_requests[&id2];
    let alias_clear = analysis.vreg_clears[&id2];

    let merge_req = if alias_req.num < req.num {
        arena.remove_child(base, req.node);
        alias_req
    } else {
        arena.remove_child(base, alias_req.node);
        req
    };
    let merge_clear = if alias_clear.num > clear.num {
        arena.remove_child(base, clear.node);
        alias_clear
    } else {
        arena.remove_child(base, alias_clear.node);
        clear
    };

    let req_target = arena.node(merge_req.node).first_child.expect("marker target");
    arena.node_mut(req_target).id = id2;
    let clear_target = arena
        .node(merge_clear.node)
        .first_child
        .expect("marker target");
    arena.node_mut(clear_target).id = id2;

    analysis.vreg_requests.insert(id1, merge_req);
    analysis.vreg_requests.insert(id2, merge_req);
    analysis.vreg_clears.insert(id1, merge_clear);
    analysis.vreg_clears.insert(id2, merge_clear);
}

/// Merge each vreg whose only write is a single `mov` from another
/// single-write vreg into that source's live range.
fn aliasing(arena: &mut IrArena, base: NodeId) {
    tracing::debug!("aliasing");
    let mut alias_map: BTreeMap<u32, u32> = BTreeMap::new();
    let mut analysis = analyze_code(arena, base);

    let request_ids: Vec<u32> = analysis.vreg_requests.keys().copied().collect();
    for id in request_ids {
        if analysis.write_count(id) != 1 {
            continue;
        }
        let write = analysis.vreg_writes[&id][0].line.node;
        if arena.node(write).kind != NodeKind::Mov {
            continue;
        }
        let src = {
            let first = arena.node(write).first_child.expect("mov first operand");
            arena.node(first).next.expect("mov second operand")
        };
        if !arena.is_vreg(src) {
            continue;
        }
        let mut alias_id = arena.node(src).id;
        if analysis.write_count(alias_id) > 1 {
            continue;
        }
        if let Some(&resolved) = alias_map.get(&alias_id) {
            alias_id = resolved;
        }
        if alias_id == id {
            continue;
        }
        merge_vreg_ranges(arena, base, &mut analysis, id, alias_id);
        alias_map.insert(id, alias_id);
    }

    rewrite_alias_everywhere(arena, base, &alias_map);
}

/// Combine `mov a, b` immediately followed by `clear b` into a single live
/// range.
fn combining(arena: &mut IrArena, base: NodeId) {
    tracing::debug!("combining");
    let mut analysis = analyze_code(arena, base);
    let mut alias_map: BTreeMap<u32, u32> = BTreeMap::new();

    let mut instr = arena.node(base).first_child;
    while let Some(i) = instr {
        let Some(next) = arena.node(i).next else {
            break;
        };
        if arena.node(i).kind == NodeKind::Mov && arena.node(next).kind == NodeKind::ClearVreg {
            let dst = arena.node(i).first_child.expect("mov first operand");
            let src = arena.node(dst).next.expect("mov second operand");
            let cleared = arena.node(next).first_child.expect("clear target");
            if arena.is_vreg(dst)
                && arena.is_vreg(src)
                && arena.node(cleared).id == arena.node(src).id
            {
                let mut id_src = arena.node(src).id;
                let id_dst = arena.node(dst).id;
                if let Some(&resolved) = alias_map.get(&id_src) {
                    id_src = resolved;
                }
                if id_src != id_dst {
                    merge_vreg_ranges(arena, base, &mut analysis, id_src, id_dst);
                    alias_map.insert(id_dst, id_src);
                }
            }
        }
        instr = arena.node(i).next;
    }
    rewrite_alias_everywhere(arena, base, &alias_map);
}

/// Run all passes in their fixed order.
pub fn optimize(arena: &mut IrArena, base: NodeId) {
    aliasing(arena, base);
    delay_loads(arena, base);
    shrink_wrap_usage_ranges(arena, base);
    combining(arena, base);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// request v0; mov v0, [base]; (unrelated mov); mov v1, v0; use v1
    #[test]
    fn aliasing_merges_single_write_copies() {
        let mut a = IrArena::new();
        let root = a.root();
        let v0 = a.vreg64("v0");
        let v1 = a.vreg64("v1");
        let r0 = a.request_marker(v0);
        a.add_child(root, r0);
        let c = a.const_i64(1);
        let w0 = a.mov(v0, c);
        a.add_child(root, w0);
        let r1 = a.request_marker(v1);
        a.add_child(root, r1);
        let w1 = a.mov(v1, v0);
        a.add_child(root, w1);
        let sink = a.vreg64("sink");
        let rs = a.request_marker(sink);
        a.add_child(root, rs);
        let use1 = a.add(sink, v1);
        a.add_child(root, use1);
        let c0 = a.clear_marker(v0);
        a.add_child(root, c0);
        let c1 = a.clear_marker(v1);
        a.add_child(root, c1);
        let cs = a.clear_marker(sink);
        a.add_child(root, cs);

        aliasing(&mut a, root);
        let text = a.emit(root);
        // the copy collapsed: v1 was folded into v0's range
        assert!(!text.contains("{v1(1)}"), "alias not rewritten:\n{text}");
        // the self-move disappeared
        assert_eq!(
            text.matches("mov").count(),
            1,
            "copy mov should be removed:\n{text}"
        );
    }

    /// A load far from its single use is delayed to just before the use.
    #[test]
    fn loads_are_delayed_to_first_use() {
        let mut a = IrArena::new();
        let root = a.root();
        let base_reg = a.vreg64("base");
        let rb = a.request_marker(base_reg);
        a.add_child(root, rb);
        let v = a.vreg64("v");
        let rv = a.request_marker(v);
        a.add_child(root, rv);
        let mem = a.mem_at(base_reg);
        let load = a.mov(v, mem);
        a.add_child(root, load);
        let pad1 = a.comment_line("pad1");
        a.add_child(root, pad1);
        let pad2 = a.comment_line("pad2");
        a.add_child(root, pad2);
        let sink = a.vreg64("sink");
        let rs = a.request_marker(sink);
        a.add_child(root, rs);
        let use1 = a.add(sink, v);
        a.add_child(root, use1);

        delay_loads(&mut a, root);
        let text = a.emit(root);
        let load_pos = text.find("mov").unwrap();
        let pad2_pos = text.find(";pad2").unwrap();
        assert!(load_pos > pad2_pos, "load not delayed:\n{text}");
    }

    /// Markers migrate inward but stay outside loops that touch the vreg.
    #[test]
    fn shrink_wrap_respects_loops() {
        let mut a = IrArena::new();
        let root = a.root();
        let v = a.vreg64("v");
        let rv = a.request_marker(v);
        a.add_child(root, rv);
        let pad = a.comment_line("pad");
        a.add_child(root, pad);
        let open = a.open_loop(0);
        a.add_child(root, open);
        let c = a.const_i64(0);
        let w = a.mov(v, c);
        a.add_child(root, w);
        let sink = a.vreg64("sink");
        let rs = a.request_marker(sink);
        a.add_child(root, rs);
        let u = a.add(sink, v);
        a.add_child(root, u);
        let cs = a.clear_marker(sink);
        a.add_child(root, cs);
        let close = a.close_loop(0);
        a.add_child(root, close);
        let cv = a.clear_marker(v);
        a.add_child(root, cv);

        shrink_wrap_usage_ranges(&mut a, root);
        let text = a.emit(root);
        let req_pos = text.find("vreg").unwrap();
        let open_pos = text.find("openLoop0").unwrap();
        let close_pos = text.find("closeLoop0").unwrap();
        let clear_pos = text.rfind("clear").unwrap();
        assert!(req_pos < open_pos, "request inside loop:\n{text}");
        assert!(clear_pos > close_pos, "clear inside loop:\n{text}");
        // request moved after the padding
        let pad_pos = text.find(";pad").unwrap();
        assert!(req_pos > pad_pos, "request not tightened:\n{text}");
    }

    /// A dead vreg (written, never read) disappears.
    #[test]
    fn shrink_wrap_drops_dead_values() {
        let mut a = IrArena::new();
        let root = a.root();
        let v = a.vreg64("dead");
        let rv = a.request_marker(v);
        a.add_child(root, rv);
        let c = a.const_i64(3);
        let w = a.mov(v, c);
        a.add_child(root, w);
        let cv = a.clear_marker(v);
        a.add_child(root, cv);

        shrink_wrap_usage_ranges(&mut a, root);
        let text = a.emit(root);
        assert!(text.trim().is_empty(), "dead code left:\n{text}");
    }

    /// mov a, b; clear b merges the two ranges.
    #[test]
    fn combining_merges_move_then_clear() {
        let mut a = IrArena::new();
        let root = a.root();
        let b = a.vreg64("b");
        let rb = a.request_marker(b);
        a.add_child(root, rb);
        let c = a.const_i64(1);
        let wb = a.mov(b, c);
        a.add_child(root, wb);
        let dst = a.vreg64("a");
        let rd = a.request_marker(dst);
        a.add_child(root, rd);
        let cp = a.mov(dst, b);
        a.add_child(root, cp);
        let cb = a.clear_marker(b);
        a.add_child(root, cb);
        let sink = a.vreg64("sink");
        let rs = a.request_marker(sink);
        a.add_child(root, rs);
        let u = a.add(sink, dst);
        a.add_child(root, u);
        let cd = a.clear_marker(dst);
        a.add_child(root, cd);
        let cs = a.clear_marker(sink);
        a.add_child(root, cs);

        combining(&mut a, root);
        let text = a.emit(root);
        // the copy became a self-move and was dropped; only the init mov and
        // the markers of the merged range remain
        assert_eq!(text.matches("mov").count(), 1, "copy not combined:\n{text}");
    }
}
