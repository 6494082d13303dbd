//! Single-pass analysis of a flat IR line list: vreg reads/writes, lifetime
//! markers, loop markers, and grouped memory accesses.

use std::collections::BTreeMap;

use crate::arena::{IrArena, NodeId, NodeKind, Payload};
use crate::lang::{instr_reads, instr_writes};

/// A line number paired with the node at that line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub num: usize,
    pub node: NodeId,
}

/// One vreg access: the enclosing instruction line plus the operand node
/// that appears inside it.
#[derive(Debug, Clone, Copy)]
pub struct RegAccess {
    pub line: LineInfo,
    pub reg: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessKind {
    Load,
    Store,
}

/// A `mov` whose source or destination is `mem[vreg]` or `mem[vreg ± const]`.
#[derive(Debug, Clone, Copy)]
pub struct MemAccess {
    pub line: LineInfo,
    pub base_vreg: NodeId,
    pub offset: i64,
    /// The scalar register on the other side of the move.
    pub mov_vreg: NodeId,
    pub kind: MemAccessKind,
}

/// Per-line records over one pass of the IR, indexed by vreg id / loop id /
/// line number.
#[derive(Debug, Default)]
pub struct CodeAnalysis {
    pub vreg_reads: BTreeMap<u32, Vec<RegAccess>>,
    pub vreg_writes: BTreeMap<u32, Vec<RegAccess>>,
    pub vreg_requests: BTreeMap<u32, LineInfo>,
    pub vreg_clears: BTreeMap<u32, LineInfo>,
    /// Loop-open markers keyed by line number.
    pub loop_open_markers: BTreeMap<usize, LineInfo>,
    /// Loop-close markers keyed by loop id.
    pub loop_close_markers: BTreeMap<u32, LineInfo>,
    pub mem_reads: BTreeMap<u32, Vec<MemAccess>>,
    pub mem_writes: BTreeMap<u32, Vec<MemAccess>>,
    /// Memory-access groups ordered by the line of each group's first
    /// access (the view the SIMD pass walks).
    pub ordered_mem_access: BTreeMap<usize, Vec<MemAccess>>,
}

impl CodeAnalysis {
    pub fn is_read(&self, vreg_id: u32) -> bool {
        self.vreg_reads.contains_key(&vreg_id)
    }

    pub fn first_read(&self, vreg_id: u32) -> Option<&RegAccess> {
        self.vreg_reads.get(&vreg_id).and_then(|v| v.first())
    }

    pub fn last_read(&self, vreg_id: u32) -> Option<&RegAccess> {
        self.vreg_reads.get(&vreg_id).and_then(|v| v.last())
    }

    pub fn first_write(&self, vreg_id: u32) -> Option<&RegAccess> {
        self.vreg_writes.get(&vreg_id).and_then(|v| v.first())
    }

    pub fn write_count(&self, vreg_id: u32) -> usize {
        self.vreg_writes.get(&vreg_id).map_or(0, Vec::len)
    }

}

/// Earliest first-read line across a memory-access group.
pub fn earliest_access(
    arena: &IrArena,
    analysis: &CodeAnalysis,
    group: &[MemAccess],
) -> Option<RegAccess> {
    let mut best: Option<RegAccess> = None;
    for acc in group {
        if let Some(rd) = analysis.first_read(arena.node(acc.mov_vreg).id) {
            match best {
                Some(b) if b.line.num <= rd.line.num => {}
                _ => best = Some(*rd),
            }
        }
    }
    best
}

fn record_markers(arena: &IrArena, node: NodeId, line_num: usize, analysis: &mut CodeAnalysis) {
    let info = LineInfo {
        num: line_num,
        node,
    };
    match arena.node(node).kind {
        NodeKind::ReqVreg => {
            let vreg = arena.node(node).first_child.expect("request target");
            analysis.vreg_requests.insert(arena.node(vreg).id, info);
        }
        NodeKind::ClearVreg => {
            let vreg = arena.node(node).first_child.expect("clear target");
            analysis.vreg_clears.insert(arena.node(vreg).id, info);
        }
        NodeKind::OpenLoop => {
            analysis.loop_open_markers.insert(line_num, info);
        }
        NodeKind::CloseLoop => {
            analysis.loop_close_markers.insert(arena.node(node).id, info);
        }
        _ => {}
    }
}

fn set_read_write_descend(
    arena: &IrArena,
    instr: NodeId,
    node: NodeId,
    line_num: usize,
    analysis: &mut CodeAnalysis,
) {
    let mut child = arena.node(node).first_child;
    let mut i = 0usize;
    while let Some(c) = child {
        if arena.is_vreg(c) {
            let vid = arena.node(c).id;
            let access = RegAccess {
                line: LineInfo {
                    num: line_num,
                    node: instr,
                },
                reg: c,
            };
            if instr_reads(arena, node, i) {
                analysis.vreg_reads.entry(vid).or_default().push(access);
            }
            if instr_writes(arena, node, i) {
                analysis.vreg_writes.entry(vid).or_default().push(access);
            }
        }
        set_read_write_descend(arena, instr, c, line_num, analysis);
        child = arena.node(c).next;
        i += 1;
    }
}

/// Decode `mem[vreg]` / `mem[vreg ± const]` into its base vreg and offset.
fn decode_memory_location(arena: &IrArena, mem_node: NodeId) -> Option<(NodeId, i64)> {
    let child = arena.node(mem_node).first_child?;
    if arena.is_vreg(child) {
        return Some((child, 0));
    }
    let sign = match arena.node(child).kind {
        NodeKind::MemAdd => 1i64,
        NodeKind::MemSub => -1i64,
        _ => return None,
    };
    let base = arena.node(child).first_child?;
    let offs = arena.node(child).last_child?;
    if !arena.is_vreg(base) {
        return None;
    }
    let value = match arena.node(offs).payload {
        Payload::I32(v) => i64::from(v),
        Payload::I64(v) => v,
        _ => return None,
    };
    Some((base, sign * value))
}

fn record_memory_access(
    arena: &IrArena,
    instr: NodeId,
    line_num: usize,
    analysis: &mut CodeAnalysis,
) {
    if arena.node(instr).kind != NodeKind::Mov {
        return;
    }
    let first = arena.node(instr).first_child.expect("mov first operand");
    let second = arena.node(instr).last_child.expect("mov second operand");
    let info = LineInfo {
        num: line_num,
        node: instr,
    };
    if arena.node(first).kind == NodeKind::MemAt {
        if let Some((base, offset)) = decode_memory_location(arena, first) {
            analysis
                .mem_writes
                .entry(arena.node(base).id)
                .or_default()
                .push(MemAccess {
                    line: info,
                    base_vreg: base,
                    offset,
                    mov_vreg: second,
                    kind: MemAccessKind::Store,
                });
        }
    }
    if arena.node(second).kind == NodeKind::MemAt {
        if let Some((base, offset)) = decode_memory_location(arena, second) {
            analysis
                .mem_reads
                .entry(arena.node(base).id)
                .or_default()
                .push(MemAccess {
                    line: info,
                    base_vreg: base,
                    offset,
                    mov_vreg: first,
                    kind: MemAccessKind::Load,
                });
        }
    }
}

/// Analyze the top-level line list of `base_node`.
pub fn analyze_code(arena: &IrArena, base_node: NodeId) -> CodeAnalysis {
    let mut analysis = CodeAnalysis::default();
    let mut line = arena.node(base_node).first_child;
    let mut line_num = 0usize;
    while let Some(l) = line {
        let next = arena.node(l).next;
        set_read_write_descend(arena, l, l, line_num, &mut analysis);
        record_markers(arena, l, line_num, &mut analysis);
        record_memory_access(arena, l, line_num, &mut analysis);
        line = next;
        line_num += 1;
    }

    // order groups by the line of their first access
    for group in analysis.mem_reads.values() {
        if let Some(first) = group.first() {
            analysis
                .ordered_mem_access
                .insert(first.line.num, group.clone());
        }
    }
    for group in analysis.mem_writes.values() {
        if let Some(first) = group.first() {
            analysis
                .ordered_mem_access
                .insert(first.line.num, group.clone());
        }
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_writes_and_markers_are_recorded() {
        let mut a = IrArena::new();
        let root = a.root();
        let v = a.vreg64("v");
        let vid = a.node(v).id;
        let req = a.request_marker(v);
        a.add_child(root, req);
        let c = a.const_i64(1);
        let m = a.mov(v, c);
        a.add_child(root, m);
        let w = a.vreg64("w");
        let m2 = a.mov(w, v);
        a.add_child(root, m2);
        let clr = a.clear_marker(v);
        a.add_child(root, clr);

        let an = analyze_code(&a, root);
        assert_eq!(an.vreg_requests[&vid].num, 0);
        assert_eq!(an.vreg_clears[&vid].num, 3);
        assert_eq!(an.write_count(vid), 1);
        assert_eq!(an.vreg_reads[&vid].len(), 1);
        assert_eq!(an.vreg_reads[&vid][0].line.num, 2);
    }

    #[test]
    fn loop_markers_by_line_and_id() {
        let mut a = IrArena::new();
        let root = a.root();
        let open = a.open_loop(3);
        a.add_child(root, open);
        let nop = a.comment_line("x");
        a.add_child(root, nop);
        let close = a.close_loop(3);
        a.add_child(root, close);
        let an = analyze_code(&a, root);
        assert_eq!(an.loop_open_markers[&0].num, 0);
        assert_eq!(an.loop_close_markers[&3].num, 2);
    }

    #[test]
    fn memory_access_grouped_by_base_vreg() {
        let mut a = IrArena::new();
        let root = a.root();
        let base = a.vreg64("base");
        let bid = a.node(base).id;
        let v1 = a.vreg64("v1");
        let v2 = a.vreg64("v2");

        let mem0 = a.mem_at(base);
        let load0 = a.mov(v1, mem0);
        a.add_child(root, load0);

        let off = a.const_i64(8);
        let mem8 = a.mem_at_add(base, off);
        let load8 = a.mov(v2, mem8);
        a.add_child(root, load8);

        let out = a.vreg64("out");
        let mem_store = a.mem_at(out);
        let store = a.mov(mem_store, v1);
        a.add_child(root, store);

        let an = analyze_code(&a, root);
        let loads = &an.mem_reads[&bid];
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].offset, 0);
        assert_eq!(loads[1].offset, 8);
        assert_eq!(loads[0].kind, MemAccessKind::Load);
        let stores = &an.mem_writes[&a.node(out).id];
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].kind, MemAccessKind::Store);
        // two groups: loads group at line 0, stores group at line 2
        assert_eq!(an.ordered_mem_access.len(), 2);
    }
}
