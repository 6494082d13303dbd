//! Optional SIMD load/store fusion.
//!
//! Replaces a group of consecutive scalar loads from one base (matched with
//! the symmetric group of stores to another base) by a single vector load,
//! per-lane extracts for the scalars that are read in between, and a single
//! vector store. Only legal together with the external-assembler backend.

use crate::analyze::{analyze_code, earliest_access, CodeAnalysis, MemAccess, MemAccessKind};
use crate::arena::{IrArena, NodeId};

/// Configured vector width, in 8-byte attributes per vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    /// 512-bit fusion: four attributes per register.
    Avx512,
    /// 256-bit fusion: two attributes per register.
    Avx2,
}

impl SimdLevel {
    pub const fn width(self) -> usize {
        match self {
            Self::Avx512 => 4,
            Self::Avx2 => 2,
        }
    }
}

fn simd_reg(arena: &mut IrArena, level: SimdLevel, id: u8) -> NodeId {
    match level {
        SimdLevel::Avx512 => arena.ymm(id),
        SimdLevel::Avx2 => arena.xmm(id),
    }
}

fn simd_mov(arena: &mut IrArena, level: SimdLevel, dst: NodeId, src: NodeId) -> NodeId {
    match level {
        SimdLevel::Avx512 => arena.vmovdqu(dst, src),
        SimdLevel::Avx2 => arena.movdqu(dst, src),
    }
}

/// Per-lane extract into a scalar register.
fn simd_extract(arena: &mut IrArena, level: SimdLevel, out: NodeId, reg_id: u8, idx: usize) -> NodeId {
    let seq = arena.root();
    match level {
        SimdLevel::Avx512 => {
            let xmm15 = arena.xmm(15);
            let vec = arena.ymm(reg_id);
            let half = arena.const_i32((idx / 2) as i32);
            let ext = arena.vextractf128(xmm15, vec, half);
            arena.add_child(seq, ext);
            let xmm15b = arena.xmm(15);
            let lane = arena.const_i32((idx % 2) as i32);
            let pex = arena.vpextrq(out, xmm15b, lane);
            arena.add_child(seq, pex);
        }
        SimdLevel::Avx2 => {
            let vec = arena.xmm(reg_id);
            let lane = arena.const_i32((idx % 2) as i32);
            let pex = arena.pextrq(out, vec, lane);
            arena.add_child(seq, pex);
        }
    }
    seq
}

fn place_simd_memory_access(
    arena: &mut IrArena,
    code: NodeId,
    analysis: &CodeAnalysis,
    loads: &[MemAccess],
    stores: &[MemAccess],
    level: SimdLevel,
    simd_reg_id: u8,
    delay: bool,
) {
    let load_base = loads[0].base_vreg;
    let store_base = stores[0].base_vreg;
    let mut load_ins = loads.last().expect("load group").line.node;

    // try to move the vector load later, right before the earliest scalar use
    if delay {
        if let Some(first_use) = earliest_access(arena, analysis, loads) {
            if let Some(prev) = arena.node(first_use.line.node).prev {
                load_ins = prev;
            }
        }
    }

    let vec = simd_reg(arena, level, simd_reg_id);
    let off = arena.const_i32(loads[0].offset as i32);
    let mem = arena.mem_at_add(load_base, off);
    let vload = simd_mov(arena, level, vec, mem);
    load_ins = arena.insert_after_child(code, load_ins, vload);

    // extract the attributes that are read between load and store
    for (i, (ld, st)) in loads.iter().zip(stores).enumerate() {
        let Some(first_use) = analysis.first_read(arena.node(ld.mov_vreg).id) else {
            continue;
        };
        if first_use.line.num < st.line.num {
            let seq = simd_extract(arena, level, ld.mov_vreg, simd_reg_id, i);
            arena.transfer_children(code, Some(load_ins), seq);
        }
    }

    let vec = simd_reg(arena, level, simd_reg_id);
    let off = arena.const_i32(stores[0].offset as i32);
    let mem = arena.mem_at_add(store_base, off);
    let vstore = simd_mov(arena, level, mem, vec);
    let store_anchor = arena
        .node(stores[0].line.node)
        .prev
        .expect("store has predecessor");
    arena.insert_after_child(code, store_anchor, vstore);

    for st in stores {
        arena.remove_child(code, st.line.node);
    }
    for ld in loads {
        arena.remove_child(code, ld.line.node);
    }
}

/// Scan the grouped memory accesses for load groups answered by a matching
/// store group and fuse them.
pub fn apply_simd_fusion(arena: &mut IrArena, base: NodeId, level: SimdLevel, delay: bool) {
    let analysis = analyze_code(arena, base);
    let width = level.width();

    let mut load_sets: Vec<Vec<MemAccess>> = Vec::new();
    for set in analysis.ordered_mem_access.values() {
        let first = &set[0];
        if set.len() >= width && first.kind == MemAccessKind::Load {
            load_sets.push(set.clone());
            continue;
        }
        if first.kind != MemAccessKind::Store {
            continue;
        }
        if load_sets.is_empty() {
            continue;
        }

        let mut matched_loads: Vec<MemAccess> = Vec::new();
        let mut matched_stores: Vec<MemAccess> = Vec::new();
        let mut simd_reg_id = 0u8;

        let mut load_set_id = load_sets.len() - 1;
        let mut load_it = 0usize;
        let mut store_it = 0usize;

        while store_it < set.len() {
            let store = &set[store_it];
            if load_it < load_sets[load_set_id].len() {
                let load = load_sets[load_set_id][load_it];
                if arena.node(store.mov_vreg).id == arena.node(load.mov_vreg).id {
                    matched_loads.push(load);
                    matched_stores.push(*store);
                    load_it += 1;
                }
            }

            if matched_loads.len() == width {
                place_simd_memory_access(
                    arena,
                    base,
                    &analysis,
                    &matched_loads,
                    &matched_stores,
                    level,
                    simd_reg_id,
                    delay,
                );
                simd_reg_id += 1;
                matched_loads.clear();
                matched_stores.clear();
                if simd_reg_id == 16 {
                    break;
                }
            }

            store_it += 1;
            if load_it >= load_sets[load_set_id].len() {
                if load_set_id == 0 {
                    break;
                }
                load_set_id -= 1;
                load_it = 0;
                // the next load set has a different base address
                matched_loads.clear();
                matched_stores.clear();
            }
        }
        load_sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two consecutive loads copied straight to two consecutive stores fuse
    /// into one vector load + one vector store at width 2.
    #[test]
    fn copy_chain_fuses_at_width_two() {
        let mut a = IrArena::new();
        let root = a.root();
        let src = a.vreg64("src");
        let dst = a.vreg64("dst");
        let v0 = a.vreg64("v0");
        let v1 = a.vreg64("v1");

        let m = a.mem_at(src);
        let l0 = a.mov(v0, m);
        a.add_child(root, l0);
        let off = a.const_i64(8);
        let m = a.mem_at_add(src, off);
        let l1 = a.mov(v1, m);
        a.add_child(root, l1);

        let m = a.mem_at(dst);
        let s0 = a.mov(m, v0);
        a.add_child(root, s0);
        let off = a.const_i64(8);
        let m = a.mem_at_add(dst, off);
        let s1 = a.mov(m, v1);
        a.add_child(root, s1);

        apply_simd_fusion(&mut a, root, SimdLevel::Avx2, false);
        let text = a.emit(root);
        assert_eq!(text.matches("movdqu").count(), 2, "fused code:\n{text}");
        assert_eq!(text.matches("mov ").count(), 0, "scalar movs left:\n{text}");
        // no extracts: the scalars are never read between load and store
        assert!(!text.contains("pextrq"));
    }

    /// A scalar read between load and store forces a per-lane extract.
    #[test]
    fn interleaved_use_gets_an_extract() {
        let mut a = IrArena::new();
        let root = a.root();
        let src = a.vreg64("src");
        let dst = a.vreg64("dst");
        let v0 = a.vreg64("v0");
        let v1 = a.vreg64("v1");

        let m = a.mem_at(src);
        let l0 = a.mov(v0, m);
        a.add_child(root, l0);
        let off = a.const_i64(8);
        let m = a.mem_at_add(src, off);
        let l1 = a.mov(v1, m);
        a.add_child(root, l1);

        // v0 is consumed before the store group
        let sink = a.vreg64("sink");
        let use0 = a.add(sink, v0);
        a.add_child(root, use0);

        let m = a.mem_at(dst);
        let s0 = a.mov(m, v0);
        a.add_child(root, s0);
        let off = a.const_i64(8);
        let m = a.mem_at_add(dst, off);
        let s1 = a.mov(m, v1);
        a.add_child(root, s1);

        apply_simd_fusion(&mut a, root, SimdLevel::Avx2, false);
        let text = a.emit(root);
        assert!(text.contains("pextrq"), "missing extract:\n{text}");
    }
}
