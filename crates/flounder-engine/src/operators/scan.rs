//! Table scans and the shared scan-loop emitters.

use flounder_error::Result;
use flounder_ir::{Comparator, NodeId, NodeKind, WhileLoop};
use flounder_sql::ExprArena;
use flounder_storage::{
    block_begin, block_end, read_iter_get_block, DataBlock, ReadIterator,
};
use flounder_types::SymbolSet;

use super::{consume_parent, OpId, OpKind, Plan};
use crate::context::JitContext;
use crate::values::{self, RELATION_MAT_CONFIG};

fn get_block_addr() -> u64 {
    read_iter_get_block as unsafe extern "C" fn(*mut ReadIterator) -> *mut DataBlock as usize
        as u64
}

fn block_begin_addr() -> u64 {
    block_begin as unsafe extern "C" fn(*mut DataBlock) -> *mut u8 as usize as u64
}

fn block_end_addr() -> u64 {
    block_end as unsafe extern "C" fn(*mut DataBlock) -> *mut u8 as usize as u64
}

/// An open tuple loop over `[begin, end)` with a per-step increment of the
/// tuple size. The loop head doubles as the current continue label.
pub struct ScanLoop {
    pub step: usize,
    pub tuple_cursor: NodeId,
    pub relation_end: NodeId,
    pub next_tuple: NodeId,
    pub loop_: WhileLoop,
}

pub fn open_scan_loop(
    ctx: &mut JitContext,
    begin: NodeId,
    end: NodeId,
    step: usize,
) -> ScanLoop {
    let cursor_v = ctx.ir.vreg64("tupleCursor");
    let tuple_cursor = ctx.request(cursor_v);
    let mov = ctx.ir.mov(tuple_cursor, begin);
    ctx.emit(mov);

    // memory operands are loaded once into a vreg before the loop
    let relation_end = if ctx.ir.node(end).kind == NodeKind::MemAt {
        let end_v = ctx.ir.vreg64("relEnd");
        let relation_end = ctx.request(end_v);
        let mov = ctx.ir.mov(relation_end, end);
        ctx.emit(mov);
        relation_end
    } else {
        end
    };

    let next_tuple = ctx.ir.id_label("nextTuple");
    ctx.label_next_tuple = Some(next_tuple);

    let loop_ = WhileLoop::new(
        &mut ctx.ir,
        Comparator::IsSmaller(tuple_cursor, relation_end),
        ctx.code_tree,
    );
    ScanLoop {
        step,
        tuple_cursor,
        relation_end,
        next_tuple,
        loop_,
    }
}

pub fn close_scan_loop(ctx: &mut JitContext, scan: ScanLoop) {
    ctx.comment(" --- Scan loop tail");
    let place = ctx.ir.place_label(scan.next_tuple);
    ctx.emit(place);
    let step = ctx.ir.const_i64(scan.step as i64);
    let add = ctx.ir.add(scan.tuple_cursor, step);
    ctx.emit(add);
    scan.loop_.close(&mut ctx.ir);
    ctx.clear(scan.tuple_cursor);
    if ctx.ir.is_vreg(scan.relation_end) {
        ctx.clear(scan.relation_end);
    }
}

/// A two-level loop: acquire blocks from a read iterator until nil, then
/// iterate the tuples of each block.
pub struct BlockScan {
    pub block: NodeId,
    block_begin: NodeId,
    loop_blocks: WhileLoop,
    pub scan: ScanLoop,
    read_it_addr: u64,
}

impl BlockScan {
    pub fn tuple_cursor(&self) -> NodeId {
        self.scan.tuple_cursor
    }
}

pub fn open_block_scan(ctx: &mut JitContext, read_it: *mut ReadIterator, step: usize) -> BlockScan {
    let read_it_addr = read_it as usize as u64;

    let block_v = ctx.ir.vreg64("inBlock");
    let block = ctx.request(block_v);
    let it_const = ctx.ir.const_address(read_it_addr);
    let mc = ctx.ir.mcall(block, get_block_addr(), &[it_const]);
    ctx.emit(mc);

    let null = ctx.ir.const_address(0);
    let loop_blocks = WhileLoop::new(
        &mut ctx.ir,
        Comparator::IsNotEqual(block, null),
        ctx.code_tree,
    );

    let begin_v = ctx.ir.vreg64("inBlockBegin");
    let block_begin = ctx.request(begin_v);
    let end_v = ctx.ir.vreg64("inBlockEnd");
    let block_end = ctx.request(end_v);

    let mc = ctx.ir.mcall(block_begin, block_begin_addr(), &[block]);
    ctx.emit(mc);
    let mc = ctx.ir.mcall(block_end, block_end_addr(), &[block]);
    ctx.emit(mc);

    let scan = open_scan_loop(ctx, block_begin, block_end, step);
    BlockScan {
        block,
        block_begin,
        loop_blocks,
        scan,
        read_it_addr,
    }
}

pub fn close_block_scan(ctx: &mut JitContext, bs: BlockScan) {
    close_scan_loop(ctx, bs.scan);

    let it_const = ctx.ir.const_address(bs.read_it_addr);
    let mc = ctx.ir.mcall(bs.block, get_block_addr(), &[it_const]);
    ctx.emit(mc);

    bs.loop_blocks.close(&mut ctx.ir);
    ctx.clear(bs.block);
    ctx.clear(bs.block_begin);
    // the block end was handed to the scan loop, which cleared it
}

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    mut request: SymbolSet,
) -> Result<()> {
    if ctx.request_all {
        request = SymbolSet::new();
    }

    let (read_it_ptr, step, schema, name) = match &mut plan.ops[id.0].kind {
        OpKind::Scan { rel, name, read_it } => {
            let step = read_it.step;
            let schema = unsafe { (**rel).schema.clone() };
            (
                (&mut **read_it) as *mut ReadIterator,
                step,
                schema,
                name.clone(),
            )
        }
        _ => unreachable!("scan produce on non-scan"),
    };

    ctx.comment(&format!(" --- Scan {name}"));
    let owns_pipeline = ctx.rel.inner_scan_count == 0;
    if owns_pipeline {
        ctx.open_pipeline();
    }

    let bs = open_block_scan(ctx, read_it_ptr, step);

    // read the requested attribute subset into vregs
    let scan_vals = values::dematerialize(
        ctx,
        bs.tuple_cursor(),
        &schema,
        RELATION_MAT_CONFIG,
        Some(&request),
    )?;
    plan.ops[id.0].schema = values::schema_of(&scan_vals, true)?;
    values::add_symbols(ctx, &scan_vals);

    consume_parent(plan, id, ctx, exprs)?;

    values::clear_set(ctx, &scan_vals);
    close_block_scan(ctx, bs);

    if owns_pipeline {
        ctx.close_pipeline();
    }
    Ok(())
}
