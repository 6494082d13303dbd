//! Result materialization: the plan root that writes symbol-table tuples
//! into the output relation, and the replayable scans other operators use
//! to restart a materialized side.

use flounder_error::{FlounderError, Result};
use flounder_ir::{Comparator, IfClause};
use flounder_sql::ExprArena;
use flounder_storage::{
    append_iter_get_block, block_capacity_end, block_end, block_update_content_size,
    read_iter_refresh, AppendIterator, DataBlock, ReadIterator, Relation,
};
use flounder_types::SymbolSet;

use super::{close_block_scan, consume_parent, open_block_scan, produce as produce_op, OpId, OpKind, Plan};
use crate::context::JitContext;
use crate::values::{self, RELATION_MAT_CONFIG};

fn append_get_block_addr() -> u64 {
    append_iter_get_block as unsafe extern "C" fn(*mut AppendIterator) -> *mut DataBlock as usize
        as u64
}

fn block_end_addr() -> u64 {
    block_end as unsafe extern "C" fn(*mut DataBlock) -> *mut u8 as usize as u64
}

fn block_capacity_end_addr() -> u64 {
    block_capacity_end as unsafe extern "C" fn(*mut DataBlock) -> *mut u8 as usize as u64
}

fn update_content_size_addr() -> u64 {
    block_update_content_size as unsafe extern "C" fn(*mut DataBlock, *mut u8) as usize as u64
}

fn refresh_addr() -> u64 {
    read_iter_refresh as unsafe extern "C" fn(*mut ReadIterator) as usize as u64
}

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    let child = plan.child(id, 0);
    produce_op(plan, child, ctx, exprs, request)
}

pub fn consume(plan: &mut Plan, id: OpId, ctx: &mut JitContext, exprs: &mut ExprArena) -> Result<()> {
    let child = plan.child(id, 0);
    let schema = plan.op(child).schema.clone();

    // create the output relation and its append iterator; both stay boxed
    // so the addresses baked into the code remain stable
    let (append_it_ptr, step, limit) = match &mut plan.ops[id.0].kind {
        OpKind::Materialize {
            n_call,
            limit,
            rel_out,
            append_it,
            ..
        } => {
            *n_call += 1;
            if *n_call > 1 {
                return Err(FlounderError::codegen("double consume in materialize"));
            }
            let mut rel = Box::new(Relation::new(schema.clone())?);
            let it = Box::new(unsafe { AppendIterator::new(&mut *rel) });
            *rel_out = Some(rel);
            *append_it = Some(it);
            let ptr = (&mut **append_it.as_mut().expect("just set")) as *mut AppendIterator;
            (ptr, schema.tuple_size, *limit)
        }
        _ => unreachable!("materialize consume on non-materialize"),
    };
    plan.ops[id.0].schema = schema.clone();

    ctx.comment(" --- Materialize");
    let it_addr = append_it_ptr as usize as u64;

    // pipeline header: current append block, write cursor, capacity end
    let out_block = ctx.ir.vreg64("outBlock");
    let marker = ctx.ir.request_marker(out_block);
    ctx.emit_pipe_head(marker);
    let it_const = ctx.ir.const_address(it_addr);
    let mc = ctx.ir.mcall(out_block, append_get_block_addr(), &[it_const]);
    ctx.emit_pipe_head(mc);

    let output_cursor = ctx.ir.vreg64("outputCursor");
    let marker = ctx.ir.request_marker(output_cursor);
    ctx.emit_pipe_head(marker);
    let mc = ctx.ir.mcall(output_cursor, block_end_addr(), &[out_block]);
    ctx.emit_pipe_head(mc);

    let capacity_end = ctx.ir.vreg64("outBlockCapacityEnd");
    let marker = ctx.ir.request_marker(capacity_end);
    ctx.emit_pipe_head(marker);
    let mc = ctx
        .ir
        .mcall(capacity_end, block_capacity_end_addr(), &[out_block]);
    ctx.emit_pipe_head(mc);

    let (count, label_exit) = if limit.is_some() {
        let count = ctx.ir.vreg64("count");
        let marker = ctx.ir.request_marker(count);
        ctx.emit_pipe_head(marker);
        let zero = ctx.ir.const_i64(0);
        let mov = ctx.ir.mov(count, zero);
        ctx.emit_pipe_head(mov);
        (Some(count), Some(ctx.ir.id_label("exit")))
    } else {
        (None, None)
    };

    // acquire a fresh block when the next tuple does not fit
    let tuple_end_v = ctx.ir.vreg64("tupleEnd");
    let tuple_end = ctx.request(tuple_end_v);
    let mov = ctx.ir.mov(tuple_end, output_cursor);
    ctx.emit(mov);
    let step_c = ctx.ir.const_i64(step as i64);
    let add = ctx.ir.add(tuple_end, step_c);
    ctx.emit(add);
    let if_ = IfClause::new(
        &mut ctx.ir,
        Comparator::IsLargerEqual(tuple_end, capacity_end),
        ctx.code_tree,
    );
    {
        ctx.clear(tuple_end);

        // commit the filled block before switching
        let foo_v = ctx.ir.vreg64("commit");
        let foo = ctx.request(foo_v);
        let mc = ctx.ir.mcall(
            foo,
            update_content_size_addr(),
            &[out_block, output_cursor],
        );
        ctx.emit(mc);
        ctx.clear(foo);

        let it_const = ctx.ir.const_address(it_addr);
        let mc = ctx.ir.mcall(out_block, append_get_block_addr(), &[it_const]);
        ctx.emit(mc);
        let mc = ctx.ir.mcall(output_cursor, block_end_addr(), &[out_block]);
        ctx.emit(mc);
        let mc = ctx
            .ir
            .mcall(capacity_end, block_capacity_end_addr(), &[out_block]);
        ctx.emit(mc);
    }
    if_.close(&mut ctx.ir);

    // materialize the tuple and advance the cursor
    let mat_values = values::get(ctx, &schema)?;
    values::materialize(ctx, &mat_values, output_cursor, RELATION_MAT_CONFIG)?;
    let step_c = ctx.ir.const_i64(step as i64);
    let add = ctx.ir.add(output_cursor, step_c);
    ctx.emit(add);

    if let (Some(count), Some(label_exit), Some(limit)) = (count, label_exit, limit) {
        let inc = ctx.ir.inc(count);
        ctx.emit(inc);
        let limit_c = ctx.ir.const_i64(limit as i64);
        let if_ = IfClause::new(
            &mut ctx.ir,
            Comparator::IsLargerEqual(count, limit_c),
            ctx.code_tree,
        );
        let jmp = ctx.ir.jmp(label_exit);
        ctx.emit(jmp);
        if_.close(&mut ctx.ir);

        let place = ctx.ir.place_label(label_exit);
        ctx.emit_pipe_foot(place);
        let clear = ctx.ir.clear_marker(count);
        ctx.emit_pipe_foot(clear);
    }

    // pipeline footer: commit the final cursor position
    let mc = ctx.ir.mcall(
        output_cursor,
        update_content_size_addr(),
        &[out_block, output_cursor],
    );
    ctx.emit_pipe_foot(mc);
    for vreg in [output_cursor, out_block, capacity_end] {
        let clear = ctx.ir.clear_marker(vreg);
        ctx.emit_pipe_foot(clear);
    }
    Ok(())
}

/// Replay the materialized relation through a fresh scan, feeding the
/// parent (nested-loops inner side, join restarts).
pub fn produce_scan_table(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    refresh_iterator: bool,
) -> Result<()> {
    let (read_it_ptr, step, schema) = match &mut plan.ops[id.0].kind {
        OpKind::Materialize {
            rel_out, read_it, ..
        } => {
            let rel = rel_out
                .as_mut()
                .ok_or_else(|| FlounderError::codegen("scan of unmaterialized relation"))?;
            let schema = rel.schema.clone();
            let it = Box::new(unsafe { ReadIterator::new(&**rel) });
            *read_it = Some(it);
            let ptr = (&mut **read_it.as_mut().expect("just set")) as *mut ReadIterator;
            (ptr, schema.tuple_size, schema)
        }
        _ => unreachable!("scan table on non-materialize"),
    };

    if refresh_iterator {
        let foo_v = ctx.ir.vreg64("refresh");
        let foo = ctx.request(foo_v);
        let it_const = ctx.ir.const_address(read_it_ptr as usize as u64);
        let mc = ctx.ir.mcall(foo, refresh_addr(), &[it_const]);
        ctx.emit(mc);
        ctx.clear(foo);
    }

    if plan.op(id).parent.is_some() {
        let bs = open_block_scan(ctx, read_it_ptr, step);
        let scan_vals =
            values::dematerialize(ctx, bs.tuple_cursor(), &schema, RELATION_MAT_CONFIG, None)?;
        values::add_symbols(ctx, &scan_vals);
        consume_parent(plan, id, ctx, exprs)?;
        values::clear_set(ctx, &scan_vals);
        close_block_scan(ctx, bs);
    }
    Ok(())
}
