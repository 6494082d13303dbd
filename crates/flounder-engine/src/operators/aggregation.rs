//! Hash aggregation with AVG splitting.
//!
//! The build phase accumulates per-group state in the hash table; the emit
//! phase scans the table, merges split SUM/COUNT pairs back into AVG, and
//! feeds the parent. The whole operator runs under the single-thread guard:
//! workers rendezvous at the pipeline entry and exactly one proceeds.

use flounder_error::{FlounderError, Result};
use flounder_ir::{Comparator, IfClause, NodeId, WhileLoop};
use flounder_runtime::{
    guard_enter, ht_get, ht_put, HashTable, SingleThreadGuard, ENTRY_HEADER_SIZE,
};
use flounder_sql::{ExprArena, ExprId, ExprTag};
use flounder_types::{symbol_set_union, SymbolSet, TypeTag};

use super::{
    close_scan_loop, consume_parent, open_scan_loop, produce as produce_op, OpId, OpKind, Plan,
};
use crate::context::JitContext;
use crate::exprgen::{emit_add, emit_div_i64, emit_greater_than, emit_less_than, emit_mul_i64};
use crate::values::{self, MatConfig, Value, ValueSet, HT_MAT_CONFIG};

fn ht_put_addr() -> u64 {
    ht_put as unsafe extern "C" fn(*mut HashTable, u64) -> *mut u8 as usize as u64
}

fn ht_get_addr() -> u64 {
    ht_get as unsafe extern "C" fn(*mut HashTable, u64, *const u8) -> *mut u8 as usize as u64
}

fn guard_enter_addr() -> u64 {
    guard_enter as unsafe extern "C" fn(*mut SingleThreadGuard) -> u8 as usize as u64
}

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    _request: SymbolSet,
) -> Result<()> {
    let (agg, group) = match &mut plan.ops[id.0].kind {
        OpKind::Aggregation {
            agg, group, guard, ..
        } => {
            *guard = Some(Box::new(SingleThreadGuard::new(ctx.num_threads())));
            (agg.clone(), group.clone())
        }
        _ => unreachable!("aggregation produce on non-aggregation"),
    };

    let agg_req = exprs.required_attributes_of(&agg);
    let group_req = exprs.required_attributes_of(&group);
    let child = plan.child(id, 0);
    produce_op(plan, child, ctx, exprs, symbol_set_union(&agg_req, &group_req))?;

    consume_emit_phase(plan, id, ctx, exprs)
}

/// Per-aggregate accumulator update: COUNT increments, SUM adds, MIN/MAX
/// conditionally replace.
fn update_aggregates(
    ctx: &mut JitContext,
    exprs: &ExprArena,
    values_table: &ValueSet,
    agg_exprs: &[ExprId],
    agg_vals: &ValueSet,
) -> Result<()> {
    for (i, (accumulator, increment)) in values_table.iter().zip(agg_vals).enumerate() {
        match exprs.node(agg_exprs[i]).tag {
            ExprTag::Count => {
                let inc = ctx.ir.inc(accumulator.node);
                ctx.emit(inc);
            }
            ExprTag::Sum => {
                let add_res = emit_add(ctx, accumulator.ty, accumulator.node, increment.node)?;
                let mov = ctx.ir.mov(accumulator.node, add_res);
                ctx.emit(mov);
                ctx.clear(add_res);
            }
            ExprTag::Min => {
                let is_lt = emit_less_than(ctx, increment.ty, increment.node, accumulator.node)?;
                let one = ctx.ir.const_i8(1);
                let if_ = IfClause::new(
                    &mut ctx.ir,
                    Comparator::IsEqual(is_lt, one),
                    ctx.code_tree,
                );
                let mov = ctx.ir.mov(accumulator.node, increment.node);
                ctx.emit(mov);
                if_.close(&mut ctx.ir);
                ctx.clear(is_lt);
            }
            ExprTag::Max => {
                let is_gt =
                    emit_greater_than(ctx, increment.ty, increment.node, accumulator.node)?;
                let one = ctx.ir.const_i8(1);
                let if_ = IfClause::new(
                    &mut ctx.ir,
                    Comparator::IsEqual(is_gt, one),
                    ctx.code_tree,
                );
                let mov = ctx.ir.mov(accumulator.node, increment.node);
                ctx.emit(mov);
                if_.close(&mut ctx.ir);
                ctx.clear(is_gt);
            }
            other => {
                return Err(FlounderError::not_implemented(format!(
                    "aggregate update for {}",
                    other.name()
                )))
            }
        }
    }
    Ok(())
}

/// `AVG = (SUM * 100) / COUNT` with the scale factor baked in.
fn avg_from_sum_and_count(
    ctx: &mut JitContext,
    sum: &Value,
    count: &Value,
) -> Result<NodeId> {
    match sum.ty.tag {
        TypeTag::Bigint | TypeTag::Decimal => {
            let hundred = ctx.ir.const_i64(100);
            let scaled = emit_mul_i64(ctx, sum.node, hundred);
            let res = emit_div_i64(ctx, scaled, count.node);
            ctx.clear(scaled);
            Ok(res)
        }
        other => Err(FlounderError::not_implemented(format!(
            "AVG merge for {}",
            other.name()
        ))),
    }
}

/// Merge split SUM/COUNT pairs back into the AVG values the query asked
/// for; group keys and plain aggregates pass through.
fn merge_averages(
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    aggs: &[ExprId],
    vals: &ValueSet,
    first_agg_idx: usize,
) -> Result<ValueSet> {
    let mut result = ValueSet::new();
    let mut agg_idx = 0usize;
    let mut i = 0usize;
    while i < vals.len() {
        if i < first_agg_idx {
            result.push(vals[i].clone());
            i += 1;
            continue;
        }
        let agg_expr = aggs[agg_idx];
        if exprs.node(agg_expr).tag == ExprTag::Avg {
            exprs.assign_id(agg_expr, &mut ctx.rel.expr_id_gen);
            let sum = &vals[i];
            let count = &vals[i + 1];
            let avg = avg_from_sum_and_count(ctx, sum, count)?;
            ctx.clear(sum.node);
            ctx.clear(count.node);
            result.push(Value {
                node: avg,
                ty: exprs.node(agg_expr).ty,
                symbol: exprs.expression_name(agg_expr),
            });
            i += 2;
        } else {
            result.push(vals[i].clone());
            i += 1;
        }
        agg_idx += 1;
    }
    Ok(result)
}

/// Build phase, called once per tuple position in the child pipeline.
pub fn consume(plan: &mut Plan, id: OpId, ctx: &mut JitContext, exprs: &mut ExprArena) -> Result<()> {
    ctx.comment(" --- Hash aggregation");

    let (group, split_agg, guard_addr) = match &mut plan.ops[id.0].kind {
        OpKind::Aggregation {
            group,
            split_agg,
            guard,
            ..
        } => (
            group.clone(),
            split_agg.clone(),
            (&mut **guard.as_mut().expect("guard set")) as *mut SingleThreadGuard as usize
                as u64,
        ),
        _ => unreachable!("aggregation consume on non-aggregation"),
    };

    // guard entry sits in the pipeline header: losers jump straight to the
    // end label the emit phase places in its footer
    let enter_v = ctx.ir.vreg8("guardEnter");
    let marker = ctx.ir.request_marker(enter_v);
    ctx.emit_pipe_head(marker);
    let guard_const = ctx.ir.const_address(guard_addr);
    let mc = ctx.ir.mcall(enter_v, guard_enter_addr(), &[guard_const]);
    ctx.emit_pipe_head(mc);
    let zero = ctx.ir.const_i8(0);
    let cmp = ctx.ir.cmp(enter_v, zero);
    ctx.emit_pipe_head(cmp);
    let clear = ctx.ir.clear_marker(enter_v);
    ctx.emit_pipe_head(clear);
    let end_label = ctx.ir.id_label("endSingleThread");
    let je = ctx.ir.je(end_label);
    ctx.emit_pipe_head(je);
    match &mut plan.ops[id.0].kind {
        OpKind::Aggregation {
            guard_end_label, ..
        } => *guard_end_label = Some(end_label),
        _ => unreachable!(),
    }

    let group_vals = values::eval_expressions(ctx, exprs, &group)?;
    let agg_vals = values::eval_expressions(ctx, exprs, &split_agg)?;

    let mut all_vals = group_vals.clone();
    all_vals.extend(agg_vals.iter().cloned());
    let entry_schema = values::schema_of(&all_vals, HT_MAT_CONFIG.strings_by_val)?;
    let group_offset = values::byte_size(&group_vals, HT_MAT_CONFIG.strings_by_val)?;
    let group_hash = values::hash_set(ctx, &group_vals)?;

    let table = HashTable::allocate(plan.size_estimate(id), entry_schema.tuple_size);
    let ht_addr = match &mut plan.ops[id.0].kind {
        OpKind::Aggregation {
            ht,
            entry_schema: saved,
            ..
        } => {
            *saved = entry_schema;
            *ht = Some(table);
            (&mut **ht.as_mut().expect("just set")) as *mut HashTable as usize as u64
        }
        _ => unreachable!(),
    };

    let entry_v = ctx.ir.vreg64("htEntry");
    let ht_entry = ctx.request(entry_v);
    let null = ctx.ir.const_address(0);
    let mov = ctx.ir.mov(ht_entry, null);
    ctx.emit(mov);
    let found_v = ctx.ir.vreg8("entryFound");
    let entry_found = ctx.request(found_v);
    let zero = ctx.ir.const_i8(0);
    let mov = ctx.ir.mov(entry_found, zero);
    ctx.emit(mov);

    // probe until the group is found or an empty slot ends the chain
    let one = ctx.ir.const_i8(1);
    let while_loop = WhileLoop::new(
        &mut ctx.ir,
        Comparator::IsNotEqual(entry_found, one),
        ctx.code_tree,
    );
    {
        let addr = ctx.ir.const_address(ht_addr);
        let ht_const = ctx.ir.const_load(addr);
        let mc = ctx
            .ir
            .mcall(ht_entry, ht_get_addr(), &[ht_const, group_hash, ht_entry]);
        ctx.emit(mc);
        let null = ctx.ir.const_address(0);
        while_loop.break_if(&mut ctx.ir, Comparator::IsEqual(ht_entry, null));
        let group_schema = values::schema_of(&group_vals, HT_MAT_CONFIG.strings_by_val)?;
        let probe_vals =
            values::dematerialize(ctx, ht_entry, &group_schema, HT_MAT_CONFIG, None)?;
        values::check_equality_bool(ctx, &group_vals, &probe_vals, entry_found)?;
        values::clear_set(ctx, &probe_vals);
    }
    while_loop.close(&mut ctx.ir);

    // new group: claim a slot, materialize keys, then the initial state
    ctx.comment("Materialize aggregation HT entry.");
    let zero = ctx.ir.const_i8(0);
    let if_new = IfClause::new(
        &mut ctx.ir,
        Comparator::IsEqual(entry_found, zero),
        ctx.code_tree,
    );
    {
        let addr = ctx.ir.const_address(ht_addr);
        let ht_const = ctx.ir.const_load(addr);
        let mc = ctx.ir.mcall(ht_entry, ht_put_addr(), &[ht_const, group_hash]);
        ctx.emit(mc);
        values::materialize(ctx, &group_vals, ht_entry, HT_MAT_CONFIG)?;
        values::clear_set(ctx, &group_vals);
        let off = ctx.ir.const_i64(group_offset as i64);
        let add = ctx.ir.add(ht_entry, off);
        ctx.emit(add);
        let conf = MatConfig {
            strings_by_val: HT_MAT_CONFIG.strings_by_val,
            explicit: false,
        };
        values::materialize(ctx, &agg_vals, ht_entry, conf)?;
    }
    if_new.close(&mut ctx.ir);

    ctx.clear(group_hash);

    // existing group: fetch the accumulators, update, write back
    let one = ctx.ir.const_i8(1);
    let if_existing = IfClause::new(
        &mut ctx.ir,
        Comparator::IsEqual(entry_found, one),
        ctx.code_tree,
    );
    {
        ctx.clear(entry_found);
        let off = ctx.ir.const_i64(group_offset as i64);
        let add = ctx.ir.add(ht_entry, off);
        ctx.emit(add);
        let agg_schema = values::schema_of(&agg_vals, HT_MAT_CONFIG.strings_by_val)?;
        let values_table =
            values::dematerialize(ctx, ht_entry, &agg_schema, HT_MAT_CONFIG, None)?;
        update_aggregates(ctx, exprs, &values_table, &split_agg, &agg_vals)?;
        values::materialize(ctx, &values_table, ht_entry, HT_MAT_CONFIG)?;
        values::clear_set(ctx, &values_table);
    }
    if_existing.close(&mut ctx.ir);

    ctx.clear(ht_entry);
    values::clear_set(ctx, &agg_vals);
    Ok(())
}

/// Emit phase: scan the hash table, merge averages, feed the parent.
fn consume_emit_phase(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
) -> Result<()> {
    ctx.comment(" --- Scan aggregation hash table");

    let owns_pipeline = ctx.rel.inner_scan_count == 0;
    if owns_pipeline {
        ctx.open_pipeline();
    }

    let (agg, group_len, entry_schema, full_entry_size, entries_field, entries_end_field, end_label) =
        match &mut plan.ops[id.0].kind {
            OpKind::Aggregation {
                agg,
                group,
                ht,
                entry_schema,
                guard_end_label,
                ..
            } => {
                let table = ht.as_mut().expect("build phase allocated the table");
                (
                    agg.clone(),
                    group.len(),
                    entry_schema.clone(),
                    table.full_entry_size,
                    (&table.entries) as *const *mut u8 as usize as u64,
                    (&table.entries_end) as *const *mut u8 as usize as u64,
                    guard_end_label.expect("guard opened in build phase"),
                )
            }
            _ => unreachable!("aggregation emit on non-aggregation"),
        };

    // scan [entries, entries_end): the field addresses are read at runtime
    // because a grow hot-swaps the buffer
    let addr = ctx.ir.const_address(entries_field);
    let load = ctx.ir.const_load(addr);
    let begin = ctx.ir.mem_at(load);
    let addr = ctx.ir.const_address(entries_end_field);
    let load = ctx.ir.const_load(addr);
    let end = ctx.ir.mem_at(load);
    let scan = open_scan_loop(ctx, begin, end, full_entry_size);
    {
        // skip empty buckets by their status byte
        let status_v = ctx.ir.vreg8("htEntryStatus");
        let status = ctx.request(status_v);
        let mem = ctx.ir.mem_at(scan.tuple_cursor);
        let mov = ctx.ir.mov(status, mem);
        ctx.emit(mov);
        let zero = ctx.ir.const_i8(0);
        let cmp = ctx.ir.cmp(status, zero);
        ctx.emit(cmp);
        let je = ctx.ir.je(scan.next_tuple);
        ctx.emit(je);
        ctx.clear(status);

        let addr_v = ctx.ir.vreg64("tupleAddr");
        let tuple_addr = ctx.request(addr_v);
        let header = ctx.ir.const_i64(ENTRY_HEADER_SIZE as i64);
        let mov = ctx.ir.mov(tuple_addr, header);
        ctx.emit(mov);
        let add = ctx.ir.add(tuple_addr, scan.tuple_cursor);
        ctx.emit(add);

        let table_values =
            values::dematerialize(ctx, tuple_addr, &entry_schema, HT_MAT_CONFIG, None)?;
        let merged = merge_averages(ctx, exprs, &agg, &table_values, group_len)?;
        plan.ops[id.0].schema = values::schema_of(&merged, true)?;
        values::add_symbols(ctx, &merged);

        consume_parent(plan, id, ctx, exprs)?;

        values::clear_set(ctx, &merged);
        ctx.clear(tuple_addr);
    }
    close_scan_loop(ctx, scan);

    // losers of the guard land here, past the whole operator
    let place = ctx.ir.place_label(end_label);
    ctx.emit_pipe_foot(place);

    if owns_pipeline {
        ctx.close_pipeline();
    }
    Ok(())
}
