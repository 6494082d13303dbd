//! Hash join over fixed equality conditions. The left child is the build
//! side; a barrier separates the build pipeline from the probe pipeline.

use flounder_error::{FlounderError, Result};
use flounder_ir::{Comparator, NodeId, WhileLoop};
use flounder_runtime::{barrier_wait, ht_get, ht_put, BuildBarrier, HashTable};
use flounder_sql::ExprArena;
use flounder_types::{symbol_set_union, Schema, SymbolSet};

use super::{consume_parent, produce as produce_op, OpId, OpKind, Plan};
use crate::context::JitContext;
use crate::values::{self, ValueSet, HT_MAT_CONFIG};

fn ht_put_addr() -> u64 {
    ht_put as unsafe extern "C" fn(*mut HashTable, u64) -> *mut u8 as usize as u64
}

fn ht_get_addr() -> u64 {
    ht_get as unsafe extern "C" fn(*mut HashTable, u64, *const u8) -> *mut u8 as usize as u64
}

fn barrier_wait_addr() -> u64 {
    barrier_wait as unsafe extern "C" fn(*mut BuildBarrier) as usize as u64
}

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    let equalities = match &mut plan.ops[id.0].kind {
        OpKind::HashJoin {
            equalities,
            request: saved,
            barrier,
            ..
        } => {
            *saved = request.clone();
            *barrier = Some(Box::new(BuildBarrier::new(ctx.num_threads())));
            equalities.clone()
        }
        _ => unreachable!("hash join produce on non-join"),
    };

    let join_req = exprs.required_attributes_of(&equalities);
    let all_req = symbol_set_union(&request, &join_req);

    let left = plan.child(id, 0);
    produce_op(plan, left, ctx, exprs, all_req.clone())?;

    // all workers rendezvous between build and probe
    let barrier_addr = match &mut plan.ops[id.0].kind {
        OpKind::HashJoin { barrier, .. } => {
            (&mut **barrier.as_mut().expect("barrier set")) as *mut BuildBarrier as usize as u64
        }
        _ => unreachable!(),
    };
    let foo_v = ctx.ir.vreg64("sync");
    let foo = ctx.request(foo_v);
    let barrier_const = ctx.ir.const_address(barrier_addr);
    let mc = ctx.ir.mcall(foo, barrier_wait_addr(), &[barrier_const]);
    ctx.emit(mc);
    ctx.clear(foo);

    let right = plan.child(id, 1);
    produce_op(plan, right, ctx, exprs, all_req)
}

fn consume_build(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
) -> Result<()> {
    ctx.comment(" --- Hash join build");
    let equalities = match &plan.op(id).kind {
        OpKind::HashJoin { equalities, .. } => equalities.clone(),
        _ => unreachable!(),
    };
    let left_schema = plan.op(plan.child(id, 0)).schema.clone();

    // build keys and the values carried through the table
    let left_exprs = exprs.equalities_left(&equalities);
    let build_keys = values::eval_expressions(ctx, exprs, &left_exprs)?;
    let build_keys_schema = values::schema_of(&build_keys, HT_MAT_CONFIG.strings_by_val)?;
    let build_vals = values::get(ctx, &left_schema)?;

    // allocate the table sized by the build-side estimate
    let keys_size = values::byte_size(&build_keys, HT_MAT_CONFIG.strings_by_val)?;
    let entry_size =
        keys_size + values::byte_size(&build_vals, HT_MAT_CONFIG.strings_by_val)?;
    let build_estimate = plan.size_estimate(plan.child(id, 0));
    let table = HashTable::allocate(build_estimate * 5 / 3, entry_size);
    let ht_addr = match &mut plan.ops[id.0].kind {
        OpKind::HashJoin {
            ht,
            build_keys_schema: saved_schema,
            ..
        } => {
            *saved_schema = build_keys_schema;
            *ht = Some(table);
            (&mut **ht.as_mut().expect("just set")) as *mut HashTable as usize as u64
        }
        _ => unreachable!(),
    };

    // hash the keys and claim a slot
    let build_hash = values::hash_set(ctx, &build_keys)?;
    let entry_v = ctx.ir.vreg64("htEntry");
    let ht_entry = ctx.request(entry_v);
    let ht_const = ctx.ir.const_address(ht_addr);
    let mc = ctx.ir.mcall(ht_entry, ht_put_addr(), &[ht_const, build_hash]);
    ctx.emit(mc);
    ctx.clear(build_hash);

    // keys first, values behind them
    values::materialize(ctx, &build_keys, ht_entry, HT_MAT_CONFIG)?;
    values::clear_set(ctx, &build_keys);
    let offset = ctx.ir.const_i64(keys_size as i64);
    let add = ctx.ir.add(ht_entry, offset);
    ctx.emit(add);
    values::materialize(ctx, &build_vals, ht_entry, HT_MAT_CONFIG)?;
    values::clear_set(ctx, &build_vals);
    ctx.clear(ht_entry);
    Ok(())
}

/// Multi-match probe: the while head doubles as the continue label, so a
/// parent's "next tuple" walks to the next match.
fn consume_multi_match(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    ht_addr: u64,
    probe_hash: NodeId,
    probe_keys: ValueSet,
    build_keys_schema: &Schema,
    left_schema: &Schema,
) -> Result<()> {
    let entry_v = ctx.ir.vreg64("htProbeEntry");
    let probe_entry = ctx.request(entry_v);
    let null = ctx.ir.const_address(0);
    let mov = ctx.ir.mov(probe_entry, null);
    ctx.emit(mov);

    let while_loop = WhileLoop::new_unconditional(&mut ctx.ir, ctx.code_tree);
    ctx.label_next_tuple = Some(while_loop.head_label);

    let ht_const = ctx.ir.const_address(ht_addr);
    let mc = ctx.ir.mcall(
        probe_entry,
        ht_get_addr(),
        &[ht_const, probe_hash, probe_entry],
    );
    ctx.emit(mc);
    let null = ctx.ir.const_address(0);
    while_loop.break_if(&mut ctx.ir, Comparator::IsEqual(probe_entry, null));

    // reject hash collisions by comparing the stored keys
    let entry_keys = values::dematerialize(ctx, probe_entry, build_keys_schema, HT_MAT_CONFIG, None)?;
    values::check_equality_jump(ctx, &probe_keys, &entry_keys, while_loop.head_label)?;
    let keys_size = values::byte_size(&entry_keys, HT_MAT_CONFIG.strings_by_val)?;
    values::clear_set(ctx, &entry_keys);

    // the values sit behind the keys in the entry
    let loc_v = ctx.ir.vreg64("buildValueLoc");
    let value_loc = ctx.request(loc_v);
    let mov = ctx.ir.mov(value_loc, probe_entry);
    ctx.emit(mov);
    let offset = ctx.ir.const_i64(keys_size as i64);
    let add = ctx.ir.add(value_loc, offset);
    ctx.emit(add);
    let entry_values = values::dematerialize(ctx, value_loc, left_schema, HT_MAT_CONFIG, None)?;
    values::add_symbols(ctx, &entry_values);

    consume_parent(plan, id, ctx, exprs)?;

    values::clear_set(ctx, &entry_values);
    ctx.clear(value_loc);
    while_loop.close(&mut ctx.ir);

    ctx.clear(probe_entry);
    ctx.clear(probe_hash);
    values::clear_set(ctx, &probe_keys);
    Ok(())
}

/// Single-match probe for known-unique build keys: the first key match
/// jumps forward, further matches are not searched.
fn consume_single_match(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    ht_addr: u64,
    probe_hash: NodeId,
    probe_keys: ValueSet,
    build_keys_schema: &Schema,
    left_schema: &Schema,
) -> Result<()> {
    let entry_v = ctx.ir.vreg64("htProbeEntry");
    let probe_entry = ctx.request(entry_v);
    let null = ctx.ir.const_address(0);
    let mov = ctx.ir.mov(probe_entry, null);
    ctx.emit(mov);
    let found_match = ctx.ir.id_label("foundMatch");
    let mut keys_size = 0usize;

    let while_loop = WhileLoop::new_unconditional(&mut ctx.ir, ctx.code_tree);
    {
        let ht_const = ctx.ir.const_address(ht_addr);
        let mc = ctx.ir.mcall(
            probe_entry,
            ht_get_addr(),
            &[ht_const, probe_hash, probe_entry],
        );
        ctx.emit(mc);
        let null = ctx.ir.const_address(0);
        let cmp = ctx.ir.cmp(probe_entry, null);
        ctx.emit(cmp);
        let next = ctx.label_next_tuple.expect("probe outside a tuple loop");
        let je = ctx.ir.je(next);
        ctx.emit(je);

        let entry_keys =
            values::dematerialize(ctx, probe_entry, build_keys_schema, HT_MAT_CONFIG, None)?;
        keys_size = values::byte_size(&entry_keys, HT_MAT_CONFIG.strings_by_val)?;
        values::check_equality_jump_if_true(ctx, &probe_keys, &entry_keys, found_match)?;
        values::clear_set(ctx, &entry_keys);
    }
    while_loop.close(&mut ctx.ir);
    ctx.clear(probe_hash);
    values::clear_set(ctx, &probe_keys);

    let place = ctx.ir.place_label(found_match);
    ctx.emit(place);

    let loc_v = ctx.ir.vreg64("buildValueLoc");
    let value_loc = ctx.request(loc_v);
    let mov = ctx.ir.mov(value_loc, probe_entry);
    ctx.emit(mov);
    ctx.clear(probe_entry);
    let offset = ctx.ir.const_i64(keys_size as i64);
    let add = ctx.ir.add(value_loc, offset);
    ctx.emit(add);
    let entry_values = values::dematerialize(ctx, value_loc, left_schema, HT_MAT_CONFIG, None)?;
    values::add_symbols(ctx, &entry_values);

    consume_parent(plan, id, ctx, exprs)?;

    values::clear_set(ctx, &entry_values);
    ctx.clear(value_loc);
    Ok(())
}

pub fn consume(plan: &mut Plan, id: OpId, ctx: &mut JitContext, exprs: &mut ExprArena) -> Result<()> {
    let n_call = match &mut plan.ops[id.0].kind {
        OpKind::HashJoin { n_call, .. } => {
            *n_call += 1;
            *n_call
        }
        _ => unreachable!("hash join consume on non-join"),
    };

    match n_call {
        1 => consume_build(plan, id, ctx, exprs),
        2 => {
            ctx.comment(" --- Hash join probe");
            let (equalities, single_match, request, build_keys_schema, ht_addr) =
                match &mut plan.ops[id.0].kind {
                    OpKind::HashJoin {
                        equalities,
                        single_match,
                        request,
                        build_keys_schema,
                        ht,
                        ..
                    } => (
                        equalities.clone(),
                        *single_match,
                        request.clone(),
                        build_keys_schema.clone(),
                        (&mut **ht.as_mut().expect("build ran")) as *mut HashTable as usize
                            as u64,
                    ),
                    _ => unreachable!(),
                };

            let left_schema = plan.op(plan.child(id, 0)).schema.clone();
            let right_schema = plan.op(plan.child(id, 1)).schema.clone();
            let mut schema = left_schema.join(&right_schema)?;
            if !ctx.request_all {
                schema = schema.prune(&request)?;
            }
            plan.ops[id.0].schema = schema;

            let right_exprs = exprs.equalities_right(&equalities);
            let probe_keys = values::eval_expressions(ctx, exprs, &right_exprs)?;
            let probe_hash = values::hash_set(ctx, &probe_keys)?;

            if single_match {
                consume_single_match(
                    plan,
                    id,
                    ctx,
                    exprs,
                    ht_addr,
                    probe_hash,
                    probe_keys,
                    &build_keys_schema,
                    &left_schema,
                )
            } else {
                consume_multi_match(
                    plan,
                    id,
                    ctx,
                    exprs,
                    ht_addr,
                    probe_hash,
                    probe_keys,
                    &build_keys_schema,
                    &left_schema,
                )
            }
        }
        _ => Err(FlounderError::codegen("hash join consumed more than twice")),
    }
}
