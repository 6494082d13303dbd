//! Selection and projection.

use flounder_error::Result;
use flounder_sql::ExprArena;
use flounder_types::{symbol_set_union, SymbolSet};

use super::{consume_parent, produce, OpId, OpKind, Plan};
use crate::context::JitContext;
use crate::exprgen::emit_expression;
use crate::values;

pub fn selection_produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    // remember the requested attributes and extend the child request by the
    // ones the predicate reads
    let condition = match &mut plan.ops[id.0].kind {
        OpKind::Selection {
            condition,
            request: saved,
        } => {
            *saved = request.clone();
            *condition
        }
        _ => unreachable!("selection produce on non-selection"),
    };
    let selection_req = exprs.required_attributes(condition);
    let child = plan.child(id, 0);
    produce(plan, child, ctx, exprs, symbol_set_union(&request, &selection_req))
}

pub fn selection_consume(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
) -> Result<()> {
    let child = plan.child(id, 0);
    let child_schema = plan.op(child).schema.clone();
    let (condition, request) = match &plan.op(id).kind {
        OpKind::Selection { condition, request } => (*condition, request.clone()),
        _ => unreachable!(),
    };

    // attributes only the predicate needed drop out of the result
    plan.ops[id.0].schema = if ctx.request_all {
        child_schema
    } else {
        child_schema.prune(&request)?
    };

    ctx.comment(" --- Selection");
    exprs.assign_id(condition, &mut ctx.rel.expr_id_gen);
    let condition_result = emit_expression(ctx, exprs, condition)?;
    let zero = ctx.ir.const_i8(0);
    let cmp = ctx.ir.cmp(condition_result, zero);
    ctx.emit(cmp);
    let next = ctx
        .label_next_tuple
        .expect("selection outside a tuple loop");
    let je = ctx.ir.je(next);
    ctx.emit(je);
    ctx.clear(condition_result);

    consume_parent(plan, id, ctx, exprs)
}

pub fn projection_produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    _request: SymbolSet,
) -> Result<()> {
    let list = match &plan.op(id).kind {
        OpKind::Projection { exprs } => exprs.clone(),
        _ => unreachable!("projection produce on non-projection"),
    };

    if let Some(&child) = plan.op(id).children.first() {
        // the request is replaced by what the projection list needs
        let req = exprs.required_attributes_of(&list);
        produce(plan, child, ctx, exprs, req)
    } else {
        // leaf projection: a one-row constant table
        let owns_pipeline = ctx.rel.inner_scan_count == 0;
        if owns_pipeline {
            ctx.open_pipeline();
        }
        projection_consume(plan, id, ctx, exprs)?;
        if owns_pipeline {
            ctx.close_pipeline();
        }
        Ok(())
    }
}

pub fn projection_consume(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
) -> Result<()> {
    let list = match &plan.op(id).kind {
        OpKind::Projection { exprs } => exprs.clone(),
        _ => unreachable!(),
    };
    ctx.comment(" --- Projection");
    let proj_vals = values::eval_expressions(ctx, exprs, &list)?;
    values::add_symbols(ctx, &proj_vals);
    plan.ops[id.0].schema = values::schema_of(&proj_vals, true)?;
    consume_parent(plan, id, ctx, exprs)?;
    values::clear_set(ctx, &proj_vals);
    Ok(())
}
