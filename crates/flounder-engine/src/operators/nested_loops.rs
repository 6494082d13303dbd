//! Nested-loops join. Both children are wrapped in materialize steps so the
//! inner side can be restarted once per outer tuple.

use flounder_error::{FlounderError, Result};
use flounder_sql::ExprArena;
use flounder_types::SymbolSet;

use super::{consume_parent, materialize, produce as produce_op, OpId, OpKind, Plan};
use crate::context::JitContext;
use crate::exprgen::emit_expression;

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    let left = plan.child(id, 0);
    let right = plan.child(id, 1);
    produce_op(plan, left, ctx, exprs, request.clone())?;
    produce_op(plan, right, ctx, exprs, request)?;

    let owns_pipeline = ctx.rel.inner_scan_count == 0;
    if owns_pipeline {
        ctx.open_pipeline();
    }
    materialize::produce_scan_table(plan, right, ctx, exprs, false)?;
    if owns_pipeline {
        ctx.close_pipeline();
    }
    Ok(())
}

pub fn consume(plan: &mut Plan, id: OpId, ctx: &mut JitContext, exprs: &mut ExprArena) -> Result<()> {
    let (n_call, condition) = match &mut plan.ops[id.0].kind {
        OpKind::NestedLoopsJoin { n_call, condition } => {
            *n_call += 1;
            (*n_call, *condition)
        }
        _ => unreachable!("nested loops consume on non-join"),
    };

    match n_call {
        1 => {
            // an outer tuple arrived: replay the left side as the inner scan
            let left = plan.child(id, 0);
            ctx.rel.inner_scan_count += 1;
            materialize::produce_scan_table(plan, left, ctx, exprs, true)?;
            ctx.rel.inner_scan_count -= 1;
            Ok(())
        }
        2 => {
            let left = plan.child(id, 0);
            let right = plan.child(id, 1);
            plan.ops[id.0].schema = plan.op(left).schema.join(&plan.op(right).schema)?;
            if let Some(condition) = condition {
                exprs.assign_id(condition, &mut ctx.rel.expr_id_gen);
                let condition_result = emit_expression(ctx, exprs, condition)?;
                let zero = ctx.ir.const_i8(0);
                let cmp = ctx.ir.cmp(condition_result, zero);
                ctx.emit(cmp);
                let next = ctx
                    .label_next_tuple
                    .expect("join condition outside a tuple loop");
                let je = ctx.ir.je(next);
                ctx.emit(je);
                ctx.clear(condition_result);
            }
            consume_parent(plan, id, ctx, exprs)
        }
        _ => Err(FlounderError::codegen(
            "nested loops join consumed more than twice",
        )),
    }
}
