//! ORDER BY: materialize the whole input, then sort it in place under the
//! single-thread guard.

use flounder_error::{FlounderError, Result};
use flounder_runtime::{
    guard_enter, sort_relation, OrderRequest, OrderRequestList, SingleThreadGuard,
};
use flounder_sql::ExprArena;
use flounder_storage::Relation;
use flounder_types::SymbolSet;

use super::{produce as produce_op, OpId, OpKind, Plan};
use crate::context::JitContext;

fn sort_addr() -> u64 {
    sort_relation as unsafe extern "C" fn(*mut Relation, *const OrderRequestList) as usize as u64
}

fn guard_enter_addr() -> u64 {
    guard_enter as unsafe extern "C" fn(*mut SingleThreadGuard) -> u8 as usize as u64
}

pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    let child = plan.child(id, 0);
    produce_op(plan, child, ctx, exprs, request)?;

    // map the order expressions onto tuple offsets of the materialized
    // relation
    let schema = plan.op(child).schema.clone();
    plan.ops[id.0].schema = schema.clone();
    let order = match &plan.op(id).kind {
        OpKind::OrderBy { order, .. } => order.clone(),
        _ => unreachable!("order by produce on non-order-by"),
    };
    let mut requests: OrderRequestList = Vec::with_capacity(order.len());
    for &e in &order {
        let node = exprs.node(e);
        let is_ascending = node.tag != flounder_sql::ExprTag::Desc;
        let inner = node.child.expect("order expression child");
        let symbol = exprs.node(inner).symbol.clone();
        if !schema.contains(&symbol) {
            return Err(FlounderError::NoSuchAttribute { name: symbol });
        }
        requests.push(OrderRequest {
            offset: schema.offset_of(&symbol)?,
            ty: schema.type_of(&symbol)?,
            ascending: is_ascending,
        });
    }

    let rel_addr = match &mut plan.ops[child.0].kind {
        OpKind::Materialize { rel_out, .. } => {
            let rel = rel_out
                .as_mut()
                .ok_or_else(|| FlounderError::codegen("sort of unmaterialized input"))?;
            (&mut **rel) as *mut Relation as usize as u64
        }
        _ => return Err(FlounderError::internal("order by without materialize child")),
    };
    let (requests_addr, guard_addr) = match &mut plan.ops[id.0].kind {
        OpKind::OrderBy {
            requests: saved,
            guard,
            ..
        } => {
            *saved = Some(Box::new(requests));
            *guard = Some(Box::new(SingleThreadGuard::new(ctx.num_threads())));
            let requests_addr = (&**saved.as_ref().expect("just set")) as *const OrderRequestList
                as usize as u64;
            let guard_addr = (&mut **guard.as_mut().expect("just set"))
                as *mut SingleThreadGuard as usize as u64;
            (requests_addr, guard_addr)
        }
        _ => unreachable!(),
    };

    // only the guard winner sorts; the others skip to the end
    ctx.comment(" --- Sort");
    let enter_v = ctx.ir.vreg8("guardEnter");
    let enter = ctx.request(enter_v);
    let guard_const = ctx.ir.const_address(guard_addr);
    let mc = ctx.ir.mcall(enter, guard_enter_addr(), &[guard_const]);
    ctx.emit(mc);
    let zero = ctx.ir.const_i8(0);
    let cmp = ctx.ir.cmp(enter, zero);
    ctx.emit(cmp);
    ctx.clear(enter);
    let end_label = ctx.ir.id_label("afterSort");
    let je = ctx.ir.je(end_label);
    ctx.emit(je);

    let foo_v = ctx.ir.vreg64("sortReturn");
    let foo = ctx.request(foo_v);
    let rel_c = ctx.ir.const_address(rel_addr);
    let rel_const = ctx.ir.const_load(rel_c);
    let req_c = ctx.ir.const_address(requests_addr);
    let req_const = ctx.ir.const_load(req_c);
    let mc = ctx.ir.mcall(foo, sort_addr(), &[rel_const, req_const]);
    ctx.emit(mc);
    ctx.clear(foo);

    let place = ctx.ir.place_label(end_label);
    ctx.emit(place);
    Ok(())
}
