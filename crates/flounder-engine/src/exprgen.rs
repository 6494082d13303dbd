//! Scalar expression emission.
//!
//! Dispatch on the structure tag first, then on the tag; per-type dispatch
//! only covers the supported pairs and errors otherwise. Before any
//! emission the symbol table is consulted for the expression's canonical
//! name, so pre-computed values (scan attributes, aliases, group results)
//! are reused instead of recomputed.

use flounder_error::{FlounderError, Result};
use flounder_ir::{Mreg, NodeId};
use flounder_runtime::{cmp_char, cmp_varchar, string_like, DECIMAL_FACTORS};
use flounder_sql::{ExprArena, ExprId, ExprTag, Structure};
use flounder_types::{SqlType, SqlValue, TypeTag};

use crate::context::JitContext;

fn cmp_varchar_addr() -> u64 {
    cmp_varchar as unsafe extern "C" fn(*const u8, *const u8) -> u8 as usize as u64
}

fn cmp_char_addr() -> u64 {
    cmp_char as unsafe extern "C" fn(*const u8, *const u8) -> u8 as usize as u64
}

fn like_addr() -> u64 {
    string_like as unsafe extern "C" fn(*const u8, *const u8) -> u8 as usize as u64
}

// --- constants -------------------------------------------------------------

fn emit_constant_i64(ctx: &mut JitContext, name: &str, val: i64) -> NodeId {
    let v = ctx.ir.vreg64(name);
    let res = ctx.request(v);
    let c = ctx.ir.const_i64(val);
    let mov = ctx.ir.mov(res, c);
    ctx.emit(mov);
    res
}

fn emit_constant_i32(ctx: &mut JitContext, name: &str, val: i32) -> NodeId {
    let v = ctx.ir.vreg32(name);
    let res = ctx.request(v);
    let c = ctx.ir.const_i32(val);
    let mov = ctx.ir.mov(res, c);
    ctx.emit(mov);
    res
}

fn emit_constant(ctx: &mut JitContext, ty: SqlType, val: SqlValue) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal => Ok(emit_constant_i64(ctx, "decimal_constant", val.as_i64())),
        TypeTag::Bigint => Ok(emit_constant_i64(ctx, "bigint_constant", val.as_i64())),
        TypeTag::Int => Ok(emit_constant_i32(ctx, "int_constant", val.as_i32())),
        TypeTag::Date => Ok(emit_constant_i32(ctx, "date_constant", val.as_u32() as i32)),
        TypeTag::Float => {
            let v = ctx.ir.vreg64("float_constant");
            let res = ctx.request(v);
            let c = ctx.ir.const_f64(val.as_f64());
            let mov = ctx.ir.mov(res, c);
            ctx.emit(mov);
            Ok(res)
        }
        TypeTag::Bool => {
            let v = ctx.ir.vreg8("bool_constant");
            let res = ctx.request(v);
            let c = ctx.ir.const_i8(i8::from(val.as_bool()));
            let mov = ctx.ir.mov(res, c);
            ctx.emit(mov);
            Ok(res)
        }
        TypeTag::Char if ty.len == 1 => {
            // load the single character from the constant's address
            let v = ctx.ir.vreg8("char1_constant");
            let res = ctx.request(v);
            let addr = ctx.ir.const_address(val.as_ptr() as u64);
            let load = ctx.ir.const_load(addr);
            let mem = ctx.ir.mem_at(load);
            let mov = ctx.ir.mov(res, mem);
            ctx.emit(mov);
            Ok(res)
        }
        TypeTag::Char => {
            let v = ctx.ir.vreg64("char_constant");
            let res = ctx.request(v);
            let addr = ctx.ir.const_address(val.as_ptr() as u64);
            let mov = ctx.ir.mov(res, addr);
            ctx.emit(mov);
            Ok(res)
        }
        TypeTag::Varchar => {
            let v = ctx.ir.vreg64("varchar_constant");
            let res = ctx.request(v);
            let addr = ctx.ir.const_address(val.as_ptr() as u64);
            let mov = ctx.ir.mov(res, addr);
            ctx.emit(mov);
            Ok(res)
        }
        TypeTag::Nt => Err(FlounderError::not_implemented(
            "constant emission for undefined type",
        )),
    }
}

// --- arithmetic ------------------------------------------------------------

fn emit_add_i64(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg64("add_result");
    let res = ctx.request(v);
    let mov = ctx.ir.mov(res, left);
    ctx.emit(mov);
    let add = ctx.ir.add(res, right);
    ctx.emit(add);
    res
}

pub fn emit_add(ctx: &mut JitContext, ty: SqlType, left: NodeId, right: NodeId) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Bigint => Ok(emit_add_i64(ctx, left, right)),
        other => Err(FlounderError::not_implemented(format!(
            "ADD for {}",
            other.name()
        ))),
    }
}

fn emit_sub_i64(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg64("sub_result");
    let res = ctx.request(v);
    let mov = ctx.ir.mov(res, left);
    ctx.emit(mov);
    let sub = ctx.ir.sub(res, right);
    ctx.emit(sub);
    res
}

fn emit_sub(ctx: &mut JitContext, ty: SqlType, left: NodeId, right: NodeId) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Bigint => Ok(emit_sub_i64(ctx, left, right)),
        other => Err(FlounderError::not_implemented(format!(
            "SUB for {}",
            other.name()
        ))),
    }
}

pub fn emit_mul_i64(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg64("mul_result");
    let res = ctx.request(v);
    let mov = ctx.ir.mov(res, left);
    ctx.emit(mov);
    let mul = ctx.ir.imul(res, right);
    ctx.emit(mul);
    res
}

fn emit_mul(ctx: &mut JitContext, ty: SqlType, left: NodeId, right: NodeId) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Bigint => Ok(emit_mul_i64(ctx, left, right)),
        other => Err(FlounderError::not_implemented(format!(
            "MUL for {}",
            other.name()
        ))),
    }
}

/// Signed division through the fixed rax/rcx assignment.
pub fn emit_div_i64(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg64("div_result");
    let res = ctx.request(v);
    let rax = ctx.ir.mreg64(Mreg::Rax);
    let mov = ctx.ir.mov(rax, left);
    ctx.emit(mov);
    let rcx = ctx.ir.mreg64(Mreg::Rcx);
    let mov = ctx.ir.mov(rcx, right);
    ctx.emit(mov);
    let cqo = ctx.ir.cqo();
    ctx.emit(cqo);
    let rcx = ctx.ir.mreg64(Mreg::Rcx);
    let idiv = ctx.ir.idiv(rcx);
    ctx.emit(idiv);
    let rax = ctx.ir.mreg64(Mreg::Rax);
    let mov = ctx.ir.mov(res, rax);
    ctx.emit(mov);
    res
}

fn emit_div(ctx: &mut JitContext, ty: SqlType, left: NodeId, right: NodeId) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Bigint => Ok(emit_div_i64(ctx, left, right)),
        other => Err(FlounderError::not_implemented(format!(
            "DIV for {}",
            other.name()
        ))),
    }
}

// --- boolean connectives ---------------------------------------------------

fn emit_and(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg8("and_result");
    let res = ctx.request(v);
    let mov = ctx.ir.mov(res, left);
    ctx.emit(mov);
    let and = ctx.ir.and(res, right);
    ctx.emit(and);
    res
}

fn emit_or(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg8("or_result");
    let res = ctx.request(v);
    let mov = ctx.ir.mov(res, left);
    ctx.emit(mov);
    let or = ctx.ir.or(res, right);
    ctx.emit(or);
    res
}

// --- comparisons -----------------------------------------------------------

/// `cmp` + conditional jump over the "set to 1", yielding a bool 0/1.
fn emit_compare(
    ctx: &mut JitContext,
    label_prefix: &str,
    left: NodeId,
    right: NodeId,
    inverse_jump: fn(&mut flounder_ir::IrArena, NodeId) -> NodeId,
) -> NodeId {
    let v = ctx.ir.vreg8(&format!("{label_prefix}_result"));
    let res = ctx.request(v);
    let lbl = ctx.ir.id_label(&format!("{label_prefix}_false"));
    let zero = ctx.ir.const_i8(0);
    let mov = ctx.ir.mov(res, zero);
    ctx.emit(mov);
    let cmp = ctx.ir.cmp(left, right);
    ctx.emit(cmp);
    let jump = inverse_jump(&mut ctx.ir, lbl);
    ctx.emit(jump);
    let one = ctx.ir.const_i8(1);
    let mov = ctx.ir.mov(res, one);
    ctx.emit(mov);
    let place = ctx.ir.place_label(lbl);
    ctx.emit(place);
    res
}

pub fn emit_less_than(
    ctx: &mut JitContext,
    ty: SqlType,
    left: NodeId,
    right: NodeId,
) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Date | TypeTag::Bigint | TypeTag::Int => Ok(emit_compare(
            ctx,
            "lt",
            left,
            right,
            |ir, l| ir.jge(l),
        )),
        other => Err(FlounderError::not_implemented(format!(
            "LESS_THAN for {}",
            other.name()
        ))),
    }
}

fn emit_less_equal(
    ctx: &mut JitContext,
    ty: SqlType,
    left: NodeId,
    right: NodeId,
) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Date | TypeTag::Bigint | TypeTag::Int => Ok(emit_compare(
            ctx,
            "le",
            left,
            right,
            |ir, l| ir.jg(l),
        )),
        other => Err(FlounderError::not_implemented(format!(
            "LE for {}",
            other.name()
        ))),
    }
}

pub fn emit_greater_than(
    ctx: &mut JitContext,
    ty: SqlType,
    left: NodeId,
    right: NodeId,
) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Date | TypeTag::Bigint | TypeTag::Int => Ok(emit_compare(
            ctx,
            "gt",
            left,
            right,
            |ir, l| ir.jle(l),
        )),
        other => Err(FlounderError::not_implemented(format!(
            "GT for {}",
            other.name()
        ))),
    }
}

fn emit_greater_equal(
    ctx: &mut JitContext,
    ty: SqlType,
    left: NodeId,
    right: NodeId,
) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal | TypeTag::Date | TypeTag::Bigint | TypeTag::Int => Ok(emit_compare(
            ctx,
            "ge",
            left,
            right,
            |ir, l| ir.jl(l),
        )),
        other => Err(FlounderError::not_implemented(format!(
            "GE for {}",
            other.name()
        ))),
    }
}

pub fn emit_equals(
    ctx: &mut JitContext,
    ty: SqlType,
    left: NodeId,
    right: NodeId,
) -> Result<NodeId> {
    match ty.tag {
        TypeTag::Decimal
        | TypeTag::Int
        | TypeTag::Bigint
        | TypeTag::Bool
        | TypeTag::Date => Ok(emit_compare(ctx, "eq", left, right, |ir, l| ir.jne(l))),
        TypeTag::Char => {
            if ty.len > 1 {
                let v = ctx.ir.vreg8("equals_char_result");
                let res = ctx.request(v);
                let mc = ctx.ir.mcall(res, cmp_char_addr(), &[left, right]);
                ctx.emit(mc);
                Ok(res)
            } else {
                Ok(emit_compare(ctx, "eq", left, right, |ir, l| ir.jne(l)))
            }
        }
        TypeTag::Varchar => {
            let v = ctx.ir.vreg8("equals_varchar_result");
            let res = ctx.request(v);
            let mc = ctx.ir.mcall(res, cmp_varchar_addr(), &[left, right]);
            ctx.emit(mc);
            Ok(res)
        }
        other => Err(FlounderError::not_implemented(format!(
            "EQUALS for {}",
            other.name()
        ))),
    }
}

fn emit_like(ctx: &mut JitContext, left: NodeId, right: NodeId) -> NodeId {
    let v = ctx.ir.vreg8("like_result");
    let res = ctx.request(v);
    let mc = ctx.ir.mcall(res, like_addr(), &[left, right]);
    ctx.emit(mc);
    res
}

// --- typecasts -------------------------------------------------------------

fn emit_typecast_decimal_to_decimal(
    ctx: &mut JitContext,
    from: SqlType,
    to: SqlType,
    child: NodeId,
) -> Result<NodeId> {
    if to.scale == from.scale {
        tracing::warn!("unnecessary decimal typecast");
        return Ok(child);
    }
    if to.scale > from.scale {
        let factor = DECIMAL_FACTORS[(to.scale - from.scale) as usize];
        let c = ctx.ir.const_i64(factor);
        Ok(emit_mul_i64(ctx, child, c))
    } else {
        let divisor = DECIMAL_FACTORS[(from.scale - to.scale) as usize];
        let c = ctx.ir.const_i64(divisor);
        Ok(emit_div_i64(ctx, child, c))
    }
}

fn emit_typecast(
    ctx: &mut JitContext,
    from: SqlType,
    to: SqlType,
    child: NodeId,
) -> Result<NodeId> {
    match (from.tag, to.tag) {
        (TypeTag::Decimal, TypeTag::Decimal) => {
            emit_typecast_decimal_to_decimal(ctx, from, to, child)
        }
        (TypeTag::Bigint, TypeTag::Decimal) => {
            let factor = DECIMAL_FACTORS[to.scale as usize];
            let c = ctx.ir.const_i64(factor);
            Ok(emit_mul_i64(ctx, child, c))
        }
        (TypeTag::Int, TypeTag::Bigint) => {
            let v = ctx.ir.vreg64("typecast_bigint");
            let res = ctx.request(v);
            let mov = ctx.ir.movsx(res, child);
            ctx.emit(mov);
            Ok(res)
        }
        (TypeTag::Decimal, TypeTag::Bigint) => {
            let divisor = DECIMAL_FACTORS[from.scale as usize];
            let c = ctx.ir.const_i64(divisor);
            Ok(emit_div_i64(ctx, child, c))
        }
        (TypeTag::Bigint, TypeTag::Bigint) => {
            tracing::warn!("typecast from BIGINT to BIGINT");
            Ok(child)
        }
        (TypeTag::Int, TypeTag::Decimal) => {
            // widen first, then scale
            let v = ctx.ir.vreg64("typecast_bigint");
            let wide = ctx.request(v);
            let mov = ctx.ir.movsx(wide, child);
            ctx.emit(mov);
            let factor = DECIMAL_FACTORS[to.scale as usize];
            let c = ctx.ir.const_i64(factor);
            let res = emit_mul_i64(ctx, wide, c);
            ctx.clear(wide);
            Ok(res)
        }
        (f, t) => Err(FlounderError::not_implemented(format!(
            "typecast from {} to {}",
            f.name(),
            t.name()
        ))),
    }
}

// --- case ------------------------------------------------------------------

fn emit_case(ctx: &mut JitContext, exprs: &mut ExprArena, e: ExprId) -> Result<NodeId> {
    let res_ty = exprs.node(e).ty;
    let res = ctx.vreg_for_type(res_ty, true)?;
    let after_case = ctx.ir.id_label("afterCase");

    let mut child = exprs.node(e).child;
    while let Some(c) = child {
        if exprs.node(c).tag != ExprTag::WhenThen {
            break;
        }
        let when = exprs.node(c).child.expect("when expression");
        let then = exprs.node(when).next.expect("then expression");
        let next_when = ctx.ir.id_label("nextWhen");
        let when_res = emit_expression(ctx, exprs, when)?;
        let zero = ctx.ir.const_i8(0);
        let cmp = ctx.ir.cmp(when_res, zero);
        ctx.emit(cmp);
        let je = ctx.ir.je(next_when);
        ctx.emit(je);
        let then_res = emit_expression(ctx, exprs, then)?;
        let mov = ctx.ir.mov(res, then_res);
        ctx.emit(mov);
        let jmp = ctx.ir.jmp(after_case);
        ctx.emit(jmp);
        ctx.clear(when_res);
        ctx.clear(then_res);
        let place = ctx.ir.place_label(next_when);
        ctx.emit(place);
        child = exprs.node(c).next;
    }

    // optional ELSE
    if let Some(els) = child {
        let else_res = emit_expression(ctx, exprs, els)?;
        let mov = ctx.ir.mov(res, else_res);
        ctx.emit(mov);
        ctx.clear(else_res);
    }
    let place = ctx.ir.place_label(after_case);
    ctx.emit(place);
    Ok(res)
}

// --- dispatch --------------------------------------------------------------

fn emit_literal(ctx: &mut JitContext, exprs: &ExprArena, e: ExprId) -> Result<NodeId> {
    let node = exprs.node(e);
    match node.tag {
        ExprTag::Attribute => {
            let source = ctx.symbol(&node.symbol)?;
            let res = ctx.vreg_for_type(node.ty, true)?;
            let mov = ctx.ir.mov(res, source);
            ctx.emit(mov);
            Ok(res)
        }
        ExprTag::Constant => emit_constant(ctx, node.ty, node.value),
        other => Err(FlounderError::not_implemented(format!(
            "expression emission for literal {}",
            other.name()
        ))),
    }
}

fn emit_unary(ctx: &mut JitContext, exprs: &mut ExprArena, e: ExprId) -> Result<NodeId> {
    let child = exprs.node(e).child.expect("unary child");

    // COUNT(*) never evaluates its argument
    if exprs.node(e).tag == ExprTag::Count && exprs.node(child).tag == ExprTag::Star {
        return Ok(emit_constant_i64(ctx, "bigint_constant", 1));
    }

    let child_val = emit_expression(ctx, exprs, child)?;

    let tag = exprs.node(e).tag;
    let expr_ty = exprs.node(e).ty;
    let child_ty = exprs.node(child).ty;

    let res = match tag {
        // in scalar position aggregates pass their increment through; the
        // real accumulation happens in the aggregation operator
        ExprTag::Sum | ExprTag::Avg | ExprTag::Min | ExprTag::Max => {
            let res = ctx.vreg_for_type(child_ty, true)?;
            let mov = ctx.ir.mov(res, child_val);
            ctx.emit(mov);
            res
        }
        ExprTag::As => {
            let res = ctx.vreg_for_type(expr_ty, true)?;
            let mov = ctx.ir.mov(res, child_val);
            ctx.emit(mov);
            res
        }
        ExprTag::Count => emit_constant_i64(ctx, "bigint_constant", 1),
        ExprTag::Typecast => emit_typecast(ctx, child_ty, expr_ty, child_val)?,
        other => {
            return Err(FlounderError::not_implemented(format!(
                "expression emission for unary {}",
                other.name()
            )))
        }
    };
    // free vregs allocated by the child expression
    if res != child_val {
        ctx.clear(child_val);
    }
    Ok(res)
}

fn emit_binary(ctx: &mut JitContext, exprs: &mut ExprArena, e: ExprId) -> Result<NodeId> {
    let left_e = exprs.node(e).child.expect("binary left");
    let right_e = exprs.node(left_e).next.expect("binary right");
    let left = emit_expression(ctx, exprs, left_e)?;
    let right = emit_expression(ctx, exprs, right_e)?;

    let tag = exprs.node(e).tag;
    let ty = exprs.node(e).ty;
    let operation_ty = exprs.node(left_e).ty;

    let res = match tag {
        ExprTag::Add => emit_add(ctx, ty, left, right)?,
        ExprTag::Sub => emit_sub(ctx, ty, left, right)?,
        ExprTag::Mul => emit_mul(ctx, ty, left, right)?,
        ExprTag::Div => emit_div(ctx, ty, left, right)?,
        ExprTag::And => emit_and(ctx, left, right),
        ExprTag::Or => emit_or(ctx, left, right),
        ExprTag::Lt => emit_less_than(ctx, operation_ty, left, right)?,
        ExprTag::Le => emit_less_equal(ctx, operation_ty, left, right)?,
        ExprTag::Gt => emit_greater_than(ctx, operation_ty, left, right)?,
        ExprTag::Ge => emit_greater_equal(ctx, operation_ty, left, right)?,
        ExprTag::Eq => emit_equals(ctx, operation_ty, left, right)?,
        ExprTag::Neq => {
            // NEQ = 1 - EQ
            let v = ctx.ir.vreg8("neq_result");
            let res = ctx.request(v);
            let one = ctx.ir.const_i8(1);
            let mov = ctx.ir.mov(res, one);
            ctx.emit(mov);
            let equals = emit_equals(ctx, operation_ty, left, right)?;
            let sub = ctx.ir.sub(res, equals);
            ctx.emit(sub);
            ctx.clear(equals);
            res
        }
        ExprTag::Like => emit_like(ctx, left, right),
        other => {
            return Err(FlounderError::not_implemented(format!(
                "expression emission for binary {}",
                other.name()
            )))
        }
    };

    // free child vregs, preserving the result
    if res != left {
        ctx.clear(left);
    }
    if res != right {
        ctx.clear(right);
    }
    Ok(res)
}

/// Emit the IR computing `e`, returning the vreg holding the result.
pub fn emit_expression(ctx: &mut JitContext, exprs: &mut ExprArena, e: ExprId) -> Result<NodeId> {
    if exprs.node(e).ty.is_undefined() {
        return Err(FlounderError::internal(format!(
            "expression type underived at {}",
            exprs.serialize(e)
        )));
    }

    // reuse a previously computed value when the symbol table has one
    let name = exprs.expression_name(e);
    if let Ok(existing) = ctx.symbol(&name) {
        let res = ctx.vreg_for_type(exprs.node(e).ty, true)?;
        let mov = ctx.ir.mov(res, existing);
        ctx.emit(mov);
        return Ok(res);
    }

    match exprs.node(e).structure {
        Structure::Literal => emit_literal(ctx, exprs, e),
        Structure::Unary => emit_unary(ctx, exprs, e),
        Structure::Binary => emit_binary(ctx, exprs, e),
        Structure::Other => match exprs.node(e).tag {
            ExprTag::Case => emit_case(ctx, exprs, e),
            other => Err(FlounderError::not_implemented(format!(
                "expression emission for {}",
                other.name()
            ))),
        },
        Structure::Ternary => Err(FlounderError::not_implemented(
            "expression emission for ternary expressions",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JitConfig;
    use flounder_types::TypeTag;
    use std::collections::BTreeMap;

    fn derived(sql_expr: &str) -> (ExprArena, ExprId) {
        // build tiny expressions by hand through the arena
        let mut arena = ExprArena::new();
        let e = match sql_expr {
            "1+2" => {
                let l = arena.constant("1", TypeTag::Bigint).unwrap();
                let r = arena.constant("2", TypeTag::Bigint).unwrap();
                arena.binary(ExprTag::Add, "+", l, r)
            }
            "1<2" => {
                let l = arena.constant("1", TypeTag::Bigint).unwrap();
                let r = arena.constant("2", TypeTag::Bigint).unwrap();
                arena.binary(ExprTag::Lt, "<", l, r)
            }
            _ => unreachable!(),
        };
        let mut idents = BTreeMap::new();
        flounder_sql::derive_expression_types(&mut arena, e, &mut idents).unwrap();
        (arena, e)
    }

    #[test]
    fn addition_emits_mov_add() {
        let (mut arena, e) = derived("1+2");
        let mut ctx = JitContext::new(JitConfig::default());
        let res = emit_expression(&mut ctx, &mut arena, e).unwrap();
        assert!(ctx.ir.is_vreg(res));
        let text = ctx.ir.emit(ctx.code_tree);
        assert!(text.contains("add"));
        // child vregs were cleared, result stays live
        assert_eq!(text.matches("clear").count(), 2);
    }

    #[test]
    fn comparison_produces_bool_pattern() {
        let (mut arena, e) = derived("1<2");
        let mut ctx = JitContext::new(JitConfig::default());
        let res = emit_expression(&mut ctx, &mut arena, e).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(res), 1);
        let text = ctx.ir.emit(ctx.code_tree);
        assert!(text.contains("cmp"));
        assert!(text.contains("jge"));
        assert!(text.contains("lt_false0:"));
    }

    #[test]
    fn attribute_loads_from_symbol_table() {
        let mut arena = ExprArena::new();
        let attr = arena.attr("x");
        arena.node_mut(attr).ty = SqlType::bigint();
        let mut ctx = JitContext::new(JitConfig::default());
        let holder = ctx.ir.vreg64("holder");
        ctx.bind_symbol("x", holder, SqlType::bigint());
        let res = emit_expression(&mut ctx, &mut arena, attr).unwrap();
        assert_ne!(res, holder);
        let text = ctx.ir.emit(ctx.code_tree);
        assert!(text.contains("mov"));
    }

    #[test]
    fn underived_expression_is_rejected() {
        let mut arena = ExprArena::new();
        let attr = arena.attr("x");
        let mut ctx = JitContext::new(JitConfig::default());
        assert!(emit_expression(&mut ctx, &mut arena, attr).is_err());
    }
}
