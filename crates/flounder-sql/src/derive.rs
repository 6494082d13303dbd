//! Bottom-up type derivation with implicit typecast insertion.
//!
//! After derivation every node has a concrete type. Mismatched categories in
//! arithmetic follow the fixed precedence order; decimal operands of
//! additive and comparison operators are cast to a common scale with
//! precision bounded to 19.

use std::collections::BTreeMap;

use flounder_error::{FlounderError, Result};
use flounder_types::{SqlType, TypeTag};

use crate::ast::{ExprArena, ExprId, ExprTag, Structure};

const MAX_DECIMAL_PRECISION: u8 = 19;

fn insert_typecast(arena: &mut ExprArena, parent: ExprId, child: ExprId, mut to: SqlType) {
    // strings never get implicit casts
    if to.is_string() {
        return;
    }
    if to.tag == TypeTag::Decimal {
        to.scale = 0;
        to.precision = MAX_DECIMAL_PRECISION;
    }
    let cast = arena.typecast(to, child);
    // the constructor linked cast->child already; rewire the sibling chain
    arena.node_mut(cast).child = None;
    arena.insert_unary_between(parent, child, cast);
}

/// Wedge a cast to exactly `to` (used by CASE, where the common supertype is
/// already fully resolved).
fn insert_typecast_if_needed(
    arena: &mut ExprArena,
    parent: ExprId,
    child: ExprId,
    from: SqlType,
    to: SqlType,
) {
    if from == to || to.is_string() {
        return;
    }
    let cast = arena.typecast(to, child);
    arena.node_mut(cast).child = None;
    arena.insert_unary_between(parent, child, cast);
}

/// Impose the higher-precedence operand's type on the lower one.
fn apply_precedence(arena: &mut ExprArena, e: ExprId, left: ExprId, right: ExprId) {
    let lt = arena.node(left).ty;
    let rt = arena.node(right).ty;
    if lt.tag != rt.tag {
        if lt.tag > rt.tag {
            insert_typecast(arena, e, right, lt);
        } else {
            insert_typecast(arena, e, left, rt);
        }
    }
}

fn decimal_arithmetic_type(op: ExprTag, left: SqlType, right: SqlType) -> Result<SqlType> {
    let mut res = match op {
        ExprTag::Add | ExprTag::Sub => SqlType::decimal(
            left.precision.max(right.precision).saturating_add(1),
            // scale on left and right is identical after unification
            left.scale,
        ),
        ExprTag::Mul => SqlType::decimal(
            left.precision.saturating_add(right.precision),
            left.scale.saturating_add(right.scale),
        ),
        ExprTag::Div => {
            return Err(FlounderError::not_implemented("decimal division"));
        }
        _ => {
            return Err(FlounderError::internal(
                "decimal arithmetic type for non-arithmetic tag",
            ))
        }
    };
    if res.precision > MAX_DECIMAL_PRECISION {
        res.precision = MAX_DECIMAL_PRECISION;
    }
    Ok(res)
}

fn scale_to_other(mut spec: SqlType, other: SqlType) -> SqlType {
    let difference = other.scale - spec.scale;
    spec.scale += difference;
    spec.precision = spec.precision.saturating_add(difference);
    if spec.precision > MAX_DECIMAL_PRECISION {
        spec.precision = MAX_DECIMAL_PRECISION;
    }
    spec
}

/// Cast the decimal operand with the smaller scale up to the other's scale.
fn typecast_decimals_to_same_scale(arena: &mut ExprArena, e: ExprId, left: ExprId, right: ExprId) {
    let lt = arena.node(left).ty;
    let rt = arena.node(right).ty;
    if lt.scale < rt.scale {
        let ty = scale_to_other(lt, rt);
        if arena.node(left).tag == ExprTag::Typecast {
            arena.node_mut(left).ty = ty;
        } else {
            let cast = arena.typecast(ty, left);
            arena.node_mut(cast).child = None;
            arena.insert_unary_between(e, left, cast);
        }
    } else if lt.scale > rt.scale {
        let ty = scale_to_other(rt, lt);
        if arena.node(right).tag == ExprTag::Typecast {
            arena.node_mut(right).ty = ty;
        } else {
            let cast = arena.typecast(ty, right);
            arena.node_mut(cast).child = None;
            arena.insert_unary_between(e, right, cast);
        }
    }
}

fn typecast_configurable_inputs(arena: &mut ExprArena, e: ExprId) -> Result<()> {
    let left = arena.node(e).child.expect("binary left");
    let right = arena.node(left).next.expect("binary right");
    if arena.node(left).ty.tag == TypeTag::Decimal {
        match arena.node(e).tag {
            ExprTag::Lt
            | ExprTag::Gt
            | ExprTag::Le
            | ExprTag::Ge
            | ExprTag::Eq
            | ExprTag::Neq
            | ExprTag::Add
            | ExprTag::Sub => typecast_decimals_to_same_scale(arena, e, left, right),
            ExprTag::Mul => {}
            ExprTag::Div => return Err(FlounderError::not_implemented("decimal division")),
            _ => {}
        }
    }
    Ok(())
}

fn configure_binary_arithmetic_result(arena: &mut ExprArena, e: ExprId) -> Result<()> {
    if arena.node(e).ty.tag == TypeTag::Decimal {
        let left = arena.node(e).child.expect("binary left");
        let right = arena.node(left).next.expect("binary right");
        let ty = decimal_arithmetic_type(
            arena.node(e).tag,
            arena.node(left).ty,
            arena.node(right).ty,
        )?;
        arena.node_mut(e).ty = ty;
    }
    Ok(())
}

fn configure_aggregation_result(arena: &mut ExprArena, e: ExprId) {
    let child = arena.node(e).child.expect("aggregate child");
    if arena.node(child).ty.tag == TypeTag::Decimal {
        let child_spec = arena.node(child).ty;
        let tag = arena.node(e).tag;
        if tag == ExprTag::Sum {
            arena.node_mut(e).ty = SqlType::decimal(MAX_DECIMAL_PRECISION, child_spec.scale);
        }
        if tag == ExprTag::Avg {
            arena.node_mut(e).ty = SqlType::decimal(
                (child_spec.precision + 2).min(MAX_DECIMAL_PRECISION),
                child_spec.scale + 2,
            );
        }
    }
}

fn require_bool(arena: &ExprArena, tag: ExprTag, e: ExprId) -> Result<()> {
    if arena.node(e).ty.tag != TypeTag::Bool {
        return Err(FlounderError::types(format!(
            "{} expression requires a bool operand at {}",
            tag.name(),
            arena.serialize(e)
        )));
    }
    Ok(())
}

fn require_string(arena: &ExprArena, tag: ExprTag, e: ExprId) -> Result<()> {
    if !arena.node(e).ty.is_string() {
        return Err(FlounderError::types(format!(
            "{} expression requires a char or varchar operand at {}",
            tag.name(),
            arena.serialize(e)
        )));
    }
    Ok(())
}

fn require_numeric(arena: &ExprArena, tag: ExprTag, e: ExprId) -> Result<()> {
    if !arena.node(e).ty.is_numeric() {
        return Err(FlounderError::types(format!(
            "{} expression requires a numeric operand at {}",
            tag.name(),
            arena.serialize(e)
        )));
    }
    Ok(())
}

fn require_ordered(arena: &ExprArena, tag: ExprTag, e: ExprId) -> Result<()> {
    if !arena.node(e).ty.is_ordered() {
        return Err(FlounderError::types(format!(
            "{} expression requires an ordered operand type at {}",
            tag.name(),
            arena.serialize(e)
        )));
    }
    Ok(())
}

/// The common supertype for CASE branches.
pub fn common_super_type(a: SqlType, b: SqlType) -> Result<SqlType> {
    if a.tag == b.tag {
        return Ok(match a.tag {
            TypeTag::Decimal => SqlType::decimal(
                a.precision.max(b.precision),
                a.scale.max(b.scale),
            ),
            TypeTag::Varchar => SqlType::varchar(a.len.max(b.len)),
            TypeTag::Char => SqlType::char(a.len.max(b.len)),
            _ => a,
        });
    }
    let integral = |t: SqlType| matches!(t.tag, TypeTag::Bigint | TypeTag::Int);
    if integral(a) && b.tag == TypeTag::Decimal {
        return Ok(b);
    }
    if integral(b) && a.tag == TypeTag::Decimal {
        return Ok(a);
    }
    Err(FlounderError::types(format!(
        "no common supertype of {a} and {b}"
    )))
}

fn derive_literal(
    arena: &mut ExprArena,
    e: ExprId,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    // operators create pre-typed expressions mid-plan; re-derivation only
    // needs to re-register attribute bindings
    if !arena.node(e).ty.is_undefined() {
        if arena.node(e).tag == ExprTag::Attribute {
            let symbol = arena.node(e).symbol.clone();
            ident_types.insert(symbol, arena.node(e).ty);
        }
        return Ok(());
    }

    match arena.node(e).tag {
        ExprTag::Attribute => {
            let symbol = arena.node(e).symbol.clone();
            let ty = ident_types
                .get(&symbol)
                .copied()
                .ok_or(FlounderError::NoSuchAttribute { name: symbol })?;
            arena.node_mut(e).ty = ty;
            Ok(())
        }
        ExprTag::Constant => Ok(()),
        // used by count(*) and select *, the value itself is never read
        ExprTag::Star => {
            arena.node_mut(e).ty = SqlType::bigint();
            Ok(())
        }
        other => Err(FlounderError::not_implemented(format!(
            "type derivation for literal {}",
            other.name()
        ))),
    }
}

fn derive_unary(
    arena: &mut ExprArena,
    e: ExprId,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    let child = arena.node(e).child.expect("unary child");
    derive_expression_types(arena, child, ident_types)?;
    let child_ty = arena.node(child).ty;

    match arena.node(e).tag {
        ExprTag::Typecast => Ok(()),
        ExprTag::As => {
            let symbol = arena.node(e).symbol.clone();
            ident_types.insert(symbol, child_ty);
            arena.node_mut(e).ty = child_ty;
            Ok(())
        }
        ExprTag::Count => {
            arena.node_mut(e).ty = SqlType::bigint();
            Ok(())
        }
        ExprTag::Sum => {
            require_numeric(arena, ExprTag::Sum, child)?;
            arena.node_mut(e).ty = child_ty;
            configure_aggregation_result(arena, e);
            Ok(())
        }
        ExprTag::Avg => {
            require_numeric(arena, ExprTag::Avg, child)?;
            arena.node_mut(e).ty = SqlType::decimal(MAX_DECIMAL_PRECISION, 2);
            configure_aggregation_result(arena, e);
            Ok(())
        }
        ExprTag::Min | ExprTag::Max => {
            require_ordered(arena, arena.node(e).tag, child)?;
            arena.node_mut(e).ty = child_ty;
            Ok(())
        }
        ExprTag::Asc | ExprTag::Desc => {
            arena.node_mut(e).ty = child_ty;
            Ok(())
        }
        other => Err(FlounderError::not_implemented(format!(
            "type derivation for unary {}",
            other.name()
        ))),
    }
}

fn derive_binary(
    arena: &mut ExprArena,
    e: ExprId,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    let left = arena.node(e).child.expect("binary left");
    let right = arena.node(left).next.expect("binary right");
    derive_expression_types(arena, left, ident_types)?;
    derive_expression_types(arena, right, ident_types)?;

    let tag = arena.node(e).tag;
    match tag {
        ExprTag::Add | ExprTag::Sub | ExprTag::Mul | ExprTag::Div => {
            require_numeric(arena, tag, left)?;
            require_numeric(arena, tag, right)?;
            apply_precedence(arena, e, left, right);
            let derived = arena.node(arena.node(e).child.expect("left")).ty;
            arena.node_mut(e).ty = derived;
            typecast_configurable_inputs(arena, e)?;
            configure_binary_arithmetic_result(arena, e)?;
            Ok(())
        }
        ExprTag::Lt | ExprTag::Le | ExprTag::Gt | ExprTag::Ge => {
            require_ordered(arena, tag, left)?;
            require_ordered(arena, tag, right)?;
            apply_precedence(arena, e, left, right);
            typecast_configurable_inputs(arena, e)?;
            arena.node_mut(e).ty = SqlType::bool();
            Ok(())
        }
        ExprTag::Eq | ExprTag::Neq => {
            apply_precedence(arena, e, left, right);
            typecast_configurable_inputs(arena, e)?;
            arena.node_mut(e).ty = SqlType::bool();
            Ok(())
        }
        ExprTag::Or | ExprTag::And => {
            require_bool(arena, tag, left)?;
            require_bool(arena, tag, right)?;
            arena.node_mut(e).ty = SqlType::bool();
            Ok(())
        }
        ExprTag::Like => {
            require_string(arena, tag, left)?;
            require_string(arena, tag, right)?;
            arena.node_mut(e).ty = SqlType::bool();
            Ok(())
        }
        ExprTag::WhenThen => {
            require_bool(arena, tag, left)?;
            let rt = arena.node(right).ty;
            arena.node_mut(e).ty = rt;
            Ok(())
        }
        other => Err(FlounderError::not_implemented(format!(
            "type derivation for binary {}",
            other.name()
        ))),
    }
}

fn derive_case(
    arena: &mut ExprArena,
    e: ExprId,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    // first pass: find the mutual type of all THEN branches and the ELSE
    let mut then_type: Option<SqlType> = None;
    let mut child = arena.node(e).child;
    while let Some(c) = child {
        if arena.node(c).tag == ExprTag::WhenThen {
            let when = arena.node(c).child.expect("when");
            let then = arena.node(when).next.expect("then");
            derive_expression_types(arena, when, ident_types)?;
            derive_expression_types(arena, then, ident_types)?;
            let tt = arena.node(then).ty;
            then_type = Some(match then_type {
                None => tt,
                Some(prev) => common_super_type(prev, tt)?,
            });
        } else {
            // else branch
            derive_expression_types(arena, c, ident_types)?;
            let tt = arena.node(c).ty;
            then_type = Some(match then_type {
                None => tt,
                Some(prev) => common_super_type(prev, tt)?,
            });
        }
        child = arena.node(c).next;
    }
    let then_type = then_type.ok_or_else(|| FlounderError::syntax("CASE without branches"))?;

    // second pass: typecast narrower branches to the mutual type
    let mut child = arena.node(e).child;
    while let Some(c) = child {
        let next = arena.node(c).next;
        if arena.node(c).tag == ExprTag::WhenThen {
            let when = arena.node(c).child.expect("when");
            let then = arena.node(when).next.expect("then");
            let from = arena.node(then).ty;
            insert_typecast_if_needed(arena, c, then, from, then_type);
            derive_expression_types(arena, c, ident_types)?;
        } else {
            let from = arena.node(c).ty;
            insert_typecast_if_needed(arena, e, c, from, then_type);
        }
        child = next;
    }
    arena.node_mut(e).ty = then_type;
    Ok(())
}

/// Derive the type of an expression tree, wedging typecasts where operand
/// categories or decimal scales differ.
pub fn derive_expression_types(
    arena: &mut ExprArena,
    e: ExprId,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    match arena.node(e).structure {
        Structure::Literal => derive_literal(arena, e, ident_types),
        Structure::Unary => derive_unary(arena, e, ident_types),
        Structure::Binary => derive_binary(arena, e, ident_types),
        Structure::Other => match arena.node(e).tag {
            ExprTag::Case => derive_case(arena, e, ident_types),
            other => Err(FlounderError::not_implemented(format!(
                "type derivation for {}",
                other.name()
            ))),
        },
        Structure::Ternary => Err(FlounderError::not_implemented(
            "type derivation for ternary expressions",
        )),
    }
}

/// Derive types across a list of expression trees.
pub fn derive_types_for_list(
    arena: &mut ExprArena,
    exprs: &[ExprId],
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    for &e in exprs {
        derive_expression_types(arena, e, ident_types)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flounder_types::TypeTag;

    fn empty_idents() -> BTreeMap<String, SqlType> {
        BTreeMap::new()
    }

    #[test]
    fn constants_keep_parsed_types() {
        let mut a = ExprArena::new();
        let c = a.constant("1515.1414", TypeTag::Decimal).unwrap();
        derive_expression_types(&mut a, c, &mut empty_idents()).unwrap();
        assert_eq!(a.node(c).ty, SqlType::decimal(8, 4));
    }

    #[test]
    fn attribute_types_come_from_identifier_map() {
        let mut a = ExprArena::new();
        let attr = a.attr("qty");
        let mut idents = empty_idents();
        idents.insert("qty".into(), SqlType::decimal(5, 1));
        derive_expression_types(&mut a, attr, &mut idents).unwrap();
        assert_eq!(a.node(attr).ty, SqlType::decimal(5, 1));
        let missing = a.attr("nope");
        assert!(derive_expression_types(&mut a, missing, &mut empty_idents()).is_err());
    }

    #[test]
    fn mixed_category_arithmetic_casts_the_lower_operand() {
        // 1 + 2.5 : BIGINT + DECIMAL(2,1) -> cast of the BIGINT side
        let mut a = ExprArena::new();
        let l = a.constant("1", TypeTag::Bigint).unwrap();
        let r = a.constant("2.5", TypeTag::Decimal).unwrap();
        let add = a.binary(ExprTag::Add, "+", l, r);
        derive_expression_types(&mut a, add, &mut empty_idents()).unwrap();

        let first = a.node(add).child.unwrap();
        assert_eq!(a.node(first).tag, ExprTag::Typecast);
        assert_eq!(a.node(first).child, Some(l));
        // after scale unification both children share category and scale
        let second = a.node(first).next.unwrap();
        assert_eq!(a.node(first).ty.tag, TypeTag::Decimal);
        assert_eq!(a.node(first).ty.scale, a.node(second).ty.scale);
        // ADD result: max precision + 1, preserved scale
        assert_eq!(a.node(add).ty.scale, 1);
    }

    #[test]
    fn decimal_comparison_unifies_scales() {
        // 90.99 * 0.33 < (120 + 285) * 0.1 drives both sides to scale 4
        let mut a = ExprArena::new();
        let l1 = a.constant("90.99", TypeTag::Decimal).unwrap();
        let r1 = a.constant("0.33", TypeTag::Decimal).unwrap();
        let mul1 = a.binary(ExprTag::Mul, "*", l1, r1);
        let l2 = a.constant("120", TypeTag::Bigint).unwrap();
        let r2 = a.constant("285", TypeTag::Bigint).unwrap();
        let add = a.binary(ExprTag::Add, "+", l2, r2);
        let f = a.constant("0.1", TypeTag::Decimal).unwrap();
        let mul2 = a.binary(ExprTag::Mul, "*", add, f);
        let cmp = a.binary(ExprTag::Lt, "<", mul1, mul2);
        derive_expression_types(&mut a, cmp, &mut empty_idents()).unwrap();

        assert_eq!(a.node(cmp).ty, SqlType::bool());
        let left = a.node(cmp).child.unwrap();
        let right = a.node(left).next.unwrap();
        assert_eq!(a.node(left).ty.scale, a.node(right).ty.scale);
        assert_eq!(a.node(left).ty.scale, 4);
    }

    #[test]
    fn aggregate_result_types() {
        let mut a = ExprArena::new();
        let mut idents = empty_idents();
        idents.insert("v".into(), SqlType::decimal(5, 1));

        let attr = a.attr("v");
        let sum = a.sum(attr);
        derive_expression_types(&mut a, sum, &mut idents).unwrap();
        assert_eq!(a.node(sum).ty, SqlType::decimal(19, 1));

        let attr = a.attr("v");
        let avg = a.avg(attr);
        derive_expression_types(&mut a, avg, &mut idents).unwrap();
        assert_eq!(a.node(avg).ty, SqlType::decimal(7, 3));

        let attr = a.attr("v");
        let cnt = a.count(attr);
        derive_expression_types(&mut a, cnt, &mut idents).unwrap();
        assert_eq!(a.node(cnt).ty, SqlType::bigint());
    }

    #[test]
    fn division_of_decimals_is_rejected() {
        let mut a = ExprArena::new();
        let l = a.constant("1.5", TypeTag::Decimal).unwrap();
        let r = a.constant("2.5", TypeTag::Decimal).unwrap();
        let div = a.binary(ExprTag::Div, "/", l, r);
        assert!(derive_expression_types(&mut a, div, &mut empty_idents()).is_err());
    }

    #[test]
    fn and_requires_bool_operands() {
        let mut a = ExprArena::new();
        let l = a.constant("1", TypeTag::Bigint).unwrap();
        let r = a.constant("true", TypeTag::Bool).unwrap();
        let and = a.binary(ExprTag::And, "and", l, r);
        assert!(derive_expression_types(&mut a, and, &mut empty_idents()).is_err());
    }

    #[test]
    fn case_branches_get_common_supertype() {
        let mut a = ExprArena::new();
        let cond = a.constant("true", TypeTag::Bool).unwrap();
        let then = a.constant("1", TypeTag::Bigint).unwrap();
        let wt = a.when_then(cond, then);
        let els = a.constant("2.50", TypeTag::Decimal).unwrap();
        a.node_mut(wt).next = Some(els);
        let case = a.case(wt);
        derive_expression_types(&mut a, case, &mut empty_idents()).unwrap();
        assert_eq!(a.node(case).ty.tag, TypeTag::Decimal);
    }
}
