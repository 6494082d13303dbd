//! Sets of named IR values: hashing, materialization, dematerialization,
//! and equality checks over whole tuples.

use flounder_error::{FlounderError, Result};
use flounder_ir::NodeId;
use flounder_runtime::{hash_char, hash_varchar, write_string, HASH_FACTOR_A, HASH_FACTOR_B, HASH_STRING_FACTOR};
use flounder_sql::{ExprArena, ExprId};
use flounder_types::{Attribute, Schema, SqlType, SymbolSet, TypeTag};

use crate::context::JitContext;
use crate::exprgen::{emit_equals, emit_expression};

/// A named IR value with its type.
#[derive(Debug, Clone)]
pub struct Value {
    pub node: NodeId,
    pub ty: SqlType,
    pub symbol: String,
}

pub type ValueSet = Vec<Value>;

/// How tuples are written: string storage mode, and whether dematerialized
/// vregs are requested explicitly.
#[derive(Debug, Clone, Copy)]
pub struct MatConfig {
    pub strings_by_val: bool,
    pub explicit: bool,
}

/// Hash-table entries keep strings by reference (pointers into the source
/// relation).
pub const HT_MAT_CONFIG: MatConfig = MatConfig {
    strings_by_val: false,
    explicit: true,
};

/// Result relations store strings inline so they survive their sources.
pub const RELATION_MAT_CONFIG: MatConfig = MatConfig {
    strings_by_val: true,
    explicit: true,
};

fn hash_varchar_addr() -> u64 {
    hash_varchar as unsafe extern "C" fn(*const u8, u64, u64) -> u64 as usize as u64
}

fn hash_char_addr() -> u64 {
    hash_char as unsafe extern "C" fn(*const u8, u64, u64) -> u64 as usize as u64
}

fn write_string_addr() -> u64 {
    write_string as unsafe extern "C" fn(*const u8, *mut u8, u64) as usize as u64
}

/// Build a schema over the set's symbols and types.
pub fn schema_of(vals: &ValueSet, strings_by_val: bool) -> Result<Schema> {
    let attributes = vals
        .iter()
        .map(|v| Attribute {
            name: v.symbol.clone(),
            ty: v.ty,
        })
        .collect();
    Schema::new(attributes, strings_by_val)
}

pub fn byte_size(vals: &ValueSet, strings_by_val: bool) -> Result<usize> {
    Ok(schema_of(vals, strings_by_val)?.tuple_size)
}

/// Register every value in the symbol table.
pub fn add_symbols(ctx: &mut JitContext, vals: &ValueSet) {
    for v in vals {
        ctx.bind_symbol(&v.symbol, v.node, v.ty);
    }
}

/// Mix one value into the hash accumulator, per its type.
fn hash_value(ctx: &mut JitContext, val: &Value, hash_vreg: NodeId) -> Result<()> {
    match val.ty.tag {
        TypeTag::Bigint | TypeTag::Decimal | TypeTag::Float => {
            let v = ctx.ir.vreg64("hash");
            let hash = ctx.request(v);
            let mov = ctx.ir.mov(hash, val.node);
            ctx.emit(mov);
            let c = ctx.ir.const_i64(HASH_FACTOR_A as i64);
            let load = ctx.ir.const_load(c);
            let mul = ctx.ir.imul(hash, load);
            ctx.emit(mul);
            let c = ctx.ir.const_i64(HASH_FACTOR_B as i64);
            let load = ctx.ir.const_load(c);
            let add = ctx.ir.add(hash, load);
            ctx.emit(add);
            let acc = ctx.ir.add(hash_vreg, hash);
            ctx.emit(acc);
            ctx.clear(hash);
        }
        TypeTag::Int | TypeTag::Date => {
            // sign-extend to 64 bits first (movsxd: the plain register
            // switch x86 does implicitly is not expressible in the IR)
            let v = ctx.ir.vreg64("hash");
            let hash = ctx.request(v);
            let mov = ctx.ir.movsxd(hash, val.node);
            ctx.emit(mov);
            let c = ctx.ir.const_i64(HASH_FACTOR_B as i64);
            let load = ctx.ir.const_load(c);
            let add = ctx.ir.add(hash, load);
            ctx.emit(add);
            let c = ctx.ir.const_i64(HASH_FACTOR_A as i64);
            let load = ctx.ir.const_load(c);
            let mul = ctx.ir.imul(hash, load);
            ctx.emit(mul);
            let acc = ctx.ir.add(hash_vreg, hash);
            ctx.emit(acc);
            ctx.clear(hash);
        }
        TypeTag::Bool => {
            // a true value contributes a fixed constant, false nothing
            let after_add = ctx.ir.id_label("boolHash");
            let zero = ctx.ir.const_i8(0);
            let cmp = ctx.ir.cmp(val.node, zero);
            ctx.emit(cmp);
            let jne = ctx.ir.jne(after_add);
            ctx.emit(jne);
            let c = ctx.ir.const_i64(HASH_STRING_FACTOR as i64);
            let load = ctx.ir.const_load(c);
            let add = ctx.ir.add(hash_vreg, load);
            ctx.emit(add);
            let place = ctx.ir.place_label(after_add);
            ctx.emit(place);
        }
        TypeTag::Char => {
            ctx.comment("hash char");
            let len = val.ty.len;
            if len > 1 {
                let c = ctx.ir.const_i64(len as i64);
                let mc = ctx
                    .ir
                    .mcall(hash_vreg, hash_char_addr(), &[val.node, hash_vreg, c]);
                ctx.emit(mc);
            } else {
                let v = ctx.ir.vreg64("extend_char1");
                let ext = ctx.request(v);
                let mov = ctx.ir.movzx(ext, val.node);
                ctx.emit(mov);
                let add = ctx.ir.add(hash_vreg, ext);
                ctx.emit(add);
                let add2 = ctx.ir.add(hash_vreg, hash_vreg);
                ctx.emit(add2);
                ctx.clear(ext);
            }
        }
        TypeTag::Varchar => {
            ctx.comment("hash varchar");
            let max_len = val.ty.len;
            let c = ctx.ir.const_i64(max_len as i64);
            let mc = ctx
                .ir
                .mcall(hash_vreg, hash_varchar_addr(), &[val.node, hash_vreg, c]);
            ctx.emit(mc);
        }
        TypeTag::Nt => {
            return Err(FlounderError::not_implemented(
                "hashing an undefined datatype",
            ))
        }
    }
    Ok(())
}

/// Hash a whole value set into a fresh accumulator vreg.
pub fn hash_set(ctx: &mut JitContext, vals: &ValueSet) -> Result<NodeId> {
    let v = ctx.ir.vreg64("hash");
    let hash_vreg = ctx.request(v);
    let zero = ctx.ir.const_i64(0);
    let mov = ctx.ir.mov(hash_vreg, zero);
    ctx.emit(mov);
    for val in vals {
        hash_value(ctx, val, hash_vreg)?;
    }
    Ok(hash_vreg)
}

/// Look up a schema's attributes in the symbol table.
pub fn get(ctx: &JitContext, schema: &Schema) -> Result<ValueSet> {
    let mut res = ValueSet::new();
    for a in &schema.attributes {
        res.push(Value {
            node: ctx.symbol(&a.name)?,
            ty: ctx.symbol_type(&a.name)?,
            symbol: a.name.clone(),
        });
    }
    Ok(res)
}

fn offset_mem_at(ctx: &mut JitContext, base: NodeId, offset: usize) -> NodeId {
    if offset == 0 {
        ctx.ir.mem_at(base)
    } else {
        let c = ctx.ir.const_i64(offset as i64);
        ctx.ir.mem_at_add(base, c)
    }
}

/// `result = base + offset` for pointer values.
fn get_offset(ctx: &mut JitContext, result: NodeId, base: NodeId, offset: usize) {
    let mov = ctx.ir.mov(result, base);
    ctx.emit(mov);
    let c = ctx.ir.const_i64(offset as i64);
    let add = ctx.ir.add(result, c);
    ctx.emit(add);
}

fn load_to_reg(
    ctx: &mut JitContext,
    ty: SqlType,
    tuple_address: NodeId,
    offset: usize,
    mat: MatConfig,
) -> Result<NodeId> {
    let res = ctx.vreg_for_type(ty, mat.explicit)?;
    match ty.tag {
        TypeTag::Int
        | TypeTag::Bigint
        | TypeTag::Decimal
        | TypeTag::Bool
        | TypeTag::Date
        | TypeTag::Float => {
            let mem = offset_mem_at(ctx, tuple_address, offset);
            let mov = ctx.ir.mov(res, mem);
            ctx.emit(mov);
        }
        TypeTag::Char if ty.len == 1 => {
            let mem = offset_mem_at(ctx, tuple_address, offset);
            let mov = ctx.ir.mov(res, mem);
            ctx.emit(mov);
        }
        TypeTag::Char | TypeTag::Varchar => {
            if mat.strings_by_val {
                // the value lives inline: its address is base + offset
                get_offset(ctx, res, tuple_address, offset);
            } else {
                // load the stored pointer
                let mem = offset_mem_at(ctx, tuple_address, offset);
                let mov = ctx.ir.mov(res, mem);
                ctx.emit(mov);
            }
        }
        TypeTag::Nt => {
            return Err(FlounderError::not_implemented(
                "loading an undefined datatype",
            ))
        }
    }
    Ok(res)
}

fn store_string_to_mem(
    ctx: &mut JitContext,
    att_reg: NodeId,
    tuple_address: NodeId,
    offset: usize,
    max_num: usize,
    mat: MatConfig,
) -> Result<()> {
    if mat.strings_by_val {
        // copy the characters, terminator included
        let v = ctx.ir.vreg64("loc");
        let loc = ctx.request(v);
        get_offset(ctx, loc, tuple_address, offset);
        let c = ctx.ir.const_i64(max_num as i64);
        let mc = ctx
            .ir
            .mcall(loc, write_string_addr(), &[att_reg, loc, c]);
        ctx.emit(mc);
        ctx.clear(loc);
    } else {
        // store the pointer
        let mem = offset_mem_at(ctx, tuple_address, offset);
        let mov = ctx.ir.mov(mem, att_reg);
        ctx.emit(mov);
    }
    Ok(())
}

fn store_to_mem(
    ctx: &mut JitContext,
    ty: SqlType,
    att_reg: NodeId,
    tuple_address: NodeId,
    offset: usize,
    mat: MatConfig,
) -> Result<()> {
    match ty.tag {
        TypeTag::Int
        | TypeTag::Bigint
        | TypeTag::Decimal
        | TypeTag::Bool
        | TypeTag::Date
        | TypeTag::Float => {
            let mem = offset_mem_at(ctx, tuple_address, offset);
            let mov = ctx.ir.mov(mem, att_reg);
            ctx.emit(mov);
            Ok(())
        }
        TypeTag::Char => {
            if ty.len > 1 {
                store_string_to_mem(ctx, att_reg, tuple_address, offset, ty.len, mat)
            } else {
                let mem = offset_mem_at(ctx, tuple_address, offset);
                let mov = ctx.ir.mov(mem, att_reg);
                ctx.emit(mov);
                Ok(())
            }
        }
        TypeTag::Varchar => store_string_to_mem(ctx, att_reg, tuple_address, offset, ty.len, mat),
        TypeTag::Nt => Err(FlounderError::not_implemented(
            "storing an undefined datatype",
        )),
    }
}

/// Store every value of the set at `addr + offset_of(symbol)`.
pub fn materialize(
    ctx: &mut JitContext,
    vals: &ValueSet,
    addr: NodeId,
    mat: MatConfig,
) -> Result<()> {
    let schema = schema_of(vals, mat.strings_by_val)?;
    for val in vals {
        let offset = schema.offset_of(&val.symbol)?;
        store_to_mem(ctx, val.ty, val.node, addr, offset, mat)?;
    }
    Ok(())
}

/// Load a tuple's attributes into vregs; with `required` only the named
/// subset is loaded.
pub fn dematerialize(
    ctx: &mut JitContext,
    addr: NodeId,
    schema: &Schema,
    mat: MatConfig,
    required: Option<&SymbolSet>,
) -> Result<ValueSet> {
    let layout = schema.with_string_mode(mat.strings_by_val)?;
    let mut res = ValueSet::new();
    for a in &layout.attributes {
        let wanted = match required {
            None => true,
            Some(set) => set.is_empty() || set.contains(&a.name),
        };
        if !wanted {
            continue;
        }
        let offset = layout.offset_of(&a.name)?;
        let reg = load_to_reg(ctx, a.ty, addr, offset, mat)?;
        res.push(Value {
            node: reg,
            ty: a.ty,
            symbol: a.name.clone(),
        });
    }
    Ok(res)
}

/// Clear the vregs of a whole set.
pub fn clear_set(ctx: &mut JitContext, vals: &ValueSet) {
    for v in vals {
        ctx.clear(v.node);
    }
}

/// Per pair, emit EQ and branch to `jump_label` when NOT equal.
pub fn check_equality_jump(
    ctx: &mut JitContext,
    a: &ValueSet,
    b: &ValueSet,
    jump_label: NodeId,
) -> Result<()> {
    for (x, y) in a.iter().zip(b) {
        let eq = emit_equals(ctx, x.ty, x.node, y.node)?;
        let zero = ctx.ir.const_i8(0);
        let cmp = ctx.ir.cmp(eq, zero);
        ctx.emit(cmp);
        let je = ctx.ir.je(jump_label);
        ctx.emit(je);
        ctx.clear(eq);
    }
    Ok(())
}

/// Per pair, emit EQ and branch to `jump_label` when equal.
pub fn check_equality_jump_if_true(
    ctx: &mut JitContext,
    a: &ValueSet,
    b: &ValueSet,
    jump_label: NodeId,
) -> Result<()> {
    for (x, y) in a.iter().zip(b) {
        let eq = emit_equals(ctx, x.ty, x.node, y.node)?;
        let one = ctx.ir.const_i8(1);
        let cmp = ctx.ir.cmp(eq, one);
        ctx.emit(cmp);
        let je = ctx.ir.je(jump_label);
        ctx.emit(je);
        ctx.clear(eq);
    }
    Ok(())
}

/// Write 0/1 into `flag_vreg` depending on the equality of the sets.
pub fn check_equality_bool(
    ctx: &mut JitContext,
    a: &ValueSet,
    b: &ValueSet,
    flag_vreg: NodeId,
) -> Result<()> {
    let not_equal = ctx.ir.id_label("ValueSetsNotEqual");
    let zero = ctx.ir.const_i8(0);
    let mov = ctx.ir.mov(flag_vreg, zero);
    ctx.emit(mov);
    for (x, y) in a.iter().zip(b) {
        let eq = emit_equals(ctx, x.ty, x.node, y.node)?;
        let zero = ctx.ir.const_i8(0);
        let cmp = ctx.ir.cmp(eq, zero);
        ctx.emit(cmp);
        let je = ctx.ir.je(not_equal);
        ctx.emit(je);
        ctx.clear(eq);
    }
    let one = ctx.ir.const_i8(1);
    let mov = ctx.ir.mov(flag_vreg, one);
    ctx.emit(mov);
    let place = ctx.ir.place_label(not_equal);
    ctx.emit(place);
    Ok(())
}

/// Emit a list of expressions, assigning ids and naming the results.
pub fn eval_expressions(
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    list: &[ExprId],
) -> Result<ValueSet> {
    let mut res = ValueSet::new();
    for &e in list {
        exprs.assign_id(e, &mut ctx.rel.expr_id_gen);
        let node = emit_expression(ctx, exprs, e)?;
        let name = exprs.expression_name(e);
        res.push(Value {
            node,
            ty: exprs.node(e).ty,
            symbol: name,
        });
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JitConfig;

    fn sample_set(ctx: &mut JitContext) -> ValueSet {
        let a = ctx.ir.vreg64("a");
        let b = ctx.ir.vreg32("b");
        vec![
            Value {
                node: a,
                ty: SqlType::bigint(),
                symbol: "a".into(),
            },
            Value {
                node: b,
                ty: SqlType::date(),
                symbol: "b".into(),
            },
        ]
    }

    #[test]
    fn hash_mixes_with_magic_constants() {
        let mut ctx = JitContext::new(JitConfig::default());
        let set = sample_set(&mut ctx);
        let h = hash_set(&mut ctx, &set).unwrap();
        assert!(ctx.ir.is_vreg(h));
        let text = ctx.ir.emit(ctx.code_tree);
        assert!(text.contains("1710227316115945415"));
        assert!(text.contains("741332713408129251"));
        // the 32-bit attribute is sign-extended before mixing
        assert!(text.contains("movsxd"));
    }

    #[test]
    fn materialize_then_dematerialize_uses_schema_offsets() {
        let mut ctx = JitContext::new(JitConfig::default());
        let set = sample_set(&mut ctx);
        let base_v = ctx.ir.vreg64("base");
        let base = ctx.request(base_v);
        materialize(&mut ctx, &set, base, RELATION_MAT_CONFIG).unwrap();
        let text = ctx.ir.emit(ctx.code_tree);
        // second attribute lands at offset 8
        assert!(text.contains("+8"), "offsets missing:\n{text}");

        let schema = schema_of(&set, true).unwrap();
        let vals = dematerialize(&mut ctx, base, &schema, RELATION_MAT_CONFIG, None).unwrap();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0].symbol, "a");
        assert_eq!(ctx.ir.vreg_byte_size(vals[1].node), 4);
    }

    #[test]
    fn dematerialize_respects_request_subset() {
        let mut ctx = JitContext::new(JitConfig::default());
        let set = sample_set(&mut ctx);
        let schema = schema_of(&set, true).unwrap();
        let base_v = ctx.ir.vreg64("base");
        let base = ctx.request(base_v);
        let mut req = SymbolSet::new();
        req.insert("b".into());
        let vals = dematerialize(&mut ctx, base, &schema, RELATION_MAT_CONFIG, Some(&req)).unwrap();
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].symbol, "b");
    }

    #[test]
    fn equality_bool_emits_flag_pattern() {
        let mut ctx = JitContext::new(JitConfig::default());
        let set = sample_set(&mut ctx);
        let set2 = sample_set(&mut ctx);
        let flag_v = ctx.ir.vreg8("flag");
        let flag = ctx.request(flag_v);
        check_equality_bool(&mut ctx, &set, &set2, flag).unwrap();
        let text = ctx.ir.emit(ctx.code_tree);
        assert!(text.contains("ValueSetsNotEqual"));
        // flag is written 0, then 1 on the equal path
        assert!(text.contains("cmp"));
    }
}
