//! Relational operators in the produce/consume push model.
//!
//! The plan is an arena of operators addressed by [`OpId`]; `produce` walks
//! down from the root emitting the tuple-driving IR, and each child calls
//! its parent's `consume` once its tuple is available in the symbol table.
//! Leaf operators open a pipeline when the inner-scan depth is zero.

mod aggregation;
mod hash_join;
mod materialize;
mod nested_loops;
mod order_by;
mod scan;
mod simple;

use std::collections::BTreeMap;

use flounder_error::{FlounderError, Result};
use flounder_runtime::{BuildBarrier, HashTable, OrderRequestList, SingleThreadGuard};
use flounder_sql::{ExprArena, ExprId, ExprTag};
use flounder_storage::{AppendIterator, ReadIterator, Relation};
use flounder_types::{Schema, SqlType, SymbolSet};

use crate::context::JitContext;

pub(crate) use scan::{close_block_scan, close_scan_loop, open_block_scan, open_scan_loop};

/// Handle to an operator in a [`Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpId(pub usize);

/// Per-operator payload.
pub enum OpKind {
    Scan {
        rel: *const Relation,
        name: String,
        read_it: Box<ReadIterator>,
    },
    Selection {
        condition: ExprId,
        request: SymbolSet,
    },
    Projection {
        exprs: Vec<ExprId>,
    },
    Materialize {
        n_call: usize,
        limit: Option<usize>,
        rel_out: Option<Box<Relation>>,
        append_it: Option<Box<AppendIterator>>,
        read_it: Option<Box<ReadIterator>>,
    },
    NestedLoopsJoin {
        condition: Option<ExprId>,
        n_call: usize,
    },
    HashJoin {
        equalities: Vec<ExprId>,
        single_match: bool,
        request: SymbolSet,
        n_call: usize,
        ht: Option<Box<HashTable>>,
        build_keys_schema: Schema,
        barrier: Option<Box<BuildBarrier>>,
    },
    Aggregation {
        agg: Vec<ExprId>,
        split_agg: Vec<ExprId>,
        group: Vec<ExprId>,
        ht: Option<Box<HashTable>>,
        entry_schema: Schema,
        guard: Option<Box<SingleThreadGuard>>,
        guard_end_label: Option<flounder_ir::NodeId>,
    },
    OrderBy {
        order: Vec<ExprId>,
        requests: Option<Box<OrderRequestList>>,
        limit: Option<usize>,
        guard: Option<Box<SingleThreadGuard>>,
    },
}

/// Fieldless operator discriminant for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpTag {
    Scan,
    Selection,
    Projection,
    Materialize,
    NestedLoopsJoin,
    HashJoin,
    Aggregation,
    OrderBy,
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            Self::Scan { .. } => OpTag::Scan,
            Self::Selection { .. } => OpTag::Selection,
            Self::Projection { .. } => OpTag::Projection,
            Self::Materialize { .. } => OpTag::Materialize,
            Self::NestedLoopsJoin { .. } => OpTag::NestedLoopsJoin,
            Self::HashJoin { .. } => OpTag::HashJoin,
            Self::Aggregation { .. } => OpTag::Aggregation,
            Self::OrderBy { .. } => OpTag::OrderBy,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Scan { name, rel, .. } => {
                let count = unsafe { (**rel).tuple_count() };
                if name.is_empty() {
                    format!("Scan({count})")
                } else {
                    format!("{}({count})", name.to_uppercase())
                }
            }
            Self::Selection { .. } => "Selection".to_owned(),
            Self::Projection { .. } => "Projection".to_owned(),
            Self::Materialize { .. } => "Materialize".to_owned(),
            Self::NestedLoopsJoin { .. } => "NestedLoopsJoin".to_owned(),
            Self::HashJoin { .. } => "HashJoin".to_owned(),
            Self::Aggregation { .. } => "Aggregation".to_owned(),
            Self::OrderBy { .. } => "OrderBy".to_owned(),
        }
    }
}

pub struct Operator {
    pub kind: OpKind,
    pub parent: Option<OpId>,
    pub children: Vec<OpId>,
    /// Result schema; set before the parent's consume runs.
    pub schema: Schema,
}

/// The operator arena for one query. Destroyed en bloc after the query.
#[derive(Default)]
pub struct Plan {
    ops: Vec<Operator>,
    pub root: Option<OpId>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: OpKind, children: Vec<OpId>) -> OpId {
        let id = OpId(self.ops.len());
        for &c in &children {
            self.ops[c.0].parent = Some(id);
        }
        self.ops.push(Operator {
            kind,
            parent: None,
            children,
            schema: Schema::default(),
        });
        id
    }

    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id.0]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operator {
        &mut self.ops[id.0]
    }

    pub fn child(&self, id: OpId, n: usize) -> OpId {
        self.ops[id.0].children[n]
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Result-size estimate driving hash-table pre-sizing.
    pub fn size_estimate(&self, id: OpId) -> usize {
        match &self.ops[id.0].kind {
            OpKind::Scan { rel, .. } => unsafe { (**rel).tuple_count() },
            OpKind::Selection { .. } => self.size_estimate(self.child(id, 0)) / 2,
            OpKind::Projection { .. } => {
                if self.ops[id.0].children.is_empty() {
                    1
                } else {
                    self.size_estimate(self.child(id, 0))
                }
            }
            OpKind::Materialize { limit, .. } => {
                let size = self.size_estimate(self.child(id, 0));
                match limit {
                    Some(l) => size.min(*l),
                    None => size,
                }
            }
            OpKind::NestedLoopsJoin { .. } => {
                let l = self.size_estimate(self.child(id, 0));
                let r = self.size_estimate(self.child(id, 1));
                if l + r <= 10_000 {
                    l * r
                } else {
                    (l + r) * 2
                }
            }
            OpKind::HashJoin { .. } => {
                self.size_estimate(self.child(id, 0)) + self.size_estimate(self.child(id, 1)) / 2
            }
            OpKind::Aggregation { group, .. } => {
                if group.is_empty() {
                    1
                } else {
                    let mut reduction = 512usize;
                    for _ in 1..group.len() {
                        if reduction <= 2 {
                            break;
                        }
                        reduction /= 2;
                    }
                    self.size_estimate(self.child(id, 0)) / reduction
                }
            }
            OpKind::OrderBy { .. } => self.size_estimate(self.child(id, 0)),
        }
    }

    /// Render the plan as an indented tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root {
            self.render_prefix(root, "", true, &mut out);
        }
        out
    }

    fn render_prefix(&self, id: OpId, prefix: &str, is_last: bool, out: &mut String) {
        let branch = if is_last { "  └─" } else { "  ├─" };
        out.push_str(prefix);
        out.push_str(branch);
        out.push_str(&self.ops[id.0].kind.name());
        out.push('\n');
        let children = self.ops[id.0].children.clone();
        for (i, c) in children.iter().enumerate().rev() {
            let add = if is_last { "    " } else { "  │ " };
            self.render_prefix(*c, &format!("{prefix}{add}"), i == 0, out);
        }
    }

    /// Whether the operator materializes its result itself.
    pub fn is_materialized(&self, id: OpId) -> bool {
        matches!(
            self.ops[id.0].kind,
            OpKind::Materialize { .. } | OpKind::OrderBy { .. }
        )
    }

    /// Take the output relation from the root.
    pub fn retrieve_result(&mut self) -> Result<Box<Relation>> {
        let root = self
            .root
            .ok_or_else(|| FlounderError::internal("plan without root"))?;
        match self.ops[root.0].kind.tag() {
            OpTag::Materialize => match &mut self.ops[root.0].kind {
                OpKind::Materialize { rel_out, .. } => rel_out
                    .take()
                    .ok_or_else(|| FlounderError::internal("materialize produced no relation")),
                _ => unreachable!(),
            },
            OpTag::OrderBy => {
                let limit = match &self.ops[root.0].kind {
                    OpKind::OrderBy { limit, .. } => *limit,
                    _ => unreachable!(),
                };
                let child = self.child(root, 0);
                let mut rel = match &mut self.ops[child.0].kind {
                    OpKind::Materialize { rel_out, .. } => rel_out.take().ok_or_else(|| {
                        FlounderError::internal("order by produced no relation")
                    })?,
                    _ => {
                        return Err(FlounderError::internal(
                            "order by without materialize child",
                        ))
                    }
                };
                if let Some(l) = limit {
                    rel.apply_limit(l);
                }
                Ok(rel)
            }
            _ => Err(FlounderError::internal(
                "retrieving a result from a non-materialized operator",
            )),
        }
    }

    /// Attach a LIMIT to the root.
    pub fn add_limit(&mut self, n: usize) -> Result<()> {
        let root = self
            .root
            .ok_or_else(|| FlounderError::internal("plan without root"))?;
        match &mut self.ops[root.0].kind {
            OpKind::Materialize { limit, .. } | OpKind::OrderBy { limit, .. } => {
                *limit = Some(n);
                Ok(())
            }
            _ => Err(FlounderError::internal(
                "limit on a non-materializing operator",
            )),
        }
    }
}

/// Derive the types of every expression held by the plan, children first.
pub fn define_expressions(
    plan: &mut Plan,
    id: OpId,
    exprs: &mut ExprArena,
    ident_types: &mut BTreeMap<String, SqlType>,
) -> Result<()> {
    let children = plan.op(id).children.clone();
    for c in children {
        define_expressions(plan, c, exprs, ident_types)?;
    }

    match &mut plan.ops[id.0].kind {
        OpKind::Scan { .. } | OpKind::Materialize { .. } => Ok(()),
        OpKind::Selection { condition, .. } => {
            flounder_sql::derive_expression_types(exprs, *condition, ident_types)
        }
        OpKind::Projection { exprs: list } => {
            let list = list.clone();
            flounder_sql::derive_types_for_list(exprs, &list, ident_types)
        }
        OpKind::NestedLoopsJoin { condition, .. } => match condition {
            Some(c) => flounder_sql::derive_expression_types(exprs, *c, ident_types),
            None => Ok(()),
        },
        OpKind::HashJoin { equalities, .. } => {
            let list = equalities.clone();
            flounder_sql::derive_types_for_list(exprs, &list, ident_types)
        }
        OpKind::Aggregation {
            agg,
            split_agg,
            group,
            ..
        } => {
            // split every AVG into SUM + COUNT for the accumulator layout,
            // keeping the original list for result naming
            let mut split = Vec::new();
            for &e in agg.iter() {
                if exprs.node(e).tag == ExprTag::Avg {
                    let child = exprs.node(e).child.expect("avg child");
                    split.push(exprs.sum(child));
                    split.push(exprs.count(child));
                } else {
                    split.push(e);
                }
            }
            *split_agg = split;
            let (group, split_agg, agg) = (group.clone(), split_agg.clone(), agg.clone());
            flounder_sql::derive_types_for_list(exprs, &group, ident_types)?;
            flounder_sql::derive_types_for_list(exprs, &split_agg, ident_types)?;
            flounder_sql::derive_types_for_list(exprs, &agg, ident_types)
        }
        OpKind::OrderBy { order, .. } => {
            // default direction is ascending
            let mut normalized = Vec::with_capacity(order.len());
            for &e in order.iter() {
                let tag = exprs.node(e).tag;
                let wrapped = if tag == ExprTag::Asc || tag == ExprTag::Desc {
                    e
                } else {
                    exprs.asc(e)
                };
                let inner = exprs.node(wrapped).child.expect("order child");
                if exprs.node(inner).tag != ExprTag::Attribute {
                    return Err(FlounderError::not_implemented(format!(
                        "ORDER BY on {}",
                        exprs.serialize(inner)
                    )));
                }
                normalized.push(wrapped);
            }
            *order = normalized.clone();
            flounder_sql::derive_types_for_list(exprs, &normalized, ident_types)
        }
    }
}

/// Emit the tuple-driving IR of `id` and its subtree.
pub fn produce(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
    request: SymbolSet,
) -> Result<()> {
    match plan.op(id).kind.tag() {
        OpTag::Scan => scan::produce(plan, id, ctx, exprs, request),
        OpTag::Selection => simple::selection_produce(plan, id, ctx, exprs, request),
        OpTag::Projection => simple::projection_produce(plan, id, ctx, exprs, request),
        OpTag::Materialize => materialize::produce(plan, id, ctx, exprs, request),
        OpTag::NestedLoopsJoin => nested_loops::produce(plan, id, ctx, exprs, request),
        OpTag::HashJoin => hash_join::produce(plan, id, ctx, exprs, request),
        OpTag::Aggregation => aggregation::produce(plan, id, ctx, exprs, request),
        OpTag::OrderBy => order_by::produce(plan, id, ctx, exprs, request),
    }
}

/// React to a tuple the child made available in the symbol table.
pub fn consume(plan: &mut Plan, id: OpId, ctx: &mut JitContext, exprs: &mut ExprArena) -> Result<()> {
    match plan.op(id).kind.tag() {
        OpTag::Scan | OpTag::OrderBy => Ok(()),
        OpTag::Selection => simple::selection_consume(plan, id, ctx, exprs),
        OpTag::Projection => simple::projection_consume(plan, id, ctx, exprs),
        OpTag::Materialize => materialize::consume(plan, id, ctx, exprs),
        OpTag::NestedLoopsJoin => nested_loops::consume(plan, id, ctx, exprs),
        OpTag::HashJoin => hash_join::consume(plan, id, ctx, exprs),
        OpTag::Aggregation => aggregation::consume(plan, id, ctx, exprs),
    }
}

/// Call the parent's consume, when there is one.
pub(crate) fn consume_parent(
    plan: &mut Plan,
    id: OpId,
    ctx: &mut JitContext,
    exprs: &mut ExprArena,
) -> Result<()> {
    if let Some(parent) = plan.op(id).parent {
        consume(plan, parent, ctx, exprs)?;
    }
    Ok(())
}
