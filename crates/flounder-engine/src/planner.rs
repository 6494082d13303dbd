//! The planner: turns a parsed SELECT into an operator tree.
//!
//! Canonical shape: scans, push-down selections, equality hash joins with a
//! small join-order heuristic, nested-loops joins for the remaining cross
//! products, aggregation, projection, order-by, and a root materialize.

use std::collections::{BTreeMap, BTreeSet};

use flounder_error::{FlounderError, Result};
use flounder_sql::{ExprArena, ExprId, ExprTag, Query};
use flounder_storage::{Database, ReadIterator};
use flounder_types::Schema;

use crate::operators::{OpId, OpKind, Plan};

/// Attributes treated as known-unique build keys, enabling the
/// single-match probe.
const UNIQUE_ATTRIBUTES: [&str; 5] = [
    "o_orderkey",
    "p_partkey",
    "s_suppkey",
    "n_nationkey",
    "r_regionkey",
];

fn expr_equals(arena: &ExprArena, a: ExprId, b: ExprId) -> bool {
    let an = arena.node(a);
    let bn = arena.node(b);
    if an.tag != bn.tag {
        return false;
    }
    if an.tag == ExprTag::Attribute && an.symbol != bn.symbol {
        return false;
    }
    true
}

/// Structural match of two expression trees.
fn trace_match(arena: &ExprArena, haystack: ExprId, needle: ExprId) -> bool {
    if !expr_equals(arena, haystack, needle) {
        return false;
    }
    let mut ch = arena.node(haystack).child;
    let mut cn = arena.node(needle).child;
    loop {
        match (ch, cn) {
            (None, None) => return true,
            (Some(h), Some(n)) => {
                if !trace_match(arena, h, n) {
                    return false;
                }
                ch = arena.node(h).next;
                cn = arena.node(n).next;
            }
            _ => return false,
        }
    }
}

/// Replace the subtree of `select` that structurally matches `group` by the
/// group expression itself, so both clauses share one node.
fn match_and_unify(arena: &mut ExprArena, select: ExprId, group: ExprId) -> ExprId {
    if trace_match(arena, select, group) {
        let select_next = arena.node(select).next;
        arena.node_mut(group).next = select_next;
        return group;
    }
    let Some(first_child) = arena.node(select).child else {
        return select;
    };
    let new_first = match_and_unify(arena, first_child, group);
    arena.node_mut(select).child = Some(new_first);
    let mut prev = new_first;
    let mut cur = arena.node(new_first).next;
    while let Some(c) = cur {
        let replaced = match_and_unify(arena, c, group);
        arena.node_mut(prev).next = Some(replaced);
        prev = c;
        cur = arena.node(c).next;
    }
    select
}

fn unify_select_and_group_by(arena: &mut ExprArena, select: &mut [ExprId], group_by: &[ExprId]) {
    for &grp in group_by {
        for sel in select.iter_mut() {
            *sel = match_and_unify(arena, *sel, grp);
        }
    }
}

struct PlanPiece {
    op: OpId,
    schema: Schema,
}

fn table_containing_all(
    symbols: &[String],
    plan_tables: &BTreeMap<String, PlanPiece>,
) -> Option<String> {
    for (name, piece) in plan_tables {
        if symbols.iter().all(|s| piece.schema.contains(s)) {
            return Some(name.clone());
        }
    }
    None
}

fn is_unique_attribute(arena: &ExprArena, e: ExprId) -> bool {
    let node = arena.node(e);
    node.tag == ExprTag::Attribute && UNIQUE_ATTRIBUTES.contains(&node.symbol.as_str())
}

/// Push single-table conjuncts into selections directly above the scans;
/// returns the remaining conditions.
fn push_down_selection(
    plan: &mut Plan,
    arena: &mut ExprArena,
    where_conjuncts: Vec<ExprId>,
    plan_tables: &mut BTreeMap<String, PlanPiece>,
    plan_pieces: &mut BTreeSet<usize>,
) -> Vec<ExprId> {
    let mut remaining = Vec::new();
    for e in where_conjuncts {
        let symbols = arena.collect_attributes(e);
        if symbols.is_empty() {
            // constant conditions stay near the root
            remaining.push(e);
            continue;
        }
        match table_containing_all(&symbols, plan_tables) {
            Some(table) => {
                let piece = plan_tables.get_mut(&table).expect("piece exists");
                let existing = match &plan.op(piece.op).kind {
                    OpKind::Selection { condition, .. } => Some(*condition),
                    _ => None,
                };
                if let Some(existing) = existing {
                    // extend the existing selection's conjunction
                    let combined = arena.and(existing, e);
                    match &mut plan.op_mut(piece.op).kind {
                        OpKind::Selection { condition, .. } => *condition = combined,
                        _ => unreachable!(),
                    }
                } else {
                    plan_pieces.remove(&piece.op.0);
                    let sel = plan.add(
                        OpKind::Selection {
                            condition: e,
                            request: Default::default(),
                        },
                        vec![piece.op],
                    );
                    piece.op = sel;
                    plan_pieces.insert(sel.0);
                }
            }
            None => remaining.push(e),
        }
    }
    remaining
}

/// Turn equality conditions that join two plan pieces into hash joins, in a
/// heuristic order; returns the remaining conditions.
#[allow(clippy::type_complexity)]
fn add_equality_hash_joins(
    plan: &mut Plan,
    arena: &mut ExprArena,
    where_conjuncts: Vec<ExprId>,
    plan_tables: &mut BTreeMap<String, PlanPiece>,
    plan_pieces: &mut BTreeSet<usize>,
    db: &Database,
) -> Result<Vec<ExprId>> {
    let mut remaining = Vec::new();
    let mut equalities = Vec::new();
    for e in where_conjuncts {
        if arena.node(e).tag == ExprTag::Eq {
            equalities.push(e);
        } else {
            remaining.push(e);
        }
    }

    // match equality sides to single tables
    let mut join_map: BTreeMap<(String, String), Vec<(ExprId, ExprId)>> = BTreeMap::new();
    for eq in equalities {
        let left = arena.node(eq).child.expect("equality left");
        let right = arena.node(left).next.expect("equality right");
        let left_syms = arena.collect_attributes(left);
        let right_syms = arena.collect_attributes(right);
        let (Some(mut name_a), Some(mut name_b)) = (
            table_containing_all(&left_syms, plan_tables),
            table_containing_all(&right_syms, plan_tables),
        ) else {
            remaining.push(eq);
            continue;
        };
        let (mut a, mut b) = (left, right);
        // the smaller relation becomes the build side
        if db.get(&name_a)?.tuple_count() >= db.get(&name_b)?.tuple_count() {
            std::mem::swap(&mut name_a, &mut name_b);
            std::mem::swap(&mut a, &mut b);
        }
        join_map.entry((name_a, name_b)).or_default().push((a, b));
    }

    // join order: prefer pairs with selections on top, then the smaller
    // probe side
    let mut join_list: Vec<((String, String), Vec<(ExprId, ExprId)>)> =
        join_map.into_iter().collect();
    join_list.sort_by(|a, b| {
        let selections = |names: &(String, String)| -> usize {
            let mut n = 0;
            for name in [&names.0, &names.1] {
                if let Some(piece) = plan_tables.get(name.as_str()) {
                    if matches!(plan.op(piece.op).kind, OpKind::Selection { .. }) {
                        n += 1;
                    }
                }
            }
            n
        };
        let sel_a = selections(&a.0);
        let sel_b = selections(&b.0);
        if (sel_a > 0 || sel_b > 0) && sel_a != sel_b {
            return sel_b.cmp(&sel_a);
        }
        let probe_size = |names: &(String, String)| {
            db.get(&names.1).map(|r| r.tuple_count()).unwrap_or(0)
        };
        probe_size(&a.0).cmp(&probe_size(&b.0))
    });

    for ((name_a, name_b), pairs) in join_list {
        let mut single_match = false;
        let mut cond = Vec::new();
        for (a, b) in pairs {
            if is_unique_attribute(arena, a) {
                single_match = true;
            }
            let eq = arena.eq(a, b);
            arena.node_mut(b).next = None;
            cond.push(eq);
        }

        let op_a = plan_tables[&name_a].op;
        let op_b = plan_tables[&name_b].op;

        if op_a == op_b {
            // both sides already joined: extend the existing join
            match &mut plan.op_mut(op_a).kind {
                OpKind::HashJoin { equalities, .. } => {
                    let mut combined = cond;
                    combined.extend(equalities.iter().copied());
                    *equalities = combined;
                }
                _ => {
                    return Err(FlounderError::internal(
                        "additional join condition on a non-join operator",
                    ))
                }
            }
            continue;
        }

        let hj = plan.add(
            OpKind::HashJoin {
                equalities: cond,
                single_match,
                request: Default::default(),
                n_call: 0,
                ht: None,
                build_keys_schema: Schema::default(),
                barrier: None,
            },
            vec![op_a, op_b],
        );
        for piece in plan_tables.values_mut() {
            if piece.op == op_a || piece.op == op_b {
                piece.op = hj;
            }
        }
        plan_pieces.remove(&op_a.0);
        plan_pieces.remove(&op_b.0);
        plan_pieces.insert(hj.0);
    }
    Ok(remaining)
}

fn wrap_in_materialize(plan: &mut Plan, child: OpId) -> OpId {
    plan.add(
        OpKind::Materialize {
            n_call: 0,
            limit: None,
            rel_out: None,
            append_it: None,
            read_it: None,
        },
        vec![child],
    )
}

/// Build the operator tree for a parsed SELECT.
pub fn build_plan(query: &mut Query, db: &Database) -> Result<Plan> {
    let mut plan = Plan::new();
    let arena = &mut query.arena;

    let mut select = query.select.clone();
    let where_conjuncts = arena.top_level_conjuncts(query.where_clause);
    let group_by = query.group_by.clone();
    let order_by = query.order_by.clone();

    // share nodes between the select and group-by clauses so group results
    // are recognized during projection
    unify_select_and_group_by(arena, &mut select, &group_by);

    // aggregates anywhere in the select clause drive the aggregation step
    let mut aggregations = Vec::new();
    for &sel in &select {
        aggregations.extend(arena.filter(sel, &|e| e.tag.is_aggregate()));
    }

    // scans
    let mut plan_tables: BTreeMap<String, PlanPiece> = BTreeMap::new();
    let mut plan_pieces: BTreeSet<usize> = BTreeSet::new();
    for &from in &query.from {
        let table_name = arena.node(from).symbol.clone();
        let rel = db.get(&table_name)?;
        let scan = plan.add(
            OpKind::Scan {
                rel: rel as *const _,
                name: table_name.clone(),
                read_it: Box::new(unsafe { ReadIterator::new(rel) }),
            },
            Vec::new(),
        );
        plan_pieces.insert(scan.0);
        plan_tables.insert(
            table_name,
            PlanPiece {
                op: scan,
                schema: rel.schema.clone(),
            },
        );
    }

    // selection push-down, then equality hash joins
    let where_conjuncts = push_down_selection(
        &mut plan,
        arena,
        where_conjuncts,
        &mut plan_tables,
        &mut plan_pieces,
    );
    let where_conjuncts = add_equality_hash_joins(
        &mut plan,
        arena,
        where_conjuncts,
        &mut plan_tables,
        &mut plan_pieces,
        db,
    )?;

    // unjoined pieces combine via nested loops (cross products)
    let mut pieces = plan_pieces.iter().copied();
    let mut root = match pieces.next() {
        Some(first) => {
            let mut root = OpId(first);
            for next in pieces {
                let left = wrap_in_materialize(&mut plan, root);
                let right = wrap_in_materialize(&mut plan, OpId(next));
                root = plan.add(
                    OpKind::NestedLoopsJoin {
                        condition: None,
                        n_call: 0,
                    },
                    vec![left, right],
                );
            }
            Some(root)
        }
        None => None,
    };

    // remaining where conditions
    if !where_conjuncts.is_empty() {
        let condition = arena
            .conjunction(where_conjuncts)
            .expect("non-empty conjunct list");
        let child = root.ok_or_else(|| FlounderError::syntax("WHERE without FROM"))?;
        root = Some(plan.add(
            OpKind::Selection {
                condition,
                request: Default::default(),
            },
            vec![child],
        ));
    }

    // aggregation
    if !group_by.is_empty() || !aggregations.is_empty() {
        let child = root.ok_or_else(|| FlounderError::syntax("aggregate without FROM"))?;
        root = Some(plan.add(
            OpKind::Aggregation {
                agg: aggregations,
                split_agg: Vec::new(),
                group: group_by,
                ht: None,
                entry_schema: Schema::default(),
                guard: None,
                guard_end_label: None,
            },
            vec![child],
        ));
    }

    // projection (a leaf projection when there is no FROM)
    if !query.request_all {
        let children = match root {
            Some(r) => vec![r],
            None => Vec::new(),
        };
        root = Some(plan.add(OpKind::Projection { exprs: select }, children));
    }

    // order by over a materialized input
    if !order_by.is_empty() {
        let child = root.ok_or_else(|| FlounderError::syntax("ORDER BY without FROM"))?;
        let mat = wrap_in_materialize(&mut plan, child);
        root = Some(plan.add(
            OpKind::OrderBy {
                order: order_by,
                requests: None,
                limit: None,
                guard: None,
            },
            vec![mat],
        ));
    }

    // result materialization at the root
    let root = root.ok_or_else(|| FlounderError::syntax("empty query"))?;
    let root = if plan.is_materialized(root) {
        root
    } else {
        wrap_in_materialize(&mut plan, root)
    };
    plan.root = Some(root);

    if let Some(limit) = query.limit {
        plan.add_limit(limit)?;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flounder_sql::parse_sql;
    use flounder_storage::Relation;
    use flounder_types::{Attribute, SqlType};

    fn db_with(tables: &[(&str, &[(&str, SqlType)], usize)]) -> Database {
        let mut db = Database::new();
        for (name, cols, rows) in tables {
            let schema = Schema::new(
                cols.iter()
                    .map(|(n, t)| Attribute {
                        name: (*n).to_owned(),
                        ty: *t,
                    })
                    .collect(),
                true,
            )
            .unwrap();
            let mut rel = Relation::new(schema).unwrap();
            for i in 0..*rows {
                let slot = rel.append_tuple();
                unsafe { (slot as *mut i64).write_unaligned(i as i64) };
            }
            db.insert((*name).to_owned(), rel).unwrap();
        }
        db
    }

    #[test]
    fn simple_select_becomes_scan_projection_materialize() {
        let db = db_with(&[("r", &[("a", SqlType::bigint())], 3)]);
        let mut q = parse_sql("SELECT a FROM r").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        assert!(matches!(plan.op(root).kind, OpKind::Materialize { .. }));
        let proj = plan.child(root, 0);
        assert!(matches!(plan.op(proj).kind, OpKind::Projection { .. }));
        let scan = plan.child(proj, 0);
        assert!(matches!(plan.op(scan).kind, OpKind::Scan { .. }));
    }

    #[test]
    fn where_pushes_down_to_a_selection_above_the_scan() {
        let db = db_with(&[("r", &[("a", SqlType::bigint())], 3)]);
        let mut q = parse_sql("SELECT * FROM r WHERE a < 2").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let sel = plan.child(root, 0);
        assert!(matches!(plan.op(sel).kind, OpKind::Selection { .. }));
        let scan = plan.child(sel, 0);
        assert!(matches!(plan.op(scan).kind, OpKind::Scan { .. }));
    }

    #[test]
    fn join_equality_creates_a_hash_join_with_small_build_side() {
        let db = db_with(&[
            ("r", &[("a", SqlType::bigint())], 100),
            ("s", &[("c", SqlType::bigint())], 10),
        ]);
        let mut q = parse_sql("SELECT * FROM r, s WHERE a = c").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let hj = plan.child(root, 0);
        let OpKind::HashJoin { equalities, .. } = &plan.op(hj).kind else {
            panic!("expected hash join, got {}", plan.op(hj).kind.name());
        };
        assert_eq!(equalities.len(), 1);
        // the smaller relation (s) is the left/build child
        let build = plan.child(hj, 0);
        let OpKind::Scan { name, .. } = &plan.op(build).kind else {
            panic!("expected scan on the build side");
        };
        assert_eq!(name, "s");
    }

    #[test]
    fn cross_product_uses_nested_loops_with_materialized_sides() {
        let db = db_with(&[
            ("r", &[("a", SqlType::bigint())], 3),
            ("s", &[("c", SqlType::bigint())], 3),
        ]);
        let mut q = parse_sql("SELECT * FROM r, s").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let nlj = plan.child(root, 0);
        assert!(matches!(
            plan.op(nlj).kind,
            OpKind::NestedLoopsJoin { .. }
        ));
        for i in 0..2 {
            let side = plan.child(nlj, i);
            assert!(matches!(plan.op(side).kind, OpKind::Materialize { .. }));
        }
    }

    #[test]
    fn group_by_adds_aggregation_below_projection() {
        let db = db_with(&[("r", &[("a", SqlType::bigint()), ("b", SqlType::bigint())], 3)]);
        let mut q = parse_sql("SELECT a, SUM(b) FROM r GROUP BY a").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let proj = plan.child(root, 0);
        assert!(matches!(plan.op(proj).kind, OpKind::Projection { .. }));
        let agg = plan.child(proj, 0);
        let OpKind::Aggregation { agg: aggs, group, .. } = &plan.op(agg).kind else {
            panic!("expected aggregation");
        };
        assert_eq!(aggs.len(), 1);
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn order_by_wraps_child_in_materialize() {
        let db = db_with(&[("r", &[("a", SqlType::bigint())], 3)]);
        let mut q = parse_sql("SELECT a FROM r ORDER BY a LIMIT 5").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let OpKind::OrderBy { limit, .. } = &plan.op(root).kind else {
            panic!("expected order by at the root");
        };
        assert_eq!(*limit, Some(5));
        let mat = plan.child(root, 0);
        assert!(matches!(plan.op(mat).kind, OpKind::Materialize { .. }));
    }

    #[test]
    fn constant_projection_needs_no_from() {
        let db = Database::new();
        let mut q = parse_sql("SELECT 1515.1414").unwrap();
        let plan = build_plan(&mut q, &db).unwrap();
        let root = plan.root.unwrap();
        let proj = plan.child(root, 0);
        assert!(plan.op(proj).children.is_empty());
    }

    #[test]
    fn missing_table_is_reported() {
        let db = Database::new();
        let mut q = parse_sql("SELECT * FROM nope").unwrap();
        assert!(build_plan(&mut q, &db).is_err());
    }
}
