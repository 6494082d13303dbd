//! End-to-end query execution: parse, plan, JIT-compile through the direct
//! emitter, execute, and inspect the output relation.

#![cfg(target_arch = "x86_64")]

use flounder_engine::{run_select, DbConfig};
use flounder_sql::parse_sql;
use flounder_storage::{Database, Relation};
use flounder_types::{value_from_address, Attribute, Schema, SqlType, TypeTag};

fn db_from_rows(
    tables: &[(&str, &[(&str, SqlType)], &[&[i64]])],
) -> Database {
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
        let mut rel = Relation::new(schema.clone()).unwrap();
        for row in *rows {
            let slot = rel.append_tuple();
            let mut offset = 0usize;
            for ((_, ty), v) in cols.iter().zip(*row) {
                unsafe {
                    match ty.tag {
                        TypeTag::Bigint | TypeTag::Decimal => {
                            (slot.add(offset) as *mut i64).write_unaligned(*v)
                        }
                        TypeTag::Int | TypeTag::Date => {
                            (slot.add(offset) as *mut i32).write_unaligned(*v as i32)
                        }
                        TypeTag::Bool => slot.add(offset).write(*v as u8),
                        _ => panic!("unsupported fixture type"),
                    }
                }
                offset += flounder_types::size_in_tuple(*ty, true).unwrap();
            }
        }
        db.insert((*name).to_owned(), rel).unwrap();
    }
    db
}

fn select(db: &Database, sql: &str) -> (Schema, Vec<Vec<i64>>) {
    let mut query = parse_sql(sql).unwrap();
    let (_, rel, _) = run_select(&mut query, db, &DbConfig::default()).unwrap();
    collect_rows(&rel)
}

fn collect_rows(rel: &Relation) -> (Schema, Vec<Vec<i64>>) {
    let schema = rel.schema.clone();
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    for att in &schema.attributes {
        offsets.push(offset);
        offset += flounder_types::size_in_tuple(att.ty, true).unwrap();
    }
    let mut rows = Vec::new();
    rel.for_each_tuple(|t| {
        let mut row = Vec::new();
        for (att, off) in schema.attributes.iter().zip(&offsets) {
            let val = unsafe { value_from_address(att.ty, t.add(*off)) };
            let cell = match att.ty.tag {
                TypeTag::Bigint | TypeTag::Decimal => val.as_i64(),
                TypeTag::Int => i64::from(val.as_i32()),
                TypeTag::Date => i64::from(val.as_u32()),
                TypeTag::Bool => i64::from(val.as_bool()),
                _ => 0,
            };
            row.push(cell);
        }
        rows.push(row);
    });
    (schema, rows)
}

/// `SELECT 1515.1414` yields one DECIMAL(8,4) row with that exact value.
#[test]
fn constant_projection_roundtrip() {
    let db = Database::new();
    let (schema, rows) = select(&db, "SELECT 1515.1414");
    assert_eq!(schema.attributes[0].ty, SqlType::decimal(8, 4));
    assert_eq!(rows, vec![vec![15151414]]);
}

/// Disjunctive range predicate over a decimal column.
#[test]
fn selection_with_or_predicate() {
    // quantity DECIMAL(5,1) stored as scaled i64
    let rows: &[&[i64]] = &[
        &[9999, 19980101],
        &[10000, 19980101],
        &[10001, 19980101],
        &[19, 19980101],
        &[1234, 19980101],
        &[12345, 19980101],
        &[10000, 19980101],
        &[99999, 19980101],
    ];
    let db = db_from_rows(&[(
        "rel",
        &[
            ("quantity", SqlType::decimal(5, 1)),
            ("d", SqlType::date()),
        ],
        rows,
    )]);
    let (_, mut out) = select(
        &db,
        "SELECT * FROM rel WHERE quantity < 10.0 OR quantity > 1000.0",
    );
    let mut quantities: Vec<i64> = out.drain(..).map(|r| r[0]).collect();
    quantities.sort_unstable();
    assert_eq!(quantities, vec![19, 10001, 12345, 99999]);
}

/// Hash join on a=c: keys 1 and 2 match twice each on the probe side, key 3
/// twice, the rest never.
#[test]
fn hash_join_matches_all_pairs() {
    let r: &[&[i64]] = &[
        &[1, 100],
        &[2, 200],
        &[2, 100],
        &[3, 200],
        &[4, 100],
        &[5, 200],
    ];
    let s: &[&[i64]] = &[
        &[1, 300],
        &[2, 400],
        &[3, 300],
        &[1, 400],
        &[2, 300],
        &[3, 400],
    ];
    let db = db_from_rows(&[
        (
            "r",
            &[("a", SqlType::bigint()), ("b", SqlType::bigint())],
            r,
        ),
        (
            "s",
            &[("c", SqlType::bigint()), ("d", SqlType::bigint())],
            s,
        ),
    ]);
    let (_, rows) = select(&db, "SELECT * FROM r, s WHERE a = c");
    assert_eq!(rows.len(), 8);
    for row in &rows {
        // schema is the join of both sides; the key columns must agree
        let a = row[0];
        let c = row[2];
        assert_eq!(a, c);
        assert!(a == 1 || a == 2 || a == 3);
    }
}

/// `SELECT a, SUM(b) GROUP BY a` over the triangular input.
#[test]
fn group_by_sum() {
    let rows: &[&[i64]] = &[
        &[2, 1],
        &[3, 1],
        &[3, 2],
        &[4, 1],
        &[4, 2],
        &[4, 3],
        &[5, 1],
        &[5, 2],
        &[5, 3],
        &[5, 4],
        &[6, 1],
        &[6, 2],
        &[6, 3],
        &[6, 4],
        &[6, 5],
    ];
    let db = db_from_rows(&[(
        "rel",
        &[("a", SqlType::bigint()), ("b", SqlType::bigint())],
        rows,
    )]);
    let (_, mut out) = select(&db, "SELECT a, SUM(b) FROM rel GROUP BY a");
    out.sort();
    assert_eq!(
        out,
        vec![
            vec![2, 1],
            vec![3, 3],
            vec![4, 6],
            vec![5, 10],
            vec![6, 15]
        ]
    );
}

/// SUM/COUNT/AVG together; the emit phase merges the split pair back into
/// AVG with DECIMAL(_, scale+2) scaling.
#[test]
fn aggregation_merges_avg() {
    let rows: &[&[i64]] = &[&[1, 10], &[1, 20], &[2, 30]];
    let db = db_from_rows(&[(
        "rel",
        &[("g", SqlType::bigint()), ("v", SqlType::bigint())],
        rows,
    )]);
    let (schema, mut out) = select(
        &db,
        "SELECT g, SUM(v), COUNT(v), AVG(v) FROM rel GROUP BY g",
    );
    out.sort();
    // AVG(v) of BIGINT sums scaled by 100: 15.00 -> 1500, 30.00 -> 3000
    assert_eq!(out, vec![vec![1, 30, 2, 1500], vec![2, 30, 1, 3000]]);
    assert_eq!(schema.attributes[3].ty.tag, TypeTag::Decimal);
}

/// Typecast chain: `90.99*0.33 < (120+285)*0.1` is true.
#[test]
fn mixed_decimal_comparison() {
    let db = Database::new();
    let (schema, rows) = select(&db, "SELECT 90.99*0.33 < (120+285)*0.1");
    assert_eq!(schema.attributes[0].ty, SqlType::bool());
    assert_eq!(rows, vec![vec![1]]);
}

/// ORDER BY returns the strictly non-decreasing sequence, order preserved.
#[test]
fn order_by_sorts_ascending() {
    let input = [1i64, 1, 2, 1, 2, 3, 1, 2, 3, 4, 1, 2, 3, 4, 5];
    let rows: Vec<Vec<i64>> = input.iter().map(|&a| vec![a]).collect();
    let row_refs: Vec<&[i64]> = rows.iter().map(|r| r.as_slice()).collect();
    let db = db_from_rows(&[("rel", &[("a", SqlType::bigint())], &row_refs)]);
    let (_, out) = select(&db, "SELECT a FROM rel ORDER BY a ASC");
    let got: Vec<i64> = out.iter().map(|r| r[0]).collect();
    assert_eq!(got, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4, 5]);
}

/// LIMIT caps the materialized result.
#[test]
fn limit_caps_output() {
    let rows: Vec<Vec<i64>> = (0..100).map(|i| vec![i]).collect();
    let row_refs: Vec<&[i64]> = rows.iter().map(|r| r.as_slice()).collect();
    let db = db_from_rows(&[("rel", &[("a", SqlType::bigint())], &row_refs)]);
    let (_, out) = select(&db, "SELECT a FROM rel LIMIT 7");
    assert_eq!(out.len(), 7);
}

/// Arithmetic projection over scanned attributes.
#[test]
fn projection_arithmetic() {
    let rows: &[&[i64]] = &[&[1, 10], &[2, 20]];
    let db = db_from_rows(&[(
        "rel",
        &[("a", SqlType::bigint()), ("b", SqlType::bigint())],
        rows,
    )]);
    let (_, mut out) = select(&db, "SELECT a + b AS s FROM rel");
    out.sort();
    assert_eq!(out, vec![vec![11], vec![22]]);
}

/// CASE WHEN with ELSE.
#[test]
fn case_expression() {
    let rows: &[&[i64]] = &[&[1], &[2], &[3]];
    let db = db_from_rows(&[("rel", &[("a", SqlType::bigint())], rows)]);
    let (_, mut out) = select(
        &db,
        "SELECT CASE WHEN a = 1 THEN 10 WHEN a = 2 THEN 20 ELSE 30 END AS c FROM rel",
    );
    out.sort();
    assert_eq!(out, vec![vec![10], vec![20], vec![30]]);
}

/// MIN/MAX accumulators.
#[test]
fn min_max_aggregates() {
    let rows: &[&[i64]] = &[&[1, 5], &[1, 2], &[1, 9], &[2, 4]];
    let db = db_from_rows(&[(
        "rel",
        &[("g", SqlType::bigint()), ("v", SqlType::bigint())],
        rows,
    )]);
    let (_, mut out) = select(&db, "SELECT g, MIN(v), MAX(v) FROM rel GROUP BY g");
    out.sort();
    assert_eq!(out, vec![vec![1, 2, 9], vec![2, 4, 4]]);
}

/// Nested-loops cross product.
#[test]
fn cross_product_counts() {
    let r: &[&[i64]] = &[&[1], &[2], &[3]];
    let s: &[&[i64]] = &[&[10], &[20]];
    let db = db_from_rows(&[
        ("r", &[("a", SqlType::bigint())], r),
        ("s", &[("c", SqlType::bigint())], s),
    ]);
    let (_, rows) = select(&db, "SELECT * FROM r, s");
    assert_eq!(rows.len(), 6);
}

/// Parallel execution produces the same aggregate result.
#[test]
fn parallel_aggregation() {
    let rows: Vec<Vec<i64>> = (0..1000).map(|i| vec![i % 10, 1]).collect();
    let row_refs: Vec<&[i64]> = rows.iter().map(|r| r.as_slice()).collect();
    let db = db_from_rows(&[(
        "rel",
        &[("g", SqlType::bigint()), ("v", SqlType::bigint())],
        &row_refs,
    )]);
    let mut query = parse_sql("SELECT g, SUM(v) FROM rel GROUP BY g").unwrap();
    let mut config = DbConfig::default();
    config.jit.parallel = true;
    let (_, rel, _) = run_select(&mut query, &db, &config).unwrap();
    let (_, mut out) = collect_rows(&rel);
    out.sort();
    assert_eq!(out.len(), 10);
    for row in out {
        assert_eq!(row[1], 100);
    }
}

/// VARCHAR attributes flow by reference through the predicate and are
/// copied inline into the result relation.
#[test]
fn varchar_like_filter() {
    let schema = Schema::new(
        vec![
            Attribute {
                name: "k".into(),
                ty: SqlType::bigint(),
            },
            Attribute {
                name: "name".into(),
                ty: SqlType::varchar(16),
            },
        ],
        true,
    )
    .unwrap();
    let mut rel = Relation::new(schema).unwrap();
    for (k, name) in [(1i64, "anchovy"), (2, "herring"), (3, "flounder")] {
        let slot = rel.append_tuple();
        unsafe {
            (slot as *mut i64).write_unaligned(k);
            let bytes = name.as_bytes();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(8), bytes.len());
            slot.add(8 + bytes.len()).write(0);
        }
    }
    let mut db = Database::new();
    db.insert("fish".into(), rel).unwrap();

    let mut query = parse_sql("SELECT k, name FROM fish WHERE name LIKE '%er%'").unwrap();
    let (_, out, _) = run_select(&mut query, &db, &DbConfig::default()).unwrap();
    let mut hits = Vec::new();
    out.for_each_tuple(|t| unsafe {
        let k = (t as *const i64).read_unaligned();
        let name = value_from_address(SqlType::varchar(16), t.add(8));
        hits.push((k, flounder_types::serialize_value(name, SqlType::varchar(16))));
    });
    hits.sort();
    assert_eq!(
        hits,
        vec![(2, "herring".to_owned()), (3, "flounder".to_owned())]
    );
}

/// The external-assembler backend produces the same results as the direct
/// emitter (skipped when nasm is unavailable).
#[test]
fn nasm_backend_matches_direct_emitter() {
    let nasm_available = std::process::Command::new("nasm")
        .arg("-v")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !nasm_available {
        eprintln!("nasm not installed, skipping");
        return;
    }
    let rows: &[&[i64]] = &[&[5], &[6], &[7]];
    let db = db_from_rows(&[("rel", &[("a", SqlType::bigint())], rows)]);
    let mut config = DbConfig::default();
    config.jit.emit_machine_code = false;
    let mut query = parse_sql("SELECT a FROM rel WHERE a > 5").unwrap();
    let (report, rel, _) = run_select(&mut query, &db, &config).unwrap();
    assert!(report.nasm_time_ms >= 0.0);
    let (_, out) = collect_rows(&rel);
    let mut keys: Vec<i64> = out.iter().map(|r| r[0]).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![6, 7]);
}

/// DATE comparison against a quoted literal.
#[test]
fn date_filter() {
    let rows: &[&[i64]] = &[&[19980101], &[19990101], &[20000101]];
    let db = db_from_rows(&[("rel", &[("d", SqlType::date())], rows)]);
    let (_, out) = select(&db, "SELECT * FROM rel WHERE d < '1999-06-15'");
    assert_eq!(out.len(), 2);
}
