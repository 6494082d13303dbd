//! Statement dispatch: control toggles, SELECT through the JIT core,
//! CREATE TABLE and BULK INSERT against the catalog.

use std::fmt::Write as _;
use std::path::Path;

use flounder_error::{FlounderError, Result};
use flounder_sql::{parse_sql, Query, QueryTag};
use flounder_storage::{
    print_relation, print_string_table, relation_from_file, serialize_relation, Database, Relation,
};
use flounder_types::{Attribute, Schema};
use serde::{Deserialize, Serialize};

use crate::context::{JitConfig, JitContext, JitExecutionReport};
use crate::operators::{define_expressions, produce};
use crate::planner::build_plan;

/// Session configuration, adjusted by the control toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    pub jit: JitConfig,
    pub show_plan: bool,
    pub write_results_to_file: bool,
}

/// The outcome of one successfully executed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryOutcome {
    Control {
        message: String,
    },
    Select {
        report: JitExecutionReport,
        table: String,
        plan: String,
    },
    CreateTable {
        table_name: String,
    },
    BulkInsert {
        num_inserts: u64,
    },
}

/// What goes back to the user (or over the wire): an outcome, or a
/// recoverable error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub outcome: Option<QueryOutcome>,
    pub error: bool,
    pub error_message: String,
}

impl QueryResult {
    fn ok(outcome: QueryOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            error: false,
            error_message: String::new(),
        }
    }

    fn err(e: &FlounderError) -> Self {
        Self {
            outcome: None,
            error: true,
            error_message: e.to_string(),
        }
    }

    /// Human-readable rendering for the REPL.
    pub fn render(&self) -> String {
        if self.error {
            return format!("Query error: {}\n", self.error_message);
        }
        match &self.outcome {
            Some(QueryOutcome::Control { message }) => message.clone(),
            Some(QueryOutcome::Select {
                report,
                table,
                plan,
            }) => {
                let mut out = String::new();
                if !plan.is_empty() {
                    out.push_str(plan);
                }
                out.push_str(&report.render());
                out.push_str(table);
                out
            }
            Some(QueryOutcome::CreateTable { table_name }) => {
                format!("Created table {table_name}\n")
            }
            Some(QueryOutcome::BulkInsert { num_inserts }) => {
                format!("Inserted {num_inserts} tuples\n")
            }
            None => "Undefined query result.\n".to_owned(),
        }
    }
}

/// `name` alone prints the current value; `name=true|false` sets it.
fn set_bool_var(cmd: &str, name: &str, var: &mut bool, out: &mut String) -> Result<bool> {
    let stripped: String = cmd.chars().filter(|c| !c.is_whitespace()).collect();
    if !stripped.starts_with(name) {
        return Ok(false);
    }
    if stripped.len() == name.len() {
        let _ = writeln!(out, "{}", if *var { "true" } else { "false" });
        return Ok(true);
    }
    let rest = &stripped[name.len()..];
    let Some(value) = rest.strip_prefix('=') else {
        return Err(FlounderError::syntax("expected varname=value"));
    };
    match value {
        "true" => *var = true,
        "false" => *var = false,
        _ => return Err(FlounderError::syntax("expected true or false")),
    }
    Ok(true)
}

fn show_tables(db: &Database) -> String {
    let mut cells = vec![
        "Table name".to_owned(),
        "Number of attributes".to_owned(),
        "Number of tuples".to_owned(),
    ];
    for (name, rel) in db.iter() {
        cells.push(name.clone());
        cells.push(rel.schema.len().to_string());
        cells.push(rel.tuple_count().to_string());
    }
    let sub = format!("{} tables", db.len());
    print_string_table(&cells, 3, 1, &sub, 0, false)
}

/// Handle the control vocabulary; `Ok(None)` means the line is a SQL
/// statement.
fn process_control(
    line: &str,
    db: &Database,
    config: &mut DbConfig,
) -> Result<Option<QueryOutcome>> {
    let mut out = String::new();
    let mut done = false;
    done |= set_bool_var(line, "showplan", &mut config.show_plan, &mut out)?;
    done |= set_bool_var(line, "tofile", &mut config.write_results_to_file, &mut out)?;
    done |= set_bool_var(line, "parallel", &mut config.jit.parallel, &mut out)?;
    done |= set_bool_var(line, "showperf", &mut config.jit.print_performance, &mut out)?;
    done |= set_bool_var(line, "showasm", &mut config.jit.print_assembly, &mut out)?;
    done |= set_bool_var(line, "showfln", &mut config.jit.print_flounder, &mut out)?;
    done |= set_bool_var(line, "optimize", &mut config.jit.optimize_flounder, &mut out)?;
    done |= set_bool_var(line, "emitmc", &mut config.jit.emit_machine_code, &mut out)?;
    if line.trim() == "tables" {
        out.push_str(&show_tables(db));
        done = true;
    }
    if done {
        Ok(Some(QueryOutcome::Control { message: out }))
    } else {
        Ok(None)
    }
}

/// Compile and run one parsed SELECT; returns the report, the output
/// relation, and the rendered plan (when requested).
pub fn run_select(
    query: &mut Query,
    db: &Database,
    config: &DbConfig,
) -> Result<(JitExecutionReport, Box<Relation>, String)> {
    let mut plan = build_plan(query, db)?;
    let root = plan.root.expect("built plan has a root");

    let rendered_plan = if config.show_plan {
        plan.render()
    } else {
        String::new()
    };

    let mut ident_types = db.identifier_types();
    define_expressions(&mut plan, root, &mut query.arena, &mut ident_types)?;

    let mut ctx = JitContext::new(config.jit.clone());
    ctx.request_all = query.request_all;
    produce(
        &mut plan,
        root,
        &mut ctx,
        &mut query.arena,
        Default::default(),
    )?;
    ctx.compile()?;
    ctx.execute()?;

    let rel = plan.retrieve_result()?;
    Ok((ctx.report.clone(), rel, rendered_plan))
}

fn execute_select(query: &mut Query, db: &Database, config: &DbConfig) -> Result<QueryOutcome> {
    let (report, rel, rendered_plan) = run_select(query, db, config)?;
    if config.write_results_to_file {
        std::fs::write("qres.tbl", serialize_relation(&rel, "|"))?;
    }
    Ok(QueryOutcome::Select {
        report,
        table: print_relation(&rel),
        plan: rendered_plan,
    })
}

fn execute_create_table(query: &Query, db: &mut Database) -> Result<QueryOutcome> {
    let attributes = query
        .columns
        .iter()
        .map(|c| Attribute {
            name: c.name.clone(),
            ty: c.ty,
        })
        .collect();
    let schema = Schema::new(attributes, true)?;
    db.insert(query.table_name.clone(), Relation::new(schema)?)?;
    Ok(QueryOutcome::CreateTable {
        table_name: query.table_name.clone(),
    })
}

fn execute_bulk_insert(query: &Query, db: &mut Database) -> Result<QueryOutcome> {
    let schema = db.get(&query.table_name)?.schema.clone();
    let loaded = relation_from_file(
        schema,
        Path::new(&query.file_name),
        query.field_terminator,
    )?;
    let num_inserts = loaded.tuple_count() as u64;
    let table = db.get_mut(&query.table_name)?;
    // move the loaded tuples over block-wise
    let step = table.schema.tuple_size;
    loaded.for_each_tuple(|src| {
        let dst = table.append_tuple();
        unsafe { std::ptr::copy_nonoverlapping(src, dst, step) };
    });
    Ok(QueryOutcome::BulkInsert { num_inserts })
}

/// Execute one statement; recoverable errors become an error-carrying
/// result, the session continues.
pub fn execute_statement(statement: &str, db: &mut Database, config: &mut DbConfig) -> QueryResult {
    let mut run = || -> Result<QueryOutcome> {
        if let Some(outcome) = process_control(statement, db, config)? {
            return Ok(outcome);
        }
        let mut query = parse_sql(statement)?;
        match query.tag {
            QueryTag::Select => execute_select(&mut query, db, config),
            QueryTag::CreateTable => execute_create_table(&query, db),
            QueryTag::BulkInsert => execute_bulk_insert(&query, db),
        }
    };
    match run() {
        Ok(outcome) => QueryResult::ok(outcome),
        Err(e) => {
            tracing::debug!(%e, "statement failed");
            QueryResult::err(&e)
        }
    }
}

/// Expand `exec <filename>` statements in place into the statements of the
/// file, split on `;`, discarding whitespace-only pieces; `exec` may nest.
pub fn expand_exec_statements(statement: &str) -> Result<Vec<String>> {
    let trimmed = statement.trim();
    let Some(filename) = trimmed.strip_prefix("exec ") else {
        return Ok(vec![trimmed.to_owned()]);
    };
    let filename = filename.trim();
    let content =
        std::fs::read_to_string(filename).map_err(|_| FlounderError::CannotOpen {
            path: filename.to_owned(),
        })?;
    let mut result = Vec::new();
    for piece in content.split(';') {
        if piece.trim().is_empty() {
            continue;
        }
        result.extend(expand_exec_statements(piece)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_toggles_set_and_report() {
        let db = Database::new();
        let mut config = DbConfig::default();
        let res = process_control("showperf=true", &db, &mut config)
            .unwrap()
            .unwrap();
        assert!(matches!(res, QueryOutcome::Control { .. }));
        assert!(config.jit.print_performance);

        let res = process_control("showperf", &db, &mut config).unwrap();
        let Some(QueryOutcome::Control { message }) = res else {
            panic!("expected control outcome");
        };
        assert_eq!(message.trim(), "true");

        assert!(process_control("select 1", &db, &mut config)
            .unwrap()
            .is_none());
        assert!(process_control("showperf=nope", &db, &mut config).is_err());
    }

    #[test]
    fn create_table_and_catalog_listing() {
        let mut db = Database::new();
        let mut config = DbConfig::default();
        let res = execute_statement("CREATE TABLE r (a BIGINT, b DECIMAL(5,1))", &mut db, &mut config);
        assert!(!res.error, "{}", res.error_message);
        assert!(db.contains("r"));

        let res = execute_statement("tables", &mut db, &mut config);
        assert!(res.render().contains('r'));

        // duplicate creation is a recoverable error
        let res = execute_statement("CREATE TABLE r (a BIGINT)", &mut db, &mut config);
        assert!(res.error);
    }

    #[test]
    fn syntax_errors_are_recoverable() {
        let mut db = Database::new();
        let mut config = DbConfig::default();
        let res = execute_statement("SELEC oops", &mut db, &mut config);
        assert!(res.error);
        assert!(res.render().contains("Query error"));
    }

    #[test]
    fn bulk_insert_loads_rows() {
        use std::io::Write as _;
        let mut db = Database::new();
        let mut config = DbConfig::default();
        execute_statement("CREATE TABLE t (a BIGINT, b BIGINT)", &mut db, &mut config);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1,10").unwrap();
        writeln!(f, "2,20").unwrap();
        let stmt = format!("BULK INSERT t FROM '{}'", f.path().display());
        let res = execute_statement(&stmt, &mut db, &mut config);
        assert!(!res.error, "{}", res.error_message);
        assert_eq!(db.get("t").unwrap().tuple_count(), 2);
    }

    #[test]
    fn exec_expansion_reads_nested_files() {
        use std::io::Write as _;
        let mut inner = tempfile::NamedTempFile::new().unwrap();
        writeln!(inner, "CREATE TABLE a (x BIGINT);").unwrap();
        let mut outer = tempfile::NamedTempFile::new().unwrap();
        writeln!(outer, "exec {};", inner.path().display()).unwrap();
        writeln!(outer, "CREATE TABLE b (y BIGINT)").unwrap();
        let stmts =
            expand_exec_statements(&format!("exec {}", outer.path().display())).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("TABLE a"));
        assert!(stmts[1].contains("TABLE b"));
    }
}
