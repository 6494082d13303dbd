//! The query engine core: JIT context, expression and value code
//! generation, the relational operators in the produce/consume push model,
//! the planner, and the statement executor.

mod context;
mod executor;
mod exprgen;
mod operators;
mod planner;
mod values;

pub use context::{JitConfig, JitContext, JitExecutionReport, RelationalContext};
pub use executor::{
    execute_statement, expand_exec_statements, run_select, DbConfig, QueryOutcome, QueryResult,
};
pub use operators::{OpId, OpKind, OpTag, Operator, Plan};
pub use planner::build_plan;
pub use values::{MatConfig, Value, ValueSet, HT_MAT_CONFIG, RELATION_MAT_CONFIG};
