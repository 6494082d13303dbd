//! SQL frontend: lexer, recursive-descent parser, the expression arena the
//! rest of the engine works on, and type derivation with implicit typecast
//! insertion.

mod ast;
mod derive;
mod lexer;
mod parser;

pub use ast::{Expr, ExprArena, ExprId, ExprTag, Structure};
pub use derive::{common_super_type, derive_expression_types, derive_types_for_list};
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::{parse_sql, ColumnDef, Query, QueryTag};
