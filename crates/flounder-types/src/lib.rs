//! SQL type system and value representation.
//!
//! Types carry a precedence-ordered tag plus an optional parameter spec
//! (decimal precision/scale, char/varchar length). Values are fixed 8-byte
//! cells interpreted per type; strings are pointers to externally owned,
//! NUL-terminated bytes.

mod schema;
mod types;
mod value;

pub use schema::{symbol_set_union, Attribute, Schema, SymbolSet};
pub use types::{size_in_tuple, SqlType, TypeTag};
pub use value::{
    compare_at, parse_date, parse_value, serialize_value, value_from_address, value_to_address,
    write_string_raw, SqlValue,
};
