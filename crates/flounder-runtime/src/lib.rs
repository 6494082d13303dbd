//! The runtime library of the Flounder engine.
//!
//! Everything here is callable from JIT-compiled queries through managed-call
//! IR nodes: the hash table used by joins and aggregation, scalar helpers
//! (hashing, string comparison, LIKE, checked arithmetic), the in-place
//! relation sort, and the synchronization primitives that coordinate worker
//! threads. Entry points reachable from generated code are `extern "C"` and
//! take raw pointers.

mod fault;
mod hash;
mod scalar;
mod sort;
mod sync;
mod table;

pub use fault::{runtime_fault, RuntimeFault};
pub use hash::{hash_char, hash_u64, hash_varchar, HASH_FACTOR_A, HASH_FACTOR_B, HASH_STRING_FACTOR};
pub use scalar::{
    checked_add_i64, checked_div_i64, checked_mul_i64, checked_sub_i64, cmp_char, cmp_varchar,
    string_like, write_string, DECIMAL_FACTORS,
};
pub use sort::{sort_relation, OrderRequest, OrderRequestList};
pub use sync::{barrier_wait, guard_enter, BuildBarrier, SingleThreadGuard};
pub use table::{ht_get, ht_put, HashTable, ENTRY_HEADER_SIZE};
