//! Flounder IR: a low-level, tree-shaped intermediate representation that
//! models x86-64 instructions plus a small set of higher-level pseudo
//! operations (virtual registers, managed calls with ABI translation, loop
//! markers), and the pipeline that rewrites it into executable machine code.
//!
//! IR nodes live in a per-query index arena; the instruction stream is the
//! child list of a root node. `add_child` copies the added node so that IR
//! sub-templates (register nodes in particular) can be inserted any number
//! of times while each instruction keeps stable sibling links.

mod abi;
mod analyze;
mod arena;
mod asm;
mod callconv;
mod constructs;
mod encode;
mod jit_memory;
mod lang;
mod nasm;
mod optimize;
mod regalloc;
mod simd;
mod translate;

pub use abi::*;
pub use analyze::{analyze_code, CodeAnalysis, LineInfo, MemAccess, MemAccessKind, RegAccess};
pub use arena::{EmitShape, IrArena, IrNode, NodeId, NodeKind, Payload};
pub use asm::Mreg;
pub use callconv::place_managed_call;
pub use constructs::{Comparator, IfClause, WhileLoop};
pub use encode::Assembler;
pub use jit_memory::ExecutableCode;
pub use lang::{can_use_memory_operand, instr_reads, instr_writes, is_managed_call};
pub use nasm::assemble_with_nasm;
pub use optimize::optimize;
pub use regalloc::RegisterAllocationState;
pub use simd::{apply_simd_fusion, SimdLevel};
pub use translate::{print_formatted_flounder, translate_to_machine_ir, TranslateOptions};
