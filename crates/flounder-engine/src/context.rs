//! Per-query JIT state: the code trees and pipeline frames, the symbol
//! table, configuration, and the compile/execute driver.

use std::collections::BTreeMap;
use std::time::Instant;

use flounder_error::{FlounderError, Result};
use flounder_ir::{
    assemble_with_nasm, Assembler, ExecutableCode, IrArena, NodeId, SimdLevel, TranslateOptions,
};
use flounder_types::{SqlType, TypeTag};
use serde::{Deserialize, Serialize};

/// Configuration of one JIT compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitConfig {
    /// Show the result assembly in the report.
    pub print_assembly: bool,
    /// Show the Flounder IR in the report.
    pub print_flounder: bool,
    /// Show compile/execute timings.
    pub print_performance: bool,
    /// Execute with one worker thread per hardware thread.
    pub parallel: bool,
    /// Emit machine code directly (true) or go through the external
    /// assembler (false).
    pub emit_machine_code: bool,
    /// Apply the Flounder optimization passes.
    pub optimize_flounder: bool,
    /// Vector width for the optional load/store fusion.
    #[serde(skip)]
    pub simd: Option<SimdLevel>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            print_assembly: false,
            print_flounder: false,
            print_performance: false,
            parallel: false,
            emit_machine_code: true,
            optimize_flounder: false,
            simd: None,
        }
    }
}

impl JitConfig {
    pub fn num_threads(&self) -> usize {
        if self.parallel {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            1
        }
    }
}

/// Execution details: performance numbers and the printed code dumps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JitExecutionReport {
    pub print_code: String,
    pub num_machine_instructions: usize,
    pub compilation_time_ms: f64,
    pub nasm_time_ms: f64,
    pub execution_time_ms: f64,
    pub emit_machine_code: bool,
    pub print_performance: bool,
}

impl JitExecutionReport {
    /// Human-readable rendering honoring the config toggles.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.print_code);
        if self.print_performance {
            if self.emit_machine_code {
                out.push_str(&format!(
                    "Emitted {} machine instructions.\n",
                    self.num_machine_instructions
                ));
            }
            out.push_str(&format!("compile: {:.3} ms\n", self.compilation_time_ms));
            if !self.emit_machine_code {
                out.push_str(&format!("nasm:    {:.3} ms\n", self.nasm_time_ms));
            }
            out.push_str(&format!("execute: {:.3} ms\n", self.execution_time_ms));
        }
        out
    }
}

/// Relational (IR-independent) compilation context: the expression id
/// generator, the inner-scan depth that decides pipeline ownership, and the
/// types of registered symbols.
#[derive(Debug, Default)]
pub struct RelationalContext {
    pub inner_scan_count: usize,
    pub expr_id_gen: u64,
    pub symbol_types: BTreeMap<String, SqlType>,
}

/// Holds the generated Flounder IR and the code generation status of one
/// query: code frames and insertion points, the symbol table, and the
/// label selection-like operators jump to for skipping a tuple.
pub struct JitContext {
    pub rel: RelationalContext,
    /// All attributes are requested, as in `SELECT *`.
    pub request_all: bool,
    pub config: JitConfig,
    pub report: JitExecutionReport,

    pub ir: IrArena,
    pub code_tree: NodeId,
    code_header: NodeId,
    code_footer: NodeId,

    /// Cursor in `code_tree` where the pending pipeline header is spliced.
    ins_pipe_header: Option<NodeId>,
    pipe_header: NodeId,
    pipe_footer: NodeId,

    /// The current loop's continue label; filters branch here to skip the
    /// tuple.
    pub label_next_tuple: Option<NodeId>,

    /// Symbol name → IR value currently holding it.
    pub symbol_table: BTreeMap<String, NodeId>,

    compiled: Option<ExecutableCode>,
}

impl JitContext {
    pub fn new(config: JitConfig) -> Self {
        let mut ir = IrArena::new();
        let code_tree = ir.root();
        let code_header = ir.root();
        let code_footer = ir.root();
        let pipe_header = ir.root();
        let pipe_footer = ir.root();
        Self {
            rel: RelationalContext::default(),
            request_all: false,
            config,
            report: JitExecutionReport::default(),
            ir,
            code_tree,
            code_header,
            code_footer,
            ins_pipe_header: None,
            pipe_header,
            pipe_footer,
            label_next_tuple: None,
            symbol_table: BTreeMap::new(),
            compiled: None,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_threads()
    }

    /// Record the splice cursor and start fresh pipeline frames.
    pub fn open_pipeline(&mut self) {
        self.ins_pipe_header = self.ir.node(self.code_tree).last_child;
        self.pipe_header = self.ir.root();
        self.pipe_footer = self.ir.root();
    }

    /// Splice the pipeline header in at the recorded cursor and append the
    /// footer at the current end.
    pub fn close_pipeline(&mut self) {
        self.ir
            .transfer_children(self.code_tree, self.ins_pipe_header, self.pipe_header);
        let last = self.ir.node(self.code_tree).last_child;
        self.ir
            .transfer_children(self.code_tree, last, self.pipe_footer);
    }

    pub fn emit(&mut self, node: NodeId) {
        self.ir.add_child(self.code_tree, node);
    }

    pub fn comment(&mut self, msg: &str) {
        let c = self.ir.comment_line(msg);
        self.ir.add_child(self.code_tree, c);
    }

    pub fn emit_pipe_head(&mut self, node: NodeId) {
        self.ir.add_child(self.pipe_header, node);
    }

    pub fn emit_pipe_foot(&mut self, node: NodeId) {
        self.ir.add_child(self.pipe_footer, node);
    }

    pub fn emit_code_head(&mut self, node: NodeId) {
        self.ir.add_child(self.code_header, node);
    }

    pub fn emit_code_foot(&mut self, node: NodeId) {
        self.ir.add_child(self.code_footer, node);
    }

    /// Emit a request marker for `vreg` and hand it back.
    pub fn request(&mut self, vreg: NodeId) -> NodeId {
        let marker = self.ir.request_marker(vreg);
        self.emit(marker);
        vreg
    }

    /// Emit a clear marker for `vreg`.
    pub fn clear(&mut self, vreg: NodeId) {
        let marker = self.ir.clear_marker(vreg);
        self.emit(marker);
    }

    /// A fresh vreg of the width matching `ty`; with `explicit` the request
    /// marker is emitted immediately.
    pub fn vreg_for_type(&mut self, ty: SqlType, explicit: bool) -> Result<NodeId> {
        let res = match ty.tag {
            TypeTag::Int => self.ir.vreg32("IntAttribute"),
            TypeTag::Date => self.ir.vreg32("DateAttribute"),
            TypeTag::Bigint => self.ir.vreg64("BigintAttribute"),
            TypeTag::Decimal => self.ir.vreg64("DecimalAttribute"),
            TypeTag::Float => self.ir.vreg64("FloatAttribute"),
            TypeTag::Bool => self.ir.vreg8("BoolAttribute"),
            TypeTag::Char => {
                if ty.len > 1 {
                    self.ir.vreg64("CharAttribute")
                } else {
                    self.ir.vreg8("Char1Attribute")
                }
            }
            TypeTag::Varchar => self.ir.vreg64("VarcharAttribute"),
            TypeTag::Nt => {
                return Err(FlounderError::not_implemented(
                    "vreg for an undefined datatype",
                ))
            }
        };
        if explicit {
            self.request(res);
        }
        Ok(res)
    }

    /// Register a symbol with its value node and type.
    pub fn bind_symbol(&mut self, name: &str, node: NodeId, ty: SqlType) {
        self.symbol_table.insert(name.to_owned(), node);
        self.rel.symbol_types.insert(name.to_owned(), ty);
    }

    pub fn symbol(&self, name: &str) -> Result<NodeId> {
        self.symbol_table
            .get(name)
            .copied()
            .ok_or_else(|| FlounderError::NoSuchAttribute {
                name: name.to_owned(),
            })
    }

    pub fn symbol_type(&self, name: &str) -> Result<SqlType> {
        self.rel
            .symbol_types
            .get(name)
            .copied()
            .ok_or_else(|| FlounderError::NoSuchAttribute {
                name: name.to_owned(),
            })
    }

    /// Prepend the header, append the footer, terminate with `ret`.
    fn finish_code(&mut self) {
        self.ir
            .transfer_children(self.code_tree, None, self.code_header);
        let last = self.ir.node(self.code_tree).last_child;
        self.ir
            .transfer_children(self.code_tree, last, self.code_footer);
        let ret = self.ir.ret();
        self.emit(ret);
    }

    /// Translate the IR and produce the callable function.
    pub fn compile(&mut self) -> Result<()> {
        let t_compile = Instant::now();
        self.finish_code();

        let options = TranslateOptions {
            optimize: self.config.optimize_flounder,
            simd: if self.config.optimize_flounder && !self.config.emit_machine_code {
                self.config.simd
            } else {
                None
            },
            print_flounder: self.config.print_flounder,
            print_assembly: self.config.print_assembly,
        };
        let dump = flounder_ir::translate_to_machine_ir(&mut self.ir, self.code_tree, &options)
            .map_err(|err| {
                tracing::error!(%err, "translation of the Flounder IR failed");
                err
            })?;
        self.report.print_code.push_str(&dump);

        if self.config.emit_machine_code {
            let (code, count) = Assembler::new().assemble(&self.ir, self.code_tree)?;
            self.report.num_machine_instructions = count;
            self.report.compilation_time_ms = t_compile.elapsed().as_secs_f64() * 1000.0;
            self.compiled = Some(ExecutableCode::from_bytes(&code)?);
        } else {
            let text = self.ir.emit(self.code_tree);
            self.report.compilation_time_ms = t_compile.elapsed().as_secs_f64() * 1000.0;
            let t_nasm = Instant::now();
            let code = assemble_with_nasm(&text)?;
            self.compiled = Some(ExecutableCode::from_bytes(&code)?);
            self.report.nasm_time_ms = t_nasm.elapsed().as_secs_f64() * 1000.0;
        }
        self.report.emit_machine_code = self.config.emit_machine_code;
        self.report.print_performance = self.config.print_performance;
        Ok(())
    }

    /// Run the compiled function on the configured number of worker
    /// threads; the function memory is released afterwards.
    pub fn execute(&mut self) -> Result<()> {
        let code = self
            .compiled
            .take()
            .ok_or_else(|| FlounderError::internal("execute before compile"))?;
        let t_exec = Instant::now();
        let entry = unsafe { code.entry() };
        let entry_addr = entry as usize;
        let threads = self.num_threads();
        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(move || {
                    let f =
                        unsafe { std::mem::transmute::<usize, extern "C" fn()>(entry_addr) };
                    f();
                });
            }
        });
        self.report.execution_time_ms = t_exec.elapsed().as_secs_f64() * 1000.0;
        drop(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_splices_header_before_body() {
        let mut ctx = JitContext::new(JitConfig::default());
        ctx.comment("pre");
        ctx.open_pipeline();
        ctx.comment("body");
        let head = ctx.ir.comment_line("head");
        ctx.emit_pipe_head(head);
        let foot = ctx.ir.comment_line("foot");
        ctx.emit_pipe_foot(foot);
        ctx.close_pipeline();

        let text = ctx.ir.emit(ctx.code_tree);
        let pre = text.find(";pre").unwrap();
        let head = text.find(";head").unwrap();
        let body = text.find(";body").unwrap();
        let foot = text.find(";foot").unwrap();
        assert!(pre < head && head < body && body < foot);
    }

    #[test]
    fn vreg_widths_follow_types() {
        let mut ctx = JitContext::new(JitConfig::default());
        let v = ctx.vreg_for_type(SqlType::bool(), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 1);
        let v = ctx.vreg_for_type(SqlType::int(), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 4);
        let v = ctx.vreg_for_type(SqlType::date(), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 4);
        let v = ctx.vreg_for_type(SqlType::decimal(5, 2), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 8);
        let v = ctx.vreg_for_type(SqlType::char(1), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 1);
        let v = ctx.vreg_for_type(SqlType::char(9), false).unwrap();
        assert_eq!(ctx.ir.vreg_byte_size(v), 8);
        assert!(ctx.vreg_for_type(SqlType::NT, false).is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn compiles_and_runs_an_empty_query() {
        let mut ctx = JitContext::new(JitConfig::default());
        ctx.comment("nothing to do");
        ctx.compile().unwrap();
        ctx.execute().unwrap();
        assert!(ctx.report.compilation_time_ms >= 0.0);
    }
}
