//! Flounder extensions over the plain x86-64 vocabulary: virtual registers
//! with explicit lifetime markers, constant loads, loop markers, and managed
//! (ABI-translated) calls.

use crate::arena::{EmitShape, IrArena, NodeId, NodeKind};

pub fn is_vreg_kind(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Vreg8 | NodeKind::Vreg32 | NodeKind::Vreg64)
}

pub fn is_managed_call(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::ManagedCall | NodeKind::ManagedSyscall)
}

impl IrArena {
    pub fn is_vreg(&self, node: NodeId) -> bool {
        is_vreg_kind(self.node(node).kind)
    }

    pub fn vreg_byte_size(&self, node: NodeId) -> usize {
        match self.node(node).kind {
            NodeKind::Vreg8 => 1,
            NodeKind::Vreg32 => 4,
            NodeKind::Vreg64 => 8,
            other => panic!("vreg_byte_size on {other:?}"),
        }
    }

    fn vreg(&mut self, name: &str, kind: NodeKind) -> NodeId {
        let id = self.vreg_count;
        self.vreg_count += 1;
        let text = format!("{{{name}({id})}}");
        let n = self.literal(&text, kind);
        self.node_mut(n).id = id;
        n
    }

    pub fn vreg8(&mut self, name: &str) -> NodeId {
        self.vreg(name, NodeKind::Vreg8)
    }

    pub fn vreg32(&mut self, name: &str) -> NodeId {
        self.vreg(name, NodeKind::Vreg32)
    }

    pub fn vreg64(&mut self, name: &str) -> NodeId {
        self.vreg(name, NodeKind::Vreg64)
    }

    /// A 64-bit view of an existing vreg: same id, wider node.
    pub fn vreg64_cast(&mut self, other: NodeId) -> NodeId {
        let name = self.node(other).ident.clone().unwrap_or_default();
        let id = self.node(other).id;
        let n = self.literal(&name, NodeKind::Vreg64);
        self.node_mut(n).id = id;
        n
    }

    /// Allocation marker: the named vreg is live from here.
    pub fn request_marker(&mut self, vreg: NodeId) -> NodeId {
        self.unary_instr("vreg", vreg, NodeKind::ReqVreg)
    }

    /// Deallocation marker: the named vreg dies here.
    pub fn clear_marker(&mut self, vreg: NodeId) -> NodeId {
        self.unary_instr("clear", vreg, NodeKind::ClearVreg)
    }

    /// Wrap a constant so the register allocator decides whether to
    /// materialize it inline, in a register, or from a spill location.
    pub fn const_load(&mut self, c: NodeId) -> NodeId {
        self.unary_sub("constLoad", c, NodeKind::ConstLoad)
    }

    pub fn open_loop(&mut self, loop_id: u32) -> NodeId {
        let n = self.literal(&format!("openLoop{loop_id}\n"), NodeKind::OpenLoop);
        self.node_mut(n).id = loop_id;
        n
    }

    pub fn close_loop(&mut self, loop_id: u32) -> NodeId {
        let n = self.literal(&format!("closeLoop{loop_id}\n"), NodeKind::CloseLoop);
        self.node_mut(n).id = loop_id;
        n
    }

    /// A managed call: children are `(ret_val, func_addr, args...)`. The
    /// translation pipeline rewrites it into ABI-legal parameter moves, a
    /// real call, and a retval move.
    pub fn mcall(&mut self, ret_val: NodeId, func: u64, args: &[NodeId]) -> NodeId {
        let n = self.blank(NodeKind::ManagedCall, EmitShape::ManagedCall);
        self.add_child(n, ret_val);
        let addr = self.const_address(func);
        self.add_child(n, addr);
        for &arg in args {
            self.add_child(n, arg);
        }
        n
    }

    pub fn msyscall(&mut self, args: &[NodeId]) -> NodeId {
        let n = self.blank(NodeKind::ManagedSyscall, EmitShape::ManagedSyscall);
        for &arg in args {
            self.add_child(n, arg);
        }
        n
    }

    pub fn num_memory_operands(&self, instr: NodeId) -> usize {
        self.children(instr)
            .filter(|&c| self.node(c).kind == NodeKind::MemAt)
            .count()
    }
}

/// Whether `instr` reads its `p`-th operand. This table drives register
/// allocation lifetimes and optimizer decisions.
pub fn instr_reads(arena: &IrArena, instr: NodeId, p: usize) -> bool {
    match arena.node(instr).kind {
        NodeKind::ManagedCall => p >= 2,
        NodeKind::ConstLoad => p == 0,
        NodeKind::Mov | NodeKind::Movzx | NodeKind::Movsx | NodeKind::Movsxd => p == 1,
        NodeKind::Cmp
        | NodeKind::Add
        | NodeKind::Sub
        | NodeKind::Imul
        | NodeKind::And
        | NodeKind::Or
        | NodeKind::Crc32
        | NodeKind::MemAdd
        | NodeKind::MemSub => p == 0 || p == 1,
        NodeKind::Div | NodeKind::Idiv | NodeKind::Inc | NodeKind::MemAt => p == 0,
        _ => false,
    }
}

/// Whether `instr` writes its `p`-th operand.
pub fn instr_writes(arena: &IrArena, instr: NodeId, p: usize) -> bool {
    match arena.node(instr).kind {
        NodeKind::ManagedCall => p == 0,
        NodeKind::Mov
        | NodeKind::Movzx
        | NodeKind::Movsx
        | NodeKind::Movsxd
        | NodeKind::Add
        | NodeKind::Sub
        | NodeKind::Imul
        | NodeKind::Inc
        | NodeKind::And
        | NodeKind::Or
        | NodeKind::Crc32 => p == 0,
        _ => false,
    }
}

/// Whether the operand `child` of `instr` may stay a memory operand, or has
/// to be accessed through a temporary register instead.
pub fn can_use_memory_operand(arena: &IrArena, instr: NodeId, _child: NodeId) -> bool {
    // Managed-call operands can always be memory accesses; the call
    // convention translation handles the necessary moves.
    if is_managed_call(arena.node(instr).kind) {
        return true;
    }
    match arena.node(instr).kind {
        NodeKind::Mov => {
            // A constant store needs a temporary register because the
            // register size defines the move size.
            if let Some(last) = arena.node(instr).last_child {
                if arena.is_const(last) {
                    return false;
                }
            }
            // only one mov operand can be a memory location
            arena.num_memory_operands(instr) == 0
        }
        _ => false,
    }
}
