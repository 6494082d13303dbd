//! x86-64 vocabulary: registers, constants, instructions.

use crate::arena::{EmitShape, IrArena, NodeId, NodeKind, Payload};

/// General-purpose machine register numbers (x86-64 encoding order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mreg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

pub(crate) const REG_NAMES_64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

pub(crate) const REG_NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

pub(crate) const REG_NAMES_8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

const YMM_NAMES: [&str; 16] = [
    "ymm0", "ymm1", "ymm2", "ymm3", "ymm4", "ymm5", "ymm6", "ymm7", "ymm8", "ymm9", "ymm10",
    "ymm11", "ymm12", "ymm13", "ymm14", "ymm15",
];

const ZMM_NAMES: [&str; 16] = [
    "zmm0", "zmm1", "zmm2", "zmm3", "zmm4", "zmm5", "zmm6", "zmm7", "zmm8", "zmm9", "zmm10",
    "zmm11", "zmm12", "zmm13", "zmm14", "zmm15",
];

pub fn is_reg_kind(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Reg8 | NodeKind::Reg32 | NodeKind::Reg64)
}

pub fn is_const_kind(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::ConstAddress
            | NodeKind::ConstInt8
            | NodeKind::ConstInt32
            | NodeKind::ConstInt64
            | NodeKind::ConstDouble
    )
}

impl IrArena {
    pub fn is_reg(&self, node: NodeId) -> bool {
        is_reg_kind(self.node(node).kind)
    }

    pub fn is_const(&self, node: NodeId) -> bool {
        is_const_kind(self.node(node).kind)
    }

    pub fn reg_byte_size(&self, node: NodeId) -> usize {
        match self.node(node).kind {
            NodeKind::Reg8 => 1,
            NodeKind::Reg32 => 4,
            NodeKind::Reg64 => 8,
            _ => 0,
        }
    }

    pub fn const_byte_size(&self, node: NodeId) -> usize {
        match self.node(node).kind {
            NodeKind::ConstInt8 => 1,
            NodeKind::ConstInt32 => 4,
            NodeKind::ConstAddress | NodeKind::ConstDouble | NodeKind::ConstInt64 => 8,
            _ => 0,
        }
    }

    pub fn reg64(&mut self, id: u8) -> NodeId {
        let n = self.literal(REG_NAMES_64[id as usize], NodeKind::Reg64);
        self.node_mut(n).id = u32::from(id);
        n
    }

    pub fn reg32(&mut self, id: u8) -> NodeId {
        let n = self.literal(REG_NAMES_32[id as usize], NodeKind::Reg32);
        self.node_mut(n).id = u32::from(id);
        n
    }

    pub fn reg8(&mut self, id: u8) -> NodeId {
        let n = self.literal(REG_NAMES_8[id as usize], NodeKind::Reg8);
        self.node_mut(n).id = u32::from(id);
        n
    }

    pub fn mreg64(&mut self, reg: Mreg) -> NodeId {
        self.reg64(reg as u8)
    }

    pub fn xmm(&mut self, id: u8) -> NodeId {
        let n = self.literal(XMM_NAMES[id as usize], NodeKind::Xmm);
        self.node_mut(n).id = u32::from(id);
        n
    }

    pub fn ymm(&mut self, id: u8) -> NodeId {
        let n = self.literal(YMM_NAMES[id as usize], NodeKind::Ymm);
        self.node_mut(n).id = u32::from(id);
        n
    }

    pub fn zmm(&mut self, id: u8) -> NodeId {
        let n = self.literal(ZMM_NAMES[id as usize], NodeKind::Zmm);
        self.node_mut(n).id = u32::from(id);
        n
    }

    /// A label with a query-unique numeric suffix.
    pub fn id_label(&mut self, ident: &str) -> NodeId {
        let text = format!("{}{}", ident, self.label_count);
        self.label_count += 1;
        self.literal(&text, NodeKind::IdLabel)
    }

    pub fn label(&mut self, ident: &str) -> NodeId {
        self.literal(ident, NodeKind::Label)
    }

    pub fn bits64(&mut self) -> NodeId {
        self.literal("bits 64\n", NodeKind::Undefined)
    }

    pub fn const_address(&mut self, val: u64) -> NodeId {
        let n = self.blank(NodeKind::ConstAddress, EmitShape::ConstAddr);
        self.node_mut(n).payload = Payload::Addr(val);
        n
    }

    pub fn const_i8(&mut self, val: i8) -> NodeId {
        let n = self.blank(NodeKind::ConstInt8, EmitShape::ConstI8);
        self.node_mut(n).payload = Payload::I8(val);
        n
    }

    pub fn const_i32(&mut self, val: i32) -> NodeId {
        let n = self.blank(NodeKind::ConstInt32, EmitShape::ConstI32);
        self.node_mut(n).payload = Payload::I32(val);
        n
    }

    pub fn const_i64(&mut self, val: i64) -> NodeId {
        let n = self.blank(NodeKind::ConstInt64, EmitShape::ConstI64);
        self.node_mut(n).payload = Payload::I64(val);
        n
    }

    pub fn const_f64(&mut self, val: f64) -> NodeId {
        let n = self.blank(NodeKind::ConstDouble, EmitShape::ConstF64);
        self.node_mut(n).payload = Payload::F64(val);
        n
    }

    pub fn syscall_instr(&mut self) -> NodeId {
        self.literal("syscall\n", NodeKind::Syscall)
    }

    pub fn ret(&mut self) -> NodeId {
        self.literal("ret\n", NodeKind::Ret)
    }

    pub fn cdqe(&mut self) -> NodeId {
        self.literal("cdqe\n", NodeKind::Cdqe)
    }

    pub fn cqo(&mut self) -> NodeId {
        self.literal("cqo\n", NodeKind::Cqo)
    }

    pub fn comment_line(&mut self, msg: &str) -> NodeId {
        let text = format!(";{msg}\n");
        self.literal(&text, NodeKind::CommentLine)
    }

    pub fn push_instr(&mut self, reg: NodeId) -> NodeId {
        self.unary_instr("push", reg, NodeKind::Push)
    }

    pub fn pop_instr(&mut self, reg: NodeId) -> NodeId {
        self.unary_instr("pop", reg, NodeKind::Pop)
    }

    pub fn call(&mut self, func: NodeId) -> NodeId {
        self.unary_instr("call", func, NodeKind::Call)
    }

    pub fn inc(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("inc", op1, NodeKind::Inc)
    }

    pub fn dec(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("dec", op1, NodeKind::Dec)
    }

    pub fn je(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("je", op1, NodeKind::Je)
    }

    pub fn jl(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jl", op1, NodeKind::Jl)
    }

    pub fn jg(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jg", op1, NodeKind::Jg)
    }

    pub fn jge(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jge", op1, NodeKind::Jge)
    }

    pub fn jle(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jle", op1, NodeKind::Jle)
    }

    pub fn jne(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jne", op1, NodeKind::Jne)
    }

    pub fn jmp(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("jmp", op1, NodeKind::Jmp)
    }

    pub fn mov(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("mov", op1, op2, NodeKind::Mov)
    }

    pub fn movzx(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("movzx", op1, op2, NodeKind::Movzx)
    }

    pub fn movsx(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("movsx", op1, op2, NodeKind::Movsx)
    }

    pub fn movsxd(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("movsxd", op1, op2, NodeKind::Movsxd)
    }

    pub fn lea(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("lea", op1, op2, NodeKind::Lea)
    }

    pub fn cmp(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("cmp", op1, op2, NodeKind::Cmp)
    }

    pub fn add(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("add", op1, op2, NodeKind::Add)
    }

    pub fn sub(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("sub", op1, op2, NodeKind::Sub)
    }

    pub fn imul(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("imul", op1, op2, NodeKind::Imul)
    }

    pub fn idiv(&mut self, op1: NodeId) -> NodeId {
        self.unary_instr("idiv", op1, NodeKind::Idiv)
    }

    pub fn xor(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("xor", op1, op2, NodeKind::Xor)
    }

    pub fn and(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("and", op1, op2, NodeKind::And)
    }

    pub fn or(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("or", op1, op2, NodeKind::Or)
    }

    pub fn crc32(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("crc32", op1, op2, NodeKind::Crc32)
    }

    pub fn mem_at(&mut self, child: NodeId) -> NodeId {
        self.bracketing("[", "]", child, NodeKind::MemAt)
    }

    pub fn byte_at(&mut self, child: NodeId) -> NodeId {
        self.bracketing("byte[", "]", child, NodeKind::MemAt)
    }

    pub fn mem_add(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        let n = self.blank(NodeKind::MemAdd, EmitShape::MemAdd);
        self.add_child(n, op1);
        self.add_child(n, op2);
        n
    }

    pub fn mem_sub(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        let n = self.blank(NodeKind::MemSub, EmitShape::MemSub);
        self.add_child(n, op1);
        self.add_child(n, op2);
        n
    }

    pub fn mem_at_add(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        let sum = self.mem_add(op1, op2);
        self.mem_at(sum)
    }

    pub fn mem_at_sub(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        let diff = self.mem_sub(op1, op2);
        self.mem_at(diff)
    }

    /// Bind a label at the current position.
    pub fn place_label(&mut self, label: NodeId) -> NodeId {
        let name = self
            .node(label)
            .ident
            .clone()
            .expect("label without a name");
        let n = self.literal(&format!("{name}:\n"), NodeKind::PlaceLabel);
        self.node_mut(n).ident2 = Some(name);
        n
    }

    pub fn section(&mut self, name: &str) -> NodeId {
        let text = format!("section {name}\n");
        self.literal(&text, NodeKind::Section)
    }

    /// Move with sign extension when the destination register is wider than
    /// the source.
    pub fn scale_mov_sx(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        if self.is_reg(op1) && self.is_reg(op2) && self.reg_byte_size(op1) > self.reg_byte_size(op2)
        {
            self.movsx(op1, op2)
        } else {
            self.mov(op1, op2)
        }
    }

    pub fn movdqu(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("movdqu", op1, op2, NodeKind::Movdqu)
    }

    pub fn vmovdqu(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("vmovdqu", op1, op2, NodeKind::Vmovdqu)
    }

    pub fn vmovdqu32(&mut self, op1: NodeId, op2: NodeId) -> NodeId {
        self.binary_instr("vmovdqu32", op1, op2, NodeKind::Vmovdqu32)
    }

    pub fn vextractf128(&mut self, op1: NodeId, op2: NodeId, op3: NodeId) -> NodeId {
        // xmm, ymm, imm8
        self.ternary_instr("vextractf128", op1, op2, op3, NodeKind::Vextractf128)
    }

    pub fn vextracti64x2(&mut self, op1: NodeId, op2: NodeId, op3: NodeId) -> NodeId {
        // xmm, zmm, imm8
        self.ternary_instr("vextracti64x2", op1, op2, op3, NodeKind::Vextracti64x2)
    }

    pub fn vpextrq(&mut self, op1: NodeId, op2: NodeId, op3: NodeId) -> NodeId {
        // r64, xmm, imm8
        self.ternary_instr("vpextrq", op1, op2, op3, NodeKind::Vpextrq)
    }

    pub fn pextrq(&mut self, op1: NodeId, op2: NodeId, op3: NodeId) -> NodeId {
        // r64, xmm, imm8
        self.ternary_instr("pextrq", op1, op2, op3, NodeKind::Pextrq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_follow_encoding_order() {
        let mut a = IrArena::new();
        let rax = a.mreg64(Mreg::Rax);
        assert_eq!(a.node(rax).ident.as_deref(), Some("rax"));
        assert_eq!(a.node(rax).id, 0);
        let r15 = a.reg8(15);
        assert_eq!(a.node(r15).ident.as_deref(), Some("r15b"));
    }

    #[test]
    fn id_labels_are_unique() {
        let mut a = IrArena::new();
        let l1 = a.id_label("next");
        let l2 = a.id_label("next");
        assert_eq!(a.node(l1).ident.as_deref(), Some("next0"));
        assert_eq!(a.node(l2).ident.as_deref(), Some("next1"));
    }

    #[test]
    fn memory_operand_renders_with_offset() {
        let mut a = IrArena::new();
        let base = a.mreg64(Mreg::Rsp);
        let off = a.const_i32(16);
        let mem = a.mem_at_sub(base, off);
        assert_eq!(a.emit(mem), "[rsp-16]");
    }

    #[test]
    fn scale_mov_extends_narrow_sources() {
        let mut a = IrArena::new();
        let wide = a.reg64(7);
        let narrow = a.reg32(6);
        let m = a.scale_mov_sx(wide, narrow);
        assert_eq!(a.node(m).kind, NodeKind::Movsx);
        let wide2 = a.reg64(6);
        let m = a.scale_mov_sx(wide, wide2);
        assert_eq!(a.node(m).kind, NodeKind::Mov);
    }
}
