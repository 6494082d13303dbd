//! Direct x86-64 binary emission for the translated instruction stream.
//!
//! Covers exactly the scalar subset the translation pipeline produces:
//! mov/movzx/movsx/movsxd, lea, the arithmetic/logic/compare group,
//! inc/dec, push/pop, jumps, call/ret, cdqe/cqo, idiv/div, syscall. Labels
//! resolve through rel32 fixups in a second pass.

use std::collections::HashMap;

use flounder_error::{FlounderError, Result};

use crate::arena::{IrArena, NodeId, NodeKind, Payload};

const REX_W: u8 = 0x48;

/// A decoded instruction operand.
#[derive(Debug, Clone)]
enum Op {
    Reg { size: u8, id: u8 },
    Mem { base: u8, disp: i32 },
    Imm { val: i64, size: u8 },
    Label(String),
}

/// Binary emitter with label fixups.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
    instructions: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the whole tree. Returns the code bytes and the instruction
    /// count.
    pub fn assemble(mut self, arena: &IrArena, root: NodeId) -> Result<(Vec<u8>, usize)> {
        let mut line = arena.node(root).first_child;
        while let Some(l) = line {
            self.encode_line(arena, l)?;
            line = arena.node(l).next;
        }
        // resolve label fixups
        for (pos, name) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&name)
                .ok_or_else(|| FlounderError::codegen(format!("undefined label {name}")))?;
            let rel = target as i64 - (pos as i64 + 4);
            let rel = i32::try_from(rel)
                .map_err(|_| FlounderError::codegen("jump distance exceeds rel32"))?;
            self.buf[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok((self.buf, self.instructions))
    }

    fn operand(&self, arena: &IrArena, node: NodeId) -> Result<Op> {
        let n = arena.node(node);
        match n.kind {
            NodeKind::Reg8 => Ok(Op::Reg { size: 1, id: n.id as u8 }),
            NodeKind::Reg32 => Ok(Op::Reg { size: 4, id: n.id as u8 }),
            NodeKind::Reg64 => Ok(Op::Reg { size: 8, id: n.id as u8 }),
            NodeKind::ConstInt8 => match n.payload {
                Payload::I8(v) => Ok(Op::Imm { val: i64::from(v), size: 1 }),
                _ => Err(FlounderError::codegen("int8 constant without payload")),
            },
            NodeKind::ConstInt32 => match n.payload {
                Payload::I32(v) => Ok(Op::Imm { val: i64::from(v), size: 4 }),
                _ => Err(FlounderError::codegen("int32 constant without payload")),
            },
            NodeKind::ConstInt64 => match n.payload {
                Payload::I64(v) => Ok(Op::Imm { val: v, size: 8 }),
                _ => Err(FlounderError::codegen("int64 constant without payload")),
            },
            NodeKind::ConstDouble => match n.payload {
                Payload::F64(v) => Ok(Op::Imm { val: v.to_bits() as i64, size: 8 }),
                _ => Err(FlounderError::codegen("double constant without payload")),
            },
            NodeKind::ConstAddress => match n.payload {
                Payload::Addr(v) => Ok(Op::Imm { val: v as i64, size: 8 }),
                _ => Err(FlounderError::codegen("address constant without payload")),
            },
            NodeKind::MemAt => self.memory_operand(arena, node),
            NodeKind::Label | NodeKind::IdLabel => Ok(Op::Label(
                n.ident.as_deref().unwrap_or_default().to_owned(),
            )),
            other => Err(FlounderError::codegen(format!(
                "unsupported operand {other:?}"
            ))),
        }
    }

    fn memory_operand(&self, arena: &IrArena, node: NodeId) -> Result<Op> {
        let child = arena
            .node(node)
            .first_child
            .ok_or_else(|| FlounderError::codegen("empty memory operand"))?;
        let c = arena.node(child);
        match c.kind {
            NodeKind::Reg64 => Ok(Op::Mem { base: c.id as u8, disp: 0 }),
            NodeKind::MemAdd | NodeKind::MemSub => {
                let base = c
                    .first_child
                    .ok_or_else(|| FlounderError::codegen("memory base missing"))?;
                let offs = c
                    .last_child
                    .ok_or_else(|| FlounderError::codegen("memory offset missing"))?;
                if arena.node(base).kind != NodeKind::Reg64 {
                    return Err(FlounderError::codegen("memory base is not a register"));
                }
                let value = match arena.node(offs).payload {
                    Payload::I32(v) => i64::from(v),
                    Payload::I64(v) => v,
                    Payload::I8(v) => i64::from(v),
                    _ => return Err(FlounderError::codegen("memory offset is not a constant")),
                };
                let value = if c.kind == NodeKind::MemSub { -value } else { value };
                let disp = i32::try_from(value)
                    .map_err(|_| FlounderError::codegen("memory displacement exceeds 32 bits"))?;
                Ok(Op::Mem { base: arena.node(base).id as u8, disp })
            }
            other => Err(FlounderError::codegen(format!(
                "unsupported memory operand {other:?}"
            ))),
        }
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn imm32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn imm64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an optional REX prefix. `wide` sets REX.W, `reg`/`index`/`base`
    /// contribute REX.R/X/B; `byte_reg` forces a prefix for spl/bpl/sil/dil.
    fn rex(&mut self, wide: bool, reg: u8, base: u8, byte_regs: &[u8]) {
        let mut rex = 0x40u8;
        if wide {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if base >= 8 {
            rex |= 0x01;
        }
        let force = byte_regs.iter().any(|&r| (4..=7).contains(&r));
        if rex != 0x40 || force {
            self.byte(rex);
        }
    }

    /// ModRM (+ SIB + displacement) for a register or memory r/m operand.
    fn modrm(&mut self, reg: u8, rm: &Op) {
        match rm {
            Op::Reg { id, .. } => {
                self.byte(0xC0 | ((reg & 7) << 3) | (id & 7));
            }
            Op::Mem { base, disp } => {
                let base_low = base & 7;
                let needs_sib = base_low == 4; // rsp / r12
                let (mode, disp_bytes): (u8, i64) = if *disp == 0 && base_low != 5 {
                    (0x00, 0)
                } else if i8::try_from(*disp).is_ok() {
                    (0x40, 1)
                } else {
                    (0x80, 4)
                };
                self.byte(mode | ((reg & 7) << 3) | if needs_sib { 4 } else { base_low });
                if needs_sib {
                    // scale 1, no index
                    self.byte(0x24 | (0 << 6));
                }
                match disp_bytes {
                    1 => self.byte(*disp as i8 as u8),
                    4 => self.imm32(*disp),
                    _ => {}
                }
            }
            _ => unreachable!("modrm on non-r/m operand"),
        }
    }

    fn rm_base(op: &Op) -> u8 {
        match op {
            Op::Reg { id, .. } => *id,
            Op::Mem { base, .. } => *base,
            _ => 0,
        }
    }

    fn encode_line(&mut self, arena: &IrArena, line: NodeId) -> Result<()> {
        let kind = arena.node(line).kind;
        match kind {
            // non-code lines
            NodeKind::Undefined
            | NodeKind::Root
            | NodeKind::CommentLine
            | NodeKind::Section => Ok(()),
            NodeKind::PlaceLabel => {
                let name = arena
                    .node(line)
                    .ident2
                    .as_deref()
                    .unwrap_or_default()
                    .to_owned();
                self.labels.insert(name, self.buf.len());
                Ok(())
            }
            NodeKind::Ret => {
                self.instructions += 1;
                self.byte(0xC3);
                Ok(())
            }
            NodeKind::Syscall => {
                self.instructions += 1;
                self.byte(0x0F);
                self.byte(0x05);
                Ok(())
            }
            NodeKind::Cdqe => {
                self.instructions += 1;
                self.byte(REX_W);
                self.byte(0x98);
                Ok(())
            }
            NodeKind::Cqo => {
                self.instructions += 1;
                self.byte(REX_W);
                self.byte(0x99);
                Ok(())
            }
            NodeKind::Push | NodeKind::Pop => {
                self.instructions += 1;
                let op = self.first_operand(arena, line)?;
                let Op::Reg { id, .. } = op else {
                    return Err(FlounderError::codegen("push/pop needs a register"));
                };
                if id >= 8 {
                    self.byte(0x41);
                }
                let base = if kind == NodeKind::Push { 0x50 } else { 0x58 };
                self.byte(base + (id & 7));
                Ok(())
            }
            NodeKind::Call => {
                self.instructions += 1;
                let op = self.first_operand(arena, line)?;
                let Op::Reg { id, .. } = op else {
                    return Err(FlounderError::codegen("call needs a register"));
                };
                if id >= 8 {
                    self.byte(0x41);
                }
                self.byte(0xFF);
                self.byte(0xC0 | (2 << 3) | (id & 7));
                Ok(())
            }
            NodeKind::Jmp => self.encode_jump(arena, line, None),
            NodeKind::Je => self.encode_jump(arena, line, Some(0x84)),
            NodeKind::Jne => self.encode_jump(arena, line, Some(0x85)),
            NodeKind::Jl => self.encode_jump(arena, line, Some(0x8C)),
            NodeKind::Jge => self.encode_jump(arena, line, Some(0x8D)),
            NodeKind::Jle => self.encode_jump(arena, line, Some(0x8E)),
            NodeKind::Jg => self.encode_jump(arena, line, Some(0x8F)),
            NodeKind::Inc => self.encode_inc_dec(arena, line, 0),
            NodeKind::Dec => self.encode_inc_dec(arena, line, 1),
            NodeKind::Idiv => self.encode_div(arena, line, 7),
            NodeKind::Div => self.encode_div(arena, line, 6),
            NodeKind::Mov => self.encode_mov(arena, line),
            NodeKind::Movzx => self.encode_movx(arena, line, 0xB6),
            NodeKind::Movsx => self.encode_movx(arena, line, 0xBE),
            NodeKind::Movsxd => self.encode_movsxd(arena, line),
            NodeKind::Lea => self.encode_lea(arena, line),
            NodeKind::Add => self.encode_group(arena, line, 0x00, 0),
            NodeKind::Or => self.encode_group(arena, line, 0x08, 1),
            NodeKind::And => self.encode_group(arena, line, 0x20, 4),
            NodeKind::Sub => self.encode_group(arena, line, 0x28, 5),
            NodeKind::Xor => self.encode_group(arena, line, 0x30, 6),
            NodeKind::Cmp => self.encode_group(arena, line, 0x38, 7),
            NodeKind::Imul => self.encode_imul(arena, line),
            other => Err(FlounderError::codegen(format!(
                "direct emission not supported for {other:?}"
            ))),
        }
    }

    fn first_operand(&self, arena: &IrArena, line: NodeId) -> Result<Op> {
        let child = arena
            .node(line)
            .first_child
            .ok_or_else(|| FlounderError::codegen("instruction without operand"))?;
        self.operand(arena, child)
    }

    fn two_operands(&self, arena: &IrArena, line: NodeId) -> Result<(Op, Op)> {
        let first = arena
            .node(line)
            .first_child
            .ok_or_else(|| FlounderError::codegen("instruction without operands"))?;
        let second = arena
            .node(first)
            .next
            .ok_or_else(|| FlounderError::codegen("instruction without second operand"))?;
        Ok((self.operand(arena, first)?, self.operand(arena, second)?))
    }

    fn encode_jump(&mut self, arena: &IrArena, line: NodeId, cc: Option<u8>) -> Result<()> {
        self.instructions += 1;
        let op = self.first_operand(arena, line)?;
        let Op::Label(name) = op else {
            return Err(FlounderError::codegen("jump without label"));
        };
        match cc {
            None => self.byte(0xE9),
            Some(cc) => {
                self.byte(0x0F);
                self.byte(cc);
            }
        }
        self.fixups.push((self.buf.len(), name));
        self.imm32(0);
        Ok(())
    }

    fn encode_inc_dec(&mut self, arena: &IrArena, line: NodeId, digit: u8) -> Result<()> {
        self.instructions += 1;
        let op = self.first_operand(arena, line)?;
        let Op::Reg { size, id } = op else {
            return Err(FlounderError::codegen("inc/dec needs a register"));
        };
        self.rex(size == 8, 0, id, &if size == 1 { vec![id] } else { vec![] });
        self.byte(if size == 1 { 0xFE } else { 0xFF });
        self.byte(0xC0 | (digit << 3) | (id & 7));
        Ok(())
    }

    fn encode_div(&mut self, arena: &IrArena, line: NodeId, digit: u8) -> Result<()> {
        self.instructions += 1;
        let op = self.first_operand(arena, line)?;
        let Op::Reg { size, id } = op else {
            return Err(FlounderError::codegen("idiv needs a register"));
        };
        self.rex(size == 8, 0, id, &[]);
        self.byte(0xF7);
        self.byte(0xC0 | (digit << 3) | (id & 7));
        Ok(())
    }

    fn encode_mov(&mut self, arena: &IrArena, line: NodeId) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        match (&dst, &src) {
            (Op::Reg { size, id }, Op::Imm { val, size: imm_size }) => {
                match *size {
                    1 => {
                        self.rex(false, 0, *id, &[*id]);
                        self.byte(0xB0 + (id & 7));
                        self.byte(*val as u8);
                    }
                    4 => {
                        self.rex(false, 0, *id, &[]);
                        self.byte(0xC7);
                        self.byte(0xC0 | (id & 7));
                        self.imm32(*val as i32);
                    }
                    _ => {
                        // 64-bit: sign-extended imm32 when it fits, movabs
                        // otherwise
                        if *imm_size <= 4 || i32::try_from(*val).is_ok() {
                            self.rex(true, 0, *id, &[]);
                            self.byte(0xC7);
                            self.byte(0xC0 | (id & 7));
                            self.imm32(*val as i32);
                        } else {
                            self.rex(true, 0, *id, &[]);
                            self.byte(0xB8 + (id & 7));
                            self.imm64(*val);
                        }
                    }
                }
                Ok(())
            }
            (Op::Reg { size, id }, Op::Reg { size: ssize, id: sid }) => {
                if size != ssize {
                    return Err(FlounderError::codegen("mov between register widths"));
                }
                self.rex(*size == 8, *sid, *id, &if *size == 1 { vec![*id, *sid] } else { vec![] });
                self.byte(if *size == 1 { 0x88 } else { 0x89 });
                self.modrm(*sid, &dst);
                Ok(())
            }
            (Op::Reg { size, id }, Op::Mem { .. }) => {
                self.rex(*size == 8, *id, Self::rm_base(&src), &if *size == 1 { vec![*id] } else { vec![] });
                self.byte(if *size == 1 { 0x8A } else { 0x8B });
                self.modrm(*id, &src);
                Ok(())
            }
            (Op::Mem { .. }, Op::Reg { size, id }) => {
                self.rex(*size == 8, *id, Self::rm_base(&dst), &if *size == 1 { vec![*id] } else { vec![] });
                self.byte(if *size == 1 { 0x88 } else { 0x89 });
                self.modrm(*id, &dst);
                Ok(())
            }
            _ => Err(FlounderError::codegen("unsupported mov operand pair")),
        }
    }

    fn encode_movx(&mut self, arena: &IrArena, line: NodeId, opcode: u8) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        let Op::Reg { size: dsize, id: did } = dst else {
            return Err(FlounderError::codegen("movzx/movsx destination"));
        };
        // a 32-bit source means sign extension to 64 bits: movsxd
        if let Op::Reg { size: 4, .. } = src {
            return self.movsxd_ops(&dst, &src);
        }
        let byte_srcs = match &src {
            Op::Reg { id, .. } => vec![*id],
            _ => vec![],
        };
        self.rex(dsize == 8, did, Self::rm_base(&src), &byte_srcs);
        self.byte(0x0F);
        self.byte(opcode);
        self.modrm(did, &src);
        Ok(())
    }

    fn movsxd_ops(&mut self, dst: &Op, src: &Op) -> Result<()> {
        let Op::Reg { id: did, .. } = dst else {
            return Err(FlounderError::codegen("movsxd destination"));
        };
        self.rex(true, *did, Self::rm_base(src), &[]);
        self.byte(0x63);
        self.modrm(*did, src);
        Ok(())
    }

    fn encode_movsxd(&mut self, arena: &IrArena, line: NodeId) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        self.movsxd_ops(&dst, &src)
    }

    fn encode_lea(&mut self, arena: &IrArena, line: NodeId) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        let Op::Reg { id, .. } = dst else {
            return Err(FlounderError::codegen("lea destination"));
        };
        if !matches!(src, Op::Mem { .. }) {
            return Err(FlounderError::codegen("lea source must be memory"));
        }
        self.rex(true, id, Self::rm_base(&src), &[]);
        self.byte(0x8D);
        self.modrm(id, &src);
        Ok(())
    }

    /// add/or/and/sub/xor/cmp share their encoding scheme.
    fn encode_group(&mut self, arena: &IrArena, line: NodeId, base: u8, digit: u8) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        match (&dst, &src) {
            (Op::Reg { size, id }, Op::Imm { val, .. }) => {
                if *size == 1 {
                    self.rex(false, 0, *id, &[*id]);
                    self.byte(0x80);
                    self.byte(0xC0 | (digit << 3) | (id & 7));
                    self.byte(*val as u8);
                } else {
                    let val32 = i32::try_from(*val).map_err(|_| {
                        FlounderError::codegen("arithmetic immediate exceeds 32 bits")
                    })?;
                    self.rex(*size == 8, 0, *id, &[]);
                    self.byte(0x81);
                    self.byte(0xC0 | (digit << 3) | (id & 7));
                    self.imm32(val32);
                }
                Ok(())
            }
            (Op::Reg { size, id }, Op::Reg { size: ssize, id: sid }) => {
                if size != ssize {
                    return Err(FlounderError::codegen("operand width mismatch"));
                }
                self.rex(*size == 8, *sid, *id, &if *size == 1 { vec![*id, *sid] } else { vec![] });
                self.byte(if *size == 1 { base } else { base + 1 });
                self.modrm(*sid, &dst);
                Ok(())
            }
            (Op::Reg { size, id }, Op::Mem { .. }) => {
                self.rex(*size == 8, *id, Self::rm_base(&src), &if *size == 1 { vec![*id] } else { vec![] });
                self.byte(if *size == 1 { base + 2 } else { base + 3 });
                self.modrm(*id, &src);
                Ok(())
            }
            (Op::Mem { .. }, Op::Reg { size, id }) => {
                self.rex(*size == 8, *id, Self::rm_base(&dst), &if *size == 1 { vec![*id] } else { vec![] });
                self.byte(if *size == 1 { base } else { base + 1 });
                self.modrm(*id, &dst);
                Ok(())
            }
            _ => Err(FlounderError::codegen("unsupported arithmetic operands")),
        }
    }

    fn encode_imul(&mut self, arena: &IrArena, line: NodeId) -> Result<()> {
        self.instructions += 1;
        let (dst, src) = self.two_operands(arena, line)?;
        let Op::Reg { size, id } = dst else {
            return Err(FlounderError::codegen("imul destination"));
        };
        match &src {
            Op::Imm { val, .. } => {
                let val32 = i32::try_from(*val)
                    .map_err(|_| FlounderError::codegen("imul immediate exceeds 32 bits"))?;
                // imul r, r, imm32 with identical source and destination
                self.rex(size == 8, id, id, &[]);
                self.byte(0x69);
                self.byte(0xC0 | ((id & 7) << 3) | (id & 7));
                self.imm32(val32);
            }
            Op::Reg { .. } | Op::Mem { .. } => {
                self.rex(size == 8, id, Self::rm_base(&src), &[]);
                self.byte(0x0F);
                self.byte(0xAF);
                self.modrm(id, &src);
            }
            _ => return Err(FlounderError::codegen("unsupported imul source")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Mreg;

    fn assemble_lines(build: impl FnOnce(&mut IrArena, NodeId)) -> Vec<u8> {
        let mut a = IrArena::new();
        let root = a.root();
        build(&mut a, root);
        Assembler::new().assemble(&a, root).unwrap().0
    }

    #[test]
    fn ret_is_c3() {
        let code = assemble_lines(|a, root| {
            let r = a.ret();
            a.add_child(root, r);
        });
        assert_eq!(code, vec![0xC3]);
    }

    #[test]
    fn push_pop_rbp() {
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::Rbp);
            let p = a.push_instr(r);
            a.add_child(root, p);
            let r = a.mreg64(Mreg::Rbp);
            let p = a.pop_instr(r);
            a.add_child(root, p);
        });
        assert_eq!(code, vec![0x55, 0x5D]);
    }

    #[test]
    fn push_r12_needs_rex() {
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::R12);
            let p = a.push_instr(r);
            a.add_child(root, p);
        });
        assert_eq!(code, vec![0x41, 0x54]);
    }

    #[test]
    fn mov_reg_imm32() {
        // mov rbx, 7 -> 48 C7 C3 07 00 00 00
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::Rbx);
            let c = a.const_i64(7);
            let m = a.mov(r, c);
            a.add_child(root, m);
        });
        assert_eq!(code, vec![0x48, 0xC7, 0xC3, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn mov_reg_imm64_uses_movabs() {
        // mov rsi, 0x1122334455667788
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::Rsi);
            let c = a.const_i64(0x1122334455667788);
            let m = a.mov(r, c);
            a.add_child(root, m);
        });
        assert_eq!(
            code,
            vec![0x48, 0xBE, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn mov_reg_reg() {
        // mov rdi, rsi -> 48 89 F7
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rdi);
            let s = a.mreg64(Mreg::Rsi);
            let m = a.mov(d, s);
            a.add_child(root, m);
        });
        assert_eq!(code, vec![0x48, 0x89, 0xF7]);
    }

    #[test]
    fn mov_load_with_displacement() {
        // mov rax, [rbx+16] -> 48 8B 43 10
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rax);
            let b = a.mreg64(Mreg::Rbx);
            let off = a.const_i64(16);
            let mem = a.mem_at_add(b, off);
            let m = a.mov(d, mem);
            a.add_child(root, m);
        });
        assert_eq!(code, vec![0x48, 0x8B, 0x43, 0x10]);
    }

    #[test]
    fn mov_store_through_rsp_uses_sib() {
        // mov [rsp-8], rsi -> 48 89 74 24 F8
        let code = assemble_lines(|a, root| {
            let base = a.mreg64(Mreg::Rsp);
            let off = a.const_i32(8);
            let mem = a.mem_at_sub(base, off);
            let s = a.mreg64(Mreg::Rsi);
            let m = a.mov(mem, s);
            a.add_child(root, m);
        });
        assert_eq!(code, vec![0x48, 0x89, 0x74, 0x24, 0xF8]);
    }

    #[test]
    fn mov_through_rbp_uses_disp8() {
        // mov rax, [rbp] -> 48 8B 45 00
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rax);
            let b = a.mreg64(Mreg::Rbp);
            let mem = a.mem_at(b);
            let m = a.mov(d, mem);
            a.add_child(root, m);
        });
        assert_eq!(code, vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn add_sub_cmp_group() {
        // add rbx, rcx -> 48 01 CB ; cmp rbx, 5 -> 48 81 FB 05 00 00 00
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rbx);
            let s = a.mreg64(Mreg::Rcx);
            let i = a.add(d, s);
            a.add_child(root, i);
            let d = a.mreg64(Mreg::Rbx);
            let c = a.const_i64(5);
            let i = a.cmp(d, c);
            a.add_child(root, i);
        });
        assert_eq!(
            code,
            vec![0x48, 0x01, 0xCB, 0x48, 0x81, 0xFB, 0x05, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn cmp_byte_register_with_imm() {
        // cmp bl, 0 -> 80 FB 00
        let code = assemble_lines(|a, root| {
            let d = a.reg8(Mreg::Rbx as u8);
            let c = a.const_i8(0);
            let i = a.cmp(d, c);
            a.add_child(root, i);
        });
        assert_eq!(code, vec![0x80, 0xFB, 0x00]);
    }

    #[test]
    fn imul_reg_reg() {
        // imul rbx, rsi -> 48 0F AF DE
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rbx);
            let s = a.mreg64(Mreg::Rsi);
            let i = a.imul(d, s);
            a.add_child(root, i);
        });
        assert_eq!(code, vec![0x48, 0x0F, 0xAF, 0xDE]);
    }

    #[test]
    fn movsxd_for_32_bit_source() {
        // movsxd rbx, esi -> 48 63 DE (also when written movsx)
        let expected = vec![0x48, 0x63, 0xDE];
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rbx);
            let s = a.reg32(Mreg::Rsi as u8);
            let i = a.movsxd(d, s);
            a.add_child(root, i);
        });
        assert_eq!(code, expected);
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rbx);
            let s = a.reg32(Mreg::Rsi as u8);
            let i = a.movsx(d, s);
            a.add_child(root, i);
        });
        assert_eq!(code, expected);
    }

    #[test]
    fn movzx_byte_source() {
        // movzx rbx, al -> 48 0F B6 D8
        let code = assemble_lines(|a, root| {
            let d = a.mreg64(Mreg::Rbx);
            let s = a.reg8(Mreg::Rax as u8);
            let i = a.movzx(d, s);
            a.add_child(root, i);
        });
        assert_eq!(code, vec![0x48, 0x0F, 0xB6, 0xD8]);
    }

    #[test]
    fn jump_resolves_backward_label() {
        // lbl: ; jmp lbl -> E9 FB FF FF FF (-5)
        let code = assemble_lines(|a, root| {
            let lbl = a.label("top");
            let place = a.place_label(lbl);
            a.add_child(root, place);
            let j = a.jmp(lbl);
            a.add_child(root, j);
        });
        assert_eq!(code, vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn conditional_jump_resolves_forward_label() {
        // je end ; end: -> 0F 84 00 00 00 00
        let code = assemble_lines(|a, root| {
            let lbl = a.label("end");
            let j = a.je(lbl);
            a.add_child(root, j);
            let place = a.place_label(lbl);
            a.add_child(root, place);
        });
        assert_eq!(code, vec![0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn call_through_rax() {
        // call rax -> FF D0
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::Rax);
            let c = a.call(r);
            a.add_child(root, c);
        });
        assert_eq!(code, vec![0xFF, 0xD0]);
    }

    #[test]
    fn idiv_rcx() {
        // cqo; idiv rcx -> 48 99 48 F7 F9
        let code = assemble_lines(|a, root| {
            let c = a.cqo();
            a.add_child(root, c);
            let r = a.mreg64(Mreg::Rcx);
            let i = a.idiv(r);
            a.add_child(root, i);
        });
        assert_eq!(code, vec![0x48, 0x99, 0x48, 0xF7, 0xF9]);
    }

    #[test]
    fn inc_byte_and_quad() {
        // inc rbx -> 48 FF C3 ; inc bl -> FE C3
        let code = assemble_lines(|a, root| {
            let r = a.mreg64(Mreg::Rbx);
            let i = a.inc(r);
            a.add_child(root, i);
            let r = a.reg8(Mreg::Rbx as u8);
            let i = a.inc(r);
            a.add_child(root, i);
        });
        assert_eq!(code, vec![0x48, 0xFF, 0xC3, 0xFE, 0xC3]);
    }

    #[test]
    fn undefined_label_is_an_error() {
        let mut a = IrArena::new();
        let root = a.root();
        let lbl = a.label("nowhere");
        let j = a.jmp(lbl);
        a.add_child(root, j);
        assert!(Assembler::new().assemble(&a, root).is_err());
    }

    #[test]
    fn mov_mem_imm_is_rejected() {
        let mut a = IrArena::new();
        let root = a.root();
        let b = a.mreg64(Mreg::Rbx);
        let mem = a.mem_at(b);
        let c = a.const_i64(1);
        let m = a.mov(mem, c);
        a.add_child(root, m);
        assert!(Assembler::new().assemble(&a, root).is_err());
    }
}
