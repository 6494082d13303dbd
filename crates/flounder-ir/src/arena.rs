use std::fmt::Write as _;

/// Handle to a node in an [`IrArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Node kinds across the x86-64 vocabulary and the Flounder extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Undefined,
    Root,
    Reg8,
    Reg32,
    Reg64,
    IdLabel,
    Label,
    Syscall,
    CommentLine,
    Call,
    Push,
    Pop,
    Inc,
    Dec,
    Je,
    Jmp,
    Mov,
    Lea,
    Cmp,
    Add,
    Xor,
    MemAt,
    MemAdd,
    MemSub,
    PlaceLabel,
    Section,
    Ret,
    Imul,
    Jl,
    Jge,
    Div,
    Sub,
    Jg,
    Jle,
    Jne,
    And,
    Or,
    Idiv,
    Cdqe,
    Cqo,
    Movsx,
    Movzx,
    Movsxd,
    ConstAddress,
    ConstInt64,
    ConstInt32,
    ConstInt8,
    ConstDouble,
    Crc32,
    // Flounder extensions
    Vreg8,
    Vreg32,
    Vreg64,
    ReqVreg,
    ClearVreg,
    ManagedSyscall,
    ManagedCall,
    ConstLoad,
    OpenLoop,
    CloseLoop,
    // SIMD
    Xmm,
    Ymm,
    Zmm,
    Movdqu,
    Vmovdqu,
    Vmovdqu32,
    Vextractf128,
    Vpextrq,
    Pextrq,
    Vextracti64x2,
}

/// How a node renders to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitShape {
    Root,
    Literal,
    UnaryInstr,
    UnarySub,
    BinaryInstr,
    TernaryInstr,
    Bracketing,
    MemAdd,
    MemSub,
    ManagedCall,
    ManagedSyscall,
    ConstI8,
    ConstI32,
    ConstI64,
    ConstF64,
    ConstAddr,
}

/// Constant payload carried by constant nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    None,
    I8(i8),
    I32(i32),
    I64(i64),
    F64(f64),
    Addr(u64),
}

/// A pooled IR node. A node _has_ a linked list of descendants
/// (`first_child`/`last_child`) and _is_ a linked-list element
/// (`next`/`prev`).
#[derive(Debug, Clone)]
pub struct IrNode {
    pub kind: NodeKind,
    pub shape: EmitShape,
    /// Resource id: machine register number, vreg id, loop id. 0 when
    /// unapplicable.
    pub id: u32,
    /// Mnemonic or literal text.
    pub ident: Option<Box<str>>,
    /// Closing token for bracketing nodes.
    pub ident2: Option<Box<str>>,
    pub payload: Payload,
    pub n_children: u32,
    pub first_child: Option<NodeId>,
    pub last_child: Option<NodeId>,
    pub next: Option<NodeId>,
    pub prev: Option<NodeId>,
}

/// Bump arena of IR nodes for one query.
///
/// Nodes are never reclaimed mid-query; the whole arena is released at the
/// end. The arena also owns the per-query id counters that name vregs,
/// loops, ifs and labels, so concurrent compilation in one process is safe.
#[derive(Debug, Default)]
pub struct IrArena {
    nodes: Vec<IrNode>,
    pub vreg_count: u32,
    pub loop_count: u32,
    pub if_count: u32,
    pub label_count: u32,
}

impl IrArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &IrNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut IrNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn push(&mut self, node: IrNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub(crate) fn blank(&mut self, kind: NodeKind, shape: EmitShape) -> NodeId {
        self.push(IrNode {
            kind,
            shape,
            id: 0,
            ident: None,
            ident2: None,
            payload: Payload::None,
            n_children: 0,
            first_child: None,
            last_child: None,
            next: None,
            prev: None,
        })
    }

    /// Copy a node record. The copy shares the original's child handles but
    /// starts with fresh sibling links, so the same sub-template can be
    /// added to several parents.
    pub fn copy_node(&mut self, src: NodeId) -> NodeId {
        let mut cloned = self.node(src).clone();
        cloned.next = None;
        cloned.prev = None;
        self.push(cloned)
    }

    pub fn root(&mut self) -> NodeId {
        self.blank(NodeKind::Root, EmitShape::Root)
    }

    pub fn literal(&mut self, text: &str, kind: NodeKind) -> NodeId {
        let id = self.blank(kind, EmitShape::Literal);
        self.node_mut(id).ident = Some(text.into());
        id
    }

    pub fn unary_instr(&mut self, mnemonic: &str, op: NodeId, kind: NodeKind) -> NodeId {
        let id = self.blank(kind, EmitShape::UnaryInstr);
        self.node_mut(id).ident = Some(mnemonic.into());
        self.add_child(id, op);
        id
    }

    pub fn unary_sub(&mut self, mnemonic: &str, op: NodeId, kind: NodeKind) -> NodeId {
        let id = self.unary_instr(mnemonic, op, kind);
        self.node_mut(id).shape = EmitShape::UnarySub;
        id
    }

    pub fn binary_instr(&mut self, mnemonic: &str, op1: NodeId, op2: NodeId, kind: NodeKind) -> NodeId {
        let id = self.blank(kind, EmitShape::BinaryInstr);
        self.node_mut(id).ident = Some(mnemonic.into());
        self.add_child(id, op1);
        self.add_child(id, op2);
        id
    }

    pub fn ternary_instr(
        &mut self,
        mnemonic: &str,
        op1: NodeId,
        op2: NodeId,
        op3: NodeId,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.blank(kind, EmitShape::TernaryInstr);
        self.node_mut(id).ident = Some(mnemonic.into());
        self.add_child(id, op1);
        self.add_child(id, op2);
        self.add_child(id, op3);
        id
    }

    pub fn bracketing(
        &mut self,
        token_open: &str,
        token_close: &str,
        child: NodeId,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.blank(kind, EmitShape::Bracketing);
        self.node_mut(id).ident = Some(token_open.into());
        self.node_mut(id).ident2 = Some(token_close.into());
        self.add_child(id, child);
        id
    }

    /// Append a copy of `child` to `parent`'s child list and return the
    /// handle of the copy.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> NodeId {
        let added = self.copy_node(child);
        let last = self.node(parent).last_child;
        match last {
            None => {
                let p = self.node_mut(parent);
                p.first_child = Some(added);
                p.last_child = Some(added);
                p.n_children = 1;
            }
            Some(last) => {
                self.node_mut(added).prev = Some(last);
                self.node_mut(last).next = Some(added);
                let p = self.node_mut(parent);
                p.last_child = Some(added);
                p.n_children += 1;
            }
        }
        added
    }

    /// Insert `insert` directly before `child` in `parent`'s child list.
    pub fn insert_before_child(&mut self, parent: NodeId, child: NodeId, insert: NodeId) -> NodeId {
        let old_prev = self.node(child).prev;
        match old_prev {
            None => self.node_mut(parent).first_child = Some(insert),
            Some(prev) => self.node_mut(prev).next = Some(insert),
        }
        self.node_mut(insert).next = Some(child);
        self.node_mut(insert).prev = old_prev;
        self.node_mut(child).prev = Some(insert);
        self.node_mut(parent).n_children += 1;
        insert
    }

    /// Insert `insert` directly after `child` in `parent`'s child list.
    pub fn insert_after_child(&mut self, parent: NodeId, child: NodeId, insert: NodeId) -> NodeId {
        let old_next = self.node(child).next;
        self.node_mut(insert).next = old_next;
        if let Some(next) = old_next {
            self.node_mut(next).prev = Some(insert);
        }
        self.node_mut(insert).prev = Some(child);
        self.node_mut(child).next = Some(insert);
        if self.node(parent).last_child == Some(child) {
            self.node_mut(parent).last_child = Some(insert);
        }
        self.node_mut(parent).n_children += 1;
        insert
    }

    /// Splice the entire child list of `insert_base` into `base` after
    /// `child_pos` (prepend when `child_pos` is `None`). Returns the last
    /// transferred node, and leaves `insert_base` childless.
    pub fn transfer_children(
        &mut self,
        base: NodeId,
        child_pos: Option<NodeId>,
        insert_base: NodeId,
    ) -> Option<NodeId> {
        let ins_first = self.node(insert_base).first_child?;
        let ins_last = self.node(insert_base).last_child?;
        let ins_count = self.node(insert_base).n_children;

        match child_pos {
            // prepend
            None => match self.node(base).first_child {
                Some(old_first) => {
                    self.node_mut(old_first).prev = Some(ins_last);
                    self.node_mut(ins_last).next = Some(old_first);
                    self.node_mut(base).first_child = Some(ins_first);
                }
                None => {
                    let b = self.node_mut(base);
                    b.first_child = Some(ins_first);
                    b.last_child = Some(ins_last);
                }
            },
            Some(pos) => {
                let pos_next = self.node(pos).next;
                self.node_mut(pos).next = Some(ins_first);
                self.node_mut(ins_first).prev = Some(pos);
                match pos_next {
                    // append at the end
                    None => self.node_mut(base).last_child = Some(ins_last),
                    // insert in the middle
                    Some(next) => {
                        self.node_mut(ins_last).next = Some(next);
                        self.node_mut(next).prev = Some(ins_last);
                    }
                }
                if self.node(base).last_child == Some(pos) {
                    self.node_mut(base).last_child = Some(ins_last);
                }
            }
        }
        self.node_mut(base).n_children += ins_count;

        let ib = self.node_mut(insert_base);
        ib.first_child = None;
        ib.last_child = None;
        ib.n_children = 0;
        Some(ins_last)
    }

    /// Unlink `child` from `parent`'s child list; returns the node that
    /// preceded it.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Option<NodeId> {
        let prev = self.node(child).prev;
        let next = self.node(child).next;
        if self.node(parent).first_child == Some(child) {
            self.node_mut(parent).first_child = next;
        }
        if self.node(parent).last_child == Some(child) {
            self.node_mut(parent).last_child = prev;
        }
        if let Some(p) = prev {
            self.node_mut(p).next = next;
        }
        if let Some(n) = next {
            self.node_mut(n).prev = prev;
        }
        self.node_mut(parent).n_children -= 1;
        prev
    }

    /// Replace `old` with `replacement` in `parent`'s child list.
    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, replacement: NodeId) {
        let prev = self.node(old).prev;
        let next = self.node(old).next;
        if self.node(parent).first_child == Some(old) {
            self.node_mut(parent).first_child = Some(replacement);
        }
        if self.node(parent).last_child == Some(old) {
            self.node_mut(parent).last_child = Some(replacement);
        }
        if let Some(p) = prev {
            self.node_mut(p).next = Some(replacement);
        }
        if let Some(n) = next {
            self.node_mut(n).prev = Some(replacement);
        }
        let r = self.node_mut(replacement);
        r.next = next;
        r.prev = prev;
    }

    /// Iterate a node's children front to back.
    pub fn children(&self, parent: NodeId) -> ChildIter<'_> {
        ChildIter {
            arena: self,
            current: self.node(parent).first_child,
        }
    }

    pub fn nth_child(&self, parent: NodeId, n: usize) -> Option<NodeId> {
        self.children(parent).nth(n)
    }

    /// Render a node (and its subtree) to text.
    pub fn emit(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.emit_into(node, &mut out);
        out
    }

    fn emit_into(&self, node: NodeId, out: &mut String) {
        let n = self.node(node);
        match n.shape {
            EmitShape::Root => {
                let mut child = n.first_child;
                while let Some(c) = child {
                    self.emit_into(c, out);
                    child = self.node(c).next;
                }
            }
            EmitShape::Literal => {
                if let Some(ident) = &n.ident {
                    out.push_str(ident);
                }
            }
            EmitShape::UnaryInstr => {
                let op = self.emit(n.first_child.expect("unary instruction child"));
                let _ = writeln!(
                    out,
                    "{:<14} {:<20}",
                    n.ident.as_deref().unwrap_or(""),
                    op
                );
            }
            EmitShape::UnarySub => {
                let op = self.emit(n.first_child.expect("unary sub child"));
                let _ = write!(out, "{}({})", n.ident.as_deref().unwrap_or(""), op);
            }
            EmitShape::BinaryInstr => {
                let first = n.first_child.expect("binary instruction first child");
                let second = self.node(first).next.expect("binary instruction second child");
                let op1 = self.emit(first);
                let op2 = self.emit(second);
                let _ = writeln!(
                    out,
                    "{:<14} {:<32}{:<26}",
                    n.ident.as_deref().unwrap_or(""),
                    format!("{op1},"),
                    op2
                );
            }
            EmitShape::TernaryInstr => {
                let first = n.first_child.expect("ternary first child");
                let second = self.node(first).next.expect("ternary second child");
                let third = self.node(second).next.expect("ternary third child");
                let _ = writeln!(
                    out,
                    "{:<14} {:<20},{:<20},{:<20}",
                    n.ident.as_deref().unwrap_or(""),
                    self.emit(first),
                    self.emit(second),
                    self.emit(third)
                );
            }
            EmitShape::Bracketing => {
                let op = self.emit(n.first_child.expect("bracketing child"));
                let _ = write!(
                    out,
                    "{}{}{}",
                    n.ident.as_deref().unwrap_or(""),
                    op,
                    n.ident2.as_deref().unwrap_or("")
                );
            }
            EmitShape::MemAdd | EmitShape::MemSub => {
                let first = n.first_child.expect("mem arith first child");
                let second = self.node(first).next.expect("mem arith second child");
                let sep = if n.shape == EmitShape::MemAdd { '+' } else { '-' };
                let _ = write!(out, "{}{}{}", self.emit(first), sep, self.emit(second));
            }
            EmitShape::ManagedCall | EmitShape::ManagedSyscall => {
                let name = if n.shape == EmitShape::ManagedCall {
                    "mcall"
                } else {
                    "msyscall"
                };
                let _ = write!(out, "{name} (");
                let mut child = n.first_child;
                let mut first = true;
                while let Some(c) = child {
                    if !first {
                        out.push_str(", ");
                    }
                    self.emit_into(c, out);
                    first = false;
                    child = self.node(c).next;
                }
                out.push_str(" )\n");
            }
            EmitShape::ConstI8 => {
                if let Payload::I8(v) = n.payload {
                    let _ = write!(out, "{v}");
                }
            }
            EmitShape::ConstI32 => {
                if let Payload::I32(v) = n.payload {
                    let _ = write!(out, "{v}");
                }
            }
            EmitShape::ConstI64 => {
                if let Payload::I64(v) = n.payload {
                    let _ = write!(out, "{v}");
                }
            }
            EmitShape::ConstF64 => {
                if let Payload::F64(v) = n.payload {
                    let _ = write!(out, "{v:.6}");
                }
            }
            EmitShape::ConstAddr => {
                if let Payload::Addr(v) = n.payload {
                    let _ = write!(out, "0x{v:x}");
                }
            }
        }
    }
}

pub struct ChildIter<'a> {
    arena: &'a IrArena,
    current: Option<NodeId>,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.current?;
        self.current = self.arena.node(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_child_copies_the_node() {
        let mut a = IrArena::new();
        let root1 = a.root();
        let root2 = a.root();
        let lit = a.literal("x", NodeKind::Label);
        let c1 = a.add_child(root1, lit);
        let c2 = a.add_child(root2, lit);
        assert_ne!(c1, c2);
        assert_ne!(c1, lit);
        // mutating the copy leaves the template untouched
        a.node_mut(c1).ident = Some("y".into());
        assert_eq!(a.node(lit).ident.as_deref(), Some("x"));
        assert_eq!(a.node(c2).ident.as_deref(), Some("x"));
    }

    #[test]
    fn insert_and_remove_keep_links_consistent() {
        let mut a = IrArena::new();
        let root = a.root();
        let x = a.literal("x", NodeKind::Label);
        let first = a.add_child(root, x);
        let third = a.add_child(root, x);
        let second = a.literal("mid", NodeKind::Label);
        a.insert_after_child(root, first, second);
        let order: Vec<NodeId> = a.children(root).collect();
        assert_eq!(order, vec![first, second, third]);
        assert_eq!(a.node(root).n_children, 3);
        assert_eq!(a.node(third).prev, Some(second));

        a.remove_child(root, second);
        let order: Vec<NodeId> = a.children(root).collect();
        assert_eq!(order, vec![first, third]);
        assert_eq!(a.node(third).prev, Some(first));

        let zeroth = a.literal("z", NodeKind::Label);
        a.insert_before_child(root, first, zeroth);
        let order: Vec<NodeId> = a.children(root).collect();
        assert_eq!(order, vec![zeroth, first, third]);
        assert_eq!(a.node(root).first_child, Some(zeroth));
        assert_eq!(a.node(zeroth).prev, None);
        assert_eq!(a.node(first).prev, Some(zeroth));
    }

    #[test]
    fn transfer_children_splices_whole_lists() {
        let mut a = IrArena::new();
        let base = a.root();
        let x = a.literal("x", NodeKind::Label);
        let b1 = a.add_child(base, x);
        let b2 = a.add_child(base, x);

        let donor = a.root();
        let y = a.literal("y", NodeKind::Label);
        let d1 = a.add_child(donor, y);
        let d2 = a.add_child(donor, y);

        // splice between b1 and b2
        let last = a.transfer_children(base, Some(b1), donor);
        assert_eq!(last, Some(d2));
        let order: Vec<NodeId> = a.children(base).collect();
        assert_eq!(order, vec![b1, d1, d2, b2]);
        assert_eq!(a.node(base).n_children, 4);
        assert_eq!(a.node(donor).n_children, 0);
        assert_eq!(a.node(donor).first_child, None);
    }

    #[test]
    fn transfer_children_prepend_and_append() {
        let mut a = IrArena::new();
        let base = a.root();
        let x = a.literal("x", NodeKind::Label);
        let b1 = a.add_child(base, x);

        let head = a.root();
        let h = a.literal("h", NodeKind::Label);
        let h1 = a.add_child(head, h);
        a.transfer_children(base, None, head);

        let tail = a.root();
        let t = a.literal("t", NodeKind::Label);
        let t1 = a.add_child(tail, t);
        let last = a.node(base).last_child.unwrap();
        a.transfer_children(base, Some(last), tail);

        let order: Vec<NodeId> = a.children(base).collect();
        assert_eq!(order, vec![h1, b1, t1]);
        assert_eq!(a.node(base).first_child, Some(h1));
        assert_eq!(a.node(base).last_child, Some(t1));
    }

    #[test]
    fn transfer_into_empty_base() {
        let mut a = IrArena::new();
        let base = a.root();
        let donor = a.root();
        let y = a.literal("y", NodeKind::Label);
        let d1 = a.add_child(donor, y);
        a.transfer_children(base, None, donor);
        let order: Vec<NodeId> = a.children(base).collect();
        assert_eq!(order, vec![d1]);
        assert_eq!(a.node(base).last_child, Some(d1));
    }

    #[test]
    fn emit_shapes() {
        let mut a = IrArena::new();
        let root = a.root();
        let lbl = a.literal("rax", NodeKind::Reg64);
        let push = a.unary_instr("push", lbl, NodeKind::Push);
        a.add_child(root, push);
        let text = a.emit(root);
        assert!(text.starts_with("push"));
        assert!(text.contains("rax"));
    }
}
