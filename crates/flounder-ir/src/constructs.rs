//! Structured-control helpers that expand to compare/branch/label sequences.

use crate::arena::{IrArena, NodeId};

/// A binary comparison between two operands, usable in its direct or
/// inverted form as a branch condition.
#[derive(Debug, Clone, Copy)]
pub enum Comparator {
    IsEqual(NodeId, NodeId),
    IsNotEqual(NodeId, NodeId),
    IsSmaller(NodeId, NodeId),
    IsLarger(NodeId, NodeId),
    IsLargerEqual(NodeId, NodeId),
}

impl Comparator {
    fn operands(self) -> (NodeId, NodeId) {
        match self {
            Self::IsEqual(a, b)
            | Self::IsNotEqual(a, b)
            | Self::IsSmaller(a, b)
            | Self::IsLarger(a, b)
            | Self::IsLargerEqual(a, b) => (a, b),
        }
    }

    /// Emit `cmp` + jump to `dest` when the condition holds.
    pub fn gen(self, arena: &mut IrArena, root: NodeId, dest: NodeId) {
        let (a, b) = self.operands();
        let cmp = arena.cmp(a, b);
        arena.add_child(root, cmp);
        let jump = match self {
            Self::IsEqual(..) => arena.je(dest),
            Self::IsNotEqual(..) => arena.jne(dest),
            Self::IsSmaller(..) => arena.jl(dest),
            Self::IsLarger(..) => arena.jg(dest),
            Self::IsLargerEqual(..) => arena.jge(dest),
        };
        arena.add_child(root, jump);
    }

    /// Emit `cmp` + jump to `dest` when the condition does NOT hold.
    pub fn gen_inverted(self, arena: &mut IrArena, root: NodeId, dest: NodeId) {
        let (a, b) = self.operands();
        let cmp = arena.cmp(a, b);
        arena.add_child(root, cmp);
        let jump = match self {
            Self::IsEqual(..) => arena.jne(dest),
            Self::IsNotEqual(..) => arena.je(dest),
            Self::IsSmaller(..) => arena.jge(dest),
            Self::IsLarger(..) => arena.jle(dest),
            Self::IsLargerEqual(..) => arena.jl(dest),
        };
        arena.add_child(root, jump);
    }
}

/// A while loop under construction: head label, foot label, and the loop
/// markers the optimizer and allocator key on.
#[derive(Debug, Clone, Copy)]
pub struct WhileLoop {
    pub id: u32,
    pub root: NodeId,
    pub head_label: NodeId,
    pub foot_label: NodeId,
}

impl WhileLoop {
    /// Open a conditional loop: the inverted condition branches to the foot.
    pub fn new(arena: &mut IrArena, condition: Comparator, root: NodeId) -> Self {
        let loop_ = Self::new_unconditional(arena, root);
        condition.gen_inverted(arena, root, loop_.foot_label);
        loop_
    }

    /// Open an unconditional loop (exits via `break_if`).
    pub fn new_unconditional(arena: &mut IrArena, root: NodeId) -> Self {
        let id = arena.loop_count;
        arena.loop_count += 1;
        let head_label = arena.label(&format!("loop_head{id}"));
        let foot_label = arena.label(&format!("loop_foot{id}"));
        let open = arena.open_loop(id);
        arena.add_child(root, open);
        let place = arena.place_label(head_label);
        arena.add_child(root, place);
        Self {
            id,
            root,
            head_label,
            foot_label,
        }
    }

    /// Branch to the loop foot when the condition holds.
    pub fn break_if(&self, arena: &mut IrArena, condition: Comparator) {
        condition.gen(arena, self.root, self.foot_label);
    }

    /// Branch back to the loop head when the condition holds.
    pub fn continue_if(&self, arena: &mut IrArena, condition: Comparator) {
        condition.gen(arena, self.root, self.head_label);
    }

    pub fn close(self, arena: &mut IrArena) {
        let jmp = arena.jmp(self.head_label);
        arena.add_child(self.root, jmp);
        let place = arena.place_label(self.foot_label);
        arena.add_child(self.root, place);
        let close = arena.close_loop(self.id);
        arena.add_child(self.root, close);
    }
}

/// An if clause: the inverted condition branches past the body.
#[derive(Debug, Clone, Copy)]
pub struct IfClause {
    pub root: NodeId,
    pub foot_label: NodeId,
}

impl IfClause {
    pub fn new(arena: &mut IrArena, condition: Comparator, root: NodeId) -> Self {
        let id = arena.if_count;
        arena.if_count += 1;
        let foot_label = arena.label(&format!("if_foot{id}"));
        condition.gen_inverted(arena, root, foot_label);
        Self { root, foot_label }
    }

    pub fn close(self, arena: &mut IrArena) {
        let place = arena.place_label(self.foot_label);
        arena.add_child(self.root, place);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn while_loop_brackets_body_with_markers() {
        let mut a = IrArena::new();
        let root = a.root();
        let x = a.vreg64("x");
        let limit = a.const_i64(10);
        let w = WhileLoop::new(&mut a, Comparator::IsSmaller(x, limit), root);
        let body = a.comment_line("body");
        a.add_child(root, body);
        w.close(&mut a);

        let text = a.emit(root);
        assert!(text.contains("openLoop0"));
        assert!(text.contains("loop_head0:"));
        assert!(text.contains("jge"));
        assert!(text.contains("jmp"));
        assert!(text.contains("loop_foot0:"));
        assert!(text.contains("closeLoop0"));
        let head_pos = text.find("loop_head0:").unwrap();
        let body_pos = text.find(";body").unwrap();
        let foot_pos = text.find("loop_foot0:").unwrap();
        assert!(head_pos < body_pos && body_pos < foot_pos);
    }

    #[test]
    fn if_clause_jumps_past_body_when_false() {
        let mut a = IrArena::new();
        let root = a.root();
        let x = a.vreg8("flag");
        let one = a.const_i8(1);
        let if_ = IfClause::new(&mut a, Comparator::IsEqual(x, one), root);
        let body = a.comment_line("then");
        a.add_child(root, body);
        if_.close(&mut a);
        let text = a.emit(root);
        assert!(text.contains("jne"));
        assert!(text.contains("if_foot0:"));
    }
}
