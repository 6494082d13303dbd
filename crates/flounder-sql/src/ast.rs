//! The scalar-expression tree.
//!
//! Expressions live in a per-query arena of indices. A node points at its
//! leftmost child; siblings are threaded through `next`. Expression ids are
//! assigned lazily during code generation and name intermediate results in
//! the symbol table.

use flounder_error::Result;
use flounder_types::{parse_value, SqlType, SqlValue, SymbolSet, TypeTag};

/// Handle to an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprTag {
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // bool
    And,
    Or,
    // comparison
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    Like,
    // aggregates
    Sum,
    Count,
    Avg,
    Min,
    Max,
    // order by
    Asc,
    Desc,
    // case
    Case,
    WhenThen,
    // other
    Attribute,
    Typecast,
    Constant,
    As,
    Table,
    Star,
    Undefined,
}

impl ExprTag {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::Eq => "EQ",
            Self::Neq => "NEQ",
            Self::Like => "LIKE",
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Asc => "ASC",
            Self::Desc => "DESC",
            Self::Case => "CASE",
            Self::WhenThen => "WHENTHEN",
            Self::Attribute => "ATTRIBUTE",
            Self::Typecast => "TYPECAST",
            Self::Constant => "CONSTANT",
            Self::As => "AS",
            Self::Table => "TABLE",
            Self::Star => "STAR",
            Self::Undefined => "UNDEFINED",
        }
    }

    pub const fn is_aggregate(self) -> bool {
        matches!(
            self,
            Self::Sum | Self::Count | Self::Avg | Self::Min | Self::Max
        )
    }
}

/// Structural shape, driving dispatch before the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Structure {
    Literal,
    Unary,
    Binary,
    Ternary,
    Other,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub tag: ExprTag,
    pub structure: Structure,
    pub symbol: String,
    pub next: Option<ExprId>,
    pub child: Option<ExprId>,
    pub ty: SqlType,
    pub value: SqlValue,
    /// Lazily assigned per query; 0 means unassigned.
    pub id: u64,
}

/// Arena owning all expressions of one query, plus the string buffers that
/// constant values point into.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<Expr>,
    strings: Vec<Box<[u8]>>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.0 as usize]
    }

    fn push(&mut self, e: Expr) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(e);
        id
    }

    fn blank(&mut self, tag: ExprTag, structure: Structure, symbol: &str) -> ExprId {
        self.push(Expr {
            tag,
            structure,
            symbol: symbol.to_owned(),
            next: None,
            child: None,
            ty: SqlType::NT,
            value: SqlValue::ZERO,
            id: 0,
        })
    }

    pub fn literal(&mut self, tag: ExprTag, symbol: &str) -> ExprId {
        self.blank(tag, Structure::Literal, symbol)
    }

    pub fn unary(&mut self, tag: ExprTag, symbol: &str, child: ExprId) -> ExprId {
        let e = self.blank(tag, Structure::Unary, symbol);
        self.node_mut(e).child = Some(child);
        e
    }

    pub fn binary(&mut self, tag: ExprTag, symbol: &str, left: ExprId, right: ExprId) -> ExprId {
        self.node_mut(left).next = Some(right);
        let e = self.blank(tag, Structure::Binary, symbol);
        self.node_mut(e).child = Some(left);
        e
    }

    pub fn other(&mut self, tag: ExprTag, symbol: &str) -> ExprId {
        self.blank(tag, Structure::Other, symbol)
    }

    /// Parse a constant of the given type category; the arena keeps any
    /// string buffer the value points into alive for the query.
    pub fn constant(&mut self, symbol: &str, category: TypeTag) -> Result<ExprId> {
        let (value, ty, buf) = parse_value(symbol, category)?;
        if let Some(buf) = buf {
            self.strings.push(buf);
        }
        let e = self.literal(ExprTag::Constant, symbol);
        let node = self.node_mut(e);
        node.value = value;
        node.ty = ty;
        Ok(e)
    }

    pub fn attr(&mut self, symbol: &str) -> ExprId {
        self.literal(ExprTag::Attribute, symbol)
    }

    pub fn typed_attr(&mut self, symbol: &str, ty: SqlType) -> ExprId {
        let e = self.literal(ExprTag::Attribute, symbol);
        self.node_mut(e).ty = ty;
        e
    }

    pub fn star(&mut self) -> ExprId {
        self.literal(ExprTag::Star, "*")
    }

    pub fn table(&mut self, symbol: &str) -> ExprId {
        self.literal(ExprTag::Table, symbol)
    }

    pub fn sum(&mut self, child: ExprId) -> ExprId {
        self.unary(ExprTag::Sum, "sum", child)
    }

    pub fn count(&mut self, child: ExprId) -> ExprId {
        self.unary(ExprTag::Count, "count", child)
    }

    pub fn avg(&mut self, child: ExprId) -> ExprId {
        self.unary(ExprTag::Avg, "avg", child)
    }

    pub fn asc(&mut self, child: ExprId) -> ExprId {
        self.unary(ExprTag::Asc, "asc", child)
    }

    pub fn desc(&mut self, child: ExprId) -> ExprId {
        self.unary(ExprTag::Desc, "desc", child)
    }

    pub fn alias(&mut self, symbol: &str, child: ExprId) -> ExprId {
        self.unary(ExprTag::As, symbol, child)
    }

    pub fn typecast(&mut self, ty: SqlType, child: ExprId) -> ExprId {
        let e = self.unary(ExprTag::Typecast, "typecast", child);
        self.node_mut(e).ty = ty;
        e
    }

    pub fn and(&mut self, l: ExprId, r: ExprId) -> ExprId {
        self.binary(ExprTag::And, "and", l, r)
    }

    pub fn eq(&mut self, l: ExprId, r: ExprId) -> ExprId {
        self.binary(ExprTag::Eq, "=", l, r)
    }

    pub fn case(&mut self, when_then_else: ExprId) -> ExprId {
        let e = self.other(ExprTag::Case, "case");
        self.node_mut(e).child = Some(when_then_else);
        e
    }

    pub fn when_then(&mut self, when: ExprId, then: ExprId) -> ExprId {
        self.binary(ExprTag::WhenThen, "whenThen", when, then)
    }

    /// Collect a sibling-threaded list into a vector.
    pub fn list_to_vec(&self, head: Option<ExprId>) -> Vec<ExprId> {
        let mut res = Vec::new();
        let mut cur = head;
        while let Some(e) = cur {
            res.push(e);
            cur = self.node(e).next;
        }
        res
    }

    /// The symbol-table key for an expression's result: attribute name,
    /// alias, or `expr<id>`.
    pub fn expression_name(&self, e: ExprId) -> String {
        let node = self.node(e);
        match node.tag {
            ExprTag::Attribute | ExprTag::As => node.symbol.clone(),
            _ => format!("expr{}", node.id),
        }
    }

    /// Assign a fresh id when the expression has none yet.
    pub fn assign_id(&mut self, e: ExprId, generator: &mut u64) {
        if self.node(e).id == 0 {
            *generator += 1;
            self.node_mut(e).id = *generator;
        }
    }

    /// All attribute names an expression reads.
    pub fn required_attributes(&self, e: ExprId) -> SymbolSet {
        let mut res = SymbolSet::new();
        self.collect_required(e, &mut res);
        res
    }

    fn collect_required(&self, e: ExprId, out: &mut SymbolSet) {
        let node = self.node(e);
        if node.tag == ExprTag::Attribute {
            out.insert(node.symbol.clone());
        }
        let mut child = node.child;
        while let Some(c) = child {
            self.collect_required(c, out);
            child = self.node(c).next;
        }
    }

    pub fn required_attributes_of(&self, exprs: &[ExprId]) -> SymbolSet {
        let mut res = SymbolSet::new();
        for &e in exprs {
            self.collect_required(e, &mut res);
        }
        res
    }

    /// All attribute symbols in preorder (with duplicates).
    pub fn collect_attributes(&self, e: ExprId) -> Vec<String> {
        let mut res = Vec::new();
        self.collect_attributes_inner(e, &mut res);
        res
    }

    fn collect_attributes_inner(&self, e: ExprId, out: &mut Vec<String>) {
        let node = self.node(e);
        if node.tag == ExprTag::Attribute {
            out.push(node.symbol.clone());
        }
        let mut child = node.child;
        while let Some(c) = child {
            self.collect_attributes_inner(c, out);
            child = self.node(c).next;
        }
    }

    /// Wedge a unary node between `parent` and one specific `child`.
    pub fn insert_unary_between(&mut self, parent: ExprId, child: ExprId, insert: ExprId) {
        if self.node(parent).child == Some(child) {
            self.node_mut(parent).child = Some(insert);
            self.node_mut(insert).next = self.node(child).next;
            self.node_mut(insert).child = Some(child);
            self.node_mut(child).next = None;
        } else {
            let mut prev = self.node(parent).child.expect("parent has children");
            while self.node(prev).next != Some(child) {
                prev = self.node(prev).next.expect("child under parent");
            }
            self.node_mut(prev).next = Some(insert);
            self.node_mut(insert).next = self.node(child).next;
            self.node_mut(child).next = None;
            self.node_mut(insert).child = Some(child);
        }
    }

    /// Left-hand children of a list of equality conditions.
    pub fn equalities_left(&self, eqs: &[ExprId]) -> Vec<ExprId> {
        eqs.iter()
            .map(|&e| self.node(e).child.expect("equality left side"))
            .collect()
    }

    /// Right-hand children of a list of equality conditions.
    pub fn equalities_right(&self, eqs: &[ExprId]) -> Vec<ExprId> {
        eqs.iter()
            .map(|&e| {
                let left = self.node(e).child.expect("equality left side");
                self.node(left).next.expect("equality right side")
            })
            .collect()
    }

    /// Conjunction of a list of conditions (None when empty).
    pub fn conjunction(&mut self, mut exprs: Vec<ExprId>) -> Option<ExprId> {
        let first = if exprs.is_empty() {
            return None;
        } else {
            exprs.remove(0)
        };
        let mut acc = first;
        for e in exprs {
            acc = self.and(acc, e);
        }
        Some(acc)
    }

    /// Children of the top-level AND conjunctions (the expression itself if
    /// it is no AND).
    pub fn top_level_conjuncts(&self, e: Option<ExprId>) -> Vec<ExprId> {
        let Some(e) = e else {
            return Vec::new();
        };
        if self.node(e).tag != ExprTag::And {
            return vec![e];
        }
        let mut res = Vec::new();
        self.collect_conjuncts(e, &mut res);
        res
    }

    fn collect_conjuncts(&self, e: ExprId, out: &mut Vec<ExprId>) {
        let mut child = self.node(e).child;
        while let Some(c) = child {
            if self.node(c).tag == ExprTag::And {
                self.collect_conjuncts(c, out);
            } else {
                out.push(c);
            }
            child = self.node(c).next;
        }
    }

    /// Preorder filter over a whole expression tree.
    pub fn filter(&self, e: ExprId, pred: &impl Fn(&Expr) -> bool) -> Vec<ExprId> {
        let mut res = Vec::new();
        self.filter_inner(e, pred, &mut res);
        res
    }

    fn filter_inner(&self, e: ExprId, pred: &impl Fn(&Expr) -> bool, out: &mut Vec<ExprId>) {
        if pred(self.node(e)) {
            out.push(e);
        }
        let mut child = self.node(e).child;
        while let Some(c) = child {
            self.filter_inner(c, pred, out);
            child = self.node(c).next;
        }
    }

    /// Debug rendering used in error messages.
    pub fn serialize(&self, e: ExprId) -> String {
        let node = self.node(e);
        let mut out = format!("{{{},{}", node.tag.name(), node.ty);
        if node.tag == ExprTag::Constant {
            out.push(',');
            out.push_str(&flounder_types::serialize_value(node.value, node.ty));
        }
        let mut child = node.child;
        while let Some(c) = child {
            out.push(',');
            out.push_str(&self.serialize(c));
            child = self.node(c).next;
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_threads_siblings() {
        let mut a = ExprArena::new();
        let l = a.constant("1", TypeTag::Bigint).unwrap();
        let r = a.constant("2", TypeTag::Bigint).unwrap();
        let add = a.binary(ExprTag::Add, "+", l, r);
        assert_eq!(a.node(add).child, Some(l));
        assert_eq!(a.node(l).next, Some(r));
        assert_eq!(a.node(r).next, None);
    }

    #[test]
    fn expression_names() {
        let mut a = ExprArena::new();
        let attr = a.attr("price");
        assert_eq!(a.expression_name(attr), "price");
        let c = a.constant("1", TypeTag::Bigint).unwrap();
        let al = a.alias("one", c);
        assert_eq!(a.expression_name(al), "one");
        let mut gen = 0u64;
        let c2 = a.constant("2", TypeTag::Bigint).unwrap();
        a.assign_id(c2, &mut gen);
        assert_eq!(a.expression_name(c2), "expr1");
    }

    #[test]
    fn required_attributes_are_collected() {
        let mut a = ExprArena::new();
        let x = a.attr("x");
        let y = a.attr("y");
        let add = a.binary(ExprTag::Add, "+", x, y);
        let req = a.required_attributes(add);
        assert!(req.contains("x") && req.contains("y"));
        assert_eq!(req.len(), 2);
    }

    #[test]
    fn insert_unary_wedges_typecast() {
        let mut a = ExprArena::new();
        let l = a.constant("1", TypeTag::Bigint).unwrap();
        let r = a.constant("2.5", TypeTag::Decimal).unwrap();
        let add = a.binary(ExprTag::Add, "+", l, r);
        let cast = a.typecast(SqlType::decimal(19, 0), l);
        a.insert_unary_between(add, l, cast);
        assert_eq!(a.node(add).child, Some(cast));
        assert_eq!(a.node(cast).child, Some(l));
        assert_eq!(a.node(cast).next, Some(r));
        assert_eq!(a.node(l).next, None);
    }

    #[test]
    fn conjuncts_flatten_nested_ands() {
        let mut a = ExprArena::new();
        let p = a.attr("p");
        let q = a.attr("q");
        let r = a.attr("r");
        let pq = a.and(p, q);
        let pqr = a.and(pq, r);
        let list = a.top_level_conjuncts(Some(pqr));
        assert_eq!(list, vec![p, q, r]);
    }
}
