//! Recursive-descent SQL parser.
//!
//! Supported statements: `SELECT` (with FROM/WHERE/GROUP BY/ORDER BY/LIMIT),
//! `CREATE TABLE`, and `BULK INSERT ... FROM '<file>' [WITH
//! (FIELDTERMINATOR='<c>')]`. Quoted literals that parse as dates become
//! DATE constants; single characters become CHAR(1), longer strings VARCHAR.

use flounder_error::{FlounderError, Result};
use flounder_types::{parse_date, SqlType, TypeTag};

use crate::ast::{ExprArena, ExprId, ExprTag};
use crate::lexer::{Lexer, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTag {
    Select,
    CreateTable,
    BulkInsert,
}

/// One column of a CREATE TABLE statement.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SqlType,
}

/// A parsed statement plus the expression arena its trees live in.
#[derive(Debug)]
pub struct Query {
    pub tag: QueryTag,
    pub arena: ExprArena,

    // SELECT
    pub select: Vec<ExprId>,
    pub from: Vec<ExprId>,
    pub where_clause: Option<ExprId>,
    pub group_by: Vec<ExprId>,
    pub order_by: Vec<ExprId>,
    pub limit: Option<usize>,
    pub request_all: bool,

    // CREATE TABLE / BULK INSERT
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub file_name: String,
    pub field_terminator: char,
}

impl Query {
    fn new(tag: QueryTag, arena: ExprArena) -> Self {
        Self {
            tag,
            arena,
            select: Vec::new(),
            from: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            request_all: false,
            table_name: String::new(),
            columns: Vec::new(),
            file_name: String::new(),
            field_terminator: ',',
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    arena: ExprArena,
}

/// Parse one SQL statement.
pub fn parse_sql(sql: &str) -> Result<Query> {
    let tokens = Lexer::tokenize(sql);
    let mut parser = Parser {
        tokens,
        pos: 0,
        arena: ExprArena::new(),
    };
    parser.statement()
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.peek().kind == TokenKind::Identifier && self.peek().text.eq_ignore_ascii_case(kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(FlounderError::syntax(self.peek().text.clone()))
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(FlounderError::syntax(self.peek().text.clone()))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let tok = self.expect(TokenKind::Identifier)?;
        Ok(tok.text.to_lowercase())
    }

    fn statement(&mut self) -> Result<Query> {
        if self.at_keyword("select") {
            self.select_statement()
        } else if self.at_keyword("create") {
            self.create_table_statement()
        } else if self.at_keyword("bulk") {
            self.bulk_insert_statement()
        } else {
            Err(FlounderError::syntax(self.peek().text.clone()))
        }
    }

    fn select_statement(&mut self) -> Result<Query> {
        self.expect_keyword("select")?;

        let mut request_all = false;
        let mut select = Vec::new();
        if self.peek().kind == TokenKind::Star {
            self.advance();
            request_all = true;
        } else {
            select = self.expression_list()?;
        }

        let mut from = Vec::new();
        if self.eat_keyword("from") {
            loop {
                let name = self.identifier()?;
                from.push(self.arena.table(&name));
                if self.peek().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let where_clause = if self.eat_keyword("where") {
            Some(self.expression()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword("group") {
            self.expect_keyword("by")?;
            group_by = self.expression_list()?;
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                let e = self.expression()?;
                let wrapped = if self.eat_keyword("asc") {
                    self.arena.asc(e)
                } else if self.eat_keyword("desc") {
                    self.arena.desc(e)
                } else {
                    e
                };
                order_by.push(wrapped);
                if self.peek().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword("limit") {
            let tok = self.expect(TokenKind::IntegerConstant)?;
            Some(
                tok.text
                    .parse()
                    .map_err(|_| FlounderError::syntax(tok.text.clone()))?,
            )
        } else {
            None
        };

        if request_all && from.is_empty() {
            return Err(FlounderError::syntax("select * requires a from clause"));
        }

        let arena = std::mem::take(&mut self.arena);
        let mut query = Query::new(QueryTag::Select, arena);
        query.select = select;
        query.from = from;
        query.where_clause = where_clause;
        query.group_by = group_by;
        query.order_by = order_by;
        query.limit = limit;
        query.request_all = request_all;
        Ok(query)
    }

    fn create_table_statement(&mut self) -> Result<Query> {
        self.expect_keyword("create")?;
        self.expect_keyword("table")?;
        let table_name = self.identifier()?;
        self.expect(TokenKind::LeftParen)?;
        let mut columns = Vec::new();
        loop {
            let name = self.identifier()?;
            let ty = self.type_name()?;
            columns.push(ColumnDef { name, ty });
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;

        let arena = std::mem::take(&mut self.arena);
        let mut query = Query::new(QueryTag::CreateTable, arena);
        query.table_name = table_name;
        query.columns = columns;
        Ok(query)
    }

    fn bulk_insert_statement(&mut self) -> Result<Query> {
        self.expect_keyword("bulk")?;
        self.expect_keyword("insert")?;
        let table_name = self.identifier()?;
        self.expect_keyword("from")?;
        let file = self.expect(TokenKind::StringConstant)?;

        let mut terminator = ',';
        if self.eat_keyword("with") {
            self.expect(TokenKind::LeftParen)?;
            self.expect_keyword("fieldterminator")?;
            self.expect(TokenKind::Eq)?;
            let term = self.expect(TokenKind::StringConstant)?;
            let mut chars = term.text.chars();
            terminator = chars.next().ok_or_else(|| FlounderError::syntax(""))?;
            if chars.next().is_some() {
                return Err(FlounderError::syntax(
                    "field terminators are single characters",
                ));
            }
            self.expect(TokenKind::RightParen)?;
        }

        let arena = std::mem::take(&mut self.arena);
        let mut query = Query::new(QueryTag::BulkInsert, arena);
        query.table_name = table_name;
        query.file_name = file.text;
        query.field_terminator = terminator;
        Ok(query)
    }

    fn type_name(&mut self) -> Result<SqlType> {
        let name = self.identifier()?;
        match name.as_str() {
            "int" | "integer" => Ok(SqlType::int()),
            "bigint" => Ok(SqlType::bigint()),
            "bool" | "boolean" => Ok(SqlType::bool()),
            "date" => Ok(SqlType::date()),
            "float" | "double" => Ok(SqlType::float()),
            "decimal" | "numeric" => {
                self.expect(TokenKind::LeftParen)?;
                let p = self.integer_parameter()?;
                self.expect(TokenKind::Comma)?;
                let s = self.integer_parameter()?;
                self.expect(TokenKind::RightParen)?;
                Ok(SqlType::decimal(p as u8, s as u8))
            }
            "char" => {
                self.expect(TokenKind::LeftParen)?;
                let n = self.integer_parameter()?;
                self.expect(TokenKind::RightParen)?;
                Ok(SqlType::char(n))
            }
            "varchar" => {
                self.expect(TokenKind::LeftParen)?;
                let n = self.integer_parameter()?;
                self.expect(TokenKind::RightParen)?;
                Ok(SqlType::varchar(n))
            }
            other => Err(FlounderError::UnsupportedType {
                detail: other.to_owned(),
            }),
        }
    }

    fn integer_parameter(&mut self) -> Result<usize> {
        let tok = self.expect(TokenKind::IntegerConstant)?;
        tok.text
            .parse()
            .map_err(|_| FlounderError::syntax(tok.text.clone()))
    }

    fn expression_list(&mut self) -> Result<Vec<ExprId>> {
        let mut list = vec![self.expression()?];
        while self.peek().kind == TokenKind::Comma {
            self.advance();
            list.push(self.expression()?);
        }
        Ok(list)
    }

    /// Expression entry point; also handles trailing `AS alias`.
    fn expression(&mut self) -> Result<ExprId> {
        let e = self.or_expression()?;
        if self.eat_keyword("as") {
            let alias = self.identifier()?;
            return Ok(self.arena.alias(&alias, e));
        }
        Ok(e)
    }

    fn or_expression(&mut self) -> Result<ExprId> {
        let mut left = self.and_expression()?;
        while self.eat_keyword("or") {
            let right = self.and_expression()?;
            left = self.arena.binary(ExprTag::Or, "or", left, right);
        }
        Ok(left)
    }

    fn and_expression(&mut self) -> Result<ExprId> {
        let mut left = self.comparison()?;
        while self.eat_keyword("and") {
            let right = self.comparison()?;
            left = self.arena.binary(ExprTag::And, "and", left, right);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<ExprId> {
        let left = self.additive()?;
        let (tag, symbol) = match self.peek().kind {
            TokenKind::Lt => (ExprTag::Lt, "<"),
            TokenKind::Le => (ExprTag::Le, "<="),
            TokenKind::Gt => (ExprTag::Gt, ">"),
            TokenKind::Ge => (ExprTag::Ge, ">="),
            TokenKind::Eq => (ExprTag::Eq, "="),
            TokenKind::Neq => (ExprTag::Neq, "<>"),
            TokenKind::Identifier if self.at_keyword("like") => {
                self.advance();
                let right = self.additive()?;
                return Ok(self.arena.binary(ExprTag::Like, "like", left, right));
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(self.arena.binary(tag, symbol, left, right))
    }

    fn additive(&mut self) -> Result<ExprId> {
        let mut left = self.multiplicative()?;
        loop {
            let tag = match self.peek().kind {
                TokenKind::Plus => ExprTag::Add,
                TokenKind::Minus => ExprTag::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            let symbol = if tag == ExprTag::Add { "+" } else { "-" };
            left = self.arena.binary(tag, symbol, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<ExprId> {
        let mut left = self.primary()?;
        loop {
            let tag = match self.peek().kind {
                TokenKind::Star => ExprTag::Mul,
                TokenKind::Slash => ExprTag::Div,
                _ => break,
            };
            self.advance();
            let right = self.primary()?;
            let symbol = if tag == ExprTag::Mul { "*" } else { "/" };
            left = self.arena.binary(tag, symbol, left, right);
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<ExprId> {
        match self.peek().kind {
            TokenKind::LeftParen => {
                self.advance();
                let e = self.expression()?;
                self.expect(TokenKind::RightParen)?;
                Ok(e)
            }
            TokenKind::IntegerConstant => {
                let tok = self.advance();
                self.arena.constant(&tok.text, TypeTag::Bigint)
            }
            TokenKind::DecimalConstant => {
                let tok = self.advance();
                self.arena.constant(&tok.text, TypeTag::Decimal)
            }
            TokenKind::Minus => {
                // negative numeric literal
                self.advance();
                let tok = self.advance();
                let text = format!("-{}", tok.text);
                match tok.kind {
                    TokenKind::IntegerConstant => self.arena.constant(&text, TypeTag::Bigint),
                    TokenKind::DecimalConstant => self.arena.constant(&text, TypeTag::Decimal),
                    _ => Err(FlounderError::syntax(tok.text)),
                }
            }
            TokenKind::StringConstant => {
                let tok = self.advance();
                if parse_date(&tok.text).is_some() {
                    self.arena.constant(&tok.text, TypeTag::Date)
                } else if tok.text.chars().count() == 1 {
                    self.arena.constant(&tok.text, TypeTag::Char)
                } else {
                    self.arena.constant(&tok.text, TypeTag::Varchar)
                }
            }
            TokenKind::Star => {
                self.advance();
                Ok(self.arena.star())
            }
            TokenKind::Identifier => self.identifier_expression(),
            _ => Err(FlounderError::syntax(self.peek().text.clone())),
        }
    }

    fn identifier_expression(&mut self) -> Result<ExprId> {
        if self.at_keyword("true") || self.at_keyword("false") {
            let tok = self.advance();
            return self.arena.constant(&tok.text.to_lowercase(), TypeTag::Bool);
        }
        if self.at_keyword("case") {
            return self.case_expression();
        }
        for (kw, tag) in [
            ("sum", ExprTag::Sum),
            ("count", ExprTag::Count),
            ("avg", ExprTag::Avg),
            ("min", ExprTag::Min),
            ("max", ExprTag::Max),
        ] {
            if self.at_keyword(kw) {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                let child = if self.peek().kind == TokenKind::Star {
                    self.advance();
                    self.arena.star()
                } else {
                    self.expression()?
                };
                self.expect(TokenKind::RightParen)?;
                return Ok(self.arena.unary(tag, kw, child));
            }
        }
        let name = self.identifier()?;
        Ok(self.arena.attr(&name))
    }

    fn case_expression(&mut self) -> Result<ExprId> {
        self.expect_keyword("case")?;
        let mut arms: Vec<ExprId> = Vec::new();
        while self.eat_keyword("when") {
            let when = self.expression()?;
            self.expect_keyword("then")?;
            let then = self.expression()?;
            arms.push(self.arena.when_then(when, then));
        }
        if arms.is_empty() {
            return Err(FlounderError::syntax("CASE without WHEN"));
        }
        if self.eat_keyword("else") {
            let els = self.expression()?;
            arms.push(els);
        }
        self.expect_keyword("end")?;
        // thread the arms as siblings
        for pair in arms.windows(2) {
            self.arena.node_mut(pair[0]).next = Some(pair[1]);
        }
        Ok(self.arena.case(arms[0]))
    }
}
