//! Recursive-descent parser for the snippet language.

use std::sync::Arc;

use super::ast::{BinOp, Block, Expr, ExprKind, FnDef, Program, Stmt, StmtKind, UnaryOp};
use super::lexer::{tokenize, SyntaxError, Tok, Token};

/// Maximum nesting of blocks and sub-expressions.
pub const MAX_NESTING: usize = 128;

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

type PResult<T> = Result<T, SyntaxError>;

impl Parser {
    // ── Token helpers ───────────────────────────────────

    fn peek(&self) -> &Token {
        // `tokenize` always ends the stream with Eof, so the clamp is safe.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn nth(&self, n: usize) -> &Tok {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].tok
    }

    fn at(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.tok != Tok::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> PResult<Token> {
        if self.at(tok) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("`{}`", symbol(tok))))
        }
    }

    fn ident(&mut self, what: &str) -> PResult<String> {
        match self.peek().tok.clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(
            format!("expected {expected}, found {}", token.tok),
            token.line,
            token.column,
        )
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let token = self.peek();
            return Err(SyntaxError::new(
                format!("nesting deeper than {MAX_NESTING} levels"),
                token.line,
                token.column,
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ── Statements ──────────────────────────────────────

    fn program(mut self) -> PResult<Program> {
        let mut body = Vec::new();
        while !self.at(&Tok::Eof) {
            body.push(self.statement()?);
        }
        Ok(Program { body })
    }

    fn block(&mut self) -> PResult<Block> {
        self.expect(&Tok::LBrace)?;
        self.enter()?;
        let mut body = Vec::new();
        while !self.at(&Tok::RBrace) && !self.at(&Tok::Eof) {
            body.push(self.statement()?);
        }
        self.expect(&Tok::RBrace)?;
        self.leave();
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let line = self.peek().line;
        let kind = match self.peek().tok.clone() {
            Tok::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(&Tok::Assign)?;
                let value = self.expr()?;
                self.finish_statement()?;
                StmtKind::Let { name, value }
            }
            Tok::Fn => self.fn_def(line)?,
            Tok::If => self.if_stmt()?,
            Tok::While => {
                self.advance();
                let cond = self.expr()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            Tok::For => {
                self.advance();
                let var = self.ident("loop variable")?;
                self.expect(&Tok::In)?;
                let iter = self.expr()?;
                let body = self.block()?;
                StmtKind::For { var, iter, body }
            }
            Tok::Break => {
                self.advance();
                self.finish_statement()?;
                StmtKind::Break
            }
            Tok::Continue => {
                self.advance();
                self.finish_statement()?;
                StmtKind::Continue
            }
            Tok::Return => {
                self.advance();
                let value = if self.ends_statement() {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.finish_statement()?;
                StmtKind::Return(value)
            }
            Tok::Try => {
                self.advance();
                let body = self.block()?;
                self.expect(&Tok::Catch)?;
                let binding = match self.peek().tok.clone() {
                    Tok::Ident(name) => {
                        self.advance();
                        Some(name)
                    }
                    _ => None,
                };
                let handler = self.block()?;
                StmtKind::Try {
                    body,
                    binding,
                    handler,
                }
            }
            Tok::Import => {
                self.advance();
                let module = self.dotted_name()?;
                self.finish_statement()?;
                StmtKind::Import { module }
            }
            Tok::From => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect(&Tok::Import)?;
                if !self.eat(&Tok::Star) {
                    self.ident("imported name")?;
                    while self.eat(&Tok::Comma) {
                        self.ident("imported name")?;
                    }
                }
                self.finish_statement()?;
                StmtKind::Import { module }
            }
            _ => {
                let target = self.expr()?;
                let op = match self.peek().tok.clone() {
                    Tok::Assign => Some(None),
                    Tok::PlusEq => Some(Some(BinOp::Add)),
                    Tok::MinusEq => Some(Some(BinOp::Sub)),
                    Tok::StarEq => Some(Some(BinOp::Mul)),
                    Tok::SlashEq => Some(Some(BinOp::Div)),
                    _ => None,
                };
                let kind = match op {
                    Some(op) => {
                        if !matches!(
                            target.kind,
                            ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Field { .. }
                        ) {
                            let token = self.peek();
                            return Err(SyntaxError::new(
                                "invalid assignment target",
                                token.line,
                                token.column,
                            ));
                        }
                        self.advance();
                        let value = self.expr()?;
                        StmtKind::Assign { target, op, value }
                    }
                    None => StmtKind::Expr(target),
                };
                self.finish_statement()?;
                kind
            }
        };
        Ok(Stmt { kind, line })
    }

    fn ends_statement(&self) -> bool {
        let token = self.peek();
        token.newline_before || matches!(token.tok, Tok::Semi | Tok::RBrace | Tok::Eof)
    }

    /// Simple statements end at `;`, a line break, `}` or end of input.
    fn finish_statement(&mut self) -> PResult<()> {
        if self.eat(&Tok::Semi) || self.ends_statement() {
            Ok(())
        } else {
            Err(self.unexpected("end of statement"))
        }
    }

    fn fn_def(&mut self, line: u32) -> PResult<StmtKind> {
        self.advance();
        let name = self.ident("function name")?;
        self.expect(&Tok::LParen)?;
        let mut params: Vec<String> = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                let token = self.peek().clone();
                let param = self.ident("parameter name")?;
                if params.contains(&param) {
                    return Err(SyntaxError::new(
                        format!("duplicate parameter `{param}`"),
                        token.line,
                        token.column,
                    ));
                }
                params.push(param);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(&Tok::Comma)?;
            }
        }
        let body = self.block()?;
        Ok(StmtKind::FnDef(Arc::new(FnDef {
            name,
            params,
            body,
            line,
        })))
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut branches = vec![(self.expr()?, self.block()?)];
        let mut otherwise = None;
        while self.eat(&Tok::Else) {
            if self.eat(&Tok::If) {
                branches.push((self.expr()?, self.block()?));
            } else {
                otherwise = Some(self.block()?);
                break;
            }
        }
        Ok(StmtKind::If {
            branches,
            otherwise,
        })
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.ident("module name")?;
        while self.eat(&Tok::Dot) {
            name.push('.');
            name.push_str(&self.ident("module name")?);
        }
        Ok(name)
    }

    // ── Expressions ─────────────────────────────────────

    fn expr(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.or_expr();
        self.leave();
        expr
    }

    // Each operator of a left-associative chain nests the tree one level
    // deeper, so chains count against `MAX_NESTING` like brackets do.

    fn or_expr(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut lhs = self.and_expr()?;
        while matches!(self.peek().tok, Tok::Or | Tok::OrOr) {
            self.advance();
            self.enter()?;
            let rhs = self.and_expr()?;
            lhs = logical(false, lhs, rhs);
        }
        self.depth = depth;
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut lhs = self.not_expr()?;
        while matches!(self.peek().tok, Tok::And | Tok::AndAnd) {
            self.advance();
            self.enter()?;
            let rhs = self.not_expr()?;
            lhs = logical(true, lhs, rhs);
        }
        self.depth = depth;
        Ok(lhs)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.at(&Tok::Not) {
            let token = self.advance();
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(unary(UnaryOp::Not, operand?, &token));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().tok.clone() {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::Ne,
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                Tok::In => BinOp::In,
                Tok::Not if self.nth(1) == &Tok::In => {
                    self.advance();
                    BinOp::NotIn
                }
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = depth;
        Ok(lhs)
    }

    fn additive(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().tok.clone() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = depth;
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().tok.clone() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth = depth;
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().tok.clone() {
            Tok::Minus => UnaryOp::Neg,
            Tok::Bang => UnaryOp::Not,
            _ => return self.power(),
        };
        let token = self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(unary(op, operand?, &token))
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if !self.eat(&Tok::StarStar) {
            return Ok(base);
        }
        self.enter()?;
        // Right-associative, and binds tighter than a unary minus on its left.
        let exponent = self.unary();
        self.leave();
        Ok(binary(BinOp::Pow, base, exponent?))
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut expr = self.primary()?;
        loop {
            let token = self.peek().clone();
            match token.tok {
                // A call or index must start on the same line as its callee.
                Tok::LParen if !token.newline_before => {
                    self.advance();
                    self.enter()?;
                    let args = self.arguments()?;
                    let (line, column) = (expr.line, expr.column);
                    let kind = match expr.kind {
                        ExprKind::Field { object, name } => ExprKind::Method {
                            receiver: object,
                            name,
                            args,
                        },
                        other => ExprKind::Call {
                            callee: Box::new(Expr {
                                kind: other,
                                line,
                                column,
                            }),
                            args,
                        },
                    };
                    expr = Expr { kind, line, column };
                }
                Tok::LBracket if !token.newline_before => {
                    self.advance();
                    self.enter()?;
                    let index = self.expr()?;
                    self.expect(&Tok::RBracket)?;
                    let (line, column) = (expr.line, expr.column);
                    expr = Expr {
                        kind: ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                        column,
                    };
                }
                Tok::Dot => {
                    self.advance();
                    self.enter()?;
                    let name = self.ident("field name")?;
                    let (line, column) = (expr.line, expr.column);
                    expr = Expr {
                        kind: ExprKind::Field {
                            object: Box::new(expr),
                            name,
                        },
                        line,
                        column,
                    };
                }
                _ => break,
            }
        }
        self.depth = depth;
        Ok(expr)
    }

    /// Parses call arguments after the opening parenthesis.
    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.eat(&Tok::RParen) {
            args.push(self.expr()?);
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen)?;
                break;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let token = self.advance();
        let kind = match token.tok {
            Tok::Int(n) => ExprKind::Int(n),
            Tok::Float(n) => ExprKind::Float(n),
            Tok::Str(ref s) => ExprKind::Str(s.clone()),
            Tok::True => ExprKind::Bool(true),
            Tok::False => ExprKind::Bool(false),
            Tok::Null => ExprKind::Null,
            Tok::Ident(ref name) => ExprKind::Ident(name.clone()),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen)?;
                return Ok(inner);
            }
            Tok::LBracket => self.list_or_comprehension()?,
            Tok::LBrace => self.map_literal()?,
            ref other => {
                return Err(SyntaxError::new(
                    format!("expected expression, found {other}"),
                    token.line,
                    token.column,
                ))
            }
        };
        Ok(Expr {
            kind,
            line: token.line,
            column: token.column,
        })
    }

    fn list_or_comprehension(&mut self) -> PResult<ExprKind> {
        if self.eat(&Tok::RBracket) {
            return Ok(ExprKind::List(Vec::new()));
        }
        let first = self.expr()?;
        if self.eat(&Tok::For) {
            let var = self.ident("loop variable")?;
            self.expect(&Tok::In)?;
            let iter = self.expr()?;
            let cond = if self.eat(&Tok::If) {
                Some(Box::new(self.expr()?))
            } else {
                None
            };
            self.expect(&Tok::RBracket)?;
            return Ok(ExprKind::Comprehension {
                element: Box::new(first),
                var,
                iter: Box::new(iter),
                cond,
            });
        }

        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.at(&Tok::RBracket) {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect(&Tok::RBracket)?;
        Ok(ExprKind::List(items))
    }

    fn map_literal(&mut self) -> PResult<ExprKind> {
        let mut entries = Vec::new();
        while !self.eat(&Tok::RBrace) {
            let key = match self.peek().tok.clone() {
                Tok::Str(key) | Tok::Ident(key) => {
                    self.advance();
                    key
                }
                _ => return Err(self.unexpected("map key")),
            };
            self.expect(&Tok::Colon)?;
            entries.push((key, self.expr()?));
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RBrace)?;
                break;
            }
        }
        Ok(ExprKind::Map(entries))
    }
}

fn symbol(tok: &Tok) -> String {
    // `Tok`'s Display wraps punctuation in backticks already.
    tok.to_string().trim_matches('`').to_string()
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let (line, column) = (lhs.line, lhs.column);
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        line,
        column,
    }
}

fn logical(and: bool, lhs: Expr, rhs: Expr) -> Expr {
    let (line, column) = (lhs.line, lhs.column);
    Expr {
        kind: ExprKind::Logical {
            and,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        line,
        column,
    }
}

fn unary(op: UnaryOp, operand: Expr, token: &Token) -> Expr {
    Expr {
        kind: ExprKind::Unary {
            op,
            operand: Box::new(operand),
        },
        line: token.line,
        column: token.column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> ExprKind {
        let program = parse(source).unwrap();
        match program.body.into_iter().next().unwrap().kind {
            StmtKind::Expr(e) => e.kind,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    /// Strips positions so trees can be compared structurally.
    fn shape(kind: &ExprKind) -> String {
        match kind {
            ExprKind::Int(n) => n.to_string(),
            ExprKind::Ident(n) => n.clone(),
            ExprKind::Binary { op, lhs, rhs } => {
                format!("({} {} {})", shape(&lhs.kind), op.symbol(), shape(&rhs.kind))
            }
            ExprKind::Unary { op, operand } => format!("({op:?} {})", shape(&operand.kind)),
            ExprKind::Logical { and, lhs, rhs } => format!(
                "({} {} {})",
                shape(&lhs.kind),
                if *and { "and" } else { "or" },
                shape(&rhs.kind)
            ),
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(shape(&expr("1 + 2 * 3")), "(1 + (2 * 3))");
        assert_eq!(shape(&expr("(1 + 2) * 3")), "((1 + 2) * 3)");
        assert_eq!(shape(&expr("1 - 2 - 3")), "((1 - 2) - 3)");
    }

    #[test]
    fn test_power_is_right_associative_and_binds_tighter_than_neg() {
        assert_eq!(shape(&expr("2 ** 3 ** 2")), "(2 ** (3 ** 2))");
        assert_eq!(shape(&expr("-2 ** 2")), "(Neg (2 ** 2))");
    }

    #[test]
    fn test_logical_and_comparison() {
        assert_eq!(
            shape(&expr("a < 1 and b or not c")),
            "(((a < 1) and b) or (Not c))"
        );
        assert_eq!(shape(&expr("a not in b")), "(a not in b)");
        assert_eq!(shape(&expr("x && y || z")), "((x and y) or z)");
    }

    #[test]
    fn test_method_call_and_index_chain() {
        let kind = expr("svc.search('rust')[0].title");
        let ExprKind::Field { object, name } = kind else {
            panic!("expected field access");
        };
        assert_eq!(name, "title");
        let ExprKind::Index { object, index } = object.kind else {
            panic!("expected index");
        };
        assert_eq!(index.kind, ExprKind::Int(0));
        let ExprKind::Method { receiver, name, args } = object.kind else {
            panic!("expected method call");
        };
        assert_eq!(name, "search");
        assert_eq!(receiver.kind, ExprKind::Ident("svc".into()));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_call_does_not_continue_across_lines() {
        let program = parse("print(1)\n(2)").unwrap();
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn test_comprehension() {
        let kind = expr("[x * 2 for x in xs if x > 1]");
        let ExprKind::Comprehension { var, cond, .. } = kind else {
            panic!("expected comprehension");
        };
        assert_eq!(var, "x");
        assert!(cond.is_some());
    }

    #[test]
    fn test_map_literal_keys() {
        let kind = expr("{\"a\": 1, b: 2,}");
        let ExprKind::Map(entries) = kind else {
            panic!("expected map");
        };
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_statements() {
        let program = parse(
            "let total = 0\n\
             fn add(a, b) { return a + b }\n\
             for i in range(3) { total += add(i, 1) }\n\
             if total > 3 { print('big') } else if total > 1 { print('mid') } else { print('small') }\n\
             while false { break }\n\
             try { fail('x') } catch e { print(e.message) }\n\
             return total",
        )
        .unwrap();
        assert_eq!(program.body.len(), 7);
        assert!(matches!(program.body[1].kind, StmtKind::FnDef(ref f) if f.params == ["a", "b"]));
        assert!(matches!(
            program.body[2].kind,
            StmtKind::For { ref body, .. } if matches!(body[0].kind, StmtKind::Assign { op: Some(BinOp::Add), .. })
        ));
        assert!(matches!(program.body[3].kind, StmtKind::If { ref branches, otherwise: Some(_) } if branches.len() == 2));
        assert_eq!(program.body[6].line, 7);
        assert!(matches!(program.body[6].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn test_bare_return() {
        let program = parse("fn f() { return }").unwrap();
        let StmtKind::FnDef(ref f) = program.body[0].kind else {
            panic!("expected fn");
        };
        assert_eq!(f.body[0].kind, StmtKind::Return(None));
    }

    #[test]
    fn test_semicolons_are_optional() {
        assert_eq!(parse("let a = 1; let b = 2;").unwrap().body.len(), 2);
        assert_eq!(parse("let a = 1\nlet b = 2").unwrap().body.len(), 2);
    }

    #[test]
    fn test_imports_are_parsed() {
        let program = parse("import os.path\nfrom sys import argv, path").unwrap();
        assert_eq!(
            program.body[0].kind,
            StmtKind::Import {
                module: "os.path".into()
            }
        );
        assert_eq!(
            program.body[1].kind,
            StmtKind::Import {
                module: "sys".into()
            }
        );
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse("f() = 1").unwrap_err();
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn test_missing_statement_separator() {
        let err = parse("let a = 1 let b = 2").unwrap_err();
        assert!(err.message.contains("expected end of statement"));
        assert_eq!((err.line, err.column), (1, 11));
    }

    #[test]
    fn test_error_position() {
        let err = parse("let x = \n  )").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("expected expression"));
    }

    #[test]
    fn test_duplicate_parameters_rejected() {
        assert!(parse("fn f(a, a) {}").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 10), ")".repeat(MAX_NESTING + 10));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nesting deeper than"));

        let shallow = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn test_deep_unary_chain_is_bounded() {
        let source = format!("{}1", "-".repeat(MAX_NESTING * 2));
        assert!(parse(&source).is_err());
    }

    #[test]
    fn test_long_operator_chain_is_bounded() {
        for op in ["+", "*", "<", " and ", " or "] {
            let source = format!("return {}1", format!("1{op}").repeat(20_000));
            let err = parse(&source).unwrap_err();
            assert!(err.message.contains("nesting deeper than"), "{op}: {}", err.message);
        }
    }

    #[test]
    fn test_long_postfix_chain_is_bounded() {
        for step in [".a", "[0]", "()"] {
            let source = format!("x{}", step.repeat(20_000));
            let err = parse(&source).unwrap_err();
            assert!(err.message.contains("nesting deeper than"), "{step}: {}", err.message);
        }
    }

    #[test]
    fn test_chains_within_the_limit_still_parse() {
        let sum = format!("return {}1", "1 + ".repeat(MAX_NESTING / 2));
        assert!(parse(&sum).is_ok());
        let fields = format!("x{}", ".a".repeat(MAX_NESTING / 2));
        assert!(parse(&fields).is_ok());
        // Sequential statements do not accumulate depth.
        let many = "x = a + b * c\n".repeat(MAX_NESTING * 4);
        assert!(parse(&many).is_ok());
    }
}
