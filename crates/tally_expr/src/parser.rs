use std::mem::discriminant;
use std::sync::Arc;

use crate::ast::{
    BinaryOp, BoolOp, CompareOp, Constant, ExceptHandler, Expr, FunctionDef, Param, Program, Stmt, UnaryOp,
};
use crate::diagnostics::SourceSpan;
use crate::errors::ExprError;
use crate::lexer::{Token, TokenKind, tokenize};

pub fn parse(src: &str) -> Result<Program, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser::new(tokens, src);
    parser.program()
}

type ExprResult = Result<Expr, ExprError>;

/// Deepest expression nesting accepted before parsing gives up.
pub const MAX_NESTING: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, src: &'a str) -> Self {
        Self {
            tokens,
            current: 0,
            depth: 0,
            src,
        }
    }

    fn program(&mut self) -> Result<Program, ExprError> {
        let mut body = Vec::new();
        while !self.is_at_end() {
            if self.match_token(&[TokenKind::Newline]) {
                continue;
            }
            body.extend(self.statement()?);
        }
        Ok(Program { body })
    }

    // Statements

    fn statement(&mut self) -> Result<Vec<Stmt>, ExprError> {
        let kind = self.peek().kind.clone();
        let stmt = match kind {
            TokenKind::If => {
                self.advance();
                self.if_chain()?
            }
            TokenKind::While => self.while_stmt()?,
            TokenKind::For => self.for_stmt()?,
            TokenKind::Def => self.def_stmt()?,
            TokenKind::Try => self.try_stmt()?,
            TokenKind::Indent => return Err(self.error_here("unexpected indent")),
            _ => return self.simple_statements(),
        };
        Ok(vec![stmt])
    }

    fn simple_statements(&mut self) -> Result<Vec<Stmt>, ExprError> {
        let mut out = vec![self.simple_statement()?];
        while self.match_token(&[TokenKind::Semicolon]) {
            if self.check(&TokenKind::Newline) || self.is_at_end() {
                break;
            }
            out.push(self.simple_statement()?);
        }
        if !self.match_token(&[TokenKind::Newline]) && !self.is_at_end() && !self.check(&TokenKind::Dedent) {
            let found = self.peek().kind.describe();
            return Err(self.error_here(format!("expected end of statement, found {}", found)));
        }
        Ok(out)
    }

    fn simple_statement(&mut self) -> Result<Stmt, ExprError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Pass => {
                self.advance();
                Ok(Stmt::Pass(token.span))
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break(token.span))
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.testlist()?)
                };
                let span = token.span.to(self.previous().span);
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Reserved(ref keyword) => Err(self.error_at(&token, format!("'{}' is not supported", keyword))),
            _ => self.expr_statement(),
        }
    }

    fn expr_statement(&mut self) -> Result<Stmt, ExprError> {
        let first = self.testlist()?;
        let start = first.span();

        if self.match_token(&[
            TokenKind::PlusAssign,
            TokenKind::MinusAssign,
            TokenKind::StarAssign,
            TokenKind::SlashAssign,
        ]) {
            let op = match self.previous().kind {
                TokenKind::PlusAssign => BinaryOp::Add,
                TokenKind::MinusAssign => BinaryOp::Sub,
                TokenKind::StarAssign => BinaryOp::Mul,
                _ => BinaryOp::Div,
            };
            self.check_target(&first)?;
            let value = self.testlist()?;
            let span = start.to(value.span());
            return Ok(Stmt::AugAssign {
                target: first,
                op,
                value,
                span,
            });
        }

        if self.check(&TokenKind::Assign) {
            let mut chain = vec![first];
            while self.match_token(&[TokenKind::Assign]) {
                chain.push(self.testlist()?);
            }
            let value = chain.pop().ok_or_else(|| self.error_here("expected a value"))?;
            for target in &chain {
                self.check_target(target)?;
            }
            let span = start.to(value.span());
            return Ok(Stmt::Assign {
                targets: chain,
                value,
                span,
            });
        }

        Ok(Stmt::Expr(first))
    }

    fn check_target(&self, target: &Expr) -> Result<(), ExprError> {
        match target {
            Expr::Name(..) | Expr::Subscript { .. } | Expr::Attribute { .. } => Ok(()),
            Expr::Tuple(_, span) => Err(ExprError::syntax(self.src, *span, "tuple unpacking is not supported")),
            other => Err(ExprError::syntax(self.src, other.span(), "cannot assign to expression")),
        }
    }

    /// Parses the remainder of an `if` or `elif` whose keyword was consumed.
    fn if_chain(&mut self) -> Result<Stmt, ExprError> {
        let start = self.previous().span;
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.match_token(&[TokenKind::Elif]) {
            vec![self.if_chain()?]
        } else if self.match_token(&[TokenKind::Else]) {
            self.block()?
        } else {
            Vec::new()
        };
        let span = start.to(test.span());
        Ok(Stmt::If {
            test,
            body,
            orelse,
            span,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, ExprError> {
        let start = self.advance().span;
        let test = self.test()?;
        let span = start.to(test.span());
        let body = self.block()?;
        Ok(Stmt::While { test, body, span })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ExprError> {
        let start = self.advance().span;
        let target = self.expect_name("expected a loop variable after 'for'")?;
        self.expect(&TokenKind::In, "expected 'in' after the loop variable")?;
        let iter = self.testlist()?;
        let span = start.to(iter.span());
        let body = self.block()?;
        Ok(Stmt::For {
            target,
            iter,
            body,
            span,
        })
    }

    fn def_stmt(&mut self) -> Result<Stmt, ExprError> {
        let start = self.advance().span;
        let name = self.expect_name("expected a function name after 'def'")?;
        self.expect(&TokenKind::LParen, "expected '(' after the function name")?;

        let mut params: Vec<Param> = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let param_token = self.peek().clone();
            let param = self.expect_name("expected a parameter name")?;
            let default = if self.match_token(&[TokenKind::Assign]) {
                Some(self.test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error_at(&param_token, "non-default parameter follows default parameter"));
            }
            if params.iter().any(|p| p.name == param) {
                return Err(self.error_at(&param_token, format!("duplicate parameter '{}'", param)));
            }
            params.push(Param { name: param, default });
            if !self.match_token(&[TokenKind::Comma]) {
                break;
            }
        }
        let close = self.expect(&TokenKind::RParen, "expected ')' after parameters")?;
        let span = start.to(close.span);
        let body = self.block()?;
        Ok(Stmt::FunctionDef(Arc::new(FunctionDef {
            name,
            params,
            body,
            span,
        })))
    }

    fn try_stmt(&mut self) -> Result<Stmt, ExprError> {
        let start = self.advance().span;
        let body = self.block()?;

        let mut handlers = Vec::new();
        while self.match_token(&[TokenKind::Except]) {
            let kind = match self.peek().kind.clone() {
                TokenKind::Name(n) => {
                    self.advance();
                    Some(n)
                }
                _ => None,
            };
            let alias = if self.match_token(&[TokenKind::As]) {
                Some(self.expect_name("expected a name after 'as'")?)
            } else {
                None
            };
            let body = self.block()?;
            handlers.push(ExceptHandler { kind, alias, body });
        }

        let orelse = if !handlers.is_empty() && self.match_token(&[TokenKind::Else]) {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.match_token(&[TokenKind::Finally]) {
            self.block()?
        } else {
            Vec::new()
        };

        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }

        Ok(Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
            span: start,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExprError> {
        self.expect(&TokenKind::Colon, "expected ':'")?;
        if !self.match_token(&[TokenKind::Newline]) {
            return self.simple_statements();
        }
        if !self.match_token(&[TokenKind::Indent]) {
            return Err(self.error_here("expected an indented block"));
        }
        let mut body = Vec::new();
        loop {
            if self.match_token(&[TokenKind::Dedent]) || self.is_at_end() {
                break;
            }
            if self.match_token(&[TokenKind::Newline]) {
                continue;
            }
            body.extend(self.statement()?);
        }
        Ok(body)
    }

    // Expressions

    fn testlist(&mut self) -> ExprResult {
        let first = self.test()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span();
        let mut items = vec![first];
        while self.match_token(&[TokenKind::Comma]) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.test()?);
        }
        let span = start.to(self.previous().span);
        Ok(Expr::Tuple(items, span))
    }

    fn test(&mut self) -> ExprResult {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here("expression is nested too deeply"));
        }
        self.depth += 1;
        let result = self.conditional();
        self.depth -= 1;
        result
    }

    fn conditional(&mut self) -> ExprResult {
        let body = self.or_test()?;
        if self.match_token(&[TokenKind::If]) {
            let test = self.or_test()?;
            self.expect(&TokenKind::Else, "expected 'else' in conditional expression")?;
            let orelse = self.test()?;
            let span = body.span().to(orelse.span());
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
                span,
            });
        }
        Ok(body)
    }

    fn or_test(&mut self) -> ExprResult {
        self.bool_level(TokenKind::Or, BoolOp::Or, Self::and_test)
    }

    fn and_test(&mut self) -> ExprResult {
        self.bool_level(TokenKind::And, BoolOp::And, Self::not_test)
    }

    fn bool_level(&mut self, token: TokenKind, op: BoolOp, next: fn(&mut Self) -> ExprResult) -> ExprResult {
        let first = next(self)?;
        if !self.check(&token) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.match_token(std::slice::from_ref(&token)) {
            values.push(next(self)?);
        }
        let span = values[0].span().to(self.previous().span);
        Ok(Expr::Bool { op, values, span })
    }

    fn not_test(&mut self) -> ExprResult {
        if self.match_token(&[TokenKind::Not]) {
            let start = self.previous().span;
            let operand = self.not_test()?;
            let span = start.to(operand.span());
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                span,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ExprResult {
        let left = self.bit_or()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.compare_op() {
            ops.push(op);
            comparators.push(self.bit_or()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let span = left.span().to(self.previous().span);
        Ok(Expr::Compare {
            left: Box::new(left),
            ops,
            comparators,
            span,
        })
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let kind = self.peek().kind.clone();
        let op = match kind {
            TokenKind::EqEq => CompareOp::Eq,
            TokenKind::NotEq => CompareOp::NotEq,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::LtE => CompareOp::LtE,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::GtE => CompareOp::GtE,
            TokenKind::In => CompareOp::In,
            TokenKind::Not if self.peek_next_is(&TokenKind::In) => {
                self.advance();
                CompareOp::NotIn
            }
            TokenKind::Is => {
                if self.peek_next_is(&TokenKind::Not) {
                    self.advance();
                    CompareOp::IsNot
                } else {
                    CompareOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn bit_or(&mut self) -> ExprResult {
        self.binary_level(&[(TokenKind::Pipe, BinaryOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> ExprResult {
        self.binary_level(&[(TokenKind::Caret, BinaryOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> ExprResult {
        self.binary_level(&[(TokenKind::Amp, BinaryOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> ExprResult {
        self.binary_level(
            &[(TokenKind::LShift, BinaryOp::LShift), (TokenKind::RShift, BinaryOp::RShift)],
            Self::arith,
        )
    }

    fn arith(&mut self) -> ExprResult {
        self.binary_level(
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
            Self::term,
        )
    }

    fn term(&mut self) -> ExprResult {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::DoubleSlash, BinaryOp::FloorDiv),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::factor,
        )
    }

    fn binary_level(&mut self, ops: &[(TokenKind, BinaryOp)], next: fn(&mut Self) -> ExprResult) -> ExprResult {
        let mut expr = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.match_token(std::slice::from_ref(kind)) {
                    let right = next(self)?;
                    let span = expr.span().to(right.span());
                    expr = Expr::Binary {
                        left: Box::new(expr),
                        op: *op,
                        right: Box::new(right),
                        span,
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(expr)
    }

    fn factor(&mut self) -> ExprResult {
        if self.match_token(&[TokenKind::Minus, TokenKind::Plus, TokenKind::Tilde]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::Minus => UnaryOp::Neg,
                TokenKind::Plus => UnaryOp::Pos,
                _ => UnaryOp::Invert,
            };
            if self.depth >= MAX_NESTING {
                return Err(self.error_at(&token, "expression is nested too deeply"));
            }
            self.depth += 1;
            let operand = self.factor();
            self.depth -= 1;
            let operand = operand?;
            let span = token.span.to(operand.span());
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            });
        }
        self.power()
    }

    fn power(&mut self) -> ExprResult {
        let base = self.postfix()?;
        if self.match_token(&[TokenKind::DoubleStar]) {
            let exponent = self.factor()?;
            let span = base.span().to(exponent.span());
            return Ok(Expr::Binary {
                left: Box::new(base),
                op: BinaryOp::Pow,
                right: Box::new(exponent),
                span,
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ExprResult {
        let mut expr = self.atom()?;
        loop {
            if self.match_token(&[TokenKind::LParen]) {
                expr = self.finish_call(expr)?;
            } else if self.match_token(&[TokenKind::LBracket]) {
                let index = self.subscript()?;
                let close = self.expect(&TokenKind::RBracket, "expected ']' after subscript")?;
                let span = expr.span().to(close.span);
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
            } else if self.match_token(&[TokenKind::Dot]) {
                let name_token = self.peek().clone();
                let attr = self.expect_name("expected an attribute name after '.'")?;
                let span = expr.span().to(name_token.span);
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                    span,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn finish_call(&mut self, func: Expr) -> ExprResult {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let is_keyword = matches!(self.peek().kind, TokenKind::Name(_)) && self.peek_next_is(&TokenKind::Assign);
            if is_keyword {
                let name_token = self.peek().clone();
                let name = self.expect_name("expected a keyword argument")?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error_at(&name_token, format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error_here("positional argument follows keyword argument"));
                }
                args.push(self.test()?);
            }
            if !self.match_token(&[TokenKind::Comma]) {
                break;
            }
        }
        let close = self.expect(&TokenKind::RParen, "expected ')' after function arguments")?;
        let span = func.span().to(close.span);
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
            span,
        })
    }

    fn subscript(&mut self) -> ExprResult {
        let start = self.peek().span;
        let lower = if self.check(&TokenKind::Colon) {
            None
        } else {
            let index = self.test()?;
            if !self.check(&TokenKind::Colon) {
                return Ok(index);
            }
            Some(Box::new(index))
        };
        self.expect(&TokenKind::Colon, "expected ':' in slice")?;
        let upper = if self.check(&TokenKind::Colon) || self.check(&TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.match_token(&[TokenKind::Colon]) && !self.check(&TokenKind::RBracket) {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        let span = start.to(self.previous().span);
        Ok(Expr::Slice {
            lower,
            upper,
            step,
            span,
        })
    }

    fn atom(&mut self) -> ExprResult {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(i) => {
                self.advance();
                Ok(Expr::Constant(Constant::Int(i), token.span))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::Constant(Constant::Float(f), token.span))
            }
            TokenKind::Str(s) => {
                self.advance();
                let mut text = s;
                let mut span = token.span;
                // Adjacent literals concatenate.
                while let TokenKind::Str(next) = &self.peek().kind {
                    text.push_str(next);
                    span = span.to(self.peek().span);
                    self.advance();
                }
                Ok(Expr::Constant(Constant::Str(text), span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Constant(Constant::Bool(true), token.span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Constant(Constant::Bool(false), token.span))
            }
            TokenKind::None => {
                self.advance();
                Ok(Expr::Constant(Constant::None, token.span))
            }
            TokenKind::Name(name) => {
                self.advance();
                Ok(Expr::Name(name, token.span))
            }
            TokenKind::LParen => {
                self.advance();
                if let Some(close) = self.match_close(&TokenKind::RParen) {
                    return Ok(Expr::Tuple(Vec::new(), token.span.to(close)));
                }
                let first = self.test()?;
                if !self.check(&TokenKind::Comma) {
                    self.expect(&TokenKind::RParen, "expected ')' after expression")?;
                    return Ok(first);
                }
                let items = self.sequence(first, &TokenKind::RParen)?;
                let close = self.expect(&TokenKind::RParen, "expected ')' after tuple")?;
                Ok(Expr::Tuple(items, token.span.to(close.span)))
            }
            TokenKind::LBracket => {
                self.advance();
                if let Some(close) = self.match_close(&TokenKind::RBracket) {
                    return Ok(Expr::List(Vec::new(), token.span.to(close)));
                }
                let first = self.test()?;
                let items = self.sequence(first, &TokenKind::RBracket)?;
                let close = self.expect(&TokenKind::RBracket, "expected ']' after list elements")?;
                Ok(Expr::List(items, token.span.to(close.span)))
            }
            TokenKind::LBrace => {
                self.advance();
                if let Some(close) = self.match_close(&TokenKind::RBrace) {
                    return Ok(Expr::Dict(Vec::new(), token.span.to(close)));
                }
                let first = self.test()?;
                if self.match_token(&[TokenKind::Colon]) {
                    let value = self.test()?;
                    let mut entries = vec![(first, value)];
                    while self.match_token(&[TokenKind::Comma]) {
                        if self.check(&TokenKind::RBrace) {
                            break;
                        }
                        let key = self.test()?;
                        self.expect(&TokenKind::Colon, "expected ':' after dictionary key")?;
                        entries.push((key, self.test()?));
                    }
                    let close = self.expect(&TokenKind::RBrace, "expected '}' after dictionary entries")?;
                    return Ok(Expr::Dict(entries, token.span.to(close.span)));
                }
                let items = self.sequence(first, &TokenKind::RBrace)?;
                let close = self.expect(&TokenKind::RBrace, "expected '}' after set elements")?;
                Ok(Expr::Set(items, token.span.to(close.span)))
            }
            TokenKind::Reserved(ref keyword) => Err(self.error_at(&token, format!("'{}' is not supported", keyword))),
            ref other => Err(self.error_at(&token, format!("expected expression, found {}", other.describe()))),
        }
    }

    /// Collects comma separated items after `first`, allowing a trailing comma before `close`.
    fn sequence(&mut self, first: Expr, close: &TokenKind) -> Result<Vec<Expr>, ExprError> {
        let mut items = vec![first];
        while self.match_token(&[TokenKind::Comma]) {
            if self.check(close) {
                break;
            }
            items.push(self.test()?);
        }
        Ok(items)
    }

    // Helpers

    fn match_close(&mut self, kind: &TokenKind) -> Option<SourceSpan> {
        if self.check(kind) {
            Some(self.advance().span)
        } else {
            None
        }
    }

    fn match_token(&mut self, kinds: &[TokenKind]) -> bool {
        for kind in kinds {
            if self.check(kind) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn check(&self, kind: &TokenKind) -> bool {
        discriminant(&self.peek().kind) == discriminant(kind)
    }

    fn peek_next_is(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.current + 1)
            .is_some_and(|t| discriminant(&t.kind) == discriminant(kind))
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Name(_)
                | TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::None
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Tilde
                | TokenKind::Not
        )
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Dedent | TokenKind::Eof
        )
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<Token, ExprError> {
        if self.check(kind) {
            return Ok(self.advance().clone());
        }
        let found = self.peek().kind.describe();
        Err(self.error_here(format!("{}, found {}", message, found)))
    }

    fn expect_name(&mut self, message: &str) -> Result<String, ExprError> {
        match self.peek().kind.clone() {
            TokenKind::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("{}, found {}", message, other.describe()))),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ExprError {
        let token = self.peek();
        ExprError::syntax(self.src, token.span, message)
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ExprError {
        ExprError::syntax(self.src, token.span, message)
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }
}
