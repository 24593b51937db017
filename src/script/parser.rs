//! Recursive-descent parser for the shell script subset

use super::ast::*;
use super::lexer::{Lexer, Spanned, Token};
use super::ScriptError;
use crate::native::NativeValue;

pub struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
    max_depth: usize,
}

/// Parse a fragment into a program
pub fn parse_program(source: &str, max_depth: usize) -> Result<Program, ScriptError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, position: 0, depth: 0, max_depth };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.parse_statement()?);
    }
    Ok(Program { body })
}

impl Parser {
    fn current(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.position + offset)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        self.position += 1;
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn check(&self, punct: &str) -> bool {
        matches!(self.current(), Token::Punct(p) if *p == punct)
    }

    fn check_word(&self, word: &str) -> bool {
        matches!(self.current(), Token::Ident(w) if w == word)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.check(punct) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &'static str) -> Result<(), ScriptError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", punct)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        let position = self.tokens.get(self.position).map(|s| s.pos).unwrap_or_default();
        let found = match self.current() {
            Token::Eof => "end of fragment".to_string(),
            Token::Punct(p) => format!("'{}'", p),
            Token::Ident(w) => format!("'{}'", w),
            other => format!("{:?}", other),
        };
        ScriptError::Syntax {
            position,
            message: format!("{}, found {}", message.into(), found),
        }
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ScriptError::DepthExceeded { limit: self.max_depth });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn identifier(&mut self) -> Result<String, ScriptError> {
        match self.current() {
            Token::Ident(name) => {
                let name = name.clone();
                self.position += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.enter()?;
        let stmt = self.parse_statement_inner();
        self.leave();
        stmt
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, ScriptError> {
        if self.eat(";") {
            return Ok(Stmt::Empty);
        }
        if self.check("{") && !self.object_ahead() {
            self.position += 1;
            let mut body = Vec::new();
            while !self.eat("}") {
                if self.at_eof() {
                    return Err(self.error("expected '}'"));
                }
                body.push(self.parse_statement()?);
            }
            return Ok(Stmt::Block(body));
        }

        if let Token::Ident(word) = self.current() {
            match word.as_str() {
                "var" | "let" | "const" => {
                    self.position += 1;
                    let decl = self.parse_declarations()?;
                    self.eat(";");
                    return Ok(decl);
                }
                "if" => {
                    self.position += 1;
                    self.expect("(")?;
                    let test = self.parse_expression()?;
                    self.expect(")")?;
                    let then = Box::new(self.parse_statement()?);
                    let otherwise = if self.check_word("else") {
                        self.position += 1;
                        Some(Box::new(self.parse_statement()?))
                    } else {
                        None
                    };
                    return Ok(Stmt::If { test, then, otherwise });
                }
                "while" => {
                    self.position += 1;
                    self.expect("(")?;
                    let test = self.parse_expression()?;
                    self.expect(")")?;
                    let body = Box::new(self.parse_statement()?);
                    return Ok(Stmt::While { test, body });
                }
                "for" => return self.parse_for(),
                "break" => {
                    self.position += 1;
                    self.eat(";");
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.position += 1;
                    self.eat(";");
                    return Ok(Stmt::Continue);
                }
                "function" | "return" | "class" | "try" | "throw" | "switch" | "do" => {
                    return Err(ScriptError::Unsupported(format!("'{}' statements", word)));
                }
                _ => {}
            }
        }

        let expr = self.parse_expression()?;
        if !self.eat(";") && !self.check("}") && !self.at_eof() {
            return Err(self.error("expected ';'"));
        }
        Ok(Stmt::Expr(expr))
    }

    /// `{` at statement start is an object literal when it reads `{}` or `{ key:`
    fn object_ahead(&self) -> bool {
        match self.peek(1) {
            Token::Punct("}") => true,
            Token::Ident(_) | Token::Str(_) | Token::Int(_) | Token::Float(_) => {
                matches!(self.peek(2), Token::Punct(":"))
            }
            _ => false,
        }
    }

    fn parse_declarations(&mut self) -> Result<Stmt, ScriptError> {
        let mut decls = Vec::new();
        loop {
            let name = self.identifier()?;
            let init = if self.eat("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            decls.push((name, init));
            if !self.eat(",") {
                return Ok(Stmt::Declare(decls));
            }
        }
    }

    fn parse_for(&mut self) -> Result<Stmt, ScriptError> {
        self.position += 1;
        self.expect("(")?;

        let init = if self.eat(";") {
            None
        } else {
            let init = if self.check_word("var") || self.check_word("let") || self.check_word("const") {
                self.position += 1;
                self.parse_declarations()?
            } else {
                Stmt::Expr(self.parse_expression()?)
            };
            self.expect(";")?;
            Some(Box::new(init))
        };
        let test = if self.check(";") { None } else { Some(self.parse_expression()?) };
        self.expect(";")?;
        let update = if self.check(")") { None } else { Some(self.parse_expression()?) };
        self.expect(")")?;
        let body = Box::new(self.parse_statement()?);

        Ok(Stmt::For { init, test, update, body })
    }

    // ========================================================================
    // Expressions, lowest precedence first
    // ========================================================================

    fn parse_expression(&mut self) -> Result<Expr, ScriptError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let result = self.parse_assignment_inner();
        self.leave();
        result
    }

    fn parse_assignment_inner(&mut self) -> Result<Expr, ScriptError> {
        let target = self.parse_conditional()?;
        let op = match self.current() {
            Token::Punct("=") => AssignOp::Set,
            Token::Punct("+=") => AssignOp::Add,
            Token::Punct("-=") => AssignOp::Sub,
            Token::Punct("*=") => AssignOp::Mul,
            Token::Punct("/=") => AssignOp::Div,
            _ => return Ok(target),
        };
        if !target.is_target() {
            return Err(self.error("invalid assignment target"));
        }
        self.position += 1;
        let value = self.parse_assignment()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    fn parse_conditional(&mut self) -> Result<Expr, ScriptError> {
        let test = self.parse_or()?;
        if !self.eat("?") {
            return Ok(test);
        }
        let then = self.parse_assignment()?;
        self.expect(":")?;
        let otherwise = self.parse_assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_equality()?;
        while self.eat("&&") {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, ScriptError>,
    ) -> Result<Expr, ScriptError> {
        let mut left = next(self)?;
        'outer: loop {
            for (punct, op) in ops {
                if self.eat(punct) {
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_equality(&mut self) -> Result<Expr, ScriptError> {
        self.parse_binary_level(
            &[
                ("===", BinOp::StrictEq),
                ("!==", BinOp::StrictNe),
                ("==", BinOp::LooseEq),
                ("!=", BinOp::LooseNe),
            ],
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, ScriptError> {
        self.parse_binary_level(
            &[("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        self.parse_binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        self.parse_binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.current() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            _ => None,
        };
        if let Some(op) = op {
            self.position += 1;
            self.enter()?;
            let operand = self.parse_unary();
            self.leave();
            return Ok(Expr::Unary { op, expr: Box::new(operand?) });
        }

        for (punct, delta) in [("++", 1i8), ("--", -1i8)] {
            if self.eat(punct) {
                let target = self.parse_postfix()?;
                if !target.is_target() {
                    return Err(self.error("invalid increment target"));
                }
                return Ok(Expr::Update { target: Box::new(target), delta, prefix: true });
            }
        }

        let expr = self.parse_postfix()?;
        for (punct, delta) in [("++", 1i8), ("--", -1i8)] {
            if expr.is_target() && self.eat(punct) {
                return Ok(Expr::Update { target: Box::new(expr), delta, prefix: false });
            }
        }
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(".") {
                let property = self.identifier()?;
                if self.check("(") {
                    let args = self.parse_arguments()?;
                    expr = Expr::MethodCall { object: Box::new(expr), method: property, args };
                } else {
                    expr = Expr::Member { object: Box::new(expr), property };
                }
            } else if self.eat("[") {
                let index = self.parse_expression()?;
                self.expect("]")?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index) };
            } else if self.check("(") {
                return Err(self.error("only built-in functions can be called"));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ScriptError> {
        self.expect("(")?;
        let mut args = Vec::new();
        while !self.eat(")") {
            args.push(self.parse_assignment()?);
            if !self.eat(",") {
                self.expect(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(
                i32::try_from(i).map(NativeValue::Int32).unwrap_or(NativeValue::Int64(i)),
            )),
            Token::Float(f) => Ok(Expr::Literal(NativeValue::Double(f))),
            Token::Str(s) => Ok(Expr::Literal(NativeValue::String(s))),
            Token::Regex { pattern, flags } => Ok(Expr::Regex { pattern, flags }),
            Token::Named(name) => Ok(Expr::Param(Placeholder::Named(name))),
            Token::Positional(index) => Ok(Expr::Param(Placeholder::Positional(index))),
            Token::Ident(word) => self.parse_word(word),
            Token::Punct("(") => {
                let expr = self.parse_expression()?;
                self.expect(")")?;
                Ok(expr)
            }
            Token::Punct("{") => self.parse_object(),
            Token::Punct("[") => {
                let mut items = Vec::new();
                while !self.eat("]") {
                    items.push(self.parse_assignment()?);
                    if !self.eat(",") {
                        self.expect("]")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Punct("?") => {
                self.position -= 1;
                Err(self.error("placeholders inside a fragment need an index, as in ?1"))
            }
            _ => {
                self.position -= 1;
                Err(self.error("expected expression"))
            }
        }
    }

    fn parse_word(&mut self, word: String) -> Result<Expr, ScriptError> {
        match word.as_str() {
            "true" => Ok(Expr::Literal(NativeValue::Bool(true))),
            "false" => Ok(Expr::Literal(NativeValue::Bool(false))),
            "null" => Ok(Expr::Literal(NativeValue::Null)),
            "undefined" => Ok(Expr::Literal(NativeValue::Undefined)),
            "NaN" => Ok(Expr::Literal(NativeValue::Double(f64::NAN))),
            "Infinity" => Ok(Expr::Literal(NativeValue::Double(f64::INFINITY))),
            "new" => {
                let callee = self.identifier()?;
                let args = if self.check("(") { self.parse_arguments()? } else { Vec::new() };
                Ok(Expr::Call { callee, args })
            }
            _ if self.check("(") => {
                let args = self.parse_arguments()?;
                Ok(Expr::Call { callee: word, args })
            }
            _ => Ok(Expr::Ident(word)),
        }
    }

    fn parse_object(&mut self) -> Result<Expr, ScriptError> {
        let mut entries = Vec::new();
        while !self.eat("}") {
            let key = match self.advance() {
                Token::Ident(name) | Token::Str(name) => name,
                Token::Int(i) => i.to_string(),
                Token::Float(f) => f.to_string(),
                _ => {
                    self.position -= 1;
                    return Err(self.error("expected property name"));
                }
            };
            self.expect(":")?;
            let value = self.parse_assignment()?;
            entries.push((key, value));
            if !self.eat(",") {
                self.expect("}")?;
                break;
            }
        }
        Ok(Expr::Object(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_program(src, 64).unwrap()
    }

    #[test]
    fn test_leading_brace_is_object() {
        let program = parse("{ age: { $gt: 30 } }");
        assert!(matches!(program.body[0], Stmt::Expr(Expr::Object(_))));

        let program = parse("{}");
        assert!(matches!(program.body[0], Stmt::Expr(Expr::Object(ref e)) if e.is_empty()));
    }

    #[test]
    fn test_leading_brace_is_block() {
        let program = parse("{ x = 1; }");
        assert!(matches!(program.body[0], Stmt::Block(_)));
    }

    #[test]
    fn test_statements() {
        let program = parse("var n = 0; for (let i = 0; i < 3; i++) { n += i } if (n > 2) n; else 0");
        assert_eq!(program.body.len(), 3);
        assert!(matches!(program.body[1], Stmt::For { .. }));
        assert!(matches!(program.body[2], Stmt::If { otherwise: Some(_), .. }));
    }

    #[test]
    fn test_constructor_calls() {
        let program = parse("new Date('2024-01-02'); ObjectId()");
        assert!(matches!(&program.body[0], Stmt::Expr(Expr::Call { callee, .. }) if callee == "Date"));
        assert!(matches!(&program.body[1], Stmt::Expr(Expr::Call { args, .. }) if args.is_empty()));
    }

    #[test]
    fn test_precedence() {
        let program = parse("1 + 2 * 3 > 6 && true");
        match &program.body[0] {
            Stmt::Expr(Expr::And(left, _)) => {
                assert!(matches!(**left, Expr::Binary { op: BinOp::Gt, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_question_mark_rejected() {
        let err = parse_program("{ a: ? }", 64).unwrap_err();
        assert!(err.to_string().contains("?1"));
    }

    #[test]
    fn test_unsupported_statement() {
        assert!(matches!(
            parse_program("function f() {}", 64),
            Err(ScriptError::Unsupported(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "[".repeat(100), "]".repeat(100));
        assert!(matches!(
            parse_program(&deep, 32),
            Err(ScriptError::DepthExceeded { limit: 32 })
        ));
    }
}
