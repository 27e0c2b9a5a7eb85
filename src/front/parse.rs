//! The parser

use std::fmt::Debug;

use derive_more::derive::Display;

use super::ast::*;
use super::lex::*;
use crate::common::Id;

#[derive(Display)]
#[display("Parse error: {}", self.0)]
pub struct ParseError(String);

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(input)
        .tokenize()
        .map_err(|e| ParseError(e.to_string()))?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<Token<'src>> {
        self.tokens.get(self.pos).copied()
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|t| t.kind == kind)
    }

    fn line(&self) -> u32 {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn bump(&mut self) -> Result<Token<'src>, ParseError> {
        let token = self
            .peek()
            .ok_or_else(|| ParseError("unexpected end of input".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, ParseError> {
        match self.peek() {
            Some(t) if t.kind == kind => {
                self.pos += 1;
                Ok(t)
            }
            Some(t) => Err(ParseError(format!(
                "line {}: expected '{}' but found {}",
                t.line, kind, t
            ))),
            None => Err(ParseError(format!(
                "expected '{}' but reached end of input",
                kind
            ))),
        }
    }

    fn ident(&mut self) -> Result<Id, ParseError> {
        let token = self.expect(TokenKind::Id)?;
        Ok(Id::from(token.text.to_string()))
    }

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut decls = vec![];
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Struct => decls.push(self.struct_decl()?),
                TokenKind::Fn => decls.push(self.fn_decl()?),
                _ => {
                    return Err(ParseError(format!(
                        "line {}: expected 'struct' or 'fn' but found {}",
                        token.line, token
                    )))
                }
            }
        }
        Ok(Program { decls })
    }

    fn struct_decl(&mut self) -> Result<Decl, ParseError> {
        let line = self.line();
        self.expect(TokenKind::Struct)?;
        let name = self.ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut fields = vec![];
        while !self.at(TokenKind::RBrace) {
            fields.push(self.param()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Decl::Struct(StructDecl { name, fields, line }))
    }

    fn fn_decl(&mut self) -> Result<Decl, ParseError> {
        let line = self.line();
        self.expect(TokenKind::Fn)?;
        let name = self.ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = vec![];
        while !self.at(TokenKind::RParen) {
            params.push(self.param()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Arrow)?;
        let ret_type = self.type_()?;
        let body = self.block()?;
        Ok(Decl::Func(FuncDecl {
            name,
            params,
            ret_type,
            body,
            line,
        }))
    }

    fn param(&mut self) -> Result<Param, ParseError> {
        let line = self.line();
        let name = self.ident()?;
        self.expect(TokenKind::Colon)?;
        let ty = self.type_()?;
        Ok(Param {
            name,
            ty,
            line,
            var_id: -1,
        })
    }

    fn type_(&mut self) -> Result<Type, ParseError> {
        if self.eat(TokenKind::Star) {
            Ok(Type::ptr_to(self.type_()?))
        } else {
            Ok(Type::Name(self.ident()?))
        }
    }

    /// `{ expr ; expr ; ... }` with an optional trailing semicolon.
    fn block(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut exprs = vec![];
        while !self.at(TokenKind::RBrace) {
            exprs.push(self.expr()?);
            if !self.eat(TokenKind::Semi) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(exprs)
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.peek().map(|t| t.kind) {
            Some(TokenKind::Let) => {
                self.bump()?;
                let name = self.ident()?;
                self.expect(TokenKind::Colon)?;
                let ty = self.type_()?;
                self.expect(TokenKind::Assign)?;
                let init = Box::new(self.expr()?);
                Ok(Expr::new(
                    ExprKind::Let {
                        name,
                        ty,
                        init,
                        var_id: -1,
                    },
                    line,
                ))
            }
            Some(TokenKind::Return) => {
                self.bump()?;
                // a return value is present unless the next token closes the
                // enclosing block or expression statement
                let arg = if self.at(TokenKind::Semi) || self.at(TokenKind::RBrace) {
                    None
                } else {
                    Some(Box::new(self.expr()?))
                };
                Ok(Expr::new(ExprKind::Return(arg), line))
            }
            Some(TokenKind::Break) => {
                self.bump()?;
                Ok(Expr::new(ExprKind::Break, line))
            }
            Some(TokenKind::Loop) => {
                self.bump()?;
                let body = self.block()?;
                Ok(Expr::new(ExprKind::Loop(body), line))
            }
            _ => self.binary(0),
        }
    }

    fn if_expr(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.expect(TokenKind::If)?;
        let cond = Box::new(self.binary(0)?);
        let cons = self.block()?;
        let alt = if self.eat(TokenKind::Else) {
            if self.at(TokenKind::If) {
                vec![self.if_expr()?]
            } else {
                self.block()?
            }
        } else {
            vec![Expr::new(ExprKind::Void, line)]
        };
        Ok(Expr::new(ExprKind::If { cond, cons, alt }, line))
    }

    /// Precedence-climbing loop over binary operators.
    fn binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while let Some(token) = self.peek() {
            let Some((prec, op)) = binop_prec(token.kind) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let line = token.line;
            self.bump()?;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::new(
                ExprKind::BinOp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            );
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.peek().map(|t| t.kind) {
            Some(TokenKind::Star) => {
                self.bump()?;
                let arg = self.unary()?;
                Ok(Expr::new(ExprKind::Deref(Box::new(arg)), line))
            }
            Some(TokenKind::Amp) => {
                self.bump()?;
                let arg = self.unary()?;
                Ok(Expr::new(ExprKind::AddrOf(Box::new(arg)), line))
            }
            Some(TokenKind::Minus) => {
                self.bump()?;
                let arg = self.unary()?;
                let zero = Expr::new(ExprKind::Int(0), line);
                Ok(Expr::new(
                    ExprKind::BinOp {
                        op: BinOp::Sub,
                        lhs: Box::new(zero),
                        rhs: Box::new(arg),
                    },
                    line,
                ))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        while self.at(TokenKind::Dot) {
            let line = self.line();
            self.bump()?;
            let field = self.ident()?;
            expr = Expr::new(
                ExprKind::Member {
                    obj: Box::new(expr),
                    field,
                },
                line,
            );
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self
            .peek()
            .ok_or_else(|| ParseError("unexpected end of input".to_string()))?;
        let line = token.line;
        match token.kind {
            TokenKind::Num => {
                self.bump()?;
                let value: i64 = token
                    .text
                    .parse()
                    .map_err(|_| ParseError(format!("line {line}: bad integer literal")))?;
                Ok(Expr::new(ExprKind::Int(value), line))
            }
            TokenKind::True => {
                self.bump()?;
                Ok(Expr::new(ExprKind::Bool(true), line))
            }
            TokenKind::False => {
                self.bump()?;
                Ok(Expr::new(ExprKind::Bool(false), line))
            }
            TokenKind::If => self.if_expr(),
            TokenKind::New => {
                self.bump()?;
                let struct_name = self.ident()?;
                let args = self.call_args()?;
                Ok(Expr::new(
                    ExprKind::New {
                        struct_name,
                        args,
                        defined_vars: vec![],
                    },
                    line,
                ))
            }
            TokenKind::Id => {
                let name = self.ident()?;
                if self.at(TokenKind::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::new(
                        ExprKind::Call {
                            func: name,
                            args,
                            defined_vars: vec![],
                        },
                        line,
                    ))
                } else {
                    Ok(Expr::new(ExprKind::Var { name, var_id: -1 }, line))
                }
            }
            TokenKind::LParen => {
                self.bump()?;
                let expr = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            _ => Err(ParseError(format!(
                "line {}: expected an expression but found {}",
                line, token
            ))),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = vec![];
        while !self.at(TokenKind::RParen) {
            args.push(self.expr()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }
}

fn binop_prec(kind: TokenKind) -> Option<(u8, BinOp)> {
    use TokenKind::*;
    Some(match kind {
        OrOr => (1, BinOp::LOr),
        AndAnd => (2, BinOp::LAnd),
        Pipe => (3, BinOp::BitOr),
        Caret => (4, BinOp::BitXor),
        Amp => (5, BinOp::BitAnd),
        Eq => (6, BinOp::Eq),
        Ne => (6, BinOp::Ne),
        Lt => (7, BinOp::Lt),
        Gt => (7, BinOp::Gt),
        Le => (7, BinOp::Le),
        Ge => (7, BinOp::Ge),
        Shl => (8, BinOp::LShift),
        Shr => (8, BinOp::RShift),
        Shrl => (8, BinOp::ARShift),
        Plus => (9, BinOp::Add),
        Minus => (9, BinOp::Sub),
        Star => (10, BinOp::Mul),
        Slash => (10, BinOp::Div),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_function() {
        let program = parse("fn id(x: int) -> int { x }").unwrap();
        assert_eq!(program.decls.len(), 1);
        let Decl::Func(f) = &program.decls[0] else {
            panic!("expected a function");
        };
        assert_eq!(f.name.as_ref(), "id");
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.body.len(), 1);
    }

    #[test]
    fn parses_struct_and_new() {
        let program = parse(
            "struct N { v: int, n: *N }\n\
             fn mk() -> *N { new N(1, new N(2, 0)) }",
        )
        .unwrap();
        assert_eq!(program.decls.len(), 2);
        let Decl::Func(f) = &program.decls[1] else {
            panic!("expected a function");
        };
        assert!(matches!(f.ret_type, Type::Ptr(_)));
        assert!(matches!(f.body[0].kind, ExprKind::New { .. }));
    }

    #[test]
    fn precedence_groups_comparison_over_logical() {
        // a < b && c < d parses as (a < b) && (c < d)
        let program = parse("fn f(a: int, b: int) -> bool { a < b && b < a }").unwrap();
        let Decl::Func(f) = &program.decls[0] else {
            panic!();
        };
        let ExprKind::BinOp { op, lhs, rhs } = &f.body[0].kind else {
            panic!("expected a binop");
        };
        assert_eq!(*op, BinOp::LAnd);
        assert!(matches!(
            lhs.kind,
            ExprKind::BinOp { op: BinOp::Lt, .. }
        ));
        assert!(matches!(
            rhs.kind,
            ExprKind::BinOp { op: BinOp::Lt, .. }
        ));
    }

    #[test]
    fn parses_loop_return_and_member() {
        let program = parse(
            "fn f(p: *P) -> int { loop { if (*p).a == 0 { break }; return (*p).b } ; 0 }",
        )
        .unwrap();
        let Decl::Func(f) = &program.decls[0] else {
            panic!();
        };
        assert_eq!(f.body.len(), 2);
        assert!(matches!(f.body[0].kind, ExprKind::Loop(_)));
    }

    #[test]
    fn missing_paren_is_an_error() {
        assert!(parse("fn f( -> int { 0 }").is_err());
    }
}
