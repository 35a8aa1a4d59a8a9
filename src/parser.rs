// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Hand-written recursive descent parser for the equation mini-language.
//!
//! Grammar, loosest first:
//!   equation   := expr ('~' | '=') expr
//!   expr       := additive
//!   additive   := multiplicative (('+' | '-') multiplicative)*
//!   multiplicative := unary (('*' | '/') unary)*
//!   unary      := '-' unary | '+' unary | exponent
//!   exponent   := atom ('^' unary)?
//!   atom       := NUM | IDENT | IDENT '(' expr (',' expr)* ')' | '(' expr ')'

use crate::ast::{BinaryOp, Equation, Expr, Loc, UnaryOp};
use crate::common::{EquationResult, Ident, canonicalize};
use crate::eqn_err;
use crate::token::{Lexer, Spanned, Token};

struct Parser<'input> {
    tokens: Vec<Spanned<Token<'input>>>,
    pos: usize,
}

impl<'input> Parser<'input> {
    fn new(text: &'input str) -> EquationResult<Self> {
        let mut tokens = Vec::new();
        for result in Lexer::new(text) {
            tokens.push(result?);
        }
        Ok(Parser { tokens, pos: 0 })
    }

    fn peek(&self) -> Option<&Spanned<Token<'input>>> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Spanned<Token<'input>>> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eof_position(&self) -> usize {
        self.tokens.last().map(|(_, _, end)| *end).unwrap_or(0)
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn parse_expr(&mut self) -> EquationResult<Expr> {
        self.parse_additive()
    }

    fn parse_additive(&mut self) -> EquationResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some((_, tok, _)) = self.peek() {
            let op = match tok {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            let loc = lhs.get_loc().union(&rhs.get_loc());
            lhs = Expr::Op2(op, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> EquationResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((_, tok, _)) = self.peek() {
            let op = match tok {
                Token::Mul => BinaryOp::Mul,
                Token::Div => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            let loc = lhs.get_loc().union(&rhs.get_loc());
            lhs = Expr::Op2(op, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> EquationResult<Expr> {
        match self.peek() {
            Some(&(start, Token::Minus, _)) => {
                self.advance();
                let operand = self.parse_unary()?;
                let loc = Loc::new(start, operand.get_loc().end as usize);
                Ok(Expr::Op1(UnaryOp::Negative, Box::new(operand), loc))
            }
            Some(&(_, Token::Plus, _)) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_exponent(),
        }
    }

    fn parse_exponent(&mut self) -> EquationResult<Expr> {
        let base = self.parse_atom()?;
        if let Some((_, Token::Exp, _)) = self.peek() {
            self.advance();
            // right-associative, and tighter than multiplication
            let power = self.parse_unary()?;
            let loc = base.get_loc().union(&power.get_loc());
            return Ok(Expr::Op2(
                BinaryOp::Exp,
                Box::new(base),
                Box::new(power),
                loc,
            ));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> EquationResult<Expr> {
        let Some(&(start, tok, end)) = self.peek() else {
            let pos = self.eof_position();
            return eqn_err!(UnrecognizedEof, pos, pos + 1);
        };
        self.advance();
        match tok {
            Token::Num(text) => {
                let n: f64 = match text.parse() {
                    Ok(n) => n,
                    Err(_) => return eqn_err!(ExpectedNumber, start, end),
                };
                Ok(Expr::Const(text.to_string(), n, Loc::new(start, end)))
            }
            Token::Ident(text) => {
                if let Some((_, Token::LParen, _)) = self.peek() {
                    self.advance();
                    let args = self.parse_args()?;
                    let close = match self.advance() {
                        Some(&(_, Token::RParen, close_end)) => close_end,
                        Some(&(s, _, e)) => return eqn_err!(UnrecognizedToken, s, e),
                        None => {
                            let pos = self.eof_position();
                            return eqn_err!(UnrecognizedEof, pos, pos + 1);
                        }
                    };
                    Ok(Expr::App(
                        canonicalize(text),
                        args,
                        Loc::new(start, close),
                    ))
                } else {
                    Ok(Expr::Var(canonicalize(text), Loc::new(start, end)))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(&(_, Token::RParen, _)) => Ok(inner),
                    Some(&(s, _, e)) => eqn_err!(UnrecognizedToken, s, e),
                    None => {
                        let pos = self.eof_position();
                        eqn_err!(UnrecognizedEof, pos, pos + 1)
                    }
                }
            }
            _ => eqn_err!(UnrecognizedToken, start, end),
        }
    }

    fn parse_args(&mut self) -> EquationResult<Vec<Expr>> {
        let mut args = Vec::new();
        if let Some((_, Token::RParen, _)) = self.peek() {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.peek() {
                Some((_, Token::Comma, _)) => {
                    self.advance();
                }
                _ => break,
            }
        }
        Ok(args)
    }

    fn expect_relation(&mut self) -> EquationResult<()> {
        match self.advance() {
            Some((_, Token::Tilde, _)) | Some((_, Token::Eq, _)) => Ok(()),
            Some(&(s, _, e)) => eqn_err!(UnrecognizedToken, s, e),
            None => {
                let pos = self.eof_position();
                eqn_err!(UnrecognizedEof, pos, pos + 1)
            }
        }
    }

    fn expect_end(&mut self) -> EquationResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(&(s, _, e)) => eqn_err!(ExtraToken, s, e),
        }
    }
}

fn is_derivative_app(func: &Ident) -> bool {
    matches!(func.as_str(), "d" | "der")
}

/// Parse `lhs ~ rhs` into its typed form.
///
/// `D(x) ~ rhs` (or `der(x)`) becomes a derivative equation; a bare variable
/// on the left becomes an algebraic definition; anything else is an implicit
/// constraint.
pub fn parse_equation(text: &str) -> EquationResult<Equation> {
    let mut parser = Parser::new(text)?;
    if parser.is_at_end() {
        return eqn_err!(EmptyEquation, 0, 0);
    }
    let lhs = parser.parse_expr()?;
    parser.expect_relation()?;
    let rhs = parser.parse_expr()?;
    parser.expect_end()?;

    let loc = lhs.get_loc().union(&rhs.get_loc());
    let eqn = match lhs {
        Expr::App(ref func, ref args, app_loc) if is_derivative_app(func) => {
            if args.len() != 1 {
                return eqn_err!(BadDerivativeTarget, app_loc.start, app_loc.end);
            }
            match &args[0] {
                Expr::Var(target, _) => Equation::Derivative(target.clone(), rhs, loc),
                other => {
                    let l = other.get_loc();
                    return eqn_err!(BadDerivativeTarget, l.start, l.end);
                }
            }
        }
        Expr::Var(target, _) => Equation::Definition(target, rhs, loc),
        lhs => Equation::Constraint(lhs, rhs, loc),
    };
    Ok(eqn)
}

/// Parse a textual connection spec, `"a.b ~ c.d"`, into its two endpoints.
pub fn parse_connection(text: &str) -> EquationResult<(Ident, Ident)> {
    let mut parser = Parser::new(text)?;
    if parser.is_at_end() {
        return eqn_err!(EmptyEquation, 0, 0);
    }
    let lhs = parser.parse_expr()?;
    parser.expect_relation()?;
    let rhs = parser.parse_expr()?;
    parser.expect_end()?;

    match (lhs, rhs) {
        (Expr::Var(a, _), Expr::Var(b, _)) => Ok((a, b)),
        (Expr::Var(_, _), other) | (other, _) => {
            let loc = other.get_loc();
            eqn_err!(ExpectedIdent, loc.start, loc.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOp::*;
    use crate::ast::Expr::*;
    use crate::common::ErrorCode;

    fn var(name: &str) -> Expr {
        Var(canonicalize(name), Loc::default())
    }

    fn num(text: &str) -> Expr {
        Const(text.to_string(), text.parse().unwrap(), Loc::default())
    }

    #[test]
    fn test_derivative_form() {
        let eqn = parse_equation("D(x) ~ -a * x").unwrap();
        match eqn {
            Equation::Derivative(target, rhs, _) => {
                assert_eq!(target.as_str(), "x");
                let expected = Op2(
                    Mul,
                    Box::new(Op1(
                        crate::ast::UnaryOp::Negative,
                        Box::new(var("a")),
                        Loc::default(),
                    )),
                    Box::new(var("x")),
                    Loc::default(),
                );
                assert_eq!(expected, rhs.strip_loc());
            }
            _ => panic!("expected derivative"),
        }
    }

    #[test]
    fn test_definition_form() {
        let eqn = parse_equation("output ~ k * input").unwrap();
        match eqn {
            Equation::Definition(target, _, _) => assert_eq!(target.as_str(), "output"),
            _ => panic!("expected definition"),
        }
    }

    #[test]
    fn test_constraint_form() {
        let eqn = parse_equation("0 ~ x + y").unwrap();
        assert!(matches!(eqn, Equation::Constraint(_, _, _)));
    }

    #[test]
    fn test_equals_accepted() {
        let eqn = parse_equation("y = 2 * u").unwrap();
        assert!(matches!(eqn, Equation::Definition(_, _, _)));
    }

    #[test]
    fn test_precedence() {
        let eqn = parse_equation("y ~ 1 + 2 * 3").unwrap();
        let Equation::Definition(_, rhs, _) = eqn else {
            panic!("expected definition");
        };
        let expected = Op2(
            Add,
            Box::new(num("1")),
            Box::new(Op2(
                Mul,
                Box::new(num("2")),
                Box::new(num("3")),
                Loc::default(),
            )),
            Loc::default(),
        );
        assert_eq!(expected, rhs.strip_loc());
    }

    #[test]
    fn test_exponent_right_assoc() {
        let eqn = parse_equation("y ~ 2 ^ 3 ^ 2").unwrap();
        let Equation::Definition(_, rhs, _) = eqn else {
            panic!("expected definition");
        };
        let expected = Op2(
            Exp,
            Box::new(num("2")),
            Box::new(Op2(
                Exp,
                Box::new(num("3")),
                Box::new(num("2")),
                Loc::default(),
            )),
            Loc::default(),
        );
        assert_eq!(expected, rhs.strip_loc());
    }

    #[test]
    fn test_function_application() {
        let eqn = parse_equation("y ~ tanh(10 * (x - 0.5))").unwrap();
        let Equation::Definition(_, rhs, _) = eqn else {
            panic!("expected definition");
        };
        assert!(matches!(rhs, App(ref f, ref args, _) if f.as_str() == "tanh" && args.len() == 1));
    }

    #[test]
    fn test_bad_derivative_target() {
        let err = parse_equation("D(x + y) ~ 0").unwrap_err();
        assert_eq!(err.code, ErrorCode::BadDerivativeTarget);
        let err = parse_equation("D(x, y) ~ 0").unwrap_err();
        assert_eq!(err.code, ErrorCode::BadDerivativeTarget);
    }

    #[test]
    fn test_parse_connection() {
        let (a, b) = parse_connection("gain1.output ~ gain2.input").unwrap();
        assert_eq!(a.as_str(), "gain1·output");
        assert_eq!(b.as_str(), "gain2·input");

        let err = parse_connection("gain1.output ~ 2 * x").unwrap_err();
        assert_eq!(err.code, ErrorCode::ExpectedIdent);
    }

    #[test]
    fn test_empty_equation() {
        let err = parse_equation("   ").unwrap_err();
        assert_eq!(err.code, ErrorCode::EmptyEquation);
    }

    #[test]
    fn test_extra_tokens() {
        let err = parse_equation("y ~ 1 2").unwrap_err();
        assert_eq!(err.code, ErrorCode::ExtraToken);
    }
}
