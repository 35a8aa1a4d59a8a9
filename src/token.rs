// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use unicode_xid::UnicodeXID;

use crate::common::{EquationError, EquationResult};
use crate::eqn_err;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Token<'input> {
    Ident(&'input str),
    Num(&'input str),
    Plus,
    Minus,
    Mul,
    Div,
    Exp,
    LParen,
    RParen,
    Comma,
    Tilde,
    Eq,
}

pub type Spanned<T> = (usize, T, usize);

/// Lexer for the equation mini-language.
///
/// Identifiers may contain dots: `plant.x1` is a single token, interpreted
/// later as a hierarchical path.
pub struct Lexer<'input> {
    text: &'input str,
    chars: std::iter::Peekable<std::str::CharIndices<'input>>,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || UnicodeXID::is_xid_start(c)
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c == '.' || UnicodeXID::is_xid_continue(c)
}

impl<'input> Lexer<'input> {
    pub fn new(text: &'input str) -> Self {
        Lexer {
            text,
            chars: text.char_indices().peekable(),
        }
    }

    fn bump_while(&mut self, pred: fn(char) -> bool) -> usize {
        let mut end = self.text.len();
        while let Some(&(i, c)) = self.chars.peek() {
            if pred(c) {
                self.chars.next();
            } else {
                end = i;
                break;
            }
        }
        end
    }

    fn ident(&mut self, start: usize) -> Spanned<Token<'input>> {
        let end = self.bump_while(is_ident_continue);
        (start, Token::Ident(&self.text[start..end]), end)
    }

    fn number(&mut self, start: usize) -> EquationResult<Spanned<Token<'input>>> {
        let mut end = self.bump_while(|c| c.is_ascii_digit() || c == '.');
        // exponent part, e.g. 1e-6
        if let Some(&(i, c)) = self.chars.peek() {
            if c == 'e' || c == 'E' {
                let mut lookahead = self.chars.clone();
                lookahead.next();
                let ok = match lookahead.peek() {
                    Some(&(_, c2)) if c2 == '+' || c2 == '-' => {
                        lookahead.next();
                        matches!(lookahead.peek(), Some(&(_, c3)) if c3.is_ascii_digit())
                    }
                    Some(&(_, c2)) => c2.is_ascii_digit(),
                    None => false,
                };
                if ok {
                    self.chars.next(); // e
                    if let Some(&(_, c2)) = self.chars.peek() {
                        if c2 == '+' || c2 == '-' {
                            self.chars.next();
                        }
                    }
                    end = self.bump_while(|c| c.is_ascii_digit());
                } else {
                    end = i;
                }
            }
        }
        let s = &self.text[start..end];
        if s.parse::<f64>().is_err() {
            return eqn_err!(ExpectedNumber, start, end);
        }
        Ok((start, Token::Num(s), end))
    }
}

impl<'input> Iterator for Lexer<'input> {
    type Item = EquationResult<Spanned<Token<'input>>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (i, c) = *self.chars.peek()?;
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            let simple = |tok| Some(Ok((i, tok, i + 1)));
            self.chars.next();
            return match c {
                '+' => simple(Token::Plus),
                '-' => simple(Token::Minus),
                '*' => simple(Token::Mul),
                '/' => simple(Token::Div),
                '^' => simple(Token::Exp),
                '(' => simple(Token::LParen),
                ')' => simple(Token::RParen),
                ',' => simple(Token::Comma),
                '~' => simple(Token::Tilde),
                '=' => simple(Token::Eq),
                c if is_ident_start(c) => Some(Ok(self.ident(i))),
                c if c.is_ascii_digit() || c == '.' => Some(self.number(i)),
                _ => Some(eqn_err!(InvalidToken, i, i + 1)),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Vec<Token<'_>> {
        Lexer::new(text)
            .map(|r| r.unwrap())
            .map(|(_, tok, _)| tok)
            .collect()
    }

    #[test]
    fn test_simple_equation() {
        use Token::*;
        assert_eq!(
            lex("D(x) ~ -a*x"),
            vec![
                Ident("D"),
                LParen,
                Ident("x"),
                RParen,
                Tilde,
                Minus,
                Ident("a"),
                Mul,
                Ident("x"),
            ]
        );
    }

    #[test]
    fn test_dotted_idents() {
        use Token::*;
        assert_eq!(
            lex("gain1.output ~ gain2.input"),
            vec![Ident("gain1.output"), Tilde, Ident("gain2.input")]
        );
    }

    #[test]
    fn test_numbers() {
        use Token::*;
        assert_eq!(
            lex("0.5 + 1e-6 - 2E+3"),
            vec![Num("0.5"), Plus, Num("1e-6"), Minus, Num("2E+3")]
        );
        // an 'e' not followed by digits is a separate identifier
        assert_eq!(lex("2 e"), vec![Num("2"), Ident("e")]);
    }

    #[test]
    fn test_invalid_token() {
        let mut lexer = Lexer::new("a ? b");
        assert!(lexer.next().unwrap().is_ok());
        let err = lexer.next().unwrap().unwrap_err();
        assert_eq!(err.start, 2);
    }
}
