// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeSet;

use crate::common::Ident;

// equations are strings typed by humans for a single
// variable -- u16 is long enough
#[derive(PartialEq, Clone, Copy, Debug, Default)]
pub struct Loc {
    pub start: u16,
    pub end: u16,
}

impl Loc {
    pub fn new(start: usize, end: usize) -> Self {
        Loc {
            start: start as u16,
            end: end as u16,
        }
    }

    pub fn union(&self, rhs: &Self) -> Self {
        Loc {
            start: self.start.min(rhs.start),
            end: self.end.max(rhs.end),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum UnaryOp {
    Negative,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Exp,
}

// we use Boxes here because we may walk and rewrite ASTs a number of times,
// and we want to avoid copying and reallocating subexpressions all over
// the place.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr {
    Const(String, f64, Loc),
    Var(Ident, Loc),
    App(Ident, Vec<Expr>, Loc),
    Op1(UnaryOp, Box<Expr>, Loc),
    Op2(BinaryOp, Box<Expr>, Box<Expr>, Loc),
}

impl Expr {
    pub fn get_loc(&self) -> Loc {
        match self {
            Expr::Const(_, _, loc) => *loc,
            Expr::Var(_, loc) => *loc,
            Expr::App(_, _, loc) => *loc,
            Expr::Op1(_, _, loc) => *loc,
            Expr::Op2(_, _, _, loc) => *loc,
        }
    }

    #[cfg(test)]
    pub(crate) fn strip_loc(self) -> Self {
        let loc = Loc::default();
        match self {
            Expr::Const(s, n, _loc) => Expr::Const(s, n, loc),
            Expr::Var(v, _loc) => Expr::Var(v, loc),
            Expr::App(func, args, _loc) => Expr::App(
                func,
                args.into_iter().map(|arg| arg.strip_loc()).collect(),
                loc,
            ),
            Expr::Op1(op, r, _loc) => Expr::Op1(op, Box::new(r.strip_loc()), loc),
            Expr::Op2(op, l, r, _loc) => {
                Expr::Op2(op, Box::new(l.strip_loc()), Box::new(r.strip_loc()), loc)
            }
        }
    }

    /// The set of variable identifiers referenced by this expression.
    pub fn identifiers(&self, out: &mut BTreeSet<Ident>) {
        match self {
            Expr::Const(_, _, _) => {}
            Expr::Var(id, _) => {
                out.insert(id.clone());
            }
            Expr::App(_, args, _) => {
                for arg in args {
                    arg.identifiers(out);
                }
            }
            Expr::Op1(_, r, _) => r.identifiers(out),
            Expr::Op2(_, l, r, _) => {
                l.identifiers(out);
                r.identifiers(out);
            }
        }
    }

    /// Rewrite all variable references under a namespace prefix.
    ///
    /// `t` and `time` are reserved for the simulation clock and stay
    /// unqualified.
    pub fn qualified(&self, prefix: &Ident) -> Expr {
        match self {
            Expr::Const(s, n, loc) => Expr::Const(s.clone(), *n, *loc),
            Expr::Var(id, loc) if is_time_ident(id) => Expr::Var(id.clone(), *loc),
            Expr::Var(id, loc) => Expr::Var(Ident::join(prefix, id), *loc),
            Expr::App(func, args, loc) => Expr::App(
                func.clone(),
                args.iter().map(|arg| arg.qualified(prefix)).collect(),
                *loc,
            ),
            Expr::Op1(op, r, loc) => Expr::Op1(*op, Box::new(r.qualified(prefix)), *loc),
            Expr::Op2(op, l, r, loc) => Expr::Op2(
                *op,
                Box::new(l.qualified(prefix)),
                Box::new(r.qualified(prefix)),
                *loc,
            ),
        }
    }
}

/// A parsed equation.
///
/// `D(x) ~ rhs` integrates `x`; `x ~ rhs` defines `x` algebraically;
/// anything else (e.g. `0 ~ g(...)`) is an implicit constraint, carried for
/// backends that can handle it.
#[derive(PartialEq, Clone, Debug)]
pub enum Equation {
    Derivative(Ident, Expr, Loc),
    Definition(Ident, Expr, Loc),
    Constraint(Expr, Expr, Loc),
}

impl Equation {
    pub fn get_loc(&self) -> Loc {
        match self {
            Equation::Derivative(_, _, loc) => *loc,
            Equation::Definition(_, _, loc) => *loc,
            Equation::Constraint(_, _, loc) => *loc,
        }
    }

    /// All variable identifiers this equation mentions, targets included.
    pub fn identifiers(&self) -> BTreeSet<Ident> {
        let mut out = BTreeSet::new();
        match self {
            Equation::Derivative(target, rhs, _) | Equation::Definition(target, rhs, _) => {
                out.insert(target.clone());
                rhs.identifiers(&mut out);
            }
            Equation::Constraint(lhs, rhs, _) => {
                lhs.identifiers(&mut out);
                rhs.identifiers(&mut out);
            }
        }
        out
    }

    /// Rewrite the whole equation under a namespace prefix.
    pub fn qualified(&self, prefix: &Ident) -> Equation {
        match self {
            Equation::Derivative(target, rhs, loc) => {
                Equation::Derivative(Ident::join(prefix, target), rhs.qualified(prefix), *loc)
            }
            Equation::Definition(target, rhs, loc) => {
                Equation::Definition(Ident::join(prefix, target), rhs.qualified(prefix), *loc)
            }
            Equation::Constraint(lhs, rhs, loc) => {
                Equation::Constraint(lhs.qualified(prefix), rhs.qualified(prefix), *loc)
            }
        }
    }
}

/// True for the reserved simulation-clock identifiers.
pub fn is_time_ident(id: &Ident) -> bool {
    matches!(id.as_str(), "t" | "time")
}

pub fn pretty(expr: &Expr) -> String {
    match expr {
        Expr::Const(s, _, _) => s.clone(),
        Expr::Var(id, _) => id.to_source_repr(),
        Expr::App(func, args, _) => {
            let args: Vec<String> = args.iter().map(pretty).collect();
            format!("{}({})", func, args.join(", "))
        }
        Expr::Op1(UnaryOp::Negative, r, _) => format!("-{}", pretty(r)),
        Expr::Op2(op, l, r, _) => {
            let op = match op {
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Exp => "^",
            };
            format!("({} {} {})", pretty(l), op, pretty(r))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::canonicalize;

    #[test]
    fn test_loc_basics() {
        let a = Loc { start: 3, end: 7 };
        assert_eq!(a, Loc::new(3, 7));

        let b = Loc { start: 4, end: 11 };
        assert_eq!(Loc::new(3, 11), a.union(&b));
    }

    #[test]
    fn test_identifiers() {
        let expr = Expr::Op2(
            BinaryOp::Mul,
            Box::new(Expr::Var(canonicalize("k"), Loc::default())),
            Box::new(Expr::Var(canonicalize("x"), Loc::default())),
            Loc::default(),
        );
        let eqn = Equation::Derivative(canonicalize("x"), expr, Loc::default());
        let ids = eqn.identifiers();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("k"));
        assert!(ids.contains("x"));
    }

    #[test]
    fn test_qualified() {
        let eqn = Equation::Definition(
            canonicalize("output"),
            Expr::Var(canonicalize("input"), Loc::default()),
            Loc::default(),
        );
        let q = eqn.qualified(&canonicalize("amp"));
        match q {
            Equation::Definition(target, Expr::Var(rhs, _), _) => {
                assert_eq!(target.as_str(), "amp·output");
                assert_eq!(rhs.as_str(), "amp·input");
            }
            _ => panic!("expected definition"),
        }
    }

    #[test]
    fn test_pretty() {
        let expr = Expr::Op2(
            BinaryOp::Add,
            Box::new(Expr::Const("1".to_string(), 1.0, Loc::default())),
            Box::new(Expr::Op1(
                UnaryOp::Negative,
                Box::new(Expr::Var(canonicalize("a.b"), Loc::default())),
                Loc::default(),
            )),
            Loc::default(),
        );
        assert_eq!(pretty(&expr), "(1 + -a.b)");
    }
}
