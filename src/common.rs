// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

/// A canonicalized identifier.
///
/// Canonical form means:
/// - lowercase
/// - whitespace runs replaced with underscores
/// - module-path dots replaced with middle dots (·)
///
/// Storing the hierarchy separator as a middle dot keeps a composed path like
/// `plant·x1` distinct from any single-segment name a user could type.
/// `to_source_repr` converts back to the dotted form users write.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

pub const SEP: char = '·';

impl Ident {
    /// Create from a raw string, canonicalizing it.
    pub fn from_raw(s: &str) -> Self {
        canonicalize(s)
    }

    /// Create from an already-canonicalized string.
    ///
    /// Caller must guarantee the string is in canonical form.
    pub fn from_unchecked(s: String) -> Self {
        Ident(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Join a namespace prefix and a local name with the hierarchy separator.
    pub fn join(prefix: &Ident, name: &Ident) -> Self {
        Ident(format!("{}{}{}", prefix.0, SEP, name.0))
    }

    /// Convert back to the dotted form as written in source.
    pub fn to_source_repr(&self) -> String {
        self.0.replace(SEP, ".")
    }

    /// True if `suffix` matches a whole trailing path of this identifier:
    /// either the identifier equals `suffix`, or it ends with `·suffix`.
    pub fn has_path_suffix(&self, suffix: &Ident) -> bool {
        if self.0 == suffix.0 {
            return true;
        }
        match self.0.strip_suffix(suffix.as_str()) {
            Some(rest) => rest.ends_with(SEP),
            None => false,
        }
    }

    /// Split at the first separator: `a·b·c` -> (`a`, `b·c`).
    pub fn split_first(&self) -> Option<(Ident, Ident)> {
        self.0.find(SEP).map(|pos| {
            let before = Ident(self.0[..pos].to_string());
            let after = Ident(self.0[pos + SEP.len_utf8()..].to_string());
            (before, after)
        })
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Ident {
    fn borrow(&self) -> &str {
        &self.0
    }
}

pub fn canonicalize(name: &str) -> Ident {
    let name = name.trim();

    let mut out = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for c in name.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                out.push('_');
                in_whitespace = true;
            }
            continue;
        }
        in_whitespace = false;
        if c == '.' {
            out.push(SEP);
        } else {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
        }
    }

    Ident(out)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError, // will never be produced
    DoesNotExist,
    JsonDeserialization,
    InvalidToken,
    UnrecognizedEof,
    UnrecognizedToken,
    ExtraToken,
    ExpectedNumber,
    ExpectedIdent,
    EmptyEquation,
    UnknownBuiltin,
    BadBuiltinArgs,
    BadDerivativeTarget,
    DuplicateVariable,
    OverConstrained,
    CompositionCycle,
    UnresolvedInterface,
    UnresolvedProbe,
    BadEventCallback,
    BadPatchTarget,
    CircularDependency,
    UnknownDependency,
    NotSimulatable,
    BadSimSpecs,
    SolverFailure,
    NotCompiled,
    ModelFrozen,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            DoesNotExist => "does_not_exist",
            JsonDeserialization => "json_deserialization",
            InvalidToken => "invalid_token",
            UnrecognizedEof => "unrecognized_eof",
            UnrecognizedToken => "unrecognized_token",
            ExtraToken => "extra_token",
            ExpectedNumber => "expected_number",
            ExpectedIdent => "expected_ident",
            EmptyEquation => "empty_equation",
            UnknownBuiltin => "unknown_builtin",
            BadBuiltinArgs => "bad_builtin_args",
            BadDerivativeTarget => "bad_derivative_target",
            DuplicateVariable => "duplicate_variable",
            OverConstrained => "over_constrained",
            CompositionCycle => "composition_cycle",
            UnresolvedInterface => "unresolved_interface",
            UnresolvedProbe => "unresolved_probe",
            BadEventCallback => "bad_event_callback",
            BadPatchTarget => "bad_patch_target",
            CircularDependency => "circular_dependency",
            UnknownDependency => "unknown_dependency",
            NotSimulatable => "not_simulatable",
            BadSimSpecs => "bad_sim_specs",
            SolverFailure => "solver_failure",
            NotCompiled => "not_compiled",
            ModelFrozen => "model_frozen",
            Generic => "generic",
        };

        write!(f, "{name}")
    }
}

/// An error located within a single equation's source text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquationError {
    pub start: u16,
    pub end: u16,
    pub code: ErrorCode,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.code)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Model,
    Simulation,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }
}

impl From<EquationError> for Error {
    fn from(err: EquationError) -> Self {
        Error {
            kind: ErrorKind::Variable,
            code: err.code,
            details: Some(format!("{}:{}", err.start, err.end)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Model => "ModelError",
            ErrorKind::Simulation => "SimulationError",
            ErrorKind::Variable => "VariableError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
pub type EquationResult<T> = result::Result<T, EquationError>;

#[macro_export]
macro_rules! eqn_err(
    ($code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(EquationError{ start: $start as u16, end: $end as u16, code: ErrorCode::$code})
    }}
);

#[macro_export]
macro_rules! model_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Model,
            ErrorCode::$code,
            Some($str),
        ))
    }}
);

#[macro_export]
macro_rules! sim_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Simulation,
            ErrorCode::$code,
            Some($str),
        ))
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(ErrorKind::Simulation, ErrorCode::$code, None))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!("a·b", canonicalize("a.b").as_str());
        assert_eq!("hello_world", canonicalize("Hello World").as_str());
        assert_eq!("a_b", canonicalize("a \n b").as_str());
        assert_eq!("plant·x1", canonicalize("Plant.X1").as_str());
        assert_eq!("", canonicalize("   ").as_str());
    }

    #[test]
    fn test_source_repr_roundtrip() {
        let id = canonicalize("plant.motor.x");
        assert_eq!(id.as_str(), "plant·motor·x");
        assert_eq!(id.to_source_repr(), "plant.motor.x");
    }

    #[test]
    fn test_join_and_split() {
        let joined = Ident::join(&canonicalize("plant"), &canonicalize("x"));
        assert_eq!(joined.as_str(), "plant·x");

        let (head, rest) = canonicalize("a.b.c").split_first().unwrap();
        assert_eq!(head.as_str(), "a");
        assert_eq!(rest.as_str(), "b·c");
        assert!(canonicalize("solo").split_first().is_none());
    }

    #[test]
    fn test_path_suffix() {
        let id = canonicalize("outer.inner.x");
        assert!(id.has_path_suffix(&canonicalize("x")));
        assert!(id.has_path_suffix(&canonicalize("inner.x")));
        assert!(id.has_path_suffix(&canonicalize("outer.inner.x")));
        // "r.x" is not a whole trailing path of "outer·inner·x"
        assert!(!id.has_path_suffix(&canonicalize("r.x")));
    }

    #[test]
    fn test_error_display() {
        let err = Error::new(
            ErrorKind::Model,
            ErrorCode::OverConstrained,
            Some("plant·x".to_string()),
        );
        assert_eq!(format!("{err}"), "ModelError{over_constrained: plant·x}");
    }
}
