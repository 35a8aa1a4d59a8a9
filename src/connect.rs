// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Normalizes the three connection shapes into canonical equality
//! constraints between two qualified variables, and detects structural
//! conflicts at resolve time rather than leaving them to the backend.

use std::collections::{HashMap, HashSet};

use crate::common::{Ident, Result};
use crate::model::{Block, CompositeModule, ModuleRegistry};
use crate::model_err;
use crate::parser;
use crate::variable::{Port, VarKind};

/// A connection as authored, scoped to one composite's internal names.
#[derive(Clone, Debug)]
pub enum ConnectionSpec {
    /// `"a.b ~ c.d"`
    Text(String),
    /// Two explicit port handles.
    Ports(Port, Port),
    /// Default output of one local submodule to default input of another.
    DefaultPair(Ident, Ident),
}

impl ConnectionSpec {
    pub fn default_pair(src_local: &str, dst_local: &str) -> Self {
        ConnectionSpec::DefaultPair(
            crate::common::canonicalize(src_local),
            crate::common::canonicalize(dst_local),
        )
    }
}

/// The canonical form: exactly one equality between two qualified names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub source: Ident,
    pub dest: Ident,
}

pub(crate) struct ResolveScope<'a> {
    pub prefix: Option<&'a Ident>,
    pub composite: &'a CompositeModule,
    pub registry: &'a ModuleRegistry,
    /// Every qualified variable flattened so far, with its kind.
    pub vars: &'a HashMap<Ident, VarKind>,
}

impl ResolveScope<'_> {
    fn qualify(&self, local_path: &Ident) -> Ident {
        match self.prefix {
            Some(prefix) => Ident::join(prefix, local_path),
            None => local_path.clone(),
        }
    }

    fn lookup(&self, local_path: &Ident) -> Result<(Ident, VarKind)> {
        let qualified = self.qualify(local_path);
        match self.vars.get(&qualified) {
            Some(kind) => Ok((qualified, *kind)),
            None => model_err!(
                DoesNotExist,
                format!(
                    "connection endpoint {} in composite {}",
                    local_path.to_source_repr(),
                    self.composite.name()
                )
            ),
        }
    }

    fn default_port(&self, local: &Ident, want_input: bool) -> Result<Ident> {
        let Some(id) = self.composite.submodule(local.as_str()) else {
            return model_err!(
                DoesNotExist,
                format!("submodule {} in composite {}", local, self.composite.name())
            );
        };
        let block: &Block = self.registry.get(id);
        let port = if want_input {
            block.default_input()
        } else {
            block.default_output()
        };
        match port {
            Some(name) => Ok(Ident::join(local, name)),
            None => model_err!(
                DoesNotExist,
                format!(
                    "module {} declares no default {} port",
                    local,
                    if want_input { "input" } else { "output" }
                )
            ),
        }
    }
}

/// Resolve one spec into its canonical equality.
///
/// The driven end is the endpoint declared as an `Input` when exactly one
/// endpoint is; otherwise the right-hand side of the spec.
pub(crate) fn resolve(spec: &ConnectionSpec, scope: &ResolveScope) -> Result<Connection> {
    let (lhs_path, rhs_path) = match spec {
        ConnectionSpec::Text(text) => {
            let (a, b) = parser::parse_connection(text).map_err(|err| {
                crate::common::Error::new(
                    crate::common::ErrorKind::Model,
                    err.code,
                    Some(text.clone()),
                )
            })?;
            (a, b)
        }
        ConnectionSpec::Ports(a, b) => (a.path(), b.path()),
        ConnectionSpec::DefaultPair(src, dst) => (
            scope.default_port(src, false)?,
            scope.default_port(dst, true)?,
        ),
    };

    let (lhs, lhs_kind) = scope.lookup(&lhs_path)?;
    let (rhs, rhs_kind) = scope.lookup(&rhs_path)?;

    let lhs_is_input = lhs_kind == VarKind::Input;
    let rhs_is_input = rhs_kind == VarKind::Input;
    let (source, dest) = if lhs_is_input && !rhs_is_input {
        (rhs, lhs)
    } else {
        (lhs, rhs)
    };

    Ok(Connection { source, dest })
}

/// Tracks driven variables and connected pairs across the whole build.
///
/// Conflicts are a structural authoring error independent of the numeric
/// model, so they surface here and never reach the backend.
#[derive(Default)]
pub(crate) struct ConflictTable {
    driven: HashMap<Ident, Ident>,
    pairs: HashSet<(Ident, Ident)>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record(&mut self, conn: &Connection) -> Result<()> {
        let pair = if conn.source <= conn.dest {
            (conn.source.clone(), conn.dest.clone())
        } else {
            (conn.dest.clone(), conn.source.clone())
        };
        if !self.pairs.insert(pair) {
            return model_err!(
                OverConstrained,
                format!(
                    "{} and {} are already connected",
                    conn.source.to_source_repr(),
                    conn.dest.to_source_repr()
                )
            );
        }
        if let Some(prev) = self.driven.insert(conn.dest.clone(), conn.source.clone()) {
            return model_err!(
                OverConstrained,
                format!(
                    "{} is driven by both {} and {}",
                    conn.dest.to_source_repr(),
                    prev.to_source_repr(),
                    conn.source.to_source_repr()
                )
            );
        }
        Ok(())
    }
}
