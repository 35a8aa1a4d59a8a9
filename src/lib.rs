// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

#![forbid(unsafe_code)]

pub mod common;
pub mod datamodel;

mod ast;
mod token;
mod parser;

pub mod blocks;
pub mod json;

mod compiler;
mod connect;
mod events;
mod model;
mod probe;
mod results;
mod solver;
mod system;
mod variable;
mod vm;

pub use self::ast::{BinaryOp, Equation, Expr, Loc, UnaryOp};
pub use self::common::{Error, ErrorCode, ErrorKind, Ident, Result, canonicalize};
pub use self::compiler::{FlatModel, FlatVar, NameMap, Survival, flatten};
pub use self::connect::{Connection, ConnectionSpec};
pub use self::events::{
    ContinuousEvent, Direction, Event, IntegratorView, Patch, TimeEvent, at_time, when_condition,
};
pub use self::model::{Block, CompositeModule, Module, ModuleId, ModuleRegistry};
pub use self::probe::{
    DataProbe, ProbeReport, ProbeResolver, ProbeSeries, ResolveCtx, Resolution, ResolverStrategy,
};
pub use self::results::Results;
pub use self::solver::{Backend, Method, Overrides, ParamStore, PreparedModel, SimSpecs};
pub use self::system::{CompiledSystem, System};
pub use self::variable::{Port, PortDirection, VarKind, Variable};
pub use self::vm::Vm;
