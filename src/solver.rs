// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The protocol between the modeling layer and a DAE-solving backend.
//!
//! A backend consumes the flattened model, reports what survived its
//! simplification pass, and integrates over a requested span while honoring
//! event breakpoints and zero-crossing watches. The crate ships one
//! reference backend (`vm`); anything matching these traits can stand in.

use std::collections::HashMap;

use crate::common::{Ident, Result};
use crate::compiler::FlatModel;
use crate::events::{Event, Patch};
use crate::results::Results;
use crate::sim_err;
use crate::variable::VarKind;

/// Solver-algorithm selector token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Euler,
    RungeKutta4,
    /// Request a stiffness-appropriate implicit method; backends without one
    /// fall back to their best explicit method and say so.
    Stiff,
}

#[derive(Clone, Debug)]
pub struct SimSpecs {
    pub start: f64,
    pub stop: f64,
    pub dt: f64,
    pub save_step: Option<f64>,
    pub method: Method,
}

impl SimSpecs {
    pub fn new(start: f64, stop: f64, dt: f64) -> Self {
        SimSpecs {
            start,
            stop,
            dt,
            save_step: None,
            method: Method::RungeKutta4,
        }
    }

    pub fn with_save_step(mut self, save_step: f64) -> Self {
        self.save_step = Some(save_step);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn save_step(&self) -> f64 {
        match self.save_step {
            Some(s) if s > self.dt => s,
            _ => self.dt,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stop <= self.start {
            return sim_err!(BadSimSpecs, "end time has to be after start time".to_string());
        }
        if !(self.dt > 0.0) {
            return sim_err!(BadSimSpecs, "dt must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Per-run overrides of initial conditions and parameter values, keyed by
/// dotted qualified name.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub initial: HashMap<String, f64>,
    pub params: HashMap<String, f64>,
}

impl Overrides {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_initial(mut self, name: &str, value: f64) -> Self {
        self.initial.insert(name.to_string(), value);
        self
    }

    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

pub struct SolveRequest<'a> {
    pub specs: &'a SimSpecs,
    pub overrides: &'a Overrides,
}

/// The live parameter store for one run.
///
/// Owned exclusively by the active integration; mutated only through event
/// patches applied between solver steps, never concurrently with a
/// right-hand-side evaluation.
#[derive(Clone, Debug)]
pub struct ParamStore {
    values: Vec<f64>,
    index: HashMap<Ident, usize>,
    kinds: HashMap<Ident, VarKind>,
}

impl ParamStore {
    pub fn new(flat: &FlatModel) -> Self {
        let mut values = Vec::new();
        let mut index = HashMap::new();
        let mut kinds = HashMap::new();
        for v in &flat.variables {
            kinds.insert(v.ident.clone(), v.kind);
            if v.kind == VarKind::Parameter {
                index.insert(v.ident.clone(), values.len());
                values.push(v.default);
            }
        }
        ParamStore {
            values,
            index,
            kinds,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &Ident) -> Option<f64> {
        self.index.get(name).map(|&i| self.values[i])
    }

    pub fn offset_of(&self, name: &Ident) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Overwrite one parameter; unknown names are an authoring error.
    pub fn set(&mut self, name: &Ident, value: f64) -> Result<()> {
        match self.index.get(name) {
            Some(&i) => {
                self.values[i] = value;
                Ok(())
            }
            None => sim_err!(
                DoesNotExist,
                format!("parameter {}", name.to_source_repr())
            ),
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn check_target(&self, patch: &Patch) -> Result<()> {
        match self.kinds.get(&patch.target) {
            Some(VarKind::Parameter) => Ok(()),
            Some(kind) => sim_err!(
                BadPatchTarget,
                format!(
                    "{} is a {:?}; events may only patch parameters",
                    patch.target.to_source_repr(),
                    kind
                )
            ),
            None => sim_err!(
                BadPatchTarget,
                format!("{} is not a known variable", patch.target.to_source_repr())
            ),
        }
    }

    /// Apply a patch list atomically: either every target validates and all
    /// writes land, or nothing changes.
    pub fn apply_patches(&mut self, patches: &[Patch]) -> Result<()> {
        for patch in patches {
            self.check_target(patch)?;
        }
        for patch in patches {
            let off = self.index[&patch.target];
            self.values[off] = patch.value;
        }
        Ok(())
    }
}

/// The simplification half of the backend contract.
pub trait Backend {
    /// Run structural simplification over the flat model, producing a
    /// runnable form that reports which names were retained as unknowns and
    /// which are observed (recoverable) expressions.
    fn prepare(&self, flat: &FlatModel) -> Result<Box<dyn PreparedModel>>;
}

/// The runnable half: an immutable, prepared model that can be solved any
/// number of times.
pub trait PreparedModel {
    /// Retained unknowns with their columns in the result matrix.
    fn retained(&self) -> &[(Ident, usize)];

    /// Names eliminated by simplification but recoverable from retained
    /// unknowns.
    fn observed(&self) -> &[Ident];

    /// Integrate over the requested span, honoring event breakpoints and
    /// zero-crossing watches.
    fn solve(&self, req: &SolveRequest, events: &mut [Event]) -> Result<Results>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ErrorCode, canonicalize};
    use crate::compiler::flatten;
    use crate::model::{CompositeModule, Module, ModuleRegistry};

    fn flat_gain() -> FlatModel {
        let mut m = Module::new("amp");
        m.declare_input("input", 0.0).unwrap();
        m.declare_output("output", 0.0).unwrap();
        m.declare_param("k", 2.0).unwrap();
        m.add_equation("output ~ k * input").unwrap();

        let mut reg = ModuleRegistry::new();
        let id = reg.register(m).unwrap();
        let mut root = CompositeModule::new("root");
        root.add_module("amp", id).unwrap();
        flatten(&reg, &root).unwrap()
    }

    #[test]
    fn test_specs_validation() {
        assert!(SimSpecs::new(0.0, 1.0, 0.1).validate().is_ok());
        let err = SimSpecs::new(1.0, 1.0, 0.1).validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::BadSimSpecs);
        let err = SimSpecs::new(0.0, 1.0, 0.0).validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::BadSimSpecs);
    }

    #[test]
    fn test_save_step_floor() {
        let specs = SimSpecs::new(0.0, 1.0, 0.1);
        assert_eq!(specs.save_step(), 0.1);
        let specs = specs.with_save_step(0.5);
        assert_eq!(specs.save_step(), 0.5);
        let specs = SimSpecs::new(0.0, 1.0, 0.1).with_save_step(0.01);
        assert_eq!(specs.save_step(), 0.1);
    }

    #[test]
    fn test_param_store_patches() {
        let flat = flat_gain();
        let mut store = ParamStore::new(&flat);
        let k = canonicalize("amp.k");
        assert_eq!(store.get(&k), Some(2.0));

        store.apply_patches(&[Patch::new("amp.k", 5.0)]).unwrap();
        assert_eq!(store.get(&k), Some(5.0));

        // patching a non-parameter is rejected, and the whole list rolls back
        let err = store
            .apply_patches(&[Patch::new("amp.k", 7.0), Patch::new("amp.output", 1.0)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPatchTarget);
        assert_eq!(store.get(&k), Some(5.0));

        let err = store
            .apply_patches(&[Patch::new("nosuch.name", 0.0)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPatchTarget);
    }
}
