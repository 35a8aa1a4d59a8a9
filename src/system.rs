// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The top-level build orchestrator.
//!
//! A `System` owns the registry arena, a root composite, and the registered
//! events. `compile()` flattens the composition graph, hands the equation
//! set to the backend's simplification pass, and retains the name-survival
//! map. The graph is mutable only until then; afterwards it is frozen and
//! `run()` may be called any number of times against the shared compiled
//! snapshot.

use std::rc::Rc;

use log::debug;

use crate::common::{Ident, Result, canonicalize};
use crate::compiler::{self, FlatModel, NameMap};
use crate::connect::ConnectionSpec;
use crate::datamodel;
use crate::events::Event;
use crate::model::{CompositeModule, Module, ModuleId, ModuleRegistry};
use crate::model_err;
use crate::probe::{DataProbe, ProbeReport, ProbeResolver};
use crate::results::Results;
use crate::solver::{Backend, Overrides, PreparedModel, SimSpecs, SolveRequest};
use crate::variable::Port;
use crate::vm::Vm;

/// The frozen, flattened model plus everything needed to answer questions
/// about it after the backend's simplification.
pub struct CompiledSystem {
    pub flat: FlatModel,
    pub names: NameMap,
    pub(crate) prepared: Box<dyn PreparedModel>,
}

impl std::fmt::Debug for CompiledSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSystem")
            .field("name", &self.flat.name)
            .field("variables", &self.flat.variables.len())
            .field("equations", &self.flat.equations.len())
            .finish_non_exhaustive()
    }
}

impl CompiledSystem {
    pub fn retained(&self) -> &[(Ident, usize)] {
        self.prepared.retained()
    }

    pub fn observed(&self) -> &[Ident] {
        self.prepared.observed()
    }
}

pub struct System {
    name: Ident,
    registry: ModuleRegistry,
    root: CompositeModule,
    events: Vec<Event>,
    backend: Box<dyn Backend>,
    compiled: Option<Rc<CompiledSystem>>,
}

impl System {
    pub fn new(name: &str) -> Self {
        System {
            name: canonicalize(name),
            registry: ModuleRegistry::new(),
            root: CompositeModule::new(name),
            events: Vec::new(),
            backend: Box::new(Vm),
            compiled: None,
        }
    }

    /// Swap in a different solving backend. Only meaningful before
    /// `compile()`.
    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    fn check_mutable(&self) -> Result<()> {
        if self.compiled.is_some() {
            return model_err!(
                ModelFrozen,
                format!("system {} was already compiled", self.name)
            );
        }
        Ok(())
    }

    /// Register a leaf module in the arena without adding it to the root.
    pub fn register(&mut self, module: Module) -> Result<ModuleId> {
        self.check_mutable()?;
        self.registry.register(module)
    }

    /// Register a composite in the arena without adding it to the root.
    pub fn register_composite(&mut self, composite: CompositeModule) -> Result<ModuleId> {
        self.check_mutable()?;
        self.registry.register_composite(composite)
    }

    /// Register a pure-data block definition (and its nested children).
    pub fn register_datamodel(&mut self, def: &datamodel::BlockDef) -> Result<ModuleId> {
        self.check_mutable()?;
        self.registry.register_datamodel(def)
    }

    /// Add a registered block to the root namespace under its own name.
    pub fn add_module(&mut self, id: ModuleId) -> Result<()> {
        self.check_mutable()?;
        let local = self.registry.get(id).name().clone();
        self.root.add_module(local.as_str(), id)
    }

    /// Register a leaf module and add it to the root in one step.
    pub fn add(&mut self, module: Module) -> Result<ModuleId> {
        let id = self.register(module)?;
        self.add_module(id)?;
        Ok(id)
    }

    /// Register a composite and add it to the root in one step.
    pub fn add_composite(&mut self, composite: CompositeModule) -> Result<ModuleId> {
        let id = self.register_composite(composite)?;
        self.add_module(id)?;
        Ok(id)
    }

    /// Connect two variables by textual spec, `"a.b ~ c.d"`.
    pub fn connect(&mut self, text: &str) -> Result<()> {
        self.check_mutable()?;
        self.root.connect(text)
    }

    /// Connect two explicit port handles.
    pub fn connect_ports(&mut self, source: Port, dest: Port) -> Result<()> {
        self.check_mutable()?;
        self.root.add_connection(ConnectionSpec::Ports(source, dest))
    }

    /// Connect the default output of `src` to the default input of `dst`.
    pub fn connect_default(&mut self, src: &str, dst: &str) -> Result<()> {
        self.check_mutable()?;
        self.root
            .add_connection(ConnectionSpec::default_pair(src, dst))
    }

    /// Chain blocks through their default ports, pairwise.
    pub fn chain(&mut self, names: &[&str]) -> Result<()> {
        for pair in names.windows(2) {
            self.connect_default(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Register an event; events are part of the graph and freeze with it.
    pub fn add_event(&mut self, event: Event) -> Result<()> {
        self.check_mutable()?;
        self.events.push(event);
        Ok(())
    }

    /// Flatten, simplify, and freeze.
    ///
    /// The name-survival map is built over the full pre-simplification name
    /// set, then updated with the retained/observed sets the backend
    /// reports, so eliminations and renames stay answerable afterwards.
    pub fn compile(&mut self) -> Result<Rc<CompiledSystem>> {
        if let Some(compiled) = &self.compiled {
            return Ok(Rc::clone(compiled));
        }

        debug!("compiling system {}", self.name);
        let flat = compiler::flatten(&self.registry, &self.root)?;
        let mut names = NameMap::from_flat(&flat);

        let prepared = self.backend.prepare(&flat)?;
        for (ident, column) in prepared.retained() {
            names.record_retained(ident, *column);
        }
        for ident in prepared.observed() {
            names.record_observed(ident);
        }

        let compiled = Rc::new(CompiledSystem {
            flat,
            names,
            prepared,
        });
        self.compiled = Some(Rc::clone(&compiled));
        Ok(compiled)
    }

    pub fn compiled(&self) -> Option<Rc<CompiledSystem>> {
        self.compiled.as_ref().map(Rc::clone)
    }

    /// Solve over the requested span with default initial conditions and
    /// parameters.
    pub fn run(&mut self, specs: &SimSpecs) -> Result<Results> {
        self.run_with_overrides(specs, &Overrides::default())
    }

    pub fn run_with_overrides(
        &mut self,
        specs: &SimSpecs,
        overrides: &Overrides,
    ) -> Result<Results> {
        let Some(compiled) = self.compiled.as_ref().map(Rc::clone) else {
            return model_err!(
                NotCompiled,
                format!("system {}: call compile() before run()", self.name)
            );
        };
        let req = SolveRequest { specs, overrides };
        compiled.prepared.solve(&req, &mut self.events)
    }

    /// Solve, then resolve the given probes against the trajectory.
    pub fn run_with_probes(
        &mut self,
        specs: &SimSpecs,
        overrides: &Overrides,
        probes: &[DataProbe],
    ) -> Result<(Results, Vec<ProbeReport>)> {
        let Some(compiled) = self.compiled.as_ref().map(Rc::clone) else {
            return model_err!(
                NotCompiled,
                format!("system {}: call compile() before run()", self.name)
            );
        };
        let results = self.run_with_overrides(specs, overrides)?;
        let resolver = ProbeResolver::new();
        let reports = probes
            .iter()
            .map(|probe| resolver.resolve_probe(probe, &results, &compiled.names))
            .collect();
        Ok((results, reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorCode;
    use crate::compiler::Survival;
    use crate::events::at_time;

    fn source_module(name: &str, value: f64) -> Module {
        let mut m = Module::new(name);
        m.declare_param("value", value).unwrap();
        m.declare_output("signal", 0.0).unwrap();
        m.add_equation("signal ~ value").unwrap();
        m.set_default_output("signal").unwrap();
        m
    }

    fn integrator_module(name: &str, x0: f64) -> Module {
        let mut m = Module::new(name);
        m.declare_state("x", x0).unwrap();
        m.declare_input("input", 0.0).unwrap();
        m.add_equation("D(x) ~ input").unwrap();
        m.set_default_input("input").unwrap();
        m.set_default_output("x").unwrap();
        m
    }

    #[test]
    fn test_lifecycle() {
        let mut sys = System::new("lifecycle");
        sys.add(source_module("src", 1.0)).unwrap();
        sys.add(integrator_module("intg", 0.0)).unwrap();
        sys.connect("src.signal ~ intg.input").unwrap();

        // running before compiling is an error
        let err = sys.run(&SimSpecs::new(0.0, 1.0, 0.1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotCompiled);

        let first = sys.compile().unwrap();
        let second = sys.compile().unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        // the graph is frozen now
        let err = sys.connect("src.signal ~ intg.x").unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelFrozen);
        let err = sys.add(source_module("late", 0.0)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelFrozen);
        let err = sys.add_event(at_time(1.0, |_| Ok(vec![]))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelFrozen);
    }

    #[test]
    fn test_survival_map_after_compile() {
        let mut sys = System::new("survival");
        sys.add(source_module("src", 1.0)).unwrap();
        sys.add(integrator_module("intg", 0.0)).unwrap();
        sys.connect("src.signal ~ intg.input").unwrap();

        let compiled = sys.compile().unwrap();
        assert_eq!(compiled.names.len(), compiled.flat.variables.len());

        let x = canonicalize("intg.x");
        assert!(matches!(
            compiled.names.survival(&x),
            Some(Survival::Retained { .. })
        ));
        // the integrator input was aliased away into src.signal
        let input = canonicalize("intg.input");
        assert_eq!(compiled.names.survival(&input), Some(Survival::Observed));
        // parameters are neither retained nor observed
        let value = canonicalize("src.value");
        assert_eq!(
            compiled.names.survival(&value),
            Some(Survival::Unrecoverable)
        );
    }

    #[test]
    fn test_chain_default_ports() {
        let mut sys = System::new("chained");
        sys.add(source_module("src", 1.0)).unwrap();
        sys.add(integrator_module("intg", 0.0)).unwrap();
        sys.chain(&["src", "intg"]).unwrap();
        sys.compile().unwrap();

        let results = sys.run(&SimSpecs::new(0.0, 1.0, 0.1)).unwrap();
        let x = results.series(&canonicalize("intg.x")).unwrap();
        assert!((x.last().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_runs_are_independent() {
        let mut sys = System::new("rerun");
        sys.add(source_module("src", 1.0)).unwrap();
        sys.add(integrator_module("intg", 0.0)).unwrap();
        sys.connect("src.signal ~ intg.input").unwrap();
        sys.compile().unwrap();

        let specs = SimSpecs::new(0.0, 1.0, 0.1);
        let a = sys.run(&specs).unwrap();
        let b = sys.run(&specs).unwrap();
        let xa = a.series(&canonicalize("intg.x")).unwrap();
        let xb = b.series(&canonicalize("intg.x")).unwrap();
        assert_eq!(xa, xb);
    }
}
