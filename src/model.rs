// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ast::Equation;
use crate::common::{Ident, Result, canonicalize};
use crate::connect::ConnectionSpec;
use crate::datamodel;
use crate::model_err;
use crate::parser;
use crate::variable::{Port, PortDirection, VarKind, Variable};

/// Stable handle into a [`ModuleRegistry`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

#[derive(Clone, Debug, PartialEq)]
pub struct ModuleEquation {
    pub source: String,
    pub ast: Equation,
}

/// The immutable form of a built leaf module.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDescriptor {
    pub name: Ident,
    pub variables: Vec<Variable>,
    pub equations: Vec<Equation>,
    pub default_input: Option<Ident>,
    pub default_output: Option<Ident>,
}

/// A leaf unit: states, parameters, interface variables, and equations over
/// its own names. Owns its variables exclusively until composed into a
/// parent.
#[derive(Clone, Debug)]
pub struct Module {
    name: Ident,
    variables: Vec<Variable>,
    var_index: HashMap<Ident, usize>,
    equations: Vec<ModuleEquation>,
    default_input: Option<Ident>,
    default_output: Option<Ident>,
    descriptor: Option<Rc<ModuleDescriptor>>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: canonicalize(name),
            variables: Vec::new(),
            var_index: HashMap::new(),
            equations: Vec::new(),
            default_input: None,
            default_output: None,
            descriptor: None,
        }
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn equations(&self) -> &[ModuleEquation] {
        &self.equations
    }

    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        let name = canonicalize(name);
        self.var_index.get(&name).map(|&i| &self.variables[i])
    }

    fn declare(&mut self, name: &str, kind: VarKind, default: f64) -> Result<()> {
        let ident = canonicalize(name);
        if self.var_index.contains_key(&ident) {
            return model_err!(
                DuplicateVariable,
                format!("{} in module {}", ident, self.name)
            );
        }
        self.descriptor = None;
        self.var_index.insert(ident.clone(), self.variables.len());
        self.variables.push(Variable::new(ident, kind, default));
        Ok(())
    }

    /// Register a state; an implicit same-named port becomes connectable.
    pub fn declare_state(&mut self, name: &str, default: f64) -> Result<()> {
        self.declare(name, VarKind::State, default)
    }

    /// Register a parameter; mutable through event patches at run time.
    pub fn declare_param(&mut self, name: &str, default: f64) -> Result<()> {
        self.declare(name, VarKind::Parameter, default)
    }

    /// Register a pure input interface variable.
    pub fn declare_input(&mut self, name: &str, default: f64) -> Result<()> {
        self.declare(name, VarKind::Input, default)
    }

    /// Register a pure output interface variable.
    pub fn declare_output(&mut self, name: &str, default: f64) -> Result<()> {
        self.declare(name, VarKind::Output, default)
    }

    /// Append an equation over this module's own variables.
    ///
    /// The text is parsed into the typed tree immediately; whether every
    /// referenced name closes over declared variables is left to the backend.
    pub fn add_equation(&mut self, text: &str) -> Result<()> {
        let ast = parser::parse_equation(text).map_err(|err| {
            crate::common::Error::new(
                crate::common::ErrorKind::Variable,
                err.code,
                Some(format!("{}: {}", self.name, text)),
            )
        })?;
        self.descriptor = None;
        self.equations.push(ModuleEquation {
            source: text.to_string(),
            ast,
        });
        Ok(())
    }

    pub fn set_default_input(&mut self, name: &str) -> Result<()> {
        let ident = canonicalize(name);
        if !self.var_index.contains_key(&ident) {
            return model_err!(DoesNotExist, format!("{} in module {}", ident, self.name));
        }
        self.descriptor = None;
        self.default_input = Some(ident);
        Ok(())
    }

    pub fn set_default_output(&mut self, name: &str) -> Result<()> {
        let ident = canonicalize(name);
        if !self.var_index.contains_key(&ident) {
            return model_err!(DoesNotExist, format!("{} in module {}", ident, self.name));
        }
        self.descriptor = None;
        self.default_output = Some(ident);
        Ok(())
    }

    /// A lookup handle for one of this module's variables.
    pub fn port(&self, name: &str) -> Result<Port> {
        let ident = canonicalize(name);
        let Some(&i) = self.var_index.get(&ident) else {
            return model_err!(DoesNotExist, format!("{} in module {}", ident, self.name));
        };
        let direction = match self.variables[i].kind {
            VarKind::Input => PortDirection::Input,
            _ => PortDirection::Output,
        };
        Ok(Port::new(self.name.clone(), ident, direction))
    }

    /// The default input port, if one was designated.
    pub fn input(&self) -> Result<Port> {
        match &self.default_input {
            Some(name) => self.port(name.as_str()),
            None => model_err!(
                DoesNotExist,
                format!("module {} has no default input", self.name)
            ),
        }
    }

    /// The default output port, if one was designated.
    pub fn output(&self) -> Result<Port> {
        match &self.default_output {
            Some(name) => self.port(name.as_str()),
            None => model_err!(
                DoesNotExist,
                format!("module {} has no default output", self.name)
            ),
        }
    }

    /// Produce the immutable descriptor; idempotent and cached, so a module
    /// referenced from several composites is only processed once.
    pub fn build(&mut self) -> Result<Rc<ModuleDescriptor>> {
        if let Some(desc) = &self.descriptor {
            return Ok(Rc::clone(desc));
        }
        let desc = Rc::new(ModuleDescriptor {
            name: self.name.clone(),
            variables: self.variables.clone(),
            equations: self.equations.iter().map(|e| e.ast.clone()).collect(),
            default_input: self.default_input.clone(),
            default_output: self.default_output.clone(),
        });
        self.descriptor = Some(Rc::clone(&desc));
        Ok(desc)
    }

    pub fn from_datamodel(def: &datamodel::ModuleDef) -> Result<Module> {
        let mut module = Module::new(&def.name);
        for v in &def.states {
            module.declare_state(&v.name, v.default)?;
        }
        for v in &def.params {
            module.declare_param(&v.name, v.default)?;
        }
        for v in &def.inputs {
            module.declare_input(&v.name, v.default)?;
        }
        for v in &def.outputs {
            module.declare_output(&v.name, v.default)?;
        }
        for eqn in &def.equations {
            module.add_equation(eqn)?;
        }
        if let Some(name) = &def.default_input {
            module.set_default_input(name)?;
        }
        if let Some(name) = &def.default_output {
            module.set_default_output(name)?;
        }
        Ok(module)
    }
}

/// Recursively composes registered blocks, wires internal connections, and
/// exposes a subset of internal variables as its own interface.
#[derive(Clone, Debug)]
pub struct CompositeModule {
    name: Ident,
    submodules: Vec<(Ident, ModuleId)>,
    sub_index: HashMap<Ident, usize>,
    connections: Vec<ConnectionSpec>,
    exposed_inputs: Vec<(Ident, Ident)>,
    exposed_outputs: Vec<(Ident, Ident)>,
    default_input: Option<Ident>,
    default_output: Option<Ident>,
}

impl CompositeModule {
    pub fn new(name: &str) -> Self {
        CompositeModule {
            name: canonicalize(name),
            submodules: Vec::new(),
            sub_index: HashMap::new(),
            connections: Vec::new(),
            exposed_inputs: Vec::new(),
            exposed_outputs: Vec::new(),
            default_input: None,
            default_output: None,
        }
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }

    pub fn submodules(&self) -> &[(Ident, ModuleId)] {
        &self.submodules
    }

    pub fn connections(&self) -> &[ConnectionSpec] {
        &self.connections
    }

    pub fn exposed_inputs(&self) -> &[(Ident, Ident)] {
        &self.exposed_inputs
    }

    pub fn exposed_outputs(&self) -> &[(Ident, Ident)] {
        &self.exposed_outputs
    }

    pub fn submodule(&self, local_name: &str) -> Option<ModuleId> {
        let name = canonicalize(local_name);
        self.sub_index.get(&name).map(|&i| self.submodules[i].1)
    }

    /// Register a submodule under a local name; its variables' qualified
    /// paths become `this.local_name.variable`.
    pub fn add_module(&mut self, local_name: &str, id: ModuleId) -> Result<()> {
        let local = canonicalize(local_name);
        if self.sub_index.contains_key(&local) {
            return model_err!(
                DuplicateVariable,
                format!("submodule {} in composite {}", local, self.name)
            );
        }
        self.sub_index.insert(local.clone(), self.submodules.len());
        self.submodules.push((local, id));
        Ok(())
    }

    /// Store a connection scoped to this composite's internal variables.
    pub fn add_connection(&mut self, spec: ConnectionSpec) -> Result<()> {
        self.connections.push(spec);
        Ok(())
    }

    /// Shorthand for a textual connection.
    pub fn connect(&mut self, text: &str) -> Result<()> {
        self.add_connection(ConnectionSpec::Text(text.to_string()))
    }

    /// Expose an internal variable as an input named `external_name` in the
    /// parent's namespace. The path is resolved at build time; a dangling
    /// path fails the build with `UnresolvedInterface`.
    pub fn expose_input(&mut self, external_name: &str, internal_path: &str) -> Result<()> {
        let ext = canonicalize(external_name);
        if self.exposed_inputs.iter().any(|(name, _)| *name == ext)
            || self.exposed_outputs.iter().any(|(name, _)| *name == ext)
        {
            return model_err!(
                DuplicateVariable,
                format!("interface {} on composite {}", ext, self.name)
            );
        }
        self.exposed_inputs.push((ext, canonicalize(internal_path)));
        Ok(())
    }

    /// Expose an internal variable as an output named `external_name` in the
    /// parent's namespace.
    pub fn expose_output(&mut self, external_name: &str, internal_path: &str) -> Result<()> {
        let ext = canonicalize(external_name);
        if self.exposed_inputs.iter().any(|(name, _)| *name == ext)
            || self.exposed_outputs.iter().any(|(name, _)| *name == ext)
        {
            return model_err!(
                DuplicateVariable,
                format!("interface {} on composite {}", ext, self.name)
            );
        }
        self.exposed_outputs
            .push((ext, canonicalize(internal_path)));
        Ok(())
    }

    /// Designate an exposed input as this composite's default input port.
    pub fn set_default_input(&mut self, external_name: &str) -> Result<()> {
        let ext = canonicalize(external_name);
        if !self.exposed_inputs.iter().any(|(name, _)| *name == ext) {
            return model_err!(
                DoesNotExist,
                format!("exposed input {} on composite {}", ext, self.name)
            );
        }
        self.default_input = Some(ext);
        Ok(())
    }

    /// Designate an exposed output as this composite's default output port.
    pub fn set_default_output(&mut self, external_name: &str) -> Result<()> {
        let ext = canonicalize(external_name);
        if !self.exposed_outputs.iter().any(|(name, _)| *name == ext) {
            return model_err!(
                DoesNotExist,
                format!("exposed output {} on composite {}", ext, self.name)
            );
        }
        self.default_output = Some(ext);
        Ok(())
    }

    pub fn default_input(&self) -> Option<&Ident> {
        self.default_input.as_ref()
    }

    pub fn default_output(&self) -> Option<&Ident> {
        self.default_output.as_ref()
    }
}

/// One entry in the registry arena.
#[derive(Clone, Debug)]
pub enum Block {
    Leaf {
        module: Module,
        desc: Rc<ModuleDescriptor>,
    },
    Composite(CompositeModule),
}

impl Block {
    pub fn name(&self) -> &Ident {
        match self {
            Block::Leaf { desc, .. } => &desc.name,
            Block::Composite(c) => c.name(),
        }
    }

    pub fn default_input(&self) -> Option<&Ident> {
        match self {
            Block::Leaf { desc, .. } => desc.default_input.as_ref(),
            Block::Composite(c) => c.default_input(),
        }
    }

    pub fn default_output(&self) -> Option<&Ident> {
        match self {
            Block::Leaf { desc, .. } => desc.default_output.as_ref(),
            Block::Composite(c) => c.default_output(),
        }
    }
}

/// Arena of module records addressed by stable ids.
///
/// All blocks a `System` composes live here; the namespace table from
/// qualified paths to blocks is derived during flattening, so there is no
/// ambient global registration.
#[derive(Clone, Debug, Default)]
pub struct ModuleRegistry {
    blocks: Vec<Block>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Register a leaf module, building it eagerly.
    pub fn register(&mut self, mut module: Module) -> Result<ModuleId> {
        let desc = module.build()?;
        let id = ModuleId(self.blocks.len());
        self.blocks.push(Block::Leaf { module, desc });
        Ok(id)
    }

    /// Register a composite. Its submodule ids must already be registered.
    pub fn register_composite(&mut self, composite: CompositeModule) -> Result<ModuleId> {
        for (local, sub) in composite.submodules() {
            if sub.0 >= self.blocks.len() {
                return model_err!(
                    DoesNotExist,
                    format!("submodule {} of {} is not registered", local, composite.name())
                );
            }
        }
        let id = ModuleId(self.blocks.len());
        self.blocks.push(Block::Composite(composite));
        Ok(id)
    }

    /// Register a pure-data definition, recursing through nested composites.
    pub fn register_datamodel(&mut self, def: &datamodel::BlockDef) -> Result<ModuleId> {
        match def {
            datamodel::BlockDef::Module(m) => self.register(Module::from_datamodel(m)?),
            datamodel::BlockDef::Composite(c) => {
                let mut composite = CompositeModule::new(&c.name);
                for sub in &c.submodules {
                    let sub_id = self.register_datamodel(sub)?;
                    composite.add_module(sub.name(), sub_id)?;
                }
                for conn in &c.connections {
                    composite.connect(conn)?;
                }
                for iface in &c.inputs {
                    composite.expose_input(&iface.name, &iface.path)?;
                }
                for iface in &c.outputs {
                    composite.expose_output(&iface.name, &iface.path)?;
                }
                if let Some(name) = &c.default_input {
                    composite.set_default_input(name)?;
                }
                if let Some(name) = &c.default_output {
                    composite.set_default_output(name)?;
                }
                self.register_composite(composite)
            }
        }
    }

    pub fn get(&self, id: ModuleId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    /// Reject composition graphs that contain themselves, directly or
    /// through a chain of registered composites.
    pub fn check_cycles(&self, root: &CompositeModule) -> Result<()> {
        let mut on_stack: HashSet<usize> = HashSet::new();
        let mut finished: HashSet<usize> = HashSet::new();

        fn visit(
            reg: &ModuleRegistry,
            composite: &CompositeModule,
            on_stack: &mut HashSet<usize>,
            finished: &mut HashSet<usize>,
        ) -> Result<()> {
            for (local, id) in composite.submodules() {
                if let Block::Composite(child) = reg.get(*id) {
                    if on_stack.contains(&id.0) {
                        return model_err!(
                            CompositionCycle,
                            format!("{} contains itself via {}", child.name(), local)
                        );
                    }
                    if finished.contains(&id.0) {
                        continue;
                    }
                    on_stack.insert(id.0);
                    visit(reg, child, on_stack, finished)?;
                    on_stack.remove(&id.0);
                    finished.insert(id.0);
                }
            }
            Ok(())
        }

        visit(self, root, &mut on_stack, &mut finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gain_module(name: &str, k: f64) -> Module {
        let mut m = Module::new(name);
        m.declare_input("input", 0.0).unwrap();
        m.declare_output("output", 0.0).unwrap();
        m.declare_param("k", k).unwrap();
        m.add_equation("output ~ k * input").unwrap();
        m.set_default_input("input").unwrap();
        m.set_default_output("output").unwrap();
        m
    }

    #[test]
    fn test_duplicate_declaration() {
        let mut m = Module::new("dup");
        m.declare_state("x", 0.0).unwrap();
        let err = m.declare_param("x", 1.0).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::DuplicateVariable);
    }

    #[test]
    fn test_build_idempotent() {
        let mut m = gain_module("amp", 2.0);
        let first = m.build().unwrap();
        let second = m.build().unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        // mutation invalidates the cached descriptor
        m.declare_param("extra", 0.0).unwrap();
        let third = m.build().unwrap();
        assert!(!Rc::ptr_eq(&first, &third));
        assert_eq!(third.variables.len(), 4);
    }

    #[test]
    fn test_ports() {
        let mut m = gain_module("amp", 2.0);
        m.build().unwrap();
        let input = m.input().unwrap();
        assert_eq!(input.path().as_str(), "amp·input");
        assert_eq!(input.direction, PortDirection::Input);
        let output = m.output().unwrap();
        assert_eq!(output.path().as_str(), "amp·output");

        let err = m.port("missing").unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::DoesNotExist);
    }

    #[test]
    fn test_composite_interfaces() {
        let mut reg = ModuleRegistry::new();
        let g1 = reg.register(gain_module("gain1", 2.0)).unwrap();
        let g2 = reg.register(gain_module("gain2", 3.0)).unwrap();

        let mut cascade = CompositeModule::new("cascade");
        cascade.add_module("gain1", g1).unwrap();
        cascade.add_module("gain2", g2).unwrap();
        cascade.connect("gain1.output ~ gain2.input").unwrap();
        cascade.expose_input("in", "gain1.input").unwrap();
        cascade.expose_output("out", "gain2.output").unwrap();
        cascade.set_default_input("in").unwrap();
        cascade.set_default_output("out").unwrap();

        let err = cascade.expose_input("in", "gain2.input").unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::DuplicateVariable);
        let err = cascade.set_default_input("nope").unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::DoesNotExist);

        let id = reg.register_composite(cascade).unwrap();
        assert_eq!(reg.get(id).name().as_str(), "cascade");
    }

    #[test]
    fn test_cycle_detection() {
        let mut reg = ModuleRegistry::new();
        let leaf = reg.register(gain_module("leaf", 1.0)).unwrap();

        let mut inner = CompositeModule::new("inner");
        inner.add_module("leaf", leaf).unwrap();
        let inner_id = reg.register_composite(inner).unwrap();

        // splice inner into itself after registration
        if let Block::Composite(c) = reg.get_mut(inner_id) {
            c.add_module("again", inner_id).unwrap();
        }

        let mut root = CompositeModule::new("root");
        root.add_module("inner", inner_id).unwrap();

        let err = reg.check_cycles(&root).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::CompositionCycle);
    }

    #[test]
    fn test_transitive_cycle() {
        let mut reg = ModuleRegistry::new();
        let a = reg.register_composite(CompositeModule::new("a")).unwrap();
        let b = reg.register_composite(CompositeModule::new("b")).unwrap();

        if let Block::Composite(c) = reg.get_mut(a) {
            c.add_module("child", b).unwrap();
        }
        if let Block::Composite(c) = reg.get_mut(b) {
            c.add_module("child", a).unwrap();
        }

        let mut root = CompositeModule::new("root");
        root.add_module("a", a).unwrap();
        let err = reg.check_cycles(&root).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::CompositionCycle);
    }
}
