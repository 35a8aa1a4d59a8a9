// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The reference backend.
//!
//! Structural simplification here is alias elimination: every equality of
//! the form `a ~ b` collapses its two names into one equivalence class with
//! a single representative, and the eliminated names become observed
//! aliases. Remaining algebraic definitions are topologically sorted and
//! evaluated each step; derivative targets are the retained unknowns,
//! integrated with a fixed-step explicit method. Event breakpoints split
//! the integration into segments that stop exactly on time; zero crossings
//! are located by bisection within the step that straddles them.

use std::collections::{BTreeSet, HashMap};

use float_cmp::approx_eq;
use log::{debug, warn};

use crate::ast::{BinaryOp, Equation, Expr, UnaryOp, is_time_ident, pretty};
use crate::common::{Ident, Result, canonicalize};
use crate::compiler::FlatModel;
use crate::events::{Event, EventSchedule, IntegratorView};
use crate::results::{Results, TIME_OFF};
use crate::sim_err;
use crate::solver::{Backend, Method, ParamStore, PreparedModel, SolveRequest, SimSpecs};
use crate::variable::VarKind;

const CROSSING_TOL: f64 = 1e-9;
const MAX_BISECTIONS: usize = 64;

fn same_time(a: f64, b: f64) -> bool {
    approx_eq!(f64, a, b, epsilon = 1e-9, ulps = 4)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BuiltinFn {
    Abs,
    Sin,
    Cos,
    Tan,
    Tanh,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Min,
    Max,
    Step,
    Ramp,
}

impl BuiltinFn {
    fn from_name(name: &str) -> Option<(Self, usize)> {
        use BuiltinFn::*;
        let (func, arity) = match name {
            "abs" => (Abs, 1),
            "sin" => (Sin, 1),
            "cos" => (Cos, 1),
            "tan" => (Tan, 1),
            "tanh" => (Tanh, 1),
            "exp" => (Exp, 1),
            "ln" => (Ln, 1),
            "log10" => (Log10, 1),
            "sqrt" => (Sqrt, 1),
            "min" => (Min, 2),
            "max" => (Max, 2),
            "step" => (Step, 2),
            "ramp" => (Ramp, 2),
            _ => return None,
        };
        Some((func, arity))
    }
}

#[derive(Clone, Copy, Debug)]
enum Slot {
    State(usize),
    Aux(usize),
    Param(usize),
    Time,
}

/// An expression with every variable reference resolved to a slot.
#[derive(Clone, Debug)]
enum CExpr {
    Const(f64),
    Ref(Slot),
    App(BuiltinFn, Vec<CExpr>),
    Op1(UnaryOp, Box<CExpr>),
    Op2(BinaryOp, Box<CExpr>, Box<CExpr>),
}

struct Env<'a> {
    time: f64,
    states: &'a [f64],
    auxes: &'a [f64],
    params: &'a [f64],
}

fn eval(expr: &CExpr, env: &Env) -> f64 {
    match expr {
        CExpr::Const(n) => *n,
        CExpr::Ref(slot) => match slot {
            Slot::State(i) => env.states[*i],
            Slot::Aux(i) => env.auxes[*i],
            Slot::Param(i) => env.params[*i],
            Slot::Time => env.time,
        },
        CExpr::App(func, args) => {
            use BuiltinFn::*;
            let a = eval(&args[0], env);
            match func {
                Abs => a.abs(),
                Sin => a.sin(),
                Cos => a.cos(),
                Tan => a.tan(),
                Tanh => a.tanh(),
                Exp => a.exp(),
                Ln => a.ln(),
                Log10 => a.log10(),
                Sqrt => a.sqrt(),
                Min => a.min(eval(&args[1], env)),
                Max => a.max(eval(&args[1], env)),
                Step => {
                    // step(height, step_time)
                    let step_time = eval(&args[1], env);
                    if env.time >= step_time { a } else { 0.0 }
                }
                Ramp => {
                    // ramp(slope, start_time)
                    let start_time = eval(&args[1], env);
                    if env.time > start_time {
                        a * (env.time - start_time)
                    } else {
                        0.0
                    }
                }
            }
        }
        CExpr::Op1(UnaryOp::Negative, r) => -eval(r, env),
        CExpr::Op2(op, l, r) => {
            let l = eval(l, env);
            let r = eval(r, env);
            match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => l / r,
                BinaryOp::Exp => l.powf(r),
            }
        }
    }
}

struct UnionFind {
    parent: HashMap<Ident, Ident>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: HashMap::new(),
        }
    }

    fn find(&mut self, id: &Ident) -> Ident {
        let mut root = id.clone();
        while let Some(next) = self.parent.get(&root) {
            if *next == root {
                break;
            }
            root = next.clone();
        }
        // path compression
        let mut curr = id.clone();
        while let Some(next) = self.parent.get(&curr).cloned() {
            if next == root {
                break;
            }
            self.parent.insert(curr.clone(), root.clone());
            curr = next;
        }
        root
    }

    fn union(&mut self, a: &Ident, b: &Ident) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

#[derive(Debug)]
struct StatePlan {
    ident: Ident,
    init: f64,
    rhs: CExpr,
}

#[derive(Debug)]
enum AuxValue {
    Expr(CExpr),
    /// An interface variable nothing drives; held at its declared default.
    Free(f64),
}

#[derive(Debug)]
struct AuxPlan {
    ident: Ident,
    value: AuxValue,
}

/// Reference backend over the flattened model.
#[derive(Clone, Copy, Debug, Default)]
pub struct Vm;

impl Backend for Vm {
    fn prepare(&self, flat: &FlatModel) -> Result<Box<dyn PreparedModel>> {
        Ok(Box::new(Prepared::new(flat)?))
    }
}

#[derive(Debug)]
struct Prepared {
    flat: FlatModel,
    retained: Vec<(Ident, usize)>,
    observed: Vec<Ident>,
    states: Vec<StatePlan>,
    auxes: Vec<AuxPlan>,
    offsets: HashMap<Ident, usize>,
    observed_offsets: HashMap<Ident, usize>,
    /// Row offsets visible to event callbacks: retained and observed both.
    view_offsets: HashMap<Ident, usize>,
    n_slots: usize,
}

impl Prepared {
    fn new(flat: &FlatModel) -> Result<Prepared> {
        // the reference backend only handles equations made explicit by the
        // parser; an implicit constraint needs a real DAE solver
        for eqn in &flat.equations {
            if let Equation::Constraint(lhs, rhs, _) = eqn {
                return sim_err!(
                    NotSimulatable,
                    format!(
                        "implicit constraint {} ~ {} is not supported by the reference backend",
                        pretty(lhs),
                        pretty(rhs)
                    )
                );
            }
        }

        // free-variable closure check, deferred to the backend by the
        // modeling layer
        for eqn in &flat.equations {
            for id in eqn.identifiers() {
                if is_time_ident(&id) {
                    continue;
                }
                if !flat.index.contains_key(&id) {
                    return sim_err!(UnknownDependency, id.to_source_repr());
                }
            }
        }

        let mut defs: HashMap<Ident, &Expr> = HashMap::new();
        let mut derivs: HashMap<Ident, &Expr> = HashMap::new();
        let mut uf = UnionFind::new();

        for eqn in &flat.equations {
            match eqn {
                Equation::Definition(target, rhs, _) => {
                    if let Expr::Var(src, _) = rhs {
                        if !is_time_ident(src) {
                            uf.union(target, src);
                            continue;
                        }
                    }
                    if defs.insert(target.clone(), rhs).is_some() {
                        return sim_err!(
                            NotSimulatable,
                            format!("{} is defined more than once", target.to_source_repr())
                        );
                    }
                }
                Equation::Derivative(target, rhs, _) => {
                    if derivs.insert(target.clone(), rhs).is_some() {
                        return sim_err!(
                            NotSimulatable,
                            format!(
                                "{} has more than one derivative equation",
                                target.to_source_repr()
                            )
                        );
                    }
                }
                Equation::Constraint(_, _, _) => unreachable!(),
            }
        }

        // group every variable into its equivalence class, in declaration
        // order so representatives and columns come out deterministic
        let mut classes: HashMap<Ident, Vec<Ident>> = HashMap::new();
        let mut class_order: Vec<Ident> = Vec::new();
        for v in &flat.variables {
            let root = uf.find(&v.ident);
            let members = classes.entry(root.clone()).or_insert_with(|| {
                class_order.push(root.clone());
                Vec::new()
            });
            members.push(v.ident.clone());
        }

        // elect one representative per class: a defined member, else a
        // state, else the first member declared
        let mut resolve: HashMap<Ident, Ident> = HashMap::new();
        let mut rep_order: Vec<Ident> = Vec::new();
        for root in &class_order {
            let members = &classes[root];
            let mut defined: Vec<&Ident> = members.iter().filter(|m| defs.contains_key(*m)).collect();
            let states: Vec<&Ident> = members.iter().filter(|m| derivs.contains_key(*m)).collect();
            if defined.len() + states.len() > 1 {
                let mut all: Vec<String> = defined
                    .iter()
                    .chain(states.iter())
                    .map(|m| m.to_source_repr())
                    .collect();
                all.sort();
                return sim_err!(
                    NotSimulatable,
                    format!("overdetermined: {} define one quantity", all.join(", "))
                );
            }
            if members.len() > 1 {
                for m in members {
                    if flat.kind_of(m) == Some(VarKind::Parameter) {
                        return sim_err!(
                            NotSimulatable,
                            format!("parameter {} cannot be aliased", m.to_source_repr())
                        );
                    }
                }
            }
            let rep = defined
                .pop()
                .or_else(|| states.first().copied())
                .unwrap_or(&members[0])
                .clone();
            rep_order.push(rep.clone());
            for m in members {
                resolve.insert(m.clone(), rep.clone());
            }
        }

        // layout: states first, then algebraic/free slots
        let mut state_index: HashMap<Ident, usize> = HashMap::new();
        let mut state_idents: Vec<Ident> = Vec::new();
        for rep in &rep_order {
            if derivs.contains_key(rep) {
                state_index.insert(rep.clone(), state_idents.len());
                state_idents.push(rep.clone());
            }
        }

        let params = ParamStore::new(flat);

        // topological order over algebraic definitions; free interface
        // variables have no dependencies and sort trivially
        let mut aux_reps: Vec<Ident> = Vec::new();
        for rep in &rep_order {
            if !derivs.contains_key(rep) && flat.kind_of(rep) != Some(VarKind::Parameter) {
                aux_reps.push(rep.clone());
            }
        }
        let aux_order = sort_auxes(&aux_reps, &defs, &resolve)?;

        let mut aux_index: HashMap<Ident, usize> = HashMap::new();
        for (i, ident) in aux_order.iter().enumerate() {
            aux_index.insert(ident.clone(), i);
        }

        let ctx = CompileCtx {
            resolve: &resolve,
            state_index: &state_index,
            aux_index: &aux_index,
            params: &params,
        };

        let mut states = Vec::with_capacity(state_idents.len());
        for ident in &state_idents {
            let rhs = ctx.compile(derivs[ident])?;
            let init = flat.get(ident).map(|v| v.default).unwrap_or(0.0);
            states.push(StatePlan {
                ident: ident.clone(),
                init,
                rhs,
            });
        }

        let mut auxes = Vec::with_capacity(aux_order.len());
        for ident in &aux_order {
            let value = match defs.get(ident) {
                Some(expr) => AuxValue::Expr(ctx.compile(expr)?),
                None => AuxValue::Free(flat.get(ident).map(|v| v.default).unwrap_or(0.0)),
            };
            auxes.push(AuxPlan {
                ident: ident.clone(),
                value,
            });
        }

        let n_states = states.len();
        let n_slots = 1 + n_states + auxes.len();

        let mut offsets = HashMap::new();
        let mut retained = Vec::new();
        for (i, plan) in states.iter().enumerate() {
            offsets.insert(plan.ident.clone(), 1 + i);
            retained.push((plan.ident.clone(), 1 + i));
        }

        let mut observed_offsets = HashMap::new();
        let mut observed = Vec::new();
        for (i, plan) in auxes.iter().enumerate() {
            observed_offsets.insert(plan.ident.clone(), 1 + n_states + i);
            observed.push(plan.ident.clone());
        }
        // aliases observe their representative's column; an alias of a
        // parameter has no column and stays unrecoverable
        for v in &flat.variables {
            let rep = &resolve[&v.ident];
            if v.ident == *rep {
                continue;
            }
            let col = offsets.get(rep).or_else(|| observed_offsets.get(rep));
            if let Some(&col) = col {
                observed_offsets.insert(v.ident.clone(), col);
                observed.push(v.ident.clone());
            } else {
                debug!(
                    "{} aliases {}, which has no trajectory column",
                    v.ident.to_source_repr(),
                    rep.to_source_repr()
                );
            }
        }

        let mut view_offsets = offsets.clone();
        for (k, &v) in &observed_offsets {
            view_offsets.entry(k.clone()).or_insert(v);
        }

        debug!(
            "prepared {}: {} retained, {} observed, {} parameters",
            flat.name,
            retained.len(),
            observed.len(),
            params.len()
        );

        Ok(Prepared {
            flat: flat.clone(),
            retained,
            observed,
            states,
            auxes,
            offsets,
            observed_offsets,
            view_offsets,
            n_slots,
        })
    }

    fn compute_auxes(&self, t: f64, state: &[f64], params: &ParamStore) -> Vec<f64> {
        let mut auxes = vec![0.0; self.auxes.len()];
        for (i, plan) in self.auxes.iter().enumerate() {
            let value = match &plan.value {
                AuxValue::Free(default) => *default,
                AuxValue::Expr(expr) => {
                    let env = Env {
                        time: t,
                        states: state,
                        auxes: &auxes,
                        params: params.values(),
                    };
                    eval(expr, &env)
                }
            };
            auxes[i] = value;
        }
        auxes
    }

    fn derivs(&self, t: f64, state: &[f64], params: &ParamStore) -> Vec<f64> {
        let auxes = self.compute_auxes(t, state, params);
        let env = Env {
            time: t,
            states: state,
            auxes: &auxes,
            params: params.values(),
        };
        self.states.iter().map(|plan| eval(&plan.rhs, &env)).collect()
    }

    fn step(&self, t: f64, state: &[f64], h: f64, params: &ParamStore, method: Method) -> Vec<f64> {
        match method {
            Method::Euler => {
                let k1 = self.derivs(t, state, params);
                state.iter().zip(k1).map(|(y, d)| y + h * d).collect()
            }
            Method::RungeKutta4 | Method::Stiff => {
                let k1 = self.derivs(t, state, params);
                let y2: Vec<f64> = state
                    .iter()
                    .zip(&k1)
                    .map(|(y, d)| y + 0.5 * h * d)
                    .collect();
                let k2 = self.derivs(t + 0.5 * h, &y2, params);
                let y3: Vec<f64> = state
                    .iter()
                    .zip(&k2)
                    .map(|(y, d)| y + 0.5 * h * d)
                    .collect();
                let k3 = self.derivs(t + 0.5 * h, &y3, params);
                let y4: Vec<f64> = state.iter().zip(&k3).map(|(y, d)| y + h * d).collect();
                let k4 = self.derivs(t + h, &y4, params);
                state
                    .iter()
                    .enumerate()
                    .map(|(i, y)| y + h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]))
                    .collect()
            }
        }
    }

    fn row(&self, t: f64, state: &[f64], auxes: &[f64]) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.n_slots);
        row.push(t);
        row.extend_from_slice(state);
        row.extend_from_slice(auxes);
        row
    }
}

struct CompileCtx<'a> {
    resolve: &'a HashMap<Ident, Ident>,
    state_index: &'a HashMap<Ident, usize>,
    aux_index: &'a HashMap<Ident, usize>,
    params: &'a ParamStore,
}

impl CompileCtx<'_> {
    fn slot(&self, ident: &Ident) -> Result<Slot> {
        if is_time_ident(ident) {
            return Ok(Slot::Time);
        }
        let rep = self.resolve.get(ident).unwrap_or(ident);
        if let Some(&i) = self.state_index.get(rep) {
            return Ok(Slot::State(i));
        }
        if let Some(&i) = self.aux_index.get(rep) {
            return Ok(Slot::Aux(i));
        }
        if let Some(i) = self.params.offset_of(rep) {
            return Ok(Slot::Param(i));
        }
        sim_err!(UnknownDependency, ident.to_source_repr())
    }

    fn compile(&self, expr: &Expr) -> Result<CExpr> {
        let compiled = match expr {
            Expr::Const(_, n, _) => CExpr::Const(*n),
            Expr::Var(id, _) => CExpr::Ref(self.slot(id)?),
            Expr::App(func, args, _) => {
                let Some((builtin, arity)) = BuiltinFn::from_name(func.as_str()) else {
                    return sim_err!(UnknownBuiltin, func.to_source_repr());
                };
                if args.len() != arity {
                    return sim_err!(
                        BadBuiltinArgs,
                        format!("{} expects {} argument(s)", func, arity)
                    );
                }
                let args: Result<Vec<CExpr>> = args.iter().map(|a| self.compile(a)).collect();
                CExpr::App(builtin, args?)
            }
            Expr::Op1(op, r, _) => CExpr::Op1(*op, Box::new(self.compile(r)?)),
            Expr::Op2(op, l, r, _) => CExpr::Op2(
                *op,
                Box::new(self.compile(l)?),
                Box::new(self.compile(r)?),
            ),
        };
        Ok(compiled)
    }
}

fn sort_auxes(
    aux_reps: &[Ident],
    defs: &HashMap<Ident, &Expr>,
    resolve: &HashMap<Ident, Ident>,
) -> Result<Vec<Ident>> {
    let universe: BTreeSet<&Ident> = aux_reps.iter().collect();
    let mut order: Vec<Ident> = Vec::with_capacity(aux_reps.len());
    let mut done: BTreeSet<Ident> = BTreeSet::new();
    let mut processing: BTreeSet<Ident> = BTreeSet::new();

    fn visit(
        ident: &Ident,
        universe: &BTreeSet<&Ident>,
        defs: &HashMap<Ident, &Expr>,
        resolve: &HashMap<Ident, Ident>,
        order: &mut Vec<Ident>,
        done: &mut BTreeSet<Ident>,
        processing: &mut BTreeSet<Ident>,
    ) -> Result<()> {
        if done.contains(ident) {
            return Ok(());
        }
        if processing.contains(ident) {
            return sim_err!(CircularDependency, ident.to_source_repr());
        }
        processing.insert(ident.clone());
        if let Some(expr) = defs.get(ident) {
            let mut deps = BTreeSet::new();
            expr.identifiers(&mut deps);
            for dep in deps {
                if is_time_ident(&dep) {
                    continue;
                }
                let rep = resolve.get(&dep).unwrap_or(&dep);
                if universe.contains(rep) {
                    visit(rep, universe, defs, resolve, order, done, processing)?;
                }
            }
        }
        processing.remove(ident);
        done.insert(ident.clone());
        order.push(ident.clone());
        Ok(())
    }

    for ident in aux_reps {
        visit(
            ident,
            &universe,
            defs,
            resolve,
            &mut order,
            &mut done,
            &mut processing,
        )?;
    }
    Ok(order)
}

impl PreparedModel for Prepared {
    fn retained(&self) -> &[(Ident, usize)] {
        &self.retained
    }

    fn observed(&self) -> &[Ident] {
        &self.observed
    }

    fn solve(&self, req: &SolveRequest, events: &mut [Event]) -> Result<Results> {
        let specs: &SimSpecs = req.specs;
        specs.validate()?;

        let method = match specs.method {
            Method::Stiff => {
                warn!("no implicit method available; falling back to rk4");
                Method::RungeKutta4
            }
            m => m,
        };

        let mut params = ParamStore::new(&self.flat);
        for (name, value) in &req.overrides.params {
            params.set(&canonicalize(name), *value)?;
        }

        let mut state: Vec<f64> = self.states.iter().map(|p| p.init).collect();
        for (name, value) in &req.overrides.initial {
            let ident = canonicalize(name);
            match self.offsets.get(&ident) {
                Some(&col) => state[col - 1] = *value,
                None => {
                    return sim_err!(
                        DoesNotExist,
                        format!("initial override {} is not a retained state", name)
                    );
                }
            }
        }

        let save_step = specs.save_step();
        let n_chunks = ((specs.stop - specs.start) / save_step).round() as usize + 1;
        let mut data = vec![0.0; self.n_slots * n_chunks].into_boxed_slice();
        let mut rows_saved = 0usize;

        let mut t = specs.start;
        let mut auxes = self.compute_auxes(t, &state, &params);

        let mut save = |t: f64, state: &[f64], auxes: &[f64], rows_saved: &mut usize| {
            if *rows_saved >= n_chunks {
                return;
            }
            let start = *rows_saved * self.n_slots;
            let row = &mut data[start..start + self.n_slots];
            row[TIME_OFF] = t;
            row[1..1 + state.len()].copy_from_slice(state);
            row[1 + state.len()..].copy_from_slice(auxes);
            *rows_saved += 1;
        };

        save(t, &state, &auxes, &mut rows_saved);
        let mut next_save = specs.start + save_step;

        let mut schedule = EventSchedule::new(events);
        let continuous: Vec<usize> = schedule.continuous_indices().to_vec();

        // seed crossing detection with the condition signs at t0
        for &i in &continuous {
            let row = self.row(t, &state, &auxes);
            let view = IntegratorView::new(t, &self.view_offsets, &row, &params);
            let g = schedule.eval_condition(i, &view)?;
            schedule.record_sign(i, g);
        }

        while t < specs.stop && !same_time(t, specs.stop) {
            let bp = schedule.next_breakpoint(t);
            let (seg_end, fire_at) = match bp {
                Some(b) if b < specs.stop || same_time(b, specs.stop) => (b.min(specs.stop), Some(b)),
                _ => (specs.stop, None),
            };

            // integrate this segment, watching for zero crossings
            'segment: while t < seg_end && !same_time(t, seg_end) {
                let h = specs.dt.min(seg_end - t);
                let mut new_state = self.step(t, &state, h, &params, method);
                let mut new_aux = self.compute_auxes(t + h, &new_state, &params);
                let mut t_new = t + h;

                for &i in &continuous {
                    let g_prev = match schedule.prev_sign(i) {
                        Some(g) => g,
                        None => continue,
                    };
                    let g_new = {
                        let row = self.row(t_new, &new_state, &new_aux);
                        let view = IntegratorView::new(t_new, &self.view_offsets, &row, &params);
                        schedule.eval_condition(i, &view)?
                    };
                    let direction = schedule.direction(i);
                    if !direction.matches(g_prev, g_new) {
                        continue;
                    }

                    // bisect on the substep length to locate the crossing
                    let mut lo = 0.0f64;
                    let mut hi = h;
                    for _ in 0..MAX_BISECTIONS {
                        if hi - lo <= CROSSING_TOL {
                            break;
                        }
                        let mid = 0.5 * (lo + hi);
                        let y_mid = self.step(t, &state, mid, &params, method);
                        let aux_mid = self.compute_auxes(t + mid, &y_mid, &params);
                        let g_mid = {
                            let row = self.row(t + mid, &y_mid, &aux_mid);
                            let view =
                                IntegratorView::new(t + mid, &self.view_offsets, &row, &params);
                            schedule.eval_condition(i, &view)?
                        };
                        if direction.matches(g_prev, g_mid) {
                            hi = mid;
                        } else {
                            lo = mid;
                        }
                    }

                    // stop exactly at the crossing, run the affect, and
                    // apply its patches before resuming
                    t_new = t + hi;
                    new_state = self.step(t, &state, hi, &params, method);
                    new_aux = self.compute_auxes(t_new, &new_state, &params);
                    let patches = {
                        let row = self.row(t_new, &new_state, &new_aux);
                        let view = IntegratorView::new(t_new, &self.view_offsets, &row, &params);
                        schedule.call_affect(i, &view)?
                    };
                    params.apply_patches(&patches)?;
                    new_aux = self.compute_auxes(t_new, &new_state, &params);
                    debug!("continuous event fired at t={t_new}");

                    t = t_new;
                    state = new_state;
                    auxes = new_aux;
                    for &j in &continuous {
                        let row = self.row(t, &state, &auxes);
                        let view = IntegratorView::new(t, &self.view_offsets, &row, &params);
                        let g = schedule.eval_condition(j, &view)?;
                        schedule.record_sign(j, g);
                    }
                    while next_save <= t + CROSSING_TOL && rows_saved < n_chunks {
                        save(next_save, &state, &auxes, &mut rows_saved);
                        next_save += save_step;
                    }
                    continue 'segment;
                }

                if new_state.iter().any(|v| !v.is_finite()) {
                    return sim_err!(
                        SolverFailure,
                        format!("non-finite state at t={t_new}; try a smaller dt")
                    );
                }

                t = t_new;
                state = new_state;
                auxes = new_aux;
                for &i in &continuous {
                    let row = self.row(t, &state, &auxes);
                    let view = IntegratorView::new(t, &self.view_offsets, &row, &params);
                    let g = schedule.eval_condition(i, &view)?;
                    schedule.record_sign(i, g);
                }
                while (next_save <= t || same_time(next_save, t)) && rows_saved < n_chunks {
                    save(next_save, &state, &auxes, &mut rows_saved);
                    next_save += save_step;
                }
            }

            // the segment boundary is exact, never interpolated past
            t = seg_end;
            if let Some(bp_key) = fire_at {
                for idx in schedule.time_events_at(bp_key) {
                    let patches = {
                        let row = self.row(t, &state, &auxes);
                        let view = IntegratorView::new(t, &self.view_offsets, &row, &params);
                        schedule.call_time(idx, &view)?
                    };
                    params.apply_patches(&patches)?;
                    debug!("time event fired at t={t}");
                }
                auxes = self.compute_auxes(t, &state, &params);
            }
        }

        if rows_saved < n_chunks {
            save(specs.stop, &state, &auxes, &mut rows_saved);
        }

        Ok(Results {
            offsets: self.offsets.clone(),
            observed_offsets: self.observed_offsets.clone(),
            data,
            step_size: self.n_slots,
            step_count: rows_saved,
            specs: specs.clone(),
        })
    }
}
