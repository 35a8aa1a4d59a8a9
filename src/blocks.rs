// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! A small library of reusable building blocks.
//!
//! Every factory returns an ordinary `Module` with its default ports
//! designated, so blocks compose through `connect_default`/`chain` as well
//! as by explicit port names.

use crate::common::Result;
use crate::model::Module;

/// Constant signal source: `signal ~ value`.
pub fn constant(name: &str, value: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_param("value", value)?;
    m.declare_output("signal", value)?;
    m.add_equation("signal ~ value")?;
    m.set_default_output("signal")?;
    Ok(m)
}

/// Step source: 0 until `step_time`, then `height`.
pub fn step(name: &str, height: f64, step_time: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_param("height", height)?;
    m.declare_param("step_time", step_time)?;
    m.declare_output("signal", 0.0)?;
    m.add_equation("signal ~ step(height, step_time)")?;
    m.set_default_output("signal")?;
    Ok(m)
}

/// Ramp source: 0 until `start_time`, then rising at `slope`.
pub fn ramp(name: &str, slope: f64, start_time: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_param("slope", slope)?;
    m.declare_param("start_time", start_time)?;
    m.declare_output("signal", 0.0)?;
    m.add_equation("signal ~ ramp(slope, start_time)")?;
    m.set_default_output("signal")?;
    Ok(m)
}

/// Proportional gain: `output ~ k * input`.
pub fn gain(name: &str, k: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_input("input", 0.0)?;
    m.declare_output("output", 0.0)?;
    m.declare_param("k", k)?;
    m.add_equation("output ~ k * input")?;
    m.set_default_input("input")?;
    m.set_default_output("output")?;
    Ok(m)
}

/// Pure integrator: `D(x) ~ input`, starting from `initial_value`.
pub fn integrator(name: &str, initial_value: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_input("input", 0.0)?;
    m.declare_state("x", initial_value)?;
    m.declare_output("output", initial_value)?;
    m.add_equation("D(x) ~ input")?;
    m.add_equation("output ~ x")?;
    m.set_default_input("input")?;
    m.set_default_output("output")?;
    Ok(m)
}

/// Weighted sum of `signs.len()` inputs, named `input1..inputN`.
pub fn sum(name: &str, signs: &[f64]) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_output("output", 0.0)?;
    let mut terms: Vec<String> = Vec::with_capacity(signs.len());
    for (i, sign) in signs.iter().enumerate() {
        let input = format!("input{}", i + 1);
        m.declare_input(&input, 0.0)?;
        terms.push(format!("{sign}*{input}"));
    }
    m.add_equation(&format!("output ~ {}", terms.join(" + ")))?;
    m.set_default_output("output")?;
    Ok(m)
}

/// PID controller with a filtered derivative path.
///
/// The derivative of the error is approximated through a first-order
/// filter with time constant `filter_tau`.
pub fn pid(name: &str, kp: f64, ki: f64, kd: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_input("error", 0.0)?;
    m.declare_output("output", 0.0)?;
    m.declare_state("integral", 0.0)?;
    m.declare_state("filtered", 0.0)?;
    m.declare_param("kp", kp)?;
    m.declare_param("ki", ki)?;
    m.declare_param("kd", kd)?;
    m.declare_param("filter_tau", 0.01)?;
    m.add_equation("D(integral) ~ ki * error")?;
    m.add_equation("D(filtered) ~ (error - filtered) / filter_tau")?;
    m.add_equation("output ~ kp * error + integral + kd * (error - filtered) / filter_tau")?;
    m.set_default_input("error")?;
    m.set_default_output("output")?;
    Ok(m)
}

/// Saturation: clamps its input into `[min_value, max_value]`.
pub fn limiter(name: &str, min_value: f64, max_value: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_input("input", 0.0)?;
    m.declare_output("output", 0.0)?;
    m.declare_param("min_val", min_value)?;
    m.declare_param("max_val", max_value)?;
    m.add_equation("output ~ min(max(input, min_val), max_val)")?;
    m.set_default_input("input")?;
    m.set_default_output("output")?;
    Ok(m)
}

/// First-order lag: `tau * dx/dt = k * input - x`.
pub fn first_order(name: &str, k: f64, tau: f64) -> Result<Module> {
    let mut m = Module::new(name);
    m.declare_input("input", 0.0)?;
    m.declare_state("x", 0.0)?;
    m.declare_output("output", 0.0)?;
    m.declare_param("k", k)?;
    m.declare_param("tau", tau)?;
    m.add_equation("D(x) ~ (k * input - x) / tau")?;
    m.add_equation("output ~ x")?;
    m.set_default_input("input")?;
    m.set_default_output("output")?;
    Ok(m)
}
