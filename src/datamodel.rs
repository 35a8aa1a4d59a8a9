// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Pure-data definitions of modules and composites.
//!
//! This is the serialization surface: plain structs with no parsed state,
//! convertible into the compiled `model` types. Equations and connections
//! stay as source text here.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarDef {
    pub name: String,
    #[serde(default)]
    pub default: f64,
}

impl VarDef {
    pub fn new(name: &str, default: f64) -> Self {
        VarDef {
            name: name.to_string(),
            default,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<VarDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<VarDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<VarDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<VarDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output: Option<String>,
}

/// An exposed interface on a composite: `name` in the parent's namespace,
/// tied to the dotted `path` inside the composite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub name: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CompositeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submodules: Vec<BlockDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InterfaceDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<InterfaceDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDef {
    Module(ModuleDef),
    Composite(CompositeDef),
}

impl BlockDef {
    pub fn name(&self) -> &str {
        match self {
            BlockDef::Module(m) => &m.name,
            BlockDef::Composite(c) => &c.name,
        }
    }
}
