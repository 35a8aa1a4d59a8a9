// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! JSON surface for block definitions.

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::datamodel::BlockDef;

pub fn block_from_str(json: &str) -> Result<BlockDef> {
    serde_json::from_str(json).map_err(|err| {
        Error::new(
            ErrorKind::Model,
            ErrorCode::JsonDeserialization,
            Some(err.to_string()),
        )
    })
}

pub fn block_to_string(def: &BlockDef) -> Result<String> {
    serde_json::to_string_pretty(def).map_err(|err| {
        Error::new(
            ErrorKind::Model,
            ErrorCode::JsonDeserialization,
            Some(err.to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::canonicalize;
    use crate::solver::SimSpecs;
    use crate::system::System;

    #[test]
    fn test_load_and_run() {
        let amp = block_from_str(
            r#"{
                "type": "module",
                "name": "amp",
                "inputs": [{"name": "input"}],
                "outputs": [{"name": "output"}],
                "params": [{"name": "k", "default": 4.0}],
                "equations": ["output ~ k * input"],
                "default_input": "input",
                "default_output": "output"
            }"#,
        )
        .unwrap();
        let src = block_from_str(
            r#"{
                "type": "module",
                "name": "src",
                "params": [{"name": "value", "default": 1.5}],
                "outputs": [{"name": "signal"}],
                "equations": ["signal ~ value"],
                "default_output": "signal"
            }"#,
        )
        .unwrap();

        let mut sys = System::new("from_json");
        let src_id = sys.register_datamodel(&src).unwrap();
        let amp_id = sys.register_datamodel(&amp).unwrap();
        sys.add_module(src_id).unwrap();
        sys.add_module(amp_id).unwrap();
        sys.chain(&["src", "amp"]).unwrap();
        sys.compile().unwrap();

        let results = sys.run(&SimSpecs::new(0.0, 1.0, 0.5)).unwrap();
        let out = results.series(&canonicalize("amp.output")).unwrap();
        assert!(out.iter().all(|&v| v == 6.0));
    }

    #[test]
    fn test_bad_json() {
        let err = block_from_str("{not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::JsonDeserialization);
    }

    #[test]
    fn test_roundtrip_names() {
        let def = block_from_str(r#"{"type": "module", "name": "m"}"#).unwrap();
        let text = block_to_string(&def).unwrap();
        let again = block_from_str(&text).unwrap();
        assert_eq!(def, again);
    }
}
