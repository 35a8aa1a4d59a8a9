// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Post-solve recovery of named signals from a trajectory.
//!
//! Resolution is an ordered list of strategies, each a partial function
//! from requested name to series; the first success wins. A request no
//! strategy can satisfy is non-fatal: the series fills with NaN and a
//! warning is recorded.

use log::warn;

use crate::common::{Error, ErrorCode, ErrorKind, Ident, canonicalize};
use crate::compiler::{NameMap, Survival};
use crate::results::Results;

/// Which strategy satisfied a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Exact match against the retained-unknowns set.
    Retained,
    /// Exact match against the observed-expression set.
    Observed,
    /// Match after converting the path separator to the solver's internal
    /// one.
    Normalized,
    /// Unique path-suffix match over retained and observed names.
    PathSuffix,
    /// Raw column extraction via the orchestrator's name-survival map.
    RawColumn,
}

/// A request for named signals, with optional display aliases.
#[derive(Clone, Debug, PartialEq)]
pub struct DataProbe {
    pub variables: Vec<String>,
    pub names: Vec<String>,
}

impl DataProbe {
    pub fn new(variables: &[&str]) -> Self {
        DataProbe {
            variables: variables.iter().map(|s| s.to_string()).collect(),
            names: variables.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Attach display names; missing entries fall back to the variable
    /// strings.
    pub fn with_names(mut self, names: &[&str]) -> Self {
        for (i, name) in names.iter().enumerate() {
            if i < self.names.len() {
                self.names[i] = name.to_string();
            }
        }
        self
    }
}

/// One recovered series.
#[derive(Clone, Debug)]
pub struct ProbeSeries {
    pub name: String,
    pub requested: String,
    pub values: Vec<f64>,
    pub resolved_by: Option<Resolution>,
}

#[derive(Debug, Default)]
pub struct ProbeReport {
    pub series: Vec<ProbeSeries>,
    pub warnings: Vec<Error>,
}

pub struct ResolveCtx<'a> {
    pub results: &'a Results,
    pub names: &'a NameMap,
}

pub trait ResolverStrategy {
    fn resolution(&self) -> Resolution;
    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>>;
}

struct RetainedExact;

impl ResolverStrategy for RetainedExact {
    fn resolution(&self) -> Resolution {
        Resolution::Retained
    }

    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>> {
        let off = *ctx.results.offsets.get(requested)?;
        Some(ctx.results.column(off))
    }
}

struct ObservedExact;

impl ResolverStrategy for ObservedExact {
    fn resolution(&self) -> Resolution {
        Resolution::Observed
    }

    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>> {
        let off = *ctx.results.observed_offsets.get(requested)?;
        Some(ctx.results.column(off))
    }
}

struct Normalized;

impl ResolverStrategy for Normalized {
    fn resolution(&self) -> Resolution {
        Resolution::Normalized
    }

    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>> {
        let name = canonicalize(requested);
        // retained preferred over observed
        let off = ctx
            .results
            .offsets
            .get(&name)
            .or_else(|| ctx.results.observed_offsets.get(&name))?;
        Some(ctx.results.column(*off))
    }
}

struct PathSuffix;

impl PathSuffix {
    fn unique_match<'a, I>(names: I, suffix: &Ident) -> Option<usize>
    where
        I: Iterator<Item = (&'a Ident, &'a usize)>,
    {
        let mut candidates: Vec<usize> = names
            .filter(|(name, _)| name.has_path_suffix(suffix))
            .map(|(_, &off)| off)
            .collect();
        candidates.sort_unstable();
        candidates.dedup();
        if candidates.len() == 1 {
            Some(candidates[0])
        } else {
            None
        }
    }
}

impl ResolverStrategy for PathSuffix {
    fn resolution(&self) -> Resolution {
        Resolution::PathSuffix
    }

    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>> {
        let suffix = canonicalize(requested);
        // retained preferred over observed
        let off = Self::unique_match(ctx.results.offsets.iter(), &suffix)
            .or_else(|| Self::unique_match(ctx.results.observed_offsets.iter(), &suffix))?;
        Some(ctx.results.column(off))
    }
}

struct RawColumn;

impl ResolverStrategy for RawColumn {
    fn resolution(&self) -> Resolution {
        Resolution::RawColumn
    }

    fn resolve(&self, requested: &str, ctx: &ResolveCtx) -> Option<Vec<f64>> {
        let name = canonicalize(requested);
        match ctx.names.survival(&name) {
            Some(Survival::Retained { column }) if column < ctx.results.step_size => {
                Some(ctx.results.column(column))
            }
            _ => None,
        }
    }
}

/// The ordered strategy chain. The default chain implements the standard
/// precedence; callers can build a custom one for testing or to disable
/// fallbacks.
pub struct ProbeResolver {
    strategies: Vec<Box<dyn ResolverStrategy>>,
}

impl Default for ProbeResolver {
    fn default() -> Self {
        ProbeResolver {
            strategies: vec![
                Box::new(RetainedExact),
                Box::new(ObservedExact),
                Box::new(Normalized),
                Box::new(PathSuffix),
                Box::new(RawColumn),
            ],
        }
    }
}

impl ProbeResolver {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build a resolver with a custom strategy chain, in the given order.
    pub fn with_strategies(strategies: Vec<Box<dyn ResolverStrategy>>) -> Self {
        ProbeResolver { strategies }
    }

    pub fn strategy_order(&self) -> Vec<Resolution> {
        self.strategies.iter().map(|s| s.resolution()).collect()
    }

    fn resolve_one(&self, requested: &str, ctx: &ResolveCtx) -> Option<(Vec<f64>, Resolution)> {
        for strategy in &self.strategies {
            if let Some(values) = strategy.resolve(requested, ctx) {
                // an all-zero or empty series from a named accessor usually
                // means the name resolved to a dead mapping; let later
                // strategies have a try before accepting it
                let dead = values.is_empty() || values.iter().all(|&v| v == 0.0);
                if dead {
                    if let Some(better) = self.resolve_past(strategy.resolution(), requested, ctx) {
                        return Some(better);
                    }
                }
                return Some((values, strategy.resolution()));
            }
        }
        None
    }

    fn resolve_past(
        &self,
        after: Resolution,
        requested: &str,
        ctx: &ResolveCtx,
    ) -> Option<(Vec<f64>, Resolution)> {
        let mut seen = false;
        for strategy in &self.strategies {
            if !seen {
                seen = strategy.resolution() == after;
                continue;
            }
            if let Some(values) = strategy.resolve(requested, ctx) {
                if !values.is_empty() && values.iter().any(|&v| v != 0.0) {
                    return Some((values, strategy.resolution()));
                }
            }
        }
        None
    }

    /// Resolve every variable in a probe. Unresolvable names are non-fatal:
    /// the series fills with NaN and a warning is recorded in the report.
    pub fn resolve_probe(
        &self,
        probe: &DataProbe,
        results: &Results,
        names: &NameMap,
    ) -> ProbeReport {
        let ctx = ResolveCtx { results, names };
        let mut report = ProbeReport::default();

        for (i, requested) in probe.variables.iter().enumerate() {
            let display = probe
                .names
                .get(i)
                .cloned()
                .unwrap_or_else(|| requested.clone());
            match self.resolve_one(requested, &ctx) {
                Some((values, resolution)) => {
                    report.series.push(ProbeSeries {
                        name: display,
                        requested: requested.clone(),
                        values,
                        resolved_by: Some(resolution),
                    });
                }
                None => {
                    warn!("probe {requested} did not resolve; filling with NaN");
                    report.warnings.push(Error::new(
                        ErrorKind::Simulation,
                        ErrorCode::UnresolvedProbe,
                        Some(requested.clone()),
                    ));
                    report.series.push(ProbeSeries {
                        name: display,
                        requested: requested.clone(),
                        values: vec![f64::NAN; results.step_count],
                        resolved_by: None,
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{FlatModel, NameMap};
    use crate::solver::SimSpecs;
    use crate::variable::VarKind;
    use std::collections::HashMap;

    fn make_results() -> Results {
        let mut offsets = HashMap::new();
        offsets.insert(canonicalize("plant.x1"), 1);
        let mut observed_offsets = HashMap::new();
        observed_offsets.insert(canonicalize("plant.y1"), 2);
        let data: Vec<f64> = vec![
            0.0, 1.0, 10.0, //
            1.0, 2.0, 20.0, //
        ];
        Results {
            offsets,
            observed_offsets,
            data: data.into_boxed_slice(),
            step_size: 3,
            step_count: 2,
            specs: SimSpecs::new(0.0, 1.0, 1.0),
        }
    }

    fn make_names(results: &Results) -> NameMap {
        let flat = FlatModel {
            name: canonicalize("test"),
            variables: vec![
                crate::compiler::FlatVar {
                    ident: canonicalize("plant.x1"),
                    kind: VarKind::State,
                    default: 0.0,
                },
                crate::compiler::FlatVar {
                    ident: canonicalize("plant.y1"),
                    kind: VarKind::Output,
                    default: 0.0,
                },
            ],
            index: [(canonicalize("plant.x1"), 0), (canonicalize("plant.y1"), 1)]
                .into_iter()
                .collect(),
            equations: vec![],
        };
        let mut names = NameMap::from_flat(&flat);
        for (ident, &off) in &results.offsets {
            names.record_retained(ident, off);
        }
        for ident in results.observed_offsets.keys() {
            names.record_observed(ident);
        }
        names
    }

    #[test]
    fn test_normalized_hits_retained_first() {
        let results = make_results();
        let names = make_names(&results);
        let resolver = ProbeResolver::new();

        let report = resolver.resolve_probe(&DataProbe::new(&["plant.x1"]), &results, &names);
        assert_eq!(report.series.len(), 1);
        assert_eq!(report.series[0].resolved_by, Some(Resolution::Normalized));
        assert_eq!(report.series[0].values, vec![1.0, 2.0]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_exact_canonical_is_retained() {
        let results = make_results();
        let names = make_names(&results);
        let resolver = ProbeResolver::new();

        // a caller holding the solver's internal spelling hits strategy 1
        let report = resolver.resolve_probe(&DataProbe::new(&["plant·x1"]), &results, &names);
        assert_eq!(report.series[0].resolved_by, Some(Resolution::Retained));
    }

    #[test]
    fn test_suffix_match_unique() {
        let results = make_results();
        let names = make_names(&results);
        let resolver = ProbeResolver::new();

        let report = resolver.resolve_probe(&DataProbe::new(&["x1"]), &results, &names);
        assert_eq!(report.series[0].resolved_by, Some(Resolution::PathSuffix));
        assert_eq!(report.series[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_suffix_ambiguity_refused() {
        let mut results = make_results();
        results
            .offsets
            .insert(canonicalize("backup.x1"), 2);
        let names = make_names(&results);
        let resolver = ProbeResolver::new();

        // two retained candidates end in `x1`; neither is chosen
        let report = resolver.resolve_probe(&DataProbe::new(&["x1"]), &results, &names);
        assert_eq!(report.series[0].resolved_by, None);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, ErrorCode::UnresolvedProbe);
    }

    #[test]
    fn test_raw_column_fallback() {
        let mut results = make_results();
        let names = make_names(&results);
        // the solver "renamed" plant.x1 internally: named lookups all miss
        results.offsets.remove(&canonicalize("plant.x1"));
        let resolver = ProbeResolver::new();

        let report = resolver.resolve_probe(&DataProbe::new(&["plant.x1"]), &results, &names);
        assert_eq!(report.series[0].resolved_by, Some(Resolution::RawColumn));
        assert_eq!(report.series[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_unresolved_is_nonfatal() {
        let results = make_results();
        let names = make_names(&results);
        let resolver = ProbeResolver::new();

        let probe = DataProbe::new(&["nothing.here", "plant.y1"]).with_names(&["missing", "y"]);
        let report = resolver.resolve_probe(&probe, &results, &names);
        assert_eq!(report.series.len(), 2);
        assert!(report.series[0].values.iter().all(|v| v.is_nan()));
        assert_eq!(report.series[0].name, "missing");
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.series[1].resolved_by, Some(Resolution::Normalized));
        assert_eq!(report.series[1].values, vec![10.0, 20.0]);
    }

    #[test]
    fn test_strategy_order() {
        let resolver = ProbeResolver::new();
        assert_eq!(
            resolver.strategy_order(),
            vec![
                Resolution::Retained,
                Resolution::Observed,
                Resolution::Normalized,
                Resolution::PathSuffix,
                Resolution::RawColumn,
            ]
        );
    }
}
