// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashMap;

use crate::common::Ident;
use crate::solver::SimSpecs;

pub const TIME_OFF: usize = 0;

/// A solved trajectory.
///
/// `data` is one large allocation, rows of `step_size` values: time in
/// column 0, retained unknowns next, then the observed quantities the
/// backend sampled. `offsets` covers retained unknowns only;
/// `observed_offsets` maps every recoverable eliminated name to a column.
#[derive(Clone, Debug)]
pub struct Results {
    pub offsets: HashMap<Ident, usize>,
    pub observed_offsets: HashMap<Ident, usize>,
    // one large allocation
    pub data: Box<[f64]>,
    pub step_size: usize,
    pub step_count: usize,
    pub specs: SimSpecs,
}

impl Results {
    pub fn iter(&self) -> std::iter::Take<std::slice::Chunks<'_, f64>> {
        self.data.chunks(self.step_size).take(self.step_count)
    }

    pub fn times(&self) -> Vec<f64> {
        self.iter().map(|row| row[TIME_OFF]).collect()
    }

    pub fn column(&self, off: usize) -> Vec<f64> {
        self.iter().map(|row| row[off]).collect()
    }

    /// Series for a retained or observed name; retained wins if a name were
    /// somehow present in both maps.
    pub fn series(&self, name: &Ident) -> Option<Vec<f64>> {
        match self
            .offsets
            .get(name)
            .or_else(|| self.observed_offsets.get(name))
        {
            Some(&off) => Some(self.column(off)),
            None => None,
        }
    }

    /// Value of `name` in the saved row nearest to `t`.
    pub fn value_at(&self, name: &Ident, t: f64) -> Option<f64> {
        let off = *self
            .offsets
            .get(name)
            .or_else(|| self.observed_offsets.get(name))?;
        let mut best: Option<(f64, f64)> = None;
        for row in self.iter() {
            let dist = (row[TIME_OFF] - t).abs();
            match best {
                Some((best_dist, _)) if best_dist <= dist => {}
                _ => best = Some((dist, row[off])),
            }
        }
        best.map(|(_, v)| v)
    }

    pub fn print_tsv(&self) {
        let mut names: Vec<(&Ident, usize)> = self
            .offsets
            .iter()
            .chain(self.observed_offsets.iter())
            .map(|(k, &v)| (k, v))
            .collect();
        names.sort_by_key(|&(_, off)| off);
        names.dedup_by_key(|&mut (_, off)| off);

        print!("time");
        for (name, _) in &names {
            print!("\t{}", name.to_source_repr());
        }
        println!();
        for row in self.iter() {
            print!("{}", row[TIME_OFF]);
            for &(_, off) in &names {
                print!("\t{}", row[off]);
            }
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::canonicalize;

    fn sample_results() -> Results {
        let mut offsets = HashMap::new();
        offsets.insert(canonicalize("plant.x"), 1);
        let mut observed_offsets = HashMap::new();
        observed_offsets.insert(canonicalize("plant.y"), 2);
        // rows: (t, x, y)
        let data: Vec<f64> = vec![
            0.0, 0.0, 0.0, //
            0.5, 1.0, 2.0, //
            1.0, 2.0, 4.0, //
        ];
        Results {
            offsets,
            observed_offsets,
            data: data.into_boxed_slice(),
            step_size: 3,
            step_count: 3,
            specs: SimSpecs::new(0.0, 1.0, 0.5),
        }
    }

    #[test]
    fn test_series_extraction() {
        let results = sample_results();
        assert_eq!(results.times(), vec![0.0, 0.5, 1.0]);
        assert_eq!(
            results.series(&canonicalize("plant.x")),
            Some(vec![0.0, 1.0, 2.0])
        );
        assert_eq!(
            results.series(&canonicalize("plant.y")),
            Some(vec![0.0, 2.0, 4.0])
        );
        assert_eq!(results.series(&canonicalize("plant.z")), None);
    }

    #[test]
    fn test_value_at_nearest_row() {
        let results = sample_results();
        let x = canonicalize("plant.x");
        assert_eq!(results.value_at(&x, 0.49), Some(1.0));
        assert_eq!(results.value_at(&x, 0.9), Some(2.0));
        assert_eq!(results.value_at(&canonicalize("nope"), 0.5), None);
    }
}
