// Copyright 2026 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Timed and condition-triggered parameter mutation during integration.
//!
//! Time events become exact solver breakpoints; continuous events become
//! zero-crossing watches evaluated after every accepted step. Both kinds
//! only ever patch parameters, never the state vector: state continuity
//! across an event boundary is required for solver stability.

use std::collections::BTreeMap;
use std::collections::HashMap;

use ordered_float::OrderedFloat;
use smallvec::SmallVec;

use crate::common::{Ident, Result, canonicalize};
use crate::sim_err;
use crate::solver::ParamStore;

/// Which sign changes of a condition fire a continuous event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Any crossing.
    Any,
    /// Only negative-to-positive.
    Rising,
    /// Only positive-to-negative.
    Falling,
}

impl Direction {
    /// True if moving from `prev` to `curr` is a crossing this direction
    /// cares about. A previous value exactly at zero never re-fires.
    pub fn matches(&self, prev: f64, curr: f64) -> bool {
        if prev == 0.0 {
            return false;
        }
        match self {
            Direction::Any => prev * curr < 0.0 || curr == 0.0,
            Direction::Rising => prev < 0.0 && curr >= 0.0,
            Direction::Falling => prev > 0.0 && curr <= 0.0,
        }
    }
}

/// One parameter mutation: qualified name to new value.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub target: Ident,
    pub value: f64,
}

impl Patch {
    pub fn new(target: &str, value: f64) -> Self {
        Patch {
            target: canonicalize(target),
            value,
        }
    }
}

/// Read-only view of the live integration, handed to event callbacks.
pub struct IntegratorView<'a> {
    time: f64,
    offsets: &'a HashMap<Ident, usize>,
    row: &'a [f64],
    params: &'a ParamStore,
}

impl<'a> IntegratorView<'a> {
    pub(crate) fn new(
        time: f64,
        offsets: &'a HashMap<Ident, usize>,
        row: &'a [f64],
        params: &'a ParamStore,
    ) -> Self {
        IntegratorView {
            time,
            offsets,
            row,
            params,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Current value of a state or observed variable by qualified name.
    pub fn value(&self, name: &str) -> Option<f64> {
        let name = canonicalize(name);
        self.offsets.get(&name).map(|&off| self.row[off])
    }

    /// Current value of a parameter by qualified name.
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(&canonicalize(name))
    }
}

pub type Callback = Box<dyn FnMut(&IntegratorView) -> Result<Vec<Patch>>>;
pub type Condition = Box<dyn FnMut(&IntegratorView) -> f64>;

/// A fixed breakpoint: integration stops exactly at `time`, the callback
/// runs synchronously, and its patches apply before integration resumes.
pub struct TimeEvent {
    pub time: f64,
    pub callback: Callback,
}

/// A zero-crossing watch on a scalar condition.
pub struct ContinuousEvent {
    pub condition: Condition,
    pub affect: Callback,
    pub direction: Direction,
}

pub enum Event {
    Time(TimeEvent),
    Continuous(ContinuousEvent),
}

/// Schedule a callback at a fixed time.
pub fn at_time<F>(time: f64, callback: F) -> Event
where
    F: FnMut(&IntegratorView) -> Result<Vec<Patch>> + 'static,
{
    Event::Time(TimeEvent {
        time,
        callback: Box::new(callback),
    })
}

/// Fire `affect` when `condition` crosses zero in the given direction.
pub fn when_condition<C, A>(condition: C, affect: A, direction: Direction) -> Event
where
    C: FnMut(&IntegratorView) -> f64 + 'static,
    A: FnMut(&IntegratorView) -> Result<Vec<Patch>> + 'static,
{
    Event::Continuous(ContinuousEvent {
        condition: Box::new(condition),
        affect: Box::new(affect),
        direction,
    })
}

/// Per-run state machine over the registered events.
///
/// Breakpoints are keyed by time; events registered at the same instant
/// keep their registration order.
pub(crate) struct EventSchedule<'a> {
    events: &'a mut [Event],
    breakpoints: BTreeMap<OrderedFloat<f64>, SmallVec<[usize; 4]>>,
    continuous: Vec<usize>,
    prev_sign: HashMap<usize, f64>,
}

impl<'a> EventSchedule<'a> {
    pub fn new(events: &'a mut [Event]) -> Self {
        let mut breakpoints: BTreeMap<OrderedFloat<f64>, SmallVec<[usize; 4]>> = BTreeMap::new();
        let mut continuous = Vec::new();
        for (i, event) in events.iter().enumerate() {
            match event {
                Event::Time(te) => {
                    breakpoints.entry(OrderedFloat(te.time)).or_default().push(i);
                }
                Event::Continuous(_) => continuous.push(i),
            }
        }
        EventSchedule {
            events,
            breakpoints,
            continuous,
            prev_sign: HashMap::new(),
        }
    }

    /// The first breakpoint strictly after `t`, if any.
    pub fn next_breakpoint(&self, t: f64) -> Option<f64> {
        self.breakpoints
            .range((
                std::ops::Bound::Excluded(OrderedFloat(t)),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(k, _)| k.into_inner())
    }

    /// Indices of the time events registered exactly at `t`, in
    /// registration order.
    pub fn time_events_at(&self, t: f64) -> SmallVec<[usize; 4]> {
        self.breakpoints
            .get(&OrderedFloat(t))
            .cloned()
            .unwrap_or_default()
    }

    pub fn continuous_indices(&self) -> &[usize] {
        &self.continuous
    }

    pub fn call_time(&mut self, idx: usize, view: &IntegratorView) -> Result<Vec<Patch>> {
        match &mut self.events[idx] {
            Event::Time(te) => (te.callback)(view).map_err(|err| {
                crate::common::Error::new(
                    crate::common::ErrorKind::Simulation,
                    crate::common::ErrorCode::BadEventCallback,
                    Some(format!("time event at {}: {}", te.time, err)),
                )
            }),
            Event::Continuous(_) => sim_err!(Generic, format!("event {idx} is not a time event")),
        }
    }

    pub fn eval_condition(&mut self, idx: usize, view: &IntegratorView) -> Result<f64> {
        match &mut self.events[idx] {
            Event::Continuous(ce) => Ok((ce.condition)(view)),
            Event::Time(_) => sim_err!(Generic, format!("event {idx} is not continuous")),
        }
    }

    pub fn call_affect(&mut self, idx: usize, view: &IntegratorView) -> Result<Vec<Patch>> {
        match &mut self.events[idx] {
            Event::Continuous(ce) => (ce.affect)(view).map_err(|err| {
                crate::common::Error::new(
                    crate::common::ErrorKind::Simulation,
                    crate::common::ErrorCode::BadEventCallback,
                    Some(format!("continuous event affect: {err}")),
                )
            }),
            Event::Time(_) => sim_err!(Generic, format!("event {idx} is not continuous")),
        }
    }

    pub fn direction(&self, idx: usize) -> Direction {
        match &self.events[idx] {
            Event::Continuous(ce) => ce.direction,
            Event::Time(_) => Direction::Any,
        }
    }

    pub fn prev_sign(&self, idx: usize) -> Option<f64> {
        self.prev_sign.get(&idx).copied()
    }

    pub fn record_sign(&mut self, idx: usize, g: f64) {
        self.prev_sign.insert(idx, g);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_matching() {
        assert!(Direction::Any.matches(-1.0, 1.0));
        assert!(Direction::Any.matches(1.0, -1.0));
        assert!(Direction::Any.matches(-1.0, 0.0));
        assert!(!Direction::Any.matches(0.0, 1.0));
        assert!(!Direction::Any.matches(1.0, 2.0));

        assert!(Direction::Rising.matches(-0.5, 0.5));
        assert!(!Direction::Rising.matches(0.5, -0.5));
        assert!(Direction::Falling.matches(0.5, -0.5));
        assert!(!Direction::Falling.matches(-0.5, 0.5));
    }

    #[test]
    fn test_breakpoint_ordering() {
        let mut events = vec![
            at_time(2.0, |_| Ok(vec![])),
            at_time(1.0, |_| Ok(vec![])),
            at_time(2.0, |_| Ok(vec![])),
            when_condition(|v| v.time(), |_| Ok(vec![]), Direction::Any),
        ];
        let schedule = EventSchedule::new(&mut events);

        assert_eq!(schedule.next_breakpoint(0.0), Some(1.0));
        assert_eq!(schedule.next_breakpoint(1.0), Some(2.0));
        assert_eq!(schedule.next_breakpoint(2.0), None);

        // same-instant events keep registration order
        let at_two = schedule.time_events_at(2.0);
        assert_eq!(at_two.as_slice(), &[0, 2]);
        assert_eq!(schedule.continuous_indices(), &[3]);
    }

    #[test]
    fn test_patch_canonicalizes_target() {
        let patch = Patch::new("Gain.K", 5.0);
        assert_eq!(patch.target.as_str(), "gain·k");
        assert_eq!(patch.value, 5.0);
    }
}
