//! Profiling oracle and the defaults applied when it has nothing to say.
//!
//! A [`ProfileOracle`] answers `None` when it has no data for a site. The builder never
//! talks to the oracle directly; it goes through a [`ProfileView`], which substitutes the
//! conservative defaults (branches 50/50, switch targets uniform, exceptions seen) for
//! missing or malformed data. A gap in the profile is never a build failure.

use std::collections::HashMap;

use crate::{bytecode::Position, metadata::MethodId};

/// Tolerance used when checking that switch probabilities sum to one.
const SUM_TOLERANCE: f64 = 1e-3;

/// Source of execution-profile data.
pub trait ProfileOracle: Send + Sync {
    /// Probability that the conditional branch at `position` jumps to its explicit target.
    fn branch_probability(&self, method: MethodId, position: Position) -> Option<f64>;

    /// Probabilities of the switch successors at `position`: one per case in declaration
    /// order, followed by the default.
    fn switch_probabilities(&self, method: MethodId, position: Position) -> Option<Vec<f64>>;

    /// Whether an exception was ever observed at `position`.
    fn exception_seen(&self, method: MethodId, position: Position) -> Option<bool>;
}

/// An oracle without data. Every query falls back to the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProfile;

impl ProfileOracle for NoProfile {
    fn branch_probability(&self, _method: MethodId, _position: Position) -> Option<f64> {
        None
    }

    fn switch_probabilities(&self, _method: MethodId, _position: Position) -> Option<Vec<f64>> {
        None
    }

    fn exception_seen(&self, _method: MethodId, _position: Position) -> Option<bool> {
        None
    }
}

/// A map-backed oracle populated ahead of time.
///
/// # Examples
///
/// ```rust
/// use bytegraph::{bytecode::Position, metadata::MethodId, profile::RecordedProfile};
///
/// let profile = RecordedProfile::new()
///     .with_branch(MethodId::new(1), Position::new(4), 0.9)
///     .with_exception_seen(MethodId::new(1), Position::new(7), false);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordedProfile {
    branches: HashMap<(MethodId, Position), f64>,
    switches: HashMap<(MethodId, Position), Vec<f64>>,
    exceptions: HashMap<(MethodId, Position), bool>,
}

impl RecordedProfile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the taken probability of a conditional branch.
    #[must_use]
    pub fn with_branch(mut self, method: MethodId, position: Position, taken: f64) -> Self {
        self.branches.insert((method, position), taken);
        self
    }

    /// Records the successor distribution of a switch (cases, then default).
    #[must_use]
    pub fn with_switch(mut self, method: MethodId, position: Position, probs: Vec<f64>) -> Self {
        self.switches.insert((method, position), probs);
        self
    }

    /// Records whether an exception was observed at a site.
    #[must_use]
    pub fn with_exception_seen(mut self, method: MethodId, position: Position, seen: bool) -> Self {
        self.exceptions.insert((method, position), seen);
        self
    }
}

impl ProfileOracle for RecordedProfile {
    fn branch_probability(&self, method: MethodId, position: Position) -> Option<f64> {
        self.branches.get(&(method, position)).copied()
    }

    fn switch_probabilities(&self, method: MethodId, position: Position) -> Option<Vec<f64>> {
        self.switches.get(&(method, position)).cloned()
    }

    fn exception_seen(&self, method: MethodId, position: Position) -> Option<bool> {
        self.exceptions.get(&(method, position)).copied()
    }
}

fn is_probability(p: f64) -> bool {
    p.is_finite() && (0.0..=1.0).contains(&p)
}

/// Profile queries for one method, with gap recovery applied.
#[derive(Clone, Copy)]
pub struct ProfileView<'a> {
    oracle: &'a dyn ProfileOracle,
    method: MethodId,
}

impl<'a> ProfileView<'a> {
    /// Creates a view of `oracle` restricted to `method`.
    #[must_use]
    pub fn new(oracle: &'a dyn ProfileOracle, method: MethodId) -> Self {
        Self { oracle, method }
    }

    /// Taken probability of the branch at `position`; 0.5 without usable data.
    #[must_use]
    pub fn branch_probability(&self, position: Position) -> f64 {
        match self.oracle.branch_probability(self.method, position) {
            Some(p) if is_probability(p) => p,
            Some(p) => {
                tracing::trace!(method = %self.method, %position, p, "ignoring malformed branch profile");
                0.5
            }
            None => 0.5,
        }
    }

    /// Successor probabilities of the switch at `position`; uniform without usable data.
    #[must_use]
    pub fn switch_probabilities(&self, position: Position, count: usize) -> Vec<f64> {
        if count == 0 {
            return Vec::new();
        }
        if let Some(probs) = self.oracle.switch_probabilities(self.method, position) {
            let sum: f64 = probs.iter().sum();
            if probs.len() == count
                && probs.iter().all(|p| is_probability(*p))
                && (sum - 1.0).abs() <= SUM_TOLERANCE
            {
                return probs;
            }
            tracing::trace!(method = %self.method, %position, "ignoring malformed switch profile");
        }
        #[allow(clippy::cast_precision_loss)]
        let uniform = 1.0 / count as f64;
        vec![uniform; count]
    }

    /// Whether an exception may occur at `position`; `true` without data.
    #[must_use]
    pub fn exception_seen(&self, position: Position) -> bool {
        self.oracle
            .exception_seen(self.method, position)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: MethodId = MethodId::new(1);

    #[test]
    fn test_defaults_without_data() {
        let view = ProfileView::new(&NoProfile, M);
        assert!((view.branch_probability(Position::new(0)) - 0.5).abs() < f64::EPSILON);
        assert_eq!(view.switch_probabilities(Position::new(0), 4), vec![0.25; 4]);
        assert!(view.exception_seen(Position::new(0)));
    }

    #[test]
    fn test_recorded_data_is_used() {
        let profile = RecordedProfile::new()
            .with_branch(M, Position::new(2), 0.9)
            .with_switch(M, Position::new(3), vec![0.7, 0.2, 0.1])
            .with_exception_seen(M, Position::new(4), false);
        let view = ProfileView::new(&profile, M);

        assert!((view.branch_probability(Position::new(2)) - 0.9).abs() < f64::EPSILON);
        assert_eq!(
            view.switch_probabilities(Position::new(3), 3),
            vec![0.7, 0.2, 0.1]
        );
        assert!(!view.exception_seen(Position::new(4)));
    }

    #[test]
    fn test_malformed_data_is_ignored() {
        let profile = RecordedProfile::new()
            .with_branch(M, Position::new(0), f64::NAN)
            .with_branch(M, Position::new(1), 1.5)
            .with_switch(M, Position::new(2), vec![0.5, 0.5])
            .with_switch(M, Position::new(3), vec![0.9, 0.9]);
        let view = ProfileView::new(&profile, M);

        assert!((view.branch_probability(Position::new(0)) - 0.5).abs() < f64::EPSILON);
        assert!((view.branch_probability(Position::new(1)) - 0.5).abs() < f64::EPSILON);
        // Wrong arity
        assert_eq!(view.switch_probabilities(Position::new(2), 4), vec![0.25; 4]);
        // Does not sum to one
        assert_eq!(view.switch_probabilities(Position::new(3), 2), vec![0.5; 2]);
    }
}
