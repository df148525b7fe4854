//! Lazy-load (N+1) detection.
//!
//! Navigating a relationship that was not eager-loaded costs one store query
//! per root. The tracker counts those lazy loads per (entity, relation) and
//! warns once a pair reaches the threshold, pointing at
//! `UnitOfWork::eager_load` which fetches the same data in one query.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::Location;

/// Load sites kept (and printed) per relation.
const SITES_PER_RELATION: usize = 5;

/// Where a lazy load was triggered.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSite {
    pub entity: &'static str,
    pub relation: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// Summary of recorded lazy loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LazyLoadStats {
    /// Lazy loads recorded
    pub total_loads: usize,
    /// Distinct (entity, relation) pairs loaded lazily
    pub relations_loaded: usize,
    /// Pairs at or above the threshold
    pub potential_n1: usize,
}

/// Counts lazy relationship loads.
#[derive(Debug)]
pub struct LazyLoadTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    sites: Vec<LoadSite>,
}

impl LazyLoadTracker {
    /// Tracker that warns when one relation is lazily loaded `threshold` times.
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
            sites: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy load of `entity.relation` at the caller's location.
    #[track_caller]
    pub fn record(&mut self, entity: &'static str, relation: &'static str) {
        self.record_at(entity, relation, Location::caller());
    }

    /// Record one lazy load triggered at `caller`.
    pub fn record_at(
        &mut self,
        entity: &'static str,
        relation: &'static str,
        caller: &'static Location<'static>,
    ) {
        let count = self.counts.entry((entity, relation)).or_insert(0);
        *count += 1;
        let count = *count;

        if count <= SITES_PER_RELATION {
            self.sites.push(LoadSite {
                entity,
                relation,
                file: caller.file(),
                line: caller.line(),
            });
        }

        if count == self.threshold {
            tracing::warn!(
                target: "entitymap::n1",
                entity = entity,
                relation = relation,
                queries = count,
                threshold = self.threshold,
                "N+1 load pattern detected, eager-load this relation instead"
            );
            for (i, site) in self
                .sites
                .iter()
                .filter(|s| s.entity == entity && s.relation == relation)
                .enumerate()
            {
                tracing::debug!(
                    target: "entitymap::n1",
                    index = i,
                    file = site.file,
                    line = site.line,
                    "lazy load site"
                );
            }
        }
    }

    /// Lazy loads recorded for one relation.
    pub fn count_for(&self, entity: &str, relation: &str) -> usize {
        self.counts
            .iter()
            .find(|((e, r), _)| *e == entity && *r == relation)
            .map_or(0, |(_, c)| *c)
    }

    /// The first few load sites of each relation, in recording order.
    pub fn sites(&self) -> &[LoadSite] {
        &self.sites
    }

    pub fn stats(&self) -> LazyLoadStats {
        LazyLoadStats {
            total_loads: self.counts.values().sum(),
            relations_loaded: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.sites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_relation() {
        let mut tracker = LazyLoadTracker::new(3);
        for _ in 0..4 {
            tracker.record("author", "books");
        }
        tracker.record("book", "author");

        assert_eq!(tracker.count_for("author", "books"), 4);
        assert_eq!(tracker.count_for("book", "author"), 1);
        assert_eq!(tracker.count_for("book", "reviews"), 0);
        assert_eq!(
            tracker.stats(),
            LazyLoadStats {
                total_loads: 5,
                relations_loaded: 2,
                potential_n1: 1,
            }
        );
    }

    #[test]
    fn sites_point_at_caller() {
        let mut tracker = LazyLoadTracker::new(2);
        tracker.record("author", "books");
        let site = &tracker.sites()[0];
        assert!(site.file.ends_with("n1_detection.rs"));
        assert!(site.line > 0);

        tracker.reset();
        assert!(tracker.sites().is_empty());
        assert_eq!(tracker.stats().total_loads, 0);
    }

    #[test]
    fn sites_are_capped_per_relation() {
        let mut tracker = LazyLoadTracker::new(2);
        for _ in 0..50 {
            tracker.record("author", "books");
        }
        tracker.record("book", "author");

        assert_eq!(tracker.count_for("author", "books"), 50);
        assert_eq!(tracker.sites().len(), SITES_PER_RELATION + 1);
        assert_eq!(tracker.sites().last().map(|s| s.relation), Some("author"));
    }

    #[test]
    fn threshold_is_at_least_one() {
        assert_eq!(LazyLoadTracker::new(0).threshold(), 1);
    }
}
