//! Local (per-element and per-face) assembly kernels.

mod convection_diffusion;
mod penalty;

pub use convection_diffusion::*;
pub use penalty::*;

use crate::Real;

/// Diagnostics collected while visiting skeleton and boundary faces: the
/// running minimum and maximum of the characteristic face diameter.
///
/// Purely observational (nothing feeds back into the computation), but an
/// explicit output rather than hidden mutable state, so one operator
/// instance can be shared read-only across assembly threads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkeletonStats<T> {
    min_h: Option<T>,
    max_h: Option<T>,
}

impl<T> Default for SkeletonStats<T> {
    fn default() -> Self {
        Self {
            min_h: None,
            max_h: None,
        }
    }
}

impl<T: Real> SkeletonStats<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record(&mut self, h: T) {
        self.min_h = Some(self.min_h.map_or(h, |m| m.min(h)));
        self.max_h = Some(self.max_h.map_or(h, |m| m.max(h)));
    }

    /// Merges another set of statistics into this one.
    pub fn merge(&mut self, other: &SkeletonStats<T>) {
        if let Some(h) = other.min_h {
            self.record(h);
        }
        if let Some(h) = other.max_h {
            self.record(h);
        }
    }

    /// Smallest face diameter seen, if any face has been visited.
    pub fn min_h(&self) -> Option<T> {
        self.min_h
    }

    /// Largest face diameter seen, if any face has been visited.
    pub fn max_h(&self) -> Option<T> {
        self.max_h
    }
}
