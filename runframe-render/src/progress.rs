//! Render progress estimate from worker lifecycle events.

use std::collections::HashSet;

use crate::worker::LifecycleEvent;

/// Lifecycle phases a single render id goes through.
pub const PHASES_PER_RENDER: u32 = 26;

/// Ceiling while the worker has not yet emitted more than two events per
/// render id.
const WARMUP_CEILING: f64 = 0.05;

/// Heuristic, monotonic progress in `[0, 1]`.
///
/// With `R` distinct render ids and `E` events observed, `raw = E / (R * P * 2)`
/// where `P` is [`PHASES_PER_RENDER`]. Once `E > 2R` the estimate is
/// `1 - e^(-3 raw)`; before that it stays under [`WARMUP_CEILING`].
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    phases_per_render: u32,
    render_ids: HashSet<String>,
    events: u64,
    published: f64,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new(PHASES_PER_RENDER)
    }
}

impl ProgressEstimator {
    pub fn new(phases_per_render: u32) -> Self {
        Self {
            phases_per_render: phases_per_render.max(1),
            render_ids: HashSet::new(),
            events: 0,
            published: 0.0,
        }
    }

    /// Record one event and return the published progress.
    pub fn observe(&mut self, event: &LifecycleEvent) -> f64 {
        self.render_ids.insert(event.render_id.clone());
        self.events += 1;
        let estimate = self.estimate();
        self.published = self.published.max(estimate).clamp(0.0, 1.0);
        self.published
    }

    pub fn progress(&self) -> f64 {
        self.published
    }

    /// Settlement: progress is complete regardless of the estimate.
    pub fn finish(&mut self) -> f64 {
        self.published = 1.0;
        self.published
    }

    pub fn render_count(&self) -> usize {
        self.render_ids.len()
    }

    pub fn event_count(&self) -> u64 {
        self.events
    }

    fn estimate(&self) -> f64 {
        let renders = self.render_ids.len() as f64;
        if renders == 0.0 {
            return 0.0;
        }
        let events = self.events as f64;
        let raw = events / (renders * f64::from(self.phases_per_render) * 2.0);
        if events > 2.0 * renders {
            1.0 - (-3.0 * raw).exp()
        } else {
            (WARMUP_CEILING * (1.0 - (-raw).exp())).min(WARMUP_CEILING)
        }
    }
}
