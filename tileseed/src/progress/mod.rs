//! Resumable traversal position and progress accounting.
//!
//! The walker enumerates the pyramid depth-first. Every position it visits
//! is labelled by the path of `(index, total)` pairs from the root, one pair
//! per depth:
//!
//! ```text
//! root ─┬─ (0,4) ─┬─ (0,4)     path [(0,4),(0,4)]
//!       │         ├─ (1,4)     path [(0,4),(1,4)]
//!       │         └─ ...
//!       ├─ (1,4) ── ...        path [(1,4), ...]
//!       └─ ...
//! ```
//!
//! A path stored by an interrupted run lets the next run skip every subtree
//! that lies strictly behind it ([`can_skip`]). The same structure drives a
//! monotonic completion fraction for logging and ETA estimates.

mod logger;
mod store;

pub use logger::{save_progress, LogProgressLogger, ProgressLogger, DEFAULT_STEP_INTERVAL};
pub use store::{JsonProgressStore, ProgressStore, StoreError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Position in the depth-first traversal, outermost level first.
///
/// Serialized as a JSON list of `[index, total]` pairs. An empty identifier
/// means nothing has been done yet.
///
/// Ordering is lexicographic with a prefix before its extensions. The
/// smallest of a set of identifiers is never skipped by a resume that
/// starts from it, and neither is any other member of the set.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressIdentifier(Vec<(u32, u32)>);

impl ProgressIdentifier {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[(u32, u32)] {
        &self.0
    }
}

impl From<Vec<(u32, u32)>> for ProgressIdentifier {
    fn from(path: Vec<(u32, u32)>) -> Self {
        Self(path)
    }
}

impl fmt::Display for ProgressIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&progress_string(&self.0))
    }
}

/// Decides whether the position `current` was already finished by a run
/// that stopped at `old`.
///
/// Positions are compared pairwise from the root. The first difference
/// decides: `old` ahead means skippable, `old` behind means redo. If one path
/// runs out first, or both are equal, the position is redone. An empty `old`
/// never skips.
pub fn can_skip(old: &[(u32, u32)], current: &[(u32, u32)]) -> bool {
    for (o, c) in old.iter().zip(current.iter()) {
        if o < c {
            return false;
        }
        if o > c {
            return true;
        }
    }
    false
}

/// Renders a path as a compact glyph string.
///
/// Quadtree steps use `┌ ┐ └ ┘` for their quadrant, single-child steps a
/// `-`, anything else `[index/total]`.
pub fn progress_string(path: &[(u32, u32)]) -> String {
    const QUADRANTS: [char; 4] = ['┌', '┐', '└', '┘'];
    let mut out = String::new();
    for &(index, total) in path {
        match total {
            1 => out.push('-'),
            4 if index < 4 => out.push(QUADRANTS[index as usize]),
            _ => out.push_str(&format!("[{}/{}]", index, total)),
        }
    }
    out
}

// ============================================================================
// ETA
// ============================================================================

/// Remaining-time estimate from elapsed time and completion fraction.
#[derive(Debug, Clone)]
pub struct Eta {
    started: Instant,
}

impl Eta {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Linear extrapolation. `None` until some progress has been made.
    pub fn remaining(&self, fraction: f64) -> Option<Duration> {
        self.remaining_after(self.elapsed(), fraction)
    }

    fn remaining_after(&self, elapsed: Duration, fraction: f64) -> Option<Duration> {
        if fraction <= 0.0 || !fraction.is_finite() {
            return None;
        }
        let fraction = fraction.min(1.0);
        let total = elapsed.as_secs_f64() / fraction;
        Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
    }
}

impl Default for Eta {
    fn default() -> Self {
        Self::start()
    }
}

/// Formats a duration as `1h02m03s`, `2m03s` or `3s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

// ============================================================================
// SeedProgress
// ============================================================================

/// Point-in-time copy of a [`SeedProgress`] for loggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Completion in `[0, 1]`.
    pub fraction: f64,
    /// Identifier that is safe to persist right now.
    pub identifier: ProgressIdentifier,
    /// Glyph rendering of the current path.
    pub path: String,
    pub eta: Option<Duration>,
    /// True while the walk is still inside already-finished territory.
    pub already_processed: bool,
}

/// Traversal position plus completion counter.
///
/// Owned by the walking thread. Each stack entry holds the child position
/// and the share of the whole pyramid that child stands for.
#[derive(Debug, Clone)]
pub struct SeedProgress {
    old: Option<ProgressIdentifier>,
    current: Vec<(u32, u32)>,
    /// Oldest position handed off but not yet finished.
    in_flight: Option<ProgressIdentifier>,
    shares: Vec<f64>,
    fraction: f64,
    eta: Eta,
}

impl SeedProgress {
    /// Starts a fresh count, optionally resuming after `old`.
    pub fn new(old: Option<ProgressIdentifier>) -> Self {
        Self {
            old: old.filter(|o| !o.is_empty()),
            current: Vec::new(),
            in_flight: None,
            shares: vec![1.0],
            fraction: 0.0,
            eta: Eta::start(),
        }
    }

    /// Enters child `index` of `total` at the next depth.
    pub fn step_down(&mut self, index: u32, total: u32) {
        let parent = self.share();
        self.current.push((index, total));
        self.shares.push(parent / total.max(1) as f64);
    }

    /// Leaves the child entered by the matching [`SeedProgress::step_down`].
    pub fn step_up(&mut self) {
        if self.current.pop().is_some() {
            self.shares.pop();
        }
    }

    /// Runs `body` inside child `index` of `total`.
    pub fn with_step<R>(&mut self, index: u32, total: u32, body: impl FnOnce(&mut Self) -> R) -> R {
        self.step_down(index, total);
        let result = body(self);
        self.step_up();
        result
    }

    /// Credits one `n`-th of the current share as done.
    pub fn step_forward(&mut self, n: u32) {
        self.fraction = (self.fraction + self.share() / n.max(1) as f64).min(1.0);
    }

    /// True if the current position was finished by the previous run.
    pub fn already_processed(&self) -> bool {
        match &self.old {
            Some(old) => can_skip(old.as_slice(), &self.current),
            None => false,
        }
    }

    /// Identifier to persist: the old one while still catching up with it,
    /// held back to the oldest unfinished hand-off if that lies behind.
    pub fn current_progress_identifier(&self) -> ProgressIdentifier {
        let reached = match &self.old {
            Some(old) if self.already_processed() || self.current.is_empty() => old.clone(),
            _ => ProgressIdentifier(self.current.clone()),
        };
        match &self.in_flight {
            Some(pending) if *pending < reached => pending.clone(),
            _ => reached,
        }
    }

    /// Records the oldest position whose work is still queued or running.
    /// `None` once everything handed off has finished.
    pub fn set_in_flight(&mut self, oldest: Option<ProgressIdentifier>) {
        self.in_flight = oldest;
    }

    pub fn current_path(&self) -> &[(u32, u32)] {
        &self.current
    }

    pub fn old_progress_identifier(&self) -> Option<&ProgressIdentifier> {
        self.old.as_ref()
    }

    /// Completion in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn progress_string(&self) -> String {
        progress_string(&self.current)
    }

    pub fn eta(&self) -> &Eta {
        &self.eta
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            fraction: self.fraction,
            identifier: self.current_progress_identifier(),
            path: self.progress_string(),
            eta: self.eta.remaining(self.fraction),
            already_processed: self.already_processed(),
        }
    }

    fn share(&self) -> f64 {
        self.shares.last().copied().unwrap_or(1.0)
    }
}

impl Default for SeedProgress {
    fn default() -> Self {
        Self::new(None)
    }
}
