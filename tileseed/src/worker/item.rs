//! Batches of tile work handed from the walker to the pool.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RetryPolicy;
use crate::cache::{CacheError, CacheManager, Dimensions};
use crate::grid::TileCoord;
use crate::progress::ProgressIdentifier;

/// Operation a work item performs on its tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Load the tiles, fetching upstream on miss.
    Seed,
    /// Remove the tiles.
    Cleanup,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seed => write!(f, "seed"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Failure recorded on a work item or raised by the pool itself.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The cache manager rejected the batch.
    #[error("{kind} of {tiles} tile(s) starting at {first} failed after {attempts} attempt(s): {source}")]
    Cache {
        kind: WorkKind,
        first: TileCoord,
        tiles: usize,
        attempts: u32,
        #[source]
        source: CacheError,
    },

    /// The cache manager panicked while handling the batch.
    #[error("{kind} of {tiles} tile(s) starting at {first} panicked: {message}")]
    Panicked {
        kind: WorkKind,
        first: TileCoord,
        tiles: usize,
        message: String,
    },

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// One batch of tile coordinates plus the manager to apply it to.
///
/// Owned by the pool queue until a worker executes it. The outcome stays on
/// the item.
pub struct WorkItem {
    kind: WorkKind,
    coords: Vec<TileCoord>,
    manager: Arc<dyn CacheManager>,
    task_id: Option<Arc<str>>,
    dimensions: Option<Arc<Dimensions>>,
    /// Traversal position the item was handed off at.
    position: ProgressIdentifier,
    load_all: bool,
    processed: usize,
    error: Option<WorkError>,
}

impl WorkItem {
    /// Seed batch. With `load_all` the manager refreshes the whole batch as
    /// soon as one tile is missing.
    pub fn seed(manager: Arc<dyn CacheManager>, coords: Vec<TileCoord>, load_all: bool) -> Self {
        Self::new(WorkKind::Seed, manager, coords, load_all)
    }

    pub fn cleanup(manager: Arc<dyn CacheManager>, coords: Vec<TileCoord>) -> Self {
        Self::new(WorkKind::Cleanup, manager, coords, false)
    }

    fn new(
        kind: WorkKind,
        manager: Arc<dyn CacheManager>,
        coords: Vec<TileCoord>,
        load_all: bool,
    ) -> Self {
        Self {
            kind,
            coords,
            manager,
            task_id: None,
            dimensions: None,
            position: ProgressIdentifier::new(),
            load_all,
            processed: 0,
            error: None,
        }
    }

    pub fn with_task_id(mut self, task_id: Arc<str>) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_dimensions(mut self, dimensions: Option<Arc<Dimensions>>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_position(mut self, position: ProgressIdentifier) -> Self {
        self.position = position;
        self
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn coords(&self) -> &[TileCoord] {
        &self.coords
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn position(&self) -> &ProgressIdentifier {
        &self.position
    }

    /// Tiles written or removed by the last execution.
    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn error(&self) -> Option<&WorkError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<WorkError> {
        self.error.take()
    }

    /// Records a panic caught around [`WorkItem::execute`].
    pub fn record_panic(&mut self, message: impl Into<String>) {
        self.processed = 0;
        self.error = Some(WorkError::Panicked {
            kind: self.kind,
            first: self.coords.first().copied().unwrap_or(TileCoord::new(0, 0, 0)),
            tiles: self.coords.len(),
            message: message.into(),
        });
    }

    /// Applies the batch to the manager and records the outcome.
    ///
    /// Seed batches retry per `policy`; cleanup batches run once. Returns
    /// `true` on success.
    pub fn execute(&mut self, policy: &RetryPolicy, cancel: &CancellationToken) -> bool {
        let Some(first) = self.coords.first().copied() else {
            return true;
        };

        let (result, attempts) = match self.kind {
            WorkKind::Seed => {
                let dims = self.dimensions.as_deref();
                policy.run(cancel, || {
                    self.manager.load_tile_coords(&self.coords, dims, self.load_all)
                })
            }
            WorkKind::Cleanup => (self.manager.remove_tile_coords(&self.coords), 1),
        };

        match result {
            Ok(n) => {
                self.processed = n;
                self.error = None;
                debug!(
                    task_id = self.task_id().unwrap_or_default(),
                    kind = %self.kind,
                    first = %first,
                    tiles = self.coords.len(),
                    processed = n,
                    "Work item done"
                );
                true
            }
            Err(source) => {
                self.error = Some(WorkError::Cache {
                    kind: self.kind,
                    first,
                    tiles: self.coords.len(),
                    attempts,
                    source,
                });
                false
            }
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.kind)
            .field("coords", &self.coords.len())
            .field("manager", &self.manager.name())
            .field("task_id", &self.task_id)
            .field("position", &self.position)
            .field("error", &self.error)
            .finish()
    }
}
