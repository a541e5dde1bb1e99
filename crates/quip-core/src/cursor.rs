use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Category;
use crate::storage::KeyValueStore;

pub const CURSOR_KEY: &str = "dailyquip:cursor";
const CURSOR_VERSION: u32 = 1;

/// Position within the displayed sequence plus the active filter
/// (`None` = every shard).
///
/// `index == total` is the end position: the user has moved past the last
/// card and the sequence is waiting to be extended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewingCursor {
    pub index: usize,
    pub filter: Option<Category>,
}

/// Result of a forward step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Already at (or past) the end of the sequence.
    NoMove,
    /// The target card is unseen and today's allowance is used up.
    LimitReached,
    Moved { index: usize, unseen: bool },
}

/// A card at `index` has not been counted yet today iff `index >= consumed`.
///
/// `consumed` is the global daily counter, while `index` belongs to the
/// active filter's own index space; the two are compared as-is.
pub fn is_unseen(index: usize, consumed: usize) -> bool {
    index >= consumed
}

impl ViewingCursor {
    pub fn new(filter: Option<Category>) -> Self {
        Self { index: 0, filter }
    }

    pub fn at_end(&self, total: usize) -> bool {
        self.index >= total
    }

    /// Moves one card forward, allowing a single step onto the end position.
    pub fn step_forward(&mut self, total: usize, consumed: usize, cap: Option<usize>) -> Step {
        if self.at_end(total) {
            return Step::NoMove;
        }
        let target = self.index + 1;
        let unseen = is_unseen(target, consumed);
        if unseen && cap.is_some_and(|cap| consumed >= cap) {
            return Step::LimitReached;
        }
        self.index = target;
        Step::Moved { index: target, unseen }
    }

    /// Returns `false` at index 0.
    pub fn step_back(&mut self) -> bool {
        if self.index == 0 {
            return false;
        }
        self.index -= 1;
        true
    }

    pub fn switch_filter(&mut self, filter: Option<Category>) {
        self.filter = filter;
        self.index = 0;
    }

    /// Restored positions never point past what the user has unlocked today
    /// or past the cards actually cached.
    pub fn clamp(&mut self, total: usize, consumed: usize, cap: Option<usize>) {
        let mut index = self.index;
        if cap.is_some() {
            index = index.min(consumed.saturating_sub(1));
        }
        self.index = index.min(total.saturating_sub(1));
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    version: u32,
    index: usize,
    filter: Option<Category>,
}

/// Persists the cursor as one versioned record. Failures are logged and
/// read as "no saved cursor".
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn KeyValueStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Option<ViewingCursor> {
        let bytes = match self.store.get(CURSOR_KEY).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(error = %e, "cursor read failed");
                return None;
            }
        };
        match serde_json::from_slice::<CursorRecord>(&bytes) {
            Ok(record) if record.version == CURSOR_VERSION => Some(ViewingCursor {
                index: record.index,
                filter: record.filter,
            }),
            Ok(record) => {
                warn!(version = record.version, "unsupported cursor version");
                None
            }
            Err(e) => {
                warn!(error = %e, "stored cursor could not be decoded");
                None
            }
        }
    }

    pub async fn save(&self, cursor: &ViewingCursor) {
        let record = CursorRecord {
            version: CURSOR_VERSION,
            index: cursor.index,
            filter: cursor.filter,
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode cursor");
                return;
            }
        };
        match self.store.set(CURSOR_KEY, &bytes).await {
            Ok(()) => debug!(index = cursor.index, filter = ?cursor.filter, "cursor saved"),
            Err(e) => warn!(error = %e, "cursor write failed"),
        }
    }
}
