//! Batch orchestration: decides when to fetch in the foreground, when to
//! prefetch in the background, and merges results into the cache without
//! moving the reader.
//!
//! All cache and cursor mutations happen while holding `Inner::state`.
//! Generation calls run with the lock released and re-acquire it to apply
//! their results.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CardCache};
use crate::clock::Clock;
use crate::cursor::{is_unseen, CursorStore, Step, ViewingCursor};
use crate::entitlement::Entitlement;
use crate::error::{FailureChannel, PipelineError};
use crate::generator::CardGenerator;
use crate::model::{Card, Category, GenerationRequest};
use crate::storage::KeyValueStore;

pub const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Cards requested per generation call.
    pub batch_size: usize,
    /// Categories an unfiltered fetch spans.
    pub selected: Vec<Category>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            selected: Category::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPhase {
    #[default]
    Idle,
    /// A blocking fetch is outstanding; the reader is waiting.
    Fetching,
    /// A background fetch is outstanding.
    Prefetching,
    /// The last intent merged a prefetched batch.
    Merged,
}

/// What the UI layer reads. Published after every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineView {
    pub current: Option<Card>,
    pub index: usize,
    pub total: usize,
    pub filter: Option<Category>,
    pub phase: BatchPhase,
    /// Last foreground failure, cleared by the next successful fetch or retry.
    pub error: Option<PipelineError>,
    pub background_failures: u64,
    pub remaining_today: Option<usize>,
}

impl PipelineView {
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.index.min(self.total) as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved,
    /// Today's allowance is used up; the cursor did not move.
    LimitReached,
    /// Nothing to advance to.
    AtEnd,
    /// The day changed; the deck was rebuilt and the cursor is back at the
    /// first card.
    Restarted,
}

#[derive(Debug)]
struct BufferedBatch {
    scope: Option<Category>,
    cards: Vec<Card>,
}

#[derive(Debug, Default)]
struct PrefetchSlot {
    in_flight: bool,
    buffer: Option<BufferedBatch>,
}

#[derive(Debug)]
struct State {
    cache: CardCache,
    cursor: ViewingCursor,
    /// Outstanding blocking fetches. These are not deduplicated.
    fetching: usize,
    prefetch: PrefetchSlot,
    just_merged: bool,
    error: Option<PipelineError>,
    background_failures: u64,
    loaded: bool,
}

impl State {
    fn view_len(&self) -> usize {
        self.cache.len(self.cursor.filter)
    }

    fn current(&self) -> Option<&Card> {
        self.cache.card_at(self.cursor.filter, self.cursor.index)
    }

    fn parked(&self) -> bool {
        self.cursor.at_end(self.view_len())
    }

    fn report(&mut self, channel: FailureChannel, err: &PipelineError) {
        match channel {
            FailureChannel::Foreground => {
                warn!(error = %err, "card fetch failed");
                self.error = Some(err.clone());
            }
            FailureChannel::Background => {
                self.background_failures += 1;
                warn!(error = %err, failures = self.background_failures, "background prefetch failed");
            }
        }
    }

    fn merge(&mut self, cards: Vec<Card>) -> usize {
        let added = self.cache.extend(cards);
        self.just_merged = true;
        added
    }
}

struct Inner {
    generator: Arc<dyn CardGenerator>,
    entitlement: Arc<dyn Entitlement>,
    clock: Arc<dyn Clock>,
    cache_store: CacheStore,
    cursor_store: CursorStore,
    settings: PipelineSettings,
    state: Mutex<State>,
    view_tx: watch::Sender<PipelineView>,
}

/// The content pipeline. Cheap to clone; clones share one owner.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

type Guard<'a> = MutexGuard<'a, State>;

impl Pipeline {
    pub fn new(
        generator: Arc<dyn CardGenerator>,
        entitlement: Arc<dyn Entitlement>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        let state = State {
            cache: CardCache::new(clock.today()),
            cursor: ViewingCursor::default(),
            fetching: 0,
            prefetch: PrefetchSlot::default(),
            just_merged: false,
            error: None,
            background_failures: 0,
            loaded: false,
        };
        let (view_tx, _) = watch::channel(PipelineView::default());
        Self {
            inner: Arc::new(Inner {
                generator,
                entitlement,
                cache_store: CacheStore::new(store.clone(), clock.clone()),
                cursor_store: CursorStore::new(store),
                clock,
                settings,
                state: Mutex::new(state),
                view_tx,
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn view(&self) -> PipelineView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineView> {
        self.inner.view_tx.subscribe()
    }

    pub fn current_card(&self) -> Option<Card> {
        self.inner.view_tx.borrow().current.clone()
    }

    pub fn total_count(&self) -> usize {
        self.inner.view_tx.borrow().total
    }

    pub fn current_index(&self) -> usize {
        self.inner.view_tx.borrow().index
    }

    /// Restores persisted state and makes sure the active view has content,
    /// fetching in the foreground on a cold start.
    pub async fn load(&self) -> Result<(), PipelineError> {
        let (state, _) = self.begin().await;
        let (state, result) = self.ensure_content(state).await;
        self.publish(&state);
        result
    }

    pub async fn advance(&self) -> Result<Advance, PipelineError> {
        let (mut state, rolled_over) = self.begin().await;
        if rolled_over {
            let (state, result) = self.ensure_content(state).await;
            self.publish(&state);
            return result.map(|()| Advance::Restarted);
        }
        let entitlement = &self.inner.entitlement;
        let total = state.view_len();
        let step = state.cursor.step_forward(total, entitlement.consumed_today(), entitlement.daily_cap());

        let (state, result) = match step {
            Step::NoMove => (state, Ok(Advance::AtEnd)),
            Step::LimitReached => {
                info!(index = state.cursor.index, "daily card limit reached");
                (state, Ok(Advance::LimitReached))
            }
            Step::Moved { index, .. } if index < total => {
                self.inner.cursor_store.save(&state.cursor).await;
                self.note_view(&state).await;
                if total - index == 1 {
                    self.spawn_prefetch(&mut state);
                }
                (state, Ok(Advance::Moved))
            }
            Step::Moved { index, .. } => {
                debug!(index, "reached end of sequence");
                self.inner.cursor_store.save(&state.cursor).await;
                let (state, result) = self.extend_sequence(state).await;
                (state, result.map(|()| Advance::Moved))
            }
        };
        self.publish(&state);
        result
    }

    /// Returns `false` when already at the first card.
    pub async fn retreat(&self) -> bool {
        let (mut state, rolled_over) = self.begin().await;
        if rolled_over {
            // Failures land in the published view.
            let (state, _) = self.ensure_content(state).await;
            self.publish(&state);
            return false;
        }
        let moved = state.cursor.step_back();
        if moved {
            self.inner.cursor_store.save(&state.cursor).await;
        }
        self.publish(&state);
        moved
    }

    pub async fn switch_filter(&self, filter: Option<Category>) -> Result<(), PipelineError> {
        let (mut state, _) = self.begin().await;
        state.cursor.switch_filter(filter);
        state.error = None;
        self.absorb_stale_buffer(&mut state).await;
        self.inner.cursor_store.save(&state.cursor).await;
        info!(filter = ?filter, cached = state.view_len(), "filter switched");
        let (state, result) = self.ensure_content(state).await;
        self.publish(&state);
        result
    }

    /// Re-attempts whatever left the reader without a card.
    pub async fn retry(&self) -> Result<(), PipelineError> {
        let (mut state, _) = self.begin().await;
        state.error = None;
        let (state, result) = if state.view_len() > 0 && state.parked() {
            self.extend_sequence(state).await
        } else {
            self.ensure_content(state).await
        };
        self.publish(&state);
        result
    }

    /// Locks the owner, restoring persisted state on first use and starting
    /// over when the calendar day has changed. The flag reports a rollover.
    async fn begin(&self) -> (Guard<'_>, bool) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        state.just_merged = false;

        if !state.loaded {
            state.cache = inner.cache_store.restore().await;
            let saved = inner.cursor_store.load().await.unwrap_or_default();
            let mut cursor = saved;
            cursor.clamp(
                state.cache.len(cursor.filter),
                inner.entitlement.consumed_today(),
                inner.entitlement.daily_cap(),
            );
            if cursor != saved {
                debug!(saved = saved.index, restored = cursor.index, "cursor clamped on load");
                inner.cursor_store.save(&cursor).await;
            }
            state.cursor = cursor;
            state.loaded = true;
        }

        let today = inner.clock.today();
        if !state.cache.is_fresh(today) {
            info!(cached_day = %state.cache.day(), %today, "day changed, discarding card cache");
            inner.cache_store.discard().await;
            state.cache = CardCache::new(today);
            state.cursor.index = 0;
            state.prefetch.buffer = None;
            state.error = None;
            inner.cursor_store.save(&state.cursor).await;
            return (state, true);
        }
        (state, false)
    }

    async fn ensure_content<'a>(&'a self, state: Guard<'a>) -> (Guard<'a>, Result<(), PipelineError>) {
        if state.current().is_some() {
            self.note_view(&state).await;
            return (state, Ok(()));
        }
        if state.view_len() > 0 {
            return self.extend_sequence(state).await;
        }

        let categories = if state.cache.is_empty() {
            // Cold start spans every selected category, plus the active filter.
            let mut categories = self.inner.settings.selected.clone();
            if let Some(filter) = state.cursor.filter {
                if !categories.contains(&filter) {
                    categories.push(filter);
                }
            }
            categories
        } else {
            self.scope_categories(state.cursor.filter)
        };
        self.fill(state, categories).await
    }

    /// Called with the cursor on the end position: merges the buffered
    /// prefetch, falling back to a blocking fetch when that does not extend
    /// the view.
    async fn extend_sequence<'a>(&'a self, mut state: Guard<'a>) -> (Guard<'a>, Result<(), PipelineError>) {
        if let Some(batch) = state.prefetch.buffer.take() {
            let before = state.view_len();
            let added = state.merge(batch.cards);
            self.inner.cache_store.persist(&state.cache).await;
            info!(
                added,
                scope = ?batch.scope,
                extended_by = state.view_len() - before,
                "merged prefetched batch"
            );
        }

        if state.current().is_some() {
            self.note_view(&state).await;
            self.spawn_prefetch(&mut state);
            return (state, Ok(()));
        }

        let categories = self.scope_categories(state.cursor.filter);
        self.fill(state, categories).await
    }

    /// Blocking fetch that must leave a card under the cursor.
    async fn fill<'a>(&'a self, state: Guard<'a>, categories: Vec<Category>) -> (Guard<'a>, Result<(), PipelineError>) {
        let (mut state, result) = self.fetch_blocking(state, categories).await;
        if let Err(e) = result {
            return (state, Err(e));
        }
        if state.current().is_none() {
            let err = PipelineError::EmptyResult;
            state.report(FailureChannel::Foreground, &err);
            return (state, Err(err));
        }
        state.error = None;
        self.note_view(&state).await;
        self.spawn_prefetch(&mut state);
        (state, Ok(()))
    }

    /// Runs one generation call with the owner released.
    async fn fetch_blocking<'a>(
        &'a self,
        mut state: Guard<'a>,
        categories: Vec<Category>,
    ) -> (Guard<'a>, Result<usize, PipelineError>) {
        state.fetching += 1;
        self.publish(&state);
        drop(state);

        let request = GenerationRequest::new(categories, self.inner.settings.batch_size);
        let result = self.inner.generator.generate(&request).await;

        let mut state = self.inner.state.lock().await;
        state.fetching = state.fetching.saturating_sub(1);
        match result {
            Ok(cards) => {
                let added = state.cache.extend(cards);
                self.inner.cache_store.persist(&state.cache).await;
                info!(added, total = state.cache.len(None), "fetched cards");
                (state, Ok(added))
            }
            Err(e) => {
                state.report(FailureChannel::Foreground, &e);
                (state, Err(e))
            }
        }
    }

    /// A buffered batch fetched for another filter goes into the cache, which
    /// only appends, so it never holds up prefetching for the current one.
    async fn absorb_stale_buffer(&self, state: &mut State) {
        let stale = state
            .prefetch
            .buffer
            .as_ref()
            .is_some_and(|batch| batch.scope != state.cursor.filter);
        if !stale {
            return;
        }
        if let Some(batch) = state.prefetch.buffer.take() {
            let added = state.cache.extend(batch.cards);
            self.inner.cache_store.persist(&state.cache).await;
            debug!(added, scope = ?batch.scope, "merged batch prefetched for a previous filter");
        }
    }

    /// Starts a background fetch for the current scope unless one is in
    /// flight or a batch for this scope is already waiting.
    fn spawn_prefetch(&self, state: &mut State) {
        let waiting = state
            .prefetch
            .buffer
            .as_ref()
            .is_some_and(|batch| batch.scope == state.cursor.filter);
        if state.prefetch.in_flight || waiting {
            debug!("prefetch already pending, skipping");
            return;
        }
        state.prefetch.in_flight = true;
        let scope = state.cursor.filter;
        debug!(scope = ?scope, "starting prefetch");
        tokio::spawn(self.clone().run_prefetch(scope));
    }

    async fn run_prefetch(self, scope: Option<Category>) {
        let request = GenerationRequest::new(self.scope_categories(scope), self.inner.settings.batch_size);
        let result = self.inner.generator.generate(&request).await;

        let mut state = self.inner.state.lock().await;
        state.prefetch.in_flight = false;
        match result {
            Ok(cards) if state.parked() => {
                let added = state.merge(cards);
                self.inner.cache_store.persist(&state.cache).await;
                info!(added, "prefetch landed at end of sequence, merged");
                if state.current().is_some() {
                    state.error = None;
                    self.note_view(&state).await;
                    self.spawn_prefetch(&mut state);
                }
            }
            Ok(cards) if scope != state.cursor.filter => {
                let added = state.cache.extend(cards);
                self.inner.cache_store.persist(&state.cache).await;
                debug!(added, scope = ?scope, "prefetch for a previous filter merged into cache");
                // The one for the current filter was skipped while this was in flight.
                if state.view_len().saturating_sub(state.cursor.index) == 1 {
                    self.spawn_prefetch(&mut state);
                }
            }
            Ok(cards) => {
                debug!(count = cards.len(), scope = ?scope, "prefetched batch buffered");
                state.prefetch.buffer = Some(BufferedBatch { scope, cards });
            }
            Err(e) => state.report(FailureChannel::Background, &e),
        }
        self.publish(&state);
    }

    /// Counts the card under the cursor against today's allowance if it has
    /// not been counted yet.
    async fn note_view(&self, state: &State) {
        if state.current().is_none() {
            return;
        }
        let entitlement = &self.inner.entitlement;
        let consumed = entitlement.consumed_today();
        if !is_unseen(state.cursor.index, consumed) {
            return;
        }
        if entitlement.daily_cap().is_some_and(|cap| consumed >= cap) {
            return;
        }
        entitlement.record_consumption().await;
    }

    fn scope_categories(&self, scope: Option<Category>) -> Vec<Category> {
        match scope {
            Some(category) => vec![category],
            None => self.inner.settings.selected.clone(),
        }
    }

    fn publish(&self, state: &State) {
        let phase = if state.fetching > 0 {
            BatchPhase::Fetching
        } else if state.prefetch.in_flight {
            BatchPhase::Prefetching
        } else if state.just_merged {
            BatchPhase::Merged
        } else {
            BatchPhase::Idle
        };
        let view = PipelineView {
            current: state.current().cloned(),
            index: state.cursor.index,
            total: state.view_len(),
            filter: state.cursor.filter,
            phase,
            error: state.error.clone(),
            background_failures: state.background_failures,
            remaining_today: self.inner.entitlement.remaining_today(),
        };
        self.inner.view_tx.send_replace(view);
    }
}
