use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;
use uuid::Uuid;

use quip_core::cache::SNAPSHOT_KEY;
use quip_core::clock::{Clock, FixedClock};
use quip_core::cursor::CURSOR_KEY;
use quip_core::entitlement::{DailyAllowance, Entitlement, Tier};
use quip_core::error::PipelineError;
use quip_core::generator::CardGenerator;
use quip_core::model::{Card, Category, GenerationRequest};
use quip_core::orchestrator::{Advance, BatchPhase, Pipeline, PipelineSettings};
use quip_core::storage::{KeyValueStore, MemoryStore};

fn card(title: &str, category: Category) -> Card {
    Card {
        id: Uuid::new_v4(),
        title: title.to_string(),
        category,
        image_url: String::new(),
        body: format!("{title} explained."),
        tags: vec![],
        source: "test".to_string(),
        difficulty: 3,
        estimated_read_secs: 30,
        created_at: Utc::now(),
    }
}

/// Answers by call number. Unscripted calls get synthetic cards spread over
/// the requested categories. Held calls wait until `release` is called.
struct FakeGenerator {
    responses: Mutex<HashMap<usize, Result<Vec<Card>, PipelineError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    held: HashSet<usize>,
    gate: Semaphore,
}

impl FakeGenerator {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            held: HashSet::new(),
            gate: Semaphore::new(0),
        }
    }

    fn respond(self, call: usize, response: Result<Vec<Card>, PipelineError>) -> Self {
        self.responses.lock().insert(call, response);
        self
    }

    fn hold(mut self, call: usize) -> Self {
        self.held.insert(call);
        self
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CardGenerator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Card>, PipelineError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        if self.held.contains(&call) {
            self.gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(response) = self.responses.lock().remove(&call) {
            return response;
        }
        Ok((0..request.count)
            .map(|i| {
                let category = request.categories[i % request.categories.len()];
                card(&format!("call {call} card {i}"), category)
            })
            .collect())
    }
}

struct Harness {
    pipeline: Pipeline,
    generator: Arc<FakeGenerator>,
    allowance: Arc<DailyAllowance>,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

async fn harness(generator: FakeGenerator, tier: Tier, selected: &[Category]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::on(today()));
    reopen(generator, tier, selected, store, clock).await
}

/// A fresh pipeline over existing storage, as after an app restart.
async fn reopen(
    generator: FakeGenerator,
    tier: Tier,
    selected: &[Category],
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
) -> Harness {
    let generator = Arc::new(generator);
    let allowance = Arc::new(DailyAllowance::load(store.clone(), clock.clone(), tier).await);
    let pipeline = Pipeline::new(
        generator.clone(),
        allowance.clone(),
        store.clone(),
        clock.clone(),
        PipelineSettings {
            batch_size: 5,
            selected: selected.to_vec(),
        },
    );
    Harness {
        pipeline,
        generator,
        allowance,
        store,
        clock,
    }
}

/// Waits until no fetch or prefetch is outstanding.
async fn settle(pipeline: &Pipeline) {
    let mut rx = pipeline.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|v| !matches!(v.phase, BatchPhase::Fetching | BatchPhase::Prefetching)),
    )
    .await
    .expect("pipeline did not settle")
    .expect("view channel closed");
}

async fn advance_times(pipeline: &Pipeline, n: usize) {
    for _ in 0..n {
        assert_eq!(pipeline.advance().await.unwrap(), Advance::Moved);
    }
}

fn current_id(pipeline: &Pipeline) -> Uuid {
    pipeline.current_card().expect("a current card").id
}

#[tokio::test]
async fn cold_start_fetches_every_selected_category_then_prefetches() {
    let h = harness(FakeGenerator::new(), Tier::Lifetime, &[Category::Science, Category::History]).await;

    h.pipeline.load().await.unwrap();
    assert_eq!(h.pipeline.total_count(), 5);
    assert_eq!(h.pipeline.current_index(), 0);

    settle(&h.pipeline).await;
    let requests = h.generator.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.categories, vec![Category::Science, Category::History]);
        assert_eq!(request.count, 5);
    }
    // A buffered prefetch does not show up until the end is reached.
    assert_eq!(h.pipeline.total_count(), 5);
    assert!(h.store.contains(SNAPSHOT_KEY));
}

#[tokio::test]
async fn free_tier_stops_at_the_daily_cap_and_rereads_are_free() {
    let h = harness(FakeGenerator::new(), Tier::Free, &[Category::Science]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    assert_eq!(h.allowance.consumed_today(), 1);

    advance_times(&h.pipeline, 4).await;
    assert_eq!(h.pipeline.current_index(), 4);
    assert_eq!(h.allowance.consumed_today(), 5);

    assert_eq!(h.pipeline.advance().await.unwrap(), Advance::LimitReached);
    assert_eq!(h.pipeline.current_index(), 4);
    assert_eq!(h.allowance.consumed_today(), 5);

    assert!(h.pipeline.retreat().await);
    assert!(h.pipeline.retreat().await);
    assert_eq!(h.pipeline.current_index(), 2);
    advance_times(&h.pipeline, 2).await;
    assert_eq!(h.pipeline.current_index(), 4);
    assert_eq!(h.allowance.consumed_today(), 5);
    assert_eq!(h.pipeline.view().remaining_today, Some(0));
}

#[tokio::test]
async fn retreat_at_first_card_is_a_no_op() {
    let h = harness(FakeGenerator::new(), Tier::Lifetime, &[Category::Art]).await;
    h.pipeline.load().await.unwrap();
    assert!(!h.pipeline.retreat().await);
    assert_eq!(h.pipeline.current_index(), 0);
}

#[tokio::test]
async fn merging_a_prefetched_batch_keeps_the_reader_in_place() {
    let first: Vec<Card> = (0..5).map(|i| card(&format!("a{i}"), Category::Science)).collect();
    let second: Vec<Card> = (0..5).map(|i| card(&format!("b{i}"), Category::Science)).collect();
    let generator = FakeGenerator::new()
        .respond(0, Ok(first.clone()))
        .respond(1, Ok(second.clone()));
    let h = harness(generator, Tier::Lifetime, &[Category::Science]).await;

    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 4).await;
    assert_eq!(current_id(&h.pipeline), first[4].id);

    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.pipeline.current_index(), 5);
    assert_eq!(h.pipeline.total_count(), 10);
    assert_eq!(current_id(&h.pipeline), second[0].id);
    // Merged from the buffer; the only new call is the next prefetch.
    settle(&h.pipeline).await;
    assert_eq!(h.generator.requests().len(), 3);

    assert!(h.pipeline.retreat().await);
    assert_eq!(current_id(&h.pipeline), first[4].id);
}

#[tokio::test]
async fn failed_prefetch_is_silent_and_the_end_falls_back_to_a_blocking_fetch() {
    let offline = || Err(PipelineError::NetworkUnavailable("offline".into()));
    let generator = FakeGenerator::new().respond(1, offline()).respond(2, offline());
    let h = harness(generator, Tier::Lifetime, &[Category::Life]).await;

    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    let view = h.pipeline.view();
    assert_eq!(view.error, None);
    assert_eq!(view.background_failures, 1);

    // The last card triggers another attempt, which fails too.
    advance_times(&h.pipeline, 4).await;
    settle(&h.pipeline).await;
    assert_eq!(h.pipeline.view().background_failures, 2);

    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.pipeline.current_index(), 5);
    assert_eq!(h.pipeline.total_count(), 10);
    assert_eq!(h.pipeline.view().error, None);
    settle(&h.pipeline).await;
    assert_eq!(h.generator.requests().len(), 5);
}

#[tokio::test]
async fn foreground_failure_is_surfaced_and_retry_recovers() {
    let generator = FakeGenerator::new().respond(
        0,
        Err(PipelineError::Provider {
            status: 503,
            body: "overloaded".into(),
        }),
    );
    let h = harness(generator, Tier::Lifetime, &[Category::Finance]).await;

    let err = h.pipeline.load().await.unwrap_err();
    assert!(matches!(err, PipelineError::Provider { status: 503, .. }));
    let view = h.pipeline.view();
    assert_eq!(view.error, Some(err));
    assert_eq!(view.total, 0);
    assert_eq!(h.pipeline.advance().await.unwrap(), Advance::AtEnd);

    h.pipeline.retry().await.unwrap();
    let view = h.pipeline.view();
    assert_eq!(view.error, None);
    assert_eq!(view.total, 5);
    assert!(view.current.is_some());
}

#[tokio::test]
async fn end_position_waits_for_retry_after_a_failed_blocking_fetch() {
    let generator = FakeGenerator::new()
        .respond(1, Err(PipelineError::EmptyResult))
        .respond(2, Err(PipelineError::EmptyResult))
        .respond(3, Err(PipelineError::NetworkUnavailable("offline".into())));
    let h = harness(generator, Tier::Lifetime, &[Category::Art]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 4).await;
    settle(&h.pipeline).await;

    assert!(h.pipeline.advance().await.is_err());
    let view = h.pipeline.view();
    assert_eq!(view.index, 5);
    assert!(view.current.is_none());
    assert!(view.error.is_some());

    assert_eq!(h.pipeline.advance().await.unwrap(), Advance::AtEnd);
    h.pipeline.retry().await.unwrap();
    assert_eq!(h.pipeline.current_index(), 5);
    assert!(h.pipeline.current_card().is_some());
}

#[tokio::test]
async fn filter_switch_resets_the_index_and_shows_only_that_category() {
    let mixed = vec![
        card("s1", Category::Science),
        card("h1", Category::History),
        card("s2", Category::Science),
        card("h2", Category::History),
        card("s3", Category::Science),
    ];
    let generator = FakeGenerator::new().respond(0, Ok(mixed));
    let h = harness(generator, Tier::Lifetime, &[Category::Science, Category::History]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 2).await;

    // The unfiltered prefetch is folded into the cache: two History cards of
    // its own plus two from the buffered batch.
    h.pipeline.switch_filter(Some(Category::History)).await.unwrap();
    let view = h.pipeline.view();
    assert_eq!(view.index, 0);
    assert_eq!(view.total, 4);
    assert_eq!(view.filter, Some(Category::History));
    // Shard already had cards: no fetch.
    assert_eq!(h.generator.requests().len(), 2);

    for _ in 0..3 {
        assert_eq!(h.pipeline.current_card().unwrap().category, Category::History);
        advance_times(&h.pipeline, 1).await;
    }
    settle(&h.pipeline).await;
    assert_eq!(h.generator.requests()[2].categories, vec![Category::History]);

    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.pipeline.current_index(), 4);
    assert_eq!(h.pipeline.current_card().unwrap().category, Category::History);
    settle(&h.pipeline).await;

    h.pipeline.switch_filter(Some(Category::Art)).await.unwrap();
    let requests = h.generator.requests();
    assert_eq!(requests.last().unwrap().categories, vec![Category::Art]);
    let view = h.pipeline.view();
    assert_eq!(view.index, 0);
    assert_eq!(view.total, 5);
    assert_eq!(view.current.unwrap().category, Category::Art);

    h.pipeline.switch_filter(None).await.unwrap();
    assert_eq!(h.pipeline.current_index(), 0);
    assert!(h.pipeline.total_count() >= 10);
}

#[tokio::test]
async fn yesterdays_cards_are_never_served_today() {
    let h = harness(FakeGenerator::new(), Tier::Lifetime, &[Category::Science]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 2).await;
    let yesterday = current_id(&h.pipeline);

    h.clock.advance_days(1);
    assert_eq!(h.pipeline.advance().await.unwrap(), Advance::Restarted);
    assert_eq!(h.pipeline.current_index(), 0);
    assert_eq!(h.pipeline.total_count(), 5);
    assert_ne!(current_id(&h.pipeline), yesterday);
    assert_eq!(h.generator.requests()[2].categories, vec![Category::Science]);
}

#[tokio::test]
async fn restart_on_a_new_day_refetches() {
    let h = harness(FakeGenerator::new(), Tier::Lifetime, &[Category::Science]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    let old = current_id(&h.pipeline);

    h.clock.advance_days(1);
    let next = reopen(FakeGenerator::new(), Tier::Lifetime, &[Category::Science], h.store.clone(), h.clock.clone()).await;
    next.pipeline.load().await.unwrap();
    assert_eq!(next.generator.requests()[0].categories, vec![Category::Science]);
    assert_eq!(next.pipeline.total_count(), 5);
    assert_ne!(current_id(&next.pipeline), old);
}

#[tokio::test]
async fn restart_resumes_from_the_saved_position_without_fetching() {
    let h = harness(FakeGenerator::new(), Tier::Free, &[Category::Science]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 3).await;
    let at = current_id(&h.pipeline);

    let next = reopen(FakeGenerator::new(), Tier::Free, &[Category::Science], h.store.clone(), h.clock.clone()).await;
    next.pipeline.load().await.unwrap();
    assert_eq!(next.pipeline.current_index(), 3);
    assert_eq!(current_id(&next.pipeline), at);
    assert!(next.generator.requests().is_empty());
    assert_eq!(next.allowance.consumed_today(), 4);
}

#[tokio::test]
async fn restored_index_is_clamped_to_what_was_unlocked_today() {
    let h = harness(FakeGenerator::new(), Tier::Free, &[Category::Science]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    h.allowance.record_consumption().await;
    assert_eq!(h.allowance.consumed_today(), 2);

    h.store
        .set(CURSOR_KEY, br#"{"version":1,"index":4,"filter":null}"#)
        .await
        .unwrap();
    let next = reopen(FakeGenerator::new(), Tier::Free, &[Category::Science], h.store.clone(), h.clock.clone()).await;
    next.pipeline.load().await.unwrap();
    assert_eq!(next.pipeline.current_index(), 1);
}

#[tokio::test]
async fn legacy_flat_cache_is_served_and_rewritten() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::on(today()));
    let mut cards = vec![
        card("h", Category::History),
        card("p", Category::Philosophy),
        card("h2", Category::History),
    ];
    for c in &mut cards {
        c.created_at = clock.now();
    }
    store.set(SNAPSHOT_KEY, &serde_json::to_vec(&cards).unwrap()).await.unwrap();

    let h = reopen(FakeGenerator::new(), Tier::Lifetime, &Category::ALL, store.clone(), clock).await;
    h.pipeline.load().await.unwrap();
    assert_eq!(h.pipeline.total_count(), 3);
    assert!(h.generator.requests().is_empty());

    h.pipeline.switch_filter(Some(Category::History)).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 2);

    let raw = store.get(SNAPSHOT_KEY).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value["version"], 2);
}

#[tokio::test]
async fn only_one_prefetch_is_ever_in_flight() {
    let h = harness(FakeGenerator::new().hold(1), Tier::Lifetime, &[Category::Art]).await;
    h.pipeline.load().await.unwrap();
    tokio::task::yield_now().await;

    advance_times(&h.pipeline, 4).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.generator.requests().len(), 2);
    assert_eq!(h.pipeline.view().phase, BatchPhase::Prefetching);

    h.generator.release();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.pipeline.total_count(), 10);
    assert_eq!(h.pipeline.current_index(), 5);
}

#[tokio::test]
async fn prefetch_landing_at_the_end_position_is_merged_immediately() {
    let generator = FakeGenerator::new()
        .hold(1)
        .respond(2, Err(PipelineError::NetworkUnavailable("offline".into())));
    let h = harness(generator, Tier::Lifetime, &[Category::Art]).await;
    h.pipeline.load().await.unwrap();
    tokio::task::yield_now().await;
    advance_times(&h.pipeline, 4).await;

    // No buffer yet: the blocking fetch runs and fails.
    assert!(h.pipeline.advance().await.is_err());
    assert!(h.pipeline.current_card().is_none());

    h.generator.release();
    settle(&h.pipeline).await;
    let view = h.pipeline.view();
    assert_eq!(view.index, 5);
    assert_eq!(view.total, 10);
    assert!(view.current.is_some());
    assert_eq!(view.error, None);
}

#[tokio::test]
async fn new_filter_index_space_is_compared_against_the_global_counter() {
    let mixed = vec![
        card("s1", Category::Science),
        card("h1", Category::History),
        card("s2", Category::Science),
        card("h2", Category::History),
        card("s3", Category::Science),
    ];
    let generator = FakeGenerator::new().respond(0, Ok(mixed));
    let h = harness(generator, Tier::Free, &[Category::Science, Category::History]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 2).await;
    assert_eq!(h.allowance.consumed_today(), 3);

    // Indices 0 and 1 of the History shard sit below the global counter,
    // so they read as already seen.
    h.pipeline.switch_filter(Some(Category::History)).await.unwrap();
    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.allowance.consumed_today(), 3);
}

#[tokio::test]
async fn daily_cap_holds_across_filters() {
    let mixed = vec![
        card("s1", Category::Science),
        card("h1", Category::History),
        card("s2", Category::Science),
        card("h2", Category::History),
        card("s3", Category::Science),
    ];
    let generator = FakeGenerator::new().respond(0, Ok(mixed));
    let h = harness(generator, Tier::Free, &[Category::Science, Category::History]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;
    advance_times(&h.pipeline, 4).await;
    assert_eq!(h.allowance.consumed_today(), 5);

    // Three Science cards of its own plus three from the buffered batch.
    h.pipeline.switch_filter(Some(Category::Science)).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 6);
    advance_times(&h.pipeline, 4).await;
    assert_eq!(h.pipeline.current_index(), 4);
    assert_eq!(h.pipeline.current_card().unwrap().category, Category::Science);

    assert_eq!(h.pipeline.advance().await.unwrap(), Advance::LimitReached);
    assert_eq!(h.allowance.consumed_today(), 5);
}

#[tokio::test]
async fn batch_buffered_for_the_previous_filter_does_not_block_prefetching() {
    let mixed = vec![
        card("s1", Category::Science),
        card("h1", Category::History),
        card("s2", Category::Science),
        card("h2", Category::History),
        card("s3", Category::Science),
    ];
    let science: Vec<Card> = (0..5).map(|i| card(&format!("s{}", i + 4), Category::Science)).collect();
    let generator = FakeGenerator::new().respond(0, Ok(mixed)).respond(1, Ok(science));
    let h = harness(generator, Tier::Lifetime, &[Category::Science, Category::History]).await;
    h.pipeline.load().await.unwrap();
    settle(&h.pipeline).await;

    h.pipeline.switch_filter(Some(Category::History)).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 2);
    advance_times(&h.pipeline, 1).await;
    settle(&h.pipeline).await;
    let requests = h.generator.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].categories, vec![Category::History]);

    // The end of the shard is served from the History prefetch.
    advance_times(&h.pipeline, 1).await;
    assert_eq!(h.pipeline.current_index(), 2);
    assert_eq!(h.pipeline.current_card().unwrap().title, "call 2 card 0");
    settle(&h.pipeline).await;
    let requests = h.generator.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[3].categories, vec![Category::History]);

    h.pipeline.switch_filter(Some(Category::Science)).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 8);
}

#[tokio::test]
async fn blocking_fetch_outlived_by_a_filter_switch_still_lands_in_the_cache() {
    let h = harness(FakeGenerator::new().hold(0), Tier::Lifetime, &[Category::Science]).await;
    let loading = tokio::spawn({
        let pipeline = h.pipeline.clone();
        async move { pipeline.load().await }
    });
    while h.generator.requests().is_empty() {
        tokio::task::yield_now().await;
    }

    h.pipeline.switch_filter(Some(Category::Art)).await.unwrap();
    assert_eq!(h.pipeline.current_card().unwrap().category, Category::Art);

    h.generator.release();
    loading.await.unwrap().unwrap();
    settle(&h.pipeline).await;

    let requests: Vec<Vec<Category>> = h.generator.requests().into_iter().map(|r| r.categories).collect();
    assert_eq!(
        requests,
        vec![
            vec![Category::Science],
            vec![Category::Science, Category::Art],
            vec![Category::Art],
        ]
    );
    // Both blocking fetches were kept, and the reader stayed put.
    assert_eq!(h.pipeline.current_index(), 0);
    assert_eq!(h.pipeline.total_count(), 2);

    h.pipeline.switch_filter(Some(Category::Science)).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 8);
    h.pipeline.switch_filter(None).await.unwrap();
    assert_eq!(h.pipeline.total_count(), 15);
}
