//! Category-sharded card cache with a same-calendar-day lifetime.
//!
//! Storage schema (one key):
//! - `dailyquip:cards`: JSON `Snapshot` (`version: 2`): the day it belongs to,
//!   shards keyed by category, and the arrival order across shards.
//!   Older installs wrote a flat JSON array of cards under the same key; that
//!   form is migrated on read and rewritten as a snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::{Card, Category};
use crate::storage::KeyValueStore;

pub const SNAPSHOT_KEY: &str = "dailyquip:cards";
const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    day: NaiveDate,
    shards: BTreeMap<Category, Vec<Card>>,
    #[serde(default)]
    arrival: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCards {
    Current(Snapshot),
    Legacy(Vec<Card>),
}

/// In-memory cache. Shards are append-only; the unfiltered view is the
/// arrival order across all shards, so appends only ever extend a view.
#[derive(Debug, Clone)]
pub struct CardCache {
    day: NaiveDate,
    shards: HashMap<Category, Vec<Card>>,
    /// (shard, position in shard) in arrival order.
    arrival: Vec<(Category, usize)>,
    ids: HashSet<Uuid>,
}

impl CardCache {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            shards: HashMap::new(),
            arrival: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn is_fresh(&self, today: NaiveDate) -> bool {
        self.day == today
    }

    /// Appends `card` to its own category's shard. Returns `false` for a card
    /// already present.
    pub fn put(&mut self, card: Card) -> bool {
        if !self.ids.insert(card.id) {
            return false;
        }
        let shard = self.shards.entry(card.category).or_default();
        self.arrival.push((card.category, shard.len()));
        shard.push(card);
        true
    }

    /// Appends every card; returns how many were new.
    pub fn extend(&mut self, cards: impl IntoIterator<Item = Card>) -> usize {
        let mut added = 0;
        for card in cards {
            if self.put(card) {
                added += 1;
            }
        }
        added
    }

    /// Cards in display order: one shard, or every shard in arrival order.
    pub fn get(&self, filter: Option<Category>) -> Vec<Card> {
        match filter {
            Some(category) => self.shards.get(&category).cloned().unwrap_or_default(),
            None => self
                .arrival
                .iter()
                .filter_map(|(category, pos)| self.shards.get(category)?.get(*pos))
                .cloned()
                .collect(),
        }
    }

    pub fn card_at(&self, filter: Option<Category>, index: usize) -> Option<&Card> {
        match filter {
            Some(category) => self.shards.get(&category)?.get(index),
            None => {
                let (category, pos) = self.arrival.get(index)?;
                self.shards.get(category)?.get(*pos)
            }
        }
    }

    pub fn len(&self, filter: Option<Category>) -> usize {
        match filter {
            Some(category) => self.shards.get(&category).map_or(0, Vec::len),
            None => self.arrival.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arrival.is_empty()
    }

    pub fn shard_sizes(&self) -> BTreeMap<Category, usize> {
        self.shards.iter().map(|(c, cards)| (*c, cards.len())).collect()
    }

    fn to_snapshot(&self) -> Snapshot {
        let arrival = self
            .arrival
            .iter()
            .filter_map(|(category, pos)| self.shards.get(category)?.get(*pos))
            .map(|card| card.id)
            .collect();
        Snapshot {
            version: SNAPSHOT_VERSION,
            day: self.day,
            shards: self
                .shards
                .iter()
                .map(|(c, cards)| (*c, cards.clone()))
                .collect(),
            arrival,
        }
    }

    /// Serialized current-format snapshot.
    pub fn persisted_snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_snapshot())
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut by_id: HashMap<Uuid, Card> = HashMap::new();
        let mut shard_order: Vec<Uuid> = Vec::new();
        for (category, cards) in snapshot.shards {
            for card in cards {
                // put() re-shards by the card's own category.
                if card.category != category {
                    warn!(id = %card.id, shard = %category, category = %card.category, "card stored in wrong shard");
                }
                shard_order.push(card.id);
                by_id.insert(card.id, card);
            }
        }

        let mut cache = Self::new(snapshot.day);
        for id in snapshot.arrival.iter().chain(shard_order.iter()) {
            if let Some(card) = by_id.remove(id) {
                cache.put(card);
            }
        }
        cache
    }

    fn from_legacy(day: NaiveDate, cards: Vec<Card>) -> Self {
        let mut cache = Self::new(day);
        cache.extend(cards);
        cache
    }
}

/// Reads and writes the cache snapshot. Storage failures are logged and
/// treated as "no cache".
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Today's cache, or an empty one when nothing usable from today is
    /// stored. A stale or unreadable snapshot is removed.
    pub async fn restore(&self) -> CardCache {
        let today = self.clock.today();
        let bytes = match self.store.get(SNAPSHOT_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("no cached cards found");
                return CardCache::new(today);
            }
            Err(e) => {
                warn!(error = %e, "card cache read failed, treating as empty");
                return CardCache::new(today);
            }
        };

        let stored = match serde_json::from_slice::<StoredCards>(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "unknown card cache format, discarding");
                self.discard().await;
                return CardCache::new(today);
            }
        };

        match stored {
            StoredCards::Current(snapshot) if snapshot.version != SNAPSHOT_VERSION => {
                warn!(version = snapshot.version, "unsupported card cache version, discarding");
                self.discard().await;
                CardCache::new(today)
            }
            StoredCards::Current(snapshot) if snapshot.day != today => {
                info!(cached_day = %snapshot.day, %today, "card cache expired");
                self.discard().await;
                CardCache::new(today)
            }
            StoredCards::Current(snapshot) => {
                let cache = CardCache::from_snapshot(snapshot);
                info!(cards = cache.len(None), shards = cache.shards.len(), "loaded card cache");
                cache
            }
            StoredCards::Legacy(cards) => {
                let newest = cards.iter().map(|c| self.clock.date_of(c.created_at)).max();
                if newest != Some(today) {
                    info!(cards = cards.len(), "legacy card cache expired");
                    self.discard().await;
                    return CardCache::new(today);
                }
                let cache = CardCache::from_legacy(today, cards);
                info!(cards = cache.len(None), "migrating legacy card cache to sharded format");
                self.persist(&cache).await;
                cache
            }
        }
    }

    pub async fn persist(&self, cache: &CardCache) {
        let bytes = match cache.persisted_snapshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode card cache");
                return;
            }
        };
        match self.store.set(SNAPSHOT_KEY, &bytes).await {
            Ok(()) => debug!(cards = cache.len(None), "card cache persisted"),
            Err(e) => warn!(error = %e, "card cache write failed"),
        }
    }

    pub async fn discard(&self) {
        if let Err(e) = self.store.remove(SNAPSHOT_KEY).await {
            warn!(error = %e, "card cache removal failed");
        }
    }
}
