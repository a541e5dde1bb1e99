use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::storage::KeyValueStore;

pub const ALLOWANCE_KEY: &str = "dailyquip:allowance";
const ALLOWANCE_VERSION: u32 = 1;
const FREE_DAILY_CAP: usize = 5;

/// Authority on how many new cards the user may see today. The pipeline
/// never keeps its own copy of this bookkeeping.
#[async_trait]
pub trait Entitlement: Send + Sync {
    /// `None` means unlimited.
    fn daily_cap(&self) -> Option<usize>;

    fn consumed_today(&self) -> usize;

    async fn record_consumption(&self);

    fn remaining_today(&self) -> Option<usize> {
        self.daily_cap()
            .map(|cap| cap.saturating_sub(self.consumed_today()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Monthly,
    Annual,
    Lifetime,
}

impl Tier {
    pub fn daily_cap(self) -> Option<usize> {
        match self {
            Tier::Free => Some(FREE_DAILY_CAP),
            Tier::Monthly | Tier::Annual | Tier::Lifetime => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Monthly => "monthly",
            Tier::Annual => "annual",
            Tier::Lifetime => "lifetime",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "monthly" => Ok(Tier::Monthly),
            "annual" | "yearly" => Ok(Tier::Annual),
            "lifetime" => Ok(Tier::Lifetime),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllowanceRecord {
    version: u32,
    tier: Tier,
    day: NaiveDate,
    consumed: usize,
}

#[derive(Debug)]
struct AllowanceState {
    tier: Tier,
    day: NaiveDate,
    consumed: usize,
}

impl AllowanceState {
    /// Starts a new count when the calendar day has changed.
    fn roll(&mut self, today: NaiveDate) {
        if self.day != today {
            info!(previous_day = %self.day, consumed = self.consumed, "daily allowance reset");
            self.day = today;
            self.consumed = 0;
        }
    }

    fn record(&self) -> AllowanceRecord {
        AllowanceRecord {
            version: ALLOWANCE_VERSION,
            tier: self.tier,
            day: self.day,
            consumed: self.consumed,
        }
    }
}

/// Per-day consumption counter for a subscription tier, persisted as one
/// versioned record.
pub struct DailyAllowance {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<AllowanceState>,
}

impl DailyAllowance {
    /// Restores today's count from storage. The tier passed in is
    /// authoritative; the stored one is only informational.
    pub async fn load(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, tier: Tier) -> Self {
        let today = clock.today();
        let mut state = AllowanceState {
            tier,
            day: today,
            consumed: 0,
        };

        match store.get(ALLOWANCE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<AllowanceRecord>(&bytes) {
                Ok(record) if record.version == ALLOWANCE_VERSION => {
                    state.day = record.day;
                    state.consumed = record.consumed;
                    state.roll(today);
                    if record.tier != tier {
                        info!(stored = %record.tier, configured = %tier, "tier changed");
                    }
                }
                Ok(record) => warn!(version = record.version, "unsupported allowance version"),
                Err(e) => warn!(error = %e, "stored allowance could not be decoded"),
            },
            Ok(None) => debug!("no stored allowance"),
            Err(e) => warn!(error = %e, "allowance read failed"),
        }

        Self {
            store,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn tier(&self) -> Tier {
        self.state.lock().tier
    }

    pub async fn set_tier(&self, tier: Tier) {
        let record = {
            let mut state = self.state.lock();
            state.tier = tier;
            state.record()
        };
        info!(%tier, "tier updated");
        self.persist(record).await;
    }

    async fn persist(&self, record: AllowanceRecord) {
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode allowance");
                return;
            }
        };
        if let Err(e) = self.store.set(ALLOWANCE_KEY, &bytes).await {
            warn!(error = %e, "allowance write failed");
        }
    }
}

#[async_trait]
impl Entitlement for DailyAllowance {
    fn daily_cap(&self) -> Option<usize> {
        self.state.lock().tier.daily_cap()
    }

    fn consumed_today(&self) -> usize {
        let mut state = self.state.lock();
        state.roll(self.clock.today());
        state.consumed
    }

    async fn record_consumption(&self) {
        let record = {
            let mut state = self.state.lock();
            state.roll(self.clock.today());
            state.consumed += 1;
            debug!(consumed = state.consumed, "card consumption recorded");
            state.record()
        };
        self.persist(record).await;
    }
}
