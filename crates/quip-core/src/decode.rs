use chrono::Utc;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{Card, Category};

pub const DEFAULT_SOURCE: &str = "AI Generated";
pub const DEFAULT_DIFFICULTY: u8 = 3;

const WORDS_PER_MINUTE: usize = 200;
const MIN_READ_SECS: usize = 30;

/// One card as the model described it, before it becomes a `Card`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCardRecord {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Models send numbers, numeric strings, or nothing.
    #[serde(default)]
    pub difficulty: Option<Value>,
}

impl RawCardRecord {
    fn is_usable(&self) -> bool {
        !self.title.trim().is_empty() && !self.content.trim().is_empty()
    }

    fn difficulty(&self) -> u8 {
        let parsed = match &self.difficulty {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(d) if d.is_finite() => d.round().clamp(1.0, 5.0) as u8,
            _ => DEFAULT_DIFFICULTY,
        }
    }
}

/// Decodes normalized JSON into records.
///
/// When one card was asked for, a bare object is tried first and an array
/// second; otherwise the other way round. Records that fail to decode are
/// dropped; zero survivors is `EmptyResult`.
pub fn decode_records(json: &str, expected: usize) -> Result<Vec<RawCardRecord>, PipelineError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| PipelineError::MalformedResponse(format!("normalized text is not JSON: {e}")))?;

    let candidates = if expected == 1 {
        as_single(&value).or_else(|| as_list(&value))
    } else {
        as_list(&value).or_else(|| as_single(&value))
    }
    .ok_or_else(|| {
        PipelineError::MalformedResponse("response is neither a card object nor an array".to_string())
    })?;

    let total = candidates.len();
    let records: Vec<RawCardRecord> = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(i, candidate)| {
            match serde_json::from_value::<RawCardRecord>(candidate) {
                Ok(record) if record.is_usable() => Some(record),
                Ok(_) => {
                    warn!(index = i, "dropping card record with empty title or content");
                    None
                }
                Err(e) => {
                    warn!(index = i, error = %e, "dropping undecodable card record");
                    None
                }
            }
        })
        .collect();

    if records.is_empty() {
        return Err(PipelineError::EmptyResult);
    }
    if records.len() < total {
        warn!(kept = records.len(), total, "some card records were unusable");
    }
    Ok(records)
}

fn as_single(value: &Value) -> Option<Vec<Value>> {
    let obj = value.as_object()?;
    obj.contains_key("title").then(|| vec![value.clone()])
}

fn as_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        // `{"cards": [...]}` from providers forced into JSON-object mode.
        Value::Object(obj) => {
            let mut arrays = obj
                .values()
                .filter_map(Value::as_array)
                .filter(|items| items.iter().any(Value::is_object));
            let first = arrays.next()?;
            arrays.next().is_none().then(|| first.clone())
        }
        _ => None,
    }
}

/// Decodes normalized JSON straight into cards. Unrecognized or missing
/// categories are replaced with a random pick from `requested`.
pub fn decode_cards<R: Rng + ?Sized>(
    json: &str,
    requested: &[Category],
    expected: usize,
    rng: &mut R,
) -> Result<Vec<Card>, PipelineError> {
    let records = decode_records(json, expected)?;
    Ok(records
        .into_iter()
        .map(|record| {
            let category = resolve_category(record.category.as_deref(), requested, rng);
            into_card(record, category)
        })
        .collect())
}

fn resolve_category<R: Rng + ?Sized>(
    label: Option<&str>,
    requested: &[Category],
    rng: &mut R,
) -> Category {
    if let Some(category) = label.and_then(|l| l.parse::<Category>().ok()) {
        return category;
    }
    let pool: &[Category] = if requested.is_empty() { &Category::ALL } else { requested };
    let fallback = pool.choose(rng).copied().unwrap_or(Category::Science);
    warn!(label = label.unwrap_or("<missing>"), fallback = %fallback, "unrecognized card category");
    fallback
}

pub fn into_card(record: RawCardRecord, category: Category) -> Card {
    let difficulty = record.difficulty();
    let estimated_read_secs = estimate_read_secs(&record.content);
    Card {
        id: Uuid::new_v4(),
        title: record.title.trim().to_string(),
        category,
        image_url: placeholder_image_url(category),
        body: record.content,
        tags: record.tags.unwrap_or_default(),
        source: record
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
        difficulty,
        estimated_read_secs,
        created_at: Utc::now(),
    }
}

pub fn placeholder_image_url(category: Category) -> String {
    format!(
        "https://source.unsplash.com/800x600/?{}",
        category.as_str().to_lowercase()
    )
}

pub fn estimate_read_secs(body: &str) -> u32 {
    let words = body.split_whitespace().count();
    (words * 60 / WORDS_PER_MINUTE).max(MIN_READ_SECS) as u32
}
