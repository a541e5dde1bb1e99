use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of knowledge-card categories. Also used as the cache shard key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    History,
    Science,
    Art,
    Life,
    Finance,
    Philosophy,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::History,
        Category::Science,
        Category::Art,
        Category::Life,
        Category::Finance,
        Category::Philosophy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::History => "History",
            Category::Science => "Science",
            Category::Art => "Art",
            Category::Life => "Life",
            Category::Finance => "Finance",
            Category::Philosophy => "Philosophy",
        }
    }

    /// Short description used when prompting the model.
    pub fn description(self) -> &'static str {
        match self {
            Category::History => "Historical events, figures, and cultural phenomena",
            Category::Science => "Physics, chemistry, biology, astronomy, and technology",
            Category::Art => "Painting, music, architecture, film, and design",
            Category::Life => "Health, psychology, sociology, and geography",
            Category::Finance => "Economics, investment strategies, and financial planning",
            Category::Philosophy => "Quotes, wisdom, and ways of thinking",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownCategory(trimmed.to_string()))
    }
}

/// An immutable knowledge card. Equality is identity: two cards are equal iff
/// their ids match.
///
/// Field names on the wire keep the layout older snapshots were written with,
/// so the legacy flat-list format decodes into this type directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: Uuid,
    pub title: String,
    pub category: Category,
    #[serde(rename = "frontImageURL")]
    pub image_url: String,
    /// Markdown body.
    #[serde(rename = "backContent")]
    pub body: String,
    pub tags: Vec<String>,
    pub source: String,
    /// 1 (beginner) to 5 (advanced).
    pub difficulty: u8,
    /// Seconds.
    #[serde(rename = "estimatedReadTime")]
    pub estimated_read_secs: u32,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for Card {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Card {}

impl Card {
    pub fn difficulty_stars(&self) -> String {
        "\u{2b50}".repeat(self.difficulty.clamp(1, 5) as usize)
    }

    pub fn read_time_label(&self) -> String {
        let minutes = self.estimated_read_secs / 60;
        let seconds = self.estimated_read_secs % 60;
        if minutes > 0 {
            format!("{minutes}m {seconds}s read")
        } else {
            format!("{seconds}s read")
        }
    }
}

/// What one generation call asks the provider for. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub categories: Vec<Category>,
    pub count: usize,
}

impl GenerationRequest {
    pub fn new(categories: Vec<Category>, count: usize) -> Self {
        Self { categories, count }
    }
}

#[cfg(test)]
pub(crate) fn test_card(title: &str, category: Category) -> Card {
    Card {
        id: Uuid::new_v4(),
        title: title.to_string(),
        category,
        image_url: format!("https://source.unsplash.com/800x600/?{}", category.as_str().to_lowercase()),
        body: format!("{title} body text"),
        tags: vec![],
        source: "AI Generated".to_string(),
        difficulty: 3,
        estimated_read_secs: 30,
        created_at: Utc::now(),
    }
}
