//! Short "did you know" lines shown while a blocking fetch is running.

use tracing::info;

use crate::error::PipelineError;
use crate::generator::CardGenerator;
use crate::model::{Card, Category, GenerationRequest};

pub const TIP_CATEGORIES: [Category; 3] = [Category::Science, Category::History, Category::Philosophy];
pub const TIP_COUNT: usize = 5;

const MAX_TIP_CHARS: usize = 100;
const TRUNCATED_TIP_CHARS: usize = 80;

pub fn loading_tips(cards: &[Card]) -> Vec<String> {
    cards.iter().map(tip_for).collect()
}

fn tip_for(card: &Card) -> String {
    let title = card.title.trim();
    if !title.is_empty() && title.chars().count() < MAX_TIP_CHARS {
        return title.to_string();
    }
    let first_sentence = card.body.split('.').next().unwrap_or_default().trim();
    if first_sentence.chars().count() < MAX_TIP_CHARS {
        return format!("{first_sentence}.");
    }
    let truncated: String = card.body.chars().take(TRUNCATED_TIP_CHARS).collect();
    format!("{truncated}...")
}

/// One small generation call, turned into tips. Nothing is cached.
pub async fn generate_tips(generator: &dyn CardGenerator) -> Result<Vec<String>, PipelineError> {
    let request = GenerationRequest::new(TIP_CATEGORIES.to_vec(), TIP_COUNT);
    let cards = generator.generate(&request).await?;
    let tips = loading_tips(&cards);
    info!(count = tips.len(), "generated loading tips");
    Ok(tips)
}
