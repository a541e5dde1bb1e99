use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::decode::decode_cards;
use crate::error::PipelineError;
use crate::model::{Card, Category, GenerationRequest};
use crate::normalize::{normalize, NormalizeError};
use crate::provider::CompletionProvider;

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8_000;

/// Source of freshly generated cards. The orchestrator only ever talks to
/// this trait, so tests can script it.
#[async_trait]
pub trait CardGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Card>, PipelineError>;
}

/// Where malformed responses are written for later inspection. They are
/// never shown to the user.
#[derive(Debug, Clone)]
pub struct DebugArtifacts {
    dir: PathBuf,
}

impl DebugArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record(&self, err: &NormalizeError) -> Option<PathBuf> {
        let digest = Sha256::digest(err.raw.as_bytes());
        let name = format!("malformed-{}.txt", hex_prefix(&digest, 12));
        let path = self.dir.join(name);
        let contents = format!(
            "reason: {}\n\n----- raw -----\n{}\n\n----- cleaned -----\n{}\n",
            err.reason, err.raw, err.cleaned
        );
        std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&path, contents))
            .inspect_err(|e| warn!(error = %e, dir = %self.dir.display(), "failed to write debug artifact"))
            .ok()?;
        Some(path)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(len)
        .collect()
}

/// One prompt/response round trip per `generate`, followed by
/// normalize → decode.
pub struct GenerationClient {
    provider: Arc<dyn CompletionProvider>,
    max_output_tokens: u32,
    artifacts: Option<DebugArtifacts>,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            artifacts: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_artifacts(mut self, artifacts: DebugArtifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    fn record_malformed(&self, err: &NormalizeError) {
        match self.artifacts.as_ref().and_then(|a| a.record(err)) {
            Some(path) => warn!(reason = %err.reason, artifact = %path.display(), "malformed model response"),
            None => warn!(reason = %err.reason, raw_len = err.raw.len(), "malformed model response"),
        }
    }
}

#[async_trait]
impl CardGenerator for GenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Card>, PipelineError> {
        if request.count == 0 {
            return Ok(Vec::new());
        }
        let categories: Vec<Category> = if request.categories.is_empty() {
            Category::ALL.to_vec()
        } else {
            request.categories.clone()
        };

        let prompt = build_prompt(&categories, request.count);
        debug!(
            provider = self.provider.name(),
            count = request.count,
            categories = ?categories,
            "requesting cards"
        );
        let raw = self.provider.complete(&prompt, self.max_output_tokens).await?;

        let json = normalize(&raw).map_err(|e| {
            self.record_malformed(&e);
            PipelineError::MalformedResponse(e.reason)
        })?;

        let cards = {
            let mut rng = rand::rng();
            decode_cards(&json, &categories, request.count, &mut rng)?
        };

        if cards.len() != request.count {
            warn!(requested = request.count, received = cards.len(), "card count mismatch");
        }
        info!(provider = self.provider.name(), count = cards.len(), "generated cards");
        Ok(cards)
    }
}

pub fn build_prompt(categories: &[Category], count: usize) -> String {
    if count == 1 && categories.len() == 1 {
        return single_card_prompt(categories[0]);
    }
    let category_list = categories
        .iter()
        .map(|c| format!("{} ({})", c.as_str(), c.description()))
        .collect::<Vec<_>>()
        .join(", ");
    let allowed = categories
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(" | ");

    format!(
        "Generate exactly {count} interesting and educational knowledge cards.\n\n\
Draw from these categories: {category_list}\n\
Spread the cards across the categories.\n\n\
Each card needs:\n\
- title: compelling and concise, at most 60 characters\n\
- content: 150-300 words of markdown explaining a fascinating fact, concept, or story, \
accessible to a general audience, with a surprising element\n\
- source: a credible citation\n\
- tags: three short topic tags\n\
- difficulty: 1 (beginner) to 5 (advanced)\n\
- category: one of {allowed}\n\n\
Respond with ONLY a JSON array of exactly {count} objects, no commentary:\n\
[{{\"title\": \"...\", \"content\": \"...\", \"source\": \"...\", \"tags\": [\"...\"], \
\"difficulty\": 3, \"category\": \"{first}\"}}]",
        first = categories.first().map(|c| c.as_str()).unwrap_or("Science"),
    )
}

fn single_card_prompt(category: Category) -> String {
    format!(
        "Generate ONE interesting and educational knowledge card for the category {name} ({desc}).\n\n\
The card needs a title (at most 60 characters), 150-300 words of markdown content accessible \
to a general audience with a surprising element, a credible source, three tags, and a \
difficulty from 1 (beginner) to 5 (advanced).\n\n\
Respond with ONLY a single JSON object, not an array:\n\
{{\"title\": \"...\", \"content\": \"...\", \"source\": \"...\", \"tags\": [\"...\"], \
\"difficulty\": 3, \"category\": \"{name}\"}}",
        name = category.as_str(),
        desc = category.description(),
    )
}
