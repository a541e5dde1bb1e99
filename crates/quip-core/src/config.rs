use std::path::PathBuf;

use tracing::warn;

use crate::entitlement::Tier;
use crate::generator::DEFAULT_MAX_OUTPUT_TOKENS;
use crate::model::Category;
use crate::orchestrator::{PipelineSettings, DEFAULT_BATCH_SIZE};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub settings: PipelineSettings,
    pub tier: Tier,
    pub max_output_tokens: u32,
    pub debug_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let batch_size = std::env::var("QUIP_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let selected = std::env::var("QUIP_CATEGORIES")
            .map(|s| parse_categories(&s))
            .unwrap_or_else(|_| Category::ALL.to_vec());

        let tier = std::env::var("QUIP_TIER")
            .ok()
            .and_then(|s| {
                s.parse::<Tier>()
                    .inspect_err(|e| warn!(error = %e, "ignoring QUIP_TIER"))
                    .ok()
            })
            .unwrap_or_default();

        let max_output_tokens = std::env::var("QUIP_MAX_OUTPUT_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);

        let debug_dir = std::env::var("QUIP_DEBUG_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            settings: PipelineSettings {
                batch_size,
                selected,
            },
            tier,
            max_output_tokens,
            debug_dir,
        }
    }
}

/// Comma-separated category names. Unknown names are skipped; an empty
/// result means every category.
pub fn parse_categories(raw: &str) -> Vec<Category> {
    let mut selected = Vec::new();
    for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
        match name.parse::<Category>() {
            Ok(category) if !selected.contains(&category) => selected.push(category),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "ignoring entry in QUIP_CATEGORIES"),
        }
    }
    if selected.is_empty() {
        Category::ALL.to_vec()
    } else {
        selected
    }
}
