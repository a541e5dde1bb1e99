use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use quip_core::entitlement::DailyAllowance;
use quip_core::generator::CardGenerator;
use quip_core::model::{Card, Category};
use quip_core::orchestrator::{Advance, Pipeline, PipelineView};
use quip_core::tips;

#[derive(Clone)]
pub struct QuipServer {
    pipeline: Pipeline,
    generator: Arc<dyn CardGenerator>,
    allowance: Arc<DailyAllowance>,
    tool_router: ToolRouter<QuipServer>,
}

impl QuipServer {
    pub fn new(pipeline: Pipeline, generator: Arc<dyn CardGenerator>, allowance: Arc<DailyAllowance>) -> Self {
        Self {
            pipeline,
            generator,
            allowance,
            tool_router: Self::tool_router(),
        }
    }

    fn view(&self) -> ViewResponse {
        ViewResponse::from(self.pipeline.view())
    }
}

/// `None`, empty and "all" select every category.
fn parse_filter(raw: Option<&str>) -> Result<Option<Category>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => s.parse::<Category>().map(Some).map_err(|e| e.to_string()),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SwitchFilterParams {
    /// One of History, Science, Art, Life, Finance, Philosophy; omit or "all" for every category.
    category: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct CardResponse {
    id: String,
    title: String,
    category: String,
    body: String,
    tags: Vec<String>,
    source: String,
    difficulty: u8,
    difficulty_stars: String,
    estimated_read_secs: u32,
    read_time: String,
    image_url: String,
    created_at: String,
}

impl From<&Card> for CardResponse {
    fn from(card: &Card) -> Self {
        Self {
            id: card.id.to_string(),
            title: card.title.clone(),
            category: card.category.to_string(),
            body: card.body.clone(),
            tags: card.tags.clone(),
            source: card.source.clone(),
            difficulty: card.difficulty,
            difficulty_stars: card.difficulty_stars(),
            estimated_read_secs: card.estimated_read_secs,
            read_time: card.read_time_label(),
            image_url: card.image_url.clone(),
            created_at: card.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
struct ViewResponse {
    card: Option<CardResponse>,
    index: usize,
    total: usize,
    progress: f64,
    /// `null` when every category is shown.
    filter: Option<String>,
    phase: String,
    /// Set after a failed foreground fetch; call `retry`.
    error: Option<String>,
    background_failures: u64,
    /// `null` when unlimited.
    remaining_today: Option<usize>,
}

impl From<PipelineView> for ViewResponse {
    fn from(view: PipelineView) -> Self {
        Self {
            card: view.current.as_ref().map(CardResponse::from),
            index: view.index,
            total: view.total,
            progress: view.progress(),
            filter: view.filter.map(|c| c.to_string()),
            phase: format!("{:?}", view.phase),
            error: view.error.map(|e| e.to_string()),
            background_failures: view.background_failures,
            remaining_today: view.remaining_today,
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
struct CurrentCardResponse {
    card: Option<CardResponse>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct AdvanceResponse {
    /// Moved, LimitReached, AtEnd, Restarted or Failed.
    outcome: String,
    view: ViewResponse,
}

#[derive(Debug, Serialize, JsonSchema)]
struct RetreatResponse {
    moved: bool,
    view: ViewResponse,
}

#[derive(Debug, Serialize, JsonSchema)]
struct StatusResponse {
    view: ViewResponse,
    tier: String,
    batch_size: usize,
    selected_categories: Vec<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct TipsResponse {
    tips: Vec<String>,
}

#[tool_router]
impl QuipServer {
    #[tool(description = "Restore today's cards and reading position, fetching a fresh batch if nothing usable is cached. Returns the current view; a failed fetch is reported in view.error.")]
    async fn load(&self) -> Result<Json<ViewResponse>, String> {
        let _ = self.pipeline.load().await;
        Ok(Json(self.view()))
    }

    #[tool(description = "Return the card under the reading cursor, or null when there is none.")]
    async fn current_card(&self) -> Result<Json<CurrentCardResponse>, String> {
        let card = self.pipeline.current_card();
        Ok(Json(CurrentCardResponse {
            card: card.as_ref().map(CardResponse::from),
        }))
    }

    #[tool(description = "Move to the next card. New cards count against the daily allowance; outcome LimitReached means the allowance is used up and the cursor did not move.")]
    async fn advance(&self) -> Result<Json<AdvanceResponse>, String> {
        let outcome = match self.pipeline.advance().await {
            Ok(Advance::Moved) => "Moved",
            Ok(Advance::LimitReached) => "LimitReached",
            Ok(Advance::AtEnd) => "AtEnd",
            Ok(Advance::Restarted) => "Restarted",
            Err(_) => "Failed",
        };
        Ok(Json(AdvanceResponse {
            outcome: outcome.to_string(),
            view: self.view(),
        }))
    }

    #[tool(description = "Move back to the previous card. Re-reading never counts against the daily allowance.")]
    async fn retreat(&self) -> Result<Json<RetreatResponse>, String> {
        let moved = self.pipeline.retreat().await;
        Ok(Json(RetreatResponse {
            moved,
            view: self.view(),
        }))
    }

    #[tool(description = "Show only one category (History, Science, Art, Life, Finance, Philosophy) or every category (omit or \"all\"). Resets the cursor to the first card and fetches if the category has no cards yet.")]
    async fn switch_filter(
        &self,
        Parameters(params): Parameters<SwitchFilterParams>,
    ) -> Result<Json<ViewResponse>, String> {
        let filter = parse_filter(params.category.as_deref())?;
        let _ = self.pipeline.switch_filter(filter).await;
        Ok(Json(self.view()))
    }

    #[tool(description = "Re-attempt the fetch that left the reader without a card after a failure.")]
    async fn retry(&self) -> Result<Json<ViewResponse>, String> {
        let _ = self.pipeline.retry().await;
        Ok(Json(self.view()))
    }

    #[tool(description = "Current view plus tier, batch size and selected categories.")]
    async fn status(&self) -> Result<Json<StatusResponse>, String> {
        let settings = self.pipeline.settings();
        Ok(Json(StatusResponse {
            view: self.view(),
            tier: self.allowance.tier().to_string(),
            batch_size: settings.batch_size,
            selected_categories: settings.selected.iter().map(|c| c.to_string()).collect(),
        }))
    }

    #[tool(description = "Generate a handful of short facts to show while cards are loading. Uses one generation call; nothing is cached.")]
    async fn loading_tips(&self) -> Result<Json<TipsResponse>, String> {
        let tips = tips::generate_tips(self.generator.as_ref())
            .await
            .map_err(|e| format!("loading_tips failed: {e}"))?;
        Ok(Json(TipsResponse { tips }))
    }
}

#[tool_handler]
impl ServerHandler for QuipServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "quip-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Daily knowledge cards. Call load first, then advance/retreat to read. \
switch_filter narrows the deck to one category. When view.error is set, call retry. \
Free tier allows 5 new cards per day; status reports what remains."
                    .to_string(),
            ),
        }
    }
}
