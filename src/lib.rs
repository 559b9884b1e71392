//! Ingests heterogeneous financial-data dialects into a unified store and
//! answers questions over it through a structured query surface and an LLM
//! tool-calling agent.
//!
//! [`Context`] is the dependency-injection root: it owns the `Store`, wires
//! the `ToolRegistry`/`LlmAdapter` into the `AgentController` and
//! `InsightsEngine`, and hands out an `Orchestrator` for ingestion. Build one
//! per process with [`Context::new`].

pub mod agent;
pub mod config;
pub mod dates;
pub mod error;
pub mod ingestion;
pub mod insights;
pub mod issues;
pub mod llm;
pub mod model;
pub mod money;
pub mod normalizer;
pub mod parsers;
pub mod store;
pub mod tools;
pub mod validator;

pub use agent::{AgentController, AgentResponse};
pub use config::Config;
pub use error::{CoreError, Result};
pub use ingestion::Orchestrator;
pub use insights::{Insight, InsightKind, InsightParams, InsightsEngine};
pub use llm::LlmAdapter;
pub use store::{InMemoryStore, Store};
pub use tools::ToolRegistry;

use std::sync::Arc;
use std::time::Duration;

/// Owns every long-lived component and the `Arc`s they share. Construct once
/// at startup; clone the `Arc` fields out to whatever HTTP/CLI layer sits on
/// top rather than threading `&Context` through async tasks.
pub struct Context {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub tools: Arc<ToolRegistry>,
    pub llm: Arc<LlmAdapter>,
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<AgentController>,
    pub insights: Arc<InsightsEngine>,
}

impl Context {
    /// Wires up the default in-memory `Store`. Swap in another `Store`
    /// implementation via `with_store` for a persistent backend.
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        let tools = Arc::new(ToolRegistry::new());
        let llm = Arc::new(LlmAdapter::new(&config));
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), config.clone()));
        let agent = Arc::new(AgentController::new(
            Arc::clone(&tools),
            Arc::clone(&store),
            Arc::clone(&llm),
            &config,
        ));
        agent.spawn_reaper();
        let insights = Arc::new(InsightsEngine::new(
            Arc::clone(&store),
            Arc::clone(&tools),
            Arc::clone(&llm),
            Duration::from_secs(config.insight_cache_ttl_s),
        ));

        Context { config, store, tools, llm, orchestrator, agent, insights }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_wires_every_component() {
        let ctx = Context::new(Config::default());
        assert_eq!(ctx.tools.specs().count(), 9);
        assert_eq!(ctx.agent.conversation_count(), 0);
    }
}
