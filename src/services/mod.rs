//! The six phase services and their shared execution scaffold.
//!
//! Each service owns one `PhaseType`, one execution registry, and one
//! control dispatcher, all through `runner::PhaseRuntime`. `build_registry`
//! wires the full pipeline from one dependency bundle.

pub mod analysis;
pub mod dns;
pub mod enrichment;
pub mod extraction;
pub mod generation;
pub mod http;
pub mod runner;

pub use analysis::AnalysisService;
pub use dns::DnsService;
pub use enrichment::EnrichmentService;
pub use extraction::ExtractionService;
pub use generation::GenerationService;
pub use http::HttpService;

use std::sync::Arc;

use crate::engines::flags::FeatureFlagReader;
use crate::engines::{DomainResolver, HttpFetcher, KeywordScanner, PageAnalyzer, RelevanceScorer};
use crate::events::EventBus;
use crate::phase::PhaseRegistry;
use crate::store::CampaignStore;

/// Everything the pipeline needs, bundled once at wiring time.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn CampaignStore>,
    pub bus: Arc<dyn EventBus>,
    pub resolver: Arc<dyn DomainResolver>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub analyzer: Arc<dyn PageAnalyzer>,
    pub scanner: Arc<dyn KeywordScanner>,
    pub scorer: Arc<dyn RelevanceScorer>,
    pub flags: Arc<dyn FeatureFlagReader>,
}

/// Build a registry with all six phase services in pipeline order.
pub fn build_registry(deps: &EngineDeps) -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    registry.register(Arc::new(GenerationService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
    )));
    registry.register(Arc::new(DnsService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.resolver),
    )));
    registry.register(Arc::new(HttpService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.fetcher),
        Arc::clone(&deps.analyzer),
        Arc::clone(&deps.scanner),
    )));
    registry.register(Arc::new(ExtractionService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.fetcher),
        Arc::clone(&deps.analyzer),
        Arc::clone(&deps.scanner),
        Arc::clone(&deps.scorer),
        Arc::clone(&deps.flags),
    )));
    registry.register(Arc::new(AnalysisService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.scorer),
        Arc::clone(&deps.flags),
    )));
    registry.register(Arc::new(EnrichmentService::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.bus),
    )));
    registry
}

/// Compose the campaign-level aggregate across every registered phase.
pub async fn campaign_status(
    registry: &PhaseRegistry,
    campaign_id: uuid::Uuid,
) -> Result<crate::phase::status::CampaignStatus, crate::errors::PhaseError> {
    let mut reports = Vec::with_capacity(registry.len());
    for service in registry.in_order() {
        reports.push(service.status(campaign_id).await?);
    }
    Ok(crate::phase::status::compose_campaign_status(
        campaign_id,
        reports,
    ))
}
