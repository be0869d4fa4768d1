//! Routes gateway for the SLA engine.
//!
//! Each sibling module exports a subrouter over [`AppState`]; this gateway
//! merges them so `main.rs` never needs to know about individual endpoints.

use std::sync::Arc;

use axum::Router;
use serde::Deserialize;

use crate::aggregator::SlaAggregator;
use crate::cache::SlaCache;
use crate::error::SlaResult;
use crate::loader::BulkLoader;
use crate::models::DateRange;
use crate::reconcile::ReconcileService;
use crate::registry::SiteRegistry;
use crate::store::{CatalogStore, SlaStore};

mod export;
mod health;
mod history;
mod reasons;
mod reports;
mod site_status;
mod sla;
mod upload;

// ---

/// Shared handler state. Every engine component is constructed once in
/// `main.rs` and injected here.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SlaStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub registry: Arc<dyn SiteRegistry>,
    pub cache: SlaCache,
    pub aggregator: Arc<SlaAggregator>,
    pub loader: Arc<BulkLoader>,
    pub reconcile: Arc<ReconcileService>,
}

/// `startDate` / `endDate` query parameters shared by the read endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RangeQuery {
    pub start_date: String,
    pub end_date: String,
}

impl RangeQuery {
    pub fn range(&self) -> SlaResult<DateRange> {
        DateRange::parse(&self.start_date, &self.end_date)
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(sla::router())
        .merge(upload::router())
        .merge(reports::router())
        .merge(reasons::router())
        .merge(history::router())
        .merge(site_status::router())
        .merge(export::router())
        .merge(health::router())
        .with_state(state)
}
