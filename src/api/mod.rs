// src/api/mod.rs

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::bidding::AuctionEngine;
use crate::feature::FeatureCache;

pub struct AppState {
    pub engine: AuctionEngine,
    pub features: Arc<FeatureCache>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/video/openrtb", post(handlers::handle_openrtb_request))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
