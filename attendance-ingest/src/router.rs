use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use attendance_common::metrics::{setup_metrics_recorder, track_metrics};
use attendance_common::store::AccessStore;
use attendance_common::vendor::VendorClient;

use crate::config::Config;
use crate::webhook;

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn AccessStore>,
    pub vendor: Arc<dyn VendorClient>,
    pub config: Config,
}

async fn index() -> &'static str {
    "attendance-ingest"
}

pub fn router(
    store: Arc<dyn AccessStore>,
    vendor: Arc<dyn VendorClient>,
    config: Config,
) -> Router {
    let export_prometheus = config.export_prometheus;
    let state = State {
        store,
        vendor,
        config,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/api/acs/events", post(webhook::receive_event))
        .route("/api/acs/events/", post(webhook::receive_event))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to.
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if export_prometheus {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
