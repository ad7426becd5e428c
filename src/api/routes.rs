//! API Routes
//!
//! Configures the Axum router with all relay endpoints.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    batch_chunks_handler, code_status_handler, download_chunk_handler, download_complete_handler,
    get_secret_handler, health_handler, metadata_handler, register_code_handler, stats_handler,
    store_secret_handler, upload_chunk_handler, upload_complete_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `POST /codes` - Register a pickup code (fresh artifact or reuse)
/// - `GET /codes/:code` - Code status and cached metadata
/// - `PUT /codes/:code/chunks/:index` - Buffer one encrypted chunk
/// - `GET /codes/:code/chunks/:index` - Download one encrypted chunk
/// - `POST /codes/:code/chunks` - Batch chunk download
/// - `POST /codes/:code/complete` - Upload completeness check and merge
/// - `POST /codes/:code/downloaded` - Receiver completion signal
/// - `PUT /codes/:code/secret` - Store the wrapped file key
/// - `GET /codes/:code/secret` - Fetch the wrapped file key
/// - `GET /codes/:code/metadata` - Artifact metadata
/// - `GET /stats` - Cache, pool and mapping statistics
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router with all endpoints
    Router::new()
        .route("/codes", post(register_code_handler))
        .route("/codes/:code", get(code_status_handler))
        .route(
            "/codes/:code/chunks/:index",
            put(upload_chunk_handler).get(download_chunk_handler),
        )
        .route("/codes/:code/chunks", post(batch_chunks_handler))
        .route("/codes/:code/complete", post(upload_complete_handler))
        .route("/codes/:code/downloaded", post(download_complete_handler))
        .route(
            "/codes/:code/secret",
            put(store_secret_handler).get(get_secret_handler),
        )
        .route("/codes/:code/metadata", get(metadata_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
