use crate::config::CorsConfig;
use http::header;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

/// Builds the CORS layer from `CORS_ORIGIN`: a single origin, a
/// comma-separated list, or `*` (development only).
pub fn create_cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<String> = config
        .allowed_origin
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    if origins.iter().any(|o| o == "*") {
        warn!("wildcard CORS enabled - development only");
        return base_layer().allow_origin(Any).allow_headers(Any);
    }

    let origin_headers: Vec<http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<http::HeaderValue>() {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("skipping invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();

    if origin_headers.is_empty() {
        warn!("no valid CORS origins configured, restricting to localhost:3000");
        return base_layer()
            .allow_origin(AllowOrigin::exact(
                "http://localhost:3000".parse().expect("static origin"),
            ))
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .allow_credentials(true);
    }

    info!("CORS configured for {} origin(s)", origin_headers.len());
    base_layer()
        .allow_origin(AllowOrigin::list(origin_headers))
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_credentials(true)
}

fn base_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .max_age(std::time::Duration::from_secs(3600))
}
