// Shared helpers for integration tests
#![allow(dead_code)]

pub mod mock_stage;

use pipeline_gateway::config::GatewayConfig;

/// Config pointing at the given stage URLs with short timings and no rate limit.
pub fn test_config(processing_url: &str, inference_url: &str) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        processing_url: processing_url.to_string(),
        inference_url: inference_url.to_string(),
        redis_url: None,
        stage_timeout_ms: 1_000,
        health_timeout_ms: 500,
        poll_deadline_ms: 3_000,
        poll_interval_ms: 20,
        rate_limit_max: 0,
        ..Default::default()
    }
}

/// A URL on which nothing is listening.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
