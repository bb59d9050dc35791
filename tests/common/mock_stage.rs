// Mock stage server for testing
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, dev::ServerHandle, http::StatusCode, web,
};
use parking_lot::Mutex;
use pipeline_gateway::stage::REQUEST_ID_HEADER;
use serde_json::{Value, json};

/// Configuration for mock stage behavior
#[derive(Clone, Debug)]
pub struct MockStageConfig {
    pub call_path: &'static str,
    pub response: Value,
    pub response_delay_ms: u64,
    pub fail_status: Option<u16>,
    pub health: Value,
    pub health_text: Option<&'static str>,
}

impl MockStageConfig {
    pub fn processing(response: Value) -> Self {
        Self {
            call_path: "/process",
            response,
            response_delay_ms: 0,
            fail_status: None,
            health: json!({"status": "healthy", "service": "data-processor"}),
            health_text: None,
        }
    }

    pub fn inference(response: Value) -> Self {
        Self {
            call_path: "/infer",
            response,
            response_delay_ms: 0,
            fail_status: None,
            health: json!({"status": "healthy", "service": "inference-engine"}),
            health_text: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn with_health(mut self, health: Value) -> Self {
        self.health = health;
        self
    }

    /// Answer `/health` with a plain-text body instead of JSON.
    pub fn with_plain_health(mut self, text: &'static str) -> Self {
        self.health_text = Some(text);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub request_id: Option<String>,
    pub body: Value,
}

struct MockStageState {
    config: MockStageConfig,
    calls: Mutex<Vec<RecordedCall>>,
}

/// Mock stage server bound to an ephemeral port on localhost
pub struct MockStage {
    url: String,
    state: Arc<MockStageState>,
    handle: ServerHandle,
}

impl MockStage {
    pub async fn start(config: MockStageConfig) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(MockStageState {
            config: config.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let data = web::Data::from(state.clone());
        let call_path = config.call_path;

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route(call_path, web::post().to(handle_call))
                .route("/health", web::get().to(handle_health))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            url: format!("http://127.0.0.1:{}", port),
            state,
            handle,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

async fn handle_call(
    req: HttpRequest,
    body: web::Json<Value>,
    state: web::Data<MockStageState>,
) -> HttpResponse {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.calls.lock().push(RecordedCall {
        request_id,
        body: body.into_inner(),
    });

    if state.config.response_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.config.response_delay_ms)).await;
    }

    match state.config.fail_status {
        Some(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            HttpResponse::build(status).body("mock stage failure")
        }
        None => HttpResponse::Ok().json(&state.config.response),
    }
}

async fn handle_health(state: web::Data<MockStageState>) -> HttpResponse {
    match state.config.health_text {
        Some(text) => HttpResponse::Ok().content_type("text/plain").body(text),
        None => HttpResponse::Ok().json(&state.config.health),
    }
}
