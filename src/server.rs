use actix_web::{
    HttpRequest, HttpResponse, HttpServer, error::InternalError, get, post, web,
};
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    config::GatewayConfig,
    error::GatewayError,
    gateway::{GATEWAY_NAME, GatewayState},
    health::OverallStatus,
    poller::PollOutcome,
    rate_limit::RateLimit,
    request::LogKind,
};

const MAX_JSON_PAYLOAD: usize = 4 * 1024 * 1024;

fn check_status_path(request_id: &str) -> String {
    format!("/api/requests/{}", request_id)
}

#[get("/")]
pub async fn index(_req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Pipeline API Gateway",
        "endpoints": [
            "/health",
            "/api/requests",
            "/api/predict",
            "/api/process",
            "/api/infer",
            "/api/services/status",
            "/api/requests/{request_id}",
            "/api/logs/{kind}",
        ],
    }))
}

#[get("/health")]
pub async fn health(_req: HttpRequest, app_state: web::Data<GatewayState>) -> HttpResponse {
    match app_state.store_health().await {
        Ok(()) => HttpResponse::Ok().json(json!({
            "status": "healthy",
            "service": GATEWAY_NAME,
            "timestamp": Utc::now().to_rfc3339(),
            "store": "connected",
            "backend": app_state.store_backend(),
        })),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "status": "unhealthy",
            "service": GATEWAY_NAME,
            "timestamp": Utc::now().to_rfc3339(),
            "store": "disconnected",
            "error": e.to_string(),
        })),
    }
}

#[post("/requests")]
pub async fn submit_request(
    _req: HttpRequest,
    body: web::Json<Value>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let request = app_state.submit(body.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(json!({
        "request_id": request.id,
        "status": request.status,
        "message": "Request accepted for processing",
        "check_status": check_status_path(&request.id),
    })))
}

#[post("/predict")]
pub async fn predict(
    _req: HttpRequest,
    body: web::Json<Value>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let (request_id, outcome) = app_state.submit_and_wait(body.into_inner()).await?;
    let response = match outcome {
        PollOutcome::Completed { result } => HttpResponse::Ok().json(json!({
            "request_id": request_id,
            "status": "completed",
            "result": result,
        })),
        PollOutcome::Failed {
            error,
            failed_stage,
        } => HttpResponse::InternalServerError().json(json!({
            "request_id": request_id,
            "status": "failed",
            "error": error,
            "failed_stage": failed_stage,
        })),
        PollOutcome::StillProcessing => HttpResponse::Accepted().json(json!({
            "request_id": request_id,
            "status": "processing",
            "message": "Still processing, poll later",
            "check_status": check_status_path(&request_id),
        })),
    };
    Ok(response)
}

#[get("/requests/{request_id}")]
pub async fn request_status(
    path: web::Path<String>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let view = app_state.status(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[get("/services/status")]
pub async fn services_status(
    _req: HttpRequest,
    app_state: web::Data<GatewayState>,
) -> HttpResponse {
    HttpResponse::Ok().json(app_state.services_status().await)
}

#[post("/process")]
pub async fn process(
    _req: HttpRequest,
    body: web::Json<Value>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let response = app_state.forward_process(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/infer")]
pub async fn infer(
    _req: HttpRequest,
    body: web::Json<Value>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let response = app_state.forward_infer(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/logs/{kind}")]
pub async fn logs(
    path: web::Path<String>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, GatewayError> {
    let kind = match path.into_inner().parse::<LogKind>() {
        Ok(kind) => kind,
        Err(e) => return Ok(HttpResponse::BadRequest().json(json!({"error": e}))),
    };
    let entries = app_state.logs(kind).await?;
    Ok(HttpResponse::Ok().json(json!({
        "kind": kind.key(),
        "count": entries.len(),
        "entries": entries,
    })))
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_JSON_PAYLOAD)
        .error_handler(|err, _req| {
            let body = json!({"error": err.to_string()});
            InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
        })
}

/// Register every route on `cfg`. `/api` routes sit behind the rate limiter.
pub fn configure(cfg: &mut web::ServiceConfig, app_state: web::Data<GatewayState>) {
    let limiter = app_state.rate_limiter();
    cfg.app_data(app_state)
        .app_data(json_config())
        .service(index)
        .service(health)
        .service(
            web::scope("/api")
                .wrap(RateLimit::new(limiter))
                .service(submit_request)
                .service(predict)
                .service(request_status)
                .service(services_status)
                .service(process)
                .service(infer)
                .service(logs),
        );
}

pub async fn periodic_logging(app_state: GatewayState) {
    let interval = std::time::Duration::from_secs(app_state.log_interval.max(1));
    loop {
        tokio::time::sleep(interval).await;

        let report = app_state.services_status().await;
        match report.overall {
            OverallStatus::Healthy => log::info!("Services healthy"),
            OverallStatus::Degraded => {
                let unhealthy = report
                    .services
                    .values()
                    .filter(|s| !s.status.is_ok())
                    .map(|s| format!("{}={:?}", s.service_name, s.status))
                    .collect::<Vec<_>>();
                log::warn!("Services degraded: {}", unhealthy.join(", "));
            }
        }

        let (queue_depth, available_slots) = app_state.queue_load();
        log::info!(
            "Job queue: depth={}, available_slots={}",
            queue_depth,
            available_slots
        );
        app_state.rate_limiter().prune_idle();
    }
}

pub async fn startup(config: GatewayConfig, app_state: GatewayState) -> std::io::Result<()> {
    let app_state = web::Data::new(app_state);

    log::info!("Starting server at {}:{}", config.host, config.port);
    log::info!(
        "Stages: processing={}, inference={}, store={}",
        config.processing_url,
        config.inference_url,
        app_state.store_backend()
    );

    HttpServer::new(move || {
        let app_state = app_state.clone();
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .configure(|cfg| configure(cfg, app_state))
    })
    .bind((config.host, config.port))?
    .run()
    .await
}
