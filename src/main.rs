use clap::Parser;
use pipeline_gateway::{
    config::GatewayConfig,
    gateway::GatewayState,
    logging::init_logging,
    server::{periodic_logging, startup},
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "pipeline-gateway")]
#[command(about = "Gateway running requests through a processing stage and an inference stage")]
struct CliArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Base URL of the processing stage
    #[arg(long, env = "PROCESSING_URL", default_value = "http://data-processor:3002")]
    processing_url: String,

    /// Base URL of the inference stage
    #[arg(long, env = "INFERENCE_URL", default_value = "http://inference-engine:3001")]
    inference_url: String,

    /// Redis URL for the request store; in-memory when omitted
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, default_value_t = 16)]
    redis_pool_max: usize,

    #[arg(long, default_value_t = 10_000)]
    stage_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    health_timeout_ms: u64,

    #[arg(long, default_value_t = 15_000)]
    poll_deadline_ms: u64,

    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 1000)]
    queue_capacity: usize,

    #[arg(long, default_value_t = 32)]
    max_concurrent_jobs: usize,

    /// Requests per client per window on /api routes (0 disables)
    #[arg(long, default_value_t = 10)]
    rate_limit_max: u32,

    #[arg(long, default_value_t = 60)]
    rate_limit_window_secs: u64,

    #[arg(long, default_value_t = 30)]
    log_interval_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", value_parser = ["off", "error", "warn", "info", "debug", "trace"])]
    log_level: String,
}

impl CliArgs {
    fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            processing_url: self.processing_url.clone(),
            inference_url: self.inference_url.clone(),
            redis_url: self.redis_url.clone().filter(|url| !url.is_empty()),
            redis_pool_max: self.redis_pool_max,
            stage_timeout_ms: self.stage_timeout_ms,
            health_timeout_ms: self.health_timeout_ms,
            poll_deadline_ms: self.poll_deadline_ms,
            poll_interval_ms: self.poll_interval_ms,
            queue_capacity: self.queue_capacity,
            max_concurrent_jobs: self.max_concurrent_jobs,
            rate_limit_max: self.rate_limit_max,
            rate_limit_window_secs: self.rate_limit_window_secs,
            log_interval_secs: self.log_interval_secs,
            log_level: self.log_level.clone(),
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let state = GatewayState::new(&config)?;
    tokio::select! {
        _ = periodic_logging(state.clone()) => {}
        res = startup(config.clone(), state) => res?,
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = args.to_gateway_config();
    config.validate()?;

    init_logging(&config.log_level);

    actix_web::rt::System::new().block_on(run(config))
}
