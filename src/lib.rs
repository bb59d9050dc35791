pub mod audit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod rate_limit;
pub mod request;
pub mod server;
pub mod stage;
pub mod store;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::GatewayState;
