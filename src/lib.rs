pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod utils;

pub use config::Config;
pub use context::GatewayContext;
pub use error::{AppError, AppResult};
pub use gateway::GatewayRouter;
