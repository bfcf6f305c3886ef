pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod prompt;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod validation;

pub use config::AppConfig;
pub use engine::{GenerationEngine, GenerationResult, MockEngine, build_engine};
pub use error::ServiceError;
pub use gateway::Gateway;
pub use server::build_router;
