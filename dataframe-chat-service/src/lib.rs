pub mod agent;
pub mod config;
pub mod models;
pub mod service;
pub mod telemetry;

pub use agent::RigTableAgent;
pub use config::{LlmProvider, LogFormat, ServiceConfig};
pub use models::*;
pub use service::{AppState, build_router, create_app};
