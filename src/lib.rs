pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod proxy;
pub mod pump;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use metrics::MetricsCollector;
pub use server::{build_router, AppState};
pub use upstream::UpstreamClient;
