//! Resilient client for an external code-analysis server speaking
//! JSON-RPC over stdio with `Content-Length` framing.

pub mod cache;
pub mod codec;
pub mod config;
pub mod query;

pub(crate) mod protocol;
pub(crate) mod session;

mod client;
mod error;
mod manager;

pub use cache::{CacheBackend, CacheError, MemoryCacheBackend, ResultCache};
pub use client::{ClientState, ProtocolClient};
pub use config::{AnalysisConfig, CacheConfig, ConfigError, ServiceConfig};
pub use error::{ErrorKind, LspError};
pub use manager::{HealthReport, HealthStatus, LifecycleManager};
pub use protocol::{PathToUriError, file_uri_to_path, path_to_file_uri};
pub use query::{
    Definition, DocumentQuery, Hover, HoverInfo, Location, Position, QueryKind, Range,
    TypeDefinition,
};
pub use typelens_resilience::{BreakerConfig, BreakerHealth, BreakerState, CircuitBreaker};
