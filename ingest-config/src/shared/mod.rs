//! Shared configuration types for the ingestion service.

mod base;
mod batch;
mod connection;
mod ingest;
mod refresh;
mod service;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use connection::PgConnectionConfig;
pub use ingest::IngestConfig;
pub use refresh::RefreshConfig;
pub use service::ServiceConfig;
