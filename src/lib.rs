// src/lib.rs
pub mod cache;
pub mod cli;
pub mod codec;
pub mod key;
pub mod native;
pub mod payload;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod service;
pub mod session;

pub use bytes::Bytes;

// Re-export tracing for use in other modules
pub use tracing;

pub use cache::{CacheStore, FsCacheStore};
pub use key::{DriverFilter, KeyError, KeyParams, SessionKey, FORMAT_VERSION};
pub use native::build_router;
pub use payload::TelemetryPayload;
pub use processor::TelemetryProcessor;
pub use progress::{ProgressEvent, ProgressReporter};
pub use registry::{AbandonPolicy, InFlightRegistry};
pub use service::{FetchOptions, ServiceOptions, TelemetryError, TelemetryService};
pub use session::{LoadError, RawSession, SessionLoader};
