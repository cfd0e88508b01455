//! Handing queued jobs to worker services.

pub mod client;
pub mod dispatcher;
pub mod heartbeat;
pub mod http;

pub use client::{DispatchClient, DispatchError, DispatchResponse};
pub use dispatcher::{DispatchReport, DispatchSettings, Dispatcher};
pub use heartbeat::{HeartbeatReport, JobProducerHeartbeat};
pub use http::HttpDispatchClient;
