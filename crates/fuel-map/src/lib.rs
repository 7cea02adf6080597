//! Fuel Map Live - Application Library
//!
//! Wires the station store and clustering index from `fuel-map-lib` to a live
//! Server-Sent Events channel, a reconciler task and a debounced viewport
//! controller. [`Engine`] is the composition root.

mod app;
pub mod async_runtime;
pub mod bulk;
pub mod channel;
pub mod logging;
pub mod viewport;

pub use app::settings::Settings;
pub use app::state::{EngineStatus, SharedSnapshot};
pub use app::{Engine, run};
pub use channel::{ChannelHealth, ChannelStatus, ConnectionState};
pub use viewport::{RenderItem, Subscription, Viewport, ViewportResults};

use fuel_map_lib::DataError;

/// Errors raised by the live update transport
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Stream ended by the server")]
    StreamEnded,

    #[error("No data received for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by the engine and the binary
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("No tokio runtime is available")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, AppError>;
