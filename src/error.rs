//! Error kinds, per §7. Each owning module keeps its own `thiserror` enum;
//! this aggregates them only where a public API needs a single type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("dht: {0}")]
    Dht(#[from] crate::dht::DhtError),
    #[error("transport: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("bridge: {0}")]
    Bridge(#[from] crate::bridge::BridgeError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
