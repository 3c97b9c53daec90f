//! Per-connection processing pipeline.

pub mod chain;
pub mod context;
pub mod registry;

pub use chain::{Chain, ChainAccess, Effect, Event, Stage, StageHandle};
pub use context::{ConnectionContext, PipelineConfigurator};
pub use registry::{ConnectionGuard, ConnectionRegistry};
