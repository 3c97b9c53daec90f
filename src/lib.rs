pub mod certs;
pub mod codec;
pub mod config;
pub mod error;
pub mod legacy;
pub mod message;
pub mod pipeline;
pub mod server;
pub mod stages;

pub use error::{Error, Result};
pub use legacy::LegacyStream;
pub use message::{Headers, HttpMessage, RequestLine};
pub use pipeline::{
    Chain, ChainAccess, ConnectionContext, ConnectionRegistry, Effect, Event, PipelineConfigurator,
    Stage, StageHandle,
};
pub use server::{ProxyServer, RequestHandler};
