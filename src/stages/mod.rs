//! The stages a default connection chain is assembled from.

pub mod classifier;
pub mod connect;
pub mod http1;
pub mod http2;
pub mod recursive;
pub mod stamper;
pub mod timeout;
pub mod tls;

pub use classifier::ExceptionClassifierStage;
pub use connect::{out_of_scope_response, ConnectStage, PassThroughPredicate};
pub use http1::HttpDecodeStage;
pub use http2::{H2cUpgradeStage, PrefaceSniffStage};
pub use recursive::RecursiveGuardStage;
pub use stamper::MessageStamperStage;
pub use timeout::ReadTimeoutStage;
pub use tls::{TlsSniffStage, TlsTerminatorStage};
