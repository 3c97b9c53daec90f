use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("No root CA certificate: {0}")]
    MissingRootCertificate(String),

    #[error("Malformed HTTP header: {0}")]
    MalformedHeader(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid chain assembly: {0}")]
    ChainAssembly(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn chain_assembly<T: std::fmt::Display>(msg: T) -> Self {
        Error::ChainAssembly(msg.to_string())
    }

    pub fn decode<T: std::fmt::Display>(msg: T) -> Self {
        Error::Decode(msg.to_string())
    }

    pub fn invalid_argument<T: std::fmt::Display>(msg: T) -> Self {
        Error::InvalidArgument(msg.to_string())
    }
}
