//! Error kinds named in spec section 7, matched on throughout instead of
//! a single opaque error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("invalid allow spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("failed to read or write CA material at {path}: {source}")]
    CaIoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed for {subject}: {source}")]
    CaCryptoError {
        subject: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("failed to connect upstream to {host}:{port}: {source}")]
    UpstreamConnectError {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading upstream response from {host}: {source}")]
    UpstreamReadError {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeError(String),

    #[error("could not evaluate rule against request: {0}")]
    RuleEvalError(String),

    #[error("jailer system call failed during {step}: {source}")]
    JailerSystemError {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

pub type Result<T> = std::result::Result<T, BoundaryError>;
