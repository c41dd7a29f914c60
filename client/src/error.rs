//! Error types of the realtime client.

use thiserror::Error;

/// Failure of the duplex link itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("link error: {0}")]
    Link(String),
}

/// Why a submission was refused.  Nothing was sent and no state changed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    #[error("not connected to the analysis service")]
    NotConnected,

    #[error("an analysis is already in progress")]
    AlreadyAnalyzing,

    #[error("audio payload is empty")]
    EmptyAudio,

    #[error("cannot encode request: {0}")]
    Encode(String),
}

/// Failure talking to one of the HTTP services.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("no record for {0}")]
    NotFound(String),
}
