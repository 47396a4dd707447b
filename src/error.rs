use thiserror::Error;

use crate::params::{TweakKey, TweakKind};

/// Failures while turning wire bytes back into a parameter set.
///
/// A decode failure never tears the session down; the payload is dropped and
/// the next full-state resync supersedes it.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate tweak key {0}")]
    DuplicateKey(TweakKey),
}

/// Rejections of a local `set_value` call. These never touch session state.
#[derive(Debug, Error, PartialEq)]
pub enum TweakError {
    #[error("unknown tweak {0}")]
    UnknownKey(TweakKey),
    #[error("{key}: expected {expected:?} value, got {got:?}")]
    TypeMismatch {
        key: TweakKey,
        expected: TweakKind,
        got: TweakKind,
    },
    #[error("{key}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        key: TweakKey,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("a session is already active")]
    Busy,
    #[error("no such peer is currently visible")]
    UnknownPeer,
}

/// Errors surfaced by the `TweakSync` handle.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Tweak(#[from] TweakError),
    #[error("service stopped")]
    Stopped,
}

/// Errors from the QUIC/mDNS transport plumbing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate generation failed: {0}")]
    Cert(#[from] rcgen::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls setup: {0}")]
    TlsSetup(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),
    #[error("discovery error: {0}")]
    Discovery(#[from] mdns_sd::Error),
    #[error("{0}")]
    Setup(String),
}
