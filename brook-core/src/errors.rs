//! Brook error types with granular categories

use std::io;
use thiserror::Error;

/// Top-level error type for all brook operations
#[derive(Debug, Error)]
pub enum BrookError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the packet/queue runtime and stage graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{stage}: no input data within {timeout_secs} s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("{pipe}: pipe is closed for writing")]
    ClosedForWrite { pipe: String },

    #[error("{pipe}: no more data in pipe")]
    NoMoreData { pipe: String },

    #[error("{pipe}: pipe was killed")]
    Killed { pipe: String },

    #[error("{stage}: joint inputs share the key {key:?}")]
    KeyCollision { stage: String, key: String },

    #[error("{stage}: packet has no slot named {key:?}")]
    MissingKey { stage: String, key: String },

    #[error("{stage}: expected {expected} payload but got {actual}")]
    PayloadMismatch {
        stage: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{name}: can only reset a silent node")]
    NotSilent { name: String },

    #[error("{name}: node has not been started")]
    NotStarted { name: String },

    #[error("{name}: worker thread panicked")]
    WorkerPanicked { name: String },

    #[error("{name}: chain is empty")]
    EmptyChain { name: String },

    #[error("{name}: expected {expected} input pipe(s) but got {actual}")]
    InputArity {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised by the DSP pipeline, extractors and normalizers
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("{context}: dimension mismatch, expected {expected} but got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown window type: {name}")]
    UnknownWindow { name: String },

    #[error("Bad matrix header in {path}: {reason}")]
    BadMatrixFile { path: String, reason: String },

    #[error("No such utterance in stats file: {utt}")]
    UnknownUtterance { utt: String },
}

/// Errors raised by the acoustic estimator and decoder driver
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{stage}: unexpected line from decoder child: {line:?}")]
    ProtocolMismatch { stage: String, line: String },

    #[error("{stage}: decoder child crashed: {stderr}")]
    ChildCrash { stage: String, stderr: String },

    #[error("{stage}: probability dim {actual} does not match the model ({expected} pdfs)")]
    BadProbabilityDim {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("{stage}: chunk of {frames} frames exceeds the decoder batch limit {limit}")]
    ChunkTooLarge {
        stage: String,
        frames: usize,
        limit: usize,
    },
}

/// Errors raised by the wire protocol between hosts
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{name}: failed to send the message after {retries} retries")]
    RetriesExhausted { name: String, retries: usize },

    #[error("{name}: unknown transmission response: {response:#04x}")]
    UnknownResponse { name: String, response: u8 },

    #[error("{name}: unknown wire tag: {tag:#04x}")]
    UnknownTag { name: String, tag: u8 },

    #[error("{name}: connection timed out")]
    ConnectTimeout { name: String },

    #[error("Malformed packet bytes: {reason}")]
    MalformedPacket { reason: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TIMEOUT must be a positive number of seconds, got {value}")]
    InvalidTimeout { value: u64 },

    #[error("TIMESCALE must lie in (0, 1) seconds, got {value}")]
    InvalidTimescale { value: f64 },

    #[error("Maximum socket buffer size must be > 4, got {value}")]
    InvalidSocketBuffer { value: usize },

    #[error("Queue capacity must be positive")]
    InvalidCapacity,

    #[error("Invalid option {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },
}

/// Result type alias for brook operations
pub type Result<T> = std::result::Result<T, BrookError>;
