//! Capture log: the binary container a module writes during a measurement
//! and the offline tools that read it back.
//!
//! One file per module and measurement. Records are framed little-endian:
//! a schema record registers a channel (topic + JSON-Schema), message
//! records carry sequence-numbered JSON bodies with log and publish
//! timestamps. Consumers either decode into a caller-described columnar
//! buffer or walk the file to infer a union schema.

pub mod infer;
pub mod reader;
pub mod writer;

pub use reader::{CaptureReader, ColumnBuffer, ColumnField, ColumnSchema, FieldType};
pub use writer::{CaptureMessage, CaptureWriter};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a capture file: {0}")]
    BadMagic(String),

    #[error("corrupt capture record: {0}")]
    Corrupt(String),

    #[error("writer is closed")]
    Closed,

    #[error("unknown channel id {0}")]
    UnknownChannel(u16),
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;
