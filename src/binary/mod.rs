//! Binary loader for the module format: an offset-tracked byte-stream reader
//! and a section decoder producing the AST [`crate::model::Module`].

pub mod reader;
pub mod sections;

use thiserror::Error;

pub use reader::Reader;
pub use sections::decode_module;

/// Result alias for loading operations.
pub type Result<T> = core::result::Result<T, LoadError>;

/// Errors raised while decoding a binary module stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("LEB128 value does not fit in {bits} bits at offset {offset}")]
    IntegerTooLarge { bits: u8, offset: usize },

    #[error("LEB128 encoding exceeds {limit} bytes at offset {offset}")]
    IntegerTooLong { limit: u8, offset: usize },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("malformed binary at offset {offset}: {msg}")]
    Malformed { offset: usize, msg: &'static str },
}
