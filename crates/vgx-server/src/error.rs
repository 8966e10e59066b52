// src/error.rs
use crate::buffer::BufferError;
use crate::http::HttpStatus;
use std::io;
use thiserror::Error;

/// Central error type for the dispatch core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stream buffer could not grow.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Every client slot is occupied and none can be reclaimed.
    #[error("client pool exhausted")]
    PoolExhausted,

    /// A client could not be handed to an executor.
    #[error("dispatch failed: {0}")]
    Dispatch(&'static str),

    /// Server is not accepting new work.
    #[error("service unavailable")]
    ServiceOut,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Neither eventfd nor the loopback pair could be created.
    #[error("wake monitor setup failed: {0}")]
    Wake(String),

    #[error("{0}")]
    Other(String),
}

impl ServerError {
    /// Status a connection receives when this error reaches response production.
    pub fn status_code(&self) -> HttpStatus {
        match self {
            ServerError::PoolExhausted => HttpStatus::TOO_MANY_REQUESTS,
            ServerError::ServiceOut => HttpStatus::SERVICE_UNAVAILABLE,
            ServerError::Buffer(BufferError::Alloc) => HttpStatus::PAYLOAD_TOO_LARGE,
            _ => HttpStatus::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Failure while reading the request line or a header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No complete line is buffered yet.
    #[error("incomplete line")]
    Incomplete,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("HTTP version not supported")]
    VersionNotSupported,
    #[error("line too long")]
    LineTooLong,
    #[error("too many headers")]
    TooManyHeaders,
}

impl ParseError {
    pub fn status_code(&self) -> HttpStatus {
        match self {
            ParseError::Incomplete | ParseError::BadRequest(_) => HttpStatus::BAD_REQUEST,
            ParseError::VersionNotSupported => HttpStatus::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::LineTooLong => HttpStatus::URI_TOO_LONG,
            ParseError::TooManyHeaders => HttpStatus::REQUEST_HEADER_FIELDS_TOO_LARGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServerError::PoolExhausted.status_code(), HttpStatus::TOO_MANY_REQUESTS);
        assert_eq!(ServerError::ServiceOut.status_code(), HttpStatus::SERVICE_UNAVAILABLE);
        assert_eq!(
            ServerError::Buffer(BufferError::Alloc).status_code(),
            HttpStatus::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServerError::Dispatch("queue").status_code(),
            HttpStatus::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ParseError::LineTooLong.status_code(), HttpStatus::URI_TOO_LONG);
        assert_eq!(
            ParseError::VersionNotSupported.status_code(),
            HttpStatus::HTTP_VERSION_NOT_SUPPORTED
        );
    }
}
