// src/matrix.rs
//! Call boundary to the backend matrix (partition/replica fan-out).
//!
//! The fan-out and merge algorithms live outside this crate. A matrix takes
//! ownership of a forwarded client and must eventually hand it back through
//! the [`CompletionQueue`] in `DispatchComplete`, optionally carrying the
//! partial result that answers the request.

use crate::buffer::StreamBuffer;
use crate::client::Client;
use crate::completion::CompletionQueue;
use crate::http::HttpStatus;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Result returned by one backend partial.
#[derive(Debug)]
pub struct PartialResult {
    pub status: HttpStatus,
    pub content: StreamBuffer,
    /// Response body starts here; leading bytes are backend framing.
    pub content_offset: usize,
}

#[derive(Debug, Default)]
pub struct MatrixLink {
    pub partial: Option<PartialResult>,
    /// Client currently holds backend channel resources.
    pub dispatched: bool,
}

pub trait Matrix: Send + Sync {
    fn enabled(&self) -> bool;

    /// Every plugin request is answered by merging partial results.
    fn multi_partial(&self) -> bool {
        false
    }

    /// Take ownership of `client`. Returns it back when it cannot be forwarded.
    fn forward(&self, client: Box<Client>, returns: &Arc<CompletionQueue>) -> Result<(), Box<Client>>;

    /// Release backend channel resources held by `client`.
    fn complete(&self, client: &mut Client) {
        client.matrix.dispatched = false;
    }

    /// Append the backend channel sockets the I/O thread should poll. A
    /// channel waits either to read or to write, never both.
    fn poll_fds(&self, _pollfds: &mut Vec<libc::pollfd>) {}

    /// Readiness reported for a descriptor added by [`poll_fds`](Self::poll_fds).
    fn channel_ready(&self, _fd: RawFd, _revents: i16) {}
}

/// Stand-alone server without backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMatrix;

impl Matrix for NoMatrix {
    fn enabled(&self) -> bool {
        false
    }

    fn forward(&self, client: Box<Client>, _returns: &Arc<CompletionQueue>) -> Result<(), Box<Client>> {
        Err(client)
    }
}
