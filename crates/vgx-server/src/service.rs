// src/service.rs
use std::sync::atomic::{AtomicU8, Ordering};

/// Administrative serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Serving = 0,
    /// Public requests are refused; admin, bypass and non-API paths still pass.
    ServiceOut = 1,
    /// Nothing is served and no new connections are accepted.
    Suspended = 2,
}

/// Shared switch flipped by the server handle, read by the I/O thread.
#[derive(Debug)]
pub struct ServiceControl(AtomicU8);

impl ServiceControl {
    pub fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline(always)]
    pub fn get(&self) -> ServiceState {
        match self.0.load(Ordering::Acquire) {
            0 => ServiceState::Serving,
            1 => ServiceState::ServiceOut,
            _ => ServiceState::Suspended,
        }
    }

    pub fn set(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for ServiceControl {
    fn default() -> Self {
        Self::new(ServiceState::Serving)
    }
}
