// src/completion.rs
//! Return path from executors (and the matrix) to the I/O thread.

use crate::client::{Client, ClientState};
use crate::config::MAX_EXECUTORS;
use crate::wake::WakeMonitor;
use arrayvec::ArrayVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type CompletionBatch = ArrayVec<Box<Client>, MAX_EXECUTORS>;

pub struct CompletionQueue {
    queue: Mutex<VecDeque<Box<Client>>>,
    len: AtomicUsize,
    /// Set while the I/O thread sits in a blocking poll().
    poll_blocked: AtomicBool,
    wake: Arc<WakeMonitor>,
}

impl CompletionQueue {
    pub fn new(wake: Arc<WakeMonitor>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(64)),
            len: AtomicUsize::new(0),
            poll_blocked: AtomicBool::new(false),
            wake,
        }
    }

    pub fn wake(&self) -> &WakeMonitor {
        &self.wake
    }

    /// Hand a client back to the I/O thread. The client is returned when the
    /// queue cannot grow.
    pub fn push(&self, client: Box<Client>) -> Result<(), Box<Client>> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.try_reserve(1).is_err() {
                return Err(client);
            }
            queue.push_back(client);
            self.len.fetch_add(1, Ordering::Release);
        }
        if self.poll_blocked.load(Ordering::Acquire) {
            self.wake.signal();
        }
        Ok(())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop up to `max` clients in FIFO order.
    pub fn drain(&self, max: usize) -> CompletionBatch {
        let mut batch = CompletionBatch::new();
        if self.is_empty() {
            return batch;
        }
        let max = max.clamp(1, MAX_EXECUTORS);
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        while batch.len() < max {
            let Some(client) = queue.pop_front() else {
                break;
            };
            batch.push(client);
        }
        self.len.fetch_sub(batch.len(), Ordering::Release);
        batch
    }

    /// Announce a blocking poll. Fails, leaving the flag clear, when
    /// completions are already waiting.
    pub fn enter_blocking(&self) -> bool {
        self.poll_blocked.store(true, Ordering::SeqCst);
        if self.len.load(Ordering::SeqCst) > 0 {
            self.poll_blocked.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn leave_blocking(&self) {
        self.poll_blocked.store(false, Ordering::SeqCst);
    }

    pub fn is_poll_blocked(&self) -> bool {
        self.poll_blocked.load(Ordering::Acquire)
    }

    /// Drop every queued client. Used when tearing down after a stall.
    pub fn clear(&self) -> Vec<Box<Client>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<_> = queue.drain(..).collect();
        self.len.fetch_sub(drained.len(), Ordering::Release);
        drained
    }
}

/// What the I/O thread does with a returned client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Hand to the backend matrix after preprocessing.
    Forward,
    /// Response is final; patch and send it.
    Collect,
    /// Run again, bounded by the resubmit limit.
    Resubmit,
    /// The matrix is done; stage for merge or postprocessing.
    Stage,
    /// State no executor may leave behind.
    Defect,
}

pub fn completion_action(client: &Client, matrix_enabled: bool) -> CompletionAction {
    match client.state {
        ClientState::Preprocess if !client.complete && matrix_enabled => CompletionAction::Forward,
        ClientState::Preprocess
        | ClientState::Execute
        | ClientState::Merge
        | ClientState::Postprocess => CompletionAction::Collect,
        ClientState::Resubmit => CompletionAction::Resubmit,
        ClientState::DispatchComplete => CompletionAction::Stage,
        _ => CompletionAction::Defect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::WakeMode;
    use std::thread;

    fn queue() -> CompletionQueue {
        CompletionQueue::new(Arc::new(WakeMonitor::new(WakeMode::Loopback).unwrap()))
    }

    fn client(id: usize, state: ClientState) -> Box<Client> {
        let mut client = Box::new(Client::new(id).unwrap());
        client.state = state;
        client
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let cq = queue();
        for id in 2..8 {
            cq.push(client(id, ClientState::Execute)).unwrap();
        }
        assert_eq!(cq.len(), 6);
        let first: Vec<_> = cq.drain(4).iter().map(|c| c.id).collect();
        assert_eq!(first, vec![2, 3, 4, 5]);
        assert_eq!(cq.len(), 2);
        let rest: Vec<_> = cq.drain(4).iter().map(|c| c.id).collect();
        assert_eq!(rest, vec![6, 7]);
        assert!(cq.drain(4).is_empty());
    }

    #[test]
    fn test_every_pushed_client_is_drained_once() {
        let cq = Arc::new(queue());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let cq = Arc::clone(&cq);
                thread::spawn(move || {
                    for i in 0..50 {
                        cq.push(client(p * 1000 + i, ClientState::Execute)).unwrap();
                    }
                })
            })
            .collect();
        let mut seen = Vec::new();
        while seen.len() < 200 {
            seen.extend(cq.drain(8).iter().map(|c| c.id));
            thread::yield_now();
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(cq.drain(8).is_empty());
        // Per-producer order survives
        for p in 0..4 {
            let ids: Vec<_> = seen.iter().copied().filter(|id| id / 1000 == p).collect();
            let expected: Vec<_> = (0..50).map(|i| p * 1000 + i).collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_enter_blocking_refuses_when_work_is_queued() {
        let cq = queue();
        assert!(cq.enter_blocking());
        assert!(cq.is_poll_blocked());
        cq.leave_blocking();
        cq.push(client(2, ClientState::Execute)).unwrap();
        assert!(!cq.enter_blocking());
        assert!(!cq.is_poll_blocked());
    }

    #[test]
    fn test_push_while_blocked_signals_wake() {
        let cq = queue();
        assert!(cq.enter_blocking());
        cq.push(client(2, ClientState::Execute)).unwrap();
        let mut fds = [crate::syscalls::pollfd(cq.wake().poll_fd(), crate::syscalls::POLLIN)];
        assert_eq!(crate::syscalls::poll(&mut fds, 1000).unwrap(), 1);
    }

    #[test]
    fn test_completion_actions() {
        let c = client(2, ClientState::Preprocess);
        assert_eq!(completion_action(&c, true), CompletionAction::Forward);
        assert_eq!(completion_action(&c, false), CompletionAction::Collect);
        let mut c = client(2, ClientState::Preprocess);
        c.complete = true;
        assert_eq!(completion_action(&c, true), CompletionAction::Collect);
        assert_eq!(completion_action(&client(2, ClientState::Postprocess), true), CompletionAction::Collect);
        assert_eq!(completion_action(&client(2, ClientState::Resubmit), false), CompletionAction::Resubmit);
        assert_eq!(completion_action(&client(2, ClientState::DispatchComplete), true), CompletionAction::Stage);
        assert_eq!(completion_action(&client(2, ClientState::ExpectHeaders), false), CompletionAction::Defect);
    }
}
