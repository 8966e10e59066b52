// src/dispatch.rs
//! Work queues between the I/O thread and the executor pool.
//!
//! The I/O thread picks a queue with the waterfall rule: starting from a
//! hinted index, take the first queue holding fewer items than it has
//! parked executors, or the last queue when none qualifies. Lower queues
//! are served by fewer executors, so they drain fast while idle capacity
//! exists and overflow downward under load.

use crate::client::Client;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Stop sentinels pushed per queue on shutdown.
pub const STOP_SENTINELS: usize = 100;

pub enum Work {
    Client(Box<Client>),
    Stop,
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Client(client) => write!(f, "Work::Client({})", client.id),
            Work::Stop => f.write_str("Work::Stop"),
        }
    }
}

/// Result of one fetch attempt.
#[derive(Debug)]
pub enum Fetch {
    Work(Work),
    /// Waited on the queue and nothing arrived.
    Timeout,
    /// Queue empty and the waiter cap was reached.
    Saturated,
}

pub struct DispatchQueue {
    fifo: Mutex<VecDeque<Work>>,
    ready: Condvar,
    len: AtomicUsize,
    n_waiting: AtomicUsize,
}

impl DispatchQueue {
    fn new() -> Self {
        Self {
            fifo: Mutex::new(VecDeque::with_capacity(64)),
            ready: Condvar::new(),
            len: AtomicUsize::new(0),
            n_waiting: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn n_waiting(&self) -> usize {
        self.n_waiting.load(Ordering::Acquire)
    }

    /// FIFO length under the lock, for consistency checks.
    pub fn locked_len(&self) -> usize {
        self.fifo.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Executor state visible to the I/O thread and the shutdown watchdog.
pub struct ExecutorShared {
    pub id: usize,
    /// Index of the queue this executor fetches from.
    pub queue: usize,
    idle: AtomicBool,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    epoch: Instant,
    last_alive_ms: AtomicU64,
    processed: AtomicU64,
}

impl ExecutorShared {
    fn new(id: usize, queue: usize, epoch: Instant) -> Self {
        Self {
            id,
            queue,
            idle: AtomicBool::new(false),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            epoch,
            last_alive_ms: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Wake the executor if parked in [`park`](Self::park).
    pub fn signal(&self) {
        let mut pending = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.wake_cv.notify_one();
    }

    /// Sleep up to `timeout` unless a signal is pending.
    pub fn park(&self, timeout: Duration) {
        self.idle.store(true, Ordering::Release);
        let mut pending = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            pending = self
                .wake_cv
                .wait_timeout(pending, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *pending = false;
        drop(pending);
        self.idle.store(false, Ordering::Release);
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_alive_ms.store(ms, Ordering::Release);
    }

    pub fn last_alive_ms(&self) -> u64 {
        self.last_alive_ms.load(Ordering::Acquire)
    }

    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Queue an executor is bound to. Large pools put more executors on the
/// lower queues.
pub fn bind_queue(executor_id: usize, pool_size: usize, n_queues: usize) -> usize {
    let queue = if pool_size > 15 {
        match executor_id {
            0..=2 => 0,
            3..=7 => 1,
            8..=14 => 2,
            _ => 3,
        }
    } else {
        match executor_id {
            0..=1 => 0,
            2..=3 => 1,
            4..=5 => 2,
            _ => 3,
        }
    };
    queue.min(n_queues.saturating_sub(1))
}

pub struct DispatchQueues {
    queues: Vec<DispatchQueue>,
    executors: Vec<Arc<ExecutorShared>>,
    suspend: AtomicBool,
    max_waiting: usize,
    /// Highest queue with a bound executor; selection never goes past it.
    last_served: usize,
}

impl DispatchQueues {
    pub fn new(n_queues: usize, pool_size: usize, max_waiting: usize) -> Self {
        let n_queues = n_queues.max(1);
        let epoch = Instant::now();
        let executors: Vec<_> = (0..pool_size)
            .map(|id| Arc::new(ExecutorShared::new(id, bind_queue(id, pool_size, n_queues), epoch)))
            .collect();
        let last_served = executors.iter().map(|e| e.queue).max().unwrap_or(0);
        Self {
            queues: (0..n_queues).map(|_| DispatchQueue::new()).collect(),
            executors,
            suspend: AtomicBool::new(false),
            max_waiting,
            last_served,
        }
    }

    pub fn queue(&self, index: usize) -> &DispatchQueue {
        &self.queues[index.min(self.queues.len() - 1)]
    }

    pub fn n_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn executors(&self) -> &[Arc<ExecutorShared>] {
        &self.executors
    }

    pub fn pool_size(&self) -> usize {
        self.executors.len()
    }

    /// Total items across all queues.
    pub fn backlog(&self) -> usize {
        self.queues.iter().map(DispatchQueue::len).sum()
    }

    /// Waterfall selection from `start`.
    pub fn select(&self, start: usize) -> usize {
        let last = self.last_served;
        (start.min(last)..=last)
            .find(|&i| {
                let q = &self.queues[i];
                q.len() < q.n_waiting()
            })
            .unwrap_or(last)
    }

    /// Enqueue on `index` and wake a consumer. The work item is handed back
    /// when the queue cannot grow.
    pub fn push(&self, index: usize, work: Work) -> Result<(), Work> {
        self.enqueue(index, work, |work| work)
    }

    /// Select a queue from `start` and enqueue `client` there.
    pub fn dispatch(&self, client: Box<Client>, start: usize) -> Result<usize, Box<Client>> {
        let index = self.select(start);
        self.enqueue(index, client, Work::Client)?;
        Ok(index)
    }

    fn enqueue<T>(&self, index: usize, item: T, wrap: fn(T) -> Work) -> Result<(), T> {
        let q = self.queue(index);
        {
            let mut fifo = q.fifo.lock().unwrap_or_else(PoisonError::into_inner);
            if fifo.try_reserve(1).is_err() {
                return Err(item);
            }
            fifo.push_back(wrap(item));
            q.len.fetch_add(1, Ordering::Release);
        }
        if q.n_waiting() > 0 {
            q.ready.notify_one();
        } else if let Some(executor) = self.executors.iter().find(|e| e.queue == index && e.is_idle()) {
            executor.signal();
        }
        Ok(())
    }

    /// Take one item from queue `index`, waiting up to `wait` when it is
    /// empty and fewer than the waiter cap are already parked.
    pub fn fetch(&self, index: usize, wait: Duration) -> Fetch {
        let q = self.queue(index);
        let mut fifo = q.fifo.lock().unwrap_or_else(PoisonError::into_inner);
        let mut waited = false;
        if fifo.is_empty() {
            if q.n_waiting() >= self.max_waiting {
                return Fetch::Saturated;
            }
            q.n_waiting.fetch_add(1, Ordering::AcqRel);
            fifo = q
                .ready
                .wait_timeout(fifo, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            q.n_waiting.fetch_sub(1, Ordering::AcqRel);
            waited = true;
        }
        let Some(work) = fifo.pop_front() else {
            debug_assert!(waited);
            return Fetch::Timeout;
        };
        q.len.fetch_sub(1, Ordering::Release);
        if !fifo.is_empty() && q.n_waiting() > 0 {
            q.ready.notify_one();
        }
        Fetch::Work(work)
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend.load(Ordering::Acquire)
    }

    /// Ask every executor to stop: set the flag, flood each queue with stop
    /// sentinels and wake all waiters.
    pub fn request_suspend(&self) {
        self.suspend.store(true, Ordering::Release);
        for (index, q) in self.queues.iter().enumerate() {
            for _ in 0..STOP_SENTINELS {
                if self.push(index, Work::Stop).is_err() {
                    break;
                }
            }
            q.ready.notify_all();
        }
        for executor in &self.executors {
            executor.signal();
        }
    }

    /// Empty every queue, returning the clients that were still waiting.
    pub fn drain_all(&self) -> Vec<Box<Client>> {
        let mut clients = Vec::new();
        for q in &self.queues {
            let mut fifo = q.fifo.lock().unwrap_or_else(PoisonError::into_inner);
            q.len.fetch_sub(fifo.len(), Ordering::Release);
            clients.extend(fifo.drain(..).filter_map(|work| match work {
                Work::Client(client) => Some(client),
                Work::Stop => None,
            }));
        }
        clients
    }

    pub fn processed(&self) -> Vec<u64> {
        self.executors.iter().map(|e| e.processed()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn client(id: usize) -> Box<Client> {
        Box::new(Client::new(id).unwrap())
    }

    #[test]
    fn test_bind_queue_small_and_large_pools() {
        let small: Vec<_> = (0..8).map(|id| bind_queue(id, 8, 4)).collect();
        assert_eq!(small, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        let large: Vec<_> = (0..16).map(|id| bind_queue(id, 16, 4)).collect();
        assert_eq!(large, vec![0, 0, 0, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 3]);
        assert_eq!(bind_queue(7, 8, 2), 1);
    }

    #[test]
    fn test_select_without_waiters_is_last_queue() {
        let queues = DispatchQueues::new(4, 8, 4);
        assert_eq!(queues.select(0), 3);
        assert_eq!(queues.select(9), 3);
        // Small pools leave the upper queues without executors
        let queues = DispatchQueues::new(4, 3, 4);
        assert_eq!(queues.select(0), 1);
        assert_eq!(queues.select(3), 1);
    }

    #[test]
    fn test_select_skips_backlogged_queue() {
        let queues = DispatchQueues::new(4, 8, 4);
        // Queue 0 has one waiter but two items; queue 3 has two idle waiters
        queues.queues[0].n_waiting.store(1, Ordering::Release);
        queues.queues[0].len.store(2, Ordering::Release);
        queues.queues[3].n_waiting.store(2, Ordering::Release);
        assert_eq!(queues.select(0), 3);

        queues.queues[1].n_waiting.store(1, Ordering::Release);
        assert_eq!(queues.select(0), 1);
        assert_eq!(queues.select(2), 3);
    }

    #[test]
    fn test_fetch_saturated_and_timeout() {
        let queues = DispatchQueues::new(1, 1, 0);
        assert!(matches!(queues.fetch(0, Duration::from_millis(1)), Fetch::Saturated));
        let queues = DispatchQueues::new(1, 1, 4);
        assert!(matches!(queues.fetch(0, Duration::from_millis(1)), Fetch::Timeout));
    }

    #[test]
    fn test_fifo_order_within_queue() {
        let queues = DispatchQueues::new(2, 2, 4);
        for id in 2..6 {
            queues.push(1, Work::Client(client(id))).unwrap();
        }
        assert_eq!(queues.queue(1).len(), 4);
        let mut ids = Vec::new();
        while let Fetch::Work(Work::Client(c)) = queues.fetch(1, Duration::from_millis(1)) {
            ids.push(c.id);
        }
        assert_eq!(ids, vec![2, 3, 4, 5]);
        assert_eq!(queues.queue(1).len(), 0);
    }

    #[test]
    fn test_no_client_lost_or_duplicated_across_threads() {
        let queues = Arc::new(DispatchQueues::new(4, 8, 4));
        let total = 400;
        let consumers: Vec<_> = queues
            .executors()
            .iter()
            .map(|e| {
                let queues = Arc::clone(&queues);
                let index = e.queue;
                thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match queues.fetch(index, Duration::from_millis(5)) {
                            Fetch::Work(Work::Client(c)) => got.push(c.id),
                            Fetch::Work(Work::Stop) => break,
                            Fetch::Timeout | Fetch::Saturated => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        for id in 0..total {
            queues.dispatch(client(id), id % 4).unwrap();
        }
        // Wait until everything queued was consumed
        while queues.backlog() > 0 {
            thread::yield_now();
        }
        for (i, q) in queues.queues.iter().enumerate() {
            assert_eq!(queues.queue(i).len(), q.locked_len());
        }
        queues.request_suspend();

        let mut seen = HashSet::new();
        for c in consumers {
            for id in c.join().unwrap() {
                assert!(seen.insert(id), "client {id} fetched twice");
            }
        }
        assert_eq!(seen.len(), total);
        assert!(queues.is_suspend_requested());
        assert!(queues.drain_all().is_empty());
        assert_eq!(queues.backlog(), 0);
    }

    #[test]
    fn test_push_wakes_idle_executor() {
        let queues = Arc::new(DispatchQueues::new(4, 8, 4));
        let executor = Arc::clone(&queues.executors()[6]);
        assert_eq!(executor.queue, 3);
        let parked = {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                let t0 = Instant::now();
                executor.park(Duration::from_secs(5));
                t0.elapsed()
            })
        };
        while !executor.is_idle() {
            thread::yield_now();
        }
        queues.push(3, Work::Client(client(2))).unwrap();
        assert!(parked.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_drain_all_returns_queued_clients() {
        let queues = DispatchQueues::new(4, 4, 4);
        queues.push(0, Work::Client(client(2))).unwrap();
        queues.push(3, Work::Client(client(3))).unwrap();
        queues.push(3, Work::Stop).unwrap();
        let ids: HashSet<_> = queues.drain_all().iter().map(|c| c.id).collect();
        assert_eq!(ids, HashSet::from([2, 3]));
        assert_eq!(queues.backlog(), 0);
    }
}
