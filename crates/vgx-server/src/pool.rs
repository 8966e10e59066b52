// src/pool.rs
//! Fixed connection pool with an intrusive list of active clients.
//!
//! Slot `id` always holds the client whose `id` field is `id`. A client is
//! "taken" while an executor or the matrix owns it; its slot keeps the
//! socket and cannot be reused until the client is restored. Slots 0 and 1
//! never carry a connection; slot 0 builds rejection responses.

use crate::client::{Client, ClientState};
use crate::config::RESERVED_CLIENT_SLOTS;
use crate::http::{HttpStatus, MediaType, Method};
use crate::response::SEND_CHUNK_ORDER;
use crate::syscalls::Socket;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

const REJECT_SLOT: usize = 0;

#[derive(Default)]
struct Slot {
    socket: Option<Socket>,
    /// Allocated lazily and kept across connections.
    client: Option<Box<Client>>,
    in_use: bool,
    in_flight: bool,
    linked: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct ClientPool {
    slots: Box<[Slot]>,
    head: Option<usize>,
    tail: Option<usize>,
    n_active: usize,
    n_connected: usize,
}

impl ClientPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(RESERVED_CLIENT_SLOTS + 1);
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::default()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: None,
            tail: None,
            n_active: 0,
            n_connected: 0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Connected clients, including those owned by executors.
    #[inline(always)]
    pub fn connected(&self) -> usize {
        self.n_connected
    }

    /// Clients on the active list.
    #[inline(always)]
    pub fn active(&self) -> usize {
        self.n_active
    }

    /// Install an accepted socket. Reclaims the longest-idle fully responded
    /// connection when every slot is busy. The socket is handed back when
    /// no slot is available.
    pub fn register(
        &mut self,
        socket: Socket,
        peer: Option<SocketAddr>,
        idle_reclaim: Duration,
    ) -> Result<usize, Socket> {
        let now = Instant::now();
        let id = match self.free_slot().or_else(|| self.reclaim(now, idle_reclaim)) {
            Some(id) => id,
            None => return Err(socket),
        };

        let slot = &mut self.slots[id];
        let mut client = match slot.client.take() {
            Some(client) => client,
            None => match Client::new(id) {
                Ok(client) => Box::new(client),
                Err(e) => {
                    tracing::error!(client = id, error = %e, "client allocation failed");
                    return Err(socket);
                }
            },
        };
        client.reset_exchange();
        client.request.stream.clear();
        client.ident = None;
        client.yielded = false;
        client.peer = peer;
        client.io_t0 = now;

        slot.client = Some(client);
        slot.socket = Some(socket);
        slot.in_use = true;
        slot.in_flight = false;
        self.n_connected += 1;
        self.append(id);
        Ok(id)
    }

    fn free_slot(&self) -> Option<usize> {
        (RESERVED_CLIENT_SLOTS..self.slots.len()).find(|&id| {
            let slot = &self.slots[id];
            !slot.in_use && !slot.in_flight
        })
    }

    fn reclaim(&mut self, now: Instant, idle_reclaim: Duration) -> Option<usize> {
        let id = (RESERVED_CLIENT_SLOTS..self.slots.len())
            .filter_map(|id| {
                let slot = &self.slots[id];
                let client = slot.client.as_deref()?;
                let idle = now.saturating_duration_since(client.io_t0);
                let eligible = slot.in_use
                    && !slot.in_flight
                    && client.state == ClientState::ResponseComplete
                    && !client.has_output()
                    && idle > idle_reclaim;
                eligible.then_some((id, idle))
            })
            .max_by_key(|&(_, idle)| idle)
            .map(|(id, _)| id)?;
        let peer = self.slots[id].client.as_ref().and_then(|c| c.peer);
        tracing::warn!(client = id, ?peer, "reclaiming idle connection");
        self.close(id);
        Some(id)
    }

    /// Disconnect `id`. A taken client is discarded when it returns.
    pub fn close(&mut self, id: usize) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        if !slot.in_use {
            return false;
        }
        slot.socket = None;
        slot.in_use = false;
        if let Some(client) = slot.client.as_deref_mut() {
            client.state = ClientState::Reset;
            client.response.reset();
            client.response.trim((1 << SEND_CHUNK_ORDER) - 1);
            client.request.stream.clear();
            client.request.reset();
            client.request.trim();
        }
        self.n_connected -= 1;
        self.yank(id);
        true
    }

    #[inline(always)]
    pub fn is_connected(&self, id: usize) -> bool {
        self.slots.get(id).is_some_and(|s| s.in_use)
    }

    #[inline(always)]
    pub fn is_in_flight(&self, id: usize) -> bool {
        self.slots.get(id).is_some_and(|s| s.in_flight)
    }

    pub fn fd(&self, id: usize) -> Option<RawFd> {
        self.slots.get(id)?.socket.as_ref().map(Socket::fd)
    }

    pub fn client(&self, id: usize) -> Option<&Client> {
        let slot = self.slots.get(id)?;
        if !slot.in_use {
            return None;
        }
        slot.client.as_deref()
    }

    pub fn client_mut(&mut self, id: usize) -> Option<&mut Client> {
        let slot = self.slots.get_mut(id)?;
        if !slot.in_use {
            return None;
        }
        slot.client.as_deref_mut()
    }

    /// Socket and client of a connected, not taken, slot.
    pub fn split_mut(&mut self, id: usize) -> Option<(&Socket, &mut Client)> {
        let slot = self.slots.get_mut(id)?;
        if !slot.in_use {
            return None;
        }
        Some((slot.socket.as_ref()?, slot.client.as_deref_mut()?))
    }

    /// Take ownership of a client for dispatch. It leaves the active list.
    pub fn take(&mut self, id: usize) -> Option<Box<Client>> {
        let slot = self.slots.get_mut(id)?;
        if !slot.in_use || slot.in_flight {
            return None;
        }
        let client = slot.client.take()?;
        slot.in_flight = true;
        self.yank(id);
        Some(client)
    }

    /// Return a taken client. Returns false when its connection was closed
    /// meanwhile; the client is kept for reuse but is no longer active.
    pub fn restore(&mut self, mut client: Box<Client>) -> bool {
        let id = client.id;
        let Some(slot) = self.slots.get_mut(id) else {
            tracing::error!(client = id, "restored client has no slot");
            return false;
        };
        slot.in_flight = false;
        if !slot.in_use {
            client.state = ClientState::Reset;
            client.response.reset();
            client.request.reset();
            client.request.stream.clear();
            slot.client = Some(client);
            return false;
        }
        slot.client = Some(client);
        self.append(id);
        true
    }

    /// Append to the tail of the active list.
    pub fn append(&mut self, id: usize) {
        if self.slots[id].linked {
            return;
        }
        let tail = self.tail;
        {
            let slot = &mut self.slots[id];
            slot.linked = true;
            slot.prev = tail;
            slot.next = None;
        }
        match tail {
            Some(t) => self.slots[t].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.n_active += 1;
    }

    /// Unlink from the active list.
    pub fn yank(&mut self, id: usize) {
        if !self.slots[id].linked {
            return;
        }
        let (prev, next) = {
            let slot = &mut self.slots[id];
            slot.linked = false;
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.n_active -= 1;
    }

    /// Active client ids in list order.
    pub fn active_ids(&self) -> ActiveIds<'_> {
        ActiveIds { pool: self, cursor: self.head }
    }

    /// Every connected slot, taken or not.
    pub fn connected_ids(&self) -> Vec<usize> {
        (RESERVED_CLIENT_SLOTS..self.slots.len())
            .filter(|&id| self.slots[id].in_use)
            .collect()
    }

    /// Serialize a rejection response using the reserved slot.
    pub fn reject_response(&mut self, status: HttpStatus, message: &str) -> Vec<u8> {
        let slot = &mut self.slots[REJECT_SLOT];
        if slot.client.is_none() {
            match Client::new(REJECT_SLOT) {
                Ok(client) => slot.client = Some(Box::new(client)),
                Err(_) => return Vec::new(),
            }
        }
        let Some(client) = slot.client.as_deref_mut() else {
            return Vec::new();
        };
        client.response.reset();
        client.response.mediatype = MediaType::Text;
        if client.response.produce_error(status, Some(message), Method::None).is_err() {
            return Vec::new();
        }
        client.response.set_backlog(0);
        let mut bytes = client.response.stream.to_vec();
        bytes.extend_from_slice(&client.response.content.to_vec());
        client.response.reset();
        bytes
    }
}

pub struct ActiveIds<'a> {
    pool: &'a ClientPool,
    cursor: Option<usize>,
}

impl Iterator for ActiveIds<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let id = self.cursor?;
        self.cursor = self.pool.slots[id].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{REQUEST_CONTENT_ORDER, REQUEST_STREAM_ORDER};
    use crate::syscalls::create_listen_socket;

    fn socket() -> Socket {
        // Any open descriptor works as a stand-in connection
        create_listen_socket(&"127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_register_skips_reserved_slots() {
        let mut pool = ClientPool::new(16);
        let a = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let b = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        assert_eq!((a, b), (2, 3));
        assert_eq!(pool.connected(), 2);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(pool.client(2).unwrap().state, ClientState::Ready);
        assert_eq!(pool.client(2).unwrap().id, 2);
    }

    #[test]
    fn test_close_frees_slot_for_reuse() {
        let mut pool = ClientPool::new(16);
        let a = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        pool.client_mut(a).unwrap().request.stream.write(b"leftover").unwrap();
        assert!(pool.close(a));
        assert!(!pool.close(a));
        assert_eq!(pool.connected(), 0);
        assert_eq!(pool.active(), 0);
        let b = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        assert_eq!(a, b);
        assert!(pool.client(b).unwrap().request.stream.is_empty());
    }

    #[test]
    fn test_close_shrinks_grown_buffers() {
        let mut pool = ClientPool::new(16);
        let id = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let big = vec![b'x'; 1 << 18];
        {
            let client = pool.client_mut(id).unwrap();
            client.request.stream.write(&big).unwrap();
            client.request.content.write(&big).unwrap();
            client.response.content.write(&big).unwrap();
            assert!(client.request.stream.order() > REQUEST_STREAM_ORDER);
        }
        assert!(pool.close(id));

        let id = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let client = pool.client(id).unwrap();
        assert_eq!(client.request.stream.order(), REQUEST_STREAM_ORDER);
        assert_eq!(client.request.content.order(), REQUEST_CONTENT_ORDER);
        assert_eq!(client.response.content.order(), SEND_CHUNK_ORDER);
        assert!(client.request.content.is_empty());
    }

    #[test]
    fn test_exhausted_pool_hands_socket_back() {
        let mut pool = ClientPool::new(4);
        pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        assert!(pool.register(socket(), None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_reclaims_idle_completed_connection() {
        let mut pool = ClientPool::new(4);
        let a = pool.register(socket(), None, Duration::ZERO).unwrap();
        let b = pool.register(socket(), None, Duration::ZERO).unwrap();
        pool.client_mut(b).unwrap().state = ClientState::ExpectHeaders;
        // Only a fully responded connection may be reclaimed
        assert!(pool.register(socket(), None, Duration::from_secs(60)).is_err());
        pool.client_mut(a).unwrap().state = ClientState::ResponseComplete;
        std::thread::sleep(Duration::from_millis(2));
        let c = pool.register(socket(), None, Duration::from_millis(1)).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.connected(), 2);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_take_and_restore() {
        let mut pool = ClientPool::new(16);
        let a = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let b = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let client = pool.take(a).unwrap();
        assert!(pool.take(a).is_none());
        assert!(pool.split_mut(a).is_none());
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![b]);
        assert!(pool.restore(client));
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![b, a]);
        assert!(pool.split_mut(a).is_some());
    }

    #[test]
    fn test_closed_while_taken_is_not_reused_until_restored() {
        let mut pool = ClientPool::new(3);
        let a = pool.register(socket(), None, Duration::from_secs(5)).unwrap();
        let client = pool.take(a).unwrap();
        assert!(pool.close(a));
        assert!(pool.register(socket(), None, Duration::from_secs(5)).is_err());
        assert!(!pool.restore(client));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.register(socket(), None, Duration::from_secs(5)).unwrap(), a);
    }

    #[test]
    fn test_yank_middle_of_list() {
        let mut pool = ClientPool::new(16);
        let ids: Vec<_> = (0..4)
            .map(|_| pool.register(socket(), None, Duration::from_secs(5)).unwrap())
            .collect();
        pool.yank(ids[1]);
        pool.yank(ids[3]);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        pool.append(ids[1]);
        pool.append(ids[1]);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![ids[0], ids[2], ids[1]]);
        assert_eq!(pool.active(), 3);
    }

    #[test]
    fn test_reject_response() {
        let mut pool = ClientPool::new(16);
        let bytes = pool.reject_response(HttpStatus::TOO_MANY_REQUESTS, "Too many clients");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("X-Vgx-Backlog: 0000\r\n"));
        assert!(text.ends_with("\r\n\r\n429 Too many clients"));
    }
}
