// src/buffer.rs
//! Growable ring buffer used for all socket I/O.
//!
//! A `StreamBuffer` owns a power-of-two allocation with independent read
//! (`rp`) and write (`wp`) cursors. One byte is always left unused so that
//! `rp == wp` unambiguously means empty, which makes the usable capacity one
//! less than the allocation.
//!
//! Sockets read and write the buffer in place through linear segments:
//! [`StreamBuffer::writable_segment`] + [`StreamBuffer::advance_write`] for
//! `recv()`, and [`StreamBuffer::readable_segment`] +
//! [`StreamBuffer::advance_read`] for `send()`.

use memchr::memchr;
use thiserror::Error;

/// Largest allocation order accepted by [`StreamBuffer::new`] and resizing.
pub const MAX_ORDER: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("stream buffer allocation failed")]
    Alloc,
    #[error("cursor advanced past available bytes")]
    Overrun,
    #[error("destination too small for line")]
    DestinationTooSmall,
    #[error("invalid buffer order {0}")]
    Order(u32),
}

pub struct StreamBuffer {
    data: Box<[u8]>,
    order: u32,
    rp: usize,
    wp: usize,
}

fn allocate(order: u32) -> Result<Box<[u8]>, BufferError> {
    if order == 0 || order > MAX_ORDER {
        return Err(BufferError::Order(order));
    }
    let len = 1usize << order;
    let mut raw = Vec::new();
    raw.try_reserve_exact(len).map_err(|_| BufferError::Alloc)?;
    raw.resize(len, 0);
    Ok(raw.into_boxed_slice())
}

impl StreamBuffer {
    /// Allocate `2^order` bytes with both cursors at the start.
    pub fn new(order: u32) -> Result<Self, BufferError> {
        Ok(Self {
            data: allocate(order)?,
            order,
            rp: 0,
            wp: 0,
        })
    }

    #[inline(always)]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Usable bytes: allocation size minus the sacrificed byte.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        if self.wp >= self.rp {
            self.wp - self.rp
        } else {
            self.data.len() - self.rp + self.wp
        }
    }

    #[inline(always)]
    pub fn writable(&self) -> usize {
        self.capacity() - self.size()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    #[inline(always)]
    pub fn is_readable(&self) -> bool {
        self.rp != self.wp
    }

    /// True when all readable bytes sit in one contiguous run.
    #[inline(always)]
    pub fn is_single_segment(&self) -> bool {
        self.rp <= self.wp
    }

    /// Readable bytes as one slice, only when the content does not wrap.
    pub fn as_single_segment(&self) -> Option<&[u8]> {
        if self.is_single_segment() {
            Some(&self.data[self.rp..self.wp])
        } else {
            None
        }
    }

    fn readable_parts(&self) -> (&[u8], &[u8]) {
        if self.wp >= self.rp {
            (&self.data[self.rp..self.wp], &[])
        } else {
            (&self.data[self.rp..], &self.data[..self.wp])
        }
    }

    /// Reallocate to `2^order` bytes, preserving content and its order.
    fn resize(&mut self, order: u32) -> Result<(), BufferError> {
        let size = self.size();
        if order > MAX_ORDER || (1usize << order) <= size {
            return Err(BufferError::Order(order));
        }
        let mut data = allocate(order)?;
        let (head, tail) = self.readable_parts();
        data[..head.len()].copy_from_slice(head);
        data[head.len()..size].copy_from_slice(tail);
        tracing::trace!(from = self.data.len(), to = data.len(), "stream buffer resized");
        self.data = data;
        self.order = order;
        self.rp = 0;
        self.wp = size;
        Ok(())
    }

    /// Grow so that `deficit` more bytes fit beyond the current capacity.
    fn resize_to_fit(&mut self, deficit: usize) -> Result<(), BufferError> {
        let needed = self.capacity() + deficit + 1;
        let order = needed.next_power_of_two().trailing_zeros();
        self.resize(order)
    }

    fn ensure_writable(&mut self, n: usize) -> Result<(), BufferError> {
        let writable = self.writable();
        if n > writable {
            self.resize_to_fit(n - writable)?;
        }
        Ok(())
    }

    /// Shrink an oversized idle buffer back toward `max` bytes.
    ///
    /// Returns `true` when the allocation was reduced.
    pub fn trim(&mut self, max: usize) -> Result<bool, BufferError> {
        if max == 0 || self.capacity() <= max || self.size() >= max {
            return Ok(false);
        }
        let order = usize::BITS - max.leading_zeros();
        if order >= self.order {
            return Ok(false);
        }
        self.resize(order)?;
        Ok(true)
    }

    /// Append `data`, growing as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        self.ensure_writable(data.len())?;
        let mut src = data;
        while !src.is_empty() {
            let segment = self.writable_segment(src.len());
            let n = segment.len();
            segment.copy_from_slice(&src[..n]);
            self.advance_write(n)?;
            src = &src[n..];
        }
        Ok(data.len())
    }

    fn writable_segment_len(&self) -> usize {
        if self.wp < self.rp {
            self.rp - self.wp - 1
        } else {
            let n = self.data.len() - self.wp;
            if self.rp == 0 { n - 1 } else { n }
        }
    }

    /// Longest contiguous writable run starting at `wp`, at most `max` bytes.
    pub fn writable_segment(&mut self, max: usize) -> &mut [u8] {
        let n = self.writable_segment_len().min(max);
        &mut self.data[self.wp..self.wp + n]
    }

    /// Like [`writable_segment`](Self::writable_segment) but first grows so the
    /// whole buffer can take `min` more bytes. The returned run may be shorter
    /// than `min` when the free space wraps, but is never empty.
    pub fn writable_segment_ex(&mut self, min: usize) -> Result<&mut [u8], BufferError> {
        self.ensure_writable(min.max(1))?;
        let n = self.writable_segment_len();
        if n == 0 {
            return Err(BufferError::Alloc);
        }
        Ok(&mut self.data[self.wp..self.wp + n])
    }

    /// Commit `n` bytes placed into the writable segment by someone else.
    pub fn advance_write(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.writable() {
            return Err(BufferError::Overrun);
        }
        if self.wp >= self.rp {
            let end = self.data.len() - self.wp;
            if n >= end {
                self.wp = n - end;
                return Ok(n);
            }
        }
        self.wp += n;
        Ok(n)
    }

    /// Longest contiguous readable run starting at `rp`, at most `max` bytes.
    pub fn readable_segment(&self, max: usize) -> &[u8] {
        let n = if self.is_single_segment() {
            self.wp - self.rp
        } else {
            self.data.len() - self.rp
        };
        &self.data[self.rp..self.rp + n.min(max)]
    }

    /// Consume `n` readable bytes.
    pub fn advance_read(&mut self, n: usize) -> Result<usize, BufferError> {
        if n > self.size() {
            return Err(BufferError::Overrun);
        }
        if self.rp > self.wp {
            let end = self.data.len() - self.rp;
            if n >= end {
                self.rp = n - end;
                return Ok(n);
            }
        }
        self.rp += n;
        Ok(n)
    }

    /// Copy out one line terminated by `probe`, scanning at most `max - 1`
    /// bytes. Returns `Ok(0)` and leaves the cursor alone when no terminator
    /// is buffered yet.
    pub fn read_until(&mut self, dest: &mut [u8], max: usize, probe: u8) -> Result<usize, BufferError> {
        let limit = max.saturating_sub(1).min(self.size());
        let (head, tail) = self.readable_parts();
        let head = &head[..head.len().min(limit)];
        let tail = &tail[..tail.len().min(limit - head.len())];
        let count = match memchr(probe, head) {
            Some(i) => i + 1,
            None => match memchr(probe, tail) {
                Some(i) => head.len() + i + 1,
                None => return Ok(0),
            },
        };
        if count > dest.len() {
            return Err(BufferError::DestinationTooSmall);
        }
        let first = count.min(head.len());
        dest[..first].copy_from_slice(&head[..first]);
        dest[first..count].copy_from_slice(&tail[..count - first]);
        self.advance_read(count)?;
        Ok(count)
    }

    /// Consume up to `dest.len()` bytes into `dest`.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.size());
        let (head, tail) = self.readable_parts();
        let first = n.min(head.len());
        dest[..first].copy_from_slice(&head[..first]);
        dest[first..n].copy_from_slice(&tail[..n - first]);
        let consumed = self.advance_read(n);
        debug_assert!(consumed.is_ok(), "n never exceeds size()");
        n
    }

    /// Append all readable bytes of `src` without consuming them.
    pub fn copy_from(&mut self, src: &StreamBuffer) -> Result<usize, BufferError> {
        let n = src.size();
        self.ensure_writable(n)?;
        let (head, tail) = src.readable_parts();
        self.write(head)?;
        self.write(tail)?;
        Ok(n)
    }

    /// Move up to `max` bytes from `src` into `self`. An emptied source gets
    /// its cursors reset.
    pub fn absorb(&mut self, src: &mut StreamBuffer, max: usize) -> Result<usize, BufferError> {
        let n = src.size().min(max);
        self.ensure_writable(n)?;
        let (head, tail) = src.readable_parts();
        let first = n.min(head.len());
        self.write(&head[..first])?;
        self.write(&tail[..n - first])?;
        src.advance_read(n)?;
        if src.is_empty() {
            src.clear();
        }
        Ok(n)
    }

    /// Overwrite already-buffered bytes at `offset` from the read cursor.
    pub fn overwrite(&mut self, offset: usize, bytes: &[u8]) -> bool {
        if offset + bytes.len() > self.size() {
            return false;
        }
        let mask = self.data.len() - 1;
        for (i, b) in bytes.iter().enumerate() {
            self.data[(self.rp + offset + i) & mask] = *b;
        }
        true
    }

    #[inline(always)]
    pub fn swap(&mut self, other: &mut StreamBuffer) {
        std::mem::swap(self, other);
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.rp = 0;
        self.wp = 0;
    }

    /// Readable bytes copied into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let (head, tail) = self.readable_parts();
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("order", &self.order)
            .field("rp", &self.rp)
            .field("wp", &self.wp)
            .field("size", &self.size())
            .finish()
    }
}
