// kestrel_core/src/queue.rs

//! Byte ring queue for framed hand-off between two periodic tasks.
//!
//! The queue is deliberately not a blocking primitive. Every mutating
//! operation tries to enter the exclusive section once; if another task is
//! inside, the operation reports failure immediately and the caller retries
//! on its own schedule. Bulk reads and writes are all-or-nothing: they
//! either move exactly the requested run of bytes or leave the queue
//! untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fixed-capacity circular byte buffer shared by one producer task and one
/// consumer task.
pub struct RingQueue {
    inner: Mutex<Inner>,
    /// Mirror of the fill level, readable without entering the exclusive
    /// section.
    fill: AtomicUsize,
    capacity: usize,
}

struct Inner {
    buf: Box<[u8]>,
    /// Next write index.
    head: usize,
    /// Next read index.
    tail: usize,
    used: usize,
}

impl RingQueue {
    /// Creates a queue holding at most `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                used: 0,
            }),
            fill: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Number of bytes currently queued. Never fails: the fill level is
    /// mirrored outside the exclusive section.
    pub fn len(&self) -> usize {
        self.fill.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears the queue. Runs only when uncontended; returns whether it ran.
    pub fn reset(&self) -> bool {
        let Ok(mut q) = self.inner.try_lock() else {
            return false;
        };
        q.head = 0;
        q.tail = 0;
        q.used = 0;
        self.fill.store(0, Ordering::Release);
        true
    }

    /// Appends one byte. Fails when the queue is busy or full.
    pub fn write_byte(&self, byte: u8) -> bool {
        let Ok(mut q) = self.inner.try_lock() else {
            return false;
        };
        if q.used >= q.buf.len() {
            return false;
        }
        let head = q.head;
        q.buf[head] = byte;
        q.head = (head + 1) % q.buf.len();
        q.used += 1;
        self.fill.store(q.used, Ordering::Release);
        true
    }

    /// Removes and returns the oldest byte. `None` when busy or empty.
    pub fn read_byte(&self) -> Option<u8> {
        let Ok(mut q) = self.inner.try_lock() else {
            return None;
        };
        if q.used == 0 {
            return None;
        }
        let byte = q.buf[q.tail];
        q.tail = (q.tail + 1) % q.buf.len();
        q.used -= 1;
        self.fill.store(q.used, Ordering::Release);
        Some(byte)
    }

    /// Appends the whole run or nothing. Fails when the queue is busy or
    /// the free space is smaller than `bytes`.
    pub fn write(&self, bytes: &[u8]) -> bool {
        let Ok(mut q) = self.inner.try_lock() else {
            return false;
        };
        if q.buf.len() - q.used < bytes.len() {
            return false;
        }
        q.push_run(bytes);
        self.fill.store(q.used, Ordering::Release);
        true
    }

    /// Fills `out` completely or not at all. Fails when the queue is busy
    /// or holds fewer than `out.len()` bytes.
    pub fn read(&self, out: &mut [u8]) -> bool {
        let Ok(mut q) = self.inner.try_lock() else {
            return false;
        };
        if q.used < out.len() {
            return false;
        }
        q.pop_run(out);
        self.fill.store(q.used, Ordering::Release);
        true
    }

    /// Scans the first `min(out.len(), len())` queued bytes for `delimiter`.
    /// When found at offset `i`, drains the `i` payload bytes into `out`,
    /// discards the delimiter, and returns `i`. When the delimiter is not
    /// inside the scan window, or the queue is busy, nothing is consumed
    /// and 0 is returned.
    ///
    /// A frame that starts with the delimiter consumes the delimiter and
    /// also returns 0; callers framing messages treat empty frames as
    /// keep-alives.
    pub fn read_until(&self, delimiter: u8, out: &mut [u8]) -> usize {
        let Ok(mut q) = self.inner.try_lock() else {
            return 0;
        };
        let window = out.len().min(q.used);
        let mut found_at = None;
        for i in 0..window {
            if q.buf[(q.tail + i) % q.buf.len()] == delimiter {
                found_at = Some(i);
                break;
            }
        }
        let Some(n) = found_at else {
            return 0;
        };
        q.pop_run(&mut out[..n]);
        q.skip(1); // the delimiter itself
        self.fill.store(q.used, Ordering::Release);
        n
    }
}

impl Inner {
    /// Copies `bytes` in at the head, in two segments when the run crosses
    /// the wrap point. Caller has checked the space.
    fn push_run(&mut self, bytes: &[u8]) {
        let cap = self.buf.len();
        let first = bytes.len().min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&bytes[..first]);
        self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.head = (self.head + bytes.len()) % cap;
        self.used += bytes.len();
    }

    /// Copies `out.len()` bytes out from the tail, in two segments when
    /// the run crosses the wrap point. Caller has checked the fill.
    fn pop_run(&mut self, out: &mut [u8]) {
        let cap = self.buf.len();
        let first = out.len().min(cap - self.tail);
        let rest = out.len() - first;
        out[..first].copy_from_slice(&self.buf[self.tail..self.tail + first]);
        out[first..].copy_from_slice(&self.buf[..rest]);
        self.tail = (self.tail + out.len()) % cap;
        self.used -= out.len();
    }

    /// Discards `n` bytes from the tail. Caller has checked the fill.
    fn skip(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.buf.len();
        self.used -= n;
    }
}
