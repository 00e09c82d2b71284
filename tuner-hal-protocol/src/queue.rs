//! Bounded single-producer, single-consumer byte queue shared with the device.
//!
//! The producer reserves space with [`StreamQueue::begin_write`], fills one
//! or two regions (two when the reservation wraps the end of the buffer) and
//! publishes with [`WriteTransaction::commit`]. The consumer drains with
//! [`StreamQueue::read`]. Positions are monotonically increasing counters, so
//! the whole capacity is usable.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::warn;

use crate::error::QueueError;
use crate::event_flag::{notify, EventFlag};

/// Bounded SPSC byte ring with a signal word.
pub struct StreamQueue {
    /// Backing storage. Bytes are only touched through raw pointers.
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Total bytes ever committed.
    write_total: AtomicUsize,
    /// Total bytes ever read.
    read_total: AtomicUsize,
    /// Bytes reserved by the open write transaction.
    reserved: AtomicUsize,
    writer_busy: AtomicBool,
    reader_busy: AtomicBool,
    flag: EventFlag,
}

// SAFETY: the producer only writes the free region it reserved and the
// consumer only reads the committed region; the counters are published with
// release/acquire ordering and the busy flags keep each side single-threaded.
unsafe impl Send for StreamQueue {}
unsafe impl Sync for StreamQueue {}

impl StreamQueue {
    /// Create a queue holding `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let buffer = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect::<Vec<_>>();
        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            write_total: AtomicUsize::new(0),
            read_total: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            writer_busy: AtomicBool::new(false),
            reader_busy: AtomicBool::new(false),
            flag: EventFlag::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Signal word of this queue.
    pub fn flag(&self) -> &EventFlag {
        &self.flag
    }

    /// Get the number of committed bytes not yet read.
    pub fn available_to_read(&self) -> usize {
        let write = self.write_total.load(Ordering::Acquire);
        let read = self.read_total.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Get the number of bytes a new write transaction could reserve.
    pub fn available_to_write(&self) -> usize {
        self.capacity
            .saturating_sub(self.available_to_read())
            .saturating_sub(self.reserved.load(Ordering::Acquire))
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> has the same layout as u8.
        self.buffer.as_ptr() as *mut u8
    }

    /// Reserve up to `n` bytes of free space.
    ///
    /// Returns `None` when the queue is full, `n` is zero, or another write
    /// transaction is still open.
    pub fn begin_write(&self, n: usize) -> Option<WriteTransaction<'_>> {
        if self.writer_busy.swap(true, Ordering::AcqRel) {
            warn!("[StreamQueue] begin_write while a transaction is open");
            return None;
        }
        let len = n.min(self.available_to_write());
        if len == 0 {
            self.writer_busy.store(false, Ordering::Release);
            return None;
        }
        self.reserved.store(len, Ordering::Release);
        let start = self.write_total.load(Ordering::Acquire) % self.capacity;
        Some(WriteTransaction { queue: self, start, len })
    }

    /// Copy `data` into the queue and publish it.
    ///
    /// Returns the number of bytes written (may be less than `data.len()` if the queue is full).
    pub fn write(&self, data: &[u8]) -> usize {
        let Some(mut tx) = self.begin_write(data.len()) else {
            return 0;
        };
        let (first, second) = tx.regions();
        let first_len = first.len();
        first.copy_from_slice(&data[..first_len]);
        let second_len = second.len();
        second.copy_from_slice(&data[first_len..first_len + second_len]);
        let written = first_len + second_len;
        match tx.commit(written) {
            Ok(()) => written,
            Err(_) => 0,
        }
    }

    /// Read committed bytes into `dest`.
    ///
    /// Returns the number of bytes read and raises `DATA_CONSUMED` when non-zero.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        if self.reader_busy.swap(true, Ordering::AcqRel) {
            warn!("[StreamQueue] concurrent read rejected");
            return 0;
        }
        let read = self.read_total.load(Ordering::Acquire);
        let to_read = dest.len().min(self.available_to_read());
        if to_read > 0 {
            let start = read % self.capacity;
            let first = to_read.min(self.capacity - start);
            // SAFETY: [read, read + to_read) is committed and the producer
            // never writes it until read_total moves past it.
            unsafe {
                ptr::copy_nonoverlapping(self.base().add(start), dest.as_mut_ptr(), first);
                if first < to_read {
                    ptr::copy_nonoverlapping(self.base(), dest.as_mut_ptr().add(first), to_read - first);
                }
            }
            self.read_total.store(read.wrapping_add(to_read), Ordering::Release);
        }
        self.reader_busy.store(false, Ordering::Release);
        if to_read > 0 {
            self.flag.wake(notify::DATA_CONSUMED);
        }
        to_read
    }
}

impl fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamQueue")
            .field("capacity", &self.capacity)
            .field("available_to_read", &self.available_to_read())
            .field("reserved", &self.reserved.load(Ordering::Relaxed))
            .finish()
    }
}

/// Open reservation of free queue space.
///
/// Dropping the transaction without committing releases the reservation.
pub struct WriteTransaction<'a> {
    queue: &'a StreamQueue,
    start: usize,
    len: usize,
}

impl WriteTransaction<'_> {
    /// Number of bytes reserved.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The reserved space as up to two regions; the second is empty unless the reservation wraps.
    pub fn regions(&mut self) -> (&mut [u8], &mut [u8]) {
        let capacity = self.queue.capacity;
        let first_len = self.len.min(capacity - self.start);
        let second_len = self.len - first_len;
        let base = self.queue.base();
        // SAFETY: the reservation lies in free space the consumer does not
        // read, and writer_busy guarantees a single open transaction.
        unsafe {
            (
                slice::from_raw_parts_mut(base.add(self.start), first_len),
                slice::from_raw_parts_mut(base, second_len),
            )
        }
    }

    /// Publish the first `written` bytes of the reservation and raise `DATA_READY`.
    pub fn commit(self, written: usize) -> Result<(), QueueError> {
        if written > self.len {
            return Err(QueueError::CommitOverrun { committed: written, reserved: self.len });
        }
        self.queue.write_total.fetch_add(written, Ordering::AcqRel);
        if written > 0 {
            self.queue.flag.wake(notify::DATA_READY);
        }
        Ok(())
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.queue.reserved.store(0, Ordering::Release);
        self.queue.writer_busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let queue = StreamQueue::new(1024);
        let data = [0x47u8; 188];

        assert_eq!(queue.write(&data), 188);
        assert_eq!(queue.available_to_read(), 188);
        assert_eq!(queue.available_to_write(), 1024 - 188);

        let mut out = [0u8; 188];
        assert_eq!(queue.read(&mut out), 188);
        assert_eq!(out, data);
        assert_eq!(queue.available_to_read(), 0);
    }

    #[test]
    fn test_wrap_around_regions() {
        let queue = StreamQueue::new(10);
        assert_eq!(queue.write(&[1u8; 8]), 8);
        let mut sink = [0u8; 6];
        assert_eq!(queue.read(&mut sink), 6);

        // Write position 8, read position 6: 8 free bytes wrapping the end.
        let mut tx = queue.begin_write(5).unwrap();
        let (first, second) = tx.regions();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
        first.copy_from_slice(&[2, 3]);
        second.copy_from_slice(&[4, 5, 6]);
        tx.commit(5).unwrap();

        let mut out = [0u8; 7];
        assert_eq!(queue.read(&mut out), 7);
        assert_eq!(out, [1, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_begin_write_on_full_queue() {
        let queue = StreamQueue::new(16);
        assert_eq!(queue.write(&[0u8; 16]), 16);
        assert!(queue.begin_write(1).is_none());
        assert_eq!(queue.write(&[0u8; 4]), 0);
    }

    #[test]
    fn test_grant_is_capped_by_free_space() {
        let queue = StreamQueue::new(16);
        assert_eq!(queue.write(&[0u8; 10]), 10);
        let tx = queue.begin_write(100).unwrap();
        assert_eq!(tx.len(), 6);
    }

    #[test]
    fn test_reserved_bytes_are_in_flight() {
        let queue = StreamQueue::new(64);
        assert_eq!(queue.write(&[0u8; 20]), 20);
        let tx = queue.begin_write(30).unwrap();
        assert_eq!(queue.available_to_read() + queue.available_to_write(), 64 - 30);
        assert!(queue.begin_write(1).is_none());
        drop(tx);
        assert_eq!(queue.available_to_read() + queue.available_to_write(), 64);
    }

    #[test]
    fn test_commit_overrun() {
        let queue = StreamQueue::new(8);
        let tx = queue.begin_write(4).unwrap();
        assert_eq!(
            tx.commit(5),
            Err(QueueError::CommitOverrun { committed: 5, reserved: 4 })
        );
        assert_eq!(queue.available_to_read(), 0);
    }

    #[test]
    fn test_commit_raises_data_ready() {
        let queue = StreamQueue::new(8);
        let tx = queue.begin_write(4).unwrap();
        tx.commit(4).unwrap();
        assert_ne!(queue.flag().peek() & notify::DATA_READY, 0);
    }

    #[test]
    fn test_conservation_under_interleaving() {
        let queue = StreamQueue::new(100);
        let mut sink = [0u8; 37];
        for round in 0..50 {
            queue.write(&vec![round as u8; 23]);
            assert!(queue.available_to_read() + queue.available_to_write() <= queue.capacity());
            if round % 2 == 0 {
                queue.read(&mut sink);
            }
            assert_eq!(queue.available_to_read() + queue.available_to_write(), queue.capacity());
        }
    }
}
