// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Ring-buffer consumer.
//!
//! The kernel exposes three mmap regions on a ring map fd: a writable
//! consumer-position page, a read-only producer-position page, and the
//! data region mapped twice back-to-back so wrapping records stay
//! contiguous. Records carry an 8-byte `{len, pad}` header; the busy bit
//! in `len` marks an uncommitted record and ends a drain, the discard bit
//! or a set pad low bit marks a record to skip. The consumer publishes its
//! position with release ordering only after the record is processed.

use std::{
    num::NonZeroUsize,
    os::fd::{BorrowedFd, RawFd},
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use log::debug;
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::mman::{MapFlags, ProtFlags, mmap, munmap},
};

use crate::{
    errors::BpfForgeError,
    maps::{MapHandle, MapType},
    utils,
};

const RINGBUF_BUSY_BIT: u32 = 1 << 31;
const RINGBUF_DISCARD_BIT: u32 = 1 << 30;
const RINGBUF_HDR_SIZE: u64 = 8;

/// Position pages and data pointers; split out from the mmap ownership so
/// the drain loop is testable over plain memory.
struct RawRing {
    consumer_pos: *const AtomicU64,
    producer_pos: *const AtomicU64,
    data: *const u8,
    mask: u64,
}

impl RawRing {
    fn drain(&self, handler: &mut dyn FnMut(&[u8])) -> usize {
        // SAFETY: both position pointers stay valid for the life of the
        // enclosing mapping (or test buffers) and are only written per the
        // producer/consumer protocol.
        let consumer_pos = unsafe { &*self.consumer_pos };
        let producer_pos = unsafe { &*self.producer_pos };

        let mut consumed = 0usize;
        let mut cons = consumer_pos.load(Ordering::Relaxed);
        loop {
            if cons >= producer_pos.load(Ordering::Acquire) {
                break;
            }
            let at = (cons & self.mask) as usize;
            // SAFETY: the data region is mapped at twice the ring
            // capacity, so `at..at + 8 + len` never leaves the mapping.
            let len_raw = unsafe { &*(self.data.add(at) as *const AtomicU32) }
                .load(Ordering::Acquire);
            if len_raw & RINGBUF_BUSY_BIT != 0 {
                break;
            }
            let pad = unsafe { &*(self.data.add(at + 4) as *const AtomicU32) }
                .load(Ordering::Relaxed);
            let len = (len_raw & !(RINGBUF_BUSY_BIT | RINGBUF_DISCARD_BIT)) as usize;
            let skip = len_raw & RINGBUF_DISCARD_BIT != 0 || pad & 1 != 0;
            if !skip {
                let record =
                    unsafe { std::slice::from_raw_parts(self.data.add(at + 8), len) };
                handler(record);
                consumed += 1;
            }
            cons += RINGBUF_HDR_SIZE + utils::roundup8(len) as u64;
            consumer_pos.store(cons, Ordering::Release);
        }
        consumed
    }
}

struct Mapping {
    ptr: NonNull<nix::libc::c_void>,
    len: usize,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            debug!("munmap failed: {e}");
        }
    }
}

/// Memory-mapped consumer over a ring-buffer map.
pub struct RingBuffer {
    map_fd: RawFd,
    ring: RawRing,
    _consumer_map: Mapping,
    _producer_map: Mapping,
}

// The raw pointers target the mappings this struct owns.
unsafe impl Send for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("map_fd", &self.map_fd)
            .field("capacity", &(self.ring.mask + 1))
            .finish()
    }
}

impl RingBuffer {
    /// Map the consumer side of `map`. The map must be a ring buffer; its
    /// capacity was validated as a page-aligned power of two at creation.
    pub fn new(map: &MapHandle) -> Result<Self, BpfForgeError> {
        if map.spec().map_type != MapType::RingBuf {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "{:?} is not a ring buffer",
                map.spec().map_type
            )));
        }
        let page = utils::page_size();
        let capacity = map.spec().max_entries as usize;
        let fd = unsafe { BorrowedFd::borrow_raw(map.fd()) };

        // SAFETY: lengths are non-zero and the fd is a live ring map.
        let consumer_map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(page).expect("page size is non-zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map(|ptr| Mapping { ptr, len: page })
        .map_err(|e| BpfForgeError::Error(format!("mmap of consumer page failed: {e}")))?;

        let producer_len = page + 2 * capacity;
        let producer_map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(producer_len).expect("capacity is non-zero"),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                page as nix::libc::off_t,
            )
        }
        .map(|ptr| Mapping {
            ptr,
            len: producer_len,
        })
        .map_err(|e| BpfForgeError::Error(format!("mmap of data pages failed: {e}")))?;

        let ring = RawRing {
            consumer_pos: consumer_map.ptr.as_ptr() as *const AtomicU64,
            producer_pos: producer_map.ptr.as_ptr() as *const AtomicU64,
            data: unsafe { (producer_map.ptr.as_ptr() as *const u8).add(page) },
            mask: capacity as u64 - 1,
        };

        Ok(RingBuffer {
            map_fd: map.fd(),
            ring,
            _consumer_map: consumer_map,
            _producer_map: producer_map,
        })
    }

    /// Process every committed record and return how many were handed to
    /// `handler`. Never blocks.
    pub fn drain(&mut self, handler: &mut dyn FnMut(&[u8])) -> Result<usize, BpfForgeError> {
        Ok(self.ring.drain(handler))
    }

    /// Wait up to `timeout` (forever when `None`) for records, then drain.
    /// Returns the number of records processed; zero means the deadline
    /// passed with the ring still empty.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        handler: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, BpfForgeError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let consumed = self.ring.drain(handler);
            if consumed > 0 {
                return Ok(consumed);
            }

            // Long waits are issued in bounded chunks so a deadline far in
            // the future still honors the poll timeout contract.
            let chunk_ms: PollTimeout = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(0);
                    }
                    let ms = remaining.as_millis().min(u16::MAX as u128) as u16;
                    PollTimeout::from(ms.max(1))
                }
            };

            let fd = unsafe { BorrowedFd::borrow_raw(self.map_fd) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            poll(&mut fds, chunk_ms)
                .map_err(|e| BpfForgeError::Error(format!("ring poll failed: {e}")))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A ring laid out in plain memory: one u64 consumer position, one u64
    // producer position and a double-length data buffer, exactly the shape
    // the kernel mmaps.
    struct TestRing {
        consumer: Box<AtomicU64>,
        producer: Box<AtomicU64>,
        data: Vec<u8>,
        capacity: usize,
    }

    impl TestRing {
        fn new(capacity: usize) -> Self {
            TestRing {
                consumer: Box::new(AtomicU64::new(0)),
                producer: Box::new(AtomicU64::new(0)),
                data: vec![0u8; capacity * 2],
                capacity,
            }
        }

        fn raw(&self) -> RawRing {
            RawRing {
                consumer_pos: &*self.consumer as *const AtomicU64,
                producer_pos: &*self.producer as *const AtomicU64,
                data: self.data.as_ptr(),
                mask: self.capacity as u64 - 1,
            }
        }

        // Append a record at the producer position, mirroring it into the
        // second mapping copy the way the kernel's double map would.
        fn produce(&mut self, payload: &[u8], len_bits: u32, pad: u32) {
            let prod = self.producer.load(Ordering::Relaxed);
            let at = (prod & (self.capacity as u64 - 1)) as usize;
            let len = payload.len() as u32 | len_bits;
            let mut record = Vec::new();
            record.extend_from_slice(&len.to_le_bytes());
            record.extend_from_slice(&pad.to_le_bytes());
            record.extend_from_slice(payload);
            record.resize(8 + utils::roundup8(payload.len()), 0);
            for (i, byte) in record.iter().enumerate() {
                self.data[at + i] = *byte;
                let mirror = (at + i + self.capacity) % (self.capacity * 2);
                self.data[mirror] = *byte;
            }
            self.producer
                .store(prod + record.len() as u64, Ordering::Release);
        }
    }

    #[test]
    fn test_drain_empty_ring() {
        let ring = TestRing::new(4096);
        let mut seen = Vec::new();
        let raw = ring.raw();
        assert_eq!(raw.drain(&mut |r| seen.push(r.to_vec())), 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_drain_delivers_records_in_order() {
        let mut ring = TestRing::new(4096);
        ring.produce(b"first", 0, 0);
        ring.produce(b"second!", 0, 0);
        let raw = ring.raw();

        let mut seen = Vec::new();
        assert_eq!(raw.drain(&mut |r| seen.push(r.to_vec())), 2);
        assert_eq!(seen, vec![b"first".to_vec(), b"second!".to_vec()]);
        assert_eq!(
            ring.consumer.load(Ordering::Relaxed),
            ring.producer.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_busy_record_stops_the_drain() {
        let mut ring = TestRing::new(4096);
        ring.produce(b"ready", 0, 0);
        ring.produce(b"writing", RINGBUF_BUSY_BIT, 0);
        let raw = ring.raw();

        let mut seen = Vec::new();
        assert_eq!(raw.drain(&mut |r| seen.push(r.to_vec())), 1);
        assert_eq!(seen, vec![b"ready".to_vec()]);
        // The consumer stops before the uncommitted record.
        assert!(ring.consumer.load(Ordering::Relaxed) < ring.producer.load(Ordering::Relaxed));
    }

    #[test]
    fn test_discard_and_padding_records_are_skipped() {
        let mut ring = TestRing::new(4096);
        ring.produce(b"drop me", RINGBUF_DISCARD_BIT, 0);
        ring.produce(b"pad", 0, 1);
        ring.produce(b"keep", 0, 0);
        let raw = ring.raw();

        let mut seen = Vec::new();
        assert_eq!(raw.drain(&mut |r| seen.push(r.to_vec())), 1);
        assert_eq!(seen, vec![b"keep".to_vec()]);
        // Skipped records still advance the consumer position.
        assert_eq!(
            ring.consumer.load(Ordering::Relaxed),
            ring.producer.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_records_wrap_through_double_mapping() {
        let capacity = 64;
        let mut ring = TestRing::new(capacity);
        // Fill most of the ring, consume it, then wrap.
        ring.produce(&[0xaa; 40], 0, 0);
        let raw = ring.raw();
        assert_eq!(raw.drain(&mut |_| {}), 1);

        ring.produce(&[0xbb; 30], 0, 0);
        let raw = ring.raw();
        let mut seen = Vec::new();
        assert_eq!(raw.drain(&mut |r| seen.push(r.to_vec())), 1);
        assert_eq!(seen, vec![vec![0xbb; 30]]);
    }
}
