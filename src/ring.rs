// Ring Module - Lock-free SPSC byte ring buffer backing the audio data plane

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use memmap2::MmapMut;

/// Number of cursor words stored at the head of the buffer region.
/// Word 0 is the read cursor, word 1 the write cursor.
const CURSOR_WORDS: usize = 2;

const WORD: usize = std::mem::size_of::<usize>();
const HEADER_BYTES: usize = CURSOR_WORDS * WORD;

/// Storage for one ring buffer: a cursor header followed by the byte arena.
///
/// The heap variant allocates the region as `AtomicUsize` words so the cursor
/// header is properly aligned; the shared variant is an anonymous memory map
/// (page-aligned), which allows the producer and consumer halves to live in
/// separate processes. In both cases the cursor words live inside the region
/// itself, so the layout is identical regardless of backing.
enum Backing {
    Heap(#[allow(dead_code)] Box<[AtomicUsize]>),
    Shared(#[allow(dead_code)] MmapMut),
}

struct RingShared {
    backing: Backing,
    base: *mut u8,
    capacity: usize,
}

// The region is only ever touched through the cursor protocol below: the
// producer writes bytes the consumer has not yet been granted, and cursor
// updates use release/acquire ordering. One Producer and one Consumer handle
// exist per buffer, each usable from a single thread.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn read_cursor(&self) -> &AtomicUsize {
        unsafe { &*(self.base as *const AtomicUsize) }
    }

    fn write_cursor(&self) -> &AtomicUsize {
        unsafe { &*(self.base as *const AtomicUsize).add(1) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_BYTES) }
    }

    /// Committed-unread byte count. Cursors advance modulo `2 * capacity`, so
    /// the distance is unambiguous for any fill level from empty to full.
    fn distance(&self, read: usize, write: usize) -> usize {
        (write + 2 * self.capacity - read) % (2 * self.capacity)
    }

    fn advance(&self, cursor: usize, by: usize) -> usize {
        (cursor + by) % (2 * self.capacity)
    }
}

/// A fixed-capacity single-producer / single-consumer byte queue.
///
/// Constructors return the two halves already split, which is what makes the
/// one-producer / one-consumer contract hold in the type system: writing
/// requires `&mut Producer`, reading requires `&mut Consumer`, and neither
/// half can be cloned.
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring buffer with process-private (heap) backing.
    pub fn with_capacity(capacity: usize) -> (Producer, Consumer) {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let words = CURSOR_WORDS + capacity.div_ceil(WORD);
        let mut storage: Box<[AtomicUsize]> =
            (0..words).map(|_| AtomicUsize::new(0)).collect();
        let base = storage.as_mut_ptr() as *mut u8;
        let shared = Arc::new(RingShared {
            backing: Backing::Heap(storage),
            base,
            capacity,
        });
        split(shared)
    }

    /// Create a ring buffer backed by an anonymous shared memory mapping.
    ///
    /// The cursor words live at the head of the mapping, so a producer and
    /// consumer in separate processes observe the same cursors.
    pub fn shared(capacity: usize) -> Result<(Producer, Consumer)> {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let mut map = MmapMut::map_anon(HEADER_BYTES + capacity)
            .context("failed to map shared memory for ring buffer")?;
        let base = map.as_mut_ptr();
        // A fresh anonymous mapping is zeroed, so both cursors start at 0.
        let shared = Arc::new(RingShared {
            backing: Backing::Shared(map),
            base,
            capacity,
        });
        Ok(split(shared))
    }
}

fn split(shared: Arc<RingShared>) -> (Producer, Consumer) {
    (
        Producer {
            ring: Arc::clone(&shared),
            last_acquire: 0,
        },
        Consumer {
            ring: shared,
            last_acquire: 0,
        },
    )
}

/// The writing half of a ring buffer.
pub struct Producer {
    ring: Arc<RingShared>,
    last_acquire: usize,
}

impl Producer {
    /// Acquire a contiguous writable region of at most `max` bytes.
    ///
    /// Returns an empty slice when the buffer is full. If the free space
    /// straddles the wrap boundary, only the prefix up to the boundary is
    /// returned; a following acquire yields the remainder. Never blocks.
    pub fn acquire_write(&mut self, max: usize) -> &mut [u8] {
        let write = self.ring.write_cursor().load(Ordering::Relaxed);
        let read = self.ring.read_cursor().load(Ordering::Acquire);
        let free = self.ring.capacity - self.ring.distance(read, write);
        let offset = write % self.ring.capacity;
        let contiguous = free.min(self.ring.capacity - offset).min(max);
        self.last_acquire = contiguous;
        unsafe {
            std::slice::from_raw_parts_mut(self.ring.data_ptr().add(offset), contiguous)
        }
    }

    /// Publish `n` bytes of the last acquired region to the consumer.
    pub fn commit_write(&mut self, n: usize) {
        debug_assert!(n <= self.last_acquire, "commit exceeds acquired region");
        let write = self.ring.write_cursor().load(Ordering::Relaxed);
        self.ring
            .write_cursor()
            .store(self.ring.advance(write, n), Ordering::Release);
        self.last_acquire = 0;
    }

    /// Advance the write cursor by up to `n` bytes without writing.
    pub fn seek_write(&mut self, n: usize) {
        let write = self.ring.write_cursor().load(Ordering::Relaxed);
        let read = self.ring.read_cursor().load(Ordering::Acquire);
        let free = self.ring.capacity - self.ring.distance(read, write);
        self.ring
            .write_cursor()
            .store(self.ring.advance(write, n.min(free)), Ordering::Release);
        self.last_acquire = 0;
    }

    /// Signed committed-unread byte count.
    pub fn pointer_distance(&self) -> i32 {
        let read = self.ring.read_cursor().load(Ordering::Acquire);
        let write = self.ring.write_cursor().load(Ordering::Relaxed);
        self.ring.distance(read, write) as i32
    }

    /// Total byte capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

/// The reading half of a ring buffer.
pub struct Consumer {
    ring: Arc<RingShared>,
    last_acquire: usize,
}

impl Consumer {
    /// Acquire a contiguous readable region of at most `max` bytes.
    ///
    /// Returns an empty slice when no data is committed. If the readable
    /// bytes straddle the wrap boundary, only the prefix up to the boundary
    /// is returned; a following acquire yields the remainder. Never blocks.
    pub fn acquire_read(&mut self, max: usize) -> &[u8] {
        let read = self.ring.read_cursor().load(Ordering::Relaxed);
        let write = self.ring.write_cursor().load(Ordering::Acquire);
        let available = self.ring.distance(read, write);
        let offset = read % self.ring.capacity;
        let contiguous = available.min(self.ring.capacity - offset).min(max);
        self.last_acquire = contiguous;
        unsafe { std::slice::from_raw_parts(self.ring.data_ptr().add(offset), contiguous) }
    }

    /// Release `n` bytes of the last acquired region back to the producer.
    pub fn commit_read(&mut self, n: usize) {
        debug_assert!(n <= self.last_acquire, "commit exceeds acquired region");
        let read = self.ring.read_cursor().load(Ordering::Relaxed);
        self.ring
            .read_cursor()
            .store(self.ring.advance(read, n), Ordering::Release);
        self.last_acquire = 0;
    }

    /// Advance the read cursor by up to `n` bytes without reading, discarding
    /// stale data.
    pub fn seek_read(&mut self, n: usize) {
        let read = self.ring.read_cursor().load(Ordering::Relaxed);
        let write = self.ring.write_cursor().load(Ordering::Acquire);
        let available = self.ring.distance(read, write);
        self.ring
            .read_cursor()
            .store(self.ring.advance(read, n.min(available)), Ordering::Release);
        self.last_acquire = 0;
    }

    /// Signed committed-unread byte count.
    pub fn pointer_distance(&self) -> i32 {
        let read = self.ring.read_cursor().load(Ordering::Relaxed);
        let write = self.ring.write_cursor().load(Ordering::Acquire);
        self.ring.distance(read, write) as i32
    }

    /// Total byte capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}
