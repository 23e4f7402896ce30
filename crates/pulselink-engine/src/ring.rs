//! Lock-free SPSC ring buffers between the device adapter and the DSP
//! pipelines.
//!
//! One producer (the adapter decode task) and one consumer (a pipeline
//! task) per sensor. The ring overwrites the oldest samples when full;
//! the consumer takes contiguous snapshots and accounts for everything
//! lost to overwrite, so `emitted + dropped == total pushes` holds over
//! the consumer's lifetime.
//!
//! Each slot carries a sequence tag published after the value write.
//! A snapshot validates the tag before and after copying the slot, so a
//! slot overwritten mid-read is discarded and counted as dropped rather
//! than returned torn.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot<T> {
    /// 0 while a write is in flight, `index + 1` once slot `index` is
    /// published.
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity single-producer single-consumer overwrite ring.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    capacity: u64,
    /// Total values pushed since construction.
    head: AtomicU64,
    /// Total values lost to overwrite, accounted at snapshot time.
    dropped: AtomicU64,
}

#[allow(unsafe_code)]
unsafe impl<T: Copy + Send> Send for RingBuffer<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Copy + Send> Sync for RingBuffer<T> {}

impl<T: Copy> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity: capacity as u64,
            head: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Total values pushed so far.
    pub fn pushes(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Total values lost to overwrite so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    #[allow(unsafe_code)]
    fn push(&self, value: T) {
        let head = self.head.load(Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let slot = &self.slots[(head % self.capacity) as usize];
        slot.seq.store(0, Ordering::Release);
        // Safety: single producer; the consumer never dereferences a
        // slot whose tag is 0.
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.seq.store(head + 1, Ordering::Release);
        self.head.store(head + 1, Ordering::Release);
    }

    /// Copy every value published since `cursor`, oldest first.
    ///
    /// Returns the snapshot, the new cursor, and how many values between
    /// `cursor` and the snapshot were lost to overwrite. The snapshot is
    /// at most `capacity` long.
    #[allow(unsafe_code)]
    fn snapshot_since(&self, cursor: u64) -> (Vec<T>, u64, u64) {
        let head = self.head.load(Ordering::Acquire);
        let start = cursor.max(head.saturating_sub(self.capacity));
        let mut lost = start - cursor;
        #[allow(clippy::cast_possible_truncation)]
        let mut out = Vec::with_capacity((head - start) as usize);
        for idx in start..head {
            #[allow(clippy::cast_possible_truncation)]
            let slot = &self.slots[(idx % self.capacity) as usize];
            let seq_before = slot.seq.load(Ordering::Acquire);
            // Safety: copied out as MaybeUninit; only assumed init after
            // both tag checks confirm slot `idx` was fully published and
            // not overwritten during the copy.
            let copied = unsafe { std::ptr::read(slot.value.get()) };
            let seq_after = slot.seq.load(Ordering::Acquire);
            if seq_before == idx + 1 && seq_after == idx + 1 {
                out.push(unsafe { copied.assume_init() });
            } else {
                lost += 1;
            }
        }
        self.dropped.fetch_add(lost, Ordering::AcqRel);
        (out, head, lost)
    }
}

/// Read-only counter view of a ring, for monitoring.
pub trait RingStats: Send + Sync {
    /// Total values pushed over the ring's lifetime.
    fn pushes(&self) -> u64;
    /// Total values lost to overwrite over the ring's lifetime.
    fn dropped(&self) -> u64;
}

impl<T: Copy + Send> RingStats for RingBuffer<T> {
    fn pushes(&self) -> u64 {
        RingBuffer::pushes(self)
    }

    fn dropped(&self) -> u64 {
        RingBuffer::dropped(self)
    }
}

/// Producer half. Held by the device adapter.
pub struct RingProducer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Copy> RingProducer<T> {
    /// Push a value, overwriting the oldest if the ring is full.
    pub fn push(&self, value: T) {
        self.ring.push(value);
    }

    /// Push every value of a batch in order.
    pub fn push_all(&self, values: &[T]) {
        for value in values {
            self.ring.push(*value);
        }
    }

    /// Counter view that outlives this producer.
    #[must_use]
    pub fn stats(&self) -> Arc<dyn RingStats>
    where
        T: Send + 'static,
    {
        Arc::clone(&self.ring) as Arc<dyn RingStats>
    }
}

/// Consumer half. Held by a pipeline task; tracks its own read cursor.
pub struct RingConsumer<T> {
    ring: Arc<RingBuffer<T>>,
    cursor: u64,
}

impl<T: Copy> RingConsumer<T> {
    /// Take everything published since the previous snapshot.
    ///
    /// Returns the samples (oldest first) and how many were lost to
    /// overwrite since the previous snapshot.
    pub fn snapshot(&mut self) -> (Vec<T>, u64) {
        let (out, cursor, lost) = self.ring.snapshot_since(self.cursor);
        self.cursor = cursor;
        (out, lost)
    }

    /// Total values lost to overwrite over the ring's lifetime.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    /// Total values pushed over the ring's lifetime.
    pub fn pushes(&self) -> u64 {
        self.ring.pushes()
    }
}

/// Create a connected producer/consumer pair over a fresh ring.
#[must_use]
pub fn ring<T: Copy>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let ring = Arc::new(RingBuffer::new(capacity));
    (
        RingProducer {
            ring: Arc::clone(&ring),
        },
        RingConsumer { ring, cursor: 0 },
    )
}
