//! Hand-off buffers between capture and encoding
//!
//! Capture contexts must never block on a slow consumer. Audio goes through a
//! lock-free [`RingBuffer`] that overwrites its oldest chunk when full; video
//! goes through a [`LatestSlot`] that only ever holds the newest frame.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::frame::AudioChunk;
use crate::error::CaptureError;

/// Lock-free SPSC ring of audio chunks
pub struct RingBuffer {
    queue: ArrayQueue<AudioChunk>,
    overwritten: AtomicUsize,
    underruns: AtomicUsize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overwritten: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
        }
    }

    /// Push a chunk, evicting the oldest one when full.
    ///
    /// Returns false when an older chunk was lost.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        match self.queue.force_push(chunk) {
            None => true,
            Some(_) => {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest chunk, counting an underrun when empty
    pub fn pop(&self) -> Option<AudioChunk> {
        let chunk = self.queue.pop();
        if chunk.is_none() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        chunk
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overwritten(&self) -> usize {
        self.overwritten.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

pub type SharedRingBuffer = Arc<RingBuffer>;

pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Create a single-slot frame hand-off
pub fn latest_slot<T>() -> (SlotWriter<T>, SlotReader<T>) {
    let (tx, rx) = bounded(1);
    let counters = Arc::new(SlotCounters::default());
    (
        SlotWriter {
            tx,
            evict: rx.clone(),
            counters: counters.clone(),
        },
        SlotReader { rx, counters },
    )
}

#[derive(Default)]
struct SlotCounters {
    published: AtomicU64,
    replaced: AtomicU64,
}

/// Producer half of a latest-value slot. Never blocks.
pub struct SlotWriter<T> {
    tx: Sender<T>,
    // Held so the writer can evict a stale item itself
    evict: Receiver<T>,
    counters: Arc<SlotCounters>,
}

impl<T> SlotWriter<T> {
    /// Store `item`, replacing whatever the consumer has not taken yet
    pub fn publish(&self, item: T) -> Result<(), CaptureError> {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(CaptureError::Stopped),
            }
        }
    }

    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    /// Items overwritten before the consumer saw them
    pub fn replaced(&self) -> u64 {
        self.counters.replaced.load(Ordering::Relaxed)
    }
}

/// Consumer half of a latest-value slot
pub struct SlotReader<T> {
    rx: Receiver<T>,
    counters: Arc<SlotCounters>,
}

impl<T> SlotReader<T> {
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next item.
    ///
    /// `Err(Stopped)` once the writer is gone and the slot is empty.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Option<T>, CaptureError> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Stopped),
        }
    }

    pub fn replaced(&self) -> u64 {
        self.counters.replaced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ts: i64) -> AudioChunk {
        AudioChunk::new(vec![0.0; 96], 2, 48_000, ts)
    }

    #[test]
    fn test_ring_buffer_order() {
        let buffer = RingBuffer::new(4);
        assert!(buffer.push(chunk(0)));
        assert!(buffer.push(chunk(1_000)));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.pop().unwrap().timestamp_micros, 0);
        assert_eq!(buffer.pop().unwrap().timestamp_micros, 1_000);
        assert!(buffer.pop().is_none());
        assert_eq!(buffer.underruns(), 1);
    }

    #[test]
    fn test_ring_buffer_overwrites_oldest() {
        let buffer = RingBuffer::new(2);
        buffer.push(chunk(0));
        buffer.push(chunk(1));
        assert!(!buffer.push(chunk(2)));

        assert_eq!(buffer.overwritten(), 1);
        assert_eq!(buffer.pop().unwrap().timestamp_micros, 1);
        assert_eq!(buffer.pop().unwrap().timestamp_micros, 2);
    }

    #[test]
    fn test_slot_keeps_newest() {
        let (writer, reader) = latest_slot();
        writer.publish(1).unwrap();
        writer.publish(2).unwrap();
        writer.publish(3).unwrap();

        assert_eq!(reader.try_take(), Some(3));
        assert_eq!(reader.try_take(), None);
        assert_eq!(writer.replaced(), 2);
        assert_eq!(writer.published(), 3);
    }

    #[test]
    fn test_slot_timeout_and_disconnect() {
        let (writer, reader) = latest_slot::<u32>();
        assert_eq!(reader.take_timeout(Duration::from_millis(5)), Ok(None));

        writer.publish(7).unwrap();
        drop(writer);
        assert_eq!(reader.take_timeout(Duration::from_millis(5)), Ok(Some(7)));
        assert_eq!(
            reader.take_timeout(Duration::from_millis(5)),
            Err(CaptureError::Stopped)
        );
    }

    #[test]
    fn test_slot_writer_never_blocks_across_threads() {
        let (writer, reader) = latest_slot();
        let producer = std::thread::spawn(move || {
            for i in 0..1_000u32 {
                writer.publish(i).unwrap();
            }
            writer
        });
        let writer = producer.join().unwrap();

        let mut last = None;
        while let Some(v) = reader.try_take() {
            last = Some(v);
        }
        assert_eq!(last, Some(999));
        assert_eq!(writer.published(), 1_000);
    }
}
