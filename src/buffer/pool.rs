//! Bounded buffer pool: a free queue and a filled queue
//!
//! Both queues are crossbeam channels sized to the pool capacity, so a
//! release or enqueue of a pool buffer can never block. Exhausting the free
//! queue blocks the producer; that is the pipeline's backpressure.

use super::Buffer;
use crate::error::{ReadoutError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Two bounded FIFOs of fixed-capacity buffers
#[derive(Debug)]
pub struct BufferPool {
    free_tx: Sender<Buffer>,
    free_rx: Receiver<Buffer>,
    filled_tx: Sender<Buffer>,
    filled_rx: Receiver<Buffer>,
    capacity: usize,
    buffer_words: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_words` words each
    pub fn new(count: usize, buffer_words: usize) -> Result<Self> {
        if count == 0 || buffer_words == 0 {
            return Err(ReadoutError::Config(format!(
                "buffer pool needs a non-zero size (count {}, words {})",
                count, buffer_words
            )));
        }

        let (free_tx, free_rx) = bounded(count);
        let (filled_tx, filled_rx) = bounded(count);
        for _ in 0..count {
            free_tx
                .try_send(Buffer::new(buffer_words))
                .map_err(|_| ReadoutError::Channel("free queue rejected a new buffer".into()))?;
        }

        tracing::info!(
            count,
            buffer_words,
            total_kib = (count * buffer_words * 2) / 1024,
            "Created buffer pool"
        );

        Ok(Self {
            free_tx,
            free_rx,
            filled_tx,
            filled_rx,
            capacity: count,
            buffer_words,
        })
    }

    /// Number of buffers the pool owns
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Word capacity of each buffer
    pub fn buffer_words(&self) -> usize {
        self.buffer_words
    }

    /// Buffers currently in the free queue
    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    /// Buffers currently in the filled queue
    pub fn filled_count(&self) -> usize {
        self.filled_rx.len()
    }

    /// Buffers held by some component (in neither queue)
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.free_count() + self.filled_count())
    }

    /// Take a free buffer, blocking until one is available
    pub fn acquire_free(&self) -> Result<Buffer> {
        self.free_rx
            .recv()
            .map_err(|_| ReadoutError::Channel("free queue disconnected".into()))
    }

    /// Take a free buffer, giving up after `timeout`
    pub fn acquire_free_timeout(&self, timeout: Duration) -> Option<Buffer> {
        self.free_rx.recv_timeout(timeout).ok()
    }

    /// Return a buffer to the free queue
    ///
    /// The buffer is reset first. A buffer that does not belong to this pool
    /// is rejected instead of growing the pool.
    pub fn release_free(&self, mut buffer: Buffer) -> Result<()> {
        self.check_owned(&buffer)?;
        buffer.reset();
        match self.free_tx.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReadoutError::Channel(
                "free queue already holds every pool buffer".into(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(ReadoutError::Channel("free queue disconnected".into()))
            }
        }
    }

    /// Hand a filled buffer to the consumer
    pub fn enqueue_filled(&self, buffer: Buffer) -> Result<()> {
        self.check_owned(&buffer)?;
        match self.filled_tx.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReadoutError::Channel(
                "filled queue already holds every pool buffer".into(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(ReadoutError::Channel("filled queue disconnected".into()))
            }
        }
    }

    /// Take the oldest filled buffer, blocking until one is available
    pub fn dequeue_filled(&self) -> Result<Buffer> {
        self.filled_rx
            .recv()
            .map_err(|_| ReadoutError::Channel("filled queue disconnected".into()))
    }

    /// Take the oldest filled buffer, giving up after `timeout`
    pub fn dequeue_filled_timeout(&self, timeout: Duration) -> Option<Buffer> {
        match self.filled_rx.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn check_owned(&self, buffer: &Buffer) -> Result<()> {
        if buffer.capacity() != self.buffer_words {
            return Err(ReadoutError::BufferOverflow {
                needed: buffer.capacity(),
                capacity: self.buffer_words,
            }
            .with_context("buffer does not belong to this pool"));
        }
        Ok(())
    }
}
