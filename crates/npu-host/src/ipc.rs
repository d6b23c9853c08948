//! Host ↔ coprocessor IPC channel
//!
//! Two fixed-size word rings: the command queue (host → device) and the
//! response queue (device → host). Each message is framed in its ring by a
//! one-word length prefix, so a ring of `NPU_IPC_BUF_LENGTH` words holds a
//! payload of at most `NPU_IPC_BUF_LENGTH - 1` words.
//!
//! Every queue has a doorbell: a coalesced, one-slot notification that stands
//! in for the interrupt line. Whoever drains a queue attaches its doorbell and
//! sleeps on it.

use crate::config::NPU_IPC_BUF_LENGTH;
use crate::error::IpcError;
use crate::lock;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Queue addressed by `send` / `receive`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueIndex {
    /// Host → device commands
    Command = 0,
    /// Device → host responses
    Response = 1,
}

impl QueueIndex {
    const fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for QueueIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "cmd"),
            Self::Response => write!(f, "rsp"),
        }
    }
}

/// One length-framed word ring
#[derive(Debug)]
struct WordRing {
    words: VecDeque<u32>,
    capacity: usize,
}

impl WordRing {
    fn new(capacity: usize) -> Self {
        Self {
            words: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn free(&self) -> usize {
        self.capacity - self.words.len()
    }

    fn push(&mut self, message: &[u32]) -> Result<(), IpcError> {
        let framed = message.len() + 1;
        if framed > self.capacity {
            return Err(IpcError::MessageTooLarge {
                words: message.len(),
            });
        }
        if framed > self.free() {
            return Err(IpcError::QueueFull);
        }

        // Length prefix fits: framed <= capacity = 512
        #[allow(clippy::cast_possible_truncation)]
        let len = message.len() as u32;
        self.words.push_back(len);
        self.words.extend(message.iter().copied());
        Ok(())
    }

    fn pop(&mut self) -> Option<Vec<u32>> {
        let len = self.words.pop_front()? as usize;
        Some(self.words.drain(..len).collect())
    }

    fn clear(&mut self) {
        self.words.clear();
    }
}

/// Bidirectional IPC channel shared by the host and the coprocessor
#[derive(Debug)]
pub struct IpcChannel {
    rings: [Mutex<WordRing>; 2],
    doorbells: [Mutex<Option<Sender<()>>>; 2],
    link_up: AtomicBool,
    established: AtomicBool,
}

impl Default for IpcChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcChannel {
    /// Create a channel with `NPU_IPC_BUF_LENGTH`-word rings and the link down
    pub fn new() -> Self {
        Self::with_capacity(NPU_IPC_BUF_LENGTH)
    }

    /// Create a channel with rings of `words` words
    pub fn with_capacity(words: usize) -> Self {
        Self {
            rings: [
                Mutex::new(WordRing::new(words)),
                Mutex::new(WordRing::new(words)),
            ],
            doorbells: [Mutex::new(None), Mutex::new(None)],
            link_up: AtomicBool::new(false),
            established: AtomicBool::new(false),
        }
    }

    /// Mark the coprocessor side of the link up or down
    ///
    /// Called by the firmware loader once the coprocessor has booted.
    pub fn set_link_up(&self, up: bool) {
        debug!("IPC link {}", if up { "up" } else { "down" });
        self.link_up.store(up, Ordering::Release);
        if !up {
            self.established.store(false, Ordering::Release);
        }
    }

    /// Whether the coprocessor side of the link is up
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    /// Whether the pre-init handshake has completed
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Pre-init handshake: reset both rings and establish the queues
    ///
    /// # Errors
    ///
    /// Returns `SubsystemNotReady` if the coprocessor has not brought the link up.
    pub fn pre_init(&self) -> Result<(), IpcError> {
        if !self.is_link_up() {
            return Err(IpcError::SubsystemNotReady);
        }
        for ring in &self.rings {
            lock(ring).clear();
        }
        self.established.store(true, Ordering::Release);
        debug!("IPC queues established");
        Ok(())
    }

    /// Tear the channel down: link down, rings cleared, doorbells detached
    pub fn deinit(&self) {
        self.set_link_up(false);
        for ring in &self.rings {
            lock(ring).clear();
        }
        for bell in &self.doorbells {
            lock(bell).take();
        }
    }

    /// Attach the doorbell for `queue`, replacing any previous listener
    ///
    /// The returned receiver gets at most one pending notification; several
    /// sends before the listener wakes collapse into one, like a level IRQ.
    pub fn attach_doorbell(&self, queue: QueueIndex) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        *lock(&self.doorbells[queue.slot()]) = Some(tx);
        rx
    }

    /// Write `message` into `queue` and ring its doorbell
    ///
    /// # Errors
    ///
    /// - `SubsystemNotReady` if the link is down or queues were never established
    /// - `QueueFull` if the ring has no room
    /// - `MessageTooLarge` if the message cannot fit even in an empty ring
    pub fn send(&self, queue: QueueIndex, message: &[u32]) -> Result<(), IpcError> {
        if !self.is_link_up() || !self.is_established() {
            return Err(IpcError::SubsystemNotReady);
        }

        lock(&self.rings[queue.slot()]).push(message)?;
        trace!("IPC {queue}: queued {} words", message.len());

        if let Some(bell) = lock(&self.doorbells[queue.slot()]).as_ref() {
            match bell.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    trace!("IPC {queue}: doorbell listener gone");
                }
            }
        }
        Ok(())
    }

    /// Pop the next message from `queue`, if any
    pub fn receive(&self, queue: QueueIndex) -> Option<Vec<u32>> {
        lock(&self.rings[queue.slot()]).pop()
    }

    /// Words currently in use in `queue` (including framing)
    pub fn occupancy(&self, queue: QueueIndex) -> usize {
        lock(&self.rings[queue.slot()]).words.len()
    }
}
