//! Completion queue abstraction.

use bytes::BytesMut;
use std::{fmt, io, os::fd::OwnedFd, sync::Arc, time::Duration};

use super::Waker;

/// Kind of an I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Read into the whole buffer.
    Read,
    /// Write the whole buffer.
    Write,
}

/// Identifies the owner of an operation when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    /// Engine slot the operation belongs to.
    pub slot: usize,
    /// Operation kind.
    pub kind: OpKind,
}

impl Token {
    /// Read token for a slot.
    pub const fn read(slot: usize) -> Self {
        Self { slot, kind: OpKind::Read }
    }

    /// Write token for a slot.
    pub const fn write(slot: usize) -> Self {
        Self { slot, kind: OpKind::Write }
    }
}

/// I/O operation submitted to a completion queue.
///
/// The operation owns its buffer until it completes.
pub struct Op {
    /// Token returned with the completion.
    pub token: Token,
    /// File the operation is performed on.
    pub fd: Arc<OwnedFd>,
    /// Data buffer.
    pub buf: BytesMut,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Op").field("token", &self.token).field("len", &self.buf.len()).finish()
    }
}

impl Op {
    /// Read operation filling `buf`.
    pub fn read(slot: usize, fd: Arc<OwnedFd>, buf: BytesMut) -> Self {
        Self { token: Token::read(slot), fd, buf }
    }

    /// Write operation sending `buf`.
    pub fn write(slot: usize, fd: Arc<OwnedFd>, buf: BytesMut) -> Self {
        Self { token: Token::write(slot), fd, buf }
    }

    /// Converts the operation into a completion with the specified result.
    ///
    /// For successful reads the buffer is truncated to the number of bytes read.
    pub fn complete(self, result: io::Result<usize>) -> Completion {
        let Self { token, mut buf, .. } = self;
        if let (OpKind::Read, Ok(n)) = (token.kind, &result) {
            buf.truncate(*n);
        }
        Completion { token, buf, result }
    }
}

/// Completed I/O operation.
#[derive(Debug)]
pub struct Completion {
    /// Token of the operation.
    pub token: Token,
    /// Buffer of the operation, holding the received data for reads.
    pub buf: BytesMut,
    /// Number of bytes transferred or the error.
    pub result: io::Result<usize>,
}

/// Queue executing I/O operations asynchronously and delivering their completions.
///
/// Submitting never performs I/O; operations progress only inside [`wait`](Self::wait).
pub trait CompletionQueue {
    /// Submits an operation.
    fn submit(&mut self, op: Op) -> io::Result<()>;

    /// Waits until at least one operation has completed, the timeout elapsed
    /// or the queue was woken, and appends all completed operations to `completions`.
    ///
    /// Completions are delivered in submission order.
    fn wait(&mut self, completions: &mut Vec<Completion>, timeout: Option<Duration>) -> io::Result<()>;

    /// Removes all pending operations for which `filter` returns true and returns them.
    fn cancel(&mut self, filter: &mut dyn FnMut(&Token) -> bool) -> Vec<Op>;

    /// Number of pending operations.
    fn len(&self) -> usize;

    /// Whether no operations are pending.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle for interrupting [`wait`](Self::wait) from another thread, if supported.
    fn waker(&self) -> Option<Waker> {
        None
    }
}
