//! Completion queue driven by `poll(2)`.

use rustix::{
    event::{eventfd, poll, EventfdFlags, PollFd, PollFlags, Timespec},
    io::Errno,
};
use std::{
    collections::VecDeque,
    fmt, io,
    io::{Error, ErrorKind},
    mem,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
    time::{Duration, Instant},
};

use super::queue::{Completion, CompletionQueue, Op, OpKind, Token};

/// Wakes a thread blocked in [`PollQueue::wait`].
///
/// Backed by an eventfd, so waking is safe from any thread and from signal handlers.
#[derive(Debug, Clone)]
pub struct Waker(Arc<OwnedFd>);

impl Waker {
    fn new() -> io::Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self(Arc::new(fd)))
    }

    /// Wakes the queue.
    pub fn wake(&self) -> io::Result<()> {
        match rustix::io::write(&*self.0, &1u64.to_ne_bytes()) {
            Ok(_) | Err(Errno::AGAIN) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Resets the eventfd counter.
    fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = rustix::io::read(&*self.0, &mut buf[..]);
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Completion queue performing operations when `poll(2)` reports their file ready.
///
/// All files must be in non-blocking mode.
/// Operations run to completion inside [`wait`](CompletionQueue::wait);
/// an operation failing with `EAGAIN` stays pending.
pub struct PollQueue {
    pending: VecDeque<Op>,
    waker: Waker,
}

impl fmt::Debug for PollQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PollQueue").field("pending", &self.pending.len()).finish()
    }
}

impl PollQueue {
    /// Creates an empty queue.
    pub fn new() -> io::Result<Self> {
        Ok(Self { pending: VecDeque::new(), waker: Waker::new()? })
    }

    /// Polls the waker and all pending operations.
    ///
    /// Returns whether the waker fired and the ready events of each operation,
    /// or `None` if the poll was interrupted.
    fn poll(&self, timeout: Option<Duration>) -> io::Result<Option<(bool, Vec<PollFlags>)>> {
        let mut fds = Vec::with_capacity(self.pending.len() + 1);
        fds.push(PollFd::new(&self.waker, PollFlags::IN));
        for op in &self.pending {
            let events = match op.token.kind {
                OpKind::Read => PollFlags::IN,
                OpKind::Write => PollFlags::OUT,
            };
            fds.push(PollFd::new(&*op.fd, events));
        }

        let timeout = timeout.map(|t| Timespec { tv_sec: t.as_secs() as _, tv_nsec: t.subsec_nanos() as _ });
        match poll(&mut fds, timeout.as_ref()) {
            Ok(_) => (),
            Err(Errno::INTR) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let woken = !fds[0].revents().is_empty();
        Ok(Some((woken, fds[1..].iter().map(|fd| fd.revents()).collect())))
    }

    /// Performs an operation whose file is ready.
    ///
    /// Returns `None` if the operation would block.
    fn perform(op: &mut Op, revents: PollFlags) -> Option<io::Result<usize>> {
        if revents.is_empty() {
            return None;
        }
        if revents.contains(PollFlags::NVAL) {
            return Some(Err(Errno::BADF.into()));
        }

        let res = match op.token.kind {
            OpKind::Read => rustix::io::read(&*op.fd, &mut op.buf[..]),
            OpKind::Write => rustix::io::write(&*op.fd, &op.buf[..]),
        };

        match res {
            Err(Errno::AGAIN) | Err(Errno::INTR) => None,
            Err(err) => Some(Err(err.into())),
            Ok(0) if op.token.kind == OpKind::Read => {
                Some(Err(Error::new(ErrorKind::UnexpectedEof, "device closed")))
            }
            Ok(n) => Some(Ok(n)),
        }
    }
}

impl CompletionQueue for PollQueue {
    fn submit(&mut self, op: Op) -> io::Result<()> {
        log::trace!("submitting {op:?}");
        self.pending.push_back(op);
        Ok(())
    }

    fn wait(&mut self, completions: &mut Vec<Completion>, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some((woken, revents)) = self.poll(remaining)? else {
                return Ok(());
            };
            if woken {
                self.waker.drain();
            }

            let before = completions.len();
            for (mut op, revents) in mem::take(&mut self.pending).into_iter().zip(revents) {
                match Self::perform(&mut op, revents) {
                    Some(res) => {
                        log::trace!("completed {op:?}: {res:?}");
                        completions.push(op.complete(res));
                    }
                    None => self.pending.push_back(op),
                }
            }

            let timed_out = remaining.is_some_and(|r| r.is_zero());
            if woken || timed_out || completions.len() > before {
                return Ok(());
            }
        }
    }

    fn cancel(&mut self, filter: &mut dyn FnMut(&Token) -> bool) -> Vec<Op> {
        let (cancelled, kept): (Vec<Op>, Vec<Op>) =
            mem::take(&mut self.pending).into_iter().partition(|op| filter(&op.token));
        self.pending = kept.into();
        cancelled
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn waker(&self) -> Option<Waker> {
        Some(self.waker.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use rustix::pipe::{pipe_with, PipeFlags};
    use std::thread;

    fn pipe() -> (Arc<OwnedFd>, Arc<OwnedFd>) {
        let (rx, tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC).unwrap();
        (Arc::new(rx), Arc::new(tx))
    }

    #[test]
    fn read_completes_when_data_arrives() {
        let mut queue = PollQueue::new().unwrap();
        let (rx, tx) = pipe();
        queue.submit(Op::read(3, rx, BytesMut::zeroed(8))).unwrap();

        let mut completions = Vec::new();
        queue.wait(&mut completions, Some(Duration::from_millis(20))).unwrap();
        assert!(completions.is_empty());
        assert_eq!(queue.len(), 1);

        rustix::io::write(&*tx, &[1, 2, 3]).unwrap();
        queue.wait(&mut completions, None).unwrap();
        assert_eq!(completions.len(), 1);
        let comp = completions.pop().unwrap();
        assert_eq!(comp.token, Token::read(3));
        assert_eq!(comp.result.unwrap(), 3);
        assert_eq!(&comp.buf[..], &[1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn write_completes() {
        let mut queue = PollQueue::new().unwrap();
        let (rx, tx) = pipe();
        queue.submit(Op::write(0, tx, BytesMut::from(&[9u8; 4][..]))).unwrap();

        let mut completions = Vec::new();
        queue.wait(&mut completions, None).unwrap();
        assert_eq!(completions[0].result.as_ref().unwrap(), &4);

        let mut buf = [0u8; 8];
        assert_eq!(rustix::io::read(&*rx, &mut buf[..]).unwrap(), 4);
        assert_eq!(buf[..4], [9; 4]);
    }

    #[test]
    fn closed_writer_fails_read() {
        let mut queue = PollQueue::new().unwrap();
        let (rx, tx) = pipe();
        drop(tx);
        queue.submit(Op::read(0, rx, BytesMut::zeroed(8))).unwrap();

        let mut completions = Vec::new();
        queue.wait(&mut completions, None).unwrap();
        let err = completions.pop().unwrap().result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn completions_in_submission_order() {
        let mut queue = PollQueue::new().unwrap();
        let pipes: Vec<_> = (0..3).map(|_| pipe()).collect();
        for (slot, (rx, _)) in pipes.iter().enumerate().rev() {
            queue.submit(Op::read(slot, rx.clone(), BytesMut::zeroed(1))).unwrap();
        }
        for (_, tx) in &pipes {
            rustix::io::write(&**tx, &[1]).unwrap();
        }

        let mut completions = Vec::new();
        queue.wait(&mut completions, None).unwrap();
        let slots: Vec<_> = completions.iter().map(|c| c.token.slot).collect();
        assert_eq!(slots, [2, 1, 0]);
    }

    #[test]
    fn waker_interrupts_wait() {
        let mut queue = PollQueue::new().unwrap();
        let (rx, _tx) = pipe();
        queue.submit(Op::read(0, rx, BytesMut::zeroed(8))).unwrap();

        let waker = queue.waker().unwrap();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let mut completions = Vec::new();
        queue.wait(&mut completions, None).unwrap();
        assert!(completions.is_empty());
        assert_eq!(queue.len(), 1);
        t.join().unwrap();
    }

    #[test]
    fn cancel_removes_matching() {
        let mut queue = PollQueue::new().unwrap();
        let (rx, tx) = pipe();
        queue.submit(Op::read(0, rx.clone(), BytesMut::zeroed(8))).unwrap();
        queue.submit(Op::write(0, tx, BytesMut::zeroed(8))).unwrap();
        queue.submit(Op::read(1, rx, BytesMut::zeroed(8))).unwrap();

        let cancelled = queue.cancel(&mut |token| token.slot == 0);
        assert_eq!(cancelled.len(), 2);
        assert_eq!(queue.len(), 1);
    }
}
