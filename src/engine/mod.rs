//! Completion-driven forwarding of HID reports from source to sink devices.
//!
//! The [`ForwardingEngine`] keeps one read armed on every source device.
//! When a read completes, the report is checked against the hotkey registry and,
//! unless a hotkey consumed it, written unchanged to the paired sink device.
//! The read is re-armed immediately afterwards, whether or not the report was forwarded.
//!
//! All I/O is submitted to a [`CompletionQueue`] and all continuations run inside
//! [`ForwardingEngine::poll_once`] on the calling thread.

mod poll;
mod pool;
mod queue;

pub use poll::{PollQueue, Waker};
pub use pool::BufferPool;
pub use queue::{Completion, CompletionQueue, Op, OpKind, Token};

use bytes::BytesMut;
use std::{
    collections::VecDeque,
    fmt, io, mem,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    descriptor::ReportLength,
    device::Device,
    hotkey::HotkeyRegistry,
    input::{InputEvent, KeyEvent, ModifierTracker, EVENT_SIZE},
    keymap::Keymap,
    Error, Result,
};

/// Minimum number of buffers per device pair: one for the read and one for the write.
pub const MIN_BUFFERS_PER_PAIR: usize = 2;

/// What to do when a read or write on a device fails.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Log the error and stop forwarding for the affected pair only.
    #[default]
    DropPair,
    /// Abort the whole session.
    AbortSession,
}

/// Forwarding engine options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EngineOptions {
    /// Error policy for device I/O failures.
    pub error_policy: ErrorPolicy,
    /// Number of report buffers allocated per device pair.
    ///
    /// Values below [`MIN_BUFFERS_PER_PAIR`] are raised to it.
    pub buffers_per_pair: usize,
    /// Number of input events read at once from an event device.
    pub event_buffer_events: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { error_policy: ErrorPolicy::default(), buffers_per_pair: 4, event_buffer_events: 64 }
    }
}

impl EngineOptions {
    /// Sets the error policy.
    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    /// Sets the number of buffers per device pair.
    pub fn with_buffers_per_pair(mut self, buffers_per_pair: usize) -> Self {
        self.buffers_per_pair = buffers_per_pair;
        self
    }
}

/// Stable identifier of a device pair within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(usize);

impl PairId {
    /// Numeric value of the id.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pair {}", self.0)
    }
}

/// Traffic counters of a device pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStats {
    /// Reports forwarded to the sink.
    pub forwarded: u64,
    /// Reports consumed by hotkeys.
    pub suppressed: u64,
    /// All-zero release reports written during shutdown.
    pub released: u64,
}

/// Public view of a device pair.
#[derive(Debug, Clone)]
pub struct PairInfo {
    /// Pair id.
    pub id: PairId,
    /// Source device path.
    pub source: PathBuf,
    /// Sink device path.
    pub sink: PathBuf,
    /// Report length of the pair.
    pub report_len: ReportLength,
    /// Whether reports are still being forwarded.
    pub active: bool,
    /// Traffic counters.
    pub stats: PairStats,
}

/// Handler receiving key events decoded from the event devices of a pair.
pub type KeyHandler = Box<dyn FnMut(PairId, &KeyEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Buffer belongs to the pair's pool.
    Pool,
    /// One-shot release report.
    Release,
}

/// Report waiting for the sink.
struct Outgoing {
    buf: BytesMut,
    origin: Origin,
}

struct PairState {
    id: PairId,
    source: Device,
    sink: Device,
    report_len: ReportLength,
    pool: BufferPool,
    outbox: VecDeque<Outgoing>,
    reading: bool,
    /// Origin of the buffer of the write in flight.
    writing: Option<Origin>,
    /// A read is due but no buffer was free.
    starved: bool,
    active: bool,
    stats: PairStats,
}

impl PairState {
    fn slot(&self) -> usize {
        self.id.0
    }

    fn arm_read<Q: CompletionQueue + ?Sized>(&mut self, queue: &mut Q) -> Result<()> {
        if self.reading || !self.active {
            return Ok(());
        }

        let Some(buf) = self.pool.checkout() else {
            if !self.starved {
                log::debug!("{}: all buffers in use, deferring read", self.id);
            }
            self.starved = true;
            return Ok(());
        };
        self.starved = false;

        queue
            .submit(Op::read(self.slot(), self.source.fd().clone(), buf))
            .map_err(|err| Error::device(self.source.path(), err))?;
        self.reading = true;
        Ok(())
    }

    fn pump_write<Q: CompletionQueue + ?Sized>(&mut self, queue: &mut Q) -> Result<()> {
        if self.writing.is_some() {
            return Ok(());
        }
        let Some(Outgoing { buf, origin }) = self.outbox.pop_front() else { return Ok(()) };

        queue
            .submit(Op::write(self.slot(), self.sink.fd().clone(), buf))
            .map_err(|err| Error::device(self.sink.path(), err))?;
        self.writing = Some(origin);
        Ok(())
    }

    fn on_read<Q: CompletionQueue + ?Sized>(
        &mut self, result: io::Result<usize>, buf: BytesMut, hotkeys: &mut HotkeyRegistry, queue: &mut Q,
    ) -> Result<()> {
        self.reading = false;
        if let Err(err) = result {
            self.pool.checkin(buf);
            return Err(Error::device(self.source.path(), err));
        }

        if hotkeys.dispatch(&buf) {
            log::debug!("{}: report {:02x?} consumed by hotkey", self.id, &buf[..]);
            self.stats.suppressed += 1;
            self.pool.checkin(buf);
        } else {
            log::trace!("{}: forwarding {:02x?}", self.id, &buf[..]);
            self.stats.forwarded += 1;
            self.outbox.push_back(Outgoing { buf, origin: Origin::Pool });
            self.pump_write(queue)?;
        }

        self.arm_read(queue)
    }

    fn on_write<Q: CompletionQueue + ?Sized>(
        &mut self, result: io::Result<usize>, buf: BytesMut, queue: &mut Q,
    ) -> Result<()> {
        let origin = self.writing.take();
        let len = buf.len();
        if origin == Some(Origin::Pool) {
            self.pool.checkin(buf);
        }

        let res = match result {
            Ok(n) if n == len => {
                if origin == Some(Origin::Release) {
                    self.stats.released += 1;
                }
                Ok(())
            }
            Ok(n) => {
                log::warn!("{}: short write of {n} of {len} bytes to {}", self.id, self.sink.path().display());
                Ok(())
            }
            Err(err) => Err(Error::device(self.sink.path(), err)),
        };

        self.pump_write(queue)?;
        if self.starved {
            self.arm_read(queue)?;
        }
        res
    }

    /// Takes back the buffer of an operation that will not be handled.
    fn reclaim(&mut self, kind: OpKind, buf: BytesMut) {
        match kind {
            OpKind::Read => {
                self.reading = false;
                self.pool.checkin(buf);
            }
            OpKind::Write => {
                if self.writing.take() == Some(Origin::Pool) {
                    self.pool.checkin(buf);
                }
            }
        }
    }

    fn info(&self) -> PairInfo {
        PairInfo {
            id: self.id,
            source: self.source.path().to_path_buf(),
            sink: self.sink.path().to_path_buf(),
            report_len: self.report_len,
            active: self.active,
            stats: self.stats,
        }
    }
}

/// Event device feeding a modifier tracker.
struct EventState {
    pair: PairId,
    device: Device,
    tracker: ModifierTracker,
    buf_len: usize,
    /// `None` while a read is in flight.
    buf: Option<BytesMut>,
}

impl EventState {
    fn arm_read<Q: CompletionQueue + ?Sized>(&mut self, slot: usize, queue: &mut Q) -> Result<()> {
        let Some(mut buf) = self.buf.take() else { return Ok(()) };
        buf.resize(self.buf_len, 0);
        queue
            .submit(Op::read(slot, self.device.fd().clone(), buf))
            .map_err(|err| Error::device(self.device.path(), err))
    }

    fn on_read(&mut self, result: io::Result<usize>, buf: BytesMut, handler: &mut Option<KeyHandler>) -> Result<()> {
        let res = result.map_err(|err| Error::device(self.device.path(), err));
        if res.is_ok() {
            for event in InputEvent::parse_all(&buf) {
                let Some(key) = self.tracker.process(&event) else { continue };
                if let Some(handler) = handler {
                    handler(self.pair, &key);
                }
            }
        }
        self.buf = Some(buf);
        res.map(|_| ())
    }
}

enum Slot {
    Pair(PairState),
    Events(EventState),
}

/// Forwards reports of device pairs through a completion queue.
pub struct ForwardingEngine<Q> {
    queue: Q,
    hotkeys: HotkeyRegistry,
    key_handler: Option<KeyHandler>,
    slots: Vec<Option<Slot>>,
    /// Pairs whose devices were closed.
    closed: Vec<PairInfo>,
    options: EngineOptions,
    completions: Vec<Completion>,
}

impl<Q: CompletionQueue> fmt::Debug for ForwardingEngine<Q> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("hotkeys", &self.hotkeys)
            .field("pairs", &self.pairs())
            .field("options", &self.options)
            .finish()
    }
}

impl<Q: CompletionQueue> ForwardingEngine<Q> {
    /// Creates an engine without device pairs.
    pub fn new(queue: Q, hotkeys: HotkeyRegistry, options: EngineOptions) -> Self {
        Self {
            queue,
            hotkeys,
            key_handler: None,
            slots: Vec::new(),
            closed: Vec::new(),
            options,
            completions: Vec::new(),
        }
    }

    /// Sets the handler receiving key events of event devices.
    pub fn set_key_handler(&mut self, handler: impl FnMut(PairId, &KeyEvent) + Send + 'static) {
        self.key_handler = Some(Box::new(handler));
    }

    /// Hotkey registry consulted for every report.
    pub fn hotkeys_mut(&mut self) -> &mut HotkeyRegistry {
        &mut self.hotkeys
    }

    /// Completion queue.
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Adds a device pair and arms its first read.
    pub fn add_pair(&mut self, source: Device, sink: Device, report_len: ReportLength) -> Result<PairId> {
        let id = PairId(self.slots.len());
        let buffers = self.options.buffers_per_pair.max(MIN_BUFFERS_PER_PAIR);
        log::info!(
            "{id}: forwarding {} to {} with report length {report_len}",
            source.path().display(),
            sink.path().display()
        );

        let mut pair = PairState {
            id,
            source,
            sink,
            report_len,
            pool: BufferPool::new(report_len.bytes(), buffers),
            outbox: VecDeque::with_capacity(buffers),
            reading: false,
            writing: None,
            starved: false,
            active: true,
            stats: PairStats::default(),
        };
        pair.arm_read(&mut self.queue)?;
        self.slots.push(Some(Slot::Pair(pair)));
        Ok(id)
    }

    /// Adds an event device whose key events are tracked for the specified pair.
    pub fn add_event_source(&mut self, pair: PairId, device: Device, keymap: Arc<Keymap>) -> Result<()> {
        if !matches!(self.slots.get(pair.0), Some(Some(Slot::Pair(p))) if p.active) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no active {pair}")).into());
        }

        let slot = self.slots.len();
        let buf_len = self.options.event_buffer_events.max(1) * EVENT_SIZE;
        log::debug!("{pair}: tracking keys of {}", device.path().display());

        let mut events = EventState {
            pair,
            device,
            tracker: ModifierTracker::new(keymap),
            buf_len,
            buf: Some(BytesMut::zeroed(buf_len)),
        };
        events.arm_read(slot, &mut self.queue)?;
        self.slots.push(Some(Slot::Events(events)));
        Ok(())
    }

    fn pair_states(&self) -> impl Iterator<Item = &PairState> {
        self.slots.iter().filter_map(|slot| match slot {
            Some(Slot::Pair(pair)) => Some(pair),
            _ => None,
        })
    }

    /// All device pairs, including closed ones.
    pub fn pairs(&self) -> Vec<PairInfo> {
        let mut pairs: Vec<_> = self.closed.iter().cloned().chain(self.pair_states().map(PairState::info)).collect();
        pairs.sort_by_key(|pair| pair.id);
        pairs
    }

    /// Number of pairs still forwarding reports.
    pub fn active_pairs(&self) -> usize {
        self.pair_states().filter(|pair| pair.active).count()
    }

    /// Waits for completions and handles them.
    ///
    /// Returns the number of handled completions.
    /// A device failure is handled according to the [error policy](EngineOptions::error_policy).
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut completions = mem::take(&mut self.completions);
        if let Err(err) = self.queue.wait(&mut completions, timeout) {
            self.completions = completions;
            return Err(err.into());
        }

        let count = completions.len();
        let mut res = Ok(count);
        for comp in completions.drain(..) {
            if res.is_err() {
                self.reclaim(comp.token, comp.buf);
                continue;
            }

            let slot = comp.token.slot;
            if let Err(err) = self.handle(comp) {
                match self.options.error_policy {
                    ErrorPolicy::DropPair => self.fail(slot, &err),
                    ErrorPolicy::AbortSession => {
                        log::error!("{err}, aborting");
                        res = Err(err);
                    }
                }
            }
        }

        self.completions = completions;
        res
    }

    /// Forwards reports until `stop` is set, no active pair is left or
    /// a device fails under [`ErrorPolicy::AbortSession`].
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("stop requested");
                return Ok(());
            }
            if self.active_pairs() == 0 {
                log::info!("no active device pairs left");
                return Ok(());
            }
            self.poll_once(None)?;
        }
    }

    fn handle(&mut self, comp: Completion) -> Result<()> {
        let Completion { token, buf, result } = comp;
        let Some(Some(slot)) = self.slots.get_mut(token.slot) else {
            log::trace!("ignoring completion for removed slot {}", token.slot);
            return Ok(());
        };

        match (slot, token.kind) {
            (Slot::Pair(pair), OpKind::Read) => pair.on_read(result, buf, &mut self.hotkeys, &mut self.queue),
            (Slot::Pair(pair), OpKind::Write) => pair.on_write(result, buf, &mut self.queue),
            (Slot::Events(events), _) => {
                events.on_read(result, buf, &mut self.key_handler)?;
                events.arm_read(token.slot, &mut self.queue)
            }
        }
    }

    fn reclaim(&mut self, token: Token, buf: BytesMut) {
        match self.slots.get_mut(token.slot) {
            Some(Some(Slot::Pair(pair))) => pair.reclaim(token.kind, buf),
            Some(Some(Slot::Events(events))) => events.buf = Some(buf),
            _ => (),
        }
    }

    fn cancel_slot(&mut self, slot: usize) {
        for op in self.queue.cancel(&mut |token| token.slot == slot) {
            self.reclaim(op.token, op.buf);
        }
    }

    /// Stops forwarding for the slot that failed.
    ///
    /// A failed pair stays registered so that it still receives release reports on shutdown.
    fn fail(&mut self, slot: usize, err: &Error) {
        self.cancel_slot(slot);

        let pair = match self.slots.get_mut(slot) {
            Some(Some(Slot::Pair(pair))) => pair,
            Some(Some(Slot::Events(events))) => {
                log::warn!("{}: dropping event device: {err}", events.pair);
                self.slots[slot] = None;
                return;
            }
            _ => return,
        };

        log::warn!("{}: dropping pair: {err}", pair.id);
        pair.active = false;
        pair.starved = false;
        for out in pair.outbox.drain(..) {
            if out.origin == Origin::Pool {
                pair.pool.checkin(out.buf);
            }
        }

        let id = pair.id;
        for other in 0..self.slots.len() {
            if matches!(&self.slots[other], Some(Slot::Events(events)) if events.pair == id) {
                self.cancel_slot(other);
                self.slots[other] = None;
            }
        }
    }

    fn writes_in_flight(&self) -> bool {
        self.pair_states().any(|pair| pair.writing.is_some())
    }

    /// Stops reading and writes `copies` all-zero reports to every sink.
    ///
    /// Reports already waiting for a sink are written first.
    /// Write failures are logged and otherwise ignored.
    /// Writes that have not completed within `timeout` are abandoned.
    /// Afterwards no operations are pending.
    pub fn shutdown(&mut self, copies: usize, timeout: Duration) {
        for op in self.queue.cancel(&mut |token| token.kind == OpKind::Read) {
            self.reclaim(op.token, op.buf);
        }

        for slot in self.slots.iter_mut().flatten() {
            let Slot::Pair(pair) = slot else { continue };
            pair.active = false;
            pair.starved = false;
            for _ in 0..copies {
                let buf = BytesMut::zeroed(pair.report_len.bytes());
                pair.outbox.push_back(Outgoing { buf, origin: Origin::Release });
            }
            if let Err(err) = pair.pump_write(&mut self.queue) {
                log::warn!("{}: cannot release keys: {err}", pair.id);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut completions = mem::take(&mut self.completions);
        while self.writes_in_flight() {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("release reports not written within {timeout:?}");
                break;
            }
            if let Err(err) = self.queue.wait(&mut completions, Some(deadline - now)) {
                log::warn!("waiting for release reports failed: {err}");
                break;
            }

            for Completion { token, buf, result } in completions.drain(..) {
                if token.kind != OpKind::Write {
                    self.reclaim(token, buf);
                    continue;
                }
                if let Some(Some(Slot::Pair(pair))) = self.slots.get_mut(token.slot) {
                    if let Err(err) = pair.on_write(result, buf, &mut self.queue) {
                        log::warn!("{}: cannot release keys: {err}", pair.id);
                    }
                }
            }
        }
        self.completions = completions;

        for op in self.queue.cancel(&mut |_| true) {
            self.reclaim(op.token, op.buf);
        }
        for slot in self.slots.iter_mut().flatten() {
            if let Slot::Pair(pair) = slot {
                pair.outbox.clear();
            }
        }
        log::info!("released keys of {} device pairs", self.pair_states().count());
    }

    /// Cancels all operations and closes the devices of all pairs and event devices.
    ///
    /// Closed pairs remain visible through [`pairs`](Self::pairs) with their final counters.
    pub fn close(&mut self) {
        self.queue.cancel(&mut |_| true);
        self.completions.clear();

        for slot in &mut self.slots {
            match slot.take() {
                Some(Slot::Pair(mut pair)) => {
                    pair.active = false;
                    log::debug!(
                        "{}: closing {} and {}",
                        pair.id,
                        pair.source.path().display(),
                        pair.sink.path().display()
                    );
                    self.closed.push(pair.info());
                }
                Some(Slot::Events(events)) => log::debug!("closing {}", events.device.path().display()),
                None => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::input::code;
    use std::{
        collections::{HashMap, HashSet},
        fs::OpenOptions,
        io::ErrorKind,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Scripted device behaviour shared between a test and its [`MockQueue`].
    #[derive(Default)]
    struct Script {
        reads: HashMap<usize, VecDeque<io::Result<Vec<u8>>>>,
        stalled_writes: HashSet<usize>,
        failing_writes: HashSet<usize>,
        written: HashMap<usize, Vec<Vec<u8>>>,
        log: Vec<String>,
    }

    impl Script {
        fn read(&mut self, slot: usize, data: &[u8]) {
            self.reads.entry(slot).or_default().push_back(Ok(data.to_vec()));
        }

        fn written(&self, slot: usize) -> Vec<Vec<u8>> {
            self.written.get(&slot).cloned().unwrap_or_default()
        }
    }

    /// Completes scripted reads and records writes.
    struct MockQueue {
        script: Arc<Mutex<Script>>,
        pending: VecDeque<Op>,
    }

    impl CompletionQueue for MockQueue {
        fn submit(&mut self, op: Op) -> io::Result<()> {
            self.script.lock().unwrap().log.push(format!("submit {:?} {}", op.token.kind, op.token.slot));
            self.pending.push_back(op);
            Ok(())
        }

        fn wait(&mut self, completions: &mut Vec<Completion>, _timeout: Option<Duration>) -> io::Result<()> {
            let mut script = self.script.lock().unwrap();
            for mut op in mem::take(&mut self.pending) {
                let slot = op.token.slot;
                let result = match op.token.kind {
                    OpKind::Read => match script.reads.get_mut(&slot).and_then(|reads| reads.pop_front()) {
                        Some(Ok(data)) => {
                            op.buf[..data.len()].copy_from_slice(&data);
                            Ok(data.len())
                        }
                        Some(Err(err)) => Err(err),
                        None => {
                            self.pending.push_back(op);
                            continue;
                        }
                    },
                    OpKind::Write if script.stalled_writes.contains(&slot) => {
                        self.pending.push_back(op);
                        continue;
                    }
                    OpKind::Write if script.failing_writes.contains(&slot) => Err(ErrorKind::BrokenPipe.into()),
                    OpKind::Write => {
                        script.written.entry(slot).or_default().push(op.buf.to_vec());
                        Ok(op.buf.len())
                    }
                };
                script.log.push(format!("complete {:?} {slot}", op.token.kind));
                completions.push(op.complete(result));
            }
            Ok(())
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
    }

    fn null_device(write: bool) -> Device {
        let file = OpenOptions::new().read(!write).write(write).open("/dev/null").unwrap();
        Device::from_fd("/dev/null", file.into()).unwrap()
    }

    fn engine(options: EngineOptions) -> (ForwardingEngine<MockQueue>, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let queue = MockQueue { script: script.clone(), pending: VecDeque::new() };
        (ForwardingEngine::new(queue, HotkeyRegistry::new(), options), script)
    }

    fn add_pair(engine: &mut ForwardingEngine<MockQueue>, len: u32) -> PairId {
        engine.add_pair(null_device(false), null_device(true), ReportLength::new(len)).unwrap()
    }

    const B: [u8; 8] = [0x02, 0, 0x04, 0, 0, 0, 0, 0];

    #[test]
    fn forwards_report() {
        let (mut engine, script) = engine(EngineOptions::default());
        let pair = add_pair(&mut engine, 8);
        script.lock().unwrap().read(0, &B);

        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();

        assert_eq!(script.lock().unwrap().written(0), [B.to_vec()]);
        assert_eq!(engine.pairs()[0].id, pair);
        assert_eq!(engine.pairs()[0].stats.forwarded, 1);
    }

    #[test]
    fn forwards_short_report_unchanged() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 9);
        script.lock().unwrap().read(0, &[0x03, 0xe9, 0x00]);

        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();

        assert_eq!(script.lock().unwrap().written(0), [vec![0x03, 0xe9, 0x00]]);
    }

    #[test]
    fn rearms_read_before_next_completion() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);
        add_pair(&mut engine, 8);
        {
            let mut script = script.lock().unwrap();
            script.read(0, &B);
            script.read(1, &B);
        }

        engine.poll_once(None).unwrap();

        let script = script.lock().unwrap();
        assert_eq!(
            script.log,
            [
                "submit Read 0",
                "submit Read 1",
                "complete Read 0",
                "complete Read 1",
                "submit Write 0",
                "submit Read 0",
                "submit Write 1",
                "submit Read 1",
            ]
        );
    }

    #[test]
    fn hotkey_suppresses_report() {
        let (mut engine, script) = engine(EngineOptions::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        engine
            .hotkeys_mut()
            .on_report(B, move || {
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        add_pair(&mut engine, 8);
        script.lock().unwrap().read(0, &B);

        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();

        let script = script.lock().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(script.written(0).is_empty());
        assert_eq!(script.log, ["submit Read 0", "complete Read 0", "submit Read 0"]);
        assert_eq!(engine.pairs()[0].stats.suppressed, 1);
    }

    #[test]
    fn drop_pair_policy_isolates_failure() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);
        add_pair(&mut engine, 8);
        {
            let mut script = script.lock().unwrap();
            script.reads.entry(0).or_default().push_back(Err(io::Error::from_raw_os_error(libc::EIO)));
            script.read(1, &B);
        }

        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();

        let pairs = engine.pairs();
        assert!(!pairs[0].active);
        assert!(pairs[1].active);
        assert_eq!(engine.active_pairs(), 1);
        assert_eq!(script.lock().unwrap().written(1), [B.to_vec()]);
        assert!(engine.queue().pending.iter().all(|op| op.token.slot == 1));
    }

    #[test]
    fn abort_policy_fails_poll() {
        let (mut engine, script) = engine(EngineOptions::default().with_error_policy(ErrorPolicy::AbortSession));
        add_pair(&mut engine, 8);
        script.lock().unwrap().reads.entry(0).or_default().push_back(Err(io::Error::from_raw_os_error(libc::ENODEV)));

        let err = engine.poll_once(None).unwrap_err();
        assert!(matches!(err, Error::DeviceIo { device, .. } if device == PathBuf::from("/dev/null")));
    }

    #[test]
    fn write_failure_drops_pair() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);
        {
            let mut script = script.lock().unwrap();
            script.failing_writes.insert(0);
            script.read(0, &B);
        }

        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();

        assert_eq!(engine.active_pairs(), 0);
        assert!(engine.queue().is_empty());
        let stop = AtomicBool::new(false);
        engine.run(&stop).unwrap();
    }

    #[test]
    fn shutdown_writes_three_release_reports() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);

        engine.shutdown(3, Duration::from_secs(1));

        assert_eq!(script.lock().unwrap().written(0), vec![vec![0u8; 8]; 3]);
        assert_eq!(engine.pairs()[0].stats.released, 3);
        assert!(engine.queue().is_empty());
    }

    #[test]
    fn shutdown_writes_pending_report_first() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);
        script.lock().unwrap().read(0, &B);
        engine.poll_once(None).unwrap();

        engine.shutdown(3, Duration::from_secs(1));

        let written = script.lock().unwrap().written(0);
        assert_eq!(written, [B.to_vec(), vec![0; 8], vec![0; 8], vec![0; 8]]);
    }

    #[test]
    fn shutdown_releases_failed_pair() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 4);
        script.lock().unwrap().reads.entry(0).or_default().push_back(Err(io::Error::from_raw_os_error(libc::EIO)));
        engine.poll_once(None).unwrap();

        engine.shutdown(3, Duration::from_secs(1));

        assert_eq!(script.lock().unwrap().written(0), vec![vec![0u8; 4]; 3]);
    }

    #[test]
    fn shutdown_gives_up_on_stalled_sink() {
        let (mut engine, script) = engine(EngineOptions::default());
        add_pair(&mut engine, 8);
        script.lock().unwrap().stalled_writes.insert(0);

        engine.shutdown(3, Duration::from_millis(20));

        assert!(script.lock().unwrap().written(0).is_empty());
        assert!(engine.queue().is_empty());
    }

    #[test]
    fn deferred_read_when_buffers_exhausted() {
        let (mut engine, script) = engine(EngineOptions::default().with_buffers_per_pair(2));
        add_pair(&mut engine, 1);
        {
            let mut script = script.lock().unwrap();
            script.stalled_writes.insert(0);
            script.read(0, &[1]);
            script.read(0, &[2]);
            script.read(0, &[3]);
        }

        // First report is written, second waits in the outbox.
        engine.poll_once(None).unwrap();
        engine.poll_once(None).unwrap();
        fn reads(script: &Script) -> usize {
            script.log.iter().filter(|l| *l == "submit Read 0").count()
        }
        assert_eq!(reads(&script.lock().unwrap()), 2);

        engine.poll_once(None).unwrap();
        assert_eq!(reads(&script.lock().unwrap()), 2);

        script.lock().unwrap().stalled_writes.clear();
        for _ in 0..6 {
            engine.poll_once(None).unwrap();
        }

        let script = script.lock().unwrap();
        assert_eq!(script.written(0), [vec![1], vec![2], vec![3]]);
        assert_eq!(reads(&script), 4);
    }

    #[test]
    fn key_events_reach_handler() {
        let (mut engine, script) = engine(EngineOptions::default());
        let pair = add_pair(&mut engine, 8);
        engine.add_event_source(pair, null_device(false), Arc::new(Keymap::us())).unwrap();

        let keys = Arc::new(Mutex::new(Vec::new()));
        let keys2 = keys.clone();
        engine.set_key_handler(move |pair, key| keys2.lock().unwrap().push((pair, key.sym.to_string())));

        let mut data = Vec::new();
        for (code, value) in [(code::LEFTSHIFT, 1), (30, 1), (30, 0), (code::LEFTSHIFT, 0), (30, 1)] {
            data.extend(InputEvent::key(code, value).to_bytes());
        }
        script.lock().unwrap().read(1, &data);

        engine.poll_once(None).unwrap();

        let keys = keys.lock().unwrap();
        let syms: Vec<_> = keys.iter().map(|(_, sym)| sym.as_str()).collect();
        assert_eq!(syms, ["leftshift", "A", "A", "leftshift", "a"]);
        assert!(keys.iter().all(|(id, _)| *id == pair));
        assert_eq!(script.lock().unwrap().log.last().unwrap(), "submit Read 1");
    }

    #[test]
    fn close_releases_devices() {
        let (mut engine, script) = engine(EngineOptions::default());
        let source = null_device(false);
        let events = null_device(false);
        let fds = [source.fd().clone(), events.fd().clone()];
        let pair = engine.add_pair(source, null_device(true), ReportLength::new(8)).unwrap();
        engine.add_event_source(pair, events, Arc::new(Keymap::new())).unwrap();
        script.lock().unwrap().read(0, &B);
        engine.poll_once(None).unwrap();
        engine.shutdown(3, Duration::from_secs(1));
        assert!(fds.iter().all(|fd| Arc::strong_count(fd) > 1));

        engine.close();

        assert!(fds.iter().all(|fd| Arc::strong_count(fd) == 1));
        assert!(engine.queue().is_empty());
        assert_eq!(engine.active_pairs(), 0);
        let pairs = engine.pairs();
        assert_eq!(pairs.len(), 1);
        assert!(!pairs[0].active);
        assert_eq!(pairs[0].stats.forwarded, 1);
        assert_eq!(pairs[0].stats.released, 3);
    }

    #[test]
    fn failed_pair_drops_event_sources() {
        let (mut engine, script) = engine(EngineOptions::default());
        let pair = add_pair(&mut engine, 8);
        engine.add_event_source(pair, null_device(false), Arc::new(Keymap::new())).unwrap();
        script.lock().unwrap().reads.entry(0).or_default().push_back(Err(io::Error::from_raw_os_error(libc::EIO)));

        engine.poll_once(None).unwrap();

        assert!(engine.queue().is_empty());
        assert!(engine.add_event_source(pair, null_device(false), Arc::new(Keymap::new())).is_err());
    }
}
