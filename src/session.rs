//! Relay session: gadget lifecycle, device pairs and the forwarding loop.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    device::{Device, EventDevice},
    discovery::DiscoveryRoots,
    engine::{CompletionQueue, EngineOptions, ForwardingEngine, PairId, Waker},
    gadget::{DevicePair, GadgetLifecycle},
    hotkey::HotkeyRegistry,
    input::KeyEvent,
    keymap::Keymap,
    Error, Result,
};

/// Number of all-zero reports written to every sink when a session stops.
pub const RELEASE_REPORTS: usize = 3;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    /// Created, not started.
    Idle,
    /// Gadget and devices are being set up.
    Starting,
    /// Reports are being forwarded.
    Running,
    /// Keys are being released and resources freed.
    Stopping,
    /// Terminal state.
    Closed,
}

/// Session options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionOptions {
    /// Forwarding engine options.
    pub engine: EngineOptions,
    /// Roots for device discovery.
    pub roots: DiscoveryRoots,
    /// Keymap for resolving key events.
    pub keymap: Arc<Keymap>,
    /// Whether input event devices are opened to track keys.
    pub track_keys: bool,
    /// Only track event devices that are keyboards.
    pub keyboards_only: bool,
    /// Number of all-zero reports written to every sink on stop.
    pub release_reports: usize,
    /// Time to wait for release reports to be written.
    pub release_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            engine: EngineOptions::default(),
            roots: DiscoveryRoots::default(),
            keymap: Arc::new(Keymap::us()),
            track_keys: true,
            keyboards_only: true,
            release_reports: RELEASE_REPORTS,
            release_timeout: Duration::from_secs(1),
        }
    }
}

impl SessionOptions {
    /// Sets the engine options.
    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the discovery roots.
    pub fn with_roots(mut self, roots: DiscoveryRoots) -> Self {
        self.roots = roots;
        self
    }

    /// Sets the keymap.
    pub fn with_keymap(mut self, keymap: Keymap) -> Self {
        self.keymap = Arc::new(keymap);
        self
    }

    /// Sets whether input event devices are tracked.
    pub fn with_track_keys(mut self, track_keys: bool) -> Self {
        self.track_keys = track_keys;
        self
    }

    /// Sets the time to wait for release reports.
    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }
}

/// Requests a running session to stop.
///
/// Can be cloned and used from other threads and signal handlers.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Option<Waker>,
}

impl StopHandle {
    /// Requests the session to stop.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.wake() {
                log::warn!("cannot wake session: {err}");
            }
        }
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Relay session forwarding reports from source devices to the USB host.
///
/// Created in [`Idle`](SessionState::Idle) state, started by [`start`](Self::start)
/// and stopped by [`run`](Self::run) returning or by [`stop`](Self::stop).
/// A closed session cannot be restarted.
pub struct DeviceSession<G, Q> {
    state: SessionState,
    gadget: G,
    engine: ForwardingEngine<Q>,
    options: SessionOptions,
    event_devices: Vec<EventDevice>,
    pairs: Vec<(DevicePair, PairId)>,
    stop: StopHandle,
}

impl<G, Q> std::fmt::Debug for DeviceSession<G, Q>
where
    Q: CompletionQueue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceSession").field("state", &self.state).field("engine", &self.engine).finish()
    }
}

impl<G: GadgetLifecycle, Q: CompletionQueue> DeviceSession<G, Q> {
    /// Creates an idle session.
    pub fn new(gadget: G, queue: Q, hotkeys: HotkeyRegistry, options: SessionOptions) -> Self {
        let stop = StopHandle { flag: Arc::new(AtomicBool::new(false)), waker: queue.waker() };
        Self {
            state: SessionState::Idle,
            gadget,
            engine: ForwardingEngine::new(queue, hotkeys, options.engine.clone()),
            options,
            event_devices: Vec::new(),
            pairs: Vec::new(),
            stop,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle for stopping the session.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Sets the handler receiving key events of the tracked event devices.
    pub fn set_key_handler(&mut self, handler: impl FnMut(PairId, &KeyEvent) + Send + 'static) {
        self.engine.set_key_handler(handler);
    }

    /// Hotkeys consulted for every forwarded report.
    pub fn hotkeys_mut(&mut self) -> &mut HotkeyRegistry {
        self.engine.hotkeys_mut()
    }

    /// Device pairs being forwarded.
    pub fn pairs(&self) -> &[(DevicePair, PairId)] {
        &self.pairs
    }

    /// Forwarding engine.
    pub fn engine(&self) -> &ForwardingEngine<Q> {
        &self.engine
    }

    /// Gadget lifecycle handler.
    pub fn gadget(&self) -> &G {
        &self.gadget
    }

    fn expect_state(&self, state: SessionState) -> Result<()> {
        if self.state != state {
            return Err(Error::InvalidState(self.state));
        }
        Ok(())
    }

    /// Sets up the gadget and opens all device pairs.
    ///
    /// A pair whose report descriptor or devices cannot be used is skipped.
    /// If the gadget setup fails, the session is closed and the error is returned.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle)?;
        self.state = SessionState::Starting;
        log::info!("starting session");

        let pairs = match self.gadget.setup() {
            Ok(pairs) => pairs,
            Err(err) => {
                log::error!("gadget setup failed: {err}");
                self.state = SessionState::Closed;
                return Err(err);
            }
        };

        for pair in pairs {
            match self.open_pair(&pair) {
                Ok(id) => self.pairs.push((pair, id)),
                Err(err) => log::warn!("skipping {}: {err}", pair.source.display()),
            }
        }

        log::info!("session running with {} device pairs", self.pairs.len());
        self.state = SessionState::Running;
        Ok(())
    }

    fn open_pair(&mut self, pair: &DevicePair) -> Result<PairId> {
        let report_len = self.options.roots.report_length(&pair.source)?;
        let source = Device::open_source(&pair.source)?;
        let sink = Device::open_sink(&pair.sink)?;
        let id = self.engine.add_pair(source, sink, report_len)?;

        if self.options.track_keys {
            self.open_event_devices(id, &pair.source);
        }
        Ok(id)
    }

    fn open_event_devices(&mut self, id: PairId, source: &Path) {
        let roots = &self.options.roots;
        let paths = if self.options.keyboards_only {
            roots.resolve_keyboard_event_sources(source)
        } else {
            roots.resolve_event_sources(source)
        };
        let paths = match paths {
            Ok(paths) => paths,
            Err(err) => {
                log::warn!("{id}: cannot resolve event devices: {err}");
                return;
            }
        };

        for path in paths {
            let events = match EventDevice::open(&path) {
                Ok(events) => events,
                Err(err) => {
                    log::warn!("{id}: cannot open event device: {err}");
                    continue;
                }
            };
            match self.engine.add_event_source(id, events.device().clone(), self.options.keymap.clone()) {
                Ok(()) => self.event_devices.push(events),
                Err(err) => log::warn!("{id}: cannot track {}: {err}", path.display()),
            }
        }
    }

    /// Forwards reports until a stop is requested, no device pair is left or
    /// a device fails under [`ErrorPolicy::AbortSession`](crate::engine::ErrorPolicy::AbortSession).
    ///
    /// The session is stopped afterwards, also when forwarding failed.
    pub fn run(&mut self) -> Result<()> {
        self.expect_state(SessionState::Running)?;

        let res = self.engine.run(&self.stop.flag);
        if let Err(err) = &res {
            log::error!("forwarding failed: {err}");
        }

        let stop_res = self.stop();
        res.and(stop_res)
    }

    /// Releases all keys on the host, removes the gadget and closes all devices.
    ///
    /// Every sink receives the configured number of all-zero reports first.
    /// Failures to write them are logged and ignored.
    /// An error removing the gadget is returned after the devices have been closed.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state(SessionState::Running)?;
        self.state = SessionState::Stopping;
        log::info!("stopping session");

        self.engine.shutdown(self.options.release_reports, self.options.release_timeout);

        let res = self.gadget.stop();
        if let Err(err) = &res {
            log::warn!("gadget stop failed: {err}");
        }

        for mut events in self.event_devices.drain(..) {
            events.close();
        }
        self.engine.close();

        self.state = SessionState::Closed;
        log::info!("session closed");
        res
    }
}

impl<G, Q> Drop for DeviceSession<G, Q> {
    fn drop(&mut self) {
        if self.state == SessionState::Running {
            log::warn!("session dropped while running");
        }
    }
}
