//! Hotkeys intercepting raw HID reports.

use std::fmt;

use crate::{Error, Result};

/// Action executed when a hotkey is triggered.
pub type Action = Box<dyn FnMut() + Send>;

/// Hotkey definition: an exact report pattern and the action it triggers.
pub struct Hotkey {
    pattern: Vec<u8>,
    action: Option<Action>,
}

impl fmt::Debug for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hotkey").field("pattern", &self.pattern).field("has_action", &self.action.is_some()).finish()
    }
}

impl Hotkey {
    /// Creates a hotkey matching the specified report exactly.
    ///
    /// An action must be set before the hotkey can be registered.
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        Self { pattern: pattern.into(), action: None }
    }

    /// Sets the action.
    pub fn with_action(mut self, action: impl FnMut() + Send + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }

    /// Report pattern.
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }
}

/// Registered hotkey.
struct Entry {
    pattern: Vec<u8>,
    action: Action,
}

/// Registry of hotkeys consulted for every forwarded report.
///
/// Matching is exact equality of the whole report. If several hotkeys share a
/// pattern, all of them are triggered in registration order.
#[derive(Default)]
pub struct HotkeyRegistry {
    entries: Vec<Entry>,
}

impl fmt::Debug for HotkeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| &e.pattern)).finish()
    }
}

impl HotkeyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hotkey.
    ///
    /// Fails if the hotkey has no action or an empty pattern.
    pub fn register(&mut self, hotkey: Hotkey) -> Result<()> {
        let Hotkey { pattern, action } = hotkey;
        let Some(action) = action else {
            return Err(Error::HotkeyRegistration { pattern });
        };
        if pattern.is_empty() {
            return Err(Error::HotkeyRegistration { pattern });
        }

        log::debug!("registered hotkey {pattern:02x?}");
        self.entries.push(Entry { pattern, action });
        Ok(())
    }

    /// Registers an action for the specified report pattern.
    pub fn on_report(&mut self, pattern: impl Into<Vec<u8>>, action: impl FnMut() + Send + 'static) -> Result<()> {
        self.register(Hotkey::new(pattern).with_action(action))
    }

    /// Number of registered hotkeys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no hotkeys are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Triggers all hotkeys matching the report.
    ///
    /// Returns whether any hotkey matched, in which case the report must not be forwarded.
    pub fn dispatch(&mut self, report: &[u8]) -> bool {
        let mut triggered = false;
        for entry in self.entries.iter_mut().filter(|e| e.pattern == report) {
            log::debug!("hotkey {report:02x?} triggered");
            (entry.action)();
            triggered = true;
        }
        triggered
    }
}

bitflags::bitflags! {
    /// Modifier byte of a boot keyboard report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyModifiers: u8 {
        /// Left control.
        const LEFT_CTRL = 0x01;
        /// Left shift.
        const LEFT_SHIFT = 0x02;
        /// Left alt.
        const LEFT_ALT = 0x04;
        /// Left GUI (meta).
        const LEFT_GUI = 0x08;
        /// Right control.
        const RIGHT_CTRL = 0x10;
        /// Right shift.
        const RIGHT_SHIFT = 0x20;
        /// Right alt.
        const RIGHT_ALT = 0x40;
        /// Right GUI (meta).
        const RIGHT_GUI = 0x80;
    }
}

/// Maximum number of simultaneous keys in a boot keyboard report.
pub const MAX_REPORT_KEYS: usize = 6;

/// Boot protocol keyboard report, useful for building hotkey patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyboardReport {
    /// Report id prefix, if the keyboard uses report ids.
    pub report_id: Option<u8>,
    /// Modifier keys.
    pub modifiers: KeyModifiers,
    /// HID usage ids of pressed keys.
    pub keys: [u8; MAX_REPORT_KEYS],
}

impl KeyboardReport {
    /// Creates a report with the specified modifiers and keys.
    ///
    /// Fails if more than [`MAX_REPORT_KEYS`] keys are given.
    pub fn new(modifiers: KeyModifiers, keys: &[u8]) -> Result<Self> {
        if keys.len() > MAX_REPORT_KEYS {
            return Err(Error::HotkeyRegistration { pattern: keys.to_vec() });
        }

        let mut report = Self { report_id: None, modifiers, keys: [0; MAX_REPORT_KEYS] };
        report.keys[..keys.len()].copy_from_slice(keys);
        Ok(report)
    }

    /// Sets the report id prefix.
    pub fn with_report_id(mut self, report_id: u8) -> Self {
        self.report_id = Some(report_id);
        self
    }

    /// Raw report bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(9);
        data.extend(self.report_id);
        data.push(self.modifiers.bits());
        data.push(0);
        data.extend(self.keys);
        data
    }
}

impl From<KeyboardReport> for Hotkey {
    fn from(report: KeyboardReport) -> Self {
        Hotkey::new(report.to_bytes())
    }
}
