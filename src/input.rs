//! Linux input events and modifier tracking.

use byteorder::{NativeEndian, ReadBytesExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Cursor,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::keymap::{KeySym, Keymap};

/// Size of `struct input_event` on 64-bit platforms.
pub const EVENT_SIZE: usize = 24;

/// Event type of key events.
pub const EV_KEY: u16 = 0x01;

/// Key codes of modifier keys from `linux/input-event-codes.h`.
pub mod code {
    /// Left control.
    pub const LEFTCTRL: u16 = 29;
    /// Left shift.
    pub const LEFTSHIFT: u16 = 42;
    /// Right shift.
    pub const RIGHTSHIFT: u16 = 54;
    /// Left alt.
    pub const LEFTALT: u16 = 56;
    /// Right control.
    pub const RIGHTCTRL: u16 = 97;
    /// Right alt, also known as AltGr.
    pub const RIGHTALT: u16 = 100;
}

/// Raw Linux input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Time of the event.
    pub time: SystemTime,
    /// Event type.
    pub kind: u16,
    /// Event code.
    pub code: u16,
    /// Event value.
    pub value: i32,
}

impl InputEvent {
    /// Creates a key event at the current time.
    pub fn key(code: u16, value: i32) -> Self {
        Self { time: SystemTime::now(), kind: EV_KEY, code, value }
    }

    /// Decodes one event from exactly [`EVENT_SIZE`] bytes.
    pub fn parse(data: &[u8; EVENT_SIZE]) -> Self {
        let mut cur = Cursor::new(&data[..]);
        // Reading from an array of the exact size cannot fail.
        let sec = cur.read_i64::<NativeEndian>().unwrap_or_default();
        let usec = cur.read_i64::<NativeEndian>().unwrap_or_default();
        let kind = cur.read_u16::<NativeEndian>().unwrap_or_default();
        let code = cur.read_u16::<NativeEndian>().unwrap_or_default();
        let value = cur.read_i32::<NativeEndian>().unwrap_or_default();

        let since_epoch = Duration::from_secs(sec.max(0) as u64) + Duration::from_micros(usec.clamp(0, 999_999) as u64);
        Self { time: SystemTime::UNIX_EPOCH + since_epoch, kind, code, value }
    }

    /// Encodes this event in the kernel's binary layout.
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let since_epoch = self.time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        let mut data = [0; EVENT_SIZE];
        data[0..8].copy_from_slice(&(since_epoch.as_secs() as i64).to_ne_bytes());
        data[8..16].copy_from_slice(&i64::from(since_epoch.subsec_micros()).to_ne_bytes());
        data[16..18].copy_from_slice(&self.kind.to_ne_bytes());
        data[18..20].copy_from_slice(&self.code.to_ne_bytes());
        data[20..24].copy_from_slice(&self.value.to_ne_bytes());
        data
    }

    /// Decodes all complete events contained in a buffer.
    ///
    /// A trailing partial event is ignored.
    pub fn parse_all(buf: &[u8]) -> impl Iterator<Item = Self> + '_ {
        buf.chunks_exact(EVENT_SIZE).filter_map(|chunk| chunk.try_into().ok()).map(Self::parse)
    }
}

/// Key action derived from the value of a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum KeyAction {
    /// Key was released.
    Up,
    /// Key was pressed.
    Down,
    /// Key is held and auto-repeating.
    Hold,
}

impl KeyAction {
    /// Action of a key event value.
    pub fn from_value(value: i32) -> Self {
        match value {
            0 => Self::Up,
            1 => Self::Down,
            _ => Self::Hold,
        }
    }
}

/// State of the modifier keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Modifiers {
    /// Left or right shift held.
    pub shift: bool,
    /// Left or right control held.
    pub ctrl: bool,
    /// Left alt held.
    pub alt: bool,
    /// Right alt (AltGr) held.
    pub altgr: bool,
}

impl Modifiers {
    /// Index of the keymap layer selected by these modifiers.
    ///
    /// Shift sets bit 0, AltGr bit 1, control bit 2 and alt bit 3.
    pub fn layer(&self) -> usize {
        usize::from(self.shift)
            | usize::from(self.altgr) << 1
            | usize::from(self.ctrl) << 2
            | usize::from(self.alt) << 3
    }
}

/// Key event resolved to a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Time of the event.
    pub time: SystemTime,
    /// Resolved key symbol.
    pub sym: KeySym,
    /// Key action.
    pub action: KeyAction,
    /// Symbols of all keys held after this event.
    pub held: BTreeSet<KeySym>,
}

/// Tracks modifier and held key state of a group of event devices and
/// resolves key codes to symbols through a layered keymap.
#[derive(Debug, Clone)]
pub struct ModifierTracker {
    keymap: Arc<Keymap>,
    /// Held keys by code with the symbol they resolved to when pressed.
    held: BTreeMap<u16, KeySym>,
}

impl ModifierTracker {
    /// Creates a tracker using the specified keymap.
    pub fn new(keymap: Arc<Keymap>) -> Self {
        Self { keymap, held: BTreeMap::new() }
    }

    /// Current modifier state.
    pub fn modifiers(&self) -> Modifiers {
        let held = |code: u16| self.held.contains_key(&code);
        Modifiers {
            shift: held(code::LEFTSHIFT) || held(code::RIGHTSHIFT),
            ctrl: held(code::LEFTCTRL) || held(code::RIGHTCTRL),
            alt: held(code::LEFTALT),
            altgr: held(code::RIGHTALT),
        }
    }

    /// Symbols of all currently held keys.
    pub fn held(&self) -> BTreeSet<KeySym> {
        self.held.values().cloned().collect()
    }

    /// Whether all of the specified symbols are currently held.
    pub fn keycombo(&self, syms: &[KeySym]) -> bool {
        syms.iter().all(|sym| self.held.values().any(|held| held == sym))
    }

    /// Processes an input event.
    ///
    /// Returns a key event for events of type [`EV_KEY`] and `None` for all other events.
    pub fn process(&mut self, event: &InputEvent) -> Option<KeyEvent> {
        if event.kind != EV_KEY {
            return None;
        }

        let action = KeyAction::from_value(event.value);
        let sym = match action {
            KeyAction::Up => self.held.remove(&event.code).unwrap_or_else(|| self.resolve(event.code)),
            KeyAction::Down => {
                let sym = self.resolve(event.code);
                self.held.insert(event.code, sym.clone());
                sym
            }
            // A repeat of a key pressed before tracking started marks it as held.
            KeyAction::Hold => match self.held.get(&event.code) {
                Some(sym) => sym.clone(),
                None => {
                    let sym = self.resolve(event.code);
                    self.held.insert(event.code, sym.clone());
                    sym
                }
            },
        };

        log::trace!("key {} ({}) {action}", sym, event.code);
        Some(KeyEvent { time: event.time, sym, action, held: self.held() })
    }

    /// Resolves a code using the keymap layer selected by the current modifiers.
    pub fn resolve(&self, code: u16) -> KeySym {
        self.keymap.resolve(self.modifiers().layer(), code)
    }
}
