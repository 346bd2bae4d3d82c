//! Keymaps resolving Linux key codes to key symbols.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{Error, Result};

/// Maximum number of keymap layers, one per combination of shift, AltGr, ctrl and alt.
pub const MAX_LAYERS: usize = 16;

/// Key symbol, e.g. `a`, `A`, `@` or `enter`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeySym(Arc<str>);

impl KeySym {
    /// Creates a key symbol.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().into())
    }

    /// Generic symbol `KEY_<code>` used for codes absent from the keymap.
    pub fn generic(code: u16) -> Self {
        Self::new(format!("KEY_{code}"))
    }

    /// Symbol name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeySym {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeySym {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl PartialEq<str> for KeySym {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for KeySym {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

/// One keymap layer.
pub type Layer = HashMap<u16, KeySym>;

/// Keymap consisting of up to [`MAX_LAYERS`] layers.
///
/// Layer `n` is active when the modifiers encoded in `n` are held,
/// see [`Modifiers::layer`](crate::input::Modifiers::layer).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keymap {
    layers: Vec<Layer>,
}

impl Keymap {
    /// Creates an empty keymap, resolving every code to its generic symbol.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a keymap from layers.
    ///
    /// Fails if more than [`MAX_LAYERS`] layers are given.
    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        if layers.len() > MAX_LAYERS {
            return Err(Error::InvalidKeymap(format!(
                "{} layers given but at most {MAX_LAYERS} are supported",
                layers.len()
            )));
        }
        Ok(Self { layers })
    }

    /// Sets the symbol of a code in a layer, adding empty layers as necessary.
    ///
    /// Fails if `layer` is not below [`MAX_LAYERS`].
    pub fn set(&mut self, layer: usize, code: u16, sym: impl Into<KeySym>) -> Result<()> {
        if layer >= MAX_LAYERS {
            return Err(Error::InvalidKeymap(format!("layer {layer} out of range, at most {MAX_LAYERS} layers")));
        }
        self.insert(layer, code, sym.into());
        Ok(())
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, layer: usize, code: u16, sym: impl Into<KeySym>) -> Result<Self> {
        self.set(layer, code, sym)?;
        Ok(self)
    }

    fn insert(&mut self, layer: usize, code: u16, sym: KeySym) {
        if self.layers.len() <= layer {
            self.layers.resize_with(layer + 1, Layer::new);
        }
        self.layers[layer].insert(code, sym);
    }

    /// Adds all symbols of `other`, replacing symbols already present for the same code and layer.
    pub fn overlay(&mut self, other: &Keymap) {
        for (layer, symbols) in other.layers.iter().enumerate() {
            for (code, sym) in symbols {
                self.insert(layer, *code, sym.clone());
            }
        }
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the keymap has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Looks up a code in a single layer.
    pub fn get(&self, layer: usize, code: u16) -> Option<&KeySym> {
        self.layers.get(layer)?.get(&code)
    }

    /// Resolves a code in the given layer.
    ///
    /// Falls back to layer 0 and then to the generic symbol, so resolution never fails.
    pub fn resolve(&self, layer: usize, code: u16) -> KeySym {
        self.get(layer, code).or_else(|| self.get(0, code)).cloned().unwrap_or_else(|| KeySym::generic(code))
    }

    /// US keyboard layout with base and shift layers.
    ///
    /// Printable keys map to the characters they produce, all other keys to their
    /// Linux key name.
    pub fn us() -> Self {
        let mut keymap = Self::new();
        for &(code, name) in KEY_NAMES {
            keymap.insert(0, code, name.into());
        }
        for &(code, base, shifted) in US_PRINTABLE {
            keymap.insert(0, code, base.into());
            keymap.insert(1, code, shifted.into());
        }
        keymap
    }
}

/// Linux name of a key code, lower-case and without the `KEY_` prefix.
pub fn key_name(code: u16) -> Option<&'static str> {
    KEY_NAMES.iter().find(|(c, _)| *c == code).map(|(_, name)| *name)
}

/// Linux key code of a key name, the inverse of [`key_name`].
pub fn key_code(name: &str) -> Option<u16> {
    KEY_NAMES.iter().find(|(_, n)| *n == name).map(|(c, _)| *c)
}

/// Names of non-printing keys from `linux/input-event-codes.h`.
const KEY_NAMES: &[(u16, &str)] = &[
    (1, "esc"),
    (14, "backspace"),
    (15, "tab"),
    (28, "enter"),
    (29, "leftctrl"),
    (42, "leftshift"),
    (54, "rightshift"),
    (56, "leftalt"),
    (57, "space"),
    (58, "capslock"),
    (59, "f1"),
    (60, "f2"),
    (61, "f3"),
    (62, "f4"),
    (63, "f5"),
    (64, "f6"),
    (65, "f7"),
    (66, "f8"),
    (67, "f9"),
    (68, "f10"),
    (69, "numlock"),
    (70, "scrolllock"),
    (87, "f11"),
    (88, "f12"),
    (96, "kpenter"),
    (97, "rightctrl"),
    (99, "sysrq"),
    (100, "rightalt"),
    (102, "home"),
    (103, "up"),
    (104, "pageup"),
    (105, "left"),
    (106, "right"),
    (107, "end"),
    (108, "down"),
    (109, "pagedown"),
    (110, "insert"),
    (111, "delete"),
    (113, "mute"),
    (114, "volumedown"),
    (115, "volumeup"),
    (116, "power"),
    (119, "pause"),
    (125, "leftmeta"),
    (126, "rightmeta"),
    (127, "compose"),
];

/// Printable keys of the US layout: code, base symbol, shifted symbol.
const US_PRINTABLE: &[(u16, &str, &str)] = &[
    (2, "1", "!"),
    (3, "2", "@"),
    (4, "3", "#"),
    (5, "4", "$"),
    (6, "5", "%"),
    (7, "6", "^"),
    (8, "7", "&"),
    (9, "8", "*"),
    (10, "9", "("),
    (11, "0", ")"),
    (12, "-", "_"),
    (13, "=", "+"),
    (16, "q", "Q"),
    (17, "w", "W"),
    (18, "e", "E"),
    (19, "r", "R"),
    (20, "t", "T"),
    (21, "y", "Y"),
    (22, "u", "U"),
    (23, "i", "I"),
    (24, "o", "O"),
    (25, "p", "P"),
    (26, "[", "{"),
    (27, "]", "}"),
    (30, "a", "A"),
    (31, "s", "S"),
    (32, "d", "D"),
    (33, "f", "F"),
    (34, "g", "G"),
    (35, "h", "H"),
    (36, "j", "J"),
    (37, "k", "K"),
    (38, "l", "L"),
    (39, ";", ":"),
    (40, "'", "\""),
    (41, "`", "~"),
    (43, "\\", "|"),
    (44, "z", "Z"),
    (45, "x", "X"),
    (46, "c", "C"),
    (47, "v", "V"),
    (48, "b", "B"),
    (49, "n", "N"),
    (50, "m", "M"),
    (51, ",", "<"),
    (52, ".", ">"),
    (53, "/", "?"),
];
