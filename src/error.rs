//! Error type.

use std::{io, path::PathBuf};

/// Error raised while setting up or running a relay session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The HID report descriptor could not be parsed.
    #[error("malformed report descriptor: {0}")]
    MalformedDescriptor(String),

    /// A read or write on a device failed.
    #[error("I/O error on {}: {source}", device.display())]
    DeviceIo {
        /// Device path.
        device: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Setting up or tearing down the USB gadget failed.
    #[error("USB gadget lifecycle failed: {0}")]
    GadgetLifecycle(#[source] io::Error),

    /// A hotkey was registered without an action.
    #[error("hotkey for pattern {pattern:02x?} has no action")]
    HotkeyRegistration {
        /// Report pattern of the rejected hotkey.
        pattern: Vec<u8>,
    },

    /// A keymap could not be built.
    #[error("invalid keymap: {0}")]
    InvalidKeymap(String),

    /// An operation was invoked in the wrong session state.
    #[error("operation not allowed in session state {0}")]
    InvalidState(crate::SessionState),

    /// Other I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps an I/O error that occurred on the specified device.
    pub fn device(device: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DeviceIo { device: device.into(), source }
    }
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
