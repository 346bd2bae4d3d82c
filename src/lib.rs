//! This library forwards HID reports from local input devices to a USB host,
//! so that a Linux device with a USB device controller (UDC) acts as a
//! transparent **HID passthrough**.
//!
//! Every `hidraw` source device is mirrored by a HID function of a USB gadget.
//! Reports read from a source are written unchanged to its `hidg` sink,
//! unless a registered hotkey intercepts them.
//!
//! ### Requirements
//!
//! A USB device controller (UDC) supported by Linux is required.
//!
//! The Linux kernel configuration options `CONFIG_USB_GADGET`, `CONFIG_USB_CONFIGFS`
//! and `CONFIG_USB_CONFIGFS_F_HID` need to be enabled.
//!
//! root permissions are required to configure USB gadgets and
//! the `configfs` filesystem needs to be mounted.
//!
//! ### Usage
//!
//! Create a [`DeviceSession`] from a [`ConfigfsGadget`] and a [`PollQueue`](engine::PollQueue),
//! call [`DeviceSession::start`] and then [`DeviceSession::run`] until a stop is
//! requested through its [`StopHandle`].
//! When the session stops, all keys are released on the host and the gadget is removed.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(not(target_os = "linux"))]
compile_error!("usb_hid_relay only supports Linux");

use proc_mounts::MountIter;
use std::{
    ffi::OsStr,
    io::{Error as IoError, ErrorKind, Result as IoResult},
    os::unix::prelude::OsStrExt,
    path::PathBuf,
    process::Command,
};

pub mod descriptor;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod hotkey;
pub mod input;
pub mod keymap;

mod error;
pub use error::*;

mod gadget;
pub use gadget::*;

mod session;
pub use session::*;

mod udc;
pub use udc::*;

/// 8-bit value to hexadecimal notation.
fn hex_u8(value: u8) -> String {
    format!("0x{:02x}", value)
}

/// 16-bit value to hexadecimal notation.
fn hex_u16(value: u16) -> String {
    format!("0x{:04x}", value)
}

/// Returns where configfs is mounted.
fn configfs_dir() -> IoResult<PathBuf> {
    for mount in MountIter::new()? {
        let Ok(mount) = mount else { continue };
        if mount.fstype == "configfs" {
            return Ok(mount.dest);
        }
    }

    Err(IoError::new(ErrorKind::NotFound, "configfs is not mounted"))
}

/// Trims an OsStr.
fn trim_os_str(value: &OsStr) -> &OsStr {
    let is_pad = |c: Option<&u8>| matches!(c, Some(b'\n' | b' ' | b'\0'));
    let mut value = value.as_bytes();

    while is_pad(value.first()) {
        value = &value[1..];
    }
    while is_pad(value.last()) {
        value = &value[..value.len() - 1];
    }

    OsStr::from_bytes(value)
}

/// Request a kernel module to be loaded.
fn request_module(name: impl AsRef<OsStr>) -> IoResult<()> {
    let mut res = Command::new("modprobe").arg("-q").arg(name.as_ref()).output();

    if matches!(&res, Err(err) if err.kind() == ErrorKind::NotFound) {
        res = Command::new("/sbin/modprobe").arg("-q").arg(name.as_ref()).output();
    }

    match res {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(IoError::other(format!("modprobe failed with {}", out.status))),
        Err(err) => Err(err),
    }
}
