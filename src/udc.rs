//! USB device controller (UDC).

use std::{
    ffi::OsStr,
    fmt, fs,
    io::{Error, ErrorKind, Result},
    path::{Path, PathBuf},
};

/// USB device controller (UDC).
///
/// Call [`udcs`] to obtain the controllers available on the system.
#[derive(Clone)]
pub struct Udc {
    dir: PathBuf,
}

impl fmt::Debug for Udc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Udc").field("name", &self.name()).finish()
    }
}

impl Udc {
    /// The name of the USB device controller.
    pub fn name(&self) -> &OsStr {
        self.dir.file_name().unwrap_or_default()
    }

    /// Connection state as reported in sysfs.
    ///
    /// A state the controller driver reports but that is not known here
    /// maps to [`UdcState::Unknown`].
    pub fn state(&self) -> Result<UdcState> {
        Ok(fs::read_to_string(self.dir.join("state"))?.trim().parse().unwrap_or_default())
    }
}

/// Connection state of a UDC towards the USB host.
///
/// The relay's gadget is usable by the host once the controller is [configured](UdcState::Configured).
#[derive(
    Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[non_exhaustive]
pub enum UdcState {
    /// Not attached.
    #[strum(serialize = "not attached")]
    NotAttached,
    /// Attached.
    #[strum(serialize = "attached")]
    Attached,
    /// Powered.
    #[strum(serialize = "powered")]
    Powered,
    /// Default.
    #[strum(serialize = "default")]
    Default,
    /// Addressed.
    #[strum(serialize = "addressed")]
    Addressed,
    /// Configured.
    #[strum(serialize = "configured")]
    Configured,
    /// Suspended.
    #[strum(serialize = "suspended")]
    Suspended,
    /// Unknown state.
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Gets the USB device controllers (UDCs) registered below the specified sysfs root.
pub fn udcs(sysfs: &Path) -> Result<Vec<Udc>> {
    let class_dir = sysfs.join("class");
    if !class_dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound, "sysfs is not available"));
    }

    let udc_dir = class_dir.join("udc");
    if !udc_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut udcs = Vec::new();
    for entry in fs::read_dir(&udc_dir)? {
        let Ok(entry) = entry else { continue };
        udcs.push(Udc { dir: entry.path() });
    }

    Ok(udcs)
}

/// The default USB device controller (UDC) by alphabetical sorting.
///
/// A not found error is returned if no UDC is present.
pub fn default_udc(sysfs: &Path) -> Result<Udc> {
    let mut udcs = udcs(sysfs)?;
    udcs.sort_by_key(|udc| udc.name().to_os_string());
    udcs.into_iter()
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "no USB device controller (UDC) available"))
}
