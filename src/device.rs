//! Character devices: report sources, report sinks and input event devices.

use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{Error, Result};

/// `EVIOCGRAB` ioctl request: `_IOW('E', 0x90, int)`.
pub const EVIOCGRAB: u32 = 0x4004_4590;

/// Open character device in non-blocking mode.
///
/// Cloning shares the underlying file descriptor.
#[derive(Debug, Clone)]
pub struct Device {
    path: PathBuf,
    fd: Arc<OwnedFd>,
}

impl Device {
    /// Opens a device for reading, e.g. `/dev/hidraw0`.
    pub fn open_source(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), OpenOptions::new().read(true))
    }

    /// Opens a device for writing, e.g. `/dev/hidg0`.
    pub fn open_sink(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), OpenOptions::new().write(true))
    }

    fn open(path: &Path, opts: &mut OpenOptions) -> Result<Self> {
        let file: File =
            opts.custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK).open(path).map_err(|err| Error::device(path, err))?;
        Self::from_fd(path, file.into())
    }

    /// Wraps an already opened file and switches it to non-blocking mode.
    ///
    /// `path` is used for error reporting only.
    pub fn from_fd(path: impl Into<PathBuf>, fd: OwnedFd) -> Result<Self> {
        let path = path.into();
        rustix::io::ioctl_fionbio(&fd, true).map_err(|err| Error::device(&path, err.into()))?;
        log::debug!("opened device {}", path.display());
        Ok(Self { path, fd: Arc::new(fd) })
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared file descriptor.
    pub fn fd(&self) -> &Arc<OwnedFd> {
        &self.fd
    }
}

impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Grabs or releases an input event device for exclusive access.
pub fn set_grab(fd: impl AsFd, grab: bool) -> io::Result<()> {
    let res = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), EVIOCGRAB as _, libc::c_int::from(grab)) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Input event device (`/dev/input/eventN`), grabbed while open.
///
/// The grab is released when the device is closed or dropped.
#[derive(Debug)]
pub struct EventDevice {
    device: Device,
    grabbed: bool,
}

impl EventDevice {
    /// Opens and grabs an event device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let device = Device::open_source(path)?;
        set_grab(&device, true).map_err(|err| Error::device(device.path(), err))?;
        log::debug!("grabbed {}", device.path().display());
        Ok(Self { device, grabbed: true })
    }

    /// Underlying device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Releases the grab.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn close(&mut self) {
        if !self.grabbed {
            return;
        }
        self.grabbed = false;

        match set_grab(&self.device, false) {
            Ok(()) => log::debug!("released {}", self.device.path().display()),
            Err(err) => log::warn!("cannot release {}: {err}", self.device.path().display()),
        }
    }
}

impl Drop for EventDevice {
    fn drop(&mut self) {
        self.close();
    }
}
