//! Common test functions.
#![allow(dead_code)]

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    os::unix::{ffi::OsStrExt, fs::OpenOptionsExt},
    path::{Path, PathBuf},
    sync::Once,
    thread::sleep,
    time::{Duration, Instant},
};

use tempfile::TempDir;
use usb_hid_relay::discovery::DiscoveryRoots;

/// Boot keyboard report descriptor, 8 byte reports.
pub const KEYBOARD_DESC: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xa1, 0x01, // Generic Desktop, Keyboard, Application
    0x05, 0x07, 0x19, 0xe0, 0x29, 0xe7, 0x15, 0x00, 0x25, 0x01, //
    0x75, 0x01, 0x95, 0x08, 0x81, 0x02, // 8 modifier bits
    0x95, 0x01, 0x75, 0x08, 0x81, 0x01, // reserved byte
    0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0x65, //
    0x05, 0x07, 0x19, 0x00, 0x29, 0x65, 0x81, 0x00, // 6 keys
    0xc0,
];

/// Mouse report descriptor with report id, 4 byte reports.
pub const MOUSE_DESC: &[u8] = &[
    0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, // Generic Desktop, Mouse, Application
    0x85, 0x02, // Report ID (2)
    0x75, 0x01, 0x95, 0x03, 0x81, 0x02, // 3 buttons
    0x75, 0x05, 0x95, 0x01, 0x81, 0x01, // padding
    0x75, 0x08, 0x95, 0x02, 0x81, 0x06, // x, y
    0xc0,
];

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Fake sysfs and /dev tree in a temporary directory.
pub struct FakeTree {
    dir: TempDir,
}

impl FakeTree {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("cannot create temporary directory");
        fs::create_dir_all(dir.path().join("sys/class")).unwrap();
        fs::create_dir_all(dir.path().join("dev/input")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn sysfs(&self) -> PathBuf {
        self.path().join("sys")
    }

    pub fn dev(&self) -> PathBuf {
        self.path().join("dev")
    }

    pub fn roots(&self) -> DiscoveryRoots {
        DiscoveryRoots::default().with_sysfs(self.sysfs()).with_dev(self.dev())
    }

    /// Adds `hidrawN` with the specified report descriptor.
    ///
    /// The device node is a FIFO.
    pub fn add_hidraw(&self, n: u32, desc: &[u8]) -> PathBuf {
        let device_dir = self.sysfs().join(format!("class/hidraw/hidraw{n}/device"));
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(device_dir.join("report_descriptor"), desc).unwrap();

        let node = self.dev().join(format!("hidraw{n}"));
        mkfifo(&node);
        node
    }

    /// Adds the FIFO `hidgN`.
    pub fn add_hidg(&self, n: u32) -> PathBuf {
        let node = self.dev().join(format!("hidg{n}"));
        mkfifo(&node);
        node
    }

    /// Adds the event device `eventM` below `input/inputI` of `hidrawN`.
    pub fn add_event(&self, hidraw: u32, input: u32, event: u32, by_id: Option<&str>) -> PathBuf {
        let input_dir =
            self.sysfs().join(format!("class/hidraw/hidraw{hidraw}/device/input/input{input}/event{event}"));
        fs::create_dir_all(input_dir).unwrap();

        let node = self.dev().join(format!("input/event{event}"));
        File::create(&node).unwrap();

        if let Some(name) = by_id {
            let by_id_dir = self.dev().join("input/by-id");
            fs::create_dir_all(&by_id_dir).unwrap();
            std::os::unix::fs::symlink(format!("../event{event}"), by_id_dir.join(name)).unwrap();
        }
        node
    }

    /// Adds a USB device controller in `not attached` state.
    pub fn add_udc(&self, name: &str) {
        let dir = self.sysfs().join("class/udc").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("state"), "not attached\n").unwrap();
    }
}

pub fn mkfifo(path: &Path) {
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    let res = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    assert_eq!(res, 0, "cannot create FIFO {}", path.display());
}

/// Opens the test side of a FIFO for reading and writing.
///
/// Keeping both ends open lets the relay open the FIFO in either direction without blocking.
pub fn open_fifo(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .unwrap_or_else(|err| panic!("cannot open {}: {err}", path.display()))
}

/// Reads exactly `len` bytes from a non-blocking file, failing after a timeout.
pub fn read_exact_timeout(file: &mut File, len: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut data = vec![0; len];
    let mut pos = 0;
    while pos < len {
        match file.read(&mut data[pos..]) {
            Ok(n) => pos += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timeout after reading {pos} of {len} bytes");
                sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("read failed: {err}"),
        }
    }
    data
}

/// Whether no data arrives on a non-blocking file within `wait`.
pub fn is_silent(file: &mut File, wait: Duration) -> bool {
    sleep(wait);
    let mut buf = [0; 64];
    matches!(file.read(&mut buf), Err(err) if err.kind() == ErrorKind::WouldBlock)
}

pub fn write_report(file: &mut File, report: &[u8]) {
    file.write_all(report).expect("cannot write report");
}

/// Number of file descriptors of this process referring to `path`.
pub fn open_fd_count(path: &Path) -> usize {
    let path = fs::canonicalize(path).unwrap();
    fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| fs::read_link(entry.ok()?.path()).ok())
        .filter(|target| *target == path)
        .count()
}
