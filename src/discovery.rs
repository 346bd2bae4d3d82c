//! Discovery of HID source devices, their sinks and their input event devices.

use std::{
    fs, io,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{descriptor, descriptor::ReportLength, Error, Result};

/// Prefix of HID raw device nodes.
pub const SOURCE_PREFIX: &str = "hidraw";

/// Prefix of HID gadget device nodes.
pub const SINK_PREFIX: &str = "hidg";

/// Prefix of input event device nodes.
pub const EVENT_PREFIX: &str = "event";

/// Numeric suffix of a device node name with the specified prefix.
///
/// Returns `None` if the name has a different prefix or no numeric suffix.
pub fn node_number(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()
}

/// Directory entries whose names carry the specified prefix and a numeric suffix, sorted by that suffix.
fn numbered_entries(dir: &Path, prefix: &str) -> io::Result<Vec<(u32, String)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(name) = entry.file_name().into_string() else { continue };
        if let Some(n) = node_number(&name, prefix) {
            entries.push((n, name));
        }
    }
    entries.sort();
    Ok(entries)
}

/// Root directories device discovery operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRoots {
    /// Mount point of sysfs.
    pub sysfs: PathBuf,
    /// Device node directory.
    pub dev: PathBuf,
}

impl Default for DiscoveryRoots {
    fn default() -> Self {
        Self { sysfs: "/sys".into(), dev: "/dev".into() }
    }
}

impl DiscoveryRoots {
    /// Sets the sysfs root.
    pub fn with_sysfs(mut self, sysfs: impl Into<PathBuf>) -> Self {
        self.sysfs = sysfs.into();
        self
    }

    /// Sets the device node root.
    pub fn with_dev(mut self, dev: impl Into<PathBuf>) -> Self {
        self.dev = dev.into();
        self
    }

    fn hidraw_class(&self) -> PathBuf {
        self.sysfs.join("class").join(SOURCE_PREFIX)
    }

    /// sysfs device directory of a source device.
    fn source_sys_dir(&self, source: &Path) -> Result<PathBuf> {
        match file_name(source) {
            Some(name) if node_number(name, SOURCE_PREFIX).is_some() => {
                Ok(self.hidraw_class().join(name).join("device"))
            }
            _ => Err(Error::device(source, io::Error::new(ErrorKind::InvalidInput, "not a hidraw device"))),
        }
    }

    /// All HID raw devices, ordered by their number.
    ///
    /// An empty list is returned if the hidraw device class is not present.
    pub fn list_source_devices(&self) -> Result<Vec<PathBuf>> {
        let class = self.hidraw_class();
        let entries = match numbered_entries(&class, SOURCE_PREFIX) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("{} not present", class.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(Error::device(class, err)),
        };

        Ok(entries.into_iter().map(|(_, name)| self.dev.join(name)).collect())
    }

    /// Path of the report descriptor of a source device in sysfs.
    pub fn report_descriptor_path(&self, source: &Path) -> Result<PathBuf> {
        Ok(self.source_sys_dir(source)?.join("report_descriptor"))
    }

    /// Reads the report descriptor of a source device.
    pub fn report_descriptor(&self, source: &Path) -> Result<Vec<u8>> {
        let path = self.report_descriptor_path(source)?;
        fs::read(&path).map_err(|err| Error::device(path, err))
    }

    /// Computes the report length of a source device from its report descriptor.
    pub fn report_length(&self, source: &Path) -> Result<ReportLength> {
        descriptor::report_length(&self.report_descriptor(source)?)
    }

    /// Input event devices belonging to a source device.
    ///
    /// Event nodes are searched in the `input/inputN` and `inputN` subdirectories
    /// of the HID device in sysfs.
    pub fn resolve_event_sources(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let device_dir = self.source_sys_dir(source)?;
        let entries = fs::read_dir(&device_dir).map_err(|err| Error::device(&device_dir, err))?;

        let mut input_dirs = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(name) = entry.file_name().into_string() else { continue };
            if !path.is_dir() {
                continue;
            }

            if name == "input" {
                let Ok(subs) = fs::read_dir(&path) else { continue };
                for sub in subs.flatten() {
                    let sub_path = sub.path();
                    if sub.file_name().to_string_lossy().starts_with("input") && sub_path.is_dir() {
                        input_dirs.push(sub_path);
                    }
                }
            } else if name.starts_with("input") {
                input_dirs.push(path);
            }
        }

        let mut events = Vec::new();
        for dir in input_dirs {
            match numbered_entries(&dir, EVENT_PREFIX) {
                Ok(entries) => events.extend(entries),
                Err(err) => log::debug!("cannot read {}: {err}", dir.display()),
            }
        }
        events.sort();
        events.dedup();

        let input_dir = self.dev.join("input");
        Ok(events.into_iter().map(|(_, name)| input_dir.join(name)).collect())
    }

    /// Keyboard event devices belonging to a source device.
    ///
    /// These are the event devices linked from `input/by-id` by a name containing `-kbd`.
    pub fn resolve_keyboard_event_sources(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let events = self.resolve_event_sources(source)?;
        if events.is_empty() {
            return Ok(events);
        }

        let by_id = self.dev.join("input").join("by-id");
        let links = match fs::read_dir(&by_id) {
            Ok(links) => links,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::device(by_id, err)),
        };

        let mut keyboards = Vec::new();
        for link in links.flatten() {
            if !link.file_name().to_string_lossy().contains("-kbd") {
                continue;
            }
            let Ok(target) = fs::canonicalize(link.path()) else { continue };
            for event in &events {
                if fs::canonicalize(event).is_ok_and(|event| event == target) && !keyboards.contains(event) {
                    keyboards.push(event.clone());
                }
            }
        }
        keyboards.sort_by_key(|path| file_name(path).and_then(|name| node_number(name, EVENT_PREFIX)));

        Ok(keyboards)
    }

    /// HID gadget device with the same number as a source device.
    pub fn sink_for(&self, source: &Path) -> Option<PathBuf> {
        let n = node_number(file_name(source)?, SOURCE_PREFIX)?;
        Some(self.dev.join(format!("{SINK_PREFIX}{n}")))
    }
}
