//! USB gadget exposing one HID function per source device.
//!
//! The gadget is created through configfs. Every function copies the report descriptor
//! of its source device verbatim, so the USB host sees the same devices.

use std::{
    ffi::OsString,
    fs,
    io::{self, ErrorKind},
    os::unix::prelude::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

use crate::{
    configfs_dir, descriptor, discovery::DiscoveryRoots, hex_u16, hex_u8, request_module, trim_os_str, udc,
    Error, Result,
};

/// Default name of the gadget directory in configfs.
pub const GADGET_NAME: &str = "usb-hid-relay";

/// Language id of US English strings.
const LANG_EN_US: u16 = 0x0409;

/// Source device paired with the sink device that mirrors it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePair {
    /// HID raw device reports are read from.
    pub source: PathBuf,
    /// HID gadget device reports are written to.
    pub sink: PathBuf,
}

/// Sets up and tears down the USB gadget through which reports reach the host.
pub trait GadgetLifecycle {
    /// Creates the gadget and returns the device pairs to forward between.
    fn setup(&mut self) -> Result<Vec<DevicePair>>;

    /// Removes the gadget.
    ///
    /// Fails if the gadget does not exist.
    fn stop(&mut self) -> Result<()>;
}

/// USB vendor and product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id {
    /// Vendor id.
    pub vendor: u16,
    /// Product id.
    pub product: u16,
}

impl Id {
    /// Creates a new id.
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }

    /// Linux Foundation multifunction composite gadget.
    pub const LINUX_COMPOSITE: Self = Self::new(0x1d6b, 0x0104);
}

/// USB device description strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Strings {
    /// Manufacturer name.
    pub manufacturer: String,
    /// Product name.
    pub product: String,
    /// Serial number.
    pub serial_number: String,
}

impl Strings {
    /// Creates new USB device strings.
    pub fn new(manufacturer: impl AsRef<str>, product: impl AsRef<str>, serial_number: impl AsRef<str>) -> Self {
        Self {
            manufacturer: manufacturer.as_ref().to_string(),
            product: product.as_ref().to_string(),
            serial_number: serial_number.as_ref().to_string(),
        }
    }
}

/// Configuration of the USB gadget.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GadgetOptions {
    /// Name of the gadget directory in configfs.
    pub name: String,
    /// Vendor and product id.
    pub id: Id,
    /// Device release number in BCD.
    pub device_release: u16,
    /// USB version in BCD.
    pub usb_version: u16,
    /// Device strings in US English.
    pub strings: Strings,
    /// Description of the configuration.
    pub configuration: String,
    /// Maximum power consumption in mA.
    pub max_power_ma: u16,
    /// Name of the USB device controller to bind to.
    ///
    /// If `None`, the first controller by name is used.
    pub udc: Option<OsString>,
    /// Mount point of configfs.
    ///
    /// If `None`, it is looked up in the mount table.
    pub configfs: Option<PathBuf>,
    /// Whether to load the `libcomposite` kernel module.
    pub load_modules: bool,
}

impl Default for GadgetOptions {
    fn default() -> Self {
        Self {
            name: GADGET_NAME.to_string(),
            id: Id::LINUX_COMPOSITE,
            device_release: 0x0100,
            usb_version: 0x0200,
            strings: Strings::new("usb-hid-relay", "HID Relay", "0000000001"),
            configuration: "HID".to_string(),
            max_power_ma: 500,
            udc: None,
            configfs: None,
            load_modules: true,
        }
    }
}

impl GadgetOptions {
    /// Sets the name of the gadget directory.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets vendor and product id.
    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    /// Sets the device strings.
    pub fn with_strings(mut self, strings: Strings) -> Self {
        self.strings = strings;
        self
    }

    /// Sets the USB device controller to bind to.
    pub fn with_udc(mut self, udc: impl Into<OsString>) -> Self {
        self.udc = Some(udc.into());
        self
    }

    /// Sets the mount point of configfs.
    pub fn with_configfs(mut self, configfs: impl Into<PathBuf>) -> Self {
        self.configfs = Some(configfs.into());
        self
    }

    /// Sets whether kernel modules are loaded.
    pub fn with_load_modules(mut self, load_modules: bool) -> Self {
        self.load_modules = load_modules;
        self
    }
}

/// Writes a configfs attribute.
fn write_attr(dir: &Path, name: &str, value: impl AsRef<[u8]>) -> io::Result<()> {
    let path = dir.join(name);
    let value = value.as_ref();
    log::debug!("setting property {} to {}", path.display(), String::from_utf8_lossy(value));
    fs::write(path, value)
}

/// Gadget lifecycle backed by Linux configfs.
#[derive(Debug, Clone)]
pub struct ConfigfsGadget {
    options: GadgetOptions,
    roots: DiscoveryRoots,
}

impl ConfigfsGadget {
    /// Creates the lifecycle handler.
    ///
    /// No gadget is created until [`setup`](GadgetLifecycle::setup) is called.
    pub fn new(options: GadgetOptions, roots: DiscoveryRoots) -> Self {
        Self { options, roots }
    }

    /// Gadget options.
    pub fn options(&self) -> &GadgetOptions {
        &self.options
    }

    fn usb_gadget_dir(&self) -> io::Result<PathBuf> {
        if self.options.load_modules {
            if let Err(err) = request_module("libcomposite") {
                log::debug!("cannot load libcomposite: {err}");
            }
        }

        let configfs = match &self.options.configfs {
            Some(configfs) => configfs.clone(),
            None => configfs_dir()?,
        };

        let usb_gadget_dir = configfs.join("usb_gadget");
        if usb_gadget_dir.is_dir() {
            Ok(usb_gadget_dir)
        } else {
            Err(io::Error::new(ErrorKind::NotFound, "usb_gadget not found in configfs"))
        }
    }

    /// Path of the gadget directory in configfs.
    pub fn dir(&self) -> Result<PathBuf> {
        Ok(self.usb_gadget_dir().map_err(Error::GadgetLifecycle)?.join(&self.options.name))
    }

    /// Whether the gadget exists and is bound to a UDC.
    pub fn is_bound(&self) -> Result<bool> {
        let udc = match fs::read(self.dir()?.join("UDC")) {
            Ok(udc) => OsString::from_vec(udc),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(Error::GadgetLifecycle(err)),
        };
        Ok(!trim_os_str(&udc).is_empty())
    }

    fn create(&self, dir: &Path) -> io::Result<Vec<DevicePair>> {
        let opts = &self.options;
        log::debug!("creating gadget at {}", dir.display());
        fs::create_dir(dir)?;

        write_attr(dir, "idVendor", hex_u16(opts.id.vendor))?;
        write_attr(dir, "idProduct", hex_u16(opts.id.product))?;
        write_attr(dir, "bcdDevice", hex_u16(opts.device_release))?;
        write_attr(dir, "bcdUSB", hex_u16(opts.usb_version))?;

        let lang_dir = dir.join("strings").join(hex_u16(LANG_EN_US));
        fs::create_dir_all(&lang_dir)?;
        write_attr(&lang_dir, "manufacturer", &opts.strings.manufacturer)?;
        write_attr(&lang_dir, "product", &opts.strings.product)?;
        write_attr(&lang_dir, "serialnumber", &opts.strings.serial_number)?;

        let config_dir = dir.join("configs").join("c.1");
        let config_lang_dir = config_dir.join("strings").join(hex_u16(LANG_EN_US));
        fs::create_dir_all(&config_lang_dir)?;
        write_attr(&config_lang_dir, "configuration", &opts.configuration)?;
        write_attr(&config_dir, "bmAttributes", hex_u8(1 << 7))?;
        write_attr(&config_dir, "MaxPower", (opts.max_power_ma.min(500) / 2).to_string())?;

        let mut functions = Vec::new();
        for source in self.roots.list_source_devices().map_err(into_io)? {
            let desc = match self.roots.report_descriptor(&source) {
                Ok(desc) => desc,
                Err(err) => {
                    log::warn!("skipping {}: {err}", source.display());
                    continue;
                }
            };
            let report_len = match descriptor::report_length(&desc) {
                Ok(len) => len,
                Err(err) => {
                    log::warn!("skipping {}: {err}", source.display());
                    continue;
                }
            };

            let idx = functions.len();
            let func_dir = dir.join("functions").join(format!("hid.usb{idx}"));
            log::info!("adding HID function {idx} for {} with report length {report_len}", source.display());
            fs::create_dir_all(&func_dir)?;
            write_attr(&func_dir, "protocol", "0")?;
            write_attr(&func_dir, "subclass", "0")?;
            write_attr(&func_dir, "report_length", report_len.to_string())?;
            write_attr(&func_dir, "report_desc", &desc)?;
            std::os::unix::fs::symlink(&func_dir, config_dir.join(format!("hid.usb{idx}")))?;

            functions.push((source, func_dir));
        }

        let udc_name = match &opts.udc {
            Some(udc) => udc.clone(),
            None => udc::default_udc(&self.roots.sysfs)?.name().to_os_string(),
        };
        log::debug!("binding gadget to UDC {}", udc_name.to_string_lossy());
        write_attr(dir, "UDC", udc_name.as_bytes())?;
        let udcs = udc::udcs(&self.roots.sysfs).unwrap_or_default();
        if let Some(udc) = udcs.into_iter().find(|udc| udc.name() == udc_name.as_os_str()) {
            match udc.state() {
                Ok(state) => log::info!("UDC {} is {state}", udc_name.to_string_lossy()),
                Err(err) => log::debug!("cannot read state of UDC {}: {err}", udc_name.to_string_lossy()),
            }
        }

        let pairs = functions
            .into_iter()
            .enumerate()
            .map(|(idx, (source, func_dir))| {
                let minor = match function_minor(&func_dir) {
                    Ok(minor) => minor,
                    Err(err) => {
                        log::debug!("no device number for {}: {err}", func_dir.display());
                        idx as u32
                    }
                };
                DevicePair { source, sink: self.roots.dev.join(format!("hidg{minor}")) }
            })
            .collect();

        Ok(pairs)
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::DeviceIo { source, .. } | Error::GadgetLifecycle(source) | Error::Io(source) => source,
        other => io::Error::other(other.to_string()),
    }
}

/// Minor device number of the `hidg` device created for a HID function.
fn function_minor(func_dir: &Path) -> io::Result<u32> {
    let dev = fs::read_to_string(func_dir.join("dev"))?;
    let Some((_major, minor)) = dev.trim().split_once(':') else {
        return Err(io::Error::new(ErrorKind::InvalidData, "invalid device number format"));
    };
    minor.parse().map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

impl GadgetLifecycle for ConfigfsGadget {
    fn setup(&mut self) -> Result<Vec<DevicePair>> {
        let dir = self.dir()?;
        if dir.exists() {
            if self.is_bound()? {
                log::info!("stopping bound gadget at {}", dir.display());
            } else {
                log::info!("removing unbound gadget at {}", dir.display());
            }
            remove_at(&dir).map_err(Error::GadgetLifecycle)?;
        }

        match self.create(&dir) {
            Ok(pairs) => {
                log::info!("gadget {} bound with {} HID functions", self.options.name, pairs.len());
                Ok(pairs)
            }
            Err(err) => {
                if let Err(rm_err) = remove_at(&dir) {
                    log::warn!("cannot remove incomplete gadget at {}: {rm_err}", dir.display());
                }
                Err(Error::GadgetLifecycle(err))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        let dir = self.dir()?;
        if !dir.is_dir() {
            return Err(Error::GadgetLifecycle(io::Error::new(
                ErrorKind::NotFound,
                format!("gadget directory {} not found", dir.display()),
            )));
        }

        remove_at(&dir).map_err(Error::GadgetLifecycle)?;
        log::info!("gadget {} removed", self.options.name);
        Ok(())
    }
}

/// Removes all entries of `dir` that are directories.
fn remove_subdirs(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir(entry.path())?;
        }
    }
    Ok(())
}

/// Unbinds and removes a gadget directory.
fn remove_at(dir: &Path) -> io::Result<()> {
    log::debug!("removing gadget at {}", dir.display());

    let _ = fs::write(dir.join("UDC"), "\n");

    let configs = dir.join("configs");
    if configs.is_dir() {
        for config_dir in fs::read_dir(&configs)? {
            let config_dir = config_dir?;
            if !config_dir.file_type()?.is_dir() {
                continue;
            }

            for func in fs::read_dir(config_dir.path())? {
                let func = func?;
                if func.file_type()?.is_symlink() {
                    fs::remove_file(func.path())?;
                }
            }

            remove_subdirs(&config_dir.path().join("strings"))?;
            fs::remove_dir(config_dir.path())?;
        }
    }

    remove_subdirs(&dir.join("functions"))?;
    remove_subdirs(&dir.join("strings"))?;
    fs::remove_dir(dir)?;

    log::debug!("removed gadget at {}", dir.display());
    Ok(())
}
