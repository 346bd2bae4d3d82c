//! Configuration file.

use serde::{Deserialize, Deserializer};
use std::{
    collections::BTreeMap,
    error::Error,
    fmt::Display,
    fs, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    str::FromStr,
    thread::{self, JoinHandle},
    time::Duration,
};

use usb_hid_relay::{
    discovery::DiscoveryRoots,
    engine::{EngineOptions, ErrorPolicy},
    hotkey::{Hotkey, KeyModifiers, KeyboardReport},
    keymap::{key_code, KeySym, Keymap, Layer},
    GadgetOptions, Id, SessionOptions, StopHandle, Strings,
};

type BoxResult<T> = std::result::Result<T, Box<dyn Error>>;

/// Relay configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// What to do when a device fails.
    #[serde(deserialize_with = "from_str")]
    pub error_policy: ErrorPolicy,
    /// Buffers per device pair.
    pub buffers_per_pair: Option<usize>,
    /// Track key events of keyboards.
    pub track_keys: Option<bool>,
    /// Milliseconds to wait for key release reports on stop.
    pub release_timeout_ms: Option<u64>,
    /// sysfs root.
    pub sysfs: Option<PathBuf>,
    /// Device node root.
    pub dev: Option<PathBuf>,
    /// USB gadget.
    pub gadget: GadgetConfig,
    /// Keymap overrides.
    pub keymap: KeymapConfig,
    /// Hotkeys.
    #[serde(rename = "hotkey")]
    pub hotkeys: Vec<HotkeyConfig>,
}

/// Deserializes a value through its [`FromStr`] implementation.
fn from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|err| serde::de::Error::custom(format!("invalid value {s:?}: {err}")))
}

/// USB gadget identity.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct GadgetConfig {
    pub name: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub udc: Option<String>,
    pub configfs: Option<PathBuf>,
}

/// Keymap overrides applied on top of the US layout.
///
/// Every layer maps key codes or key names to symbols.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeymapConfig {
    pub layers: Vec<BTreeMap<String, String>>,
}

/// Hotkey.
///
/// Either `report` gives the exact report as hex bytes, or the report is built
/// from `modifiers` and `keys` as a boot keyboard report.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HotkeyConfig {
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub report_id: Option<u8>,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default)]
    pub keys: Vec<u8>,
    pub action: ActionConfig,
}

/// Hotkey action.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionConfig {
    /// Stop the relay.
    Stop,
    /// Run a shell command.
    Command(String),
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &Path) -> BoxResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| format!("cannot read {}: {err}", path.display()))?;
        Ok(toml::from_str(&text).map_err(|err| format!("invalid config {}: {err}", path.display()))?)
    }

    pub fn roots(&self) -> DiscoveryRoots {
        let mut roots = DiscoveryRoots::default();
        if let Some(sysfs) = &self.sysfs {
            roots = roots.with_sysfs(sysfs);
        }
        if let Some(dev) = &self.dev {
            roots = roots.with_dev(dev);
        }
        roots
    }

    pub fn gadget_options(&self) -> GadgetOptions {
        let cfg = &self.gadget;
        let mut opts = GadgetOptions::default();
        if let Some(name) = &cfg.name {
            opts = opts.with_name(name);
        }
        opts = opts.with_id(Id::new(
            cfg.vendor_id.unwrap_or(Id::LINUX_COMPOSITE.vendor),
            cfg.product_id.unwrap_or(Id::LINUX_COMPOSITE.product),
        ));

        let defaults = opts.strings.clone();
        opts = opts.with_strings(Strings::new(
            cfg.manufacturer.as_deref().unwrap_or(&defaults.manufacturer),
            cfg.product.as_deref().unwrap_or(&defaults.product),
            cfg.serial_number.as_deref().unwrap_or(&defaults.serial_number),
        ));
        if let Some(udc) = &cfg.udc {
            opts = opts.with_udc(udc);
        }
        if let Some(configfs) = &cfg.configfs {
            opts = opts.with_configfs(configfs);
        }
        opts
    }

    pub fn keymap(&self) -> BoxResult<Keymap> {
        let mut layers = Vec::new();
        for entries in &self.keymap.layers {
            let mut layer = Layer::new();
            for (key, sym) in entries {
                let code = match key.parse() {
                    Ok(code) => code,
                    Err(_) => key_code(key).ok_or_else(|| format!("unknown key {key:?} in keymap"))?,
                };
                layer.insert(code, KeySym::new(sym));
            }
            layers.push(layer);
        }

        let mut keymap = Keymap::us();
        keymap.overlay(&Keymap::from_layers(layers)?);
        Ok(keymap)
    }

    pub fn session_options(&self) -> BoxResult<SessionOptions> {
        let mut engine = EngineOptions::default().with_error_policy(self.error_policy);
        if let Some(buffers) = self.buffers_per_pair {
            engine = engine.with_buffers_per_pair(buffers);
        }

        let mut opts =
            SessionOptions::default().with_engine(engine).with_roots(self.roots()).with_keymap(self.keymap()?);
        if let Some(track_keys) = self.track_keys {
            opts = opts.with_track_keys(track_keys);
        }
        if let Some(ms) = self.release_timeout_ms {
            opts = opts.with_release_timeout(Duration::from_millis(ms));
        }
        Ok(opts)
    }
}

impl HotkeyConfig {
    /// Report pattern of the hotkey.
    pub fn pattern(&self) -> BoxResult<Vec<u8>> {
        if let Some(report) = &self.report {
            return parse_hex_bytes(report);
        }

        let mut modifiers = KeyModifiers::empty();
        for name in &self.modifiers {
            let flag = KeyModifiers::from_name(&name.to_uppercase().replace('-', "_"))
                .ok_or_else(|| format!("unknown modifier {name:?}"))?;
            modifiers |= flag;
        }
        let mut report = KeyboardReport::new(modifiers, &self.keys)?;
        if let Some(id) = self.report_id {
            report = report.with_report_id(id);
        }
        Ok(report.to_bytes())
    }

    /// Builds the hotkey, using `stop` for the stop action.
    pub fn build(&self, stop: &StopHandle) -> BoxResult<Hotkey> {
        let pattern = self.pattern()?;
        let hotkey = match self.action.clone() {
            ActionConfig::Stop => {
                let stop = stop.clone();
                Hotkey::new(pattern).with_action(move || {
                    log::info!("stop requested by hotkey");
                    stop.stop();
                })
            }
            ActionConfig::Command(command) => Hotkey::new(pattern).with_action(move || {
                if let Err(err) = spawn_command(&command) {
                    log::warn!("cannot run {command:?}: {err}");
                }
            }),
        };
        Ok(hotkey)
    }
}

/// Runs a shell command in the background.
///
/// The child is waited for on a separate thread, which returns its exit status.
fn spawn_command(command: &str) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    log::info!("running {command:?}");
    let mut child = Command::new("sh").arg("-c").arg(command).spawn()?;
    let command = command.to_string();
    thread::Builder::new().name("hotkey-command".into()).spawn(move || {
        let status = child.wait();
        match &status {
            Ok(status) if status.success() => log::debug!("{command:?} finished"),
            Ok(status) => log::warn!("{command:?} failed: {status}"),
            Err(err) => log::warn!("cannot wait for {command:?}: {err}"),
        }
        status
    })
}

/// Parses hex bytes separated by whitespace, e.g. `01 00 2a 00`.
fn parse_hex_bytes(s: &str) -> BoxResult<Vec<u8>> {
    s.split_whitespace()
        .map(|b| {
            let b = b.trim_start_matches("0x");
            u8::from_str_radix(b, 16).map_err(|err| Box::<dyn Error>::from(format!("invalid report byte {b:?}: {err}")))
        })
        .collect()
}
