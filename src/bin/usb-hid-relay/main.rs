//! Forwards HID reports of local input devices to a USB host.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::{error::Error, io, path::PathBuf, process::ExitCode};

use usb_hid_relay::{
    descriptor, discovery::DiscoveryRoots, engine::PollQueue, hotkey::HotkeyRegistry, udcs, ConfigfsGadget,
    DeviceSession, GadgetLifecycle,
};

mod config;
use config::Config;

type BoxResult<T> = std::result::Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "usb-hid-relay", version, about = "Forward HID reports from hidraw devices to a USB HID gadget")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up the USB gadget and forward reports until interrupted
    Run {
        /// Configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print the report length of a HID report descriptor file
    ReportLength {
        /// Report descriptor file
        file: PathBuf,
    },
    /// List source devices, their sinks and event devices
    List {
        /// Configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Remove a left-over USB gadget
    Stop {
        /// Configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Generate shell completion script
    Completions {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load_config(path: Option<PathBuf>) -> BoxResult<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

fn run(cfg: Config) -> BoxResult<()> {
    let options = cfg.session_options()?;
    let gadget = ConfigfsGadget::new(cfg.gadget_options(), options.roots.clone());
    let queue = PollQueue::new()?;
    let mut session = DeviceSession::new(gadget, queue, HotkeyRegistry::new(), options);

    let stop = session.stop_handle();
    for hotkey in &cfg.hotkeys {
        session.hotkeys_mut().register(hotkey.build(&stop)?)?;
    }
    session.set_key_handler(|pair, event| {
        log::debug!("{pair}: {} {} (held {:?})", event.sym, event.action, event.held)
    });

    ctrlc::set_handler({
        let stop = stop.clone();
        move || stop.stop()
    })?;

    session.start()?;
    session.run()?;
    Ok(())
}

fn list(cfg: Config) -> BoxResult<()> {
    let roots: DiscoveryRoots = cfg.roots();
    match udcs(&roots.sysfs) {
        Ok(udcs) => {
            for udc in udcs {
                let state = udc.state().map(|state| state.to_string()).unwrap_or_else(|err| format!("error: {err}"));
                println!("UDC {} ({state})", udc.name().to_string_lossy());
            }
        }
        Err(err) => println!("cannot list USB device controllers: {err}"),
    }

    let gadget = ConfigfsGadget::new(cfg.gadget_options(), roots.clone());
    if let Ok(true) = gadget.is_bound() {
        println!("gadget {} is bound", gadget.options().name);
    }

    let sources = roots.list_source_devices()?;
    if sources.is_empty() {
        println!("no HID raw devices found");
        return Ok(());
    }

    for source in sources {
        let sink = roots.sink_for(&source).map(|sink| sink.display().to_string()).unwrap_or_default();
        let report_len = match roots.report_length(&source) {
            Ok(len) => len.to_string(),
            Err(err) => format!("error: {err}"),
        };
        println!("{} -> {sink} (report length {report_len})", source.display());

        match roots.resolve_event_sources(&source) {
            Ok(events) => {
                let keyboards = roots.resolve_keyboard_event_sources(&source).unwrap_or_default();
                for event in events {
                    let kind = if keyboards.contains(&event) { " (keyboard)" } else { "" };
                    println!("    {}{kind}", event.display());
                }
            }
            Err(err) => println!("    cannot resolve event devices: {err}"),
        }
    }
    Ok(())
}

fn stop(cfg: Config) -> BoxResult<()> {
    let mut gadget = ConfigfsGadget::new(cfg.gadget_options(), cfg.roots());
    gadget.stop()?;
    println!("gadget removed");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Run { config } => load_config(config).and_then(run),
        Commands::ReportLength { file } => descriptor::report_length_from_file(&file)
            .map(|len| println!("{len}"))
            .map_err(|err| Box::<dyn Error>::from(format!("{}: {err}", file.display()))),
        Commands::List { config } => load_config(config).and_then(list),
        Commands::Stop { config } => load_config(config).and_then(stop),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "usb-hid-relay", &mut io::stdout());
            Ok(())
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
