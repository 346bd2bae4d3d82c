mod common;
use common::*;

use rustix::pipe::{pipe_with, PipeFlags};
use std::{
    fs::File,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use usb_hid_relay::{
    descriptor::ReportLength,
    device::Device,
    engine::{CompletionQueue, EngineOptions, ErrorPolicy, ForwardingEngine, PollQueue},
    hotkey::HotkeyRegistry,
    Error,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Test side of a device pair.
struct Pipes {
    /// Write end feeding the source device.
    source: File,
    /// Read end receiving from the sink device.
    sink: File,
}

fn add_pair(engine: &mut ForwardingEngine<PollQueue>, n: usize) -> Pipes {
    let (source_rx, source_tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC).unwrap();
    let (sink_rx, sink_tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC).unwrap();

    let source = Device::from_fd(format!("hidraw{n}"), source_rx).unwrap();
    let sink = Device::from_fd(format!("hidg{n}"), sink_tx).unwrap();
    engine.add_pair(source, sink, ReportLength::new(8)).unwrap();

    Pipes { source: File::from(source_tx), sink: File::from(sink_rx) }
}

fn engine(hotkeys: HotkeyRegistry, options: EngineOptions) -> ForwardingEngine<PollQueue> {
    init();
    ForwardingEngine::new(PollQueue::new().unwrap(), hotkeys, options)
}

/// Polls the engine until `len` bytes arrived at the sink.
fn forward(engine: &mut ForwardingEngine<PollQueue>, sink: &mut File, len: usize) -> Vec<u8> {
    for _ in 0..10 {
        engine.poll_once(Some(Duration::from_millis(50))).unwrap();
    }
    read_exact_timeout(sink, len, TIMEOUT)
}

#[test]
fn forwards_reports_unchanged() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let mut pipes = add_pair(&mut engine, 0);

    let report = [0x02, 0, 0x04, 0, 0, 0, 0, 0];
    write_report(&mut pipes.source, &report);
    assert_eq!(forward(&mut engine, &mut pipes.sink, 8), report);

    let release = [0; 8];
    write_report(&mut pipes.source, &release);
    assert_eq!(forward(&mut engine, &mut pipes.sink, 8), release);

    let info = &engine.pairs()[0];
    assert!(info.active);
    assert_eq!(info.stats.forwarded, 2);
}

#[test]
fn pairs_are_independent() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let mut a = add_pair(&mut engine, 0);
    let mut b = add_pair(&mut engine, 1);

    write_report(&mut b.source, &[2; 8]);
    write_report(&mut a.source, &[1; 8]);
    assert_eq!(forward(&mut engine, &mut a.sink, 8), [1; 8]);
    assert_eq!(read_exact_timeout(&mut b.sink, 8, TIMEOUT), [2; 8]);
}

#[test]
fn hotkey_consumes_report() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut hotkeys = HotkeyRegistry::new();
    let hotkey = [0x05, 0, 0x4c, 0, 0, 0, 0, 0];
    hotkeys
        .on_report(hotkey, {
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let mut engine = engine(hotkeys, EngineOptions::default());
    let mut pipes = add_pair(&mut engine, 0);

    write_report(&mut pipes.source, &hotkey);
    for _ in 0..5 {
        engine.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(is_silent(&mut pipes.sink, Duration::from_millis(50)));

    // Reading continues after a consumed report.
    let report = [0, 0, 0x4c, 0, 0, 0, 0, 0];
    write_report(&mut pipes.source, &report);
    assert_eq!(forward(&mut engine, &mut pipes.sink, 8), report);
    assert_eq!(engine.pairs()[0].stats.suppressed, 1);
}

#[test]
fn closed_source_drops_only_its_pair() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let a = add_pair(&mut engine, 0);
    let mut b = add_pair(&mut engine, 1);

    drop(a.source);
    for _ in 0..3 {
        engine.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(engine.active_pairs(), 1);
    assert!(!engine.pairs()[0].active);

    write_report(&mut b.source, &[7; 8]);
    assert_eq!(forward(&mut engine, &mut b.sink, 8), [7; 8]);
}

#[test]
fn closed_source_aborts_under_abort_policy() {
    let options = EngineOptions::default().with_error_policy(ErrorPolicy::AbortSession);
    let mut engine = engine(HotkeyRegistry::new(), options);
    let pipes = add_pair(&mut engine, 0);

    drop(pipes.source);
    let stop = AtomicBool::new(false);
    let err = engine.run(&stop).unwrap_err();
    assert!(matches!(err, Error::DeviceIo { device, .. } if device.ends_with("hidraw0")));
}

#[test]
fn run_returns_when_no_pair_is_left() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let pipes = add_pair(&mut engine, 0);
    drop(pipes.source);

    engine.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(engine.active_pairs(), 0);
}

#[test]
fn waker_stops_run() {
    init();
    let queue = PollQueue::new().unwrap();
    let waker = queue.waker().unwrap();
    let mut engine = ForwardingEngine::new(queue, HotkeyRegistry::new(), EngineOptions::default());
    let _pipes = add_pair(&mut engine, 0);

    let stop = Arc::new(AtomicBool::new(false));
    let t = thread::spawn({
        let stop = stop.clone();
        move || {
            thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::SeqCst);
            waker.wake().unwrap();
        }
    });

    engine.run(&stop).unwrap();
    assert_eq!(engine.active_pairs(), 1);
    t.join().unwrap();
}

#[test]
fn shutdown_releases_all_keys() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let mut a = add_pair(&mut engine, 0);
    let mut b = add_pair(&mut engine, 1);

    write_report(&mut a.source, &[0, 0, 0x04, 0, 0, 0, 0, 0]);
    forward(&mut engine, &mut a.sink, 8);

    engine.shutdown(3, TIMEOUT);
    assert_eq!(read_exact_timeout(&mut a.sink, 24, TIMEOUT), [0; 24]);
    assert_eq!(read_exact_timeout(&mut b.sink, 24, TIMEOUT), [0; 24]);
    assert!(is_silent(&mut a.sink, Duration::from_millis(20)));
    assert!(engine.queue().is_empty());
    assert!(engine.pairs().iter().all(|pair| !pair.active && pair.stats.released == 3));
}

#[test]
fn shutdown_ignores_closed_sink() {
    let mut engine = engine(HotkeyRegistry::new(), EngineOptions::default());
    let a = add_pair(&mut engine, 0);
    let mut b = add_pair(&mut engine, 1);
    drop(a.sink);

    engine.shutdown(3, TIMEOUT);
    assert_eq!(read_exact_timeout(&mut b.sink, 24, TIMEOUT), [0; 24]);
    assert_eq!(engine.pairs()[0].stats.released, 0);
}
