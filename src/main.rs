use emg_control::config::PipelineConfig;
use emg_control::coordinator::Coordinator;
use emg_control::data_logger::DataLogger;
use emg_control::osc_sender::OscSender;
#[cfg(feature = "hardware")]
use emg_control::serial_reader;
use emg_control::sink::{KeyDriver, LogDriver};
use emg_control::simulator::{self, Simulator};
use emg_control::types::*;
use emg_control::worker::WorkerExit;

use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "emg-control")]
#[command(about = "EMG and flex-sensor gestures to debounced key actions")]
struct Cli {
    /// Pipeline configuration (JSON). Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in simulator mode (no hardware required). `--simulate false` reads the serial board.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    simulate: bool,

    /// Serial port of the Firmata board (e.g., /dev/ttyACM0)
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Send key events as OSC instead of logging them
    #[arg(long)]
    osc: bool,

    /// OSC target address
    #[arg(long, default_value = "127.0.0.1:9000")]
    osc_target: String,

    /// Enable per-window session logging
    #[arg(long)]
    log_data: bool,

    /// Output directory for logged sessions
    #[arg(long, default_value = "./sessions")]
    output_dir: PathBuf,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Stop after this many seconds (runs until Ctrl+C otherwise)
    #[arg(long)]
    duration: Option<f64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path).unwrap_or_else(|e| {
            error!("Cannot load {:?}: {}", path, e);
            process::exit(2);
        }),
        None => PipelineConfig::default(),
    };

    if cli.dump_config {
        println!("{}", config.to_json());
        return;
    }

    let shutdown = Shutdown::new();
    let coordinator = Coordinator::new(config, shutdown.clone()).unwrap_or_else(|e| {
        error!("Invalid configuration: {}", e);
        error!("Fix the config file, or run with --dump-config to start from the defaults.");
        process::exit(2);
    });
    let config = coordinator.config().clone();

    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.trigger()) {
            warn!("Ctrl+C handler not installed: {}", e);
        }
    }

    let table = &config.action_table;
    info!("═══════════════════════════════════════════════");
    info!("  EMG CONTROL v{}", env!("CARGO_PKG_VERSION"));
    info!("  Mode: {}", if cli.simulate { "SIMULATOR" } else { "HARDWARE" });
    info!(
        "  Sampling {} Hz, window {} samples, band {}–{} Hz",
        config.filter.sampling_rate,
        config.window_len(),
        config.filter.low_cutoff,
        config.filter.high_cutoff
    );
    for c in &table.channels {
        let gate = c.gate.map(|g| format!(", gate A{}", g)).unwrap_or_default();
        info!("  A{} {} → {}{}", c.channel, c.name, c.action, gate);
    }
    let priority: Vec<String> = table
        .sensors
        .iter()
        .map(|s| format!("A{}>{} → {}", s.sensor, s.threshold, s.action))
        .collect();
    info!("  Sensors: {}", priority.join(", "));
    if cli.osc {
        info!("  Keys: OSC → {}", cli.osc_target);
    }
    info!("═══════════════════════════════════════════════");

    let driver: Box<dyn KeyDriver> = if cli.osc {
        match OscSender::new(cli.osc_target.clone()) {
            Ok(d) => Box::new(d),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
    } else {
        Box::new(LogDriver)
    };

    let mut handles = Vec::new();

    // ─── Data logger ────────────────────────────────────────────────
    let reports_tx = if cli.log_data {
        let (tx, rx) = bounded::<WindowReport>(4096);
        match DataLogger::new(rx, &cli.output_dir, &config) {
            Ok(logger) => {
                handles.push(
                    thread::Builder::new()
                        .name("logger".into())
                        .spawn(move || logger.run())
                        .expect("spawn logger thread"),
                );
                Some(tx)
            }
            Err(e) => {
                error!("Session logging disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    // ─── Workers + dispatcher ───────────────────────────────────────
    let (publisher, taps) = coordinator.board();
    let running = match coordinator.start_on_board(taps, driver, reports_tx) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to start pipeline: {}", e);
            process::exit(1);
        }
    };

    // ─── Input source ───────────────────────────────────────────────
    let clock = SessionClock::new();
    let emg: Vec<ChannelId> = table.channels.iter().map(|c| c.channel).collect();
    let flex: Vec<SensorId> = table.sensors.iter().map(|s| s.sensor).collect();
    let fs = config.filter.sampling_rate;

    if cli.simulate {
        info!("Starting simulator...");
        let sim_shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("simulator".into())
                .spawn(move || {
                    Simulator::new(clock, publisher, &emg, &flex, fs, sim_shutdown).run(&simulator::demo_sequence());
                })
                .expect("spawn simulator thread"),
        );
    } else {
        #[cfg(feature = "hardware")]
        {
            info!("Starting serial reader on {}...", cli.port);
            let ser_shutdown = shutdown.clone();
            let port = cli.port.clone();
            let interval = (1000.0 / fs).round().max(1.0) as u16;
            handles.push(
                thread::Builder::new()
                    .name("serial".into())
                    .spawn(move || {
                        let reader = serial_reader::SerialReader::new(port, publisher, clock, ser_shutdown)
                            .with_interval_ms(interval);
                        if let Err(e) = reader.run() {
                            error!("Serial reader stopped: {}", e);
                        }
                    })
                    .expect("spawn serial thread"),
            );
        }
        #[cfg(not(feature = "hardware"))]
        {
            error!("Hardware mode requires the 'hardware' feature. Falling back to simulator.");
            let sim_shutdown = shutdown.clone();
            handles.push(
                thread::Builder::new()
                    .name("simulator".into())
                    .spawn(move || {
                        Simulator::new(clock, publisher, &emg, &flex, fs, sim_shutdown)
                            .run(&simulator::demo_sequence());
                    })
                    .expect("spawn simulator thread"),
            );
        }
    }

    match cli.duration {
        Some(secs) => info!("Running for {:.1}s. Press Ctrl+C to stop early.", secs),
        None => info!("Running. Press Ctrl+C to stop."),
    }
    let deadline = cli.duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    loop {
        if shutdown.sleep(Duration::from_millis(100)) || running.workers_finished() {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Run duration reached");
            break;
        }
    }
    running.stop();

    let report = running.join();
    for h in handles {
        let _ = h.join();
    }

    let mut faulted = false;
    for w in &report.workers {
        let exit = match &w.exit {
            WorkerExit::Shutdown => "stopped".to_string(),
            WorkerExit::Fault(e) => {
                faulted = true;
                format!("fault: {}", e)
            }
            WorkerExit::Panicked => {
                faulted = true;
                "panicked".to_string()
            }
        };
        info!(
            "A{}: {} windows, {} forwarded, {} suppressed, {} skipped ({})",
            w.channel, w.windows, w.forwarded, w.suppressed, w.skipped, exit
        );
        if w.log_dropped > 0 {
            warn!("A{}: {} session-log lines dropped", w.channel, w.log_dropped);
        }
    }
    info!(
        "Sink: {} dispatched, {} failed, {} abandoned",
        report.dispatch.dispatched, report.dispatch.failed, report.dispatch.abandoned
    );
    if faulted {
        process::exit(1);
    }
}
