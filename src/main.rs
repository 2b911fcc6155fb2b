use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::Parser;
use stacklight::{
    config::{Config, DEFAULT_CONFIG_PATH},
    core::{
        calibration::{CalibrationProfile, DetectionMode},
        delivery::{DeliveryManager, Topics},
        event::init_local_offset,
        executor::Executor,
        network::{NetworkMonitor, TcpProbe},
        queue::OfflineQueue,
        sampler::{AveragingSampler, LineSampler},
    },
    display::run_display,
    logger::LoggerManager,
    print_error, print_info,
};
use stacklight_mqtt::MqttManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the broker session gets to send DISCONNECT at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "stacklight", version, about = "Stack-light state monitor with MQTT reporting")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "STACKLIGHT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Show a live single-line readout of every sampling cycle.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let profile = CalibrationProfile::load(&config.monitor.calibration_path).unwrap_or_else(|e| {
        print_error!(
            "Failed to load calibration {}: {}",
            config.monitor.calibration_path.display(),
            e
        );
        process::exit(1);
    });
    print_info!(
        "Calibration loaded for machine '{}' ({} mode)",
        profile.machine_id,
        profile.mode
    );

    // Still single-threaded here.
    init_local_offset();

    let logger_config = if profile.debug {
        config.logger.with_debug()
    } else {
        config.logger.clone()
    };
    let logger_manager = LoggerManager::new(logger_config).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to start async runtime: {}", e);
            process::exit(1);
        });

    if let Err(e) = runtime.block_on(run(cli, config, profile)) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(
    cli: Cli,
    mut config: Config,
    profile: CalibrationProfile,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting stacklight version {}...", env!("CARGO_PKG_VERSION"));

    let profile = Arc::new(profile);
    if config.transport.client_id.is_empty() {
        config.transport.client_id = profile.machine_id.clone();
    }
    let topics = Topics::from_config(&config.monitor);
    log_banner(&config, &profile, &topics);
    debug!("{:#?}", config.transport);

    let sampler = LineSampler::open(&config.monitor.sample_source, profile.mode)
        .await
        .map_err(|e| format!("cannot open sample source {}: {}", config.monitor.sample_source, e))?;
    let sampler = AveragingSampler::new(sampler, profile.sensor.samples_per_reading);

    let shutdown = CancellationToken::new();
    let mut manager =
        MqttManager::from_config(config.transport.clone())?.with_cancel_token(shutdown.clone());

    if config.network.enabled {
        let (host, port) = config.network.probe_target(
            profile.probe_host.as_deref(),
            &config.transport.host,
            config.transport.port,
        );
        let probe = TcpProbe::new(host, port, config.network.timeout());
        let (monitor, link_rx) = NetworkMonitor::new(probe, config.network.interval());
        manager = manager.with_link(link_rx);
        tokio::spawn(monitor.run(shutdown.clone()));
    } else {
        info!("Network monitor disabled");
    }

    let instance = manager.build_and_start()?;
    info!("MQTT client started");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let delivery = DeliveryManager::new(
        instance.publisher(),
        OfflineQueue::new(&config.monitor.queue_path),
        topics,
        instance.state_receiver(),
    )
    .with_wrap_message(config.monitor.wrap_message)
    .with_grace(config.monitor.reconnect_grace())
    .with_ack_timeout(config.monitor.ack_timeout());
    let delivery_task = tokio::spawn(delivery.run(events_rx, shutdown.clone()));

    let executor = Executor::new(sampler, profile.clone(), events_tx)
        .with_interval(config.monitor.sample_interval())
        .with_read_timeout(config.monitor.read_timeout())
        .with_prefill(config.monitor.prefill);

    if cli.debug {
        tokio::spawn(run_display(
            executor.subscribe_snapshots(),
            instance.state_receiver(),
            shutdown.clone(),
        ));
    }
    let executor_task = tokio::spawn(executor.run(shutdown.clone()));

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    shutdown.cancel();

    if let Err(e) = executor_task.await {
        warn!("Sampling task ended abnormally: {}", e);
    }
    if let Err(e) = delivery_task.await {
        warn!("Delivery task ended abnormally: {}", e);
    }
    instance.shutdown(SHUTDOWN_GRACE).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

fn log_banner(config: &Config, profile: &CalibrationProfile, topics: &Topics) {
    let tuning = &profile.tuning;

    info!("Machine ID       : {}", profile.machine_id);
    info!("Detection mode   : {}", profile.mode);
    if profile.mode == DetectionMode::Sensor {
        info!(
            "Sensor driver    : gain {}x, integration {} ms, {} reading(s) per sample",
            profile.sensor.gain,
            profile.sensor.integration_time_ms,
            profile.sensor.samples_per_reading
        );
    }
    info!(
        "Buffer           : {} slots, steady {:.0}%, red floor {}",
        tuning.buffer_size,
        tuning.steady_state_fraction * 100.0,
        tuning.red_floor
    );
    info!(
        "Luminosity floors: {} (any), {} (red)",
        tuning.min_luminosity, tuning.red_min_luminosity
    );
    info!("OFF persistence  : {:?}", profile.persistence_window());
    info!(
        "Broker           : {}:{} (client id: {})",
        config.transport.host, config.transport.port, config.transport.client_id
    );
    info!("Status topic     : {}", topics.status(&profile.machine_id));
    info!("Trigger topic    : {}", topics.trigger());
    info!("Offline queue    : {}", config.monitor.queue_path.display());
    info!("Log level        : {}", config.logger.level);
}
