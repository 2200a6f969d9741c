//! Application lifecycle: registry setup, task orchestration, shutdown
//! (component J, SPEC_FULL.md §4.J). Grounded on the teacher's
//! `init_tracing()`/`wait_for_shutdown()` shape, trimmed of the hot-reload
//! and remote-registration machinery this spec has no counterpart for.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::Advertiser;
use crate::server;
use crate::streaming::connection::{self, ActiveStream, ConnectionManager};
use crate::streaming::packet::{DataType, Rule};
use crate::streaming::registry::{SampleSource, SignalDefinition, SignalRegistry, SignalType, TimeSpec};

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device_name = %config.device_name,
        "openDAQ streaming endpoint starting"
    );

    let config = Arc::new(config);
    let registry = Arc::new(SignalRegistry::new(
        config.max_signals,
        config.max_tables,
        config.signal_name_length,
    ));
    register_demo_signals(&registry, &config)?;

    let source: Arc<dyn SampleSource> = Arc::new(DemoSampleSource::default());
    let active_stream: ActiveStream = Arc::new(RwLock::new(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let advertiser = if config.enable_mdns {
        let device_ip = resolve_device_ip(&config);
        match Advertiser::start(&config, device_ip) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(error = %e, "mDNS advertiser failed to start, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&registry),
        Arc::clone(&config),
        Arc::clone(&source),
        active_stream.clone(),
    ));

    let mut handles = Vec::new();

    let mailbox_tx = if config.use_websocket {
        let (tx, rx) = connection::new_mailbox();
        let manager = Arc::clone(&manager);
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            manager.run_websocket(rx, shutdown_rx).await;
        }));
        Some(tx)
    } else {
        let manager = Arc::clone(&manager);
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = manager.run_raw_tcp(shutdown_rx).await {
                warn!(error = %e, "raw TCP connection manager exited with error");
            }
        }));
        None
    };

    {
        let config = Arc::clone(&config);
        let registry = Arc::clone(&registry);
        let source = Arc::clone(&source);
        let active_stream = active_stream.clone();
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server::run(config, registry, source, active_stream, mailbox_tx, shutdown_rx).await {
                warn!(error = %e, "HTTP control server exited with error");
            }
        }));
    }

    if config.demo_producer {
        let registry = Arc::clone(&registry);
        let active_stream = active_stream.clone();
        let interval = std::time::Duration::from_millis(config.demo_interval_ms);
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_demo_producer(registry, active_stream, interval, shutdown_rx).await;
        }));
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    for h in handles {
        let _ = h.await;
    }

    if let Some(advertiser) = advertiser {
        advertiser.stop();
    }

    info!("openDAQ streaming endpoint stopped");
    Ok(())
}

/// Demo signal set this binary runs out of the box so the crate is
/// runnable end-to-end without real hardware: a standalone explicit int32
/// value signal, and a table pairing an explicit real64 value signal with
/// a linear time signal (exercising the value-subscribe-pulls-siblings
/// cascade from spec §4.C/S4).
fn register_demo_signals(registry: &SignalRegistry, _config: &Config) -> anyhow::Result<()> {
    registry
        .add_signal(SignalDefinition::new(
            "v1",
            Rule::Explicit,
            DataType::Int32,
            SignalType::Value,
        ))
        .ok_or_else(|| anyhow::anyhow!("registry full or name too long while adding demo signal v1"))?;

    let value = SignalDefinition::new("temperature", Rule::Explicit, DataType::Real64, SignalType::Value);
    let time = SignalDefinition::new("time", Rule::Linear, DataType::UInt64, SignalType::Time)
        .delta(1)
        .time(TimeSpec {
            absolute_reference: None,
            prime_exponents: vec![],
        });
    registry
        .add_table(vec![value, time], "analog")
        .ok_or_else(|| anyhow::anyhow!("registry full or name too long while adding demo table"))?;

    Ok(())
}

/// Host callback implementation standing in for device-specific code
/// (spec §1's "out of scope" collaborators). Always anchors implicit
/// signals at value index 0 — a real device would return the index of
/// the first sample it is about to send.
#[derive(Default)]
struct DemoSampleSource;

impl SampleSource for DemoSampleSource {
    fn on_connect(&self) {
        info!("streaming client connected, demo producer active");
    }
}

/// Device producer task (spec §1): periodically serializes fresh samples
/// for every subscribed demo signal onto the one active stream, tolerating
/// send failures without touching registry state (spec §5 cancellation).
async fn run_demo_producer(
    registry: Arc<SignalRegistry>,
    active_stream: ActiveStream,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let ramp = AtomicI64::new(0);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("shutdown requested, demo producer exiting");
                return;
            }
        }

        let Some(stream) = active_stream.read().clone() else {
            continue;
        };
        let tick = ramp.fetch_add(1, Ordering::Relaxed);

        if registry.is_subscribed("v1") {
            if let Some(signal_no) = registry.signal_no("v1") {
                let sample = (tick as i32).to_le_bytes();
                let _ = stream.send_explicit(signal_no, 4, &[&sample[..]]);
            }
        }

        if registry.is_subscribed("temperature") {
            if let Some(signal_no) = registry.signal_no("temperature") {
                let value = 20.0 + (tick as f64 * 0.1).sin();
                let sample = value.to_le_bytes();
                let _ = stream.send_explicit(signal_no, 8, &[&sample[..]]);
            }
        }

        if registry.is_subscribed("time") {
            if let Some(signal_no) = registry.signal_no("time") {
                let value_index = tick as u64;
                let sample = value_index.to_le_bytes();
                let _ = stream.send_implicit(signal_no, value_index, &sample[..]);
            }
        }
    }
}

/// Resolve the IP advertised in the mDNS A record. The original firmware
/// reads this off its own TCP/IP stack; this build has no such source of
/// truth, so it must be supplied via config, falling back to loopback
/// (harmless on a single-host demo, useless beyond it).
fn resolve_device_ip(config: &Config) -> IpAddr {
    match &config.device_ip {
        Some(ip) => ip.parse().unwrap_or_else(|_| {
            warn!(device_ip = %ip, "DEVICE_IP is not a valid IP address, using loopback");
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        }),
        None => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
