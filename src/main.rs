//! WrenMQ - lightweight MQTT v3.1 / MQTT-SN broker for small devices
//!
//! Usage:
//!   wrenmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      MQTT bind address (default: 0.0.0.0:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wrenmq::acl::AclProvider;
use wrenmq::auth::AuthProvider;
use wrenmq::bridge::BridgeManager;
use wrenmq::broker::{Broker, BrokerConfig, ListenerConfig, SnListenerConfig};
use wrenmq::config::Config;
use wrenmq::hooks::CompositeHooks;
use wrenmq::persistence::PersistenceManager;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// WrenMQ - lightweight MQTT v3.1 / MQTT-SN broker
#[derive(Parser, Debug)]
#[command(name = "wrenmq")]
#[command(about = "Lightweight MQTT v3.1 / MQTT-SN broker for small devices")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT/TCP bind address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

// The broker is cooperatively single-threaded: one reactor thread drives
// every listener, connection and the housekeeping tick.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // CLI overrides config, config overrides the default
    let log_level = args.log_level.unwrap_or({
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut listeners: Vec<ListenerConfig> = file_config
        .listeners()
        .into_iter()
        .map(|l| ListenerConfig {
            bind: l.bind,
            mount_point: l.mount_point.map(|p| Arc::from(p.as_str())),
            max_connections: l.max_connections,
        })
        .collect();
    if let Some(bind) = args.bind {
        listeners[0].bind = bind;
    }

    let sn_listeners: Vec<SnListenerConfig> = file_config
        .sn_listener
        .iter()
        .map(|l| SnListenerConfig {
            bind: l.bind,
            gateway_id: l.gateway_id,
            predefined_topics: l
                .predefined_topics
                .iter()
                .map(|p| (p.id, p.topic.clone()))
                .collect(),
        })
        .collect();

    let broker_config = BrokerConfig {
        listeners,
        sn_listeners,
        max_packet_size: file_config.limits.max_packet_size,
        max_inflight_messages: file_config.limits.max_inflight_messages,
        max_queued_messages: file_config.limits.max_queued_messages,
        retry_interval: file_config.limits.retry_interval,
        clientid_prefixes: file_config.auth.clientid_prefixes.clone(),
    };

    info!("Starting WrenMQ broker");
    for listener in &broker_config.listeners {
        info!("  MQTT listener: {}", listener.bind);
    }
    for listener in &broker_config.sn_listeners {
        info!("  MQTT-SN listener: {}", listener.bind);
    }
    info!("  Max inflight: {}", broker_config.max_inflight_messages);
    info!("  Max queued: {}", broker_config.max_queued_messages);

    // Authentication and authorization; ACL checks only run when a
    // password file is configured as well.
    let auth = match &file_config.auth.password_file {
        Some(path) => {
            let provider =
                AuthProvider::from_password_file(path, file_config.auth.allow_anonymous())?;
            info!("  Authentication: enabled ({:?})", path);
            provider
        }
        None => {
            info!("  Authentication: disabled");
            AuthProvider::open()
        }
    };
    let acl = match (&file_config.auth.password_file, &file_config.auth.acl_file) {
        (Some(_), Some(path)) => {
            let provider = AclProvider::from_acl_file(path)?;
            info!("  ACL: enabled ({:?})", path);
            provider
        }
        _ => {
            info!("  ACL: disabled");
            AclProvider::open()
        }
    };
    let hooks = Arc::new(CompositeHooks::new().with(Arc::new(auth)).with(Arc::new(acl)));

    let mut broker = Broker::new(broker_config, hooks);

    // Restore persistence before accepting connections
    if file_config.persistence.enabled {
        let manager = Arc::new(PersistenceManager::new(
            &file_config.persistence.dir,
            file_config.persistence.autosave_interval,
        ));
        match manager.load(&broker.shared().subscriptions, &broker.shared().sessions) {
            Ok((retained, subs)) => {
                info!(
                    "  Persistence: enabled ({:?}), loaded {} retained, {} subscriptions",
                    file_config.persistence.dir, retained, subs
                );
            }
            Err(e) => {
                warn!("  Persistence load failed: {}", e);
            }
        }
        broker.set_persistence(manager);
    } else {
        info!("  Persistence: disabled");
    }

    // Bridge connections
    if !file_config.bridge.is_empty() {
        info!("  Bridges: {} configured", file_config.bridge.len());
        for bridge in &file_config.bridge {
            let protocol = match bridge.protocol {
                wrenmq::config::BridgeProtocol::Mqtt => "mqtt",
                wrenmq::config::BridgeProtocol::MqttSn => "mqtt-sn",
            };
            info!(
                "    - {} -> {} ({}, {} topic rules)",
                bridge.name,
                bridge.addresses.join(", "),
                protocol,
                bridge.topics.len()
            );
        }
        let manager = BridgeManager::new(broker.shared().clone(), file_config.bridge.clone());
        broker.set_bridge_manager(manager);
    }

    let broker = Arc::new(broker);

    // SIGINT/SIGTERM stop the broker; SIGHUP triggers a persistence save
    // at the next housekeeping tick.
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("Stop requested");
            broker.shutdown();
        });
    }
    {
        let shared = broker.shared().clone();
        tokio::spawn(async move {
            let mut sighup =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                    .expect("failed to install SIGHUP handler");
            while sighup.recv().await.is_some() {
                info!("SIGHUP received; persistence save scheduled");
                shared.request_save();
            }
        });
    }

    broker.run().await?;
    Ok(())
}
