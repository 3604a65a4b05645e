// broker: STOMP message broker over TCP.

use clap::{Arg, Command};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "broker starting");

    let matches = Command::new("STOMP Broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A STOMP 1.0/1.1 message broker")
        .arg(
            Arg::new("config")
                .help("Path to the broker TOML config")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("bind")
                .help("Listen address override, e.g. 0.0.0.0:61613")
                .short('b')
                .long("bind"),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => match broker::config::load_config_from_path(std::path::Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => broker::config::BrokerConfig::default(),
    };
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind = bind.clone();
    }

    info!(
        bind = %config.bind,
        hosts = config.virtual_hosts.len(),
        "config loaded"
    );

    let handle = match broker::Broker::start(config).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("FATAL: failed to bind: {}", e);
            std::process::exit(1);
        }
    };

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    handle.shutdown();
}
