use clap::Parser;
use log::{error, info, warn};
use pingora::prelude::*;
use pingora::server::configuration::Opt;
use pingora_proxy::http_proxy_service;
use pingora_reputation_gate::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/gate.yaml")]
    config: String,

    /// Upstream backend host
    #[arg(short = 'u', long, default_value = "127.0.0.1")]
    upstream_host: String,

    /// Upstream backend port
    #[arg(short = 'p', long, default_value = "8080")]
    upstream_port: u16,

    /// Gate listening address
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// Gate listening port
    #[arg(short = 'P', long, default_value = "6188")]
    listen_port: u16,

    /// Metrics port
    #[arg(short = 'm', long, default_value = "6190")]
    metrics_port: u16,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    info!("Starting reputation gate...");
    info!("Loading configuration from: {}", args.config);

    let config = GateConfig::from_file(&args.config).unwrap_or_else(|e| {
        error!("Failed to load configuration from {}: {}", args.config, e);
        error!("Using default configuration");
        GateConfig::default()
    });

    let classifier = match ContentClassifier::from_config(&config.classifier) {
        Ok(classifier) => Arc::new(classifier),
        Err(e) => {
            error!("Invalid classification rules: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Classifier ready: {} rules, {} byte scan cap",
        classifier.rules().len(),
        classifier.max_input_length()
    );

    for path in [
        &config.reputation.snapshot_path,
        &config.reputation.incident_log_path,
    ] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Cannot create {}: {}", dir.display(), e);
            }
        }
    }

    let gate = Arc::new(ReputationGate::from_config(&config.reputation));

    // Restore bans before the first request is served.
    let startup = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build startup runtime: {}", e);
            std::process::exit(1);
        });
    startup.block_on(gate.load_snapshot());
    drop(startup);

    let edge_notifier: Option<Arc<dyn EdgeBanNotifier>> =
        match CloudflareNotifier::from_config(&config.edge_ban) {
            Ok(Some(notifier)) => {
                info!("Edge ban propagation enabled");
                Some(Arc::new(notifier))
            }
            Ok(None) => None,
            Err(e) => {
                error!("Edge ban propagation disabled: {}", e);
                None
            }
        };

    let metrics = Arc::new(MetricsCollector::new());

    info!(
        "Upstream backend: {}:{}",
        args.upstream_host, args.upstream_port
    );

    let gate_proxy = GateProxy::new(
        (args.upstream_host.clone(), args.upstream_port),
        classifier,
        gate.clone(),
        edge_notifier,
        metrics.clone(),
        config.proxy.max_body_size,
        config.proxy.trust_forwarded_for,
    );

    let mut server = Server::new(Some(Opt::default())).unwrap_or_else(|e| {
        error!("Failed to create server: {}", e);
        std::process::exit(1);
    });
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, gate_proxy);
    let listen_address = format!("{}:{}", args.listen_addr, args.listen_port);
    proxy_service.add_tcp(&listen_address);
    server.add_service(proxy_service);

    // Add built-in Prometheus metrics service
    let metrics_address = format!("{}:{}", args.listen_addr, args.metrics_port);
    let mut prometheus_service_http =
        pingora::services::listening::Service::prometheus_http_service();
    prometheus_service_http.add_tcp(&metrics_address);
    server.add_service(prometheus_service_http);

    // Periodic flush bounds what a crash can lose to one interval
    let interval = Duration::from_secs(config.reputation.persist_interval_secs.max(1));
    let flush_gate = gate.clone();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Periodic persistence disabled: {}", e);
                return;
            }
        };
        runtime.block_on(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = flush_gate.persist().await {
                    metrics.increment_persist_failures();
                    warn!("Periodic persist failed, will retry: {}", e);
                }
            }
        });
    });

    let stats = gate.stats();
    info!("Reputation gate");
    info!(
        "Gate:      http://{}:{}",
        args.listen_addr, args.listen_port
    );
    info!(
        "Metrics:   http://{}:{}/metrics",
        args.listen_addr, args.metrics_port
    );
    info!("Upstream:  {}:{}", args.upstream_host, args.upstream_port);
    info!("Config:    {}", args.config);
    info!(
        "Origins:   {} tracked, {} banned",
        stats.tracked_origins, stats.banned_origins
    );

    server.run_forever();
}
