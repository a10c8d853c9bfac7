use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tracing::info;

use slotbook::auth::AdvisorRegistry;
use slotbook::engine::Engine;
use slotbook::mailer::{self, LogMailer, Mailer};
use slotbook::notify::NotifyHub;
use slotbook::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTBOOK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotbook::observability::init(metrics_port);

    let port = std::env::var("SLOTBOOK_PORT").unwrap_or_else(|_| "7466".into());
    let bind = std::env::var("SLOTBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("SLOTBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let max_connections: usize = std::env::var("SLOTBOOK_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let compact_threshold: u64 = std::env::var("SLOTBOOK_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Advisor accounts come from a registry file, or a single-advisor
    // fallback driven by SLOTBOOK_PASSWORD.
    let registry = match std::env::var("SLOTBOOK_ADVISORS_FILE") {
        Ok(path) => Arc::new(AdvisorRegistry::from_file(Path::new(&path))?),
        Err(_) => {
            let email = std::env::var("SLOTBOOK_ADVISOR_EMAIL")
                .unwrap_or_else(|_| "advisor@localhost".into());
            let password = std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into());
            Arc::new(AdvisorRegistry::single(email, password))
        }
    };

    let tls_cert = std::env::var("SLOTBOOK_TLS_CERT").ok();
    let tls_key = std::env::var("SLOTBOOK_TLS_KEY").ok();
    let tls_acceptor = slotbook::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("slotbook.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path, notify)?);

    // Mailer: composes invitation and booking notifications off the
    // mutation path. Base URL lands in student invite links.
    let base_url = std::env::var("SLOTBOOK_BASE_URL")
        .unwrap_or_else(|_| "https://advisement-scheduler.example".into());
    let (mail_tx, mail_rx) = mpsc::channel(mailer::QUEUE_DEPTH);
    engine.set_mail_tx(mail_tx);
    let backend: Arc<dyn Mailer> = Arc::new(LogMailer);
    tokio::spawn(mailer::run_mailer(
        engine.clone(),
        registry.clone(),
        backend,
        base_url,
        mail_rx,
    ));

    tokio::spawn(slotbook::compactor::run_compactor(
        engine.clone(),
        compact_threshold,
        Duration::from_secs(30),
    ));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let registry = registry.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => {
                                wire::process_connection(stream, peer, engine, registry).await
                            }
                            Err(e) => Err(e),
                        },
                        None => wire::process_connection(socket, peer, engine, registry).await,
                    };
                    if let Err(e) = result {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotbook stopped");
    Ok(())
}
