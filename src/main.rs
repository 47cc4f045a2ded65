use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use ulid::Ulid;

use roomd::tenant::TenantManager;
use roomd::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("ROOMD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    roomd::observability::init(metrics_port);

    let port = std::env::var("ROOMD_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("ROOMD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("ROOMD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("ROOMD_PASSWORD").unwrap_or_else(|_| "roomd".into());
    let max_connections: usize = std::env::var("ROOMD_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let compact_threshold: u64 = std::env::var("ROOMD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Slot width for single-instant availability probes; fixed per deployment.
    let slot_minutes: i64 = std::env::var("ROOMD_SLOT_MINUTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(roomd::limits::DEFAULT_SLOT_DURATION_MS / 60_000);
    let slot_duration_ms = slot_minutes * 60_000;

    // Administrators may cancel any booking; everyone else only their own.
    let admins: HashSet<Ulid> = std::env::var("ROOMD_ADMINS")
        .map(|s| {
            s.split(',')
                .filter_map(|part| Ulid::from_string(part.trim()).ok())
                .collect()
        })
        .unwrap_or_default();
    let admins = Arc::new(admins);

    let tls_cert = std::env::var("ROOMD_TLS_CERT").ok();
    let tls_key = std::env::var("ROOMD_TLS_KEY").ok();
    let tls_acceptor =
        roomd::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
        slot_duration_ms,
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("roomd listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  slot_duration: {slot_minutes}m");
    info!("  admins: {}", admins.len());
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
                        metrics::counter!(roomd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roomd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roomd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();
                let adm = admins.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw, adm, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roomd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
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
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("roomd stopped");
    Ok(())
}
