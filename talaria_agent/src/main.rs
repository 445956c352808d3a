//! talaria_agent binary: config, providers, hub, and the HTTP(S) listener.

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};

use talaria_agent::aggregator::{Aggregator, SnapshotCache, HTTP_SNAPSHOT_TTL};
use talaria_agent::cli::{self, Command, ServeArgs};
use talaria_agent::config::Config;
use talaria_agent::http::router;
use talaria_agent::hub::Hub;
use talaria_agent::session::{random_token, Gate, HASH_COST, MAX_PASSWORD_BYTES};
use talaria_agent::state::AppState;
use talaria_agent::{logging, providers, tls};

const DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args();
    let prog = args.next().unwrap_or_else(|| "talaria_agent".into());
    let command = match cli::parse_args(std::iter::once(prog.clone()).chain(args)) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    match command {
        Command::Help => {
            println!("{}", cli::usage(&prog));
            Ok(())
        }
        Command::Version => {
            println!("talaria_agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::HashPassword(pw) => {
            if pw.len() > MAX_PASSWORD_BYTES {
                bail!("password must be at most {MAX_PASSWORD_BYTES} bytes");
            }
            println!("{}", bcrypt::hash(pw, HASH_COST)?);
            Ok(())
        }
        Command::Serve(args) => {
            logging::init();
            serve(args).await
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut cfg = Config::load_or_init(&args.config)?;
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    cfg.server.tls |= args.tls;

    let password_hash = if cfg.auth.password_hash.is_empty() {
        let password = random_token(8);
        let hash = tokio::task::spawn_blocking({
            let password = password.clone();
            move || bcrypt::hash(password, HASH_COST)
        })
        .await??;
        warn!("no password configured, generated a temporary one for this run");
        println!("talaria_agent: temporary password: {password}");
        println!("talaria_agent: set auth.password_hash (see --hash-password) to make it permanent");
        hash
    } else {
        cfg.auth.password_hash.clone()
    };

    let host = providers::host(&cfg, tokio::runtime::Handle::current());
    let aggregator = Arc::new(Aggregator::new(host.providers));
    let (hub, hub_task) = Hub::spawn(
        aggregator.clone(),
        Duration::from_millis(cfg.sampling.interval_ms),
    );

    let state = AppState {
        hub: hub.clone(),
        snapshots: Arc::new(SnapshotCache::new(aggregator, HTTP_SNAPSHOT_TTL)),
        gate: Arc::new(Gate::new(password_hash)),
        connections: host.connections,
        theme: Arc::from(cfg.server.theme.as_str()),
        secure_cookies: cfg.server.tls,
        trust_proxy_headers: cfg.server.trust_proxy_headers,
    };
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    let ip: IpAddr = cfg
        .server
        .host
        .parse()
        .with_context(|| format!("server.host '{}' is not an IP address", cfg.server.host))?;
    let addr = SocketAddr::new(ip, cfg.server.port);

    if cfg.server.tls {
        let (cert, key) = tls::ensure_self_signed_cert()?;
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .context("loading TLS certificate")?;
        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            let hub = hub.clone();
            async move {
                shutdown_signal().await;
                hub.stop().await;
                handle.graceful_shutdown(Some(DRAIN));
            }
        });
        info!(%addr, "talaria_agent listening (https)");
        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(app)
            .await
            .context("https server")?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(addr = %listener.local_addr()?, "talaria_agent listening (http)");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        });
        let server = server.into_future();
        tokio::pin!(server);
        tokio::select! {
            res = &mut server => res.context("http server")?,
            _ = shutdown_signal() => {
                hub.stop().await;
                let _ = stop_tx.send(());
                if tokio::time::timeout(DRAIN, &mut server).await.is_err() {
                    warn!("connections still open after drain period, exiting anyway");
                }
            }
        }
    }

    hub.stop().await;
    let _ = hub_task.await;
    info!("talaria_agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
