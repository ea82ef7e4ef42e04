//! rtd-server binary: loads config, sets up TLS and runs the hub.

use clap::Parser;
use rtd_server::transport::WsConnector;
use rtd_server::{CliOverrides, Hub, RtdServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// rtd-server — real-time messaging hub
#[derive(Parser, Debug)]
#[command(name = "rtd-server", version, about = "Real-time messaging hub")]
struct Cli {
    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.rtd/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rtd-server");

    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c.display().to_string()), Some(k.display().to_string()))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind.clone(),
        cert,
        key,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => None,
    };

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let hub = Arc::new(Hub::new(
        config.hub_settings(),
        config.collaborators(),
        Arc::new(WsConnector::new(config.limits)),
    ));

    let server = match RtdServer::bind(addr, hub, tls_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("rtd-server stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key =
        rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrades only.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let rtd_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".rtd");
    std::fs::create_dir_all(&rtd_dir)?;

    let cert_path = rtd_dir.join("cert.pem");
    let key_path = rtd_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "rtd-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
