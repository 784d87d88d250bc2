use clap::Parser;
use std::path::{Path, PathBuf};

use tracing::info;
use tracing_subscriber::EnvFilter;
use wiretap_net::{generate_ca, write_ca_to_dir};
use wiretap_proxy::{Proxy, ProxyConfig};

#[derive(Debug, Parser)]
#[command(name = "wiretap", about = "Intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// TOML file with proxy settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Relay CONNECT tunnels without terminating TLS.
    #[arg(long = "no-intercept")]
    no_intercept: bool,
    #[arg(long = "ca-cert", requires = "ca_key")]
    ca_cert: Option<PathBuf>,
    #[arg(long = "ca-key", requires = "ca_cert")]
    ca_key: Option<PathBuf>,
    #[arg(long = "log-json")]
    log_json: bool,
    /// Write the signing root certificate as PEM and exit.
    #[arg(long = "export-ca", value_name = "FILE")]
    export_ca: Option<PathBuf>,
    /// Generate a fresh root CA pair into DIR and exit.
    #[arg(long = "generate-ca", value_name = "DIR")]
    generate_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Some(dir) = &cli.generate_ca {
        let material = generate_ca("Wiretap Root CA").map_err(|err| err.to_string())?;
        let paths = write_ca_to_dir(dir, &material).map_err(|err| err.to_string())?;
        println!("{}", paths.cert_path.display());
        println!("{}", paths.key_path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let proxy = Proxy::new(config).map_err(|err| err.to_string())?;

    if let Some(path) = &cli.export_ca {
        let pem = proxy
            .signer()
            .root()
            .cert_pem()
            .map_err(|err| err.to_string())?;
        std::fs::write(path, pem).map_err(|err| err.to_string())?;
        info!(path = %path.display(), "exported root certificate");
        return Ok(());
    }

    let proxy_task = tokio::spawn(async move {
        proxy
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
            })
            .await
    });

    proxy_task
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())
}

fn load_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.listen.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if cli.no_intercept {
        config.tls.intercept = false;
    }
    if let (Some(cert), Some(key)) = (&cli.ca_cert, &cli.ca_key) {
        config.tls.ca_cert_path = Some(cert.to_string_lossy().into_owned());
        config.tls.ca_key_path = Some(key.to_string_lossy().into_owned());
    }
    Ok(config)
}

fn read_config(path: &Path) -> Result<ProxyConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("reading {}: {err}", path.display()))?;
    toml::from_str(&raw).map_err(|err| format!("parsing {}: {err}", path.display()))
}

fn init_tracing(json: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wiretap_proxy=debug".into());
    let env_filter = EnvFilter::new(filter);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
    }
}
