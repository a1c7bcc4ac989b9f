mod filekv;
mod platform;
mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use wopi_core::{auth::Authenticator, discovery::DiscoveryRegistry, store::KvStore};

#[derive(Parser)]
#[command(
    name = "wopi-bridge",
    about = "WOPI bridge between a messaging host and an office-document editor server"
)]
struct Opts {
    /// Address to listen on.
    #[arg(long, env = "BRIDGE_LISTEN", default_value = "127.0.0.1:9700")]
    listen: String,

    /// Base URL of the editor server (its WOPI discovery lives at
    /// <address>/hosting/discovery).
    #[arg(long, env = "BRIDGE_WOPI_ADDRESS")]
    wopi_address: String,

    /// Public base URL of this bridge, as reachable by the editor server.
    #[arg(long, env = "BRIDGE_URL_PREFIX")]
    url_prefix: String,

    /// Base URL of the messaging platform's REST API.
    #[arg(long, env = "BRIDGE_PLATFORM_URL")]
    platform_url: String,

    /// Service token for platform API calls.
    #[arg(long, env = "BRIDGE_PLATFORM_TOKEN")]
    platform_token: String,

    /// Directory holding file attachments and shared bridge state.
    #[arg(long, env = "BRIDGE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Skip TLS certificate verification on outbound calls to the editor and
    /// the platform. Development only.
    #[arg(long, env = "BRIDGE_DANGER_DISABLE_CERT_VERIFICATION")]
    danger_disable_cert_verification: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let wopi_address = opts.wopi_address.trim().trim_end_matches('/').to_string();

    if opts.danger_disable_cert_verification {
        tracing::warn!("TLS certificate verification is DISABLED; do not run this in production");
    }
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(opts.danger_disable_cert_verification)
        .timeout(Duration::from_secs(30))
        .build()?;

    let kv: Arc<dyn KvStore> = Arc::new(filekv::FileKv::new(opts.data_dir.join("kv")));
    let authenticator = Arc::new(Authenticator::new(kv));
    authenticator.ensure_secret().await;

    let registry = Arc::new(DiscoveryRegistry::new());
    if let Err(err) = registry.load(&client, &wopi_address).await {
        // Degraded start: WOPI endpoints still answer, but no extension
        // resolves to an editor action until a reload succeeds.
        tracing::error!(%err, wopi_address, "failed to load the WOPI discovery document");
    }

    let host = Arc::new(platform::PlatformClient::new(
        client.clone(),
        &opts.platform_url,
        &opts.platform_token,
        opts.data_dir.clone(),
    ));

    let server = Arc::new(server::Server::new(
        host,
        authenticator,
        registry,
        client,
        wopi_address,
        opts.url_prefix,
    ));

    let listener = TcpListener::bind(&opts.listen).await?;
    tracing::info!(addr = %opts.listen, "wopi bridge listening");
    server.serve(listener).await
}
