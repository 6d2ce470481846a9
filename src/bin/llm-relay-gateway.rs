//! Development gateway binary.
//!
//! Serves the relay router with the in-memory quota store and a single
//! static channel supplied on the command line. Production deployments wire
//! their own authentication middleware and SQL-backed `QuotaStore` instead.

use std::sync::Arc;

use axum::Extension;
use llm_relay::relay::cost::RatioTables;
use llm_relay::relay::ledger::MemoryQuotaStore;
use llm_relay::{ChannelType, RelayContext, RelaySettings, RelayState};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: llm-relay-gateway [--listen HOST:PORT] [--tables FILE.json] \
[--base-url URL] [--api-key KEY] [--channel-type openai|azure|cloudflare|custom] \
[--api-version VERSION] [--group NAME] [--user ID=QUOTA] [--consume-quota]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut listen = "127.0.0.1:8080".to_string();
    let mut tables_path: Option<String> = None;
    let mut user_seeds: Vec<String> = Vec::new();
    let mut ctx = RelayContext {
        user_id: 1,
        token_id: 1,
        token_name: "dev".to_string(),
        channel_id: 1,
        group: "default".to_string(),
        ..RelayContext::default()
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => listen = args.next().ok_or("missing value for --listen")?,
            "--tables" => tables_path = Some(args.next().ok_or("missing value for --tables")?),
            "--base-url" => ctx.base_url = args.next().ok_or("missing value for --base-url")?,
            "--api-key" => ctx.api_key = args.next().ok_or("missing value for --api-key")?,
            "--api-version" => {
                ctx.api_version = args.next().ok_or("missing value for --api-version")?;
            }
            "--group" => ctx.group = args.next().ok_or("missing value for --group")?,
            "--channel-type" => {
                ctx.channel_type = match args
                    .next()
                    .ok_or("missing value for --channel-type")?
                    .as_str()
                {
                    "openai" => ChannelType::OpenAi,
                    "azure" => ChannelType::Azure,
                    "cloudflare" => ChannelType::Cloudflare,
                    "custom" => ChannelType::Custom,
                    other => return Err(format!("unknown channel type: {other}").into()),
                };
            }
            "--user" => user_seeds.push(args.next().ok_or("missing value for --user")?),
            "--consume-quota" => ctx.consume_quota = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => return Err(format!("unknown arg: {other}\n{USAGE}").into()),
        }
    }

    let tables = match tables_path {
        Some(path) => RatioTables::from_json_str(&std::fs::read_to_string(&path)?)?,
        None => RatioTables::default(),
    };

    let store = Arc::new(MemoryQuotaStore::new());
    for seed in user_seeds {
        let (user_id, quota) = seed.split_once('=').ok_or("user seed must be ID=QUOTA")?;
        store.set_user_quota(user_id.parse()?, quota.parse()?);
    }

    let state = RelayState::with_tables(RelaySettings::from_env(), store, tables)?;
    let app = llm_relay::relay::http::router(state).layer(Extension(ctx));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "llm-relay gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
