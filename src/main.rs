//! jqcache - Fetch J-Quants API data through a local snapshot cache
//!
//! Binary entry point: parses arguments, builds the cached client, performs
//! the fetch, and prints the result as JSON on stdout. Logs go to stderr and
//! are controlled with `RUST_LOG`.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jqcache::api::ApiClient;
use jqcache::cache::CachedClient;
use jqcache::cli::{Cli, RunConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunConfig::from_cli(cli)?;

    let api = match &config.refresh_token {
        Some(token) => ApiClient::with_config(token.clone(), config.client.clone()),
        None => ApiClient::from_env_with_config(config.client.clone())?,
    };
    let mut client = CachedClient::new(api, config.cache_dir.clone(), config.base_datetime);

    if config.records {
        for row in client.get_records(&config.resource_path).await? {
            println!("{}", serde_json::to_string(&row)?);
        }
    } else {
        let data = client.get_data(&config.resource_path).await?;
        let rendered = if config.pretty {
            serde_json::to_string_pretty(&data)?
        } else {
            serde_json::to_string(&data)?
        };
        println!("{rendered}");
    }

    Ok(())
}
