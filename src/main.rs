mod core;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::core::config::AppConfig;
use crate::core::event::InboundEvent;
use crate::core::processor::WebhookProcessor;
use crate::store::{RecordStore, fields, memory::InMemoryStore, rest::RestStore};

const DEFAULT_CONFIG_FILE: &str = "signbridge.toml";

struct CliArgs {
    config_path: PathBuf,
    dry_run: bool,
    verbose: bool,
}

fn parse_args(args: &[String]) -> CliArgs {
    let mut config_path = None;
    let mut dry_run = false;
    let mut verbose = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--dry-run" => {
                dry_run = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                verbose = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    let config_path = config_path
        .or_else(|| std::env::var("SIGNBRIDGE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    CliArgs {
        config_path,
        dry_run,
        verbose,
    }
}

/// Emit a terminal object for a failure that happened before the pipeline
/// could produce one.
fn emit_failure(error: &str, exit_code: i32) -> i32 {
    println!(
        "{}",
        json!({
            "ok": false,
            "source": "crm",
            "where": "webhook",
            "error": error,
        })
    );
    exit_code
}

async fn run(args: CliArgs) -> i32 {
    let config = match AppConfig::load(&args.config_path).await {
        Ok(config) => config,
        Err(e) => return emit_failure(&format!("config: {e:#}"), 2),
    };

    // The transport collaborator hands us exactly one line-delimited JSON
    // event on stdin.
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut line).await {
        Ok(_) => {}
        Err(e) => return emit_failure(&format!("could not read input: {e}"), 1),
    }
    let line = line.trim();
    if line.is_empty() {
        return emit_failure("empty input", 1);
    }
    let event: InboundEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => return emit_failure(&format!("malformed event: {e}"), 1),
    };

    let store: Arc<dyn RecordStore> = if args.dry_run {
        info!("dry run: processing against an in-memory record store");
        let memory = InMemoryStore::new();
        if let Some(envelope_id) = event.envelope_id.as_deref().map(str::trim)
            && !envelope_id.is_empty()
        {
            memory
                .seed(
                    &config.target.entity,
                    fields(json!({&config.target.key_field: envelope_id})),
                )
                .await;
        }
        Arc::new(memory)
    } else {
        if config.store.base_url.is_empty() {
            return emit_failure("config: store.base_url is not set", 2);
        }
        Arc::new(RestStore::new(&config.store))
    };

    let processor = WebhookProcessor::new(store, config);
    let result = processor.process(&event).await;
    println!("{}", result.to_json());
    result.exit_code()
}

#[tokio::main]
async fn main() {
    let args = parse_args(&std::env::args().collect::<Vec<_>>());

    // stdout carries the single terminal JSON object; all diagnostics go to
    // stderr.
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let code = run(args).await;
    std::process::exit(code);
}
