use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use construct_sandbox::{
    CancelHandle, EngineConfig, ExecutionRequest, Outcome, Sandbox, SecurityConfig,
};

const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

fn print_help() {
    println!(
        "\
construct-sandbox v{}

Runs one construct through the screening and isolation engine and prints
the execution result as JSON.

USAGE:
    construct-sandbox [OPTIONS] <SOURCE_FILE> <COMPONENT>

ARGUMENTS:
    SOURCE_FILE    Component source to execute
    COMPONENT      Exported component to render

OPTIONS:
    -c, --config <PATH>      Engine configuration [default: config/sandbox.toml]
    -p, --props <JSON>       Component props as a JSON object [default: {{}}]
    -s, --security <PATH>    JSON file holding the run's security config
        --screen-only        Only run the static screener
    -h, --help               Print this help message and exit
    -V, --version            Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, construct_sandbox=debug,warn)
    CONSTRUCT_SECRET_*    Secrets served by the local vault backend
    VAULT_TOKEN           Typical source for [vault.hashicorp] token

EXIT STATUS:
    0    success
    1    failed (runtime error, limit exceeded, cancelled)
    2    blocked by the screener

EXAMPLES:
    construct-sandbox card.js Card
    construct-sandbox -p '{{\"title\":\"Hi\"}}' card.js Card
    RUST_LOG=debug construct-sandbox -s policy.json card.js Card",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    props: Option<String>,
    security: Option<String>,
    screen_only: bool,
    source_file: String,
    component: String,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("construct-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                args.config = Some(iter.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "--props" | "-p" => {
                let props = iter.next().ok_or_else(|| anyhow!("{arg} needs a JSON object"))?;
                args.props = Some(props);
            }
            "--security" | "-s" => {
                args.security = Some(iter.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "--screen-only" => args.screen_only = true,
            other if other.starts_with('-') => bail!("Unknown option: {other} (see --help)"),
            _ => positional.push(arg.clone()),
        }
    }

    let [source_file, component]: [String; 2] = positional
        .try_into()
        .map_err(|_| anyhow!("Expected <SOURCE_FILE> <COMPONENT> (see --help)"))?;
    args.source_file = source_file;
    args.component = component;
    Ok(args)
}

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Ok(EngineConfig::load(DEFAULT_CONFIG_PATH)?)
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn parse_props(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("Invalid --props JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--props must be a JSON object"),
    }
}

fn load_security(path: Option<&str>) -> Result<SecurityConfig> {
    let Some(path) = path else {
        return Ok(SecurityConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read security config {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid security config {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode). Logs go to stderr
    // so stdout carries only the result.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("construct_sandbox=info")),
        )
        .init();

    let config = load_config(args.config.as_deref())?;
    info!("Runner: {}", config.runner_description());
    if let Some(ref vault) = config.vault {
        info!(
            "Vault: {} ({} allowed keys)",
            vault.backend.as_str(),
            vault.allowed_keys.len()
        );
    }

    let source = std::fs::read_to_string(&args.source_file)
        .with_context(|| format!("Failed to read {}", args.source_file))?;
    let sandbox = Sandbox::from_config(&config)?;

    if args.screen_only {
        let violations = sandbox.screener().screen(&source);
        println!("{}", serde_json::to_string_pretty(&violations)?);
        return Ok(());
    }

    let request = ExecutionRequest::new(source, &args.component)
        .with_props(parse_props(args.props.as_deref())?)
        .with_security_config(load_security(args.security.as_deref())?);

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, cancelling run");
            on_signal.cancel();
        }
    });

    info!("Executing {} from {}", args.component, args.source_file);
    let result = sandbox.execute_with_cancel(request, cancel).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result.outcome {
        Outcome::Success => Ok(()),
        Outcome::Failed => std::process::exit(1),
        Outcome::Blocked => std::process::exit(2),
    }
}
