mod backoff;
mod bridge;
mod config;
mod lifecycle;
mod paths;
mod plugin;
mod sandbox;
mod store;
mod wire;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backoff::RetryPolicy;
use crate::bridge::ExecutionBridge;
use crate::config::Config;
use crate::lifecycle::LifecycleSupervisor;
use crate::paths::PathTranslator;
use crate::plugin::{builtin, PluginRegistry};
use crate::sandbox::SandboxServer;
use crate::wire::SerializationGuard;

const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

fn print_help() {
    println!(
        "\
fluux-bridge v{}

Hosts agent plugins and executes their methods on behalf of sandboxed
sessions. Requests arrive as JSON lines on stdin, responses leave as JSON
lines on stdout. Logs go to stderr.

USAGE:
    fluux-bridge [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
        --list       Print the tool catalog as JSON and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, fluux_bridge=debug,warn)

EXAMPLES:
    fluux-bridge                            # uses {DEFAULT_CONFIG_PATH} if present
    fluux-bridge /etc/fluux/bridge.toml     # custom config path
    fluux-bridge --list                     # show mounted methods
    RUST_LOG=debug fluux-bridge             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Registers every enabled builtin plugin with its configured settings.
fn register_plugins(config: &Config, registry: &PluginRegistry) -> Result<()> {
    for plugin in builtin::all()? {
        let module = plugin.identity().module.to_string();
        if !config.is_enabled(&module) {
            info!("Plugin {module} disabled in config");
            continue;
        }
        let settings = config.plugin_settings(&module)?;
        registry.register(plugin, &settings)?;
    }

    for name in config.plugins.keys() {
        if config.is_enabled(name) && registry.get(name).is_none() {
            warn!("No plugin named '{name}', ignoring its config section");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut list_only = false;
    let mut config_arg = None;

    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-bridge v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--list" => list_only = true,
            other => config_arg = Some(other.to_string()),
        }
    }

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_bridge=info")),
        )
        .init();

    let config = match &config_arg {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)?
        }
        None => {
            info!("No {DEFAULT_CONFIG_PATH}, using defaults");
            Config::default()
        }
    };

    info!(
        "Sandbox areas: uploads {} -> {}, shared {} -> {}",
        config.bridge.uploads_marker.display(),
        config.bridge.uploads_root.display(),
        config.bridge.shared_marker.display(),
        config.bridge.sandboxes_root.display(),
    );

    let registry = Arc::new(PluginRegistry::new());
    register_plugins(&config, &registry)?;
    let ids: Vec<String> = registry.ids().iter().map(|id| id.to_string()).collect();
    info!("Registered {} plugins: {}", ids.len(), ids.join(", "));

    if list_only {
        println!("{}", serde_json::to_string_pretty(&registry.catalog())?);
        return Ok(());
    }

    let store = store::open(&config.store)?;
    let supervisor = Arc::new(LifecycleSupervisor::new(
        registry,
        store,
        RetryPolicy::from_config(&config.lifecycle),
    ));

    for (id, state) in supervisor.load_all().await {
        info!(plugin = %id, "Plugin {state}");
    }

    let bridge = Arc::new(ExecutionBridge::new(
        supervisor.clone(),
        PathTranslator::new(&config.bridge),
        SerializationGuard::from_config(&config.bridge),
    ));
    let server = SandboxServer::new(bridge);

    info!("✓ Bridge ready, reading frames from stdin");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let served = server
        .serve(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await;

    supervisor.unload_all().await;
    if let Err(e) = served {
        error!("Server error: {e:#}");
        std::process::exit(1);
    }
    // The blocking stdin reader cannot be cancelled; don't wait for it.
    std::process::exit(0);
}
