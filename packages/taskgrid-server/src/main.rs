use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use taskgrid_core::error::Identity;
use taskgrid_core::model::{Mode, SchedulerConfig};
use taskgrid_core::probe::NvmlProbe;
use taskgrid_core::registry::SchedulerRegistry;

mod config;
mod http;
mod log_binding;

use http::AppState;
use log_binding::FileLogBinding;

#[derive(Parser, Debug)]
#[command(name = "taskgrid-server", about = "GPU-aware task scheduler control plane")]
struct Args {
    /// Address to bind the HTTP control plane to.
    #[arg(long, default_value = "0.0.0.0:7600")]
    addr: std::net::SocketAddr,

    /// Directory holding one `<mode>_<index>.yaml` file per registered scheduler identity.
    #[arg(long, default_value = "./configs")]
    config_dir: PathBuf,

    /// Directory log files are written under, mirrored by mode/config_index/queue_id/process_index.
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,
}

/// Scan `config_dir` for `single_<n>.yaml` and `multi_<n>.yaml` files and
/// validate each into a `SchedulerConfig` keyed by its identity.
fn load_configs(config_dir: &Path) -> anyhow::Result<HashMap<Identity, SchedulerConfig>> {
    let mut configs = HashMap::new();
    if !config_dir.is_dir() {
        tracing::warn!(dir = %config_dir.display(), "config directory does not exist, starting with no registered schedulers");
        return Ok(configs);
    }

    for entry in std::fs::read_dir(config_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s,
            None => continue,
        };
        let (mode_part, index_part) = match stem.rsplit_once('_') {
            Some(parts) => parts,
            None => {
                tracing::warn!(file = %path.display(), "config filename does not match <mode>_<index>.yaml, skipping");
                continue;
            }
        };
        let mode = match mode_part {
            "single" => Mode::Single,
            "multi" => Mode::Multi,
            other => {
                tracing::warn!(file = %path.display(), mode = other, "unrecognized mode in config filename, skipping");
                continue;
            }
        };
        let config_index: u32 = match index_part.parse() {
            Ok(i) => i,
            Err(_) => {
                tracing::warn!(file = %path.display(), "config filename's index segment is not an integer, skipping");
                continue;
            }
        };

        let scheduler_config = config::load_from_yaml(&path, mode)?;
        configs.insert(Identity { mode, config_index }, scheduler_config);
    }

    Ok(configs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let probe = Arc::new(NvmlProbe::init()?);
    let log_binding = Arc::new(FileLogBinding::new(args.log_dir.clone()));
    let my_username = whoami();

    let configs = load_configs(&args.config_dir)?;
    tracing::info!(count = configs.len(), dir = %args.config_dir.display(), "loaded scheduler configurations");

    let registry = Arc::new(SchedulerRegistry::new(probe, log_binding.clone(), my_username));

    let state = AppState {
        registry,
        configs: Arc::new(configs),
        log_binding,
    };

    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    tracing::info!(addr = %args.addr, "taskgrid-server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}
