//! 'main' for the lockstep runner process

mod suite;

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use lockstep_module_harness::{Harness, HarnessConfig};
use lockstep_module_sim_node::{DefaultRules, SimNode, SimNodeOptions};
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, filter, fmt, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::suite::TestGenerator;

fn default_config_path() -> PathBuf {
    PathBuf::from(option_env!("LOCKSTEP_DEFAULT_CONFIG").unwrap_or("lockstep.toml"))
}

#[derive(clap::Parser, Clone)]
struct Args {
    /// Path to configuration. Missing files fall back to built-in defaults.
    #[arg(long, default_value = default_config_path().into_os_string())]
    config: PathBuf,
    /// Number of simulated nodes, overriding the configuration.
    #[arg(long)]
    nodes: Option<usize>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunnerConfig {
    pub nodes: usize,
    pub blocks: usize,
    pub transactions: usize,
    pub validation_delay_ms: u64,
    pub max_tx_size: usize,
}

impl RunnerConfig {
    fn try_load(config: &Config) -> Result<Self> {
        let runner: RunnerConfig = config.clone().try_deserialize()?;
        if runner.nodes == 0 {
            bail!("at least one node is required");
        }
        Ok(runner)
    }

    fn node_options(&self) -> SimNodeOptions {
        SimNodeOptions {
            validation_delay: (self.validation_delay_ms > 0)
                .then(|| Duration::from_millis(self.validation_delay_ms)),
            ..SimNodeOptions::default()
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut builder = Config::builder()
        .add_source(File::from_str(include_str!("../config.default.toml"), FileFormat::Toml))
        .add_source(File::from(args.config.as_path()).required(false))
        .add_source(Environment::with_prefix("LOCKSTEP").try_parsing(true));
    if let Some(nodes) = args.nodes {
        builder = builder.set_override("nodes", nodes as i64)?;
    }
    Ok(builder.build()?)
}

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::try_parse()?;

    // Standard logging using RUST_LOG for log levels default to INFO for events only
    let fmt_layer = fmt::layer()
        .with_filter(EnvFilter::from_default_env().add_directive(filter::LevelFilter::INFO.into()))
        .with_filter(filter::filter_fn(|meta| meta.is_event()));
    Registry::default().with(fmt_layer).init();

    let config = load_config(&args)?;
    let runner = RunnerConfig::try_load(&config)?;
    let harness_config = HarnessConfig::try_load(&config)?;

    info!(nodes = runner.nodes, "starting simulated nodes");
    let options = runner.node_options();
    let rules = DefaultRules {
        max_tx_size: runner.max_tx_size,
    };
    let (connections, handles): (Vec<_>, Vec<_>) = (0..runner.nodes)
        .map(|n| SimNode::spawn(format!("sim{n}"), rules.clone(), options.clone()))
        .unzip();

    let mut harness = Harness::new(harness_config, connections);
    match harness.run(TestGenerator::new(&runner)).await {
        Ok(report) => {
            info!(tests = report.tests_passed, "all tests passed");
            for handle in &handles {
                info!(node = handle.name(), tip = ?handle.tip(), "final tip");
            }
            Ok(())
        }
        Err(e) => {
            error!("{e}");
            Err(e.into())
        }
    }
}
