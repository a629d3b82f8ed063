//! Tether - upstream keepalive tooling entry point
//!
//! Loads an upstream configuration, reports what each group's keepalive cache
//! looks like, and can exercise a group against its live targets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use tether_common::init_tracing;
use tether_config::Config;
use tether_proxy::upstream::{build_groups, PeerOutcome, RequestContext, UpstreamGroup};

/// Tether - keepalive connection reuse for upstream groups
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "TETHER_CONFIG", default_value = "tether.kdl")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run select/release cycles against one upstream group
    Probe {
        /// Upstream group id
        #[arg(short = 'u', long = "upstream")]
        upstream: String,

        /// Number of requests to simulate
        #[arg(short = 'n', long = "requests", default_value_t = 10)]
        requests: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(if cli.verbose { "debug" } else { "info" })?;

    let config = Config::from_file(&cli.config).context("Failed to load configuration file")?;

    if cli.test {
        return test_config(&cli.config, &config);
    }

    match cli.command {
        Some(Commands::Probe { upstream, requests }) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(probe(&config, &upstream, requests))
        }
        None => test_config(&cli.config, &config),
    }
}

/// Validate the configuration and print each group's keepalive setting
fn test_config(path: &std::path::Path, config: &Config) -> Result<()> {
    // Building the groups catches errors the parser cannot see
    let groups = build_groups(config).context("Failed to initialize upstream groups")?;

    info!(upstreams = groups.len(), "Configuration test successful");
    for id in config.upstream_ids() {
        let upstream = &config.upstreams[id];
        match upstream.keepalive {
            Some(keepalive) => println!(
                "  upstream {}: {} target(s), {}, keepalive cached={}",
                id,
                upstream.targets.len(),
                upstream.load_balancing,
                keepalive.cached
            ),
            None => println!(
                "  upstream {}: {} target(s), {}, keepalive off",
                id,
                upstream.targets.len(),
                upstream.load_balancing
            ),
        }
    }

    println!(
        "tether: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

/// Push `requests` sequential requests through one group and report reuse
async fn probe(config: &Config, upstream: &str, requests: usize) -> Result<()> {
    let upstream_config = config
        .upstreams
        .get(upstream)
        .with_context(|| format!("Unknown upstream '{}'", upstream))?;
    let group = UpstreamGroup::from_config(upstream_config)?;

    for request in 0..requests {
        let mut state = group.init_peer(&RequestContext::new("GET", "/"))?;
        let connection = group
            .select(&mut state)
            .await
            .with_context(|| format!("Request {} could not get a connection", request))?;

        info!(
            request = request,
            connection = %connection.id(),
            target = %connection.address(),
            cached = connection.is_cached(),
            "Probe request"
        );
        group.release(&mut state, connection, PeerOutcome::Success).await;
    }

    match group.keepalive_stats() {
        Some(stats) => println!(
            "{}: {} request(s), {} reused, {} fresh, {} idle of {} (hit rate {:.0}%)",
            group.id(),
            requests,
            stats.hits,
            stats.misses,
            stats.idle,
            stats.capacity,
            stats.hit_rate() * 100.0
        ),
        None => println!(
            "{}: {} request(s), keepalive off, every request used a fresh connection",
            group.id(),
            requests
        ),
    }

    group.shutdown();
    Ok(())
}
