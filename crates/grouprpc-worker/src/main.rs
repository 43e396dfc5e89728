//! grouprpc worker - one member of a TCP process group.
//!
//! Joins the group described by a cluster file, serves the built-in
//! operations, performs the calls given on the command line (printing one
//! JSON line per call on stdout), then syncs with the group and shuts down.

mod calls;
mod handlers;

use anyhow::{anyhow, Result};
use calls::PlannedCall;
use clap::Parser;
use grouprpc::{ClusterConfig, ProcessGroupAgent, RpcAgent, TcpProcessGroup};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "grouprpc-worker")]
#[command(about = "Worker process for a grouprpc TCP process group")]
struct Args {
    /// This worker's name; must appear in the cluster file
    #[arg(short, long)]
    name: String,

    /// Cluster membership file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Call to make once the group is up, as DST:OP:JSON (repeatable)
    #[arg(long = "call", value_name = "DST:OP:JSON")]
    calls: Vec<PlannedCall>,

    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the call results.
    let directives = log_directives(args.debug, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring log filter '{}': {}", directives, e);
        EnvFilter::new("info")
    });
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting grouprpc worker '{}'", args.name);

    let cluster = ClusterConfig::load(&args.config)?;
    let rank = cluster.rank_of(&args.name).ok_or_else(|| {
        anyhow!(
            "worker '{}' is not listed in {}",
            args.name,
            args.config.display()
        )
    })?;

    let listener = TcpProcessGroup::bind(cluster.workers[rank].addr).await?;
    info!(
        "Worker '{}' (rank {} of {}) listening on {}",
        args.name,
        rank,
        cluster.workers.len(),
        listener.local_addr()
    );
    let group = listener.connect(rank, &cluster.addrs()).await?;

    let agent = ProcessGroupAgent::with_options(
        args.name.clone(),
        cluster.name_to_rank(),
        Arc::new(group),
        Arc::new(handlers::builtin_operations(&args.name)),
        cluster.agent_options(),
    )?;

    for call in &args.calls {
        let outcome = calls::perform(&agent, call).await;
        println!("{}", serde_json::to_string(&outcome)?);
    }

    agent.sync().await?;
    agent.join().await?;

    info!("Worker '{}' finished", args.name);
    Ok(())
}

/// Filter directives for the log subscriber: `--debug` wins, then `RUST_LOG`,
/// then `info`.
fn log_directives(debug: bool, rust_log: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directives_honour_rust_log() {
        assert_eq!(
            log_directives(false, Some("grouprpc=trace".to_string())),
            "grouprpc=trace"
        );
        assert!(EnvFilter::try_new(log_directives(false, Some("grouprpc=trace".to_string()))).is_ok());
    }

    #[test]
    fn test_log_directives_defaults() {
        assert_eq!(log_directives(false, None), "info");
        assert_eq!(log_directives(false, Some("  ".to_string())), "info");
        assert_eq!(log_directives(true, Some("warn".to_string())), "debug");
    }
}
