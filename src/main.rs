// SPDX-License-Identifier: AGPL-3.0-or-later
//! redoubt: single-host hardening orchestration
//!
//! One invocation takes a fresh host to a locked-down baseline and prints
//! a full report of what changed.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redoubt::{
    ArtifactStore, DryRunTools, HardeningPlan, HostPaths, PlanFile, RunReport, StageContext,
    SystemTools, ToolRunner,
};

/// Harden this host: key-only SSH on a new port, default-deny firewall,
/// kernel parameters, rate limiting and intrusion prevention
#[derive(Parser, Debug)]
#[command(name = "redoubt")]
#[command(author, version, long_about = None)]
struct Cli {
    /// OpenSSH public key granted administrative access, in
    /// authorized_keys format (quote the whole line)
    #[arg(value_name = "PUBKEY")]
    credential: String,

    /// Administrative SSH port; required here or in the plan file
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Plan file path
    #[arg(short, long, default_value = "redoubt.toml")]
    config: PathBuf,

    /// Filesystem root to operate on
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Record every action without touching the host
    #[arg(long)]
    dry_run: bool,

    /// Report format (text, json)
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON for capture by other tooling
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .init();

    let file = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading plan file");
        PlanFile::from_file(&cli.config)
            .with_context(|| format!("failed to load plan file {}", cli.config.display()))?
    } else {
        PlanFile::default()
    };

    let plan = HardeningPlan::assemble(&cli.credential, cli.port, file)?;

    let tools: Box<dyn ToolRunner> = if cli.dry_run {
        Box::new(DryRunTools::new())
    } else {
        Box::new(SystemTools::new())
    };
    let mut ctx = StageContext::new(
        plan,
        HostPaths::new(&cli.root),
        ArtifactStore::new(cli.dry_run),
        tools,
    );

    if cli.dry_run {
        println!(
            "[DRY RUN] Hardening plan for administrative port {} (nothing will be changed)",
            ctx.plan.admin_port
        );
    } else {
        println!(
            "Hardening host: administrative port {}, root login {}",
            ctx.plan.admin_port, ctx.plan.root_login
        );
    }
    println!();

    let started = chrono::Local::now();
    let outcome = redoubt::standard_pipeline().run(&mut ctx).await;
    let report = RunReport::assemble(started, &ctx, &outcome);

    println!();
    match cli.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.render_json()?),
    }

    if report.failed() {
        std::process::exit(1);
    }

    Ok(())
}
