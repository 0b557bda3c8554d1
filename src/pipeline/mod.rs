// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage pipeline
//!
//! A hardening run is an ordered sequence of stages sharing one mutable
//! context. Stages are fatal or recoverable: a fatal failure halts the run
//! and everything after it is reported as not attempted, a recoverable
//! failure is recorded and the run continues. Nothing runs concurrently
//! and nothing is retried.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::exec::{ToolCall, ToolRunner};
use crate::layout::HostPaths;
use crate::plan::HardeningPlan;

/// Lifecycle state of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    NotInstalled,
    InstalledStopped,
    Running,
    RunningVerified,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::NotInstalled => write!(formatter, "not installed"),
            ServiceState::InstalledStopped => write!(formatter, "installed (stopped)"),
            ServiceState::Running => write!(formatter, "running"),
            ServiceState::RunningVerified => write!(formatter, "running (verified)"),
        }
    }
}

/// Terminal status of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Succeeded,
    FailedFatal,
    FailedRecoverable,
    NotAttempted,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Succeeded => write!(formatter, "OK"),
            StageStatus::FailedFatal => write!(formatter, "FAILED"),
            StageStatus::FailedRecoverable => write!(formatter, "DEGRADED"),
            StageStatus::NotAttempted => write!(formatter, "SKIPPED"),
        }
    }
}

/// Result of running (or skipping) a single stage
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Listening-socket verification results from the activation stage
#[derive(Debug, Clone, Serialize)]
pub struct ListenerCheck {
    /// Whether the administrative port has a listener
    pub admin_port_listening: bool,
    /// Retired ports that still have a listener
    pub retired_still_listening: Vec<u16>,
    /// Externally reachable listeners the plan does not account for
    pub unexpected: Vec<u16>,
}

impl ListenerCheck {
    /// True when the converged state matches the plan
    pub fn clean(&self) -> bool {
        self.admin_port_listening
            && self.retired_still_listening.is_empty()
            && self.unexpected.is_empty()
    }
}

/// Shared state the stages read and mutate
pub struct StageContext {
    pub plan: HardeningPlan,
    pub paths: HostPaths,
    pub store: ArtifactStore,
    pub tools: Box<dyn ToolRunner>,

    /// States of the services the run manages
    pub services: BTreeMap<String, ServiceState>,

    /// Names of stages that completed successfully
    pub completed: BTreeSet<String>,

    /// Operator-facing warnings collected along the way
    pub warnings: Vec<String>,

    /// Captured `ufw status verbose` output, when available
    pub firewall_status: Option<String>,

    /// Captured jail status output, when available
    pub jail_status: Option<String>,

    /// Socket verification results, when the activation stage ran them
    pub listener_check: Option<ListenerCheck>,

    package_index_refreshed: bool,
}

impl StageContext {
    pub fn new(
        plan: HardeningPlan,
        paths: HostPaths,
        store: ArtifactStore,
        tools: Box<dyn ToolRunner>,
    ) -> Self {
        Self {
            plan,
            paths,
            store,
            tools,
            services: BTreeMap::new(),
            completed: BTreeSet::new(),
            warnings: Vec::new(),
            firewall_status: None,
            jail_status: None,
            listener_check: None,
            package_index_refreshed: false,
        }
    }

    /// Record a warning for the final report
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Install a package unless it is already present
    ///
    /// Returns true when the package was installed by this call. The
    /// package index is refreshed once per run, before the first install.
    pub async fn ensure_package(&mut self, package: &str) -> Result<bool> {
        if !self.tools.dry_run() {
            let probe = self
                .tools
                .run_unchecked(ToolCall::new("dpkg").args(["-s", package]))
                .await;
            if let Ok(output) = probe {
                if output.success {
                    debug!(package = package, "Package already installed");
                    return Ok(false);
                }
            }
        }

        if !self.package_index_refreshed {
            self.tools
                .run(
                    ToolCall::new("apt-get")
                        .arg("update")
                        .env("DEBIAN_FRONTEND", "noninteractive")
                        .timeout_secs(600),
                )
                .await?;
            self.package_index_refreshed = true;
        }

        info!(package = package, "Installing package");
        self.tools
            .run(
                ToolCall::new("apt-get")
                    .args(["install", "-y", package])
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout_secs(900),
            )
            .await?;
        Ok(true)
    }
}

/// One step of the hardening sequence
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs and the report
    fn name(&self) -> &'static str;

    /// Whether a failure here halts the rest of the run
    fn fatal(&self) -> bool;

    /// Run the stage, returning a one-line summary
    async fn run(&self, ctx: &mut StageContext) -> Result<String>;
}

/// Outcome of a whole pipeline run
#[derive(Debug)]
pub struct PipelineOutcome {
    pub records: Vec<StageRecord>,
    pub fatal_error: Option<String>,
    pub stages_succeeded: usize,
    pub stages_failed: usize,
    pub total_duration_ms: u64,
}

impl PipelineOutcome {
    /// True when no stage failed at all
    pub fn flawless(&self) -> bool {
        self.fatal_error.is_none() && self.stages_failed == 0
    }
}

/// Sequential stage runner
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage in order, halting on the first fatal failure
    pub async fn run(&self, ctx: &mut StageContext) -> PipelineOutcome {
        let start_time = Instant::now();
        let total = self.stages.len();
        let mut records = Vec::with_capacity(total);
        let mut fatal_error: Option<String> = None;
        let mut stages_succeeded = 0usize;
        let mut stages_failed = 0usize;

        info!(stages = total, "Starting hardening run");

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();

            if fatal_error.is_some() {
                debug!(stage = name, "Skipping stage after fatal failure");
                records.push(StageRecord {
                    stage: name.to_string(),
                    status: StageStatus::NotAttempted,
                    summary: None,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            println!("[{}/{}] {}", index + 1, total, name);
            info!(stage = name, "Starting stage");
            let stage_start = Instant::now();
            let result = stage.run(ctx).await;
            let duration_ms = stage_start.elapsed().as_millis() as u64;

            match result {
                Ok(summary) => {
                    stages_succeeded += 1;
                    ctx.completed.insert(name.to_string());
                    println!("      {}", summary);
                    info!(stage = name, duration_ms, "Stage completed");
                    records.push(StageRecord {
                        stage: name.to_string(),
                        status: StageStatus::Succeeded,
                        summary: Some(summary),
                        error: None,
                        duration_ms,
                    });
                }
                Err(e) => {
                    stages_failed += 1;
                    let message = e.to_string();
                    if stage.fatal() {
                        println!("      FATAL: {}", message);
                        error!(stage = name, error = %message, "Fatal stage failure, halting");
                        records.push(StageRecord {
                            stage: name.to_string(),
                            status: StageStatus::FailedFatal,
                            summary: None,
                            error: Some(message.clone()),
                            duration_ms,
                        });
                        fatal_error = Some(format!("{}: {}", name, message));
                    } else {
                        println!("      FAILED (continuing): {}", message);
                        error!(stage = name, error = %message, "Stage failed, continuing");
                        records.push(StageRecord {
                            stage: name.to_string(),
                            status: StageStatus::FailedRecoverable,
                            summary: None,
                            error: Some(message),
                            duration_ms,
                        });
                    }
                }
            }
        }

        let total_duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            succeeded = stages_succeeded,
            failed = stages_failed,
            duration_ms = total_duration_ms,
            "Hardening run finished"
        );

        PipelineOutcome {
            records,
            fatal_error,
            stages_succeeded,
            stages_failed,
            total_duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RedoubtError;
    use crate::exec::DryRunTools;
    use crate::plan::PlanFile;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGJqc2Rm9s8PZK3mYH5K1DdGvQxkU5n0yFhW4qJrT2aB ops@bastion";

    fn context() -> StageContext {
        let plan = HardeningPlan::assemble(KEY, Some(2218), PlanFile::default()).unwrap();
        StageContext::new(
            plan,
            HostPaths::new("/nonexistent-pipeline-test-root"),
            ArtifactStore::new(true),
            Box::new(DryRunTools::new()),
        )
    }

    struct FixedStage {
        name: &'static str,
        fatal: bool,
        fail: bool,
    }

    #[async_trait]
    impl Stage for FixedStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fatal(&self) -> bool {
            self.fatal
        }

        async fn run(&self, _ctx: &mut StageContext) -> Result<String> {
            if self.fail {
                Err(RedoubtError::ToolFailed {
                    tool: "test".to_string(),
                    message: "scripted failure".to_string(),
                })
            } else {
                Ok("done".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let pipeline = Pipeline::new(vec![
            Box::new(FixedStage { name: "one", fatal: true, fail: false }),
            Box::new(FixedStage { name: "two", fatal: false, fail: false }),
        ]);
        let mut ctx = context();
        let outcome = pipeline.run(&mut ctx).await;

        assert!(outcome.flawless());
        assert_eq!(outcome.stages_succeeded, 2);
        assert!(ctx.completed.contains("one"));
        assert!(ctx.completed.contains("two"));
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_and_skips_the_rest() {
        let pipeline = Pipeline::new(vec![
            Box::new(FixedStage { name: "opener", fatal: true, fail: false }),
            Box::new(FixedStage { name: "breaker", fatal: true, fail: true }),
            Box::new(FixedStage { name: "never", fatal: false, fail: false }),
        ]);
        let mut ctx = context();
        let outcome = pipeline.run(&mut ctx).await;

        assert!(outcome.fatal_error.is_some());
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[1].status, StageStatus::FailedFatal);
        assert_eq!(outcome.records[2].status, StageStatus::NotAttempted);
        assert!(!ctx.completed.contains("never"));
    }

    #[tokio::test]
    async fn test_recoverable_failure_continues() {
        let pipeline = Pipeline::new(vec![
            Box::new(FixedStage { name: "soft", fatal: false, fail: true }),
            Box::new(FixedStage { name: "after", fatal: true, fail: false }),
        ]);
        let mut ctx = context();
        let outcome = pipeline.run(&mut ctx).await;

        assert!(outcome.fatal_error.is_none());
        assert!(!outcome.flawless());
        assert_eq!(outcome.records[0].status, StageStatus::FailedRecoverable);
        assert_eq!(outcome.records[1].status, StageStatus::Succeeded);
        assert_eq!(outcome.stages_succeeded, 1);
        assert_eq!(outcome.stages_failed, 1);
    }

    #[tokio::test]
    async fn test_ensure_package_in_dry_run_records_install() {
        let mut ctx = context();
        let installed = ctx.ensure_package("ufw").await.unwrap();
        assert!(installed);

        let commands: Vec<_> = ctx
            .tools
            .transcript()
            .iter()
            .map(|record| record.command.clone())
            .collect();
        assert!(commands.iter().any(|c| c == "apt-get update"));
        assert!(commands.iter().any(|c| c == "apt-get install -y ufw"));
    }

    #[tokio::test]
    async fn test_package_index_refreshed_once() {
        let mut ctx = context();
        ctx.ensure_package("ufw").await.unwrap();
        ctx.ensure_package("fail2ban").await.unwrap();

        let updates = ctx
            .tools
            .transcript()
            .iter()
            .filter(|record| record.command == "apt-get update")
            .count();
        assert_eq!(updates, 1);
    }

    #[test]
    fn test_status_and_service_state_display() {
        assert_eq!(format!("{}", StageStatus::Succeeded), "OK");
        assert_eq!(format!("{}", StageStatus::FailedFatal), "FAILED");
        assert_eq!(format!("{}", StageStatus::FailedRecoverable), "DEGRADED");
        assert_eq!(format!("{}", StageStatus::NotAttempted), "SKIPPED");
        assert_eq!(format!("{}", ServiceState::RunningVerified), "running (verified)");
    }
}
