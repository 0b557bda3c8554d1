// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run report assembly and rendering
//!
//! The report is the operator's record of what a run did: stage results,
//! service states, warnings, every backup taken and every command issued.
//! It renders as readable text or as JSON for capture by other tooling,
//! and it is produced even when stages failed along the way.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::artifact::{BackupRecord, MutationRecord};
use crate::error::Result;
use crate::exec::ToolRecord;
use crate::pipeline::{
    ListenerCheck, PipelineOutcome, ServiceState, StageContext, StageRecord, StageStatus,
};
use crate::plan::RootLoginPolicy;

/// Complete record of one hardening run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub completed_at: String,
    pub dry_run: bool,
    pub admin_port: u16,
    pub root_login: RootLoginPolicy,
    pub stages: Vec<StageRecord>,
    pub stages_succeeded: usize,
    pub stages_failed: usize,
    pub total_duration_ms: u64,
    pub fatal_error: Option<String>,
    pub warnings: Vec<String>,
    pub services: BTreeMap<String, ServiceState>,
    pub backups: Vec<BackupRecord>,
    pub mutations: Vec<MutationRecord>,
    pub firewall_status: Option<String>,
    pub jail_status: Option<String>,
    pub listener_check: Option<ListenerCheck>,
    pub transcript: Vec<ToolRecord>,
}

impl RunReport {
    /// Collect everything the run produced into one report
    pub fn assemble(
        started: DateTime<Local>,
        ctx: &StageContext,
        outcome: &PipelineOutcome,
    ) -> Self {
        Self {
            started_at: started.format("%Y-%m-%d %H:%M:%S").to_string(),
            completed_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            dry_run: ctx.store.dry_run(),
            admin_port: ctx.plan.admin_port,
            root_login: ctx.plan.root_login,
            stages: outcome.records.clone(),
            stages_succeeded: outcome.stages_succeeded,
            stages_failed: outcome.stages_failed,
            total_duration_ms: outcome.total_duration_ms,
            fatal_error: outcome.fatal_error.clone(),
            warnings: ctx.warnings.clone(),
            services: ctx.services.clone(),
            backups: ctx.store.backups().to_vec(),
            mutations: ctx.store.mutations().to_vec(),
            firewall_status: ctx.firewall_status.clone(),
            jail_status: ctx.jail_status.clone(),
            listener_check: ctx.listener_check.clone(),
            transcript: ctx.tools.transcript().to_vec(),
        }
    }

    /// Render the report for a terminal
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("=== Hardening Report ===\n");
        out.push_str(&format!("Started:    {}\n", self.started_at));
        out.push_str(&format!("Completed:  {}\n", self.completed_at));
        if self.dry_run {
            out.push_str("Mode:       DRY RUN (no changes were made)\n");
        }
        out.push_str(&format!("Admin port: {}\n", self.admin_port));
        out.push_str(&format!("Root login: {}\n", self.root_login));

        out.push_str("\n=== Stages ===\n");
        for record in &self.stages {
            let detail = record
                .summary
                .as_deref()
                .or(record.error.as_deref())
                .unwrap_or("");
            out.push_str(&format!(
                "  {:<8} {:<20} {} ({} ms)\n",
                record.status.to_string(),
                record.stage,
                detail,
                record.duration_ms
            ));
        }

        if !self.services.is_empty() {
            out.push_str("\n=== Services ===\n");
            for (service, state) in &self.services {
                out.push_str(&format!("  {:<26} {}\n", service, state));
            }
        }

        if let Some(ref check) = self.listener_check {
            out.push_str("\n=== Listener verification ===\n");
            out.push_str(&format!(
                "  administrative port listening: {}\n",
                if check.admin_port_listening { "yes" } else { "NO" }
            ));
            if !check.retired_still_listening.is_empty() {
                out.push_str(&format!(
                    "  retired ports still listening: {:?}\n",
                    check.retired_still_listening
                ));
            }
            if !check.unexpected.is_empty() {
                out.push_str(&format!(
                    "  unexpected listeners: {:?}\n",
                    check.unexpected
                ));
            }
        }

        if !self.warnings.is_empty() {
            out.push_str("\n=== Warnings ===\n");
            for warning in &self.warnings {
                out.push_str(&format!("  - {}\n", warning));
            }
        }

        if !self.backups.is_empty() {
            out.push_str("\n=== Backups ===\n");
            for backup in &self.backups {
                out.push_str(&format!(
                    "  {} -> {}\n",
                    backup.original.display(),
                    backup.backup.display()
                ));
            }
        }

        out.push_str("\n=== Next steps ===\n");
        out.push_str("  - Keep this session open until the new access is confirmed.\n");
        out.push_str(&format!(
            "  - From a NEW terminal: ssh -p {} root@<this host>\n",
            self.admin_port
        ));
        out.push_str("  - Inspect the firewall: ufw status verbose\n");
        out.push_str("  - Inspect the jail:     fail2ban-client status sshd\n");

        match self.fatal_error {
            Some(ref error) => {
                out.push_str(&format!("\nRun FAILED: {}\n", error));
            }
            None => {
                out.push_str(&format!(
                    "\nSummary: {}/{} stages succeeded in {} ms\n",
                    self.stages_succeeded,
                    self.stages.len(),
                    self.total_duration_ms
                ));
            }
        }

        out
    }

    /// Render the report as pretty-printed JSON
    pub fn render_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exit-status view of the run: fatal failures make the run fail,
    /// recoverable ones do not
    pub fn failed(&self) -> bool {
        self.fatal_error.is_some()
    }

    /// Count of stages that were never reached
    pub fn stages_skipped(&self) -> usize {
        self.stages
            .iter()
            .filter(|record| record.status == StageStatus::NotAttempted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::exec::DryRunTools;
    use crate::layout::HostPaths;
    use crate::pipeline::Pipeline;
    use crate::plan::{HardeningPlan, PlanFile};
    use crate::stages::standard_stages;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGJqc2Rm9s8PZK3mYH5K1DdGvQxkU5n0yFhW4qJrT2aB ops@bastion";

    async fn report_from_run() -> RunReport {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc/ssh")).unwrap();
        std::fs::write(
            root.path().join("etc/ssh/sshd_config"),
            "Port 22\nPasswordAuthentication yes\n",
        )
        .unwrap();

        let plan = HardeningPlan::assemble(KEY, Some(2218), PlanFile::default()).unwrap();
        let mut ctx = StageContext::new(
            plan,
            HostPaths::new(root.path()),
            ArtifactStore::new(true),
            Box::new(DryRunTools::new()),
        );

        let started = Local::now();
        let outcome = Pipeline::new(standard_stages()).run(&mut ctx).await;
        RunReport::assemble(started, &ctx, &outcome)
    }

    #[tokio::test]
    async fn test_text_report_carries_every_section() {
        let report = report_from_run().await;
        let text = report.render_text();

        assert!(text.contains("=== Hardening Report ==="));
        assert!(text.contains("Mode:       DRY RUN"));
        assert!(text.contains("Admin port: 2218"));
        assert!(text.contains("=== Stages ==="));
        assert!(text.contains("preflight"));
        assert!(text.contains("activation"));
        assert!(text.contains("=== Next steps ==="));
        assert!(text.contains("ssh -p 2218"));
        assert!(text.contains("Summary: 8/8 stages succeeded"));
        assert!(!report.failed());
    }

    #[tokio::test]
    async fn test_json_report_round_trips() {
        let report = report_from_run().await;
        let json = report.render_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["admin_port"], 2218);
        assert_eq!(value["dry_run"], true);
        assert_eq!(value["root_login"], "key-only");
        assert_eq!(value["stages"].as_array().unwrap().len(), 8);
        assert_eq!(value["stages"][0]["stage"], "preflight");
        assert_eq!(value["stages"][0]["status"], "succeeded");
        assert!(value["transcript"].as_array().unwrap().len() > 5);
        assert_eq!(value["fatal_error"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_skipped_stage_accounting() {
        let report = report_from_run().await;
        assert_eq!(report.stages_skipped(), 0);
    }
}
