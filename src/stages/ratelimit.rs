// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection rate limiting
//!
//! Throttles new TCP connections to the administrative port with
//! iptables. Rules are inserted at the top of INPUT so they run before
//! the ufw chains, and each insert is preceded by a `-C` probe so
//! repeated runs never stack duplicates. A rules.v4 file provides boot
//! persistence through iptables-persistent; its chain policies stay
//! ACCEPT so it cooperates with ufw instead of replacing it.

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::ToolCall;
use crate::plan::HardeningPlan;
use crate::pipeline::{Stage, StageContext};

/// INPUT rules in insertion order: loopback accept, established accept,
/// limited accept for new connections to the administrative port, then
/// the drop for whatever exceeds the limit.
pub fn input_rules(plan: &HardeningPlan) -> Vec<Vec<String>> {
    let port = plan.admin_port.to_string();
    let rate = format!("{}/minute", plan.rate_limit.per_minute);
    let burst = plan.rate_limit.burst.to_string();
    vec![
        vec!["-i".into(), "lo".into(), "-j".into(), "ACCEPT".into()],
        vec![
            "-m".into(),
            "conntrack".into(),
            "--ctstate".into(),
            "ESTABLISHED,RELATED".into(),
            "-j".into(),
            "ACCEPT".into(),
        ],
        vec![
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port.clone(),
            "-m".into(),
            "conntrack".into(),
            "--ctstate".into(),
            "NEW".into(),
            "-m".into(),
            "limit".into(),
            "--limit".into(),
            rate,
            "--limit-burst".into(),
            burst,
            "-j".into(),
            "ACCEPT".into(),
        ],
        vec![
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port,
            "-m".into(),
            "conntrack".into(),
            "--ctstate".into(),
            "NEW".into(),
            "-j".into(),
            "DROP".into(),
        ],
    ]
}

pub fn rules_file_content(plan: &HardeningPlan) -> String {
    let mut content = String::from(
        "# Managed by redoubt. Rate limiting for the administrative port.\n\
         *filter\n\
         :INPUT ACCEPT [0:0]\n\
         :FORWARD ACCEPT [0:0]\n\
         :OUTPUT ACCEPT [0:0]\n",
    );
    for rule in input_rules(plan) {
        content.push_str("-A INPUT ");
        content.push_str(&rule.join(" "));
        content.push('\n');
    }
    content.push_str("COMMIT\n");
    content
}

pub struct RateLimitStage;

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        ctx.ensure_package("iptables").await?;
        ctx.ensure_package("iptables-persistent").await?;

        let target = ctx.paths.iptables_rules();
        ctx.store
            .write_file(&target, &rules_file_content(&ctx.plan), 0o644)?;

        let rules = input_rules(&ctx.plan);
        let mut inserted = 0usize;
        for (index, rule) in rules.iter().enumerate() {
            if !ctx.tools.dry_run() {
                let probe = ctx
                    .tools
                    .run_unchecked(ToolCall::new("iptables").args(["-C", "INPUT"]).args(rule))
                    .await?;
                if probe.success {
                    continue;
                }
            }
            let position = (index + 1).to_string();
            ctx.tools
                .run(
                    ToolCall::new("iptables")
                        .args(["-I", "INPUT", position.as_str()])
                        .args(rule),
                )
                .await?;
            inserted += 1;
        }

        Ok(format!(
            "port {} limited to {} new connections/minute (burst {}); {} rule(s) inserted",
            ctx.plan.admin_port, ctx.plan.rate_limit.per_minute, ctx.plan.rate_limit.burst, inserted
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::exec::{DryRunTools, ToolOutcome, ToolOutput, ToolRecord, ToolRunner};
    use crate::layout::HostPaths;
    use crate::plan::PlanFile;
    use async_trait::async_trait;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGJqc2Rm9s8PZK3mYH5K1DdGvQxkU5n0yFhW4qJrT2aB ops@bastion";

    fn plan() -> HardeningPlan {
        HardeningPlan::assemble(KEY, Some(2218), PlanFile::default()).unwrap()
    }

    /// Answers success to everything, including `-C` probes, as a host
    /// that already carries every rule would
    struct ProbeTools {
        transcript: Vec<ToolRecord>,
    }

    #[async_trait]
    impl ToolRunner for ProbeTools {
        async fn run_unchecked(&mut self, call: ToolCall) -> Result<ToolOutput> {
            self.transcript.push(ToolRecord {
                command: call.rendered(),
                outcome: ToolOutcome::Completed { exit_code: Some(0) },
            });
            Ok(ToolOutput {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn dry_run(&self) -> bool {
            false
        }

        fn transcript(&self) -> &[ToolRecord] {
            &self.transcript
        }
    }

    #[test]
    fn test_rules_file_limits_then_drops() {
        let content = rules_file_content(&plan());
        assert!(content.starts_with("# Managed by redoubt."));
        assert!(content.contains(":INPUT ACCEPT [0:0]"));
        assert!(content.contains("--limit 6/minute"));
        assert!(content.contains("--limit-burst 4"));
        assert!(content.ends_with("COMMIT\n"));

        let limit_line = content
            .lines()
            .position(|l| l.contains("--limit"))
            .unwrap();
        let drop_line = content
            .lines()
            .position(|l| l.ends_with("-j DROP"))
            .unwrap();
        assert!(limit_line < drop_line);
    }

    #[tokio::test]
    async fn test_dry_run_inserts_without_probing() {
        let mut ctx = StageContext::new(
            plan(),
            HostPaths::new("/nonexistent-ratelimit-test-root"),
            ArtifactStore::new(true),
            Box::new(DryRunTools::new()),
        );

        let summary = RateLimitStage.run(&mut ctx).await.unwrap();
        assert!(summary.contains("4 rule(s) inserted"));

        let commands: Vec<&str> = ctx
            .tools
            .transcript()
            .iter()
            .map(|record| record.command.as_str())
            .collect();
        assert!(commands.iter().all(|c| !c.contains("iptables -C")));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("iptables -I INPUT 1 -i lo")));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("iptables -I INPUT 4") && c.ends_with("-j DROP")));
    }

    #[tokio::test]
    async fn test_present_rules_are_probed_not_reinserted() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = StageContext::new(
            plan(),
            HostPaths::new(root.path()),
            ArtifactStore::new(false),
            Box::new(ProbeTools {
                transcript: Vec::new(),
            }),
        );

        let summary = RateLimitStage.run(&mut ctx).await.unwrap();
        assert!(summary.contains("0 rule(s) inserted"));

        let commands: Vec<&str> = ctx
            .tools
            .transcript()
            .iter()
            .map(|record| record.command.as_str())
            .collect();
        let probes = commands
            .iter()
            .filter(|c| c.starts_with("iptables -C INPUT"))
            .count();
        assert_eq!(probes, 4);
        assert!(!commands.iter().any(|c| c.starts_with("iptables -I")));
    }

    #[tokio::test]
    async fn test_existing_ruleset_is_backed_up() {
        let root = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(root.path());
        std::fs::create_dir_all(paths.iptables_rules().parent().unwrap()).unwrap();
        std::fs::write(paths.iptables_rules(), "*filter\nCOMMIT\n").unwrap();

        let mut ctx = StageContext::new(
            plan(),
            paths.clone(),
            ArtifactStore::new(false),
            Box::new(DryRunTools::new()),
        );
        RateLimitStage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.store.backups().len(), 1);
        assert_eq!(
            std::fs::read_to_string(&ctx.store.backups()[0].backup).unwrap(),
            "*filter\nCOMMIT\n"
        );
        assert!(std::fs::read_to_string(paths.iptables_rules())
            .unwrap()
            .contains("--limit 6/minute"));
    }
}
