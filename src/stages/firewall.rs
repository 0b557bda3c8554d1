// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firewall policy
//!
//! Drives ufw through a fixed sequence: reset, default deny inbound /
//! allow outbound, explicit allows (administrative port first, then
//! service ports and trusted sources), best-effort removal of retired
//! port rules, then activation. The allow rule for the administrative
//! port always exists before the firewall is enabled and long before the
//! SSH daemon restarts onto that port.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::exec::ToolCall;
use crate::pipeline::{ServiceState, Stage, StageContext};

pub struct FirewallStage;

#[async_trait]
impl Stage for FirewallStage {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let admin_port = ctx.plan.admin_port;
        let service_ports = ctx.plan.service_ports.clone();
        let trusted_sources = ctx.plan.trusted_sources.clone();
        let retired_ports = ctx.plan.retired_ports.clone();

        ctx.ensure_package("ufw").await?;

        ctx.tools
            .run(ToolCall::new("ufw").args(["--force", "reset"]))
            .await?;
        ctx.tools
            .run(ToolCall::new("ufw").args(["default", "deny", "incoming"]))
            .await?;
        ctx.tools
            .run(ToolCall::new("ufw").args(["default", "allow", "outgoing"]))
            .await?;

        // The administrative port is opened before anything else.
        let admin_rule = format!("{}/tcp", admin_port);
        ctx.tools
            .run(ToolCall::new("ufw").args(["allow", admin_rule.as_str()]))
            .await?;

        let mut allow_rules = 1usize;
        for service_port in &service_ports {
            let rule = service_port.to_string();
            ctx.tools
                .run(ToolCall::new("ufw").args(["allow", rule.as_str()]))
                .await?;
            allow_rules += 1;
        }
        for source in &trusted_sources {
            ctx.tools
                .run(ToolCall::new("ufw").args(["allow", "from", source.as_str()]))
                .await?;
            allow_rules += 1;
        }

        // Retired rules may not exist on a fresh host; removal is
        // best-effort by contract.
        for retired in &retired_ports {
            let rule = format!("{}/tcp", retired);
            let removal = ctx
                .tools
                .run_unchecked(ToolCall::new("ufw").args(["delete", "allow", rule.as_str()]))
                .await?;
            if !removal.success {
                debug!(port = retired, "No allow rule to delete for retired port");
            }
        }

        ctx.tools
            .run(ToolCall::new("ufw").args(["--force", "enable"]))
            .await?;
        ctx.services.insert("ufw".to_string(), ServiceState::Running);

        let status = ctx
            .tools
            .run_unchecked(ToolCall::new("ufw").args(["status", "verbose"]))
            .await?;
        if status.success && !status.stdout.trim().is_empty() {
            ctx.firewall_status = Some(status.stdout.trim().to_string());
        }

        Ok(format!(
            "inbound denied by default; {} allow rule(s); {} retired port(s) closed",
            allow_rules,
            retired_ports.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::exec::DryRunTools;
    use crate::layout::HostPaths;
    use crate::plan::{HardeningPlan, PlanFile};

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGJqc2Rm9s8PZK3mYH5K1DdGvQxkU5n0yFhW4qJrT2aB ops@bastion";

    fn context(file: PlanFile) -> StageContext {
        let plan = HardeningPlan::assemble(KEY, Some(2218), file).unwrap();
        StageContext::new(
            plan,
            HostPaths::new("/nonexistent-firewall-test-root"),
            ArtifactStore::new(true),
            Box::new(DryRunTools::new()),
        )
    }

    fn commands(ctx: &StageContext) -> Vec<String> {
        ctx.tools
            .transcript()
            .iter()
            .map(|record| record.command.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_command_sequence_and_ordering() {
        let file = PlanFile {
            service_ports: vec!["80/tcp".parse().unwrap(), "443/tcp".parse().unwrap()],
            ..PlanFile::default()
        };
        let mut ctx = context(file);
        FirewallStage.run(&mut ctx).await.unwrap();

        let commands = commands(&ctx);
        let position = |needle: &str| {
            commands
                .iter()
                .position(|c| c == needle)
                .unwrap_or_else(|| panic!("missing command: {}", needle))
        };

        assert!(position("ufw default deny incoming") < position("ufw allow 2218/tcp"));
        assert!(position("ufw allow 2218/tcp") < position("ufw allow 80/tcp"));
        assert!(position("ufw allow 443/tcp") < position("ufw delete allow 22/tcp"));
        assert!(position("ufw delete allow 22/tcp") < position("ufw --force enable"));
        assert_eq!(ctx.services.get("ufw"), Some(&ServiceState::Running));
    }

    #[tokio::test]
    async fn test_trusted_sources_get_allow_rules() {
        let file = PlanFile {
            trusted_sources: vec!["203.0.113.0/24".to_string()],
            ..PlanFile::default()
        };
        let mut ctx = context(file);
        let summary = FirewallStage.run(&mut ctx).await.unwrap();

        assert!(commands(&ctx)
            .iter()
            .any(|c| c == "ufw allow from 203.0.113.0/24"));
        assert!(summary.contains("2 allow rule(s)"));
    }
}
