// SPDX-License-Identifier: AGPL-3.0-or-later
//! Intrusion prevention
//!
//! Installs and configures fail2ban with a jail watching the
//! administrative SSH port, then layers crowdsec and its iptables
//! bouncer on top for reputation-based blocking. Both services are
//! enabled so they come back after a reboot.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::exec::ToolCall;
use crate::plan::HardeningPlan;
use crate::pipeline::{ServiceState, Stage, StageContext};

pub fn jail_file_content(plan: &HardeningPlan) -> String {
    format!(
        "# Managed by redoubt.\n\
         [DEFAULT]\n\
         bantime = {bantime}\n\
         findtime = {findtime}\n\
         maxretry = {maxretry}\n\
         backend = systemd\n\
         \n\
         [sshd]\n\
         enabled = true\n\
         port = {port}\n",
        bantime = plan.ban.bantime.as_secs(),
        findtime = plan.ban.findtime.as_secs(),
        maxretry = plan.ban.maxretry,
        port = plan.admin_port,
    )
}

pub struct IntrusionStage;

#[async_trait]
impl Stage for IntrusionStage {
    fn name(&self) -> &'static str {
        "intrusion-prevention"
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        if ctx.ensure_package("fail2ban").await? {
            ctx.services
                .insert("fail2ban".to_string(), ServiceState::InstalledStopped);
        }

        let jail = ctx.paths.jail_file();
        ctx.store
            .write_file(&jail, &jail_file_content(&ctx.plan), 0o644)?;

        ctx.tools
            .run(ToolCall::new("systemctl").args(["enable", "--now", "fail2ban"]))
            .await?;
        ctx.tools
            .run(ToolCall::new("systemctl").args(["restart", "fail2ban"]))
            .await?;
        ctx.services
            .insert("fail2ban".to_string(), ServiceState::Running);

        let jail_status = ctx
            .tools
            .run_unchecked(ToolCall::new("fail2ban-client").args(["status", "sshd"]))
            .await?;
        if jail_status.success && !jail_status.stdout.trim().is_empty() {
            ctx.jail_status = Some(jail_status.stdout.trim().to_string());
        } else if !jail_status.success {
            ctx.warn("fail2ban is running but the sshd jail did not report status");
        }

        ctx.ensure_package("crowdsec").await?;
        ctx.ensure_package("crowdsec-firewall-bouncer-iptables").await?;
        ctx.tools
            .run(ToolCall::new("systemctl").args(["enable", "--now", "crowdsec"]))
            .await?;
        ctx.services
            .insert("crowdsec".to_string(), ServiceState::Running);
        ctx.tools
            .run(ToolCall::new("systemctl").args(["enable", "--now", "crowdsec-firewall-bouncer"]))
            .await?;
        ctx.services.insert(
            "crowdsec-firewall-bouncer".to_string(),
            ServiceState::Running,
        );

        let metrics = ctx
            .tools
            .run_unchecked(ToolCall::new("cscli").arg("metrics"))
            .await?;
        if metrics.success {
            debug!("crowdsec metrics available");
        } else {
            ctx.warn("crowdsec is running but cscli metrics failed; check its acquisitions");
        }
        let bouncers = ctx
            .tools
            .run_unchecked(ToolCall::new("cscli").args(["bouncers", "list"]))
            .await?;
        if !bouncers.success {
            ctx.warn("cscli bouncers list failed; verify the firewall bouncer registered");
        }

        Ok(format!(
            "fail2ban jail active ({} ban after {} failures within {}); crowdsec bouncer enabled",
            humantime::format_duration(ctx.plan.ban.bantime),
            ctx.plan.ban.maxretry,
            humantime::format_duration(ctx.plan.ban.findtime),
        ))
    }
}
