// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kernel parameter hardening
//!
//! Persists a fixed set of network sysctls to a drop-in under
//! /etc/sysctl.d and reloads the whole sysctl configuration so the
//! values take effect immediately and survive reboots.

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::ToolCall;
use crate::pipeline::{Stage, StageContext};

/// Parameters written to the managed sysctl drop-in.
pub const SYSCTL_SETTINGS: &[(&str, &str)] = &[
    ("net.ipv4.tcp_syncookies", "1"),
    ("net.ipv4.tcp_max_syn_backlog", "2048"),
    ("net.ipv4.tcp_synack_retries", "2"),
    ("net.ipv4.tcp_syn_retries", "5"),
    ("net.ipv4.icmp_echo_ignore_broadcasts", "1"),
    ("net.ipv4.icmp_ignore_bogus_error_responses", "1"),
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.default.rp_filter", "1"),
    ("net.ipv6.conf.all.accept_ra", "0"),
    ("net.ipv6.conf.default.accept_ra", "0"),
];

pub fn sysctl_file_content() -> String {
    let mut content = String::from("# Managed by redoubt. Network hardening parameters.\n");
    for (key, value) in SYSCTL_SETTINGS {
        content.push_str(key);
        content.push_str(" = ");
        content.push_str(value);
        content.push('\n');
    }
    content
}

pub struct KernelStage;

#[async_trait]
impl Stage for KernelStage {
    fn name(&self) -> &'static str {
        "kernel-hardening"
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let target = ctx.paths.sysctl_file();
        ctx.store
            .write_file(&target, &sysctl_file_content(), 0o644)?;

        ctx.tools
            .run(ToolCall::new("sysctl").arg("--system"))
            .await?;

        Ok(format!(
            "{} kernel parameters persisted and reloaded",
            SYSCTL_SETTINGS.len()
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
    use std::fs;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGJqc2Rm9s8PZK3mYH5K1DdGvQxkU5n0yFhW4qJrT2aB ops@bastion";

    #[test]
    fn test_content_covers_syn_flood_and_redirect_defenses() {
        let content = sysctl_file_content();
        assert!(content.contains("net.ipv4.tcp_syncookies = 1"));
        assert!(content.contains("net.ipv4.conf.all.rp_filter = 1"));
        assert!(content.contains("net.ipv6.conf.default.accept_ra = 0"));
        assert_eq!(content.lines().count(), SYSCTL_SETTINGS.len() + 1);
    }

    #[tokio::test]
    async fn test_existing_drop_in_is_backed_up_before_overwrite() {
        let root = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(root.path());
        fs::create_dir_all(paths.sysctl_file().parent().unwrap()).unwrap();
        fs::write(paths.sysctl_file(), "net.ipv4.ip_forward = 1\n").unwrap();

        let plan = HardeningPlan::assemble(KEY, Some(2218), PlanFile::default()).unwrap();
        let mut ctx = StageContext::new(
            plan,
            paths.clone(),
            ArtifactStore::new(false),
            Box::new(DryRunTools::new()),
        );

        let summary = KernelStage.run(&mut ctx).await.unwrap();
        assert!(summary.contains("10 kernel parameters"));

        let written = fs::read_to_string(paths.sysctl_file()).unwrap();
        assert!(written.contains("tcp_syncookies"));
        assert!(!written.contains("ip_forward"));

        assert_eq!(ctx.store.backups().len(), 1);
        let backup = &ctx.store.backups()[0];
        let preserved = fs::read_to_string(&backup.backup).unwrap();
        assert!(preserved.contains("ip_forward"));

        assert_eq!(ctx.tools.transcript().len(), 1);
        assert_eq!(ctx.tools.transcript()[0].command, "sysctl --system");
    }
}
