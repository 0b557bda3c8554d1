// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH daemon policy rewrite
//!
//! Moves the daemon to the administrative port with key-only
//! authentication. Managed directives are stripped from the main file and
//! every override fragment, one authoritative block is appended, and the
//! candidate is checked with the daemon's own validator before it replaces
//! the live file. On validation failure the live configuration is left
//! exactly as it was.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{RedoubtError, Result};
use crate::exec::ToolCall;
use crate::pipeline::{Stage, StageContext};
use crate::sshd;

pub struct SshPolicyStage;

#[async_trait]
impl Stage for SshPolicyStage {
    fn name(&self) -> &'static str {
        "ssh-policy"
    }

    fn fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let live_path = ctx.paths.sshd_config();
        let live_content = std::fs::read_to_string(&live_path)?;
        let (hardened, stripped) = sshd::harden_config(&live_content, &ctx.plan);

        // Collect fragment rewrites now, apply them only after validation.
        let fragment_rewrites = plan_fragment_rewrites(ctx)?;

        let candidate = ctx.paths.sshd_candidate();
        if !ctx.store.dry_run() && candidate.exists() {
            std::fs::remove_file(&candidate)?;
        }
        ctx.store.write_file(&candidate, &hardened, 0o600)?;

        let candidate_arg = candidate.display().to_string();
        let validation = ctx
            .tools
            .run_unchecked(ToolCall::new("sshd").args(["-t", "-f", candidate_arg.as_str()]))
            .await?;
        if !validation.success {
            if !ctx.store.dry_run() && candidate.exists() {
                let _ = std::fs::remove_file(&candidate);
            }
            let detail = validation.stderr.trim();
            return Err(RedoubtError::SshdValidation {
                message: if detail.is_empty() {
                    "daemon rejected the rewritten configuration".to_string()
                } else {
                    detail.to_string()
                },
            });
        }
        debug!("Candidate configuration accepted by sshd -t");

        let fragments_cleaned = fragment_rewrites.len();
        for (path, rewritten) in fragment_rewrites {
            info!(fragment = %path.display(), "Stripping managed directives from fragment");
            ctx.store.write_file(&path, &rewritten, 0o644)?;
        }

        ctx.store.write_file(&live_path, &hardened, 0o644)?;
        if !ctx.store.dry_run() && candidate.exists() {
            std::fs::remove_file(&candidate)?;
        }

        Ok(format!(
            "sshd policy validated and applied: port {}, password authentication off, \
             root login {} ({} directive(s) stripped, {} fragment(s) cleaned)",
            ctx.plan.admin_port, ctx.plan.root_login, stripped, fragments_cleaned
        ))
    }
}

/// Find override fragments that carry managed directives
fn plan_fragment_rewrites(ctx: &StageContext) -> Result<Vec<(PathBuf, String)>> {
    let fragment_dir = ctx.paths.sshd_config_dir();
    let mut rewrites = Vec::new();

    if !fragment_dir.is_dir() {
        return Ok(rewrites);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&fragment_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "conf"))
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        if let Some(rewritten) = sshd::strip_fragment(&content) {
            rewrites.push((path, rewritten));
        }
    }

    Ok(rewrites)
}
