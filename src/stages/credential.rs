// SPDX-License-Identifier: AGPL-3.0-or-later
//! Administrative credential installation
//!
//! Appends the credential to the administrative account's authorized_keys,
//! creating the directory (0700) and file (0600) as needed. The append is
//! idempotent on the exact line and never rewrites or removes entries that
//! are already there.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::pipeline::{Stage, StageContext};

pub struct CredentialStage;

#[async_trait]
impl Stage for CredentialStage {
    fn name(&self) -> &'static str {
        "credential"
    }

    fn fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let line = ctx.plan.credential.authorized_line();
        let algorithm = ctx.plan.credential.algorithm.clone();

        let ssh_dir = ctx.paths.admin_ssh_dir();
        ctx.store.ensure_dir(&ssh_dir, 0o700)?;

        let keys_file = ctx.paths.authorized_keys();
        let already_present = if keys_file.exists() {
            std::fs::read_to_string(&keys_file)?
                .lines()
                .any(|existing| existing.trim() == line)
        } else {
            false
        };

        if already_present {
            info!(path = %keys_file.display(), "Credential already present");
            return Ok(format!("{} credential already present; nothing to add", algorithm));
        }

        ctx.store.append_line(&keys_file, &line, 0o600)?;
        info!(path = %keys_file.display(), "Credential added");
        Ok(format!("{} credential added", algorithm))
    }
}
