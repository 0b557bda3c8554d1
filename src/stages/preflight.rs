// SPDX-License-Identifier: AGPL-3.0-or-later
//! Precondition validation
//!
//! Confirms the run can safely proceed before anything is mutated: root
//! privileges, a credential that still satisfies its grammar, and a host
//! that actually carries an OpenSSH server configuration.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RedoubtError, Result};
use crate::pipeline::{Stage, StageContext};

pub struct PreflightStage;

#[async_trait]
impl Stage for PreflightStage {
    fn name(&self) -> &'static str {
        "preflight"
    }

    fn fatal(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let euid = nix::unistd::geteuid();
        if !euid.is_root() {
            if ctx.tools.dry_run() {
                ctx.warn(format!(
                    "not running as root (euid {}); a real run must be started as root",
                    euid
                ));
            } else {
                return Err(RedoubtError::PrivilegeRequired {
                    detail: format!("effective uid is {}, expected 0", euid),
                });
            }
        }

        ctx.plan.credential.validate()?;
        debug!(
            algorithm = %ctx.plan.credential.algorithm,
            "Credential grammar re-checked"
        );

        let sshd_config = ctx.paths.sshd_config();
        if !sshd_config.exists() {
            return Err(RedoubtError::UnsupportedHost {
                message: format!(
                    "OpenSSH server configuration not found at {}",
                    sshd_config.display()
                ),
            });
        }

        Ok(format!(
            "preconditions satisfied ({} credential, administrative port {})",
            ctx.plan.credential.algorithm, ctx.plan.admin_port
        ))
    }
}
