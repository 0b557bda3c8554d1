// SPDX-License-Identifier: AGPL-3.0-or-later
//! The hardening stages
//!
//! Order matters: preconditions and the credential come before any
//! lockdown, the firewall opens the administrative port before the SSH
//! daemon is moved onto it, and activation restarts services only after
//! every policy file is in place.

pub mod activate;
pub mod credential;
pub mod firewall;
pub mod intrusion;
pub mod kernel;
pub mod preflight;
pub mod ratelimit;
pub mod ssh_policy;

pub use activate::ActivateStage;
pub use credential::CredentialStage;
pub use firewall::FirewallStage;
pub use intrusion::IntrusionStage;
pub use kernel::KernelStage;
pub use preflight::PreflightStage;
pub use ratelimit::RateLimitStage;
pub use ssh_policy::SshPolicyStage;

use crate::pipeline::{Pipeline, Stage};

/// The full hardening sequence in execution order
pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(PreflightStage),
        Box::new(CredentialStage),
        Box::new(SshPolicyStage),
        Box::new(FirewallStage),
        Box::new(KernelStage),
        Box::new(RateLimitStage),
        Box::new(IntrusionStage),
        Box::new(ActivateStage),
    ]
}

pub fn standard_pipeline() -> Pipeline {
    Pipeline::new(standard_stages())
}
