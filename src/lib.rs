// SPDX-License-Identifier: AGPL-3.0-or-later
//! redoubt: single-host hardening orchestration
//!
//! Takes a freshly provisioned Linux host from its wide-open default to a
//! locked-down baseline in one run: key-only SSH on a chosen
//! administrative port, default-deny firewall, hardened kernel network
//! parameters, connection rate limiting and intrusion prevention. Runs
//! are ordered so access through the new port is in place before old
//! access is withdrawn, every clobbered file is backed up first, and the
//! daemon's own validator vets the SSH configuration before it goes live.

pub mod artifact;
pub mod error;
pub mod exec;
pub mod layout;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod sshd;
pub mod stages;

pub use artifact::ArtifactStore;
pub use error::{RedoubtError, Result};
pub use exec::{DryRunTools, SystemTools, ToolRunner};
pub use layout::HostPaths;
pub use pipeline::{Pipeline, PipelineOutcome, StageContext};
pub use plan::{HardeningPlan, PlanFile};
pub use report::RunReport;
pub use stages::{standard_pipeline, standard_stages};
