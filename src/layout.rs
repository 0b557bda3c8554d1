// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host filesystem layout
//!
//! Every path the pipeline touches is derived from a single root so runs
//! can be pointed at a staging tree instead of the live system.

use std::path::{Path, PathBuf};

/// Managed paths on the target host, all relative to one root
#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
}

impl HostPaths {
    /// Create a layout rooted at the given directory
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Layout for the live system
    pub fn system() -> Self {
        Self::new("/")
    }

    /// The filesystem root this layout resolves against
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SSH directory of the administrative account
    pub fn admin_ssh_dir(&self) -> PathBuf {
        self.root.join("root/.ssh")
    }

    /// authorized_keys file of the administrative account
    pub fn authorized_keys(&self) -> PathBuf {
        self.admin_ssh_dir().join("authorized_keys")
    }

    /// Main SSH daemon configuration file
    pub fn sshd_config(&self) -> PathBuf {
        self.root.join("etc/ssh/sshd_config")
    }

    /// Directory of SSH daemon override fragments
    pub fn sshd_config_dir(&self) -> PathBuf {
        self.root.join("etc/ssh/sshd_config.d")
    }

    /// Staging path for the rewritten daemon configuration
    ///
    /// Lives next to the main file but outside the `sshd_config.d/*.conf`
    /// include pattern, so the daemon never reads it as an override.
    pub fn sshd_candidate(&self) -> PathBuf {
        self.root.join("etc/ssh/sshd_config.redoubt-candidate")
    }

    /// Persistent kernel parameter file
    pub fn sysctl_file(&self) -> PathBuf {
        self.root.join("etc/sysctl.d/99-redoubt-hardening.conf")
    }

    /// Persistent packet-filter ruleset
    pub fn iptables_rules(&self) -> PathBuf {
        self.root.join("etc/iptables/rules.v4")
    }

    /// Ban-service jail definition
    pub fn jail_file(&self) -> PathBuf {
        self.root.join("etc/fail2ban/jail.d/redoubt.local")
    }
}
