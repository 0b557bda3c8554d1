// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for redoubt

use thiserror::Error;

/// Result type alias for redoubt operations
pub type Result<T> = std::result::Result<T, RedoubtError>;

/// Errors that can occur during a hardening run
#[derive(Error, Debug)]
pub enum RedoubtError {
    /// The run was started without the privileges it needs
    #[error("Root privileges required: {detail}")]
    PrivilegeRequired { detail: String },

    /// The supplied SSH public key does not satisfy the credential grammar
    #[error("Invalid SSH public key: {reason}")]
    InvalidCredential { reason: String },

    /// The hardening plan is incomplete or inconsistent
    #[error("Invalid plan: {message}")]
    InvalidPlan { message: String },

    /// Plan file not found
    #[error("Plan file not found: {path}")]
    PlanNotFound { path: String },

    /// The host is missing something the pipeline depends on
    #[error("Unsupported host: {message}")]
    UnsupportedHost { message: String },

    /// The rewritten SSH daemon configuration failed the daemon's own check
    #[error("sshd configuration validation failed: {message}")]
    SshdValidation { message: String },

    /// An external tool exited unsuccessfully
    #[error("'{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// An external tool is not installed on this host
    #[error("Required tool not found: {tool}")]
    ToolMissing { tool: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
