// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hardening plan model and plan-file loading
//!
//! A plan collects everything a run needs up front: the administrative
//! credential, the administrative port, and the policy knobs for the
//! firewall, rate-limiter and ban stages. Plans are validated when they
//! are assembled and immutable afterwards.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RedoubtError, Result};

/// Key algorithms accepted in the administrative credential.
pub const SUPPORTED_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// A validated OpenSSH public key in authorized_keys format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Leading options string, if the credential carried one
    pub options: Option<String>,
    /// Key algorithm identifier (e.g. ssh-ed25519)
    pub algorithm: String,
    /// Base64 key material
    pub key_data: String,
    /// Trailing comment, if any
    pub comment: Option<String>,
}

impl PublicKey {
    /// Parse an authorized_keys-style credential line
    ///
    /// Accepted shapes are `<algorithm> <base64> [comment]` and
    /// `<options> <algorithm> <base64> [comment]`. Option strings with
    /// embedded quotes are rejected because they may contain spaces the
    /// tokenizer cannot see.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return Err(RedoubtError::InvalidCredential {
                reason: "credential is empty".to_string(),
            });
        }

        if trimmed.contains('\n') || trimmed.contains('\r') {
            return Err(RedoubtError::InvalidCredential {
                reason: "credential must be a single line".to_string(),
            });
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();

        let (options, algorithm_index) = if SUPPORTED_ALGORITHMS.contains(&tokens[0]) {
            (None, 0)
        } else if tokens.len() >= 2 && SUPPORTED_ALGORITHMS.contains(&tokens[1]) {
            if tokens[0].contains('"') {
                return Err(RedoubtError::InvalidCredential {
                    reason: "quoted option strings are not supported".to_string(),
                });
            }
            (Some(tokens[0].to_string()), 1)
        } else {
            return Err(RedoubtError::InvalidCredential {
                reason: format!(
                    "unrecognized key algorithm '{}' (expected one of: {})",
                    tokens[0],
                    SUPPORTED_ALGORITHMS.join(", ")
                ),
            });
        };

        let key_data = match tokens.get(algorithm_index + 1) {
            Some(data) => data.to_string(),
            None => {
                return Err(RedoubtError::InvalidCredential {
                    reason: "missing base64 key material".to_string(),
                })
            }
        };

        let comment = if tokens.len() > algorithm_index + 2 {
            Some(tokens[algorithm_index + 2..].join(" "))
        } else {
            None
        };

        let key = Self {
            options,
            algorithm: tokens[algorithm_index].to_string(),
            key_data,
            comment,
        };
        key.validate()?;
        Ok(key)
    }

    /// Re-check the credential invariants
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_ALGORITHMS.contains(&self.algorithm.as_str()) {
            return Err(RedoubtError::InvalidCredential {
                reason: format!("unrecognized key algorithm '{}'", self.algorithm),
            });
        }

        if self.key_data.len() < 16 {
            return Err(RedoubtError::InvalidCredential {
                reason: "key material is implausibly short".to_string(),
            });
        }

        let valid_base64 = self
            .key_data
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
        if !valid_base64 {
            return Err(RedoubtError::InvalidCredential {
                reason: "key material is not valid base64".to_string(),
            });
        }

        Ok(())
    }

    /// The canonical authorized_keys line for this credential
    pub fn authorized_line(&self) -> String {
        let mut line = String::new();
        if let Some(ref options) = self.options {
            line.push_str(options);
            line.push(' ');
        }
        line.push_str(&self.algorithm);
        line.push(' ');
        line.push_str(&self.key_data);
        if let Some(ref comment) = self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.authorized_line())
    }
}

/// Policy for root logins over SSH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootLoginPolicy {
    /// Root may log in with a key, never a password
    #[default]
    KeyOnly,
    /// Root may not log in remotely at all
    Disabled,
    /// Root may log in with key or password (discouraged)
    Allowed,
}

impl RootLoginPolicy {
    /// The PermitRootLogin value this policy maps to
    pub fn sshd_value(&self) -> &'static str {
        match self {
            RootLoginPolicy::KeyOnly => "prohibit-password",
            RootLoginPolicy::Disabled => "no",
            RootLoginPolicy::Allowed => "yes",
        }
    }
}

impl std::fmt::Display for RootLoginPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootLoginPolicy::KeyOnly => write!(formatter, "key-only"),
            RootLoginPolicy::Disabled => write!(formatter, "disabled"),
            RootLoginPolicy::Allowed => write!(formatter, "allowed"),
        }
    }
}

/// Transport protocol for a service port rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(formatter, "tcp"),
            Protocol::Udp => write!(formatter, "udp"),
        }
    }
}

/// A service port to keep reachable, written as `80/tcp` in plan files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServicePort {
    pub port: u16,
    pub protocol: Protocol,
}

impl std::str::FromStr for ServicePort {
    type Err = RedoubtError;

    fn from_str(value: &str) -> Result<Self> {
        let (port_text, protocol) = match value.split_once('/') {
            Some((port, "tcp")) => (port, Protocol::Tcp),
            Some((port, "udp")) => (port, Protocol::Udp),
            Some((_, other)) => {
                return Err(RedoubtError::InvalidPlan {
                    message: format!("unknown protocol '{}' in service port '{}'", other, value),
                })
            }
            None => (value, Protocol::Tcp),
        };

        let port: u16 = port_text.trim().parse().map_err(|_| RedoubtError::InvalidPlan {
            message: format!("invalid service port '{}'", value),
        })?;
        if port == 0 {
            return Err(RedoubtError::InvalidPlan {
                message: "service port 0 is not usable".to_string(),
            });
        }

        Ok(Self { port, protocol })
    }
}

impl TryFrom<String> for ServicePort {
    type Error = RedoubtError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServicePort> for String {
    fn from(value: ServicePort) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ServicePort {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}/{}", self.port, self.protocol)
    }
}

/// New-connection rate limit applied to the administrative port
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Accepted new connections per minute once the burst is spent
    #[serde(default = "default_rate_per_minute")]
    pub per_minute: u32,

    /// Connections accepted before the limit kicks in
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            per_minute: default_rate_per_minute(),
            burst: default_rate_burst(),
        }
    }
}

/// Ban policy for repeated authentication failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BanPolicy {
    /// How long an offending address stays banned
    #[serde(with = "humantime_serde", default = "default_bantime")]
    pub bantime: Duration,

    /// Window in which failures are counted
    #[serde(with = "humantime_serde", default = "default_findtime")]
    pub findtime: Duration,

    /// Failures within the window before a ban
    #[serde(default = "default_maxretry")]
    pub maxretry: u32,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            bantime: default_bantime(),
            findtime: default_findtime(),
            maxretry: default_maxretry(),
        }
    }
}

/// Optional on-disk plan file, merged with the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Administrative SSH port; the command line takes precedence
    pub admin_port: Option<u16>,

    /// Root login policy
    #[serde(default)]
    pub root_login: RootLoginPolicy,

    /// Service ports kept reachable besides the administrative port
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,

    /// Source addresses or CIDR networks allowed unconditionally
    #[serde(default)]
    pub trusted_sources: Vec<String>,

    /// Ports whose allow rules are retired and which must stop listening
    #[serde(default = "default_retired_ports")]
    pub retired_ports: Vec<u16>,

    /// Administrative-port connection rate limit
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,

    /// Authentication-failure ban policy
    #[serde(default)]
    pub ban: BanPolicy,
}

impl Default for PlanFile {
    fn default() -> Self {
        Self {
            admin_port: None,
            root_login: RootLoginPolicy::default(),
            service_ports: Vec::new(),
            trusted_sources: Vec::new(),
            retired_ports: default_retired_ports(),
            rate_limit: RateLimitPolicy::default(),
            ban: BanPolicy::default(),
        }
    }
}

impl PlanFile {
    /// Load a plan file from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RedoubtError::PlanNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let file: PlanFile = toml::from_str(&contents)?;
        Ok(file)
    }
}

/// Everything one hardening run needs, validated and immutable
#[derive(Debug, Clone)]
pub struct HardeningPlan {
    pub credential: PublicKey,
    pub admin_port: u16,
    pub root_login: RootLoginPolicy,
    pub service_ports: Vec<ServicePort>,
    pub trusted_sources: Vec<String>,
    pub retired_ports: Vec<u16>,
    pub rate_limit: RateLimitPolicy,
    pub ban: BanPolicy,
}

impl HardeningPlan {
    /// Build a plan from the command line and an optional plan file
    ///
    /// The administrative port has no built-in default. It must arrive
    /// through the port argument or the plan file; anything else is an
    /// invocation error raised before any host state is touched.
    pub fn assemble(
        credential: &str,
        cli_port: Option<u16>,
        file: PlanFile,
    ) -> Result<Self> {
        let credential = PublicKey::parse(credential)?;

        let admin_port = match cli_port.or(file.admin_port) {
            Some(port) => port,
            None => {
                return Err(RedoubtError::InvalidPlan {
                    message: "administrative port not specified: pass it as the second \
                              argument or set admin_port in the plan file"
                        .to_string(),
                })
            }
        };

        let plan = Self {
            credential,
            admin_port,
            root_login: file.root_login,
            service_ports: file.service_ports,
            trusted_sources: file.trusted_sources,
            retired_ports: file.retired_ports,
            rate_limit: file.rate_limit,
            ban: file.ban,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Validate cross-field plan invariants
    pub fn validate(&self) -> Result<()> {
        if self.admin_port == 0 {
            return Err(RedoubtError::InvalidPlan {
                message: "administrative port must be between 1 and 65535".to_string(),
            });
        }

        if self.retired_ports.contains(&self.admin_port) {
            return Err(RedoubtError::InvalidPlan {
                message: format!(
                    "administrative port {} is also listed as a retired port",
                    self.admin_port
                ),
            });
        }

        if self.rate_limit.per_minute == 0 || self.rate_limit.burst == 0 {
            return Err(RedoubtError::InvalidPlan {
                message: "rate limit per_minute and burst must both be positive".to_string(),
            });
        }

        if self.ban.maxretry == 0 {
            return Err(RedoubtError::InvalidPlan {
                message: "ban maxretry must be positive".to_string(),
            });
        }

        if self.ban.bantime.as_secs() == 0 || self.ban.findtime.as_secs() == 0 {
            return Err(RedoubtError::InvalidPlan {
                message: "ban bantime and findtime must be at least one second".to_string(),
            });
        }

        for source in &self.trusted_sources {
            let as_network = source.parse::<ipnet::IpNet>().is_ok();
            let as_address = source.parse::<std::net::IpAddr>().is_ok();
            if !as_network && !as_address {
                return Err(RedoubtError::InvalidPlan {
                    message: format!(
                        "invalid trusted source '{}': expected an IP address or CIDR network",
                        source
                    ),
                });
            }
        }

        Ok(())
    }
}

// Default value functions

fn default_rate_per_minute() -> u32 {
    6
}

fn default_rate_burst() -> u32 {
    4
}

fn default_bantime() -> Duration {
    Duration::from_secs(3600)
}

fn default_findtime() -> Duration {
    Duration::from_secs(600)
}

fn default_maxretry() -> u32 {
    5
}

fn default_retired_ports() -> Vec<u16> {
    vec![22]
}
