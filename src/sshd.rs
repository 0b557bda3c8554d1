// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured sshd_config model
//!
//! The daemon configuration is parsed into typed lines, every occurrence
//! of a managed directive is removed (main file and override fragments,
//! Match blocks included), and one authoritative block is appended. The
//! rewrite is deterministic: running it twice produces the same file.

use crate::plan::HardeningPlan;

/// Directives the pipeline owns; all other lines pass through untouched
pub const MANAGED_DIRECTIVES: &[&str] = &[
    "Port",
    "PasswordAuthentication",
    "ChallengeResponseAuthentication",
    "KbdInteractiveAuthentication",
    "PubkeyAuthentication",
    "PermitRootLogin",
];

const MANAGED_COMMENT: &str =
    "# Managed by redoubt. These directives supersede any earlier occurrences.";

#[derive(Debug, Clone)]
enum ConfigLine {
    /// A directive line; keyword kept separately for matching
    Directive { keyword: String, raw: String },
    /// Comment, blank line, or anything else preserved byte for byte
    Verbatim(String),
}

/// A parsed sshd_config (main file or fragment)
#[derive(Debug, Clone)]
pub struct SshdConfig {
    lines: Vec<ConfigLine>,
}

impl SshdConfig {
    /// Parse configuration text into typed lines
    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    ConfigLine::Verbatim(line.to_string())
                } else {
                    let keyword = directive_keyword(trimmed).to_string();
                    ConfigLine::Directive {
                        keyword,
                        raw: line.to_string(),
                    }
                }
            })
            .collect();
        Self { lines }
    }

    /// Remove every managed directive, returning how many were removed
    ///
    /// The block marker comment from an earlier run is removed too, so
    /// repeated runs do not accumulate markers.
    pub fn strip_managed(&mut self) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            ConfigLine::Directive { keyword, .. } => !is_managed(keyword),
            ConfigLine::Verbatim(raw) => raw.trim() != MANAGED_COMMENT,
        });
        before - self.lines.len()
    }

    /// Render back to configuration text
    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut rendered = self
            .lines
            .iter()
            .map(|line| match line {
                ConfigLine::Directive { raw, .. } => raw.as_str(),
                ConfigLine::Verbatim(raw) => raw.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        rendered.push('\n');
        rendered
    }
}

/// First token of a directive line; sshd accepts `Key value` and `Key=value`
fn directive_keyword(trimmed: &str) -> &str {
    trimmed
        .split(|c: char| c.is_whitespace() || c == '=')
        .next()
        .unwrap_or(trimmed)
}

/// Keyword comparison is case-insensitive, as in the daemon itself
fn is_managed(keyword: &str) -> bool {
    MANAGED_DIRECTIVES
        .iter()
        .any(|directive| directive.eq_ignore_ascii_case(keyword))
}

/// The authoritative directive block for a plan
pub fn managed_block(plan: &HardeningPlan) -> String {
    format!(
        "{comment}\n\
         Port {port}\n\
         PubkeyAuthentication yes\n\
         PasswordAuthentication no\n\
         ChallengeResponseAuthentication no\n\
         KbdInteractiveAuthentication no\n\
         PermitRootLogin {root_login}\n",
        comment = MANAGED_COMMENT,
        port = plan.admin_port,
        root_login = plan.root_login.sshd_value(),
    )
}

/// Rewrite a main configuration: strip managed directives, append the
/// authoritative block. Returns the new text and the number of lines
/// removed.
pub fn harden_config(content: &str, plan: &HardeningPlan) -> (String, usize) {
    let mut config = SshdConfig::parse(content);
    let stripped = config.strip_managed();

    let rendered = config.render();
    let body = rendered.trim_end();

    let mut result = if body.is_empty() {
        String::new()
    } else {
        format!("{}\n\n", body)
    };
    result.push_str(&managed_block(plan));

    (result, stripped)
}

/// Strip managed directives from an override fragment
///
/// Returns the rewritten text, or None when the fragment holds no managed
/// directives and can stay untouched.
pub fn strip_fragment(content: &str) -> Option<String> {
    let mut config = SshdConfig::parse(content);
    if config.strip_managed() == 0 {
        return None;
    }
    Some(config.render())
}
