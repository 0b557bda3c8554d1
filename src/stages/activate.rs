// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service activation and verification
//!
//! Restarts the hardened services in dependency order (firewall before
//! SSH, then the intrusion layer) and verifies the end state by parsing
//! the listening sockets: the administrative port must have a listener,
//! retired ports must not, and anything else listening on a non-loopback
//! address is reported. Mismatches become warnings rather than failures
//! so the report always reaches the operator.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::exec::ToolCall;
use crate::pipeline::{ListenerCheck, ServiceState, Stage, StageContext};
use crate::plan::{HardeningPlan, Protocol};

/// One listening TCP socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub address: String,
    pub port: u16,
}

impl Listener {
    fn is_loopback(&self) -> bool {
        self.address.starts_with("127.") || self.address == "[::1]" || self.address == "::1"
    }
}

/// Parse `ss -t -l -n` output into listeners, skipping the header and
/// anything not in LISTEN state
pub fn parse_listening_ports(output: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != "LISTEN" {
            continue;
        }
        let local = fields[3];
        let Some((address, port)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        listeners.push(Listener {
            address: address.to_string(),
            port,
        });
    }
    listeners
}

/// Compare the observed listeners against what the plan expects
pub fn evaluate_listeners(plan: &HardeningPlan, listeners: &[Listener]) -> ListenerCheck {
    let mut expected: Vec<u16> = vec![plan.admin_port];
    expected.extend(
        plan.service_ports
            .iter()
            .filter(|sp| sp.protocol == Protocol::Tcp)
            .map(|sp| sp.port),
    );

    let admin_port_listening = listeners.iter().any(|l| l.port == plan.admin_port);

    let mut retired_still_listening: Vec<u16> = plan
        .retired_ports
        .iter()
        .copied()
        .filter(|port| listeners.iter().any(|l| l.port == *port))
        .collect();
    retired_still_listening.dedup();

    let mut unexpected: Vec<u16> = listeners
        .iter()
        .filter(|l| !l.is_loopback())
        .map(|l| l.port)
        .filter(|port| !expected.contains(port) && !plan.retired_ports.contains(port))
        .collect();
    unexpected.sort_unstable();
    unexpected.dedup();

    ListenerCheck {
        admin_port_listening,
        retired_still_listening,
        unexpected,
    }
}

pub struct ActivateStage;

#[async_trait]
impl Stage for ActivateStage {
    fn name(&self) -> &'static str {
        "activation"
    }

    fn fatal(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut StageContext) -> Result<String> {
        let admin_port = ctx.plan.admin_port;

        // Firewall first so the new port is open before sshd moves.
        let ufw_state = ctx
            .tools
            .run_unchecked(ToolCall::new("ufw").arg("status"))
            .await?;
        if !ufw_state.stdout.contains("Status: active") {
            ctx.tools
                .run(ToolCall::new("ufw").args(["--force", "enable"]))
                .await?;
        }
        ctx.services.insert("ufw".to_string(), ServiceState::Running);

        // Debian ships the unit as ssh, some hosts alias sshd.
        let ssh_restart = ctx
            .tools
            .run_unchecked(ToolCall::new("systemctl").args(["restart", "ssh"]))
            .await?;
        if !ssh_restart.success {
            debug!("restart of ssh failed, retrying as sshd");
            ctx.tools
                .run(ToolCall::new("systemctl").args(["restart", "sshd"]))
                .await?;
        }
        ctx.services.insert("ssh".to_string(), ServiceState::Running);

        if ctx.completed.contains("intrusion-prevention") {
            ctx.tools
                .run(ToolCall::new("systemctl").args(["restart", "fail2ban"]))
                .await?;
            ctx.tools
                .run(ToolCall::new("systemctl").args(["restart", "crowdsec-firewall-bouncer"]))
                .await?;
        }

        if ctx.tools.dry_run() {
            return Ok(
                "services restarted (listening-socket verification skipped in dry run)"
                    .to_string(),
            );
        }

        let sockets = ctx
            .tools
            .run(ToolCall::new("ss").args(["-t", "-l", "-n"]))
            .await?;
        let listeners = parse_listening_ports(&sockets.stdout);
        let check = evaluate_listeners(&ctx.plan, &listeners);

        if check.admin_port_listening {
            ctx.services
                .insert("ssh".to_string(), ServiceState::RunningVerified);
        } else {
            ctx.warn(format!(
                "administrative port {} has no listener; do NOT close this session until `ssh -p {}` succeeds from a new terminal",
                admin_port, admin_port
            ));
        }
        for port in &check.retired_still_listening {
            ctx.warn(format!(
                "retired port {} still has a listener; another service may have claimed it",
                port
            ));
        }
        if !check.unexpected.is_empty() {
            let ports: Vec<String> = check.unexpected.iter().map(|p| p.to_string()).collect();
            ctx.warn(format!(
                "unexpected listener(s) on non-loopback port(s): {}",
                ports.join(", ")
            ));
        }

        let summary = if check.clean() {
            format!("services active; port {} verified listening", admin_port)
        } else {
            "services active; listener verification found mismatches (see warnings)".to_string()
        };
        ctx.listener_check = Some(check);
        Ok(summary)
    }
}
