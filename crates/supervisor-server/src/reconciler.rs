use crate::dispatcher::CommandDispatcher;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;
use supervisor_core::model::{Command, CommandTarget, CommandType};
use supervisor_core::Result;

#[derive(Debug, Clone)]
pub struct OauthGuidance {
    pub steps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolOAuthCapability {
    pub supports_remote_oauth: bool,
    pub supports_device_code: bool,
    pub manual_guidance: OauthGuidance,
}

fn ssh_manual_guidance(tool: &str, login_cmd: &str) -> OauthGuidance {
    OauthGuidance {
        steps: vec![
            "SSH into the agent host for this node.".to_string(),
            format!("Run `{login_cmd}` to start the {tool} login flow."),
            "Follow the browser prompt shown in the terminal output.".to_string(),
            format!("Verify with the {tool} status command once login completes."),
        ],
    }
}

/// Static per-tool capability table. A seed of representative tools
/// sufficient to exercise all three orchestrator outcomes, not an
/// exhaustive product catalog.
static TOOL_CAPABILITIES: Lazy<BTreeMap<&'static str, ToolOAuthCapability>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert(
        "github",
        ToolOAuthCapability {
            supports_remote_oauth: true,
            supports_device_code: true,
            manual_guidance: ssh_manual_guidance("github", "gh auth login"),
        },
    );
    m.insert(
        "anthropic",
        ToolOAuthCapability {
            supports_remote_oauth: true,
            supports_device_code: true,
            manual_guidance: ssh_manual_guidance("anthropic", "claude login"),
        },
    );
    m.insert(
        "generic-ssh-login",
        ToolOAuthCapability {
            supports_remote_oauth: false,
            supports_device_code: false,
            manual_guidance: ssh_manual_guidance("generic-ssh-login", "tool login"),
        },
    );
    m
});

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OauthOutcome {
    ManualRequired { guidance: Vec<String> },
    Triggered { challenge_url: Option<String>, user_code: Option<String>, raw: Option<String> },
}

/// Decides per-tool whether to dispatch a device-code command or return
/// manual guidance.
pub struct OauthOrchestrator {
    dispatcher: Arc<CommandDispatcher>,
}

impl OauthOrchestrator {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn request(&self, node_id: &str, tool_id: &str) -> Result<OauthOutcome> {
        let Some(capability) = TOOL_CAPABILITIES.get(tool_id) else {
            return Ok(OauthOutcome::ManualRequired {
                guidance: vec![format!(
                    "'{tool_id}' is not a supported tool; ask the operator to configure it manually."
                )],
            });
        };

        if !(capability.supports_remote_oauth && capability.supports_device_code) {
            return Ok(OauthOutcome::ManualRequired {
                guidance: capability.manual_guidance.steps.clone(),
            });
        }

        let mut args = std::collections::BTreeMap::new();
        args.insert("tool".to_string(), serde_json::Value::String(tool_id.to_string()));
        let command = Command {
            command_id: String::new(),
            kind: CommandType::OauthTrigger,
            idempotency_key: None,
            target: CommandTarget { project: None, node_id: Some(node_id.to_string()) },
            args,
            timeout: None,
        };
        let result = self.dispatcher.dispatch_command(command).await?;
        let Some(output) = result.output else {
            return Ok(OauthOutcome::Triggered { challenge_url: None, user_code: None, raw: None });
        };
        match serde_json::from_str::<serde_json::Value>(&output) {
            Ok(parsed) => Ok(OauthOutcome::Triggered {
                challenge_url: parsed.get("challenge_url").and_then(|v| v.as_str()).map(String::from),
                user_code: parsed.get("user_code").and_then(|v| v.as_str()).map(String::from),
                raw: None,
            }),
            Err(_) => Ok(OauthOutcome::Triggered { challenge_url: None, user_code: None, raw: Some(output) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_tool_is_manual() {
        assert!(TOOL_CAPABILITIES.get("totally-unknown-tool").is_none());
    }

    #[test]
    fn github_supports_device_code() {
        let cap = TOOL_CAPABILITIES.get("github").unwrap();
        assert!(cap.supports_remote_oauth && cap.supports_device_code);
    }

    #[test]
    fn generic_ssh_tool_is_manual_only() {
        let cap = TOOL_CAPABILITIES.get("generic-ssh-login").unwrap();
        assert!(!cap.supports_remote_oauth);
    }
}
