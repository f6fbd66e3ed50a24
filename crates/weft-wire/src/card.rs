use serde::{Deserialize, Serialize};

/// Webhook registration attached to a task. The URL must survive a
/// validation-token challenge before it is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushNotificationConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub streaming: bool,
    #[serde(rename = "pushNotifications")]
    pub push_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputModes", default)]
    pub input_modes: Vec<String>,
    #[serde(rename = "outputModes", default)]
    pub output_modes: Vec<String>,
}

/// Capability document served from `/.well-known/agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
}

/// Accepted output modes are compatible when either side declares none
/// or the two sets intersect.
pub fn modalities_compatible(accepted: &[String], supported: &[String]) -> bool {
    if accepted.is_empty() || supported.is_empty() {
        return true;
    }
    accepted.iter().any(|mode| supported.contains(mode))
}
