//! Trigger, sub-action, and action definitions.
//!
//! Triggers and sub-actions are closed tagged unions: unknown `type` tags
//! fail deserialization, so a bad record is rejected when it is written or
//! loaded, never at match time.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Viewer role hierarchy used by chat-command role gates.
///
/// Ordering is by privilege: a moderator satisfies a `required_role` of
/// subscriber.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Viewer,
    Subscriber,
    Vip,
    Moderator,
    Broadcaster,
}

/// Matching condition for an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A chat command like `!hi`, matched on the normalized command word.
    ChatCommand {
        command: String,
        #[serde(default)]
        cooldown_secs: u64,
        #[serde(default)]
        required_role: Option<Role>,
    },
    /// A channel-point redemption, matched on the reward id.
    ChannelPoints { reward_id: String },
    /// A voice command, matched as a regex against transcribed phrases.
    VoiceCommand { pattern: String },
    /// A cron schedule (standard 5-field expression).
    Scheduled { cron: String },
    /// An external webhook, matched on the hook id in the request path.
    Webhook { hook_id: String },
}

/// Exact-match lookup key for the dispatcher's index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchKey {
    Chat(String),
    Reward(String),
    Hook(String),
}

/// Normalization applied to chat commands on both the trigger and event
/// sides so `!Hi ` and `!hi` match.
pub fn normalize_command(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl Trigger {
    /// The exact-match key for this trigger, if it matches by key.
    /// Voice and scheduled triggers match by pattern/time instead.
    pub fn match_key(&self) -> Option<MatchKey> {
        match self {
            Trigger::ChatCommand { command, .. } => {
                Some(MatchKey::Chat(normalize_command(command)))
            }
            Trigger::ChannelPoints { reward_id } => Some(MatchKey::Reward(reward_id.clone())),
            Trigger::Webhook { hook_id } => Some(MatchKey::Hook(hook_id.clone())),
            Trigger::VoiceCommand { .. } | Trigger::Scheduled { .. } => None,
        }
    }

    /// Write-time validation of trigger parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            Trigger::ChatCommand { command, .. } => {
                if normalize_command(command).is_empty() {
                    return Err(StoreError::Validation(
                        "chat_command trigger requires a non-empty command".into(),
                    ));
                }
            }
            Trigger::ChannelPoints { reward_id } => {
                if reward_id.trim().is_empty() {
                    return Err(StoreError::Validation(
                        "channel_points trigger requires a reward id".into(),
                    ));
                }
            }
            Trigger::VoiceCommand { pattern } => {
                regex::Regex::new(pattern).map_err(|e| {
                    StoreError::Validation(format!("invalid voice pattern '{}': {}", pattern, e))
                })?;
            }
            Trigger::Scheduled { cron } => {
                cron::Schedule::from_str(cron).map_err(|e| {
                    StoreError::Validation(format!("invalid cron expression '{}': {}", cron, e))
                })?;
            }
            Trigger::Webhook { hook_id } => {
                if hook_id.trim().is_empty() {
                    return Err(StoreError::Validation(
                        "webhook trigger requires a hook id".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Kind tag for a sub-action, used as the handler registry key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum SubActionKind {
    SendChatMessage,
    PlaySound,
    SetVariable,
    HttpCall,
    DiscordExport,
    Delay,
}

/// One executable step within an action. Order is implicit from list
/// position in the parent action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubAction {
    SendChatMessage {
        text: String,
    },
    PlaySound {
        path: String,
        #[serde(default = "default_volume")]
        volume: f64,
    },
    SetVariable {
        name: String,
        value: serde_json::Value,
    },
    HttpCall {
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    DiscordExport {
        webhook_url: String,
        content: String,
    },
    Delay {
        millis: u64,
    },
}

fn default_volume() -> f64 {
    1.0
}

impl SubAction {
    pub fn kind(&self) -> SubActionKind {
        match self {
            SubAction::SendChatMessage { .. } => SubActionKind::SendChatMessage,
            SubAction::PlaySound { .. } => SubActionKind::PlaySound,
            SubAction::SetVariable { .. } => SubActionKind::SetVariable,
            SubAction::HttpCall { .. } => SubActionKind::HttpCall,
            SubAction::DiscordExport { .. } => SubActionKind::DiscordExport,
            SubAction::Delay { .. } => SubActionKind::Delay,
        }
    }
}

/// A named automation unit: one trigger plus an ordered sub-action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Stable unique identifier, immutable after creation.
    pub id: Uuid,
    pub name: String,
    pub group: Option<String>,
    pub enabled: bool,
    pub trigger: Trigger,
    pub sub_actions: Vec<SubAction>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Definition for a new action; the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    pub sub_actions: Vec<SubAction>,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for an action. `None` fields are left unchanged; `group`
/// uses a nested option so it can be cleared.
#[derive(Debug, Clone, Default)]
pub struct ActionPatch {
    pub name: Option<String>,
    pub group: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub trigger: Option<Trigger>,
    pub sub_actions: Option<Vec<SubAction>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_tag_roundtrip() {
        let trigger = Trigger::ChatCommand {
            command: "!hi".into(),
            cooldown_secs: 5,
            required_role: Some(Role::Moderator),
        };
        let raw = serde_json::to_value(&trigger).unwrap();
        assert_eq!(raw["type"], "chat_command");
        let back: Trigger = serde_json::from_value(raw).unwrap();
        assert_eq!(back, trigger);
    }

    #[test]
    fn unknown_trigger_type_is_rejected() {
        let raw = json!({"type": "telepathy", "command": "!hi"});
        assert!(serde_json::from_value::<Trigger>(raw).is_err());
    }

    #[test]
    fn unknown_sub_action_type_is_rejected() {
        let raw = json!({"type": "summon_demon", "name": "baal"});
        assert!(serde_json::from_value::<SubAction>(raw).is_err());
    }

    #[test]
    fn command_normalization() {
        assert_eq!(normalize_command("  !Hi "), "!hi");
        let a = Trigger::ChatCommand {
            command: "!HI".into(),
            cooldown_secs: 0,
            required_role: None,
        };
        assert_eq!(a.match_key(), Some(MatchKey::Chat("!hi".into())));
    }

    #[test]
    fn trigger_validation() {
        assert!(Trigger::ChatCommand {
            command: "   ".into(),
            cooldown_secs: 0,
            required_role: None,
        }
        .validate()
        .is_err());

        assert!(Trigger::VoiceCommand {
            pattern: "[invalid".into()
        }
        .validate()
        .is_err());

        assert!(Trigger::Scheduled {
            cron: "not a cron".into()
        }
        .validate()
        .is_err());

        assert!(Trigger::Scheduled {
            cron: "0 9 * * *".into()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn role_ordering_is_by_privilege() {
        assert!(Role::Moderator > Role::Subscriber);
        assert!(Role::Broadcaster > Role::Moderator);
        assert!(Role::Viewer < Role::Subscriber);
    }

    #[test]
    fn sub_action_kind_names() {
        let sub = SubAction::SendChatMessage { text: "x".into() };
        assert_eq!(sub.kind().to_string(), "send_chat_message");
        assert_eq!(
            SubActionKind::from_str("http_call").unwrap(),
            SubActionKind::HttpCall
        );
    }

    #[test]
    fn play_sound_volume_defaults() {
        let raw = json!({"type": "play_sound", "path": "ding.ogg"});
        let sub: SubAction = serde_json::from_value(raw).unwrap();
        match sub {
            SubAction::PlaySound { volume, .. } => assert_eq!(volume, 1.0),
            _ => panic!("wrong kind"),
        }
    }
}
