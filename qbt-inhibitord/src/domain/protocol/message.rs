use crate::domain::inhibit::StateSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-minted connection token. Backed by a random UUID so a token is
/// never handed out twice.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SysCommand {
    Restart,
    PrefUpdate,
    DenyUpdate,
    Shutdown,
    Reboot,
}

impl SysCommand {
    /// Host power control is never honoured over the API.
    pub fn is_permitted(self) -> bool {
        !matches!(self, SysCommand::Shutdown | SysCommand::Reboot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SysCommand::Restart => "restart",
            SysCommand::PrefUpdate => "pref_update",
            SysCommand::DenyUpdate => "deny_update",
            SysCommand::Shutdown => "shutdown",
            SysCommand::Reboot => "reboot",
        }
    }
}

impl fmt::Display for SysCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Renew {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Command {
        inhibit: bool,
        #[serde(rename = "override")]
        is_override: bool,
    },
    Refresh,
    SysCommand {
        command: SysCommand,
    },
    Ack,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Handshake { .. } => "handshake",
            ClientMessage::Renew { .. } => "renew",
            ClientMessage::Command { .. } => "command",
            ClientMessage::Refresh => "refresh",
            ClientMessage::SysCommand { .. } => "sys_command",
            ClientMessage::Ack => "ack",
        }
    }

    pub fn opens_session(&self) -> bool {
        matches!(
            self,
            ClientMessage::Handshake { .. } | ClientMessage::Renew { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    NewConn { token: ConnectionId },
    StateUpdate(StateSnapshot),
    NewVersion(VersionNotice),
    Rejected { command: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionNotice {
    pub new_version: String,
    pub old_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_uses_override_field_name() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "command", "inhibit": true, "override": false}))
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Command {
                inhibit: true,
                is_override: false
            }
        );
    }

    #[test]
    fn handshake_token_is_optional_and_extra_fields_ignored() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "handshake", "server": "Test"})).unwrap();
        assert_eq!(msg, ClientMessage::Handshake { token: None });
        assert!(msg.opens_session());
        let renew: ClientMessage =
            serde_json::from_value(json!({"type": "renew", "token": "abc"})).unwrap();
        assert!(renew.opens_session());
    }

    #[test]
    fn sys_command_permissions() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "sys_command", "command": "reboot"})).unwrap();
        let ClientMessage::SysCommand { command } = msg else {
            panic!("expected sys_command");
        };
        assert!(!command.is_permitted());
        assert!(SysCommand::PrefUpdate.is_permitted());
        assert!(SysCommand::Restart.is_permitted());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_value::<ClientMessage>(json!({"type": "launch"}));
        assert!(result.is_err());
    }

    #[test]
    fn state_update_flattens_snapshot() {
        let msg = ServerMessage::StateUpdate(StateSnapshot {
            inhibiting: true,
            inhibited_by: vec!["Plex".into()],
            version: "0.1.0".into(),
            ..StateSnapshot::default()
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "state_update");
        assert_eq!(value["inhibiting"], true);
        assert_eq!(value["inhibited_by"], json!(["Plex"]));
        assert_eq!(value["qbt_connection"], serde_json::Value::Null);
    }

    #[test]
    fn new_conn_carries_token() {
        let id = ConnectionId::from("deadbeef");
        let value = serde_json::to_value(ServerMessage::NewConn { token: id }).unwrap();
        assert_eq!(value, json!({"type": "new_conn", "token": "deadbeef"}));
    }

    #[test]
    fn minted_ids_are_distinct() {
        assert_ne!(ConnectionId::mint(), ConnectionId::mint());
        assert_eq!(ConnectionId::mint().as_str().len(), 32);
    }
}
