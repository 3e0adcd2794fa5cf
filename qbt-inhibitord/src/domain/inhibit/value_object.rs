use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semantic role of an inhibit source. The holder looks sources up by role
/// and orders them by [`SourceRole::priority`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Api,
    Media,
    Network,
}

impl SourceRole {
    pub const ALL: [SourceRole; 3] = [SourceRole::Api, SourceRole::Media, SourceRole::Network];

    /// Stable override rank; lower wins. Operator commands outrank every
    /// automatic detector so an explicit override always takes effect.
    pub fn priority(self) -> u8 {
        match self {
            SourceRole::Api => 0,
            SourceRole::Media => 1,
            SourceRole::Network => 2,
        }
    }

    pub fn default_label(self) -> &'static str {
        match self {
            SourceRole::Api => "API",
            SourceRole::Media => "Plex",
            SourceRole::Network => "Net",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceRole::Api => "api",
            SourceRole::Media => "media",
            SourceRole::Network => "network",
        }
    }
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "api" => Ok(SourceRole::Api),
            "media" | "plex" => Ok(SourceRole::Media),
            "network" | "net" => Ok(SourceRole::Network),
            other => Err(format!("unknown source role `{other}`")),
        }
    }
}

/// Explicit set of optional field writes applied to one or more sources.
/// `None` leaves the field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateUpdate {
    pub inhibiting: Option<bool>,
    pub inhibited_by: Option<Vec<String>>,
    pub overridden: Option<bool>,
    pub overridden_by: Option<Vec<String>>,
    pub qbt_connection: Option<bool>,
    pub plex_connection: Option<Option<bool>>,
    pub net_connection: Option<Option<bool>>,
    pub message: Option<String>,
    pub version: Option<String>,
}

impl StateUpdate {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Observable state of a source as published to remote clients.
///
/// Field order is the wire order; the encoding carries no timestamps so two
/// snapshots of unchanged state serialize to identical bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub inhibiting: bool,
    pub inhibited_by: Vec<String>,
    pub overridden: bool,
    pub overridden_by: Vec<String>,
    pub qbt_connection: Option<bool>,
    pub plex_connection: Option<bool>,
    pub net_connection: Option<bool>,
    pub message: String,
    pub version: String,
}

impl StateSnapshot {
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(value) = update.inhibiting {
            self.inhibiting = value;
        }
        if let Some(value) = &update.inhibited_by {
            self.inhibited_by = value.clone();
        }
        if let Some(value) = update.overridden {
            self.overridden = value;
        }
        if let Some(value) = &update.overridden_by {
            self.overridden_by = value.clone();
        }
        if let Some(value) = update.qbt_connection {
            self.qbt_connection = Some(value);
        }
        if let Some(value) = update.plex_connection {
            self.plex_connection = value;
        }
        if let Some(value) = update.net_connection {
            self.net_connection = value;
        }
        if let Some(value) = &update.message {
            self.message = value.clone();
        }
        if let Some(value) = &update.version {
            self.version = value.clone();
        }
    }
}
