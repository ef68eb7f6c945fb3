//! Canary label records and the label-service client.
//!
//! A label selects a variant of an upstream service (`beta`, `stable`, ...)
//! for a user. Labels are fetched per uid from the label service and cached
//! by the store; each label may be constrained to specific clients or
//! channels, where an empty constraint matches anything.

mod client;
mod health;

pub use client::{FetchError, LabelClient, LabelFetcher};
pub use health::HealthGate;

pub(crate) use client::unix_now;

use serde::{Deserialize, Serialize};

/// A single canary label with optional client/channel constraints.
///
/// Wire shape: `{"l": "beta", "cls": ["iOS"], "chs": ["stable"]}` with
/// `cls`/`chs` omitted when unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(rename = "l")]
    pub label: String,
    #[serde(rename = "cls", default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<String>,
    #[serde(rename = "chs", default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

impl Label {
    /// An empty client list matches any client.
    pub fn match_client(&self, client: &str) -> bool {
        self.clients.is_empty() || self.clients.iter().any(|c| c == client)
    }

    /// An empty channel list matches any channel.
    pub fn match_channel(&self, channel: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_label_matches_anything() {
        let l = Label::default();
        assert!(l.match_client(""));
        assert!(l.match_client("any"));
        assert!(l.match_channel(""));
        assert!(l.match_channel("any"));
    }

    #[test]
    fn constrained_label_matches_listed_values_only() {
        let l = Label {
            label: "beta".into(),
            clients: vec!["web".into()],
            channels: vec!["stable".into()],
        };
        assert!(!l.match_client(""));
        assert!(l.match_client("web"));
        assert!(!l.match_client("any"));

        assert!(!l.match_channel(""));
        assert!(l.match_channel("stable"));
        assert!(!l.match_channel("any"));
    }

    #[test]
    fn wire_shape_round_trips() {
        let json = r#"{"l":"beta","cls":["iOS","Android"]}"#;
        let l: Label = serde_json::from_str(json).unwrap();
        assert_eq!(l.label, "beta");
        assert_eq!(l.clients, vec!["iOS", "Android"]);
        assert!(l.channels.is_empty());
        assert_eq!(serde_json::to_string(&l).unwrap(), json);
    }
}
