//! Message and classification types shared by the mailbox, classifier and pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mailbox entry fetched for classification.
///
/// Owned by the run that fetched it; never cached across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Mailbox-assigned UID, stable across fetches.
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub to: String,
    /// When the mailbox received the message.
    pub date: DateTime<Utc>,
    /// Leading excerpt of the body text.
    pub body: String,
    /// Message-ID header, or a synthesized `uid-<n>` when absent.
    pub message_id: String,
}

impl Message {
    /// Stand-in for a message whose fetch failed.
    ///
    /// Carries an epoch-zero date so time filtering drops it.
    pub fn placeholder(uid: u32) -> Self {
        Self {
            uid,
            subject: "Fetch Error".to_string(),
            from: "Unknown".to_string(),
            to: "Unknown".to_string(),
            date: DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default(),
            body: "Failed to fetch email".to_string(),
            message_id: format!("fetch-error-{uid}"),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.message_id.starts_with("fetch-error-")
    }
}

/// Classifier verdict for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub needs_reply: bool,
    pub is_business: bool,
    pub reasoning: String,
}

impl Classification {
    /// Non-actionable verdict used when the message could not be classified.
    pub fn unclassified(reason: impl Into<String>) -> Self {
        Self {
            needs_reply: false,
            is_business: false,
            reasoning: reason.into(),
        }
    }

    /// True when at least one facet is set.
    pub fn is_actionable(&self) -> bool {
        self.needs_reply || self.is_business
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_epoch_zero() {
        let msg = Message::placeholder(7);
        assert_eq!(msg.date.timestamp(), 0);
        assert_eq!(msg.subject, "Fetch Error");
        assert_eq!(msg.message_id, "fetch-error-7");
        assert!(msg.is_placeholder());
    }

    #[test]
    fn classification_serializes_camel_case() {
        let c = Classification {
            needs_reply: true,
            is_business: false,
            reasoning: "asks a question".into(),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["needsReply"], true);
        assert_eq!(json["isBusiness"], false);
        assert_eq!(json["reasoning"], "asks a question");
    }

    #[test]
    fn unclassified_is_not_actionable() {
        let c = Classification::unclassified("timeout");
        assert!(!c.is_actionable());
        assert_eq!(c.reasoning, "timeout");
    }
}
