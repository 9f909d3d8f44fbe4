//! Queue message envelope and topic payloads.
//!
//! On the wire every message is `{"topic": "<topic>", "data": {...}}`. The
//! topic selects the payload shape; decoding happens in two steps so a bad
//! payload can be told apart from a bad envelope in the logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::error;

/// Tag selecting the handler and payload shape of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    ContributionCreated,
    ArticleUploaded,
    ExportContributeSession,
}

impl Topic {
    pub const ALL: [Topic; 3] = [
        Topic::ContributionCreated,
        Topic::ArticleUploaded,
        Topic::ExportContributeSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ContributionCreated => "contribution-created",
            Topic::ArticleUploaded => "article-uploaded",
            Topic::ExportContributeSession => "export-contribute-session",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown topic: {0}")]
pub struct ParseTopicError(String);

impl FromStr for Topic {
    type Err = ParseTopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| ParseTopicError(s.to_string()))
    }
}

/// The authenticated user who triggered the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInUser {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionCreatedPayload {
    pub contribution_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub faculty_id: i64,
    pub user: LoggedInUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleUploadedPayload {
    pub article_id: i64,
    pub link: String,
    pub user: LoggedInUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportContributeSessionPayload {
    pub contribute_session_id: i64,
}

/// A decoded queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "kebab-case")]
pub enum Message {
    ContributionCreated(ContributionCreatedPayload),
    ArticleUploaded(ArticleUploadedPayload),
    ExportContributeSession(ExportContributeSessionPayload),
}

/// Envelope with the payload still undecoded.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    topic: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Message {
    /// Shorthand for the message producers send to request a session export.
    pub fn export_contribute_session(contribute_session_id: i64) -> Self {
        Message::ExportContributeSession(ExportContributeSessionPayload {
            contribute_session_id,
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            Message::ContributionCreated(_) => Topic::ContributionCreated,
            Message::ArticleUploaded(_) => Topic::ArticleUploaded,
            Message::ExportContributeSession(_) => Topic::ExportContributeSession,
        }
    }

    /// Decodes `data` as the payload shape selected by `topic`.
    pub fn from_parts(topic: Topic, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match topic {
            Topic::ContributionCreated => Message::ContributionCreated(serde_json::from_value(data)?),
            Topic::ArticleUploaded => Message::ArticleUploaded(serde_json::from_value(data)?),
            Topic::ExportContributeSession => {
                Message::ExportContributeSession(serde_json::from_value(data)?)
            }
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a raw queue item as read off the wire.
    ///
    /// Items that are not UTF-8 are logged and yield `None`, like any other
    /// malformed item.
    pub fn decode_bytes(raw: &[u8]) -> Option<Self> {
        match std::str::from_utf8(raw) {
            Ok(text) => Self::decode(text),
            Err(e) => {
                error!(error = %e, len = raw.len(), "Message is not valid UTF-8");
                None
            }
        }
    }

    /// Decodes a raw queue item.
    ///
    /// Malformed envelopes, unknown topics and undecodable payloads are
    /// logged and yield `None`; the caller drops the item.
    pub fn decode(raw: &str) -> Option<Self> {
        let envelope: RawEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, message = %raw, "Malformed message");
                return None;
            }
        };

        let topic = match envelope.topic.parse::<Topic>() {
            Ok(topic) => topic,
            Err(e) => {
                error!(error = %e, message = %raw, "Dropping message");
                return None;
            }
        };

        match Message::from_parts(topic, envelope.data) {
            Ok(message) => Some(message),
            Err(e) => {
                error!(topic = %topic, error = %e, message = %raw, "Failed to decode payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_export_envelope_wire_format() {
        let encoded = Message::export_contribute_session(42).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(
            value,
            json!({"topic": "export-contribute-session", "data": {"contributeSessionId": 42}})
        );
    }

    #[test]
    fn test_decode_article_uploaded() {
        let raw = json!({
            "topic": "article-uploaded",
            "data": {
                "articleId": 7,
                "link": "drafts/essay.docx",
                "user": {"id": 3, "email": "s@uni.edu", "name": "Student", "role": "student"}
            }
        })
        .to_string();

        let message = Message::decode(&raw).unwrap();
        assert_eq!(message.topic(), Topic::ArticleUploaded);
        match message {
            Message::ArticleUploaded(payload) => {
                assert_eq!(payload.article_id, 7);
                assert_eq!(payload.link, "drafts/essay.docx");
                assert_eq!(payload.user.id, 3);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_drops_malformed_envelope() {
        assert!(Message::decode("not json").is_none());
        assert!(Message::decode(r#"{"data": {}}"#).is_none());
    }

    #[test]
    fn test_decode_drops_unknown_topic() {
        let raw = json!({"topic": "comment-posted", "data": {}}).to_string();
        assert!(Message::decode(&raw).is_none());
    }

    #[test]
    fn test_decode_drops_bad_payload() {
        let raw = json!({
            "topic": "export-contribute-session",
            "data": {"contributeSessionId": "forty-two"}
        })
        .to_string();
        assert!(Message::decode(&raw).is_none());
    }

    #[test]
    fn test_decode_bytes() {
        assert!(Message::decode_bytes(&[0xff, 0xfe, 0x00]).is_none());

        let raw = Message::export_contribute_session(8).encode().unwrap();
        assert_eq!(
            Message::decode_bytes(raw.as_bytes()),
            Some(Message::export_contribute_session(8))
        );
    }

    #[test]
    fn test_topic_parse_and_display() {
        for topic in Topic::ALL {
            assert_eq!(topic.to_string().parse::<Topic>().unwrap(), topic);
        }
        assert!("export".parse::<Topic>().is_err());
    }
}
