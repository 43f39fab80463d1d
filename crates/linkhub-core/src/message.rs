//! Payloads carried inside a [`Package`](crate::Package).
//!
//! The hub never looks inside a message; only links do. Application payloads
//! travel as [`Message::Data`] with an application-chosen `kind`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Application data. `kind` selects the handler on the receiving link.
    Data {
        kind: String,
        #[serde(default)]
        body: serde_json::Value,
    },
    /// The hub accepted an identification.
    IdentifySuccessful,
    /// A frame could not be understood.
    InvalidPackage { reason: String },
    /// The identification carried the wrong secret.
    InvalidSecret { reason: String },
    /// A request could not be served by the receiving link.
    RequestError {
        kind: RequestErrorKind,
        description: String,
    },
}

/// Why a request failed on the receiving link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestErrorKind {
    /// Nothing is registered for the request's tag.
    NoHandler,
    /// The handler returned an error.
    HandlerFailed,
}

/// Dispatch key of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Data(String),
    IdentifySuccessful,
    InvalidPackage,
    InvalidSecret,
    RequestError,
}

impl MessageTag {
    /// Tag for application data of the given kind.
    pub fn data(kind: impl Into<String>) -> Self {
        Self::Data(kind.into())
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(kind) => write!(f, "data:{kind}"),
            Self::IdentifySuccessful => f.write_str("identify_successful"),
            Self::InvalidPackage => f.write_str("invalid_package"),
            Self::InvalidSecret => f.write_str("invalid_secret"),
            Self::RequestError => f.write_str("request_error"),
        }
    }
}

impl Message {
    /// Application data with a JSON body.
    pub fn data(kind: impl Into<String>, body: serde_json::Value) -> Self {
        Self::Data {
            kind: kind.into(),
            body,
        }
    }

    pub fn invalid_package(reason: impl Into<String>) -> Self {
        Self::InvalidPackage {
            reason: reason.into(),
        }
    }

    pub fn invalid_secret(reason: impl Into<String>) -> Self {
        Self::InvalidSecret {
            reason: reason.into(),
        }
    }

    pub fn request_error(kind: RequestErrorKind, description: impl Into<String>) -> Self {
        Self::RequestError {
            kind,
            description: description.into(),
        }
    }

    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Data { kind, .. } => MessageTag::Data(kind.clone()),
            Self::IdentifySuccessful => MessageTag::IdentifySuccessful,
            Self::InvalidPackage { .. } => MessageTag::InvalidPackage,
            Self::InvalidSecret { .. } => MessageTag::InvalidSecret,
            Self::RequestError { .. } => MessageTag::RequestError,
        }
    }

    /// Whether this is one of the error kinds.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPackage { .. } | Self::InvalidSecret { .. } | Self::RequestError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_wire_shape() {
        let msg = Message::data("ping", serde_json::json!({"n": 1}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "data", "kind": "ping", "body": {"n": 1}})
        );
    }

    #[test]
    fn data_body_defaults_to_null() {
        let msg: Message = serde_json::from_str(r#"{"type":"data","kind":"ping"}"#).unwrap();
        assert_eq!(msg, Message::data("ping", serde_json::Value::Null));
    }

    #[test]
    fn request_error_wire_shape() {
        let msg = Message::request_error(RequestErrorKind::NoHandler, "no handler for data:ping");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request_error");
        assert_eq!(json["kind"], "no_handler");
    }

    #[test]
    fn tags() {
        assert_eq!(
            Message::data("ping", serde_json::Value::Null).tag(),
            MessageTag::data("ping")
        );
        assert_eq!(Message::IdentifySuccessful.tag(), MessageTag::IdentifySuccessful);
        assert_eq!(MessageTag::data("ping").to_string(), "data:ping");
        assert_eq!(MessageTag::RequestError.to_string(), "request_error");
    }

    #[test]
    fn error_kinds() {
        assert!(Message::invalid_package("x").is_error());
        assert!(Message::invalid_secret("x").is_error());
        assert!(Message::request_error(RequestErrorKind::HandlerFailed, "x").is_error());
        assert!(!Message::IdentifySuccessful.is_error());
        assert!(!Message::data("ping", serde_json::Value::Null).is_error());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Message>(r#"{"type":"bogus"}"#).is_err());
    }
}
