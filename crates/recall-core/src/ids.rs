use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is `<prefix>_<uuid>`.
            pub fn is_well_formed(&self) -> bool {
                self.0
                    .strip_prefix($prefix)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .is_some_and(|uuid| Uuid::parse_str(uuid).is_ok())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConversationId, "conv");
branded_id!(MessageId, "msg");
branded_id!(RequestId, "req");
branded_id!(ToolCallId, "call");

/// Caller identity. Issued by the upstream auth layer, so the value is opaque.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_has_prefix() {
        let id = ConversationId::new();
        assert!(id.as_str().starts_with("conv_"), "got: {id}");
    }

    #[test]
    fn request_and_call_ids_have_prefix() {
        assert!(RequestId::new().as_str().starts_with("req_"));
        assert!(ToolCallId::new().as_str().starts_with("call_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_well_formed() {
        assert!(ConversationId::new().is_well_formed());
        assert!(RequestId::new().is_well_formed());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for raw in ["", "conv_", "conv-123", "conv_not-a-uuid", "msg_0190c5e2-7b3a-7c11-9a3e-1f2d3c4b5a69"] {
            assert!(!ConversationId::from_raw(raw).is_well_formed(), "{raw} should be rejected");
        }
        assert!(ConversationId::from_raw("conv_0190c5e2-7b3a-7c11-9a3e-1f2d3c4b5a69").is_well_formed());
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = ConversationId::new();
        let parsed: ConversationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConversationId::from_raw("conv_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""conv_abc""#);
        let user: UserId = serde_json::from_str(r#""u-1""#).unwrap();
        assert_eq!(user.as_str(), "u-1");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
