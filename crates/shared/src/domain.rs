use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);
id_newtype!(CallId);

/// Client-generated token linking an optimistic local message to the row the
/// store later assigns. Unique per sender per logical send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Media,
    Sticker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendTarget {
    User { user_id: UserId },
    Group { group_id: GroupId },
}

/// Addressable message stream: a normalized user pair or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationId {
    Direct { a: UserId, b: UserId },
    Group { group_id: GroupId },
}

impl ConversationId {
    /// Both ends of a direct conversation derive the same key: the smaller
    /// user id always comes first.
    pub fn direct(x: UserId, y: UserId) -> Self {
        if x <= y {
            Self::Direct { a: x, b: y }
        } else {
            Self::Direct { a: y, b: x }
        }
    }

    pub fn group(group_id: GroupId) -> Self {
        Self::Group { group_id }
    }

    /// The other direct participant, if this is a direct conversation
    /// involving `me`.
    pub fn direct_peer(&self, me: UserId) -> Option<UserId> {
        match *self {
            Self::Direct { a, b } if a == me => Some(b),
            Self::Direct { a, b } if b == me => Some(a),
            _ => None,
        }
    }
}
