//! Identifier types for Synapse entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an agent mode (role template)
    ModeId
);
uuid_id!(
    /// Identifier of a configured agent instance
    InstanceId
);
uuid_id!(
    /// Identifier of a conversation session
    SessionId
);
uuid_id!(
    /// Identifier of a session message
    MessageId
);
uuid_id!(
    /// Identifier of a knowledge graph node
    NodeId
);
uuid_id!(
    /// Identifier of a knowledge graph edge
    EdgeId
);
uuid_id!(
    /// Identifier of a behavioral rule
    RuleId
);
uuid_id!(
    /// Identifier of a learning event
    LearningEventId
);
uuid_id!(
    /// Identifier of a prompt execution record
    ExecutionId
);
uuid_id!(
    /// Identifier of a prompt template
    TemplateId
);
