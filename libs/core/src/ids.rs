use std::fmt::{Display, Formatter};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque stable user identifier issued by the external identity system.
    UserId
);
string_id!(
    /// Conversation identifier; all routing keys derive from it.
    ConversationId
);
string_id!(
    /// One live transport connection. A user may hold several at once.
    SocketId
);

impl SocketId {
    /// Mints a fresh socket id for a newly accepted connection.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Time-ordered message identifier (ULID). Lexicographic order matches ingest
/// order, which is what cursor pagination and partition FIFO rely on.
///
/// ```
/// use relay_core::MessageId;
///
/// let a = MessageId::generate();
/// let b = MessageId::generate();
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

fn generator() -> &'static Mutex<Generator> {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    GENERATOR.get_or_init(|| Mutex::new(Generator::new()))
}

impl MessageId {
    /// Generates a strictly increasing id. Ids minted inside the same
    /// millisecond are ordered by the monotonic generator rather than by
    /// chance.
    pub fn generate() -> Self {
        let mut generator = generator().lock().unwrap_or_else(|err| err.into_inner());
        match generator.generate() {
            Ok(ulid) => Self(ulid),
            // Monotonic overflow within one millisecond; fall back to a
            // fresh random ULID.
            Err(_) => Self(Ulid::new()),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Trace identifier propagated from handshake or request through every
/// downstream operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
