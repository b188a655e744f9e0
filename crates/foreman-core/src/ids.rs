use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_newtype!(ProjectId);
id_newtype!(TaskId);
id_newtype!(RunId);
id_newtype!(EventId);

impl RunId {
    /// Fresh run id, `r-<ulid>`. Ulids sort by creation time.
    pub fn generate() -> Self {
        Self(format!("r-{}", Ulid::new()))
    }
}

impl EventId {
    pub fn generate() -> Self {
        Self(format!("e-{}", Ulid::new()))
    }
}

impl ProjectId {
    /// Project ids double as directory names, so keep them to a safe alphabet.
    pub fn is_valid_name(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}
