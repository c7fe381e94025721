use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The security classes a node can be granted. Order matters: higher classes
/// take precedence when choosing the encapsulation for outgoing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityClass {
    S2AccessControl,
    S2Authenticated,
    S2Unauthenticated,
    S0Legacy,
    /// Used while bootstrapping a node with a temporary key
    Temporary,
    None,
}

impl SecurityClass {
    /// All permanently assignable classes, highest priority first
    pub const ALL: [SecurityClass; 4] = [
        SecurityClass::S2AccessControl,
        SecurityClass::S2Authenticated,
        SecurityClass::S2Unauthenticated,
        SecurityClass::S0Legacy,
    ];

    pub fn is_s2(&self) -> bool {
        matches!(
            self,
            SecurityClass::S2AccessControl
                | SecurityClass::S2Authenticated
                | SecurityClass::S2Unauthenticated
        )
    }
}

impl Display for SecurityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SecurityClass::S2AccessControl => "S2 Access Control",
            SecurityClass::S2Authenticated => "S2 Authenticated",
            SecurityClass::S2Unauthenticated => "S2 Unauthenticated",
            SecurityClass::S0Legacy => "S0 Legacy",
            SecurityClass::Temporary => "Temporary",
            SecurityClass::None => "None",
        };
        write!(f, "{}", name)
    }
}
