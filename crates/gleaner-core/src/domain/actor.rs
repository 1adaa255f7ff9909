//! Actor - 操作主体と capability
//!
//! 役割は request 境界で一度だけ解決され、core の操作には `Actor` として
//! 明示的に渡されます。core 内で JSON から役割を読み直すことはしません。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{GleanerError, Result};

/// Who performs an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// Schedulers, reapers and cascaded effects.
    System,
    Worker(String),
    Moderator(String),
    Admin(String),
}

/// Fixed capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ProcessJobs,
    Schedule,
    Moderate,
    Override,
    ManagePolicy,
}

impl Actor {
    pub fn worker(id: impl Into<String>) -> Self {
        Actor::Worker(id.into())
    }

    pub fn moderator(id: impl Into<String>) -> Self {
        Actor::Moderator(id.into())
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Actor::Admin(id.into())
    }

    pub fn has(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            Actor::System => matches!(capability, ProcessJobs | Schedule),
            Actor::Worker(_) => matches!(capability, ProcessJobs),
            Actor::Moderator(_) => matches!(capability, Moderate),
            Actor::Admin(_) => true,
        }
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(GleanerError::Forbidden {
                actor: self.to_string(),
                capability,
            })
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Worker(id) => write!(f, "worker:{id}"),
            Actor::Moderator(id) => write!(f, "moderator:{id}"),
            Actor::Admin(id) => write!(f, "admin:{id}"),
        }
    }
}
