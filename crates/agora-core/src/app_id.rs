//! The application identifier (AID).

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Separator used to render an [`ApplicationId`] as a single topic or path
/// segment. `/` is reserved by the topic grammar, so the triple is joined
/// with a character the sanitiser accepts and no field may contain.
pub const APP_ID_SEPARATOR: char = '^';

/// Unique identifier of an application: `(name, version, block)`.
///
/// Rendered as `name^version^block` wherever a single string is needed
/// (topics, storage paths, plugin workspaces). Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    /// The application name.
    pub app_name: String,
    /// The application version.
    pub version: String,
    /// The name of the managed block inside the application.
    pub block_name: String,
}

impl ApplicationId {
    /// Creates a new identifier from its three components.
    pub fn new(
        app_name: impl Into<String>,
        version: impl Into<String>,
        block_name: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            version: version.into(),
            block_name: block_name.into(),
        }
    }
}

impl Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.app_name,
            self.version,
            self.block_name,
            sep = APP_ID_SEPARATOR
        )
    }
}

impl FromStr for ApplicationId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(APP_ID_SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(app), Some(version), Some(block), None)
                if !app.is_empty() && !version.is_empty() && !block.is_empty() =>
            {
                Ok(Self::new(app, version, block))
            }
            _ => Err(MessageError::InvalidApplicationId(s.to_string())),
        }
    }
}
