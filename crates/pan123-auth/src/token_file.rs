//! On-disk persistence for access tokens.
//!
//! The config file maps each remote name to its token blob, so several
//! configured remotes can share one file. Aliased names carry a trailing
//! `{suffix}`; tokens are always stored under the original name so a restart
//! of any alias finds them.

use std::collections::HashMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedToken {
    pub access_token: String,
    /// RFC-3339; chrono serializes `DateTime<Utc>` in that form.
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TokenFile {
    pub tokens: HashMap<String, PersistedToken>,
}

/// Strips a `{suffix}` alias from a remote name. `remote{tv}` and `remote`
/// address the same stored token.
pub fn canonical_remote_name(name: &str) -> &str {
    match (name.find('{'), name.ends_with('}')) {
        (Some(open), true) => &name[..open],
        _ => name,
    }
}

impl TokenFile {
    /// Reads the file, treating a missing file as empty.
    pub fn read(path: &Utf8Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TokenFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the whole file back. Overrides whatever is there with what's in
    /// the struct.
    pub fn write(&self, path: &Utf8Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| Error::FailedToWriteTokenFile {
                path: path.to_owned(),
                error,
            })?;
        }
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content).map_err(|error| Error::FailedToWriteTokenFile {
            path: path.to_owned(),
            error,
        })
    }

    pub fn get(&self, remote_name: &str) -> Option<&PersistedToken> {
        self.tokens.get(canonical_remote_name(remote_name))
    }

    pub fn set(&mut self, remote_name: &str, token: PersistedToken) {
        self.tokens
            .insert(canonical_remote_name(remote_name).to_string(), token);
    }
}
