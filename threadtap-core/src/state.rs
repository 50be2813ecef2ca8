//! Durable state: captured templates and the last search result.
//!
//! The state file is a convenience cache, so loading is lenient — a
//! missing, unreadable, or malformed file yields empty state and the tool
//! keeps working. Saving is atomic (write to a sibling temp file, then
//! rename) so a crash mid-write never truncates good state. Session
//! header values are stripped before templates reach this type; the file
//! must never contain a credential.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::capture::template::{RequestTemplate, TemplateStore};
use crate::error::CoreError;
use crate::model::SearchResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub templates: Vec<RequestTemplate>,
    #[serde(default)]
    pub last_result: Option<SearchResult>,
}

impl PersistedState {
    /// Snapshot of what is worth keeping across restarts. Templates are
    /// scrubbed of the session header on the way out.
    pub fn capture(
        templates: &TemplateStore,
        session_header: &str,
        last_result: Option<&SearchResult>,
    ) -> Self {
        Self {
            templates: templates.snapshot(session_header),
            last_result: last_result.cloned(),
        }
    }

    /// Loads state from `path`, falling back to empty state on any
    /// problem.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file, starting fresh");
                return Self::default();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "state file unreadable, starting fresh");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "state file malformed, starting fresh");
                Self::default()
            }
        }
    }

    /// Writes state atomically: serialize into a temp file next to `path`,
    /// then rename over it.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)
            .map_err(|err| CoreError::State(format!("creating temp file in {}: {err}", dir.display())))?;
        serde_json::to_writer_pretty(&mut file, self)
            .map_err(|err| CoreError::State(format!("serializing state: {err}")))?;
        file.persist(path)
            .map_err(|err| CoreError::State(format!("replacing {}: {err}", path.display())))?;
        debug!(path = %path.display(), templates = self.templates.len(), "state saved");
        Ok(())
    }
}
