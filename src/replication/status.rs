// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The durable replication status record (spec.md §3 "Replication status",
//! §6 "Replication status file").

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Filename of the durable replication status record, relative to a base
/// folder.
pub const STATUS_FILE_NAME: &str = "replstat.txt";

/// `<base>/replstat.txt`. Written on both sides at state transitions;
/// reopen arbitrates between the two copies by file-modification time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// `true` selects `folders[0]` as the active base.
    #[serde(rename = "ActiveFolderToggler")]
    pub active_folder_toggler: bool,

    /// Set once a passive-side mutation has failed; suppresses repeated
    /// status-file writes from peers sharing the same global snapshot.
    #[serde(rename = "FailedToReplicate")]
    pub failed_to_replicate: bool,

    /// Whether committed changes are being logged for replay.
    #[serde(rename = "LogCommitChanges")]
    pub log_commit_changes: bool,
}

impl ReplicationStatus {
    /// The default status: `folders[0]` active, nothing failed.
    #[must_use]
    pub fn default_active() -> Self {
        Self {
            active_folder_toggler: true,
            failed_to_replicate: false,
            log_commit_changes: false,
        }
    }

    /// Reads and parses `<folder>/replstat.txt`, returning `None` if it
    /// does not exist.
    pub fn load(folder: &Path) -> crate::Result<Option<Self>> {
        crate::atomic_file::read_json(&folder.join(STATUS_FILE_NAME), "replstat.txt")
    }

    /// Atomically (re)writes `<folder>/replstat.txt`.
    pub fn save(&self, folder: &Path) -> crate::Result<()> {
        crate::atomic_file::write_json(&folder.join(STATUS_FILE_NAME), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let status = ReplicationStatus {
            active_folder_toggler: false,
            failed_to_replicate: true,
            log_commit_changes: true,
        };
        status.save(dir.path())?;

        let loaded = ReplicationStatus::load(dir.path())?.expect("file was just written");
        assert_eq!(loaded, status);
        Ok(())
    }

    #[test]
    fn missing_file_loads_as_none() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(ReplicationStatus::load(dir.path())?.is_none());
        Ok(())
    }

    #[test]
    fn field_names_match_wire_format() -> crate::Result<()> {
        let status = ReplicationStatus::default_active();
        let value = serde_json::to_value(status).expect("serialize");
        assert_eq!(value["ActiveFolderToggler"], true);
        assert_eq!(value["FailedToReplicate"], false);
        assert_eq!(value["LogCommitChanges"], false);
        Ok(())
    }
}
