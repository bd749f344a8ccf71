// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crash-safe metadata file writes (spec.md §6 "replstat.txt",
//! "storelist.txt", "storeinfo.txt"), grounded on the manifest's
//! `rewrite_atomic` pattern.

use std::{io::Write, path::Path};

/// Atomically rewrites `path` with `content` via a tempfile-and-rename,
/// fsyncing the result so a crash never observes a half-written file.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(folder)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path).map_err(|e| e.error)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = std::fs::File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

/// Reads and parses a JSON metadata file. `None` if the file is absent,
/// `Err(Error::Corrupt(what))` if it exists but fails to parse.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &'static str) -> crate::Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| crate::Error::Corrupt(what))
}

/// Serializes `value` as JSON and atomically rewrites `path`.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|_| crate::Error::Corrupt("serialize"))?;
    rewrite_atomic(path, &bytes)?;
    Ok(())
}
