use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::atomic::append_line;
use crate::{Error, Result};

/// Append one record to an NDJSON file as a single fsynced line.
pub fn append_record<T: Serialize>(path: impl AsRef<Path>, record: &T) -> Result<()> {
    let line = serde_json::to_string(record)?;
    append_line(path, &line)
}

/// Read all records from an NDJSON file.
///
/// A missing file yields an empty vector. Malformed or blank lines are
/// skipped: record files are append-only and a torn trailing line from a
/// crashed writer must not poison the rest of the file.
pub fn read_records<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::read(path, e)),
    };

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::read(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str(line) {
            records.push(record);
        }
    }
    Ok(records)
}
