//! Append-only JSONL attendance log.

use crate::gallery::JsonGalleryStore;
use crate::ports::{AttendanceSink, SinkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One line of the attendance log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub timestamp: DateTime<Utc>,
    pub organization: String,
    pub member_id: String,
    pub confidence: f32,
}

/// Writes one [`AttendanceRecord`] per line.
///
/// With a roster attached, records for members missing from the
/// organization's gallery fail with [`SinkError::UnknownMember`], the way a
/// foreign-key constraint would in a database-backed log.
#[derive(Debug, Clone)]
pub struct JsonlAttendanceSink {
    path: PathBuf,
    organization: String,
    roster: Option<JsonGalleryStore>,
}

impl JsonlAttendanceSink {
    pub fn new(path: impl Into<PathBuf>, organization: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            organization: organization.into(),
            roster: None,
        }
    }

    pub fn with_roster(mut self, roster: JsonGalleryStore) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &AttendanceRecord) -> Result<(), SinkError> {
        let io_err = |source: std::io::Error| SinkError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut line = serde_json::to_string(record).map_err(|e| SinkError::Rejected(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

impl AttendanceSink for JsonlAttendanceSink {
    async fn record_match(&self, member_id: &str, confidence: f32) -> Result<(), SinkError> {
        if let Some(roster) = &self.roster {
            let known = roster
                .contains(&self.organization, member_id)
                .await
                .map_err(|e| SinkError::Rejected(e.to_string()))?;
            if !known {
                return Err(SinkError::UnknownMember(member_id.to_string()));
            }
        }

        let record = AttendanceRecord {
            timestamp: Utc::now(),
            organization: self.organization.clone(),
            member_id: member_id.to_string(),
            confidence,
        };
        self.append(&record).await?;
        tracing::info!(
            organization = %self.organization,
            member_id,
            confidence,
            "attendance recorded"
        );
        Ok(())
    }
}

/// Read every record from a log written by [`JsonlAttendanceSink`].
pub async fn read_log(path: impl AsRef<Path>) -> Result<Vec<AttendanceRecord>, SinkError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await.map_err(|source| SinkError::Io {
        path: path.display().to_string(),
        source,
    })?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| SinkError::Rejected(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{Embedding, GalleryEntry, MemberStatus};

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/attendance.jsonl");
        let sink = JsonlAttendanceSink::new(&path, "club");

        sink.record_match("m1", 0.91).await.unwrap();
        sink.record_match("m1", 0.93).await.unwrap();
        sink.record_match("m2", 0.88).await.unwrap();

        let records = read_log(&path).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].member_id, "m1");
        assert_eq!(records[2].organization, "club");
        assert!((records[1].confidence - 0.93).abs() < 1e-6);
        assert!(records[0].timestamp <= records[2].timestamp);
    }

    #[tokio::test]
    async fn test_roster_rejects_unknown_member() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonGalleryStore::new(dir.path().join("galleries"));
        store
            .add(
                "club",
                GalleryEntry {
                    member_id: "m1".into(),
                    name: "One".into(),
                    status: MemberStatus::Allowed,
                    embedding: Embedding::new(vec![1.0], "test"),
                },
            )
            .await
            .unwrap();
        let path = dir.path().join("attendance.jsonl");
        let sink = JsonlAttendanceSink::new(&path, "club").with_roster(store);

        sink.record_match("m1", 0.9).await.unwrap();
        match sink.record_match("ghost", 0.9).await {
            Err(SinkError::UnknownMember(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected unknown member, got {other:?}"),
        }
        assert_eq!(read_log(&path).await.unwrap().len(), 1);
    }
}
