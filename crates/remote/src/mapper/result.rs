//! Mapper from REAPI ActionResult to what the build records

use crate::client::ContentStore;
use crate::error::Result;
use crate::merkle::Digest;
use crate::reapi::{self, ActionResult};
use chrono::{DateTime, Utc};
use std::borrow::Cow;

/// Where and when an action ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    /// Worker that ran the action
    pub worker: String,
    /// When the action was queued
    pub queued_at: Option<DateTime<Utc>>,
    /// When a worker picked it up
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionMetadata {
    /// Convert from the wire message
    #[must_use]
    pub fn from_proto(metadata: &reapi::ExecutedActionMetadata) -> Self {
        Self {
            worker: metadata.worker.clone(),
            queued_at: timestamp(metadata.queued_timestamp.as_ref()),
            started_at: timestamp(metadata.worker_start_timestamp.as_ref()),
            completed_at: timestamp(metadata.worker_completed_timestamp.as_ref()),
        }
    }

    /// Time spent on the worker
    #[must_use]
    pub fn worker_duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

fn timestamp(ts: Option<&prost_types::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)
}

/// Output of a finished action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Exit code of the command
    pub exit_code: i32,
    /// Captured stdout, as the command wrote it
    pub stdout: Vec<u8>,
    /// Captured stderr, as the command wrote it
    pub stderr: Vec<u8>,
    /// Where and when it ran
    pub metadata: ExecutionMetadata,
    /// Served from the action cache
    pub cached: bool,
}

impl ActionOutput {
    /// Whether the command exited zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout for display; invalid UTF-8 is replaced
    #[must_use]
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr for display; invalid UTF-8 is replaced
    #[must_use]
    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Mapper for converting REAPI ActionResults
pub struct ResultMapper;

impl ResultMapper {
    /// Map an ActionResult, fetching stdout and stderr from the store when
    /// the server did not inline them
    pub async fn map_result(
        result: &ActionResult,
        cached: bool,
        store: &dyn ContentStore,
    ) -> Result<ActionOutput> {
        let stdout = Self::extract_output(&result.stdout_raw, result.stdout_digest.as_ref(), store).await?;
        let stderr = Self::extract_output(&result.stderr_raw, result.stderr_digest.as_ref(), store).await?;
        Ok(ActionOutput {
            exit_code: result.exit_code,
            stdout,
            stderr,
            metadata: result
                .execution_metadata
                .as_ref()
                .map(ExecutionMetadata::from_proto)
                .unwrap_or_default(),
            cached,
        })
    }

    async fn extract_output(
        inline_data: &[u8],
        digest: Option<&reapi::Digest>,
        store: &dyn ContentStore,
    ) -> Result<Vec<u8>> {
        if !inline_data.is_empty() {
            return Ok(inline_data.to_vec());
        }
        match digest {
            Some(proto) if proto.size_bytes > 0 => {
                let digest = Digest::from_proto(proto)?;
                store.read_blob(&digest).await
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryContentStore;

    #[tokio::test]
    async fn test_map_result_inline_output() {
        let action_result = ActionResult {
            exit_code: 0,
            stdout_raw: b"hello\n".to_vec(),
            stderr_raw: b"hello stderr".to_vec(),
            ..Default::default()
        };

        let output = ResultMapper::map_result(&action_result, false, &MemoryContentStore::new())
            .await
            .unwrap();

        assert_eq!(output.stdout, b"hello\n");
        assert_eq!(output.stderr_text(), "hello stderr");
        assert!(output.success());
        assert!(!output.cached);
    }

    #[tokio::test]
    async fn test_map_result_reads_digests() {
        let store = MemoryContentStore::new();
        let stderr = store.insert(b"error message".to_vec());
        let action_result = ActionResult {
            exit_code: 1,
            stderr_digest: Some(stderr.to_proto()),
            stdout_digest: Some(Digest::empty().to_proto()),
            ..Default::default()
        };

        let output = ResultMapper::map_result(&action_result, true, &store).await.unwrap();
        assert_eq!(output.stderr, b"error message");
        assert!(output.stdout.is_empty());
        assert!(!output.success());
        assert!(output.cached);
    }

    #[tokio::test]
    async fn test_map_result_keeps_raw_bytes() {
        let store = MemoryContentStore::new();
        let binary = vec![0xff, 0xfe, b'o', b'k', 0x80];
        let stdout = store.insert(binary.clone());
        let action_result = ActionResult {
            stdout_digest: Some(stdout.to_proto()),
            stderr_raw: vec![0xc3, 0x28],
            ..Default::default()
        };

        let output = ResultMapper::map_result(&action_result, false, &store).await.unwrap();
        assert_eq!(output.stdout, binary);
        assert_eq!(output.stderr, [0xc3_u8, 0x28]);
        assert_eq!(output.stdout_text(), "\u{fffd}\u{fffd}ok\u{fffd}");
    }

    #[test]
    fn test_metadata_timestamps() {
        let metadata = reapi::ExecutedActionMetadata {
            worker: "kev".to_string(),
            worker_start_timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            worker_completed_timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_005,
                nanos: 0,
            }),
            ..Default::default()
        };
        let converted = ExecutionMetadata::from_proto(&metadata);
        assert_eq!(converted.worker, "kev");
        assert!(converted.queued_at.is_none());
        assert_eq!(converted.worker_duration(), Some(chrono::Duration::seconds(5)));
    }
}
