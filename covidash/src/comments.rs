//! Comments attached to data points, kept in an append-only store keyed by the data point id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{CovidashError, Result};

/// A comment on a data point. Field names follow the comment table's keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(rename = "ID")]
    pub subject_id: String,
    #[serde(rename = "TIMESTAMP")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "COMMENT")]
    pub text: String,
    #[serde(rename = "USER")]
    pub user: String,
}

impl Comment {
    /// Validate the fields and stamp the comment with the current time.
    pub fn new(subject_id: &str, user: &str, text: &str) -> Result<Self> {
        if [subject_id, user, text].iter().any(|v| v.trim().is_empty()) {
            return Err(CovidashError::Validation(
                "Datapoint ID, User, and Comment are required".into(),
            ));
        }
        Ok(Self {
            subject_id: subject_id.to_string(),
            timestamp: Utc::now(),
            text: text.to_string(),
            user: user.to_string(),
        })
    }
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn append_comment(&self, comment: Comment) -> Result<()>;

    /// Comments on `subject_id` in the order they were appended.
    async fn list_comments(&self, subject_id: &str) -> Result<Vec<Comment>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCommentStore {
    comments: RwLock<HashMap<String, Vec<Comment>>>,
}

impl InMemoryCommentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommentStore for InMemoryCommentStore {
    async fn append_comment(&self, comment: Comment) -> Result<()> {
        self.comments
            .write()
            .await
            .entry(comment.subject_id.clone())
            .or_default()
            .push(comment);
        Ok(())
    }

    async fn list_comments(&self, subject_id: &str) -> Result<Vec<Comment>> {
        Ok(self
            .comments
            .read()
            .await
            .get(subject_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Stores comments as one JSON record per line of a file.
#[derive(Debug)]
pub struct JsonLinesCommentStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonLinesCommentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("storing comments in {}", path.display());
        Self {
            path,
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CommentStore for JsonLinesCommentStore {
    async fn append_comment(&self, comment: Comment) -> Result<()> {
        let mut line = serde_json::to_string(&comment).map_err(|e| {
            CovidashError::ServiceUnavailable(format!("failed to encode comment: {e}"))
        })?;
        line.push('\n');
        let _guard = self.writer.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("appended comment on {}", comment.subject_id);
        Ok(())
    }

    async fn list_comments(&self, subject_id: &str) -> Result<Vec<Comment>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut comments = vec![];
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let comment: Comment = serde_json::from_str(line).map_err(|e| {
                CovidashError::DataIntegrity(format!(
                    "{} line {}: {e}",
                    self.path.display(),
                    idx + 1
                ))
            })?;
            if comment.subject_id == subject_id {
                comments.push(comment);
            }
        }
        Ok(comments)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn round_trip(store: &dyn CommentStore) -> anyhow::Result<()> {
        let before = Utc::now();
        let comment = Comment::new("X1", "ana", "looks high")?;
        store.append_comment(comment.clone()).await?;
        store
            .append_comment(Comment::new("X2", "ana", "unrelated")?)
            .await?;

        let comments = store.list_comments("X1").await?;
        assert_eq!(comments, vec![comment]);
        assert!(comments[0].timestamp >= before);
        assert!(store.list_comments("missing").await?.is_empty());

        let later = Comment::new("X1", "ben", "agreed")?;
        store.append_comment(later.clone()).await?;
        let texts: Vec<_> = store
            .list_comments("X1")
            .await?
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["looks high", "agreed"]);
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_should_list_appended_comments() -> anyhow::Result<()> {
        round_trip(&InMemoryCommentStore::new()).await
    }

    #[tokio::test]
    async fn json_lines_store_should_list_appended_comments() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = JsonLinesCommentStore::new(dir.path().join("comments.jsonl"));
        assert!(store.list_comments("X1").await?.is_empty());
        round_trip(&store).await?;

        let contents = std::fs::read_to_string(store.path())?;
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.starts_with(r#"{"ID":"X1","TIMESTAMP":"#));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_lines_should_fail_integrity() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("comments.jsonl");
        std::fs::write(&path, "not json\n")?;
        let err = JsonLinesCommentStore::new(path)
            .list_comments("X1")
            .await
            .unwrap_err();
        assert!(matches!(err, CovidashError::DataIntegrity(_)));
        Ok(())
    }

    #[test]
    fn blank_fields_should_fail_validation() {
        assert!(Comment::new("", "ana", "text").is_err());
        assert!(Comment::new("X1", " ", "text").is_err());
        assert!(Comment::new("X1", "ana", "").is_err());
    }
}
