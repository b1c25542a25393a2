//! Labeling platform interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapper::AnnotationRecord;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// Network failure or 5xx; worth retrying.
    #[error("platform transport error: {0}")]
    Transport(String),

    /// The platform refused the request (4xx, invalid config or payload).
    #[error("platform rejected request: {0}")]
    Rejected(String),
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// An existing project as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: u64,
    #[serde(default)]
    pub title: String,
}

#[async_trait]
pub trait LabelingPlatform: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, PlatformError>;

    /// First project whose title matches `title` exactly.
    async fn find_project(&self, title: &str) -> Result<Option<u64>, PlatformError> {
        let projects = self.list_projects().await?;
        Ok(projects
            .into_iter()
            .find(|project| project.title == title)
            .map(|project| project.id))
    }

    /// Create a project with the given labeling config; returns its id.
    async fn create_project(&self, title: &str, template_xml: &str) -> Result<u64, PlatformError>;

    /// Import one annotated task; returns the platform task id.
    async fn import_task(
        &self,
        project_id: u64,
        record: &AnnotationRecord,
    ) -> Result<u64, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(PlatformError::Transport("reset".into()).is_retryable());
        assert!(!PlatformError::Rejected("bad xml".into()).is_retryable());
    }

    struct Listed(Vec<ProjectSummary>);

    #[async_trait]
    impl LabelingPlatform for Listed {
        async fn list_projects(&self) -> Result<Vec<ProjectSummary>, PlatformError> {
            Ok(self.0.clone())
        }

        async fn create_project(&self, _title: &str, _xml: &str) -> Result<u64, PlatformError> {
            Err(PlatformError::Rejected("read only".into()))
        }

        async fn import_task(&self, _id: u64, _record: &AnnotationRecord) -> Result<u64, PlatformError> {
            Err(PlatformError::Rejected("read only".into()))
        }
    }

    #[test]
    fn test_find_project_matches_exact_title() {
        tokio_test::block_on(async {
            let platform = Listed(vec![
                ProjectSummary { id: 3, title: "Calls".into() },
                ProjectSummary { id: 9, title: "Calls QA".into() },
            ]);
            assert_eq!(platform.find_project("Calls QA").await.expect("find"), Some(9));
            assert_eq!(platform.find_project("calls").await.expect("find"), None);
        });
    }
}
