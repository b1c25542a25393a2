use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use labelaudio_core::mapper::AnnotationRecord;
use labelaudio_core::platform::{LabelingPlatform, PlatformError, ProjectSummary};

use crate::preview_body;

/// Label Studio REST client (`Authorization: Token <key>`).
pub struct LabelStudioClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedProject {
    id: u64,
}

/// `GET /api/projects` answers with a page, or a bare list on older servers.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProjectListing {
    Page {
        results: Vec<ProjectSummary>,
        #[serde(default)]
        next: Option<String>,
    },
    List(Vec<ProjectSummary>),
}

#[derive(Deserialize)]
struct ImportReply {
    #[serde(default)]
    task_ids: Vec<u64>,
    #[serde(default)]
    task_count: u64,
}

impl LabelStudioClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn headers(&self) -> Result<HeaderMap, PlatformError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| PlatformError::Rejected(format!("invalid api key header: {}", e)))?,
        );
        Ok(headers)
    }

    async fn get(&self, url: &str) -> Result<String, PlatformError> {
        let request = self.client.get(url).headers(self.headers()?);
        self.send(request).await
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<String, PlatformError> {
        let request = self.client.post(url).headers(self.headers()?).json(body);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, PlatformError> {
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        check_status(status, &text)?;
        Ok(text)
    }
}

/// 429 and 5xx are transient; any other non-success is a rejection.
pub(crate) fn check_status(status: StatusCode, body: &str) -> Result<(), PlatformError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {}: {}", status, preview_body(body));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(PlatformError::Transport(message))
    } else {
        Err(PlatformError::Rejected(message))
    }
}

/// One page of projects plus the url of the next page, if any.
pub(crate) fn parse_project_listing(
    body: &str,
) -> Result<(Vec<ProjectSummary>, Option<String>), PlatformError> {
    let listing: ProjectListing = serde_json::from_str(body)
        .map_err(|e| PlatformError::Rejected(format!("invalid project listing: {}", e)))?;
    Ok(match listing {
        ProjectListing::Page { results, next } => (results, next),
        ProjectListing::List(projects) => (projects, None),
    })
}

pub(crate) fn parse_import_reply(body: &str) -> Result<u64, PlatformError> {
    let reply: ImportReply = serde_json::from_str(body)
        .map_err(|e| PlatformError::Rejected(format!("invalid import reply: {}", e)))?;
    match reply.task_ids.first() {
        Some(id) => Ok(*id),
        None => Err(PlatformError::Rejected(format!(
            "import created {} tasks but returned no task id",
            reply.task_count
        ))),
    }
}

#[async_trait]
impl LabelingPlatform for LabelStudioClient {
    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, PlatformError> {
        let mut projects = Vec::new();
        let mut next = Some(format!("{}/api/projects?page_size=100", self.base_url));
        while let Some(url) = next {
            let text = self.get(&url).await?;
            let (page, following) = parse_project_listing(&text)?;
            projects.extend(page);
            next = following;
        }
        tracing::debug!(count = projects.len(), "labeling projects listed");
        Ok(projects)
    }

    async fn create_project(&self, title: &str, template_xml: &str) -> Result<u64, PlatformError> {
        let url = format!("{}/api/projects", self.base_url);
        let body = json!({"title": title, "label_config": template_xml});
        let text = self.post(&url, &body).await?;
        let project: CreatedProject = serde_json::from_str(&text)
            .map_err(|e| PlatformError::Rejected(format!("invalid project reply: {}", e)))?;
        tracing::info!(project_id = project.id, title = %title, "labeling project created");
        Ok(project.id)
    }

    async fn import_task(
        &self,
        project_id: u64,
        record: &AnnotationRecord,
    ) -> Result<u64, PlatformError> {
        let url = format!(
            "{}/api/projects/{}/import?return_task_ids=true",
            self.base_url, project_id
        );
        let body = json!([record.to_import_task()]);
        let text = self.post(&url, &body).await?;
        let task_id = parse_import_reply(&text)?;
        tracing::info!(
            project_id,
            task_id,
            regions = record.regions.len(),
            "annotation task imported"
        );
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(check_status(StatusCode::CREATED, "").is_ok());
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE, "maintenance"),
            Err(PlatformError::Transport(_))
        ));
        let rejected = check_status(StatusCode::BAD_REQUEST, "label_config invalid").unwrap_err();
        assert!(matches!(rejected, PlatformError::Rejected(ref m) if m.contains("label_config")));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_import_reply() {
        assert_eq!(
            parse_import_reply(r#"{"task_count": 1, "annotation_count": 1, "task_ids": [42]}"#)
                .expect("id"),
            42
        );
        assert!(matches!(
            parse_import_reply(r#"{"task_count": 1}"#),
            Err(PlatformError::Rejected(_))
        ));
    }

    #[test]
    fn test_project_listing_accepts_pages_and_bare_lists() {
        let (page, next) = parse_project_listing(
            r#"{"count": 2, "next": "http://ls.local/api/projects?page=2", "results": [{"id": 4, "title": "Calls"}]}"#,
        )
        .expect("page");
        assert_eq!(page, vec![ProjectSummary { id: 4, title: "Calls".into() }]);
        assert_eq!(next.as_deref(), Some("http://ls.local/api/projects?page=2"));

        let (list, next) = parse_project_listing(r#"[{"id": 1, "title": "a"}, {"id": 2}]"#).expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].title, "");
        assert!(next.is_none());

        assert!(matches!(
            parse_project_listing(r#"{"detail": "nope"}"#),
            Err(PlatformError::Rejected(_))
        ));
    }

    #[test]
    fn test_api_key_becomes_token_header() {
        let client =
            LabelStudioClient::new("http://ls.local/", "secret", Duration::from_secs(5)).expect("client");
        let headers = client.headers().expect("headers");
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Token secret")
        );
        assert_eq!(client.base_url, "http://ls.local");
    }
}
