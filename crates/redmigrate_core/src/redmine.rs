use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::assets::ResolvedAsset;
use crate::config::{DEFAULT_TIMEOUT_MS, MigrationConfig};

#[derive(Debug, thiserror::Error)]
pub enum RedmineError {
    /// HTTP 422: the payload was understood but rejected, e.g. a duplicate
    /// wiki title. Callers fall back from create to update on this kind.
    #[error("Redmine rejected the payload: {0}")]
    Validation(String),
    #[error("Redmine request failed with HTTP {0}")]
    Status(u16),
    #[error("failed to reach Redmine: {0}")]
    Transport(String),
    #[error("failed to decode Redmine response: {0}")]
    Decode(String),
    #[error("failed to read attachment: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: i64,
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct WikiPagePayload {
    pub title: String,
    pub text: String,
    pub parent_title: Option<String>,
    pub uploads: Vec<ResolvedAsset>,
}

#[derive(Debug, Clone)]
pub struct IssuePayload {
    pub subject: String,
    pub description: String,
    pub tracker_id: i64,
    pub status_id: i64,
    pub priority_id: i64,
    pub start_date: String,
    pub due_date: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub tracker_id: i64,
    pub status_id: i64,
    pub priority_id: i64,
    pub notes: Option<String>,
    pub uploads: Vec<ResolvedAsset>,
}

pub trait RedmineApi {
    fn projects(&mut self) -> Result<Vec<Project>, RedmineError>;
    fn create_wiki_page(&mut self, page: &WikiPagePayload) -> Result<(), RedmineError>;
    fn update_wiki_page(&mut self, page: &WikiPagePayload) -> Result<(), RedmineError>;
    fn create_issue(&mut self, issue: &IssuePayload) -> Result<i64, RedmineError>;
    fn update_issue(&mut self, issue_id: i64, update: &IssueUpdate) -> Result<(), RedmineError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RedmineClientConfig {
    pub url: String,
    pub api_key: String,
    pub project: String,
    pub timeout_ms: u64,
}

impl RedmineClientConfig {
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        Ok(Self {
            url: config.redmine_url()?,
            api_key: config.redmine_api_key()?,
            project: config.redmine_project()?,
            timeout_ms: config.redmine.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        })
    }
}

pub struct RedmineClient {
    client: Client,
    config: RedmineClientConfig,
    request_count: usize,
}

impl RedmineClient {
    pub fn new(config: RedmineClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Redmine HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url.trim_end_matches('/'))
    }

    /// Upload one attachment body and return the token Redmine hands back
    /// for linking it to a wiki page or issue.
    fn upload_asset(&mut self, asset: &ResolvedAsset) -> Result<UploadToken, RedmineError> {
        let bytes = fs::read(&asset.local_path)
            .map_err(|error| RedmineError::Io(format!("{}: {error}", asset.local_path.display())))?;
        self.request_count += 1;
        let response = self
            .client
            .post(self.endpoint("uploads.json"))
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .header("Content-Type", "application/octet-stream")
            .query(&[("filename", asset.filename.as_str())])
            .body(bytes)
            .send()
            .map_err(|error| RedmineError::Transport(error.to_string()))?;
        let response = check_response(response)?;
        let payload: UploadResponse = response
            .json()
            .map_err(|error| RedmineError::Decode(error.to_string()))?;
        Ok(UploadToken {
            token: payload.upload.token,
            filename: asset.filename.clone(),
        })
    }

    fn upload_all(&mut self, assets: &[ResolvedAsset]) -> Result<Vec<UploadToken>, RedmineError> {
        let mut tokens = Vec::with_capacity(assets.len());
        for asset in assets {
            tokens.push(self.upload_asset(asset)?);
        }
        Ok(tokens)
    }

    fn put_wiki_page(&mut self, page: &WikiPagePayload) -> Result<(), RedmineError> {
        let uploads = self.upload_all(&page.uploads)?;
        let body = WikiPageBody {
            wiki_page: WikiPageFields {
                text: &page.text,
                parent_title: page.parent_title.as_deref(),
                uploads,
            },
        };
        self.request_count += 1;
        let response = self
            .client
            .put(self.endpoint(&format!(
                "projects/{}/wiki/{}.json",
                self.config.project, page.title
            )))
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .json(&body)
            .send()
            .map_err(|error| RedmineError::Transport(error.to_string()))?;
        check_response(response)?;
        Ok(())
    }
}

impl RedmineApi for RedmineClient {
    fn projects(&mut self) -> Result<Vec<Project>, RedmineError> {
        let limit = 100usize;
        let mut output = Vec::new();
        let mut offset = 0usize;
        loop {
            self.request_count += 1;
            let response = self
                .client
                .get(self.endpoint("projects.json"))
                .header("X-Redmine-API-Key", self.config.api_key.clone())
                .query(&[("limit", limit.to_string()), ("offset", offset.to_string())])
                .send()
                .map_err(|error| RedmineError::Transport(error.to_string()))?;
            let response = check_response(response)?;
            let payload: ProjectsResponse = response
                .json()
                .map_err(|error| RedmineError::Decode(error.to_string()))?;
            let count = payload.projects.len();
            output.extend(payload.projects);
            offset += count;
            if count < limit || offset >= payload.total_count.unwrap_or(i64::MAX) as usize {
                break;
            }
        }
        Ok(output)
    }

    fn create_wiki_page(&mut self, page: &WikiPagePayload) -> Result<(), RedmineError> {
        self.put_wiki_page(page)
    }

    fn update_wiki_page(&mut self, page: &WikiPagePayload) -> Result<(), RedmineError> {
        self.put_wiki_page(page)
    }

    fn create_issue(&mut self, issue: &IssuePayload) -> Result<i64, RedmineError> {
        self.request_count += 1;
        let body = IssueBody {
            issue: IssueFields {
                project_id: Some(self.config.project.as_str()),
                subject: Some(issue.subject.as_str()),
                description: Some(issue.description.as_str()),
                tracker_id: issue.tracker_id,
                status_id: issue.status_id,
                priority_id: issue.priority_id,
                start_date: Some(issue.start_date.as_str()),
                due_date: Some(issue.due_date.as_str()),
                notes: None,
                uploads: Vec::new(),
            },
        };
        let response = self
            .client
            .post(self.endpoint("issues.json"))
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .json(&body)
            .send()
            .map_err(|error| RedmineError::Transport(error.to_string()))?;
        let response = check_response(response)?;
        let payload: IssueResponse = response
            .json()
            .map_err(|error| RedmineError::Decode(error.to_string()))?;
        Ok(payload.issue.id)
    }

    fn update_issue(&mut self, issue_id: i64, update: &IssueUpdate) -> Result<(), RedmineError> {
        let uploads = self.upload_all(&update.uploads)?;
        let body = IssueBody {
            issue: IssueFields {
                project_id: None,
                subject: None,
                description: None,
                tracker_id: update.tracker_id,
                status_id: update.status_id,
                priority_id: update.priority_id,
                start_date: None,
                due_date: None,
                notes: update.notes.as_deref(),
                uploads,
            },
        };
        self.request_count += 1;
        let response = self
            .client
            .put(self.endpoint(&format!("issues/{issue_id}.json")))
            .header("X-Redmine-API-Key", self.config.api_key.clone())
            .json(&body)
            .send()
            .map_err(|error| RedmineError::Transport(error.to_string()))?;
        check_response(response)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Map a non-success response to the matching error kind; 422 carries the
/// server's own error strings so the caller can log what was rejected.
fn check_response(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, RedmineError> {
    let status = response.status();
    if status.as_u16() == 422 {
        let detail = read_validation_errors(response);
        return Err(RedmineError::Validation(detail));
    }
    if !status.is_success() {
        return Err(RedmineError::Status(status.as_u16()));
    }
    Ok(response)
}

fn read_validation_errors(response: reqwest::blocking::Response) -> String {
    let text = response.text().unwrap_or_default();
    if let Ok(payload) = serde_json::from_str::<ValidationErrors>(&text)
        && !payload.errors.is_empty()
    {
        return payload.errors.join("; ");
    }
    if text.trim().is_empty() {
        "validation failed".to_string()
    } else {
        text
    }
}

#[derive(Debug, Serialize)]
struct UploadToken {
    token: String,
    filename: String,
}

#[derive(Debug, Serialize)]
struct WikiPageBody<'a> {
    wiki_page: WikiPageFields<'a>,
}

#[derive(Debug, Serialize)]
struct WikiPageFields<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_title: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    uploads: Vec<UploadToken>,
}

#[derive(Debug, Serialize)]
struct IssueBody<'a> {
    issue: IssueFields<'a>,
}

#[derive(Debug, Serialize)]
struct IssueFields<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    tracker_id: i64,
    status_id: i64,
    priority_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    uploads: Vec<UploadToken>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload: UploadPayload,
}

#[derive(Debug, Deserialize)]
struct UploadPayload {
    token: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    issue: IssueIdPayload,
}

#[derive(Debug, Deserialize)]
struct IssueIdPayload {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ProjectsResponse {
    projects: Vec<Project>,
    total_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ValidationErrors {
    #[serde(default)]
    errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiki_page_body_omits_empty_optional_fields() {
        let body = WikiPageBody {
            wiki_page: WikiPageFields {
                text: "h1. Home\n\n",
                parent_title: None,
                uploads: Vec::new(),
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["wiki_page"]["text"], "h1. Home\n\n");
        assert!(value["wiki_page"].get("parent_title").is_none());
        assert!(value["wiki_page"].get("uploads").is_none());
    }

    #[test]
    fn wiki_page_body_carries_upload_tokens() {
        let body = WikiPageBody {
            wiki_page: WikiPageFields {
                text: "!1_2.png!",
                parent_title: Some("Parent"),
                uploads: vec![UploadToken {
                    token: "9.abcdef".to_string(),
                    filename: "1_2.png".to_string(),
                }],
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["wiki_page"]["parent_title"], "Parent");
        assert_eq!(value["wiki_page"]["uploads"][0]["token"], "9.abcdef");
        assert_eq!(value["wiki_page"]["uploads"][0]["filename"], "1_2.png");
    }

    #[test]
    fn issue_update_body_keeps_only_update_fields() {
        let body = IssueBody {
            issue: IssueFields {
                project_id: None,
                subject: None,
                description: None,
                tracker_id: 2,
                status_id: 1,
                priority_id: 4,
                start_date: None,
                due_date: None,
                notes: Some("a comment"),
                uploads: Vec::new(),
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["issue"]["notes"], "a comment");
        assert_eq!(value["issue"]["tracker_id"], 2);
        assert!(value["issue"].get("subject").is_none());
        assert!(value["issue"].get("project_id").is_none());
    }

    #[test]
    fn upload_response_decodes_token() {
        let payload: UploadResponse =
            serde_json::from_str(r#"{"upload": {"token": "7.ed1ccdb0"}}"#).expect("decode");
        assert_eq!(payload.upload.token, "7.ed1ccdb0");
    }

    #[test]
    fn validation_errors_join_server_messages() {
        let payload: ValidationErrors = serde_json::from_str(
            r#"{"errors": ["Title has already been taken", "Text cannot be blank"]}"#,
        )
        .expect("decode");
        assert_eq!(payload.errors.len(), 2);
    }
}
