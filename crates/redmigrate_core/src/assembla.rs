use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{
    DEFAULT_ASSEMBLA_BASE_URL, DEFAULT_MAX_ATTEMPTS, DEFAULT_PER_PAGE, DEFAULT_TIMEOUT_MS,
    MigrationConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Space {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiPage {
    pub id: String,
    pub page_name: String,
    pub parent_id: Option<String>,
    pub contents: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub number: i64,
    pub summary: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: i64,
    pub created_on: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketComment {
    pub comment: Option<String>,
    pub created_on: Option<String>,
}

/// Raw bytes plus HTTP status from the document-download endpoint. The
/// bounded-retry fetch returns `None` when the transport never produced a
/// response; callers treat that the same as a non-success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPayload {
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl DownloadPayload {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait AssemblaApi {
    fn spaces(&mut self) -> Result<Vec<Space>>;
    /// Id of the configured space, resolved by name and cached.
    fn space_id(&mut self) -> Result<String>;
    fn wiki_pages(&mut self) -> Result<Vec<WikiPage>>;
    fn tickets(&mut self) -> Result<Vec<Ticket>>;
    fn ticket_comments(&mut self, ticket_number: i64) -> Result<Vec<TicketComment>>;
    fn download_document(&mut self, space_id: &str, document_id: &str) -> Option<DownloadPayload>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct AssemblaClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub space: String,
    pub per_page: usize,
    pub max_attempts: usize,
    pub timeout_ms: u64,
}

impl AssemblaClientConfig {
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.assembla_base_url(),
            api_key: config.assembla_api_key()?,
            api_secret: config.assembla_api_secret()?,
            space: config.assembla_space()?,
            per_page: config.assembla.per_page.unwrap_or(DEFAULT_PER_PAGE),
            max_attempts: config.assembla.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            timeout_ms: config.assembla.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        })
    }
}

impl Default for AssemblaClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ASSEMBLA_BASE_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            space: String::new(),
            per_page: DEFAULT_PER_PAGE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

pub struct AssemblaClient {
    client: Client,
    config: AssemblaClientConfig,
    space_id: Option<String>,
    request_count: usize,
}

impl AssemblaClient {
    pub fn new(config: AssemblaClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Assembla HTTP client")?;
        Ok(Self {
            client,
            config,
            space_id: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// The fixed bounded-retry fetch: up to `max_attempts` tries, no backoff,
    /// transport errors consumed and retried. A response with a non-success
    /// status is still a response and is returned as-is; exhausting the
    /// attempts yields `None`.
    fn get_with_retries(
        &mut self,
        url: &str,
        query: &[(&str, String)],
    ) -> Option<reqwest::blocking::Response> {
        let mut attempt = 0;
        while attempt < self.config.max_attempts {
            self.request_count += 1;
            let response = self
                .client
                .get(url)
                .header("X-Api-Key", self.config.api_key.clone())
                .header("X-Api-Secret", self.config.api_secret.clone())
                .query(query)
                .send();
            match response {
                Ok(response) => return Some(response),
                Err(_) => attempt += 1,
            }
        }
        None
    }

    fn get_json(&mut self, url: &str, query: &[(&str, String)]) -> Result<Option<Value>> {
        let response = match self.get_with_retries(url, query) {
            Some(response) => response,
            None => bail!(
                "no response from {url} after {} attempts",
                self.config.max_attempts
            ),
        };
        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("Assembla API request failed with HTTP {status} for {url}");
        }
        let text = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let payload: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to decode Assembla JSON response from {url}"))?;
        Ok(Some(payload))
    }

    /// Walk a paginated listing endpoint until a short or empty page.
    fn list_paginated<T: serde::de::DeserializeOwned>(
        &mut self,
        path: &str,
        extra: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let url = self.endpoint(path);
        let per_page = self.config.per_page.max(1);
        let mut output = Vec::new();
        let mut page = 1usize;
        loop {
            let mut query = vec![
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ];
            query.extend(extra.iter().map(|(key, value)| (*key, value.clone())));

            let payload = match self.get_json(&url, &query)? {
                Some(payload) => payload,
                None => break,
            };
            let items: Vec<T> = serde_json::from_value(payload)
                .with_context(|| format!("failed to decode listing from {path}"))?;
            let count = items.len();
            output.extend(items);
            if count < per_page {
                break;
            }
            page += 1;
        }
        Ok(output)
    }
}

impl AssemblaApi for AssemblaClient {
    fn spaces(&mut self) -> Result<Vec<Space>> {
        let url = self.endpoint("spaces.json");
        let payload = match self.get_json(&url, &[])? {
            Some(payload) => payload,
            None => return Ok(Vec::new()),
        };
        serde_json::from_value(payload).context("failed to decode spaces listing")
    }

    fn space_id(&mut self) -> Result<String> {
        if let Some(id) = &self.space_id {
            return Ok(id.clone());
        }
        let wanted = self.config.space.clone();
        let spaces = self.spaces()?;
        let space = spaces
            .into_iter()
            .find(|space| space.name == wanted)
            .ok_or_else(|| anyhow::anyhow!("no Assembla space named {wanted:?} is visible"))?;
        self.space_id = Some(space.id.clone());
        Ok(space.id)
    }

    fn wiki_pages(&mut self) -> Result<Vec<WikiPage>> {
        let space_id = self.space_id()?;
        self.list_paginated(&format!("spaces/{space_id}/wiki_pages.json"), &[])
    }

    fn tickets(&mut self) -> Result<Vec<Ticket>> {
        let space_id = self.space_id()?;
        // report=0 selects all tickets rather than the default active view
        self.list_paginated(
            &format!("spaces/{space_id}/tickets.json"),
            &[("report", "0".to_string())],
        )
    }

    fn ticket_comments(&mut self, ticket_number: i64) -> Result<Vec<TicketComment>> {
        let space_id = self.space_id()?;
        self.list_paginated(
            &format!("spaces/{space_id}/tickets/{ticket_number}/ticket_comments.json"),
            &[],
        )
    }

    fn download_document(&mut self, space_id: &str, document_id: &str) -> Option<DownloadPayload> {
        let url = self.endpoint(&format!("spaces/{space_id}/documents/{document_id}/download"));
        let response = self.get_with_retries(&url, &[])?;
        let status = response.status().as_u16();
        let bytes = response.bytes().ok()?.to_vec();
        Some(DownloadPayload { status, bytes })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_payload_success_covers_2xx_only() {
        let ok = DownloadPayload {
            status: 200,
            bytes: vec![1],
        };
        let redirect = DownloadPayload {
            status: 302,
            bytes: Vec::new(),
        };
        let missing = DownloadPayload {
            status: 404,
            bytes: Vec::new(),
        };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
        assert!(!missing.is_success());
    }

    #[test]
    fn wiki_page_decodes_with_null_fields() {
        let page: WikiPage = serde_json::from_str(
            r#"{"id": "abc", "page_name": "Home", "parent_id": null, "contents": null}"#,
        )
        .expect("decode wiki page");
        assert_eq!(page.page_name, "Home");
        assert!(page.parent_id.is_none());
        assert!(page.contents.is_none());
    }

    #[test]
    fn ticket_decodes_source_fields() {
        let ticket: Ticket = serde_json::from_str(
            r#"{
                "id": 901,
                "number": 17,
                "summary": "Crash on save",
                "description": "steps",
                "status": "New",
                "priority": 3,
                "created_on": "2020-01-05T10:00:00Z",
                "due_date": null
            }"#,
        )
        .expect("decode ticket");
        assert_eq!(ticket.number, 17);
        assert_eq!(ticket.status.as_deref(), Some("New"));
        assert_eq!(ticket.priority, 3);
        assert!(ticket.due_date.is_none());
    }

    #[test]
    fn client_config_defaults_match_contract() {
        let config = AssemblaClientConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.per_page, 10);
        assert_eq!(config.base_url, "https://api.assembla.com/v1");
    }
}
