//! Per-type task payloads.
//!
//! The payload is a tagged union keyed by `TaskType`: each variant has its own
//! shape and validator, invoked once at creation time. Workers can match on
//! the variant instead of re-parsing an untyped blob.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::task_type::TaskType;

/// Serialized adjacently tagged: `{"type": "CRAWL", "payload": {"url": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPayload {
    Crawl(CrawlPayload),
    ParseDocument(ParseDocumentPayload),
    GenerateSummary(GenerateSummaryPayload),
    IndexPage(IndexPagePayload),
}

/// Fetch a URL and discover linked records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlPayload {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,

    /// Free-form label of the crawl source (e.g. a journal site).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Html,
    Xml,
}

/// Extract text and metadata from a fetched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseDocumentPayload {
    pub document_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<DocumentFormat>,
}

/// Ask the generation service for a text summary of a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSummaryPayload {
    pub paper_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_words: Option<u32>,
}

/// Push a page into the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexPagePayload {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_id: Option<String>,
}

const MAX_CRAWL_DEPTH: u32 = 10;
const MAX_SUMMARY_WORDS: u32 = 5_000;

impl TaskPayload {
    /// Decode and validate a raw payload for `task_type`.
    pub fn parse(task_type: TaskType, value: serde_json::Value) -> Result<Self, ValidationError> {
        if value.is_null() {
            return Err(ValidationError::new("payload is required"));
        }
        if !value.is_object() {
            return Err(ValidationError::new("payload must be a JSON object"));
        }

        let payload = match task_type {
            TaskType::Crawl => TaskPayload::Crawl(decode(task_type, value)?),
            TaskType::ParseDocument => TaskPayload::ParseDocument(decode(task_type, value)?),
            TaskType::GenerateSummary => TaskPayload::GenerateSummary(decode(task_type, value)?),
            TaskType::IndexPage => TaskPayload::IndexPage(decode(task_type, value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Crawl(_) => TaskType::Crawl,
            TaskPayload::ParseDocument(_) => TaskType::ParseDocument,
            TaskPayload::GenerateSummary(_) => TaskType::GenerateSummary,
            TaskPayload::IndexPage(_) => TaskType::IndexPage,
        }
    }

    /// The untagged body, as stored next to the `task_type` column.
    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            TaskPayload::Crawl(p) => serde_json::to_value(p),
            TaskPayload::ParseDocument(p) => serde_json::to_value(p),
            TaskPayload::GenerateSummary(p) => serde_json::to_value(p),
            TaskPayload::IndexPage(p) => serde_json::to_value(p),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            TaskPayload::Crawl(p) => {
                require_http_url("url", &p.url)?;
                if let Some(depth) = p.max_depth
                    && depth > MAX_CRAWL_DEPTH
                {
                    return Err(ValidationError::new(format!(
                        "maxDepth must be at most {MAX_CRAWL_DEPTH}"
                    )));
                }
                Ok(())
            }
            TaskPayload::ParseDocument(p) => {
                require_http_url("documentUrl", &p.document_url)?;
                require_non_blank_opt("paperId", p.paper_id.as_deref())
            }
            TaskPayload::GenerateSummary(p) => {
                require_non_blank("paperId", &p.paper_id)?;
                match p.max_words {
                    Some(0) => Err(ValidationError::new("maxWords must be positive")),
                    Some(n) if n > MAX_SUMMARY_WORDS => Err(ValidationError::new(format!(
                        "maxWords must be at most {MAX_SUMMARY_WORDS}"
                    ))),
                    _ => Ok(()),
                }
            }
            TaskPayload::IndexPage(p) => {
                require_http_url("url", &p.url)?;
                require_non_blank_opt("paperId", p.paper_id.as_deref())
            }
        }
    }
}

fn decode<T: DeserializeOwned>(
    task_type: TaskType,
    value: serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(value)
        .map_err(|e| ValidationError::new(format!("invalid {task_type} payload: {e}")))
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_non_blank_opt(field: &str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(v) => require_non_blank(field, v),
        None => Ok(()),
    }
}

fn require_http_url(field: &str, value: &str) -> Result<(), ValidationError> {
    require_non_blank(field, value)?;
    let rest = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(ValidationError::new(format!(
            "{field} must be an http(s) URL"
        ))),
    }
}
