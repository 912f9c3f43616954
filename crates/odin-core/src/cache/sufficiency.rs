//! LLM-delegated cache sufficiency check.
//!
//! Exact string matching is brittle against trailing whitespace,
//! near-duplicates, and partial segments with too little surrounding
//! context, so the verdict on "is the cached content enough to apply this
//! edit" is delegated to a cheap model. The validator is advisory only;
//! the cache never rewrites files itself.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::FileCache;
use crate::error::{SuggestedRange, ToolError};

/// Request sent to the `cache-sufficiency-validator` model.
#[derive(Debug, Clone, Serialize)]
pub struct SufficiencyRequest {
    pub file_path: String,
    /// "full" or "partial".
    pub cache_type: String,
    /// Range keys present when the cache is partial.
    pub segment_keys: Vec<String>,
    pub old_string: String,
    pub new_string: String,
    pub cached_content: String,
}

/// Validator response, JSON per the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SufficiencyVerdict {
    pub is_sufficient: bool,
    pub explanation: String,
    #[serde(default)]
    pub suggested_line_ranges: Vec<SuggestedRange>,
}

impl SufficiencyVerdict {
    pub fn sufficient() -> Self {
        Self {
            is_sufficient: true,
            explanation: String::new(),
            suggested_line_ranges: Vec::new(),
        }
    }
}

/// Decides whether cached content carries enough context for a proposed edit.
#[async_trait]
pub trait SufficiencyValidator: Send + Sync {
    async fn validate(&self, request: &SufficiencyRequest) -> anyhow::Result<SufficiencyVerdict>;
}

/// Production validator backed by a cheap model endpoint.
pub struct HttpSufficiencyValidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSufficiencyValidator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn build_prompt(request: &SufficiencyRequest) -> String {
        let cache_desc = if request.cache_type == "full" {
            "full file content".to_string()
        } else {
            format!(
                "partial content, cached line ranges: {}",
                request.segment_keys.join(", ")
            )
        };

        format!(
            "You are a cache sufficiency validator for a code editing agent.\n\
             Decide whether the cached content below carries enough context to\n\
             locate and apply the proposed replacement unambiguously.\n\n\
             File: {path}\n\
             Cache type: {cache}\n\n\
             Replace this:\n```\n{old}\n```\n\
             With this:\n```\n{new}\n```\n\n\
             Cached content:\n```\n{content}\n```\n\n\
             Respond with JSON only:\n\
             {{\"is_sufficient\": bool, \"explanation\": string,\n  \
             \"suggested_line_ranges\": [{{\"start_line\": int, \"end_line\": int, \"reason\": string}}]}}",
            path = request.file_path,
            cache = cache_desc,
            old = request.old_string,
            new = request.new_string,
            content = request.cached_content,
        )
    }
}

#[async_trait]
impl SufficiencyValidator for HttpSufficiencyValidator {
    async fn validate(&self, request: &SufficiencyRequest) -> anyhow::Result<SufficiencyVerdict> {
        let body = serde_json::json!({
            "model": "cache-sufficiency-validator",
            "prompt": Self::build_prompt(request),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let verdict: SufficiencyVerdict = response.json().await?;
        Ok(verdict)
    }
}

/// Run the full check for an edit against `path`.
///
/// 1. Miss entirely → insufficient, "must read file first".
/// 2. Gather candidate content (full, or segments with range headers).
/// 3. Ask the validator.
/// 4. Return its verdict as a `ToolError` when insufficient.
pub async fn check_sufficiency(
    cache: &FileCache,
    validator: &dyn SufficiencyValidator,
    path: &Path,
    old_string: &str,
    new_string: &str,
) -> Result<(), ToolError> {
    let view = match cache.get(path) {
        Some(v) => v,
        None => {
            return Err(ToolError::CacheInsufficient {
                explanation: "must read file first".to_string(),
                suggested_ranges: Vec::new(),
            })
        }
    };

    let cached_content = match cache.gather_candidate(path) {
        Some(c) => c,
        None => {
            return Err(ToolError::CacheInsufficient {
                explanation: "must read file first".to_string(),
                suggested_ranges: Vec::new(),
            })
        }
    };

    let request = SufficiencyRequest {
        file_path: path.display().to_string(),
        cache_type: if view.is_partial { "partial" } else { "full" }.to_string(),
        segment_keys: view.segments.iter().map(|s| s.key()).collect(),
        old_string: old_string.to_string(),
        new_string: new_string.to_string(),
        cached_content,
    };

    let verdict = validator
        .validate(&request)
        .await
        .map_err(ToolError::Other)?;

    if verdict.is_sufficient {
        Ok(())
    } else {
        Err(ToolError::CacheInsufficient {
            explanation: verdict.explanation,
            suggested_ranges: verdict.suggested_line_ranges,
        })
    }
}

/// Validator that approves whenever the exact `old_string` is present in the
/// candidate content. Used by tests and as an offline fallback.
pub struct ExactMatchValidator;

#[async_trait]
impl SufficiencyValidator for ExactMatchValidator {
    async fn validate(&self, request: &SufficiencyRequest) -> anyhow::Result<SufficiencyVerdict> {
        if request.cached_content.contains(&request.old_string) {
            Ok(SufficiencyVerdict::sufficient())
        } else {
            Ok(SufficiencyVerdict {
                is_sufficient: false,
                explanation: "old_string not present in cached content".to_string(),
                suggested_line_ranges: Vec::new(),
            })
        }
    }
}
