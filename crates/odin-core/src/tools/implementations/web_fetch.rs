//! WebFetch tool - fetch a URL, convert HTML to markdown, and let a cheap
//! model extract what the prompt asks for.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolResponse};

/// HTML beyond this is truncated before conversion.
const MAX_CONTENT_LENGTH: usize = 500_000;

pub struct WebFetchTool;

#[derive(Deserialize)]
struct Params {
    url: String,
    prompt: String,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL, convert HTML to markdown, and run an extraction prompt over the content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "prompt": {
                    "type": "string",
                    "description": "What to extract or answer from the page"
                }
            },
            "required": ["url", "prompt"],
            "additionalProperties": false
        })
    }

    async fn pre_hook(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input.clone())?;
        if !params.url.starts_with("http://") && !params.url.starts_with("https://") {
            return Err(ToolError::Validation(format!(
                "url must be http(s), got '{}'",
                params.url
            )));
        }
        Ok(input)
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let params: Params = parse_params(input)?;

        let response = reqwest::get(&params.url)
            .await
            .map_err(|e| ToolError::Other(anyhow::anyhow!("fetch failed: {}", e)))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Other(anyhow::anyhow!("reading body failed: {}", e)))?;

        let (content, title) = if content_type.contains("html") || looks_like_html(&body) {
            let truncated = truncate_utf8(&body, MAX_CONTENT_LENGTH);
            (html_to_markdown(truncated), extract_title(truncated))
        } else {
            (truncate_utf8(&body, MAX_CONTENT_LENGTH).to_string(), String::new())
        };

        let extraction_prompt = format!(
            "Page content from {url}:\n\n{content}\n\n---\n{prompt}",
            url = params.url,
            content = content,
            prompt = params.prompt,
        );
        let extracted = ctx
            .services
            .small_model
            .complete(&extraction_prompt)
            .await
            .map_err(ToolError::Other)?;

        Ok(json!({
            "url": params.url,
            "status": status,
            "title": title,
            "output": extracted,
        }))
    }

    async fn post_hook(&self, raw: Value, _ctx: &ToolContext) -> Result<ToolResponse, ToolError> {
        let url = raw["url"].as_str().unwrap_or("").to_string();
        Ok(ToolResponse::new(raw, format!("fetched {}", url)))
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().get(..256).unwrap_or(body.trim_start());
    let lower = head.to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html")
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let boundary = crate::tools::truncation::floor_char_boundary(text, max);
    &text[..boundary]
}

fn html_to_markdown(html: &str) -> String {
    let markdown = html2text::from_read(html.as_bytes(), 100);
    // Collapse runs of blank lines left over from layout markup.
    let mut out = String::with_capacity(markdown.len());
    let mut blank_run = 0usize;
    for line in markdown.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn extract_title(html: &str) -> String {
    let document = Html::parse_document(html);
    Selector::parse("title")
        .ok()
        .and_then(|s| {
            document
                .select(&s)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        })
        .unwrap_or_default()
}
