use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

use crate::conversation::{ContentPart, Role, Turn, TurnContent};

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String,      // e.g. "https://openrouter.ai/api/v1"
    pub api_key: String,       // env AI_API_KEY
    pub reasoning_max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("AI_BASE_URL").unwrap_or_else(|_| "https://openrouter.ai/api/v1".into()),
            api_key: env::var("AI_API_KEY")
                .or_else(|_| env::var("OPENROUTER_API_KEY"))
                .unwrap_or_default(),
            reasoning_max_tokens: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutput {
    pub text: String,
    pub reasoning: Option<String>,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("AI_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub async fn chat(&self, transcript: &[Turn], model: &str) -> Result<ChatOutput> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let mut req = json!({
            "model": model,
            "messages": encode_messages(transcript),
        });
        if let Some(max_tokens) = self.cfg.reasoning_max_tokens {
            req["reasoning"] = json!({ "max_tokens": max_tokens });
        }

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model API error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse chat completion JSON")?;
        parse_output(&v)
    }
}

fn encode_messages(transcript: &[Turn]) -> Vec<Value> {
    transcript
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content = match &turn.content {
                TurnContent::Text(text) => Value::String(text.clone()),
                TurnContent::Parts(parts) => Value::Array(parts.iter().map(encode_part).collect()),
            };
            json!({ "role": role, "content": content })
        })
        .collect()
}

fn encode_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::Image { data_base64, mime_type } => json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", mime_type, data_base64) }
        }),
    }
}

fn parse_output(v: &Value) -> Result<ChatOutput> {
    if let Some(err) = v.get("error") {
        bail!("model API error: {}", err);
    }
    let message = v.pointer("/choices/0/message").context("missing choices[0].message")?;
    // Some providers return content as a list of text parts.
    let text = match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => bail!("missing message content"),
    };
    let reasoning = message
        .get("reasoning")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string());
    Ok(ChatOutput { text, reasoning })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_messages_maps_parts() {
        let transcript = vec![
            Turn { role: Role::System, content: TurnContent::Text("sys".into()) },
            Turn {
                role: Role::User,
                content: TurnContent::Parts(vec![
                    ContentPart::text("<user_instruction>go</user_instruction>"),
                    ContentPart::image("QUJD", "image/jpeg"),
                ]),
            },
        ];
        let messages = encode_messages(&transcript);
        assert_eq!(messages[0], json!({ "role": "system", "content": "sys" }));
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn test_parse_output_reads_text_and_reasoning() {
        let v = json!({
            "choices": [{ "message": { "role": "assistant", "content": "<thought>hi</thought>", "reasoning": "short" } }]
        });
        let out = parse_output(&v).expect("output");
        assert_eq!(out.text, "<thought>hi</thought>");
        assert_eq!(out.reasoning.as_deref(), Some("short"));
    }

    #[test]
    fn test_parse_output_joins_part_list() {
        let v = json!({
            "choices": [{ "message": { "content": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }] } }]
        });
        assert_eq!(parse_output(&v).expect("output").text, "ab");
    }

    #[test]
    fn test_parse_output_errors() {
        assert!(parse_output(&json!({ "error": { "message": "rate limited" } })).is_err());
        assert!(parse_output(&json!({ "choices": [] })).is_err());
        assert!(parse_output(&json!({ "choices": [{ "message": { "content": null } }] })).is_err());
    }

    #[test]
    fn test_new_requires_key() {
        let cfg = LlmConfig { api_key: String::new(), ..LlmConfig::default() };
        assert!(LlmClient::new(cfg).is_err());
    }
}
