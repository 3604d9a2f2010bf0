//! Classifier contract, prompt templates and the HTTP chat-completion client

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

use crate::detection::config::{DeepAnalysisConfig, FastDetectionConfig, ModelConfig};
use crate::detection::errors::{DetectionError, Result};
use crate::rag::{KnowledgeHit, RetrievedCase};

/// A two-part chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Decoding budget for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
}

impl From<&FastDetectionConfig> for GenerationParams {
    fn from(config: &FastDetectionConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
        }
    }
}

impl From<&DeepAnalysisConfig> for GenerationParams {
    fn from(config: &DeepAnalysisConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
        }
    }
}

/// Text generator used for both verdicts and reports.
///
/// Implementations are blocking and shared across worker threads.
pub trait Classifier: Send + Sync {
    fn generate(&self, prompt: &Prompt, params: &GenerationParams) -> Result<String>;

    fn name(&self) -> &str;
}

const FAST_SYSTEM: &str = "You are a web security analyst. Decide whether an HTTP request URL \
is benign or carries an attack payload. Attack indicators include SQL injection (quotes, \
comments, UNION/SELECT), cross-site scripting (<script>, javascript:, event handlers), command \
injection (|, ;, &&, shell commands), path traversal (../, /etc/passwd), file inclusion and \
encoding tricks. Plain static resources and ordinary business parameters are benign.";

const DEEP_SYSTEM: &str = "You are a senior web security analyst writing an incident report \
for a URL that was flagged as malicious. Be concrete and reference the payload.";

/// Section headings the deep template asks for, in order
pub const REPORT_HEADINGS: &[&str] = &[
    "Attack Type",
    "Summary",
    "Behavior",
    "Cause",
    "Evidence",
    "Risk",
    "Recommendation",
];

/// Builds the fast and deep prompts
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    /// Terse verdict prompt; answer must be `0` or `1|<attack_type>`
    pub fn fast(url: &str, cases: &[RetrievedCase], knowledge: &[KnowledgeHit]) -> Prompt {
        let mut user = String::new();
        push_context(&mut user, cases, knowledge);
        let _ = write!(
            user,
            "URL: {url}\n\n\
             Answer with exactly one line:\n\
             0 if the URL is benign\n\
             1|<attack_type> if it is malicious, e.g. 1|sql_injection\n\
             Do not explain."
        );
        Prompt {
            system: FAST_SYSTEM.to_string(),
            user,
        }
    }

    /// Structured report prompt seeded with the Stage-1 attack type
    pub fn deep(url: &str, attack_type: &str, cases: &[RetrievedCase], knowledge: &[KnowledgeHit]) -> Prompt {
        let mut user = String::new();
        push_context(&mut user, cases, knowledge);
        let _ = writeln!(user, "URL: {url}");
        let _ = writeln!(user, "Initial classification: {attack_type}\n");
        let _ = writeln!(user, "Write the report using exactly these markdown headings:");
        for heading in REPORT_HEADINGS {
            let _ = writeln!(user, "## {heading}");
        }
        Prompt {
            system: DEEP_SYSTEM.to_string(),
            user,
        }
    }
}

fn push_context(out: &mut String, cases: &[RetrievedCase], knowledge: &[KnowledgeHit]) {
    if !cases.is_empty() {
        let _ = writeln!(out, "Similar labeled requests:");
        for case in cases {
            let _ = writeln!(out, "- [{}] {} (similarity {:.2})", case.label, case.text, case.similarity);
        }
        out.push('\n');
    }
    if !knowledge.is_empty() {
        let _ = writeln!(out, "Reference knowledge:");
        for hit in knowledge {
            let _ = writeln!(out, "- {}: {}", hit.id, hit.text);
        }
        out.push('\n');
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
#[derive(Debug)]
pub struct HttpClassifier {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(endpoint: &str, model: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            model: model.into(),
            api_key: None,
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let mut classifier = Self::new(&config.endpoint, config.name.clone(), config.timeout_secs)?;
        if let Some(var) = &config.api_key_env {
            classifier.api_key = std::env::var(var).ok();
            if classifier.api_key.is_none() {
                debug!("{} is not set; calling {} without a bearer token", var, classifier.url);
            }
        }
        Ok(classifier)
    }
}

impl Classifier for HttpClassifier {
    fn generate(&self, prompt: &Prompt, params: &GenerationParams) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &prompt.system },
                ChatMessage { role: "user", content: &prompt.user },
            ],
            max_tokens: params.max_new_tokens,
            temperature: params.temperature,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(DetectionError::Classifier(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let reply: ChatResponse = response.json()?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| DetectionError::Classifier("response contained no choices".into()))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(label: &str) -> RetrievedCase {
        RetrievedCase {
            text: "/a?id=1' or 1=1".into(),
            label: label.into(),
            similarity: 0.82,
            position: 0,
            source: None,
        }
    }

    #[test]
    fn test_fast_prompt_demands_terse_format() {
        let prompt = PromptBuilder::fast("/index.html", &[], &[]);
        assert!(prompt.user.contains("URL: /index.html"));
        assert!(prompt.user.contains("1|<attack_type>"));
        assert!(!prompt.user.contains("Similar labeled requests"));
    }

    #[test]
    fn test_fast_prompt_with_context() {
        let knowledge = vec![KnowledgeHit {
            id: "SQLI".into(),
            text: "tautology injection".into(),
            source: None,
            similarity: 0.5,
        }];
        let prompt = PromptBuilder::fast("/b", &[case("attack")], &knowledge);
        assert!(prompt.user.contains("[attack] /a?id=1' or 1=1 (similarity 0.82)"));
        assert!(prompt.user.contains("- SQLI: tautology injection"));
    }

    #[test]
    fn test_deep_prompt_lists_headings() {
        let prompt = PromptBuilder::deep("/c", "xss", &[], &[]);
        assert!(prompt.user.contains("Initial classification: xss"));
        for heading in REPORT_HEADINGS {
            assert!(prompt.user.contains(&format!("## {heading}")));
        }
    }

    #[test]
    fn test_generation_params_from_config() {
        let params = GenerationParams::from(&DeepAnalysisConfig::default());
        assert_eq!(params.max_new_tokens, 1024);
        assert_eq!(params.temperature, 0.3);
    }

    #[test]
    fn test_http_classifier_url() {
        let classifier = HttpClassifier::new("http://localhost:8000/v1/", "m", 5).unwrap();
        assert_eq!(classifier.url, "http://localhost:8000/v1/chat/completions");
        assert_eq!(classifier.name(), "m");
    }
}
