//! Classifier response parsing
//!
//! Turns free-form generated text into typed verdicts and report sections.
//! The parser never fails: text it cannot interpret yields the conservative
//! benign verdict, and the raw text is always kept for auditing.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detection::Label;

/// Which fast-parse strategy produced the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    /// `0`, `1` or `label|type`
    Exact,
    /// A leading `0`/`1` followed by free text
    Prefix,
    /// Vocabulary heuristics over the whole text
    Keyword,
    /// Nothing recognizable; benign
    Default,
}

impl fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Keyword => "keyword",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

/// Parsed terse verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastVerdict {
    pub predicted: Label,
    pub attack_type: String,
    pub strategy: ParseStrategy,
    pub raw: String,
}

/// Sections of a structured threat report; missing sections are empty
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSections {
    pub attack_type: String,
    pub summary: String,
    pub behavior: String,
    pub cause: String,
    pub evidence: String,
    pub risk: String,
    pub recommendation: String,
}

impl ReportSections {
    fn slot(&mut self, key: SectionKey) -> &mut String {
        match key {
            SectionKey::AttackType => &mut self.attack_type,
            SectionKey::Summary => &mut self.summary,
            SectionKey::Behavior => &mut self.behavior,
            SectionKey::Cause => &mut self.cause,
            SectionKey::Evidence => &mut self.evidence,
            SectionKey::Risk => &mut self.risk,
            SectionKey::Recommendation => &mut self.recommendation,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKey {
    AttackType,
    Summary,
    Behavior,
    Cause,
    Evidence,
    Risk,
    Recommendation,
}

/// Heading titles accepted for each section, English and Chinese
const SECTION_TITLES: &[(SectionKey, &[&str])] = &[
    (SectionKey::AttackType, &["attack type", "attack_type", "type", "攻击类型"]),
    (SectionKey::Summary, &["summary", "brief summary", "overview", "简要概述", "概述"]),
    (SectionKey::Behavior, &["behavior", "behaviour", "behavior description", "行为描述"]),
    (SectionKey::Cause, &["cause", "cause analysis", "root cause", "成因分析"]),
    (SectionKey::Evidence, &["evidence", "basis", "judgment basis", "判定依据"]),
    (SectionKey::Risk, &["risk", "risk assessment", "风险评估"]),
    (SectionKey::Recommendation, &["recommendation", "recommendations", "mitigation", "防护建议"]),
];

/// Attack-type vocabulary, most specific first
const ATTACK_TYPE_TOKENS: &[(&str, &[&str])] = &[
    ("sql_injection", &["sql_injection", "sql injection", "sqli", "union select", "sql注入"]),
    ("xss", &["xss", "cross-site scripting", "cross site scripting", "跨站脚本"]),
    ("command_injection", &["command_injection", "command injection", "command execution", "rce", "命令注入", "命令执行"]),
    ("path_traversal", &["path_traversal", "path traversal", "directory traversal", "路径遍历", "目录遍历"]),
    ("file_inclusion", &["file_inclusion", "file inclusion", "lfi", "rfi", "文件包含"]),
    ("ssrf", &["ssrf", "server-side request forgery", "服务端请求伪造"]),
    ("xxe", &["xxe", "xml external entity"]),
];

const NEGATED_ATTACK: &[&str] = &[
    "not malicious", "no malicious", "not an attack", "no attack", "not attack",
    "no sign of attack", "no signs of attack",
    "不是恶意", "非恶意", "没有攻击", "无攻击", "不存在攻击", "未发现攻击",
];

const ATTACK_WORDS: &[&str] = &[
    "malicious", "attack", "injection", "exploit", "abnormal", "anomalous", "unsafe", "not safe",
    "恶意", "攻击", "注入", "异常", "不正常", "不安全",
];

const BENIGN_WORDS: &[&str] = &[
    "normal", "benign", "safe", "legitimate", "harmless",
    "正常", "安全", "合法", "无害",
];

/// ASCII tokens match on word boundaries; CJK tokens match as substrings
fn token_regex(token: &str) -> Regex {
    let escaped = regex::escape(token).replace(' ', r"\s+");
    let pattern = if token.is_ascii() {
        format!(r"\b{}\b", escaped)
    } else {
        escaped
    };
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .expect("escaped token pattern")
}

fn compile_all(tokens: &[&str]) -> Vec<Regex> {
    tokens.iter().map(|t| token_regex(t)).collect()
}

static NEGATED_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(NEGATED_ATTACK));
static ATTACK_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(ATTACK_WORDS));
static BENIGN_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_all(BENIGN_WORDS));
static TYPE_RE: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    ATTACK_TYPE_TOKENS
        .iter()
        .map(|(canonical, tokens)| (*canonical, compile_all(tokens)))
        .collect()
});

static EXACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01])\s*\|\s*([^|\r\n]*?)\s*$").expect("exact verdict pattern"));

/// Heading line: markdown `#`..`######`, optionally numbered or bolded
static HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*#{1,6}\s*(?:\d+[.、)]\s*)?\**\s*(.*?)\s*\**\s*[:：]?\s*$").expect("heading pattern")
});

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

/// Strip markdown and quoting wrappers models like to emit around a verdict
fn unwrap_verdict(text: &str) -> &str {
    text.trim()
        .trim_start_matches(|c: char| matches!(c, '`' | '*' | '"' | '\'' | '[' | '(') || c.is_whitespace())
}

/// Classifier response parser
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser;

impl ResponseParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a terse verdict response
    pub fn parse_fast(&self, text: &str) -> FastVerdict {
        let verdict = |predicted: Label, attack_type: String, strategy: ParseStrategy| FastVerdict {
            predicted,
            attack_type,
            strategy,
            raw: text.to_string(),
        };

        let body = unwrap_verdict(text);
        let first_line = body.lines().next().unwrap_or("").trim();

        // (a) exact
        if body == "0" || body == "1" {
            let label = Label::from_flag(body == "1");
            return verdict(label, default_type(label), ParseStrategy::Exact);
        }
        if let Some(caps) = EXACT_RE.captures(first_line) {
            let label = Label::from_flag(&caps[1] == "1");
            let attack_type = match label {
                Label::Benign => "none".to_string(),
                Label::Malicious => {
                    let raw_type = caps[2].trim_end_matches(|c: char| matches!(c, '`' | '*' | '.' | '。'));
                    if raw_type.is_empty() {
                        "unknown".to_string()
                    } else {
                        raw_type.to_string()
                    }
                }
            };
            return verdict(label, attack_type, ParseStrategy::Exact);
        }

        // (b) leading digit followed by free text
        let mut chars = body.chars();
        if let Some(lead @ ('0' | '1')) = chars.next() {
            let rest = chars.as_str();
            if !rest.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
                let label = Label::from_flag(lead == '1');
                let attack_type = match label {
                    Label::Benign => "none".to_string(),
                    Label::Malicious => self.extract_type(rest).unwrap_or_else(|| "unknown".to_string()),
                };
                return verdict(label, attack_type, ParseStrategy::Prefix);
            }
        }

        // (c) keyword heuristics
        if any_match(&NEGATED_RE, text) {
            return verdict(Label::Benign, "none".to_string(), ParseStrategy::Keyword);
        }
        if any_match(&ATTACK_RE, text) {
            let attack_type = self.extract_type(text).unwrap_or_else(|| "unknown".to_string());
            return verdict(Label::Malicious, attack_type, ParseStrategy::Keyword);
        }
        if any_match(&BENIGN_RE, text) {
            return verdict(Label::Benign, "none".to_string(), ParseStrategy::Keyword);
        }
        if let Some(attack_type) = self.extract_type(text) {
            return verdict(Label::Malicious, attack_type, ParseStrategy::Keyword);
        }

        // (d)
        verdict(Label::Benign, "none".to_string(), ParseStrategy::Default)
    }

    /// First attack-type token found in the text, canonicalized
    pub fn extract_type(&self, text: &str) -> Option<String> {
        TYPE_RE
            .iter()
            .find(|(_, patterns)| any_match(patterns, text))
            .map(|(canonical, _)| canonical.to_string())
    }

    /// Parse a structured report. Each section runs from its heading to the
    /// next heading or the end of the text; the first occurrence wins.
    pub fn parse_deep(&self, text: &str) -> ReportSections {
        let mut sections = ReportSections::default();
        let mut filled: Vec<SectionKey> = Vec::new();
        let mut current: Option<SectionKey> = None;
        let mut buffer: Vec<&str> = Vec::new();

        for line in text.lines() {
            match heading_title(line) {
                Some(title) => {
                    flush_section(current, &mut buffer, &mut sections, &mut filled);
                    current = section_for(&title);
                }
                None => buffer.push(line),
            }
        }
        flush_section(current, &mut buffer, &mut sections, &mut filled);

        sections
    }
}

fn flush_section(
    key: Option<SectionKey>,
    buffer: &mut Vec<&str>,
    sections: &mut ReportSections,
    filled: &mut Vec<SectionKey>,
) {
    if let Some(key) = key {
        if !filled.contains(&key) {
            *sections.slot(key) = buffer.join("\n").trim().to_string();
            filled.push(key);
        }
    }
    buffer.clear();
}

fn default_type(label: Label) -> String {
    match label {
        Label::Benign => "none".to_string(),
        Label::Malicious => "unknown".to_string(),
    }
}

fn heading_title(line: &str) -> Option<String> {
    HEADING_RE
        .captures(line)
        .map(|caps| caps[1].trim_matches(|c: char| c == '*' || c.is_whitespace()).to_lowercase())
}

fn section_for(title: &str) -> Option<SectionKey> {
    SECTION_TITLES
        .iter()
        .find(|(_, titles)| titles.iter().any(|t| *t == title))
        .map(|(key, _)| *key)
}
