//! Follow-up needs declared by workers.
//!
//! A worker ends its output with either a structured declaration
//!
//! ```json
//! { "additional_needs": [{ "target": "Worker_Web", "request": "verify sources" }] }
//! ```
//!
//! or a textual block
//!
//! ```text
//! Additional Needs:
//! - [Worker_Web] verify sources
//! ```
//!
//! `Additional Needs: none` declares that nothing else is required. The parser
//! never fails: anything it cannot use is reported as an anomaly and dropped.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a request text, in characters.
pub const MAX_NEED_TEXT_LEN: usize = 300;
/// Maximum number of needs taken from one output.
pub const MAX_NEEDS_PER_OUTPUT: usize = 12;

const NEEDS_FIELD: &str = "additional_needs";
const NEEDS_HEADER: &str = "additional needs";
const NO_NEEDS_SENTINELS: &[&str] = &["none", "n/a", "no", "null"];

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fence regex"));
static TARGETED_NEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\[\]]{1,80})\]\s*(.+)$").expect("valid need regex"));
static SECTION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9 _/-]{0,40}:$").expect("valid heading regex"));
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*]\s*|\d+\.\s*)").expect("valid marker regex"));

/// Lifecycle of a need.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NeedStatus {
    Open,
    Resolved,
    Expired,
}

/// A request one worker raised for another worker (or the coordinator).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Need {
    pub target_worker: String,
    pub request_text: String,
    pub origin_step_id: u64,
    pub status: NeedStatus,
    /// Step synthesized to answer this need
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_by: Option<u64>,
}

impl Need {
    pub fn new(target: impl Into<String>, request: impl Into<String>, origin_step_id: u64) -> Self {
        Self {
            target_worker: target.into(),
            request_text: request.into(),
            origin_step_id,
            status: NeedStatus::Open,
            answered_by: None,
        }
    }

    /// Identity used for deduplication: target and request, case-insensitive.
    pub fn key(&self) -> String {
        need_key(&self.target_worker, &self.request_text)
    }

    pub fn is_open(&self) -> bool {
        self.status == NeedStatus::Open
    }
}

pub fn need_key(target: &str, request: &str) -> String {
    format!(
        "{}|{}",
        target.trim().to_lowercase(),
        request.trim().to_lowercase()
    )
}

/// Which encoding a declaration used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NeedsFormat {
    Structured,
    Textual,
    /// No declaration found
    Absent,
}

/// Something the parser could not use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseAnomaly {
    pub reason: String,
    #[serde(default)]
    pub fragment: String,
}

impl ParseAnomaly {
    fn new(reason: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            fragment: truncate(&fragment.into(), 200),
        }
    }
}

/// Result of parsing one worker output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNeeds {
    pub needs: Vec<Need>,
    pub format: NeedsFormat,
    pub anomalies: Vec<ParseAnomaly>,
}

impl ParsedNeeds {
    fn empty(format: NeedsFormat) -> Self {
        Self {
            needs: Vec::new(),
            format,
            anomalies: Vec::new(),
        }
    }
}

/// Extracts needs from worker output, keeping only known targets.
#[derive(Debug, Clone)]
pub struct NeedsParser {
    known_targets: Vec<String>,
}

impl NeedsParser {
    /// `known_targets` must include the coordinator name.
    pub fn new<I, S>(known_targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_targets: known_targets.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parse(&self, output: &str, origin_step_id: u64) -> ParsedNeeds {
        let text = output.trim();
        if text.is_empty() {
            return ParsedNeeds::empty(NeedsFormat::Absent);
        }

        let mut decode_anomaly = None;
        match extract_json_object(text) {
            Some(object) => {
                if let Some(raw) = object.get(NEEDS_FIELD) {
                    return self.parse_structured(raw, origin_step_id);
                }
            }
            None if text.contains(NEEDS_FIELD) => {
                decode_anomaly = Some(ParseAnomaly::new(
                    "structured declaration is not valid JSON",
                    text,
                ));
            }
            None => {}
        }

        let mut parsed = self.parse_textual(text, origin_step_id);
        if let Some(anomaly) = decode_anomaly {
            parsed.anomalies.insert(0, anomaly);
        }
        parsed
    }

    fn parse_structured(&self, raw: &Value, origin_step_id: u64) -> ParsedNeeds {
        let mut parsed = ParsedNeeds::empty(NeedsFormat::Structured);

        let items: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            Value::String(s) if is_sentinel(&normalize_need_text(s)) => return parsed,
            Value::String(_) => vec![raw],
            Value::Null => return parsed,
            other => {
                parsed.anomalies.push(ParseAnomaly::new(
                    format!("'{}' must be a list", NEEDS_FIELD),
                    other.to_string(),
                ));
                return parsed;
            }
        };

        let mut records = Vec::new();
        for item in items {
            match item {
                Value::Object(map) => {
                    let target = map.get("target").and_then(Value::as_str);
                    let request = map.get("request").and_then(Value::as_str);
                    match (target, request) {
                        (Some(t), Some(r)) => records.push((t.to_string(), r.to_string(), item)),
                        _ => {
                            parsed.anomalies.push(ParseAnomaly::new(
                                "need record requires string 'target' and 'request'",
                                item.to_string(),
                            ));
                            return parsed;
                        }
                    }
                }
                Value::String(s) => {
                    let token = normalize_need_text(s);
                    if token.is_empty() {
                        continue;
                    }
                    if is_sentinel(&token) {
                        return parsed;
                    }
                    match split_targeted(&token) {
                        Some((t, r)) => records.push((t, r, item)),
                        None => {
                            parsed
                                .anomalies
                                .push(ParseAnomaly::new("need has no [Target] prefix", token));
                            return parsed;
                        }
                    }
                }
                other => {
                    parsed.anomalies.push(ParseAnomaly::new(
                        "need record must be an object or string",
                        other.to_string(),
                    ));
                    return parsed;
                }
            }
        }

        let mut seen = HashSet::new();
        for (target, request, item) in records {
            if parsed.needs.len() >= MAX_NEEDS_PER_OUTPUT {
                break;
            }
            self.accept(&mut parsed, &mut seen, &target, &request, origin_step_id, &item.to_string());
        }
        parsed
    }

    fn parse_textual(&self, text: &str, origin_step_id: u64) -> ParsedNeeds {
        let lines: Vec<&str> = text.lines().collect();

        let mut header = None;
        for (idx, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            let Some(head) = stripped.get(..NEEDS_HEADER.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(NEEDS_HEADER) {
                continue;
            }
            let rest = stripped[NEEDS_HEADER.len()..].trim_start();
            if rest.is_empty() {
                header = Some((idx, String::new()));
                break;
            }
            if let Some(inline) = rest.strip_prefix(':') {
                header = Some((idx, inline.trim().to_string()));
                break;
            }
        }

        let Some((header_idx, inline)) = header else {
            return ParsedNeeds::empty(NeedsFormat::Absent);
        };

        let mut parsed = ParsedNeeds::empty(NeedsFormat::Textual);
        let mut seen = HashSet::new();
        let mut consumed_any = false;

        let inline = normalize_need_text(&inline);
        if !inline.is_empty() {
            if is_sentinel(&inline) {
                return parsed;
            }
            consumed_any = true;
            self.accept_line(&mut parsed, &mut seen, &inline, origin_step_id);
        }

        for line in &lines[header_idx + 1..] {
            let stripped = line.trim();
            if stripped.is_empty() {
                if consumed_any {
                    break;
                }
                continue;
            }
            if consumed_any && SECTION_HEADING.is_match(stripped) {
                break;
            }

            let token = normalize_need_text(stripped);
            if token.is_empty() {
                continue;
            }
            if is_sentinel(&token) {
                return ParsedNeeds::empty(NeedsFormat::Textual);
            }
            consumed_any = true;
            if parsed.needs.len() >= MAX_NEEDS_PER_OUTPUT {
                break;
            }
            self.accept_line(&mut parsed, &mut seen, &token, origin_step_id);
        }

        if !consumed_any {
            parsed
                .anomalies
                .push(ParseAnomaly::new("needs header without entries", lines[header_idx]));
        }
        parsed
    }

    fn accept_line(
        &self,
        parsed: &mut ParsedNeeds,
        seen: &mut HashSet<String>,
        token: &str,
        origin_step_id: u64,
    ) {
        match split_targeted(token) {
            Some((target, request)) => {
                self.accept(parsed, seen, &target, &request, origin_step_id, token)
            }
            None => parsed
                .anomalies
                .push(ParseAnomaly::new("need has no [Target] prefix", token)),
        }
    }

    fn accept(
        &self,
        parsed: &mut ParsedNeeds,
        seen: &mut HashSet<String>,
        target: &str,
        request: &str,
        origin_step_id: u64,
        fragment: &str,
    ) {
        let request = normalize_need_text(request);
        if request.is_empty() {
            parsed
                .anomalies
                .push(ParseAnomaly::new("need has an empty request", fragment));
            return;
        }
        let Some(target) = self.canonical_target(target) else {
            parsed.anomalies.push(ParseAnomaly::new(
                format!("unknown need target '{}'", target.trim()),
                fragment,
            ));
            return;
        };
        let need = Need::new(target, request, origin_step_id);
        if seen.insert(need.key()) {
            parsed.needs.push(need);
        }
    }

    fn canonical_target(&self, target: &str) -> Option<String> {
        let wanted = target.trim().to_lowercase();
        self.known_targets
            .iter()
            .find(|t| t.trim().to_lowercase() == wanted)
            .map(|t| t.trim().to_string())
    }
}

/// Decides whether a need addressed to the coordinator asks the human something.
pub trait ClarificationClassifier: Send + Sync {
    fn is_clarification(&self, need: &Need) -> bool;
}

/// Matches request text against a configured phrase list (case-insensitive).
#[derive(Debug, Clone)]
pub struct PhraseClassifier {
    phrases: Vec<String>,
}

impl PhraseClassifier {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.into().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn default_phrases() -> Vec<String> {
        [
            "clarify",
            "clarification",
            "confirm",
            "ask the user",
            "with the user",
            "with user",
            "user input",
            "please specify",
            "which one",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for PhraseClassifier {
    fn default() -> Self {
        Self::new(Self::default_phrases())
    }
}

impl ClarificationClassifier for PhraseClassifier {
    fn is_clarification(&self, need: &Need) -> bool {
        let text = need.request_text.to_lowercase();
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }
}

/// Collapse whitespace, strip a list marker, cap the length.
pub fn normalize_need_text(value: &str) -> String {
    let compact = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped = LIST_MARKER.replace(&compact, "");
    stripped.chars().take(MAX_NEED_TEXT_LEN).collect::<String>().trim().to_string()
}

fn is_sentinel(token: &str) -> bool {
    let lowered = token.trim().trim_end_matches('.').to_lowercase();
    NO_NEEDS_SENTINELS.contains(&lowered.as_str())
}

fn split_targeted(token: &str) -> Option<(String, String)> {
    let caps = TARGETED_NEED.captures(token)?;
    let target = caps.get(1)?.as_str().trim().to_string();
    let request = caps.get(2)?.as_str().trim().to_string();
    if target.is_empty() {
        return None;
    }
    Some((target, request))
}

/// Whole output, fenced ```json block, or the outermost `{...}` span.
fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let as_object = |candidate: &str| match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    if let Some(map) = as_object(text) {
        return Some(map);
    }
    if let Some(map) = FENCED_JSON
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| as_object(m.as_str()))
    {
        return Some(map);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        return as_object(&text[start..=end]);
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
