//! Email classifier: prompt building, one LLM call, tolerant response parsing.
//!
//! The model is asked for a single JSON object with `needsReply`, `isBusiness`
//! and `reasoning`. Anything it returns is turned into a [`Classification`]:
//! well-formed JSON is coerced field by field, anything else goes through a
//! keyword scan of the raw text.

use std::sync::{Arc, LazyLock};

use chrono::SecondsFormat;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::mailbox::{Classification, Message};

/// Body characters embedded in the prompt.
pub const BODY_CHAR_BUDGET: usize = 2000;

const TRUNCATION_MARKER: &str = "... [truncated]";

const TEMPERATURE: f32 = 0.3;
const TOP_P: f32 = 0.95;
const MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "You are an expert email classifier. Analyze emails to determine \
if they need a reply and if they contain business opportunities. Respond with a JSON object only.";

const CRITERIA: &str = r#"Classification Criteria:

NEEDS REPLY (true if any apply):
- Direct questions asking for information or clarification
- Requests for action, decisions, or approval
- Meeting invitations or scheduling requests
- Customer inquiries or support requests
- Personal messages from colleagues, friends, or family
- Complaints or issues that need addressing
- Follow-ups on pending matters
- Invitations that require an RSVP
- Requests for feedback or opinions

NEEDS REPLY (false if):
- Newsletters, marketing emails, or promotional content
- Automated notifications (shipping, billing, system alerts)
- Informational updates that don't require action
- Spam or clearly irrelevant emails
- Mass communications or announcements
- Social media notifications
- Receipts or confirmations (unless there's an issue)

BUSINESS OPPORTUNITY (true if any apply):
- Job offers, freelance opportunities, or consulting requests
- Partnership proposals or collaboration invitations
- Investment opportunities or funding offers
- Sales leads or potential client inquiries
- Speaking engagements or conference invitations
- Business development or networking with real potential value
- Requests for paid services or expertise
- Licensing, affiliate, or revenue-sharing proposals

BUSINESS OPPORTUNITY (false if):
- Personal emails with no commercial value
- Routine business communications (internal updates, etc.)
- Spam or scam attempts
- Generic marketing without a specific opportunity
- Social or entertainment content

Respond with ONLY a JSON object in this exact format:
{
  "needsReply": boolean,
  "isBusiness": boolean,
  "reasoning": "Brief explanation of your decision"
}"#;

static NEEDS_REPLY_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"needsreply"\s*:\s*true|needs reply|require|question|urgent"#)
        .expect("valid regex")
});

static BUSINESS_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"isbusiness"\s*:\s*true|business|opportunity|money"#).expect("valid regex")
});

/// Classifies messages with an LLM.
#[derive(Clone)]
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Classify one message with a single model call.
    ///
    /// Request failures are returned. Unparseable replies are not errors: they
    /// fall back to keyword detection.
    pub async fn classify(&self, message: &Message) -> Result<Classification, LlmError> {
        info!(uid = message.uid, subject = %message.subject, from = %message.from, "Classifying email");

        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(message)),
        ])
        .with_temperature(TEMPERATURE)
        .with_top_p(TOP_P)
        .with_max_tokens(MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        debug!(uid = message.uid, raw = %response.content, "LLM response");

        let classification = parse_classification(&response.content);
        info!(
            uid = message.uid,
            needs_reply = classification.needs_reply,
            is_business = classification.is_business,
            "Email classified"
        );
        Ok(classification)
    }

    /// Like [`classify`](Self::classify), but a failed request yields a
    /// non-actionable classification carrying the error as its reasoning.
    pub async fn classify_or_default(&self, message: &Message) -> Classification {
        match self.classify(message).await {
            Ok(classification) => classification,
            Err(e) => {
                error!(uid = message.uid, error = %e, "Classification request failed");
                Classification::unclassified(format!("Error during classification: {e}"))
            }
        }
    }
}

// ── Prompt ──────────────────────────────────────────────────────────

/// Deterministic user prompt for one message.
pub fn build_prompt(message: &Message) -> String {
    let from = non_empty(&message.from).unwrap_or("Unknown");
    let subject = non_empty(&message.subject).unwrap_or("No Subject");
    let date = message.date.to_rfc3339_opts(SecondsFormat::Millis, true);
    let body = match non_empty(&message.body) {
        Some(body) => truncate_body(body),
        None => "No content available".to_string(),
    };

    format!(
        "Analyze this email and determine:\n\
         1. Does this email require a reply? (needsReply: true/false)\n\
         2. Does this email contain business opportunities or money-making potential? (isBusiness: true/false)\n\
         \n\
         Email Details:\n\
         - From: {from}\n\
         - Subject: {subject}\n\
         - Date: {date}\n\
         - Body: {body}\n\
         \n\
         {CRITERIA}"
    )
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Cap the body at [`BODY_CHAR_BUDGET`] characters, marking any cut.
fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(BODY_CHAR_BUDGET) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &body[..cut]),
        None => body.to_string(),
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Turn a raw model reply into a classification. Never fails.
pub fn parse_classification(raw: &str) -> Classification {
    match decode_object(raw) {
        Ok(object) => Classification {
            needs_reply: coerce_bool(object.get("needsReply")),
            is_business: coerce_bool(object.get("isBusiness")),
            reasoning: match object.get("reasoning") {
                Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
                Some(Value::String(_) | Value::Null) | None => "No reasoning provided".to_string(),
                Some(other) => other.to_string(),
            },
        },
        Err(cause) => {
            warn!(error = %cause, "Falling back to keyword parsing of LLM response");
            keyword_fallback(raw, &cause)
        }
    }
}

/// The first `{` through the last `}`, decoded as a JSON object.
fn decode_object(raw: &str) -> Result<serde_json::Map<String, Value>, String> {
    let json = extract_json_object(raw).ok_or_else(|| "No JSON found in response".to_string())?;
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("Response JSON is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn coerce_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}

/// Approximate both facets from keywords in free text.
pub fn keyword_fallback(raw: &str, cause: &str) -> Classification {
    Classification {
        needs_reply: NEEDS_REPLY_TERMS.is_match(raw),
        is_business: BUSINESS_TERMS.is_match(raw),
        reasoning: format!("Fallback parsing due to JSON error: {cause}"),
    }
}
