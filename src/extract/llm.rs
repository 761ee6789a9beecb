//! Generative extraction through an `LlmProvider`.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::email::EmailDocument;
use super::{Extraction, Extractor, LineItem, normalize_categories};
use crate::error::ExtractError;
use crate::llm::provider::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};

/// Max tokens for the extraction call.
const EXTRACTION_MAX_TOKENS: u32 = 1024;

/// Extraction should be as deterministic as the model allows.
const EXTRACTION_TEMPERATURE: f32 = 0.0;

/// Body characters sent to the model.
const PROMPT_BODY_CHARS: usize = 6000;

pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
    /// Category names used by the supplier catalog, offered to the model.
    vocabulary: Vec<String>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            vocabulary: Vec::new(),
        }
    }

    /// Prefer these category names when they fit.
    pub fn with_vocabulary(mut self, vocabulary: Vec<String>) -> Self {
        self.vocabulary = normalize_categories(vocabulary);
        self
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> String {
        format!("llm:{}", self.llm.model_name())
    }

    async fn extract(&self, email: &EmailDocument) -> Result<Extraction, ExtractError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(&self.vocabulary)),
            ChatMessage::user(build_user_prompt(email)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        debug!(
            model = %self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %response.cost(self.llm.cost_per_token()),
            "Extraction completion"
        );
        if response.finish_reason == FinishReason::Length {
            warn!("Extraction response hit the token limit, parsing what arrived");
        }

        let mut extraction = parse_extraction_response(&response.content).map_err(|e| {
            warn!(raw_response = %response.content, error = %e, "Unparseable extraction response");
            ExtractError::InvalidResponse(e)
        })?;
        extraction.extractor = self.name();
        Ok(extraction)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(vocabulary: &[String]) -> String {
    let mut prompt = String::from(
        "You extract structured data from supplier request-for-quote (RFQ) emails.\n\n\
         Respond with ONLY a JSON object:\n\
         {\"summary\": \"...\", \"requester_name\": \"...\", \"requester_company\": \"...\", \
         \"categories\": [\"...\"], \"items\": [{\"description\": \"...\", \"quantity\": 0, \"unit\": \"...\"}], \
         \"delivery_location\": \"...\", \"needed_by\": \"...\"}\n\n\
         Rules:\n\
         - summary: one sentence describing what is requested\n\
         - categories: short lowercase product categories\n\
         - items: one entry per requested product; quantity is a number, omit it if not stated\n\
         - needed_by: the requested delivery date as written in the email\n\
         - Use null for anything the email does not say; never invent values",
    );
    if !vocabulary.is_empty() {
        prompt.push_str(&format!(
            "\n- Prefer these category names when they fit: {}",
            vocabulary.join(", ")
        ));
    }
    prompt
}

fn build_user_prompt(email: &EmailDocument) -> String {
    let mut prompt = String::with_capacity(1024);
    if let Some(sender) = &email.sender {
        prompt.push_str(&format!("From: {sender}"));
        if let Some(name) = &email.sender_name {
            prompt.push_str(&format!(" ({name})"));
        }
        prompt.push('\n');
    }
    if let Some(subject) = &email.subject {
        prompt.push_str(&format!("Subject: {subject}\n"));
    }
    let body: String = email.body.chars().take(PROMPT_BODY_CHARS).collect();
    prompt.push_str(&format!("\nEmail:\n{body}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "requesterName")]
    requester_name: Option<String>,
    #[serde(default, alias = "requesterCompany")]
    requester_company: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    items: Vec<ItemResponse>,
    #[serde(default, alias = "deliveryLocation")]
    delivery_location: Option<String>,
    #[serde(default, alias = "neededBy")]
    needed_by: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ItemResponse {
    #[serde(default)]
    description: String,
    #[serde(default)]
    quantity: Option<serde_json::Value>,
    #[serde(default)]
    unit: Option<String>,
}

fn parse_extraction_response(raw: &str) -> Result<Extraction, String> {
    let json_str = extract_json_object(raw);
    let response: ExtractionResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let items = response
        .items
        .into_iter()
        .filter(|item| !item.description.trim().is_empty())
        .map(|item| LineItem {
            description: item.description.trim().to_string(),
            quantity: item.quantity.as_ref().and_then(parse_quantity),
            unit: non_empty(item.unit),
        })
        .collect();

    Ok(Extraction {
        summary: response.summary.unwrap_or_default().trim().to_string(),
        requester_name: non_empty(response.requester_name),
        requester_company: non_empty(response.requester_company),
        categories: normalize_categories(response.categories),
        items,
        delivery_location: non_empty(response.delivery_location),
        needed_by: non_empty(response.needed_by),
        extractor: String::new(),
    })
}

/// Quantities arrive as numbers or strings like "1,200".
fn parse_quantity(value: &serde_json::Value) -> Option<Decimal> {
    let quantity: Option<Decimal> = match value {
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    };
    quantity.filter(|q| q.is_sign_positive() && !q.is_zero())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::CompletionResponse;

    struct MockExtractionLlm {
        response: Result<String, fn() -> LlmError>,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl MockExtractionLlm {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(content.to_string()),
                last_request: Mutex::new(None),
            })
        }

        fn failing(error: fn() -> LlmError) -> Arc<Self> {
            Arc::new(Self {
                response: Err(error),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockExtractionLlm {
        fn model_name(&self) -> &str {
            "mock-extract"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.last_request.lock().unwrap() = Some(request);
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(make) => Err(make()),
            }
        }
    }

    fn email() -> EmailDocument {
        EmailDocument {
            sender: Some("dana@northwind.example".into()),
            sender_name: Some("Dana Reyes".into()),
            subject: Some("RFQ: valves".into()),
            body: "Please quote 40 DN50 ball valves, delivery to Rotterdam by 15 April.".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn extracts_from_fenced_json() {
        let llm = MockExtractionLlm::replying(
            "Here you go:\n```json\n{\"summary\": \"40 ball valves\", \"requester_name\": \"Dana Reyes\", \
             \"categories\": [\"Valves\"], \"items\": [{\"description\": \"DN50 ball valve\", \"quantity\": 40, \"unit\": \"pcs\"}], \
             \"delivery_location\": \"Rotterdam\", \"needed_by\": \"15 April\"}\n```",
        );
        let extractor = LlmExtractor::new(llm.clone()).with_vocabulary(vec!["valves".into()]);

        let extraction = extractor.extract(&email()).await.unwrap();
        assert_eq!(extraction.categories, vec!["valves".to_string()]);
        assert_eq!(extraction.items[0].quantity, Some(dec!(40)));
        assert_eq!(extraction.delivery_location.as_deref(), Some("Rotterdam"));
        assert_eq!(extraction.extractor, "llm:mock-extract");

        let request = llm.last_request.lock().unwrap().clone().unwrap();
        assert!(request.messages[0].content.contains("Prefer these category names"));
        assert!(request.messages[1].content.contains("Dana Reyes"));
    }

    #[tokio::test]
    async fn unparseable_response_is_transient() {
        let llm = MockExtractionLlm::replying("I cannot help with that.");
        let err = LlmExtractor::new(llm).extract(&email()).await.unwrap_err();
        assert!(matches!(err, ExtractError::InvalidResponse(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_becomes_throttled() {
        let llm = MockExtractionLlm::failing(|| LlmError::RateLimited {
            provider: "mock".into(),
            retry_after: None,
        });
        let err = LlmExtractor::new(llm).extract(&email()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Throttled { .. }));
    }

    #[test]
    fn quantities_from_strings() {
        assert_eq!(parse_quantity(&serde_json::json!("1,200")), Some(dec!(1200)));
        assert_eq!(parse_quantity(&serde_json::json!(2.5)), Some(dec!(2.5)));
        assert_eq!(parse_quantity(&serde_json::json!("a few")), None);
        assert_eq!(parse_quantity(&serde_json::json!(0)), None);
    }

    #[test]
    fn null_strings_are_dropped() {
        let extraction = parse_extraction_response(
            r#"{"summary": "x", "requester_company": "null", "items": [{"description": " "}]}"#,
        )
        .unwrap();
        assert!(extraction.requester_company.is_none());
        assert!(extraction.items.is_empty());
    }

    #[test]
    fn extract_json_object_cases() {
        assert_eq!(extract_json_object("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json_object("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_object("sure: {\"a\":1} done"), "{\"a\":1}");
    }
}
