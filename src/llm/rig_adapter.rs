//! Bridge from rig's `CompletionModel` to `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};
use rust_decimal::Decimal;
use tracing::debug;

use super::costs;
use super::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role};
use crate::error::LlmError;

/// Wraps a rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

/// Split a request into rig's preamble, history and prompt.
fn to_rig(request: &CompletionRequest) -> (Option<String>, Vec<Message>, Message) {
    let preamble: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut history: Vec<Message> = request
        .messages
        .iter()
        .filter_map(|m| match m.role {
            Role::System => None,
            Role::User => Some(Message::user(m.content.clone())),
            Role::Assistant => Some(Message::assistant(m.content.clone())),
        })
        .collect();
    let prompt = history.pop().unwrap_or_else(|| Message::user(String::new()));
    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
    (preamble, history, prompt)
}

/// Classify a rig error into the retryable and permanent `LlmError` kinds.
///
/// rig renders the provider's HTTP status and error body into the message,
/// which is all there is to go on.
fn classify(provider: &str, error: CompletionError) -> LlmError {
    let reason = error.to_string();
    if matches!(error, CompletionError::JsonError(_) | CompletionError::ResponseError(_)) {
        return LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        };
    }
    classify_message(provider, reason)
}

fn classify_message(provider: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["rate_limit", "rate limit", "overloaded", "429", "529"]) {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if has(&["authentication_error", "permission_error", "401", "403", "invalid x-api-key"]) {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if has(&["invalid_request_error", "not_found_error", "request_too_large", "400 bad request", "413"]) {
        LlmError::Rejected {
            provider: provider.to_string(),
            reason,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = to_rig(&request);
        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .max_tokens(u64::from(request.max_tokens));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(self.provider, e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let input_tokens = u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX);
        let output_tokens = u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX);
        // rig does not surface the stop reason; a response that used the whole
        // budget is treated as truncated.
        let finish_reason = if output_tokens >= request.max_tokens {
            FinishReason::Length
        } else if content.is_empty() {
            FinishReason::Other
        } else {
            FinishReason::Stop
        };

        debug!(
            provider = self.provider,
            model = %self.model_name,
            input_tokens,
            output_tokens,
            "Completion finished"
        );

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn system_messages_become_preamble() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("earlier"),
            ChatMessage::assistant("noted"),
            ChatMessage::user("hello"),
        ]);
        let (preamble, history, _prompt) = to_rig(&request);
        assert_eq!(preamble.as_deref(), Some("be terse"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn provider_messages_are_classified() {
        let classify = |msg: &str| classify_message("anthropic", msg.to_string());
        assert!(matches!(
            classify(r#"ProviderError: {"type":"error","error":{"type":"rate_limit_error"}}"#),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify(r#"ProviderError: {"error":{"type":"overloaded_error"}}"#),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify(r#"ProviderError: {"error":{"type":"authentication_error"}}"#),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            classify(r#"ProviderError: {"error":{"type":"invalid_request_error"}}"#),
            LlmError::Rejected { .. }
        ));
        let other = classify("HttpError: connection reset by peer");
        assert!(matches!(other, LlmError::RequestFailed { .. }));
        assert!(other.is_transient());
    }

    #[test]
    fn malformed_responses_are_invalid() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = classify("anthropic", CompletionError::JsonError(json));
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
        assert!(err.is_transient());
    }
}
