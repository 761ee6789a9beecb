//! Configuration types.
//!
//! Everything here is resolved once at process start and then shared as an
//! immutable `Arc<PipelineConfig>`; no component reads the environment on its own.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::matching::StrategyKind;

/// Default Anthropic model used for extraction.
pub const DEFAULT_LLM_MODEL: &str = "claude-sonnet-4-20250514";

/// Names of the three result tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub parsed_emails: String,
    pub suppliers: String,
    pub match_history: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            parsed_emails: "parsed_emails".to_string(),
            suppliers: "suppliers".to_string(),
            match_history: "match_history".to_string(),
        }
    }
}

/// Queue names (the last path segment of each configured queue URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub parse: String,
    pub matching: String,
    pub result: String,
    pub diagnostics: String,
}

impl QueueNames {
    /// Dead-letter queue name paired with a work queue.
    pub fn dead_letter_name(queue: &str) -> String {
        match queue.strip_suffix("-queue") {
            Some(stem) => format!("{stem}-dead-letter-queue"),
            None => format!("{queue}-dead-letter-queue"),
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            parse: "parse-queue".to_string(),
            matching: "match-queue".to_string(),
            result: "result-queue".to_string(),
            diagnostics: "diagnostics-queue".to_string(),
        }
    }
}

/// Visibility and redelivery policy shared by the work queues.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is moved to its dead-letter queue.
    pub max_receive_count: u32,
    /// Long-poll duration for a single receive call.
    pub receive_wait: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(90),
            max_receive_count: 5,
            receive_wait: Duration::from_secs(1),
        }
    }
}

/// Admission control and time limits for handler invocations.
#[derive(Debug, Clone, Copy)]
pub struct HandlerLimits {
    /// Maximum concurrent invocations per handler.
    pub max_concurrency: usize,
    /// Hard limit for one invocation; exceeding it counts as a transient failure.
    pub invocation_timeout: Duration,
    /// Limit for the generative extraction call inside the parsing handler.
    pub extraction_timeout: Duration,
}

impl Default for HandlerLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            invocation_timeout: Duration::from_secs(60),
            extraction_timeout: Duration::from_secs(30),
        }
    }
}

/// Supplier matching parameters.
#[derive(Debug, Clone, Copy)]
pub struct MatchingConfig {
    pub strategy: StrategyKind,
    /// Minimum confidence (0.0-1.0) for a supplier to be recorded.
    pub min_confidence: f64,
    /// Maximum number of suppliers recorded per email.
    pub top_k: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Fuzzy,
            min_confidence: 0.3,
            top_k: 5,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub region: String,
    pub event_bus_name: String,
    /// Bucket name reported in object notifications.
    pub bucket: String,
    /// Only objects under this key prefix are ingested.
    pub ingest_prefix: String,
    pub tables: TableNames,
    pub queues: QueueNames,
    pub queue_policy: QueuePolicy,
    pub handlers: HandlerLimits,
    pub matching: MatchingConfig,
    pub db_path: PathBuf,
    pub object_root: PathBuf,
    pub api_port: u16,
    /// JSON supplier catalog loaded at start-up.
    pub supplier_catalog: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// LLM extraction; `None` selects the keyword extractor.
    pub llm: Option<LlmConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            event_bus_name: "email-processor-bus".to_string(),
            bucket: "inbound-email".to_string(),
            ingest_prefix: "emails/".to_string(),
            tables: TableNames::default(),
            queues: QueueNames::default(),
            queue_policy: QueuePolicy::default(),
            handlers: HandlerLimits::default(),
            matching: MatchingConfig::default(),
            db_path: PathBuf::from("./data/email-pipeline.db"),
            object_root: PathBuf::from("./data/objects"),
            api_port: 8080,
            supplier_catalog: None,
            log_dir: None,
            llm: None,
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let tables = TableNames {
            parsed_emails: table_name(&get, "PARSED_EMAILS_TABLE", &defaults.tables.parsed_emails)?,
            suppliers: table_name(&get, "SUPPLIERS_TABLE", &defaults.tables.suppliers)?,
            match_history: table_name(&get, "MATCH_HISTORY_TABLE", &defaults.tables.match_history)?,
        };

        let queues = QueueNames {
            parse: queue_name(&get, "PARSE_QUEUE_URL", &defaults.queues.parse)?,
            matching: queue_name(&get, "MATCH_QUEUE_URL", &defaults.queues.matching)?,
            result: queue_name(&get, "RESULT_QUEUE_URL", &defaults.queues.result)?,
            diagnostics: queue_name(&get, "DIAGNOSTICS_QUEUE_URL", &defaults.queues.diagnostics)?,
        };

        let queue_policy = QueuePolicy {
            visibility_timeout: Duration::from_secs(parse_or(
                &get,
                "PIPELINE_VISIBILITY_TIMEOUT_SECS",
                defaults.queue_policy.visibility_timeout.as_secs(),
            )?),
            max_receive_count: parse_or(
                &get,
                "PIPELINE_MAX_RECEIVE_COUNT",
                defaults.queue_policy.max_receive_count,
            )?,
            receive_wait: Duration::from_millis(parse_or(
                &get,
                "PIPELINE_RECEIVE_WAIT_MS",
                defaults.queue_policy.receive_wait.as_millis() as u64,
            )?),
        };

        let handlers = HandlerLimits {
            max_concurrency: parse_or(
                &get,
                "PIPELINE_MAX_CONCURRENCY",
                defaults.handlers.max_concurrency,
            )?,
            invocation_timeout: Duration::from_secs(parse_or(
                &get,
                "PIPELINE_INVOCATION_TIMEOUT_SECS",
                defaults.handlers.invocation_timeout.as_secs(),
            )?),
            extraction_timeout: Duration::from_secs(parse_or(
                &get,
                "PIPELINE_EXTRACTION_TIMEOUT_SECS",
                defaults.handlers.extraction_timeout.as_secs(),
            )?),
        };

        let matching = MatchingConfig {
            strategy: parse_or(&get, "PIPELINE_MATCH_STRATEGY", defaults.matching.strategy)?,
            min_confidence: parse_or(
                &get,
                "PIPELINE_MIN_CONFIDENCE",
                defaults.matching.min_confidence,
            )?,
            top_k: parse_or(&get, "PIPELINE_TOP_K", defaults.matching.top_k)?,
        };
        validate_limits(&queue_policy, &handlers, &matching)?;

        let llm = get("ANTHROPIC_API_KEY").map(|key| LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from(key),
            model: get("PIPELINE_LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        });

        Ok(Self {
            region: get("PIPELINE_REGION")
                .or_else(|| get("AWS_REGION"))
                .unwrap_or(defaults.region),
            event_bus_name: get("EVENT_BUS_NAME").unwrap_or(defaults.event_bus_name),
            bucket: get("EMAIL_BUCKET").unwrap_or(defaults.bucket),
            ingest_prefix: get("PIPELINE_INGEST_PREFIX").unwrap_or(defaults.ingest_prefix),
            tables,
            queues,
            queue_policy,
            handlers,
            matching,
            db_path: get("PIPELINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            object_root: get("PIPELINE_OBJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.object_root),
            api_port: parse_or(&get, "PIPELINE_API_PORT", defaults.api_port)?,
            supplier_catalog: get("PIPELINE_SUPPLIER_CATALOG").map(PathBuf::from),
            log_dir: get("PIPELINE_LOG_DIR").map(PathBuf::from),
            llm,
        })
    }
}

/// Reject zero limits and timeouts that do not nest
/// (extraction < invocation < visibility).
fn validate_limits(
    policy: &QueuePolicy,
    handlers: &HandlerLimits,
    matching: &MatchingConfig,
) -> Result<(), ConfigError> {
    if policy.visibility_timeout.is_zero() {
        return Err(invalid("PIPELINE_VISIBILITY_TIMEOUT_SECS", "must be at least 1"));
    }
    if policy.max_receive_count == 0 {
        return Err(invalid("PIPELINE_MAX_RECEIVE_COUNT", "must be at least 1"));
    }
    if handlers.max_concurrency == 0 {
        return Err(invalid("PIPELINE_MAX_CONCURRENCY", "must be at least 1"));
    }
    if handlers.invocation_timeout >= policy.visibility_timeout {
        return Err(invalid(
            "PIPELINE_INVOCATION_TIMEOUT_SECS",
            &format!(
                "must be shorter than the visibility timeout ({}s)",
                policy.visibility_timeout.as_secs()
            ),
        ));
    }
    if handlers.extraction_timeout >= handlers.invocation_timeout {
        return Err(invalid(
            "PIPELINE_EXTRACTION_TIMEOUT_SECS",
            &format!(
                "must be shorter than the invocation timeout ({}s)",
                handlers.invocation_timeout.as_secs()
            ),
        ));
    }
    if !(0.0..=1.0).contains(&matching.min_confidence) {
        return Err(invalid("PIPELINE_MIN_CONFIDENCE", "must be between 0.0 and 1.0"));
    }
    if matching.top_k == 0 {
        return Err(invalid("PIPELINE_TOP_K", "must be at least 1"));
    }
    Ok(())
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(key, &format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn table_name<G>(get: &G, key: &str, default: &str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let name = get(key).unwrap_or_else(|| default.to_string());
    if !is_sql_identifier(&name) {
        return Err(invalid(key, &format!("'{name}' is not a valid table name")));
    }
    Ok(name)
}

fn queue_name<G>(get: &G, key: &str, default: &str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(url) = get(key) else {
        return Ok(default.to_string());
    };
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid(key, &format!("'{url}' does not name a queue")))
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
pub fn is_sql_identifier(name: &str) -> bool {
    // Compiled per call; only used during start-up.
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.queues.parse, "parse-queue");
        assert_eq!(config.tables.match_history, "match_history");
        assert_eq!(config.queue_policy.max_receive_count, 5);
        assert!(config.llm.is_none());
    }

    #[test]
    fn queue_names_come_from_url_tail() {
        let config = PipelineConfig::from_lookup(lookup(&[(
            "PARSE_QUEUE_URL",
            "https://sqs.eu-west-1.amazonaws.com/123456789012/rfq-parse-queue",
        )]))
        .unwrap();
        assert_eq!(config.queues.parse, "rfq-parse-queue");
    }

    #[test]
    fn dead_letter_names() {
        assert_eq!(QueueNames::dead_letter_name("parse-queue"), "parse-dead-letter-queue");
        assert_eq!(QueueNames::dead_letter_name("inbox"), "inbox-dead-letter-queue");
    }

    #[test]
    fn rejects_non_identifier_table_names() {
        let err = PipelineConfig::from_lookup(lookup(&[(
            "SUPPLIERS_TABLE",
            "suppliers; DROP TABLE x",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SUPPLIERS_TABLE"));
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let err = PipelineConfig::from_lookup(lookup(&[("PIPELINE_TOP_K", "many")])).unwrap_err();
        assert!(err.to_string().contains("PIPELINE_TOP_K"));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        assert!(
            PipelineConfig::from_lookup(lookup(&[("PIPELINE_MIN_CONFIDENCE", "1.5")])).is_err()
        );
    }

    #[test]
    fn rejects_zero_receive_count() {
        assert!(
            PipelineConfig::from_lookup(lookup(&[("PIPELINE_MAX_RECEIVE_COUNT", "0")])).is_err()
        );
    }

    #[test]
    fn default_limits_nest() {
        let config = PipelineConfig::default();
        assert!(config.handlers.invocation_timeout < config.queue_policy.visibility_timeout);
        assert!(config.handlers.extraction_timeout < config.handlers.invocation_timeout);
        assert!(PipelineConfig::from_lookup(lookup(&[])).is_ok());
    }

    #[test]
    fn rejects_invocation_outliving_visibility() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_VISIBILITY_TIMEOUT_SECS", "30"),
            ("PIPELINE_INVOCATION_TIMEOUT_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PIPELINE_INVOCATION_TIMEOUT_SECS"));

        let err = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_VISIBILITY_TIMEOUT_SECS", "60"),
            ("PIPELINE_INVOCATION_TIMEOUT_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PIPELINE_INVOCATION_TIMEOUT_SECS"));
    }

    #[test]
    fn rejects_extraction_outliving_invocation() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("PIPELINE_INVOCATION_TIMEOUT_SECS", "20"),
            ("PIPELINE_EXTRACTION_TIMEOUT_SECS", "20"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PIPELINE_EXTRACTION_TIMEOUT_SECS"));
    }

    #[test]
    fn rejects_zero_visibility_and_top_k() {
        let err = PipelineConfig::from_lookup(lookup(&[("PIPELINE_VISIBILITY_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PIPELINE_VISIBILITY_TIMEOUT_SECS"));

        let err = PipelineConfig::from_lookup(lookup(&[("PIPELINE_TOP_K", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PIPELINE_TOP_K"));
    }

    #[test]
    fn api_key_enables_llm() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("PIPELINE_LLM_MODEL", "claude-3-5-haiku-latest"),
            ("PIPELINE_MATCH_STRATEGY", "semantic"),
        ]))
        .unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.model, "claude-3-5-haiku-latest");
        assert_eq!(config.matching.strategy, StrategyKind::Semantic);
    }
}
