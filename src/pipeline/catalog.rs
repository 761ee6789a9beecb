//! Start-up wiring that depends on the supplier catalog.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, Error};
use crate::extract::{Extractor, KeywordExtractor, LlmExtractor};
use crate::llm::create_provider;
use crate::store::{ResultStore, SupplierRecord};

/// Upsert every supplier in a JSON catalog file (an array of supplier objects).
///
/// Returns the number of suppliers written. Re-loading the same file is a no-op.
pub async fn load_supplier_catalog(store: &dyn ResultStore, path: &Path) -> Result<usize, Error> {
    let raw = tokio::fs::read_to_string(path).await.map_err(ConfigError::Io)?;
    let suppliers: Vec<SupplierRecord> = serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ParseError(format!("supplier catalog {}: {e}", path.display())))?;
    for supplier in &suppliers {
        store.upsert_supplier(supplier).await?;
    }
    info!(path = %path.display(), suppliers = suppliers.len(), "Supplier catalog loaded");
    Ok(suppliers.len())
}

/// Categories offered by active suppliers, sorted and deduplicated.
pub async fn catalog_vocabulary(store: &dyn ResultStore) -> Result<Vec<String>, Error> {
    let categories: BTreeSet<String> = store
        .list_suppliers(true)
        .await?
        .into_iter()
        .flat_map(|s| s.categories)
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    Ok(categories.into_iter().collect())
}

/// LLM extraction when a key is configured, keyword extraction otherwise.
pub fn build_extractor(config: &PipelineConfig, vocabulary: Vec<String>) -> Result<Arc<dyn Extractor>, Error> {
    match &config.llm {
        Some(llm) => {
            let provider = create_provider(llm)?;
            Ok(Arc::new(LlmExtractor::new(provider).with_vocabulary(vocabulary)))
        }
        None => {
            info!(categories = vocabulary.len(), "No LLM configured, using keyword extraction");
            let extractor = KeywordExtractor::new(&vocabulary)
                .map_err(|e| ConfigError::ParseError(format!("category vocabulary: {e}")))?;
            Ok(Arc::new(extractor))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::TableNames;
    use crate::store::LibSqlStore;

    const CATALOG: &str = r#"[
        {"id": "sup-1", "name": "Acme Valves", "categories": ["Valves", "gaskets"]},
        {"id": "sup-2", "name": "Bolt Bros", "categories": ["fasteners", "valves"]},
        {"id": "sup-3", "name": "Gone Ltd", "categories": ["lasers"], "active": false}
    ]"#;

    #[tokio::test]
    async fn catalog_load_and_vocabulary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let store = LibSqlStore::new_memory(TableNames::default()).await.unwrap();

        assert_eq!(load_supplier_catalog(&store, file.path()).await.unwrap(), 3);
        assert_eq!(load_supplier_catalog(&store, file.path()).await.unwrap(), 3);
        assert_eq!(store.list_suppliers(false).await.unwrap().len(), 3);

        let vocabulary = catalog_vocabulary(&store).await.unwrap();
        assert_eq!(vocabulary, vec!["fasteners", "gaskets", "valves"]);
    }

    #[tokio::test]
    async fn malformed_catalog_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let store = LibSqlStore::new_memory(TableNames::default()).await.unwrap();
        let err = load_supplier_catalog(&store, file.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn keyword_extractor_without_llm() {
        let config = PipelineConfig::default();
        assert!(build_extractor(&config, vec!["valves".into()]).is_ok());
    }
}
