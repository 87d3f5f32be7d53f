//! Keyword exclusion filter.
//!
//! Decides whether a record should bypass downstream enrichment. Matching
//! is whole-word: a keyword matches a name iff the keyword equals one of
//! the whitespace-separated tokens of the normalized name.
//!
//! The active keyword set is cached and refreshed lazily; keyword admin
//! endpoints call [`ExclusionFilter::invalidate`] after every mutation, so
//! staleness is bounded by the refresh interval only when an operator
//! edits the table out of band.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::normalize::normalize_name;
use crate::store::RecordStore;

/// Result row for the keyword test tool.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct KeywordTestResult {
    pub name: String,
    pub matches: bool,
}

struct CachedSet {
    keywords: Arc<HashSet<String>>,
    loaded_at: DateTime<Utc>,
}

/// Whole-word exclusion matcher over the active keyword set.
pub struct ExclusionFilter {
    store: Arc<dyn RecordStore>,
    cache: RwLock<Option<CachedSet>>,
    ttl: Duration,
}

impl ExclusionFilter {
    /// Default cache lifetime when nobody invalidates explicitly.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_ttl(store, Self::DEFAULT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            ttl,
        }
    }

    /// Drop the cached keyword set; the next match reloads from the store.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// The active exclusion keywords, casefolded.
    pub async fn active_set(&self) -> Result<Arc<HashSet<String>>> {
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref() {
                let age = Utc::now().signed_duration_since(cached.loaded_at);
                if age.to_std().map(|a| a < self.ttl).unwrap_or(false) {
                    return Ok(cached.keywords.clone());
                }
            }
        }

        let keywords: HashSet<String> = self
            .store
            .active_keywords()
            .await?
            .into_iter()
            .map(|k| k.to_lowercase())
            .collect();
        let keywords = Arc::new(keywords);

        *self.cache.write() = Some(CachedSet {
            keywords: keywords.clone(),
            loaded_at: Utc::now(),
        });

        Ok(keywords)
    }

    /// Return the first active keyword the name matches as a whole word,
    /// if any. Matching depends only on the normalized name and the
    /// active set.
    pub async fn match_name(&self, name: &str) -> Result<Option<String>> {
        let active = self.active_set().await?;
        Ok(match_against(name, &active))
    }

    /// Dry-run one keyword against a list of names; used by the admin
    /// test endpoint. The keyword does not need to be stored.
    pub fn test_keyword(&self, keyword: &str, names: &[String]) -> Vec<KeywordTestResult> {
        let mut set = HashSet::new();
        set.insert(keyword.trim().to_lowercase());
        names
            .iter()
            .map(|name| KeywordTestResult {
                name: name.clone(),
                matches: match_against(name, &set).is_some(),
            })
            .collect()
    }
}

fn match_against(name: &str, keywords: &HashSet<String>) -> Option<String> {
    if keywords.is_empty() {
        return None;
    }
    let normalized = normalize_name(name);
    normalized
        .split_whitespace()
        .find(|token| keywords.contains(*token))
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::types::ExclusionKeyword;

    fn set(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_whole_word_match() {
        let keywords = set(&["bank"]);
        assert_eq!(
            match_against("Bank of America", &keywords),
            Some("bank".to_string())
        );
        // "bank" is not a whole token of "burbank"
        assert_eq!(match_against("Burbank Studios", &keywords), None);
    }

    #[test]
    fn test_match_uses_normalized_name() {
        let keywords = set(&["bank"]);
        // suffix removal happens before matching
        assert_eq!(
            match_against("BANK, Inc.", &keywords),
            Some("bank".to_string())
        );
    }

    #[test]
    fn test_no_keywords_no_match() {
        assert_eq!(match_against("Bank of America", &HashSet::new()), None);
    }

    #[tokio::test]
    async fn test_filter_loads_active_only() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_keyword(ExclusionKeyword::new("bank", None, None))
            .await
            .unwrap();
        let mut inactive = ExclusionKeyword::new("insurance", None, None);
        inactive.is_active = false;
        store.create_keyword(inactive).await.unwrap();

        let filter = ExclusionFilter::new(store);
        assert_eq!(
            filter.match_name("First Bank").await.unwrap(),
            Some("bank".to_string())
        );
        assert_eq!(filter.match_name("Acme Insurance").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_new_keywords() {
        let store = Arc::new(InMemoryStore::new());
        let filter = ExclusionFilter::new(store.clone());

        assert_eq!(filter.match_name("Payroll Transfer").await.unwrap(), None);

        store
            .create_keyword(ExclusionKeyword::new("payroll", None, None))
            .await
            .unwrap();
        // cache still holds the empty set until invalidated
        assert_eq!(filter.match_name("Payroll Transfer").await.unwrap(), None);

        filter.invalidate();
        assert_eq!(
            filter.match_name("Payroll Transfer").await.unwrap(),
            Some("payroll".to_string())
        );
    }

    #[test]
    fn test_keyword_test_tool() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
        let filter = ExclusionFilter::new(store);
        let results = filter.test_keyword(
            "Bank",
            &["Bank of America".to_string(), "Acme Widgets".to_string()],
        );
        assert_eq!(
            results,
            vec![
                KeywordTestResult {
                    name: "Bank of America".to_string(),
                    matches: true
                },
                KeywordTestResult {
                    name: "Acme Widgets".to_string(),
                    matches: false
                },
            ]
        );
    }
}
