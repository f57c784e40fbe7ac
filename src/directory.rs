use crate::{GroupKey, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Source of the groups that should currently be ingested.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn groups(&self) -> Result<BTreeSet<GroupKey>>;
}

/// A fixed set of groups from configuration.
pub struct StaticDirectory {
    groups: BTreeSet<GroupKey>,
}

impl StaticDirectory {
    pub fn new(groups: impl IntoIterator<Item = GroupKey>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }
}

#[async_trait]
impl GroupDirectory for StaticDirectory {
    async fn groups(&self) -> Result<BTreeSet<GroupKey>> {
        Ok(self.groups.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MatchRecord {
    match_id: serde_json::Value,
}

/// Reads the match catalog over HTTP and opens one group per match and category.
pub struct HttpMatchDirectory {
    client: reqwest::Client,
    url: String,
    categories: Vec<String>,
}

impl HttpMatchDirectory {
    pub fn new(url: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            categories,
        }
    }
}

fn expand_matches(matches: Vec<MatchRecord>, categories: &[String]) -> BTreeSet<GroupKey> {
    matches
        .into_iter()
        .filter_map(|record| match record.match_id {
            serde_json::Value::String(id) => Some(id),
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
        .flat_map(|match_id| {
            categories
                .iter()
                .map(move |category| GroupKey::new(match_id.clone(), category))
        })
        .collect()
}

#[async_trait]
impl GroupDirectory for HttpMatchDirectory {
    async fn groups(&self) -> Result<BTreeSet<GroupKey>> {
        let matches: Vec<MatchRecord> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(expand_matches(matches, &self.categories))
    }
}
