use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use termsync_core::AccountType;

use crate::error::ProviderError;

/// Field names excluded from content hashes, per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IgnoredFields {
    pub specification: Vec<String>,
    pub position: Vec<String>,
    pub order: Vec<String>,
}

/// Ignore lists of a region, per account type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingIgnoredFieldLists {
    pub g1: IgnoredFields,
    pub g2: IgnoredFields,
}

impl HashingIgnoredFieldLists {
    pub fn for_account_type(&self, account_type: AccountType) -> &IgnoredFields {
        match account_type {
            AccountType::CloudG1 => &self.g1,
            AccountType::CloudG2 => &self.g2,
        }
    }
}

/// Source of the server-volatile field lists (normally a REST endpoint)
#[async_trait]
pub trait IgnoredFieldsProvider: Send + Sync {
    async fn hashing_ignored_field_lists(
        &self,
        region: &str,
    ) -> Result<HashingIgnoredFieldLists, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_by_account_type() {
        let lists: HashingIgnoredFieldLists = serde_json::from_str(
            r#"{"g1":{"specification":["description"],"position":["time"]},
                "g2":{"order":["currentPrice"]}}"#,
        )
        .unwrap();

        assert_eq!(
            lists.for_account_type(AccountType::CloudG1).specification,
            vec!["description"]
        );
        assert!(lists.for_account_type(AccountType::CloudG1).order.is_empty());
        assert_eq!(
            lists.for_account_type(AccountType::CloudG2).order,
            vec!["currentPrice"]
        );
    }
}
