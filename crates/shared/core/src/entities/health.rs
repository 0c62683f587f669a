use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-side health flags reported with `status` packets.
///
/// The set of flags depends on the enabled server features, so unknown keys are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest_api_healthy: Option<bool>,

    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl HealthStatus {
    /// False if any reported boolean flag is false
    pub fn is_healthy(&self) -> bool {
        self.rest_api_healthy != Some(false)
            && self
                .other
                .values()
                .all(|value| value.as_bool() != Some(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_flags_are_kept() {
        let status: HealthStatus = serde_json::from_str(
            r#"{"restApiHealthy":true,"copyFactorySubscriberHealthy":false}"#,
        )
        .unwrap();

        assert_eq!(status.rest_api_healthy, Some(true));
        assert!(status.other.contains_key("copyFactorySubscriberHealthy"));
        assert!(!status.is_healthy());
    }
}
