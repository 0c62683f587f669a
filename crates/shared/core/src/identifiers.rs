use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when parsing identifiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Invalid instance index: {0}")]
    InvalidInstanceIndex(String),

    #[error("Unknown account type: {0}")]
    UnknownAccountType(String),
}

const COMBINED_HOST: &str = "combined";

/// Identifies one running terminal replica behind an account.
///
/// Rendered as `region:number:host`, e.g. `vint-hill:0:ps-mpa-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIndex {
    /// Server region the replica runs in
    pub region: String,
    /// Replica number within the region
    pub number: u32,
    /// Host serving the replica
    pub host: String,
}

impl InstanceIndex {
    pub fn new(region: impl Into<String>, number: u32, host: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            number,
            host: host.into(),
        }
    }

    /// Pseudo instance used for the merged view of all replicas of a region
    pub fn combined(region: impl Into<String>) -> Self {
        Self::new(region, 0, COMBINED_HOST)
    }

    pub fn is_combined(&self) -> bool {
        self.host == COMBINED_HOST
    }
}

impl fmt::Display for InstanceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.region, self.number, self.host)
    }
}

impl FromStr for InstanceIndex {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let region = parts.next().filter(|region| !region.is_empty());
        let number = parts.next().and_then(|number| number.parse::<u32>().ok());
        let host = parts.next();

        match (region, number, host) {
            (Some(region), Some(number), Some(host)) => Ok(Self::new(region, number, host)),
            _ => Err(IdentifierError::InvalidInstanceIndex(s.to_string())),
        }
    }
}

impl Serialize for InstanceIndex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceIndex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Account deployment type. Hashing ignore lists differ per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "cloud-g1")]
    CloudG1,
    #[default]
    #[serde(rename = "cloud-g2")]
    CloudG2,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::CloudG1 => "cloud-g1",
            AccountType::CloudG2 => "cloud-g2",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud-g1" => Ok(AccountType::CloudG1),
            "cloud-g2" => Ok(AccountType::CloudG2),
            other => Err(IdentifierError::UnknownAccountType(other.to_string())),
        }
    }
}
