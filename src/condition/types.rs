//! Condition descriptors
//!
//! A condition is a commitment to a fulfillment: the fulfillment type, a
//! SHA-256 fingerprint of its public contents and the cost of verifying it.
//! Conditions travel as `ni:` URIs:
//!
//! ```text
//! ni:///sha-256;<base64url fingerprint>?fpt=preimage-sha-256&cost=12
//! ```

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Conditions more expensive than this are refused outright
pub const MAX_COST: u64 = 2 * 1024 * 1024;

/// Fixed verification cost of an Ed25519 signature
pub const ED25519_COST: u64 = 131_072;

/// Per-subcondition surcharge of a threshold condition
pub const THRESHOLD_SUBCONDITION_COST: u64 = 1024;

/// Condition parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("Invalid condition URI: {0}")]
    InvalidUri(String),

    #[error("Unknown condition type: {0}")]
    UnknownType(String),

    #[error("Invalid fingerprint encoding")]
    InvalidFingerprint,

    #[error("Invalid cost: {0}")]
    InvalidCost(String),

    #[error("Invalid fulfillment: {0}")]
    InvalidFulfillment(String),
}

/// Supported condition types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConditionType {
    PreimageSha256 = 0,
    ThresholdSha256 = 2,
    Ed25519Sha256 = 4,
}

impl ConditionType {
    #[inline]
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ConditionType::PreimageSha256),
            2 => Some(ConditionType::ThresholdSha256),
            4 => Some(ConditionType::Ed25519Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::PreimageSha256 => "preimage-sha-256",
            ConditionType::ThresholdSha256 => "threshold-sha-256",
            ConditionType::Ed25519Sha256 => "ed25519-sha-256",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConditionType {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preimage-sha-256" => Ok(ConditionType::PreimageSha256),
            "threshold-sha-256" => Ok(ConditionType::ThresholdSha256),
            "ed25519-sha-256" => Ok(ConditionType::Ed25519Sha256),
            other => Err(ConditionError::UnknownType(other.to_string())),
        }
    }
}

/// A cryptographic condition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition {
    pub kind: ConditionType,
    pub fingerprint: [u8; 32],
    pub cost: u64,
}

impl Condition {
    pub fn new(kind: ConditionType, fingerprint: [u8; 32], cost: u64) -> Self {
        Self {
            kind,
            fingerprint,
            cost,
        }
    }

    /// Binary form used when hashing a threshold condition's children
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 8);
        out.push(self.kind.id());
        out.extend_from_slice(&self.fingerprint);
        out.extend_from_slice(&self.cost.to_be_bytes());
        out
    }

    pub fn to_uri(&self) -> String {
        format!(
            "ni:///sha-256;{}?fpt={}&cost={}",
            URL_SAFE_NO_PAD.encode(self.fingerprint),
            self.kind,
            self.cost
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("ni:///sha-256;")
            .ok_or_else(|| ConditionError::InvalidUri(s.to_string()))?;
        let (digest, query) = rest
            .split_once('?')
            .ok_or_else(|| ConditionError::InvalidUri(s.to_string()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(digest)
            .map_err(|_| ConditionError::InvalidFingerprint)?;
        let fingerprint: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConditionError::InvalidFingerprint)?;

        let mut kind = None;
        let mut cost = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("fpt", v)) => kind = Some(v.parse::<ConditionType>()?),
                Some(("cost", v)) => {
                    cost = Some(
                        v.parse::<u64>()
                            .map_err(|_| ConditionError::InvalidCost(v.to_string()))?,
                    )
                }
                // subtypes and future parameters are informational
                _ => {}
            }
        }

        let kind = kind.ok_or_else(|| ConditionError::InvalidUri(s.to_string()))?;
        let cost = cost.ok_or_else(|| ConditionError::InvalidCost("missing".to_string()))?;
        Ok(Condition::new(kind, fingerprint, cost))
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_uri())
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
