//! Fulfillments
//!
//! A fulfillment is the proof matching a [`Condition`]. Deriving the condition
//! from a fulfillment and checking the proof are separate steps so that a
//! structurally broken fulfillment can never be mistaken for a valid one.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use super::types::{
    Condition, ConditionError, ConditionType, ED25519_COST, MAX_COST, THRESHOLD_SUBCONDITION_COST,
};

/// Nested threshold fulfillments deeper than this are refused
pub const MAX_DEPTH: usize = 16;

/// Proof data for a condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Fulfillment {
    #[serde(rename = "preimage-sha-256")]
    PreimageSha256 {
        #[serde(with = "b64")]
        preimage: Vec<u8>,
    },

    #[serde(rename = "ed25519-sha-256")]
    Ed25519Sha256 {
        #[serde(with = "b64")]
        public_key: Vec<u8>,
        #[serde(with = "b64")]
        signature: Vec<u8>,
    },

    #[serde(rename = "threshold-sha-256")]
    ThresholdSha256 {
        threshold: u32,
        /// Satisfied children
        subfulfillments: Vec<Fulfillment>,
        /// Children left unsatisfied, given only by their conditions
        #[serde(default)]
        subconditions: Vec<Condition>,
    },
}

impl Fulfillment {
    pub fn preimage(preimage: impl Into<Vec<u8>>) -> Self {
        Fulfillment::PreimageSha256 {
            preimage: preimage.into(),
        }
    }

    pub fn kind(&self) -> ConditionType {
        match self {
            Fulfillment::PreimageSha256 { .. } => ConditionType::PreimageSha256,
            Fulfillment::Ed25519Sha256 { .. } => ConditionType::Ed25519Sha256,
            Fulfillment::ThresholdSha256 { .. } => ConditionType::ThresholdSha256,
        }
    }

    /// Derive the condition this fulfillment claims to satisfy
    pub fn condition(&self) -> Result<Condition, ConditionError> {
        self.condition_at(0)
    }

    fn condition_at(&self, depth: usize) -> Result<Condition, ConditionError> {
        if depth > MAX_DEPTH {
            return Err(ConditionError::InvalidFulfillment(
                "nesting too deep".to_string(),
            ));
        }

        match self {
            Fulfillment::PreimageSha256 { preimage } => Ok(Condition::new(
                ConditionType::PreimageSha256,
                Sha256::digest(preimage).into(),
                preimage.len() as u64,
            )),
            Fulfillment::Ed25519Sha256 { public_key, .. } => {
                if public_key.len() != 32 {
                    return Err(ConditionError::InvalidFulfillment(
                        "ed25519 public key must be 32 bytes".to_string(),
                    ));
                }
                Ok(Condition::new(
                    ConditionType::Ed25519Sha256,
                    Sha256::digest(public_key).into(),
                    ED25519_COST,
                ))
            }
            Fulfillment::ThresholdSha256 {
                threshold,
                subfulfillments,
                subconditions,
            } => {
                let mut children = Vec::with_capacity(subfulfillments.len() + subconditions.len());
                for sub in subfulfillments {
                    children.push(sub.condition_at(depth + 1)?);
                }
                children.extend(subconditions.iter().cloned());
                threshold_condition(*threshold, &children)
            }
        }
    }

    /// Check the proof itself against `message`
    fn validate(&self, message: &[u8], depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }

        match self {
            // The hash commitment is the whole proof
            Fulfillment::PreimageSha256 { .. } => true,
            Fulfillment::Ed25519Sha256 {
                public_key,
                signature,
            } => {
                let Ok(key_bytes) = <[u8; 32]>::try_from(public_key.as_slice()) else {
                    return false;
                };
                let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.as_slice()) else {
                    return false;
                };
                let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
                    return false;
                };
                key.verify(message, &Signature::from_bytes(&sig_bytes))
                    .is_ok()
            }
            Fulfillment::ThresholdSha256 {
                threshold,
                subfulfillments,
                ..
            } => {
                if subfulfillments.len() < *threshold as usize {
                    return false;
                }
                subfulfillments
                    .iter()
                    .all(|sub| sub.validate(message, depth + 1))
            }
        }
    }

    /// `cf:<type id>:<base64url payload>` for the flat fulfillment types
    pub fn to_uri(&self) -> Option<String> {
        match self {
            Fulfillment::PreimageSha256 { preimage } => {
                Some(format!("cf:0:{}", URL_SAFE_NO_PAD.encode(preimage)))
            }
            Fulfillment::Ed25519Sha256 {
                public_key,
                signature,
            } => {
                let mut payload = public_key.clone();
                payload.extend_from_slice(signature);
                Some(format!("cf:4:{}", URL_SAFE_NO_PAD.encode(payload)))
            }
            Fulfillment::ThresholdSha256 { .. } => None,
        }
    }
}

impl FromStr for Fulfillment {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some("cf"), Some(type_id), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ConditionError::InvalidFulfillment(s.to_string()));
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ConditionError::InvalidFulfillment("bad base64url payload".to_string()))?;

        match type_id {
            "0" => Ok(Fulfillment::PreimageSha256 { preimage: bytes }),
            "4" if bytes.len() == 96 => Ok(Fulfillment::Ed25519Sha256 {
                public_key: bytes[..32].to_vec(),
                signature: bytes[32..].to_vec(),
            }),
            "4" => Err(ConditionError::InvalidFulfillment(
                "ed25519 payload must be 96 bytes".to_string(),
            )),
            other => Err(ConditionError::UnknownType(other.to_string())),
        }
    }
}

/// Build the condition of a threshold over `children`
pub fn threshold_condition(
    threshold: u32,
    children: &[Condition],
) -> Result<Condition, ConditionError> {
    if threshold == 0 || threshold as usize > children.len() {
        return Err(ConditionError::InvalidFulfillment(format!(
            "threshold {} over {} subconditions",
            threshold,
            children.len()
        )));
    }

    // Order-independent: children are hashed in canonical byte order
    let mut encoded: Vec<Vec<u8>> = children.iter().map(Condition::canonical_bytes).collect();
    encoded.sort();

    let mut hasher = Sha256::new();
    hasher.update(threshold.to_be_bytes());
    hasher.update((encoded.len() as u32).to_be_bytes());
    for child in &encoded {
        hasher.update(child);
    }

    let mut costs: Vec<u64> = children.iter().map(|c| c.cost).collect();
    costs.sort_unstable_by(|a, b| b.cmp(a));
    let cost = costs
        .iter()
        .take(threshold as usize)
        .fold(0u64, |acc, c| acc.saturating_add(*c))
        .saturating_add(THRESHOLD_SUBCONDITION_COST.saturating_mul(children.len() as u64));

    Ok(Condition::new(
        ConditionType::ThresholdSha256,
        hasher.finalize().into(),
        cost,
    ))
}

/// Does `fulfillment` satisfy `condition`?
///
/// Never fails: any structural problem with the fulfillment is a `false`.
pub fn verify(condition: &Condition, fulfillment: &Fulfillment) -> bool {
    let derived = match fulfillment.condition() {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Fulfillment is malformed");
            return false;
        }
    };

    if derived.cost > MAX_COST || derived != *condition {
        return false;
    }

    fulfillment.validate(b"", 0)
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn ed25519_pair() -> (Fulfillment, Condition) {
        let key = SigningKey::generate(&mut OsRng);
        let signature = key.sign(b"");
        let ful = Fulfillment::Ed25519Sha256 {
            public_key: key.verifying_key().to_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        };
        let cond = ful.condition().unwrap();
        (ful, cond)
    }

    #[test]
    fn test_preimage_verifies() {
        let ful = Fulfillment::preimage(b"hello world".to_vec());
        let cond = ful.condition().unwrap();
        assert_eq!(cond.kind, ConditionType::PreimageSha256);
        assert_eq!(cond.cost, 11);
        assert!(verify(&cond, &ful));
        assert!(!verify(&cond, &Fulfillment::preimage(b"hello there".to_vec())));
    }

    #[test]
    fn test_preimage_cost_must_match() {
        let ful = Fulfillment::preimage(b"abc".to_vec());
        let mut cond = ful.condition().unwrap();
        cond.cost = 4;
        assert!(!verify(&cond, &ful));
    }

    #[test]
    fn test_ed25519_verifies_and_rejects_bad_signature() {
        let (ful, cond) = ed25519_pair();
        assert!(verify(&cond, &ful));

        let Fulfillment::Ed25519Sha256 {
            public_key,
            mut signature,
        } = ful
        else {
            unreachable!()
        };
        signature[0] ^= 0xff;
        let tampered = Fulfillment::Ed25519Sha256 {
            public_key,
            signature,
        };
        assert!(!verify(&cond, &tampered));
    }

    #[test]
    fn test_ed25519_malformed_is_false() {
        let (_, cond) = ed25519_pair();
        let short = Fulfillment::Ed25519Sha256 {
            public_key: vec![1, 2, 3],
            signature: vec![0; 64],
        };
        assert!(!verify(&cond, &short));
    }

    #[test]
    fn test_threshold_two_of_three() {
        let a = Fulfillment::preimage(b"a".to_vec());
        let b = Fulfillment::preimage(b"bb".to_vec());
        let c = Fulfillment::preimage(b"ccc".to_vec());
        let all = [
            a.condition().unwrap(),
            b.condition().unwrap(),
            c.condition().unwrap(),
        ];
        let cond = threshold_condition(2, &all).unwrap();
        // largest two costs (3 + 2) plus 3 * 1024
        assert_eq!(cond.cost, 5 + 3 * 1024);

        let ful = Fulfillment::ThresholdSha256 {
            threshold: 2,
            subfulfillments: vec![c.clone(), a.clone()],
            subconditions: vec![all[1].clone()],
        };
        assert!(verify(&cond, &ful));

        let not_enough = Fulfillment::ThresholdSha256 {
            threshold: 2,
            subfulfillments: vec![a],
            subconditions: vec![all[1].clone(), all[2].clone()],
        };
        assert!(!verify(&cond, &not_enough));
    }

    #[test]
    fn test_threshold_and_composite_with_signature() {
        let secret = Fulfillment::preimage(b"secret".to_vec());
        let (sig, sig_cond) = ed25519_pair();
        let cond = threshold_condition(2, &[secret.condition().unwrap(), sig_cond]).unwrap();

        let ful = Fulfillment::ThresholdSha256 {
            threshold: 2,
            subfulfillments: vec![sig, secret],
            subconditions: vec![],
        };
        assert!(verify(&cond, &ful));
    }

    #[test]
    fn test_threshold_zero_is_malformed() {
        let ful = Fulfillment::ThresholdSha256 {
            threshold: 0,
            subfulfillments: vec![],
            subconditions: vec![],
        };
        assert!(ful.condition().is_err());
        let cond = Condition::new(ConditionType::ThresholdSha256, [0u8; 32], 0);
        assert!(!verify(&cond, &ful));
    }

    #[test]
    fn test_excessive_nesting_is_false() {
        let mut ful = Fulfillment::preimage(b"x".to_vec());
        for _ in 0..(MAX_DEPTH + 2) {
            ful = Fulfillment::ThresholdSha256 {
                threshold: 1,
                subfulfillments: vec![ful],
                subconditions: vec![],
            };
        }
        assert!(ful.condition().is_err());
    }

    #[test]
    fn test_uri_forms() {
        let ful: Fulfillment = "cf:0:aGVsbG8".parse().unwrap();
        assert_eq!(ful, Fulfillment::preimage(b"hello".to_vec()));
        assert_eq!(ful.to_uri().unwrap(), "cf:0:aGVsbG8");

        let (sig, _) = ed25519_pair();
        let reparsed: Fulfillment = sig.to_uri().unwrap().parse().unwrap();
        assert_eq!(reparsed, sig);

        assert!("cf:9:aGVsbG8".parse::<Fulfillment>().is_err());
        assert!("cc:0:aGVsbG8".parse::<Fulfillment>().is_err());
        assert!("cf:4:aGVsbG8".parse::<Fulfillment>().is_err());
    }

    #[test]
    fn test_json_shape() {
        let ful = Fulfillment::preimage(b"hello".to_vec());
        let json = serde_json::to_value(&ful).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "preimage-sha-256", "preimage": "aGVsbG8"})
        );
        let back: Fulfillment = serde_json::from_value(json).unwrap();
        assert_eq!(back, ful);
    }
}
