use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xln_crypto::{CodecError, RlpValue};
use xln_core::SignerId;

/// One validator in an entity's board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub signer_id: SignerId,
    /// Weight of this validator's precommit toward the quorum.
    pub voting_power: u64,
}

/// The fixed validator set of one entity, with a designated proposer.
///
/// Commits require precommits whose combined power reaches
/// `ceil(2/3 · Σ power)`; the machine then tolerates up to
/// `⌊(Σ power − 1)/3⌋` Byzantine power.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: BTreeMap<SignerId, ValidatorInfo>,
    proposer: Option<SignerId>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator. The first one added becomes the initial proposer.
    pub fn add(&mut self, info: ValidatorInfo) {
        if self.proposer.is_none() {
            self.proposer = Some(info.signer_id.clone());
        }
        self.validators.insert(info.signer_id.clone(), info);
    }

    pub fn remove(&mut self, id: &SignerId) {
        self.validators.remove(id);
        if self.proposer.as_ref() == Some(id) {
            self.proposer = self.validators.keys().next().cloned();
        }
    }

    pub fn get(&self, id: &SignerId) -> Option<&ValidatorInfo> {
        self.validators.get(id)
    }

    pub fn is_validator(&self, id: &SignerId) -> bool {
        self.validators.contains_key(id)
    }

    pub fn power_of(&self, id: &SignerId) -> u64 {
        self.validators.get(id).map(|v| v.voting_power).unwrap_or(0)
    }

    pub fn total_power(&self) -> u64 {
        self.validators.values().map(|v| v.voting_power).sum()
    }

    /// Quorum threshold: ceil(2/3 · total power).
    pub fn quorum(&self) -> u64 {
        let total = self.total_power();
        // ceil(2n/3) = (2n + 2) / 3
        (2 * total + 2) / 3
    }

    pub fn proposer(&self) -> Option<&SignerId> {
        self.proposer.as_ref()
    }

    /// Externally driven proposer change (view change is the host's job).
    pub fn change_proposer(&mut self, new_proposer: SignerId) -> bool {
        if !self.is_validator(&new_proposer) {
            return false;
        }
        self.proposer = Some(new_proposer);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.values()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    // ── Canonical encoding ───────────────────────────────────────────────────

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::list(
                self.validators
                    .values()
                    .map(|v| {
                        RlpValue::list(vec![
                            RlpValue::bytes(v.signer_id.as_bytes().to_vec()),
                            RlpValue::uint(v.voting_power as u128),
                        ])
                    })
                    .collect(),
            ),
            match &self.proposer {
                Some(p) => RlpValue::list(vec![RlpValue::bytes(p.as_bytes().to_vec())]),
                None => RlpValue::list(vec![]),
            },
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(2)?;
        let mut validators = BTreeMap::new();
        for v in items[0].as_list()? {
            let pair = v.as_list_of(2)?;
            let signer_id = SignerId::new(pair[0].as_bytes()?.to_vec());
            validators.insert(
                signer_id.clone(),
                ValidatorInfo {
                    signer_id,
                    voting_power: pair[1].as_uint()? as u64,
                },
            );
        }
        let proposer = match items[1].as_list()? {
            [] => None,
            [p] => Some(SignerId::new(p.as_bytes()?.to_vec())),
            other => {
                return Err(CodecError::WrongItemCount {
                    expected: 1,
                    found: other.len(),
                })
            }
        };
        Ok(Self {
            validators,
            proposer,
        })
    }
}
