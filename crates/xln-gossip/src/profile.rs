//! Gossip profiles and the last-write-wins store.
//!
//! A profile is authored only by its entity and carries a monotonically
//! increasing timestamp. Every other node holds a read-only copy that is
//! replaced exactly when a strictly newer timestamp arrives, which makes the
//! store a CRDT: any delivery order converges to the same map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use xln_crypto::{CodecError, RlpValue};

use xln_account::AccountMachine;
use xln_core::{EntityId, Timestamp, TokenId};

// ── Capacity advertisement ───────────────────────────────────────────────────

/// Spendable capacity in each direction for one token of one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCapacity {
    pub send_cap: u128,
    pub recv_cap: u128,
}

/// Advertised capacities toward one counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub counterparty: EntityId,
    pub capacities: BTreeMap<TokenId, TokenCapacity>,
}

/// Extract the capacity summary a profile advertises for one account.
pub fn capacity_summary(machine: &AccountMachine) -> AccountCapacity {
    let is_left = machine.is_left();
    let mut capacities = BTreeMap::new();
    for (token, delta) in machine.state.ledger.iter() {
        let send = delta.max_send(is_left).max(0) as u128;
        let recv = delta.max_receive(is_left).max(0) as u128;
        if send == 0 && recv == 0 {
            continue;
        }
        capacities.insert(
            token.clone(),
            TokenCapacity {
                send_cap: send,
                recv_cap: recv,
            },
        );
    }
    AccountCapacity {
        counterparty: machine.counterparty.clone(),
        capacities,
    }
}

// ── Profile ──────────────────────────────────────────────────────────────────

/// An entity's self-description: capabilities, hub links, metadata, and the
/// capacity summaries of its accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub entity_id: EntityId,
    pub capabilities: Vec<String>,
    pub hubs: Vec<EntityId>,
    pub metadata: BTreeMap<String, String>,
    pub accounts: Vec<AccountCapacity>,
    pub timestamp: Timestamp,
}

impl Profile {
    pub fn new(entity_id: EntityId, timestamp: Timestamp) -> Self {
        Self {
            entity_id,
            capabilities: Vec::new(),
            hubs: Vec::new(),
            metadata: BTreeMap::new(),
            accounts: Vec::new(),
            timestamp,
        }
    }

    /// Numeric metadata lookup for fee policy keys ("base_fee", "fee_ppm").
    pub fn metadata_u128(&self, key: &str) -> u128 {
        self.metadata
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn to_rlp(&self) -> RlpValue {
        RlpValue::list(vec![
            RlpValue::bytes(self.entity_id.as_bytes().to_vec()),
            RlpValue::list(self.capabilities.iter().map(|c| RlpValue::str(c)).collect()),
            RlpValue::list(
                self.hubs
                    .iter()
                    .map(|h| RlpValue::bytes(h.as_bytes().to_vec()))
                    .collect(),
            ),
            RlpValue::list(
                self.metadata
                    .iter()
                    .map(|(k, v)| RlpValue::list(vec![RlpValue::str(k), RlpValue::str(v)]))
                    .collect(),
            ),
            RlpValue::list(
                self.accounts
                    .iter()
                    .map(|a| {
                        RlpValue::list(vec![
                            RlpValue::bytes(a.counterparty.as_bytes().to_vec()),
                            RlpValue::list(
                                a.capacities
                                    .iter()
                                    .map(|(t, c)| {
                                        RlpValue::list(vec![
                                            RlpValue::bytes(t.as_bytes().to_vec()),
                                            RlpValue::uint(c.send_cap),
                                            RlpValue::uint(c.recv_cap),
                                        ])
                                    })
                                    .collect(),
                            ),
                        ])
                    })
                    .collect(),
            ),
            RlpValue::int(self.timestamp as i128),
        ])
    }

    pub fn from_rlp(value: &RlpValue) -> Result<Self, CodecError> {
        let items = value.as_list_of(6)?;
        let mut metadata = BTreeMap::new();
        for pair in items[3].as_list()? {
            let pair = pair.as_list_of(2)?;
            metadata.insert(pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string());
        }
        let mut accounts = Vec::new();
        for acc in items[4].as_list()? {
            let acc = acc.as_list_of(2)?;
            let mut capacities = BTreeMap::new();
            for cap in acc[1].as_list()? {
                let cap = cap.as_list_of(3)?;
                capacities.insert(
                    TokenId::new(cap[0].as_bytes()?.to_vec()),
                    TokenCapacity {
                        send_cap: cap[1].as_uint()?,
                        recv_cap: cap[2].as_uint()?,
                    },
                );
            }
            accounts.push(AccountCapacity {
                counterparty: EntityId::new(acc[0].as_bytes()?.to_vec()),
                capacities,
            });
        }
        Ok(Self {
            entity_id: EntityId::new(items[0].as_bytes()?.to_vec()),
            capabilities: items[1]
                .as_list()?
                .iter()
                .map(|c| Ok(c.as_str()?.to_string()))
                .collect::<Result<_, CodecError>>()?,
            hubs: items[2]
                .as_list()?
                .iter()
                .map(|h| Ok(EntityId::new(h.as_bytes()?.to_vec())))
                .collect::<Result<_, CodecError>>()?,
            metadata,
            accounts,
            timestamp: items[5].as_int()? as Timestamp,
        })
    }
}

// ── ProfileStore ─────────────────────────────────────────────────────────────

/// Last-write-wins profile map keyed by entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileStore {
    profiles: BTreeMap<EntityId, Profile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `profile` iff its timestamp is strictly greater than the
    /// stored copy's. Returns whether the store changed.
    pub fn upsert(&mut self, profile: Profile) -> bool {
        match self.profiles.get(&profile.entity_id) {
            Some(existing) if existing.timestamp >= profile.timestamp => {
                debug!(entity = %profile.entity_id, "stale profile ignored");
                false
            }
            _ => {
                self.profiles.insert(profile.entity_id.clone(), profile);
                true
            }
        }
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&Profile> {
        self.profiles.get(entity_id)
    }

    /// Profiles in canonical (entity id) order.
    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
