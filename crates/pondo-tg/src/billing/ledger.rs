use crate::store::{DocStore, Mutation, StoreError, USERS};
use crate::{fatal, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-user state as it is stored in the `users` collection. The `tokens`
/// field may be missing in documents written by older deployments, in which
/// case the user is treated as never charged.
#[derive(Serialize, Deserialize, Default)]
struct StoredProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    memory: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

/// A user profile with the balance resolved against the starting balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Profile {
    pub(crate) tokens: u64,
    pub(crate) memory: String,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebitOutcome {
    Charged { cost: u32, remaining: u64 },
    InsufficientFunds { balance: u64 },
}

/// The credit ledger. Every balance change goes through a transactional
/// update of the user's document, so concurrent charges of the same user
/// can't double-spend.
#[derive(Clone)]
pub(crate) struct Ledger {
    store: Arc<dyn DocStore>,
    starting_balance: u64,
}

impl Ledger {
    pub(crate) fn new(store: Arc<dyn DocStore>, starting_balance: u64) -> Self {
        Self {
            store,
            starting_balance,
        }
    }

    /// The user's profile. The account is provisioned (and persisted) with
    /// the starting balance the first time it is observed, so later changes
    /// to the configured starting balance don't touch existing users.
    pub(crate) async fn profile(&self, user_id: u64) -> Result<Profile> {
        let id = user_id.to_string();
        let starting_balance = self.starting_balance;
        let mut profile = None;

        self.store
            .transactional_update(USERS, &id, &mut |doc| {
                let existed = doc.is_some();
                let resolved = resolve(&id, doc, starting_balance)?;
                profile = Some(resolved.clone());

                if existed {
                    return Ok(Mutation::Keep);
                }

                Ok(Mutation::Put(encode(resolved)))
            })
            .await?;

        profile.ok_or_else(|| fatal!("Profile transaction finished without an outcome"))
    }

    pub(crate) async fn balance(&self, user_id: u64) -> Result<u64> {
        Ok(self.profile(user_id).await?.tokens)
    }

    /// Atomically subtract `cost` from the user's balance. The balance is
    /// left untouched when it doesn't cover the cost.
    pub(crate) async fn debit(&self, user_id: u64, cost: u32) -> Result<DebitOutcome> {
        let mut outcome = None;

        self.update_profile(user_id, &mut |profile| {
            if profile.tokens < u64::from(cost) {
                outcome = Some(DebitOutcome::InsufficientFunds {
                    balance: profile.tokens,
                });
                return false;
            }

            profile.tokens -= u64::from(cost);
            outcome = Some(DebitOutcome::Charged {
                cost,
                remaining: profile.tokens,
            });
            true
        })
        .await?;

        outcome.ok_or_else(|| fatal!("Debit transaction finished without an outcome"))
    }

    /// Atomically add `delta` tokens to the user's balance. Negative deltas
    /// floor the balance at zero. Returns the new balance.
    pub(crate) async fn credit(&self, user_id: u64, delta: i64) -> Result<u64> {
        let mut new_balance = None;

        self.update_profile(user_id, &mut |profile| {
            profile.tokens = match u64::try_from(delta) {
                Ok(delta) => profile.tokens.saturating_add(delta),
                Err(_) => profile.tokens.saturating_sub(delta.unsigned_abs()),
            };
            new_balance = Some(profile.tokens);
            true
        })
        .await?;

        new_balance.ok_or_else(|| fatal!("Credit transaction finished without an outcome"))
    }

    /// Return a previously charged cost to the user.
    pub(crate) async fn refund(&self, user_id: u64, cost: u32) -> Result<u64> {
        self.credit(user_id, i64::from(cost)).await
    }

    pub(crate) async fn set_model(&self, user_id: u64, model: String) -> Result<()> {
        self.update_profile(user_id, &mut |profile| {
            profile.model = Some(model.clone());
            true
        })
        .await
    }

    /// Replace the user's memory note. The note is injected into the system
    /// prompt of every completion request.
    pub(crate) async fn set_memory(&self, user_id: u64, memory: String) -> Result<()> {
        self.update_profile(user_id, &mut |profile| {
            profile.memory = memory.clone();
            true
        })
        .await
    }

    pub(crate) async fn clear_memory(&self, user_id: u64) -> Result<()> {
        self.set_memory(user_id, String::new()).await
    }

    async fn update_profile(
        &self,
        user_id: u64,
        mutate: &mut (dyn FnMut(&mut Profile) -> bool + Send),
    ) -> Result<()> {
        let id = user_id.to_string();
        let starting_balance = self.starting_balance;

        self.store
            .transactional_update(USERS, &id, &mut |doc| {
                let mut profile = resolve(&id, doc, starting_balance)?;

                if !mutate(&mut profile) {
                    return Ok(Mutation::Keep);
                }

                Ok(Mutation::Put(encode(profile)))
            })
            .await
    }
}

fn resolve(id: &str, doc: Option<serde_json::Value>, starting_balance: u64) -> Result<Profile> {
    let stored = match doc {
        Some(doc) => {
            serde_json::from_value::<StoredProfile>(doc).map_err(|source| {
                crate::err!(StoreError::CorruptDoc {
                    collection: USERS.to_owned(),
                    id: id.to_owned(),
                    source,
                })
            })?
        }
        None => StoredProfile::default(),
    };

    Ok(Profile {
        tokens: stored.tokens.unwrap_or(starting_balance),
        memory: stored.memory,
        model: stored.model,
    })
}

fn encode(profile: Profile) -> serde_json::Value {
    let stored = StoredProfile {
        tokens: Some(profile.tokens),
        memory: profile.memory,
        model: profile.model,
    };

    // StoredProfile contains nothing that can fail to serialize
    serde_json::json!(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::default()), 60)
    }

    #[tokio::test]
    async fn fresh_user_starts_with_the_default_balance() {
        let ledger = ledger();
        assert_eq!(ledger.balance(1).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn balance_persists_the_provisioned_account() {
        let store: Arc<dyn DocStore> = Arc::new(MemoryStore::default());
        let ledger = Ledger::new(store.clone(), 60);

        assert_eq!(ledger.balance(1).await.unwrap(), 60);

        let doc = store.read(USERS, "1").await.unwrap();
        assert_eq!(doc, Some(serde_json::json!({ "tokens": 60 })));

        // Accounts provisioned earlier keep their balance when the
        // configured starting balance changes
        let ledger = Ledger::new(store, 100);
        assert_eq!(ledger.balance(1).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn debit_charges_until_funds_run_out() {
        let ledger = ledger();

        assert_matches!(
            ledger.debit(1, 7).await.unwrap(),
            DebitOutcome::Charged { cost: 7, remaining: 53 }
        );

        assert_matches!(
            ledger.debit(1, 60).await.unwrap(),
            DebitOutcome::InsufficientFunds { balance: 53 }
        );

        // The failed debit didn't change the balance
        assert_eq!(ledger.balance(1).await.unwrap(), 53);
    }

    #[tokio::test]
    async fn debit_allows_spending_down_to_zero() {
        let ledger = ledger();

        assert_matches!(
            ledger.debit(1, 60).await.unwrap(),
            DebitOutcome::Charged { cost: 60, remaining: 0 }
        );
        assert_matches!(
            ledger.debit(1, 1).await.unwrap(),
            DebitOutcome::InsufficientFunds { balance: 0 }
        );
    }

    #[tokio::test]
    async fn credit_floors_the_balance_at_zero() {
        let ledger = ledger();

        assert_eq!(ledger.credit(1, -1000).await.unwrap(), 0);
        assert_eq!(ledger.credit(1, 25).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn refund_restores_a_charged_cost() {
        let ledger = ledger();

        ledger.debit(1, 7).await.unwrap();
        assert_eq!(ledger.refund(1, 7).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn memory_and_model_survive_balance_changes() {
        let ledger = ledger();

        ledger.set_memory(1, "speaks Esperanto".to_owned()).await.unwrap();
        ledger.set_model(1, "gpt-4o-mini".to_owned()).await.unwrap();
        ledger.debit(1, 5).await.unwrap();

        let profile = ledger.profile(1).await.unwrap();
        assert_eq!(profile.tokens, 55);
        assert_eq!(profile.memory, "speaks Esperanto");
        assert_eq!(profile.model.as_deref(), Some("gpt-4o-mini"));

        ledger.clear_memory(1).await.unwrap();
        assert_eq!(ledger.profile(1).await.unwrap().memory, "");
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_debits_never_double_spend() {
        let ledger = ledger();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.debit(1, 5).await })
            })
            .collect();

        let mut charged = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                DebitOutcome::Charged { .. } => charged += 1,
                DebitOutcome::InsufficientFunds { .. } => rejected += 1,
            }
        }

        // 60 tokens cover exactly 12 charges of 5
        assert_eq!(charged, 12);
        assert_eq!(rejected, 8);
        assert_eq!(ledger.balance(1).await.unwrap(), 0);
    }
}
