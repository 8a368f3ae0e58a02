use super::Ledger;
use crate::store::{DocStore, Mutation, StoreError, PROMOCODES};
use crate::{fatal, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_uses_left() -> u32 {
    1
}

#[derive(Serialize, Deserialize)]
struct StoredPromo {
    amount: u64,

    #[serde(default = "default_uses_left")]
    uses_left: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Promo {
    pub(crate) code: String,
    pub(crate) amount: u64,
    pub(crate) uses_left: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedeemOutcome {
    Redeemed { amount: u64, new_balance: u64 },
    NotFound,
    Exhausted,
}

enum Reservation {
    Reserved(u64),
    NotFound,
    Exhausted,
}

/// Promo codes: admin-created vouchers that credit a fixed amount of tokens
/// a limited number of times. Codes are case-insensitive; they are stored
/// and looked up in their upper-cased form.
#[derive(Clone)]
pub(crate) struct PromoRegistry {
    store: Arc<dyn DocStore>,
    ledger: Ledger,
}

impl PromoRegistry {
    pub(crate) fn new(store: Arc<dyn DocStore>, ledger: Ledger) -> Self {
        Self { store, ledger }
    }

    pub(crate) fn normalize(code: &str) -> String {
        code.trim().to_uppercase()
    }

    /// Create or overwrite a promo code. Re-creating an existing code resets
    /// its amount and remaining uses.
    pub(crate) async fn create(&self, code: &str, amount: u64, uses: u32) -> Result<Promo> {
        let code = Self::normalize(code);

        self.store
            .transactional_update(PROMOCODES, &code, &mut |_| {
                Ok(Mutation::Put(encode(&StoredPromo {
                    amount,
                    uses_left: uses,
                })))
            })
            .await?;

        Ok(Promo {
            code,
            amount,
            uses_left: uses,
        })
    }

    /// Redeem a code for a user. The remaining-uses counter is decremented
    /// in the same transaction that checks it, so a single-use code can't be
    /// redeemed twice even under concurrent attempts. The user is credited
    /// right after the reservation commits.
    pub(crate) async fn redeem(&self, user_id: u64, code: &str) -> Result<RedeemOutcome> {
        let code = Self::normalize(code);
        let mut reserved = None;

        self.store
            .transactional_update(PROMOCODES, &code, &mut |doc| {
                let Some(doc) = doc else {
                    reserved = Some(Reservation::NotFound);
                    return Ok(Mutation::Keep);
                };

                let mut promo = decode(&code, doc)?;

                if promo.uses_left == 0 {
                    reserved = Some(Reservation::Exhausted);
                    return Ok(Mutation::Keep);
                }

                promo.uses_left -= 1;
                reserved = Some(Reservation::Reserved(promo.amount));

                // Exhausted codes are kept at zero uses rather than deleted,
                // so later attempts report "exhausted" instead of "not found"
                Ok(Mutation::Put(encode(&promo)))
            })
            .await?;

        let amount = match reserved {
            Some(Reservation::Reserved(amount)) => amount,
            Some(Reservation::Exhausted) => return Ok(RedeemOutcome::Exhausted),
            Some(Reservation::NotFound) => return Ok(RedeemOutcome::NotFound),
            None => return Err(fatal!("Redeem transaction finished without an outcome")),
        };

        let new_balance = self
            .ledger
            .credit(user_id, i64::try_from(amount).unwrap_or(i64::MAX))
            .await?;

        Ok(RedeemOutcome::Redeemed {
            amount,
            new_balance,
        })
    }

    /// Remove a code entirely. Returns `false` if it didn't exist.
    pub(crate) async fn delete(&self, code: &str) -> Result<bool> {
        self.store
            .delete(PROMOCODES, &Self::normalize(code))
            .await
    }

    /// All codes that still have uses left.
    pub(crate) async fn list(&self) -> Result<Vec<Promo>> {
        let docs = self.store.list(PROMOCODES).await?;

        let mut promos = Vec::with_capacity(docs.len());
        for (code, doc) in docs {
            let stored = decode(&code, doc)?;
            if stored.uses_left > 0 {
                promos.push(Promo {
                    code,
                    amount: stored.amount,
                    uses_left: stored.uses_left,
                });
            }
        }

        Ok(promos)
    }
}

fn decode(code: &str, doc: serde_json::Value) -> Result<StoredPromo> {
    serde_json::from_value(doc).map_err(|source| {
        crate::err!(StoreError::CorruptDoc {
            collection: PROMOCODES.to_owned(),
            id: code.to_owned(),
            source,
        })
    })
}

fn encode(promo: &StoredPromo) -> serde_json::Value {
    serde_json::json!(promo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    fn registry() -> PromoRegistry {
        let store: Arc<dyn DocStore> = Arc::new(MemoryStore::default());
        let ledger = Ledger::new(store.clone(), 60);
        PromoRegistry::new(store, ledger)
    }

    #[tokio::test]
    async fn redeem_credits_the_user() {
        let promos = registry();
        promos.create("welcome", 40, 2).await.unwrap();

        assert_matches!(
            promos.redeem(1, "Welcome").await.unwrap(),
            RedeemOutcome::Redeemed { amount: 40, new_balance: 100 }
        );
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let promos = registry();

        assert_matches!(
            promos.redeem(1, "NOPE").await.unwrap(),
            RedeemOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn used_up_code_reports_exhausted() {
        let promos = registry();
        promos.create("once", 10, 1).await.unwrap();

        assert_matches!(
            promos.redeem(1, "ONCE").await.unwrap(),
            RedeemOutcome::Redeemed { .. }
        );
        assert_matches!(
            promos.redeem(2, "ONCE").await.unwrap(),
            RedeemOutcome::Exhausted
        );
    }

    #[test_log::test(tokio::test)]
    async fn single_use_code_is_redeemed_at_most_once_under_contention() {
        let promos = registry();
        promos.create("race", 10, 1).await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|user_id| {
                let promos = promos.clone();
                tokio::spawn(async move { promos.redeem(user_id, "RACE").await })
            })
            .collect();

        let mut redeemed = 0;
        for task in tasks {
            if let RedeemOutcome::Redeemed { .. } = task.await.unwrap().unwrap() {
                redeemed += 1;
            }
        }

        assert_eq!(redeemed, 1);
    }

    #[tokio::test]
    async fn recreating_a_code_resets_it() {
        let promos = registry();
        promos.create("boost", 10, 1).await.unwrap();
        promos.redeem(1, "BOOST").await.unwrap();

        promos.create("boost", 20, 3).await.unwrap();

        assert_matches!(
            promos.redeem(2, "BOOST").await.unwrap(),
            RedeemOutcome::Redeemed { amount: 20, .. }
        );
    }

    #[tokio::test]
    async fn list_skips_exhausted_codes() {
        let promos = registry();
        promos.create("alive", 10, 2).await.unwrap();
        promos.create("dead", 10, 1).await.unwrap();
        promos.redeem(1, "DEAD").await.unwrap();

        let listed = promos.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].code, "ALIVE");
        assert_eq!(listed[0].uses_left, 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let promos = registry();
        promos.create("gone", 10, 1).await.unwrap();

        assert!(promos.delete("gone").await.unwrap());
        assert!(!promos.delete("gone").await.unwrap());
        assert_matches!(
            promos.redeem(1, "GONE").await.unwrap(),
            RedeemOutcome::NotFound
        );
    }
}
