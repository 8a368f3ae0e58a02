//! Token accounting: per-user credit balances, promo codes and the pricing
//! table that maps a request to its cost.

mod cost;
mod ledger;
mod promo;

pub(crate) use cost::{ChargeKind, CostPolicy};
pub(crate) use ledger::{DebitOutcome, Ledger, Profile};
pub(crate) use promo::{Promo, PromoRegistry, RedeemOutcome};

use serde::Deserialize;
use serde_with::{json::JsonString, serde_as};
use std::collections::BTreeMap;

fn default_starting_balance() -> u64 {
    60
}

fn default_model() -> String {
    "gpt-4o".to_owned()
}

fn default_model_costs() -> BTreeMap<String, u32> {
    [("gpt-3.5-turbo", 3), ("gpt-4o-mini", 5), ("gpt-4o", 7)]
        .into_iter()
        .map(|(model, cost)| (model.to_owned(), cost))
        .collect()
}

fn default_media_surcharge() -> u32 {
    2
}

#[serde_as]
#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Balance granted to a user the first time they are seen.
    #[serde(default = "default_starting_balance")]
    pub(crate) starting_balance: u64,

    /// `{"model-id": cost-per-message}` as a JSON object in the env var.
    #[serde_as(as = "JsonString")]
    #[serde(default = "default_model_costs")]
    pub(crate) model_costs: BTreeMap<String, u32>,

    /// Model used when the user never picked one (or picked an unknown one).
    #[serde(default = "default_model")]
    pub(crate) default_model: String,

    /// Extra tokens charged on top of the model cost for photo and document
    /// messages.
    #[serde(default = "default_media_surcharge")]
    pub(crate) media_surcharge: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            model_costs: default_model_costs(),
            default_model: default_model(),
            media_surcharge: default_media_surcharge(),
        }
    }
}
