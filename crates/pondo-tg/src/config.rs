use crate::{billing, openrouter, store, tg};
use serde::de::DeserializeOwned;

pub struct Config {
    pub(crate) tg: tg::Config,
    pub(crate) store: store::Config,
    pub(crate) openrouter: openrouter::Config,
    pub(crate) billing: billing::Config,
}

impl Config {
    pub fn load_or_panic() -> Config {
        Self {
            tg: from_env_or_panic("TG_"),
            store: from_env_or_panic("STORE_"),
            openrouter: from_env_or_panic("OPENROUTER_"),
            billing: from_env_or_panic("BILLING_"),
        }
    }
}

pub(crate) fn from_env_or_panic<T: DeserializeOwned>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env().unwrap_or_else(|err| {
        panic!(
            "BUG: Couldn't load config from environment for {}: {:#?}",
            std::any::type_name::<T>(),
            err
        );
    })
}
