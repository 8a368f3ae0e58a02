mod billing;
mod config;
mod encoding;
mod error;
mod http;
mod observability;
mod openrouter;
mod store;
mod tg;

pub mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

/// Run the telegram bot processing loop
pub async fn run(config: Config) -> Result<()> {
    let store = store::init(&config.store).await?;

    let opts = tg::RunBotOptions {
        tg_cfg: config.tg,
        billing_cfg: config.billing,
        openrouter_cfg: config.openrouter,
        store,
    };

    tg::run_bot(opts).await
}
