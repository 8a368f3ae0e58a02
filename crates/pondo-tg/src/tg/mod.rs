//! Telegram bot root module

mod chat;
mod cmd;
mod config;

use crate::billing::{CostPolicy, Ledger, PromoRegistry};
use crate::openrouter::CompletionService;
use crate::prelude::*;
use crate::store::DocStore;
use crate::{billing, encoding, fatal, http, openrouter, Result};
use dptree::di::DependencyMap;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, User};
use teloxide::utils::command::BotCommands;

pub(crate) use config::{AdminPolicy, Config};

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) struct Ctx {
    bot: Bot,
    cfg: Arc<Config>,
    http: http::Client,
    admins: AdminPolicy,
    ledger: Ledger,
    promos: PromoRegistry,
    costs: CostPolicy,
    completions: CompletionService,
}

pub(crate) struct RunBotOptions {
    pub(crate) tg_cfg: Config,
    pub(crate) billing_cfg: billing::Config,
    pub(crate) openrouter_cfg: openrouter::Config,
    pub(crate) store: Arc<dyn DocStore>,
}

pub(crate) fn expect_sender(msg: &Message) -> Result<&User> {
    msg.from()
        .ok_or_else(|| fatal!("The message has no sender"))
}

pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let mut di = DependencyMap::new();

    let http = http::create_client();

    let bot: Bot = teloxide::Bot::new(opts.tg_cfg.token.clone())
        .throttle(Default::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all());

    let admins = AdminPolicy::new(opts.tg_cfg.admins.iter().copied());

    let ledger = Ledger::new(opts.store.clone(), opts.billing_cfg.starting_balance);
    let promos = PromoRegistry::new(opts.store, ledger.clone());
    let costs = CostPolicy::new(opts.billing_cfg);
    let completions = CompletionService::new(http.clone(), opts.openrouter_cfg);

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        cfg: Arc::new(opts.tg_cfg),
        http,
        admins,
        ledger,
        promos,
        costs,
        completions,
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::regular::Cmd::bot_commands())
        .await?;

    let handler = dptree::entry()
        .inspect(|update: Update| {
            trace!(
                target: "tg_update",
                "{}",
                encoding::to_json_string_pretty(&update),
            );
        })
        .branch(
            Update::filter_message()
                .filter(cmd::filter_pm_with_bot)
                .filter_command::<cmd::StartCommand>()
                .endpoint(cmd::handle::<cmd::StartCommand>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::regular::Cmd>()
                .endpoint(cmd::handle::<cmd::regular::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::admin::Cmd>()
                .chain(dptree::filter(cmd::admin::filter))
                .endpoint(cmd::handle::<cmd::admin::Cmd>()),
        )
        .branch(Update::filter_message().endpoint(chat::handle));

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // We don't handle all possible updates, so to suppress the warning
        // about that we have a noop default handler here
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
