use super::regular::validate_code;
use crate::prelude::*;
use crate::{err, tg, Result, UserError};
use async_trait::async_trait;
use itertools::Itertools;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "Commands for bot admins only:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    AdminHelp,

    #[command(description = "create a promo code: <code> <amount> [uses]")]
    PromoCreate(String),

    #[command(description = "delete a promo code: <code>")]
    PromoDelete(String),

    #[command(description = "list the active promo codes")]
    PromoList,

    #[command(description = "change a user's balance: <user_id> <delta>")]
    Grant(String),
}

pub(crate) fn filter(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    let is_admin = matches!(msg.from(), Some(sender) if ctx.admins.is_admin(sender.id));

    if !is_admin {
        if let Some(sender) = msg.from() {
            info!(
                sender = %sender.debug_id(),
                "Non-admin user tried to access an admin command"
            );
        }
    }

    is_admin
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::AdminHelp => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::PromoCreate(args) => {
                let (code, amount, uses) = parse_promo_create(&args)?;

                let promo = ctx.promos.create(&code, amount, uses).await?;

                let text = format!(
                    "Created `{}`: +{} tokens, {} use(s)",
                    promo.code, promo.amount, promo.uses_left
                );
                ctx.bot.reply(msg, markdown::escape(&text)).await?;
            }
            Cmd::PromoDelete(code) => {
                let code = validate_code(&code)?;

                let text = if ctx.promos.delete(&code).await? {
                    format!("Deleted `{code}`")
                } else {
                    format!("The code `{code}` doesn't exist")
                };
                ctx.bot.reply(msg, markdown::escape(&text)).await?;
            }
            Cmd::PromoList => {
                let promos = ctx.promos.list().await?;

                let text = if promos.is_empty() {
                    markdown::escape("No active promo codes")
                } else {
                    let list = promos
                        .iter()
                        .map(|promo| {
                            format!(
                                "{}: +{} tokens, {} use(s) left",
                                promo.code, promo.amount, promo.uses_left
                            )
                        })
                        .join("\n");

                    markdown::code_block(&list)
                };

                ctx.bot.reply(msg, text).await?;
            }
            Cmd::Grant(args) => {
                let (user_id, delta) = parse_grant(&args)?;

                let new_balance = ctx.ledger.credit(user_id, delta).await?;

                let text = format!("Balance of {user_id} is now {new_balance} tokens");
                ctx.bot.reply(msg, markdown::escape(&text)).await?;
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_promo_create(args: &str) -> Result<(String, u64, u32)> {
    let mut parts = args.split_whitespace();

    let (Some(code), Some(amount)) = (parts.next(), parts.next()) else {
        return Err(err!(UserError::BadCommandUsage {
            usage: "/promo_create <code> <amount> [uses]"
        }));
    };

    let code = validate_code(code)?;

    let amount: u64 = amount
        .parse()
        .ok()
        .filter(|&amount| amount > 0)
        .ok_or_else(|| {
            err!(UserError::InvalidAmount {
                input: amount.to_owned()
            })
        })?;

    let uses = match parts.next() {
        Some(uses) => uses.parse().ok().filter(|&uses| uses > 0).ok_or_else(|| {
            err!(UserError::InvalidAmount {
                input: uses.to_owned()
            })
        })?,
        None => 1,
    };

    Ok((code, amount, uses))
}

pub(crate) fn parse_grant(args: &str) -> Result<(u64, i64)> {
    let mut parts = args.split_whitespace();

    let (Some(user_id), Some(delta), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(err!(UserError::BadCommandUsage {
            usage: "/grant <user_id> <delta>"
        }));
    };

    let user_id = user_id.parse().map_err(|_| {
        err!(UserError::InvalidUserId {
            input: user_id.to_owned()
        })
    })?;

    let delta = delta.parse().map_err(|_| {
        err!(UserError::InvalidAmount {
            input: delta.to_owned()
        })
    })?;

    Ok((user_id, delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promo_create_args() {
        assert_eq!(
            parse_promo_create("welcome 40").unwrap(),
            ("welcome".to_owned(), 40, 1)
        );
        assert_eq!(
            parse_promo_create("  boost  25  3 ").unwrap(),
            ("boost".to_owned(), 25, 3)
        );

        assert!(parse_promo_create("").is_err());
        assert!(parse_promo_create("code").is_err());
        assert!(parse_promo_create("code zero").is_err());
        assert!(parse_promo_create("code 0").is_err());
        assert!(parse_promo_create("code -5").is_err());
        assert!(parse_promo_create("code 10 0").is_err());
    }

    #[test]
    fn grant_args() {
        assert_eq!(parse_grant("12345 60").unwrap(), (12345, 60));
        assert_eq!(parse_grant("12345 -20").unwrap(), (12345, -20));

        assert!(parse_grant("").is_err());
        assert!(parse_grant("12345").is_err());
        assert!(parse_grant("someone 60").is_err());
        assert!(parse_grant("12345 lots").is_err());
        assert!(parse_grant("12345 60 extra").is_err());
    }
}
