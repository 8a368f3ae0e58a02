use crate::billing::RedeemOutcome;
use crate::prelude::*;
use crate::{err, tg, Result, UserError};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "The following commands are available:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    Help,

    #[command(description = "show your token balance")]
    Balance,

    #[command(description = "redeem a promo code: <code>")]
    Redeem(String),

    #[command(description = "pick the model used for your messages: <model>")]
    SetModel(String),

    #[command(description = "save a note the bot will keep in mind: <text>")]
    Remember(String),

    #[command(description = "show the saved note")]
    Memory,

    #[command(description = "forget the saved note")]
    ClearMemory,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        let user_id = tg::expect_sender(msg)?.id.0;

        match self {
            Cmd::Help => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::Balance => {
                let balance = ctx.ledger.balance(user_id).await?;

                let text = markdown::escape(&format!("Your balance: {balance} tokens"));
                ctx.bot.reply(msg, text).await?;
            }
            Cmd::Redeem(code) => {
                let code = validate_code(&code)?;

                let text = match ctx.promos.redeem(user_id, &code).await? {
                    RedeemOutcome::Redeemed {
                        amount,
                        new_balance,
                    } => {
                        format!("Code accepted: +{amount} tokens. Your balance: {new_balance}")
                    }
                    RedeemOutcome::NotFound => format!("The code `{code}` doesn't exist"),
                    RedeemOutcome::Exhausted => format!("The code `{code}` was already used up"),
                };

                ctx.bot.reply(msg, markdown::escape(&text)).await?;
            }
            Cmd::SetModel(model) => {
                let model = model.trim();

                if model.is_empty() {
                    let models = ctx.costs.known_models();
                    let text =
                        markdown::escape(&format!("Usage: /set_model <model>\nAvailable: {models}"));

                    ctx.bot.reply(msg, text).await?;
                    return Ok(());
                }

                if !ctx.costs.known_model(model) {
                    return Err(err!(UserError::UnknownModel {
                        input: model.to_owned()
                    }));
                }

                ctx.ledger.set_model(user_id, model.to_owned()).await?;

                let cost = ctx.costs.cost(Some(model), crate::billing::ChargeKind::Text);
                let text =
                    markdown::escape(&format!("Model set to {model} ({cost} tokens per message)"));
                ctx.bot.reply(msg, text).await?;
            }
            Cmd::Remember(note) => {
                let note = note.trim();

                if note.is_empty() {
                    return Err(err!(UserError::BadCommandUsage {
                        usage: "/remember <text>"
                    }));
                }

                ctx.ledger.set_memory(user_id, note.to_owned()).await?;
                ctx.bot.reply(msg, markdown::escape("Remembered ✔️")).await?;
            }
            Cmd::Memory => {
                let memory = ctx.ledger.profile(user_id).await?.memory;

                let text = if memory.is_empty() {
                    markdown::escape("The memory is empty")
                } else {
                    markdown::code_block(&memory)
                };

                ctx.bot.reply(msg, text).await?;
            }
            Cmd::ClearMemory => {
                ctx.ledger.clear_memory(user_id).await?;
                ctx.bot
                    .reply(msg, markdown::escape("Memory cleared ✔️"))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Promo codes are short alphanumeric identifiers. Rejecting everything else
/// up front keeps junk out of the store and out of the logs.
pub(crate) fn validate_code(input: &str) -> Result<String> {
    let code = input.trim();

    let is_valid = !code.is_empty()
        && code.len() <= 64
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !is_valid {
        return Err(err!(UserError::InvalidPromoCode {
            input: input.to_owned()
        }));
    }

    Ok(code.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promo_code_validation() {
        assert_eq!(validate_code(" welcome-2024 ").unwrap(), "welcome-2024");
        assert_eq!(validate_code("A_1").unwrap(), "A_1");

        assert!(validate_code("").is_err());
        assert!(validate_code("   ").is_err());
        assert!(validate_code("has spaces").is_err());
        assert!(validate_code("emoji🎁").is_err());
        assert!(validate_code(&"x".repeat(65)).is_err());
    }
}
