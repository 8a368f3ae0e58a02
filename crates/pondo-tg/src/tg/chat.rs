//! Free-form messages that aren't commands: they are forwarded to the LLM
//! and charged against the sender's balance.

use crate::billing::{ChargeKind, DebitOutcome};
use crate::openrouter::rpc;
use crate::prelude::*;
use crate::util::DynResult;
use crate::{tg, Result};
use base64::Engine;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, Message, User};
use teloxide::utils::markdown;

/// Text extracted from document attachments is capped at this many characters
/// before it goes into the prompt.
const MAX_DOCUMENT_CHARS: usize = 16_000;

enum Incoming {
    Text(String),
    Photo {
        file_id: String,
        caption: Option<String>,
    },
    Document {
        file_id: String,
        is_image: bool,
        mime: String,
        caption: Option<String>,
    },
}

impl Incoming {
    fn charge_kind(&self) -> ChargeKind {
        match self {
            Incoming::Text(_) => ChargeKind::Text,
            Incoming::Photo { .. } => ChargeKind::Photo,
            Incoming::Document { .. } => ChargeKind::Document,
        }
    }
}

pub(crate) async fn handle(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    let span = info_span!(
        "handle_chat",
        sender = msg.from().map(User::debug_id).as_deref(),
        chat = %msg.chat.debug_id(),
    );

    let fut = async move {
        let result = handle_imp(&ctx, &msg).await;

        if let Err(err) = &result {
            let span = warn_span!("err", err = tracing_err(err), id = err.id());
            async {
                if !err.is_user_error() {
                    warn!("Chat handler returned an error");
                }

                let reply_msg = markdown::code_block(&err.display_chain().to_string());

                if let Err(err) = ctx.bot.reply(&msg, reply_msg).await {
                    warn!(
                        err = tracing_err(&err),
                        "Failed to reply with the error message to the user"
                    );
                }
            }
            .instrument(span)
            .await;
        }

        result.map_err(Into::into)
    };

    fut.instrument(span).await
}

async fn handle_imp(ctx: &tg::Ctx, msg: &Message) -> Result {
    let Some(sender) = msg.from() else {
        return Ok(());
    };
    if sender.is_bot {
        return Ok(());
    }

    let Some(incoming) = classify(msg) else {
        return Ok(());
    };

    let user_id = sender.id.0;
    let kind = incoming.charge_kind();

    ctx.bot
        .send_chat_action(msg.chat.id, ChatAction::Typing)
        .await?;

    let profile = ctx.ledger.profile(user_id).await?;
    let model = ctx.costs.resolve_model(profile.model.as_deref()).to_owned();
    let cost = ctx.costs.cost(profile.model.as_deref(), kind);

    // Attachments are downloaded before the charge, so a failed download
    // costs the user nothing
    let content = build_content(ctx, incoming).await?;

    let mut messages = Vec::with_capacity(3);
    if let Some(prompt) = ctx.completions.system_prompt() {
        messages.push(rpc::Message::system(prompt));
    }
    if !profile.memory.is_empty() {
        messages.push(rpc::Message::system(format!(
            "Things to remember about this user: {}",
            profile.memory
        )));
    }
    messages.push(rpc::Message::user(content));

    match ctx.ledger.debit(user_id, cost).await? {
        DebitOutcome::InsufficientFunds { balance } => {
            let text = format!(
                "Not enough tokens: this message costs {cost}, \
                 but your balance is {balance}. Redeem a promo code with /redeem"
            );
            ctx.bot.reply(msg, markdown::escape(&text)).await?;
            return Ok(());
        }
        DebitOutcome::Charged { remaining, .. } => {
            debug!(%model, cost, remaining, "Charged for a message");
        }
    }

    let reply = match ctx.completions.complete(&model, &messages).await {
        Ok(reply) => reply,
        Err(err) => {
            // Exactly one refund per failed completion. If the refund itself
            // fails there is nothing more we can do than log it.
            if let Err(refund_err) = ctx.ledger.refund(user_id, cost).await {
                error!(
                    err = tracing_err(&refund_err),
                    user_id, cost, "Failed to refund a failed completion"
                );
            }
            return Err(err);
        }
    };

    ctx.bot.reply(msg, markdown::escape(&reply)).await?;

    Ok(())
}

fn classify(msg: &Message) -> Option<Incoming> {
    if let Some(text) = msg.text() {
        // Unrecognized commands fall through the command branches to here.
        // They shouldn't be sent to the LLM.
        if text.starts_with('/') {
            return None;
        }
        return Some(Incoming::Text(text.to_owned()));
    }

    if let Some(photos) = msg.photo() {
        let largest = photos.iter().max_by_key(|photo| photo.file.size)?;
        return Some(Incoming::Photo {
            file_id: largest.file.id.clone(),
            caption: msg.caption().map(ToOwned::to_owned),
        });
    }

    if let Some(document) = msg.document() {
        let mime = document
            .mime_type
            .as_ref()
            .map(|mime| mime.essence_str().to_owned())
            .unwrap_or_else(|| "application/octet-stream".to_owned());

        return Some(Incoming::Document {
            file_id: document.file.id.clone(),
            is_image: mime.starts_with("image/"),
            mime,
            caption: msg.caption().map(ToOwned::to_owned),
        });
    }

    None
}

async fn build_content(ctx: &tg::Ctx, incoming: Incoming) -> Result<rpc::Content> {
    match incoming {
        Incoming::Text(text) => Ok(rpc::Content::Text(text)),
        Incoming::Photo { file_id, caption } => {
            let bytes = download_file(ctx, &file_id).await?;
            Ok(image_content(&bytes, "image/jpeg", caption))
        }
        Incoming::Document {
            file_id,
            is_image,
            mime,
            caption,
        } => {
            let bytes = download_file(ctx, &file_id).await?;

            if is_image {
                return Ok(image_content(&bytes, &mime, caption));
            }

            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some((idx, _)) = text.char_indices().nth(MAX_DOCUMENT_CHARS) {
                text.truncate(idx);
            }

            let text = match caption {
                Some(caption) => format!("{caption}\n\n{text}"),
                None => text,
            };

            Ok(rpc::Content::Text(text))
        }
    }
}

fn image_content(bytes: &[u8], mime: &str, caption: Option<String>) -> rpc::Content {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let url = format!("data:{mime};base64,{encoded}");

    let mut parts = Vec::with_capacity(2);
    if let Some(caption) = caption {
        parts.push(rpc::ContentPart::Text { text: caption });
    }
    parts.push(rpc::ContentPart::ImageUrl {
        image_url: rpc::ImageUrl { url },
    });

    rpc::Content::Parts(parts)
}

async fn download_file(ctx: &tg::Ctx, file_id: &str) -> Result<bytes::Bytes> {
    let file = ctx.bot.get_file(file_id.to_owned()).await?;

    // `Download::download_file` on the adaptor stack is more ceremony than
    // fetching the file URL through our instrumented http client
    let url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        ctx.cfg.token, file.path
    );

    ctx.http.get(url).read_bytes().await
}
