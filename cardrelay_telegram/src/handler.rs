use crate::command::status_text;
use crate::{Command, Error, RelayBot, Result};
use cardrelay_core::RawMessage;
use cardrelay_pipeline::DispatchOutcome;
use teloxide::{requests::Requester, types::Message};
use tracing::{debug, info, warn};

/// Handle admin commands
pub async fn handle_command(bot: RelayBot, msg: Message, cmd: Command) -> Result<()> {
    let user_id = msg.from.as_ref().map_or(0, |u| u.id.0);
    if !bot.is_admin(user_id) {
        return Err(Error::Unauthorized(user_id));
    }
    info!("[{user_id}] Command: {cmd:?}");

    let reply = match cmd {
        Command::Status => {
            let stats = bot.store.stats().await?;
            status_text(
                &stats,
                bot.dispatcher.scheduler().pending(),
                bot.forwarding_active(),
            )
        }
        Command::Pause => {
            bot.set_forwarding(false);
            "⏸ Forwarding paused".to_string()
        }
        Command::Resume => {
            bot.set_forwarding(true);
            "▶️ Forwarding resumed".to_string()
        }
        Command::Help => Command::help_text().to_string(),
    };
    bot.bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

/// Handle any message or channel post
pub async fn handle_message(bot: RelayBot, msg: Message) -> Result<()> {
    let chat_id = msg.chat.id.0;
    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };

    if msg.chat.is_private() {
        if let Some(cmd) = Command::parse_from_text(text) {
            return handle_command(bot, msg, cmd).await;
        }
        return Ok(());
    }

    if !bot.accepts(chat_id) {
        debug!("Ignoring message from non-source chat {chat_id}");
        return Ok(());
    }
    if !bot.forwarding_active() {
        debug!("Forwarding paused, skipping {chat_id}/{}", msg.id.0);
        return Ok(());
    }

    let raw = raw_message(&msg, text);
    for outcome in bot.dispatcher.ingest(&raw).await {
        match outcome {
            DispatchOutcome::Failed { reason, .. } => {
                warn!("Message {chat_id}/{} not relayed: {reason}", raw.message_id);
            }
            DispatchOutcome::Ignored => {}
            other => debug!("Message {chat_id}/{}: {other:?}", raw.message_id),
        }
    }
    Ok(())
}

fn raw_message(msg: &Message, text: &str) -> RawMessage {
    let raw = RawMessage::new(msg.chat.id.0, msg.id.0, text, msg.date);
    match msg.reply_to_message() {
        Some(parent) => raw.replying_to(parent.id.0),
        None => raw,
    }
}
