use async_trait::async_trait;
use cardrelay_core::{AmendAction, ForwardAction, MessageId, Publisher};
use teloxide::prelude::*;
use teloxide::types::MessageId as TelegramMessageId;
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::debug;

use crate::format::CardFormatter;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Telegram API error: {0}")]
    Telegram(#[from] RequestError),

    #[error("Destination chat is not configured")]
    NoDestination,
}

/// Posts card events to the destination chat and edits them on amendment.
#[derive(Clone)]
pub struct TelegramPublisher {
    bot: Bot,
    destination: ChatId,
    formatter: CardFormatter,
}

impl TelegramPublisher {
    pub fn new(bot: Bot, destination: i64, formatter: CardFormatter) -> Result<Self, PublishError> {
        if destination == 0 {
            return Err(PublishError::NoDestination);
        }
        Ok(Self {
            bot,
            destination: ChatId(destination),
            formatter,
        })
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn forward(&self, action: &ForwardAction) -> anyhow::Result<MessageId> {
        let text = self.formatter.render_event(&action.event);
        let sent = self
            .bot
            .send_message(self.destination, text)
            .await
            .map_err(PublishError::from)?;
        Ok(sent.id.0)
    }

    async fn amend(&self, action: &AmendAction) -> anyhow::Result<()> {
        let text = self.formatter.render_amendment(action);
        match self
            .bot
            .edit_message_text(
                self.destination,
                TelegramMessageId(action.forwarded_message_id),
                text,
            )
            .await
        {
            Ok(_) => Ok(()),
            // Same text as before, e.g. a WE card whose layout has no units.
            Err(RequestError::Api(ApiError::MessageNotModified)) => {
                debug!(
                    "Message {} already up to date",
                    action.forwarded_message_id
                );
                Ok(())
            }
            Err(e) => Err(PublishError::from(e).into()),
        }
    }
}
