use cardrelay_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Telegram API error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unauthorized command from user: {0}")]
    Unauthorized(u64),
}
