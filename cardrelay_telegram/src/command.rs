use cardrelay_core::StoreStats;

/// Admin commands, accepted in private chats only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Status,
    Pause,
    Resume,
    Help,
}

impl Command {
    #[must_use]
    pub fn parse_from_text(text: &str) -> Option<Self> {
        let text = text.trim().to_lowercase();

        // Remove bot mention if present (e.g., "/status@my_bot")
        let command = text.split(['@', ' ']).next().unwrap_or_default();

        match command {
            "/status" | "/start" => Some(Self::Status),
            "/pause" | "/stop" => Some(Self::Pause),
            "/resume" => Some(Self::Resume),
            "/help" => Some(Self::Help),
            _ => None,
        }
    }

    #[must_use]
    pub const fn help_text() -> &'static str {
        r"
🤖 Card Relay Bot

/status - forwarding state and card statistics
/pause  - stop forwarding new cards
/resume - resume forwarding
/help   - show this message
"
    }
}

#[must_use]
pub fn status_text(stats: &StoreStats, pending_validations: usize, forwarding_active: bool) -> String {
    format!(
        "📊 Status\n\n\
         Forwarding: {}\n\
         Cards recorded: {}\n\
         ✅ Complete: {}\n\
         ⏳ Partial: {}\n\
         📤 Unconfirmed: {}\n\
         🔁 Pending validations: {pending_validations}",
        if forwarding_active { "active" } else { "paused" },
        stats.total,
        stats.complete,
        stats.partial,
        stats.provisional,
    )
}
