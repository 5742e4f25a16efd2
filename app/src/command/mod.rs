//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy type with its own input, dispatched
//! statically from `main`.

mod extract;
mod info;
mod init;
mod run;
mod version;

pub use extract::{ExtractInput, ExtractStrategy};
pub use info::InfoStrategy;
pub use init::InitStrategy;
pub use run::{RunInput, RunStrategy};
pub use version::VersionStrategy;

/// Core trait defining the contract for all command strategies.
///
/// Adding a command means adding a strategy type and a `Commands` variant.
pub trait CommandStrategy: Send + Sync + 'static {
    /// The input type this strategy accepts.
    type Input;

    /// Execute the command with the given input.
    ///
    /// # Errors
    /// Returns an error if command execution fails.
    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}

/// Show the first `keep` characters of a secret.
fn mask(secret: &str, keep: usize) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else if secret.chars().count() > keep * 2 {
        format!("{}...***", secret.chars().take(keep).collect::<String>())
    } else {
        "***".to_string()
    }
}
