//! Secret storage via the OS keychain.
//!
//! The bot token and oracle key may live in the system keychain instead
//! of the environment. At startup, [`populate_env_from_keychain`] copies
//! any stored secret that the environment lacks into its variable, so the
//! regular config flow picks it up.

use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Keychain service name used for all stored secrets.
const SERVICE: &str = "klaxon";

/// Secrets managed by this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKey {
    TelegramBotToken,
    EtherscanApiKey,
}

impl CredentialKey {
    /// Returns the keychain entry identifier.
    fn keyring_id(self) -> &'static str {
        match self {
            Self::TelegramBotToken => "telegram_bot_token",
            Self::EtherscanApiKey => "etherscan_api_key",
        }
    }

    /// Returns the environment variable name for this secret.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::TelegramBotToken => "TELEGRAM_BOT_TOKEN",
            Self::EtherscanApiKey => "ETHERSCAN_API_KEY",
        }
    }

    /// All managed secrets.
    pub const ALL: [CredentialKey; 2] = [Self::TelegramBotToken, Self::EtherscanApiKey];
}

/// Reads a secret from the keychain, returning `None` if not set.
fn load(key: CredentialKey) -> Option<Zeroizing<String>> {
    let entry = keyring::Entry::new(SERVICE, key.keyring_id()).ok()?;
    match entry.get_password() {
        Ok(password) => Some(Zeroizing::new(password)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key = key.keyring_id(), error = %e, "failed to read keychain entry");
            None
        }
    }
}

/// Populates environment variables from the keychain for any secrets not
/// already set in the environment.
///
/// Call this at startup before [`crate::config::fetch_config`].
pub fn populate_env_from_keychain() {
    for key in CredentialKey::ALL {
        if std::env::var(key.env_var()).is_err()
            && let Some(value) = load(key)
        {
            debug!(key = key.env_var(), "loaded secret from keychain");
            // SAFETY: called from `main` before the runtime spawns any task.
            unsafe {
                std::env::set_var(key.env_var(), value.as_str());
            }
        }
    }
}
