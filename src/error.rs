//! Error types for the mention pipeline

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Vault errors - always fatal, never silently swallowed
    #[error("Vault key invalid: {0}")]
    VaultKey(String),

    #[error("Vault encryption failed: {0}")]
    VaultEncrypt(String),

    #[error("Vault decryption failed: {0}")]
    VaultDecrypt(String),

    #[error("Invalid keypair: {0}")]
    InvalidKeypair(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Duplicate mention: {0}")]
    DuplicateMention(String),

    #[error("Bot not found: {0}")]
    BotNotFound(String),

    #[error("Wallet not found for bot: {0}")]
    WalletNotFound(String),

    #[error("Illegal status transition for {entity} {id}: already terminal")]
    TerminalStatus { entity: &'static str, id: String },

    // Authorization errors
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    // Transient execution errors (retried with backoff)
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    // Fatal execution errors (terminal, no retry)
    #[error("Insufficient balance: {available}SOL available, {required}SOL required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction rejected on-chain: {0}")]
    TransactionRejected(String),

    #[error("Confirmation timeout for {0}")]
    ConfirmationTimeout(String),

    // Reply delivery errors (retried by the orchestrator)
    #[error("Reply delivery failed: {0}")]
    ReplyDelivery(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient execution class)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::RateLimited(_)
                | Error::Broadcast(_)
                | Error::ReplyDelivery(_)
        )
    }

    /// Check if this error terminates an execution attempt without retry
    pub fn is_fatal_execution(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::InvalidDestination(_)
                | Error::Signing(_)
                | Error::TransactionRejected(_)
                | Error::VaultDecrypt(_)
        )
    }

    /// Check if this error indicates vault corruption or a wrong key (paging-worthy)
    pub fn is_vault_failure(&self) -> bool {
        matches!(
            self,
            Error::VaultKey(_) | Error::VaultEncrypt(_) | Error::VaultDecrypt(_)
        )
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
