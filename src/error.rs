//! Error types for the transaction manager

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Main error type for gas estimation and transaction submission
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Node rejected transaction ({kind:?}): {message}")]
    Send { kind: SendErrorKind, message: String },

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Gas bump error: {0}")]
    GasBump(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Transaction attempt {hash} not found")]
    AttemptNotFound { hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transaction {tx_id} failed: {reason}")]
    TxFailed { tx_id: String, reason: String },

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is transient and should be retried on the next cycle
    pub fn is_retryable(&self) -> bool {
        match self {
            TxmError::ChainConnection { .. } | TxmError::Timeout { .. } => true,
            TxmError::Send { kind, .. } => !kind.is_permanent(),
            _ => false,
        }
    }

    /// Classified send error kind, if this error came from a broadcast
    pub fn send_kind(&self) -> Option<SendErrorKind> {
        match self {
            TxmError::Send { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Build a send error from a raw node message
    pub fn from_node_message(message: impl Into<String>) -> Self {
        let message = message.into();
        TxmError::Send {
            kind: SendErrorKind::classify(&message),
            message,
        }
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;

/// Classification of errors returned by `eth_sendRawTransaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendErrorKind {
    /// A transaction with this nonce was already mined
    NonceTooLow,
    /// The node already has this exact transaction
    AlreadyKnown,
    /// A pending transaction with the same nonce pays more
    ReplacementUnderpriced,
    /// Price is below what the node accepts at all
    Underpriced,
    InsufficientFunds,
    /// Malformed or invalid transaction, never accepted on retry
    Fatal,
    Unknown,
}

lazy_static! {
    static ref NONCE_TOO_LOW: Regex = Regex::new(
        r"(?i)(nonce too low|nonce has already been used|oldnonce|transaction nonce is too low)"
    )
    .unwrap();
    static ref ALREADY_KNOWN: Regex = Regex::new(
        r"(?i)(already known|known transaction|alreadyknown|same hash was already imported)"
    )
    .unwrap();
    static ref REPLACEMENT_UNDERPRICED: Regex = Regex::new(
        r"(?i)(replacement transaction underpriced|gas price too low to replace|replacementunderpriced)"
    )
    .unwrap();
    static ref UNDERPRICED: Regex = Regex::new(
        r"(?i)(transaction underpriced|gas price too low|fee too low|max fee per gas less than block base fee|feetoolow)"
    )
    .unwrap();
    static ref INSUFFICIENT_FUNDS: Regex = Regex::new(
        r"(?i)(insufficient funds|insufficient balance|insufficientfunds)"
    )
    .unwrap();
    static ref FATAL: Regex = Regex::new(
        r"(?i)(invalid sender|invalid signature|exceeds block gas limit|intrinsic gas too low|exceeds the configured cap|tx type not supported|oversized data)"
    )
    .unwrap();
}

impl SendErrorKind {
    /// Classify a node error message
    pub fn classify(message: &str) -> Self {
        // Replacement must be checked before the generic underpriced pattern
        if REPLACEMENT_UNDERPRICED.is_match(message) {
            SendErrorKind::ReplacementUnderpriced
        } else if NONCE_TOO_LOW.is_match(message) {
            SendErrorKind::NonceTooLow
        } else if ALREADY_KNOWN.is_match(message) {
            SendErrorKind::AlreadyKnown
        } else if UNDERPRICED.is_match(message) {
            SendErrorKind::Underpriced
        } else if INSUFFICIENT_FUNDS.is_match(message) {
            SendErrorKind::InsufficientFunds
        } else if FATAL.is_match(message) {
            SendErrorKind::Fatal
        } else {
            SendErrorKind::Unknown
        }
    }

    /// Permanent rejections fail the transaction instead of being retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendErrorKind::InsufficientFunds | SendErrorKind::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendErrorKind::NonceTooLow => "nonce_too_low",
            SendErrorKind::AlreadyKnown => "already_known",
            SendErrorKind::ReplacementUnderpriced => "replacement_underpriced",
            SendErrorKind::Underpriced => "underpriced",
            SendErrorKind::InsufficientFunds => "insufficient_funds",
            SendErrorKind::Fatal => "fatal",
            SendErrorKind::Unknown => "unknown",
        }
    }
}
