//! Error types for chain and ledger validation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Chain link failed: {0}")]
    ChainLink(String),

    #[error("Coin unavailable: {0}")]
    CoinUnavailable(String),

    #[error("Script mismatch: {0}")]
    ScriptMismatch(String),

    #[error("Insufficient signatures: {0}")]
    InsufficientSignatures(String),

    #[error("Amount out of range: {0}")]
    AmountRange(String),

    #[error("Size limit exceeded: {0}")]
    SizeLimitExceeded(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transaction pool full: {0}")]
    PoolFull(String),

    #[error("Transaction already pooled: {0}")]
    TxExists(String),

    #[error("Transaction conflicts with pool: {0}")]
    PoolConflict(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsensusError {
    /// Pool admission errors leave no side effects and can be reported to the caller as-is.
    pub fn is_pool_rejection(&self) -> bool {
        matches!(
            self,
            ConsensusError::PoolFull(_) | ConsensusError::TxExists(_) | ConsensusError::PoolConflict(_)
        )
    }
}

impl From<secp256k1::Error> for ConsensusError {
    fn from(err: secp256k1::Error) -> Self {
        ConsensusError::Key(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
