//! Transaction submission module with nonce management and gas bumping

mod builder;
mod bumper;
mod confirmer;
mod manager;
mod models;
mod nonce;

pub use builder::AttemptBuilder;
pub use bumper::{GasBumper, SendOutcome};
pub use confirmer::{Confirmation, ConfirmationTracker};
pub use manager::TransactionManager;
pub use models::{AttemptState, Tx, TxAttempt, TxRequest, TxState};
pub use nonce::NonceManager;
