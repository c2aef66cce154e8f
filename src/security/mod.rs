//! Security module for DM pairing and shared-secret checks

pub mod pairing;
pub mod token;

pub use pairing::{
    ApprovalOutcome, DmPolicy, PairingConfig, PairingEvent, PairingManager, PairingRequest,
    PairingSummary,
};
pub use token::{bearer_token, tokens_match};
