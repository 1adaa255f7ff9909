//! Candidate / Posting state machines.

pub mod candidate;
pub mod posting;

pub use candidate::CandidateMachine;
pub use posting::{Liveness, PostingLifecycle};
