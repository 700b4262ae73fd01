//! Experience storage
//!
//! The rollout buffer holds one batch of collected experience in the
//! `[n_steps, agents]` layout the return estimators consume.

pub mod rollout;

pub use rollout::{RolloutBuffer, RolloutSnapshot};
