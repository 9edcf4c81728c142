//! Activation Module
//!
//! Spreading activation with decay, noise, convergence detection, and
//! bounded co-activation history.

mod engine;
mod history;

pub use engine::{
    ActivatedNode, ActivationConfig, ActivationEngine, ActivationResult, NovelAssociation,
};
pub use history::{
    ActivationHistory, MAX_CO_ACTIVATION_PAIRS, MAX_HISTORY_NODES, MAX_SAMPLES_PER_NODE,
};
