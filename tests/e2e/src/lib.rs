//! Reverie end-to-end test support
//!
//! - `harness`: isolated temp databases and engine wiring
//! - `mocks`: concept and upstream-row fixtures

pub mod harness;
pub mod mocks;

pub use harness::TestDatabase;
pub use mocks::ConceptFixtures;
