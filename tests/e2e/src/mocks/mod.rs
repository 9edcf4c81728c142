//! Test fixtures

mod fixtures;

pub use fixtures::{ConceptFixtures, ExperienceRow, OverlapScenario};
