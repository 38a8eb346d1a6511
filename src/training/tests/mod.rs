//! Test suite for the training loop engine
//!
//! Covers the loop driver, hook dispatch, checkpoint selection and exact
//! resumption of interrupted runs, single- and multi-worker.

// Test modules
pub mod checkpoint_tests;


pub use fixtures::{new_log, recorded, BatchLog, EventLog, FailAfter, LrRecorder, RecordingHook, TrainingTestFixture};
