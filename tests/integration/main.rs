//! Integration test driver.
//!
//! Each `mod` below maps to a file that exercises one control task
//! end-to-end against the recording mock policies in `mock_policies`.

mod heater_task_tests;
mod lid_task_tests;
mod mock_policies;
