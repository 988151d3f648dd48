//! Scenario-based tests for ml-pipeline

mod helpers;

mod definition_errors;
mod jobs;
mod submit_and_wait;
