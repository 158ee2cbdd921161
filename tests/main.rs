/*!
 * Main test entry point for the dubpipe test suite
 */

// Import common test utilities
pub mod common;

// Import unit tests
mod unit {
    // Error codes and their classification
    pub mod errors_tests;

    // Event payloads and progress math
    pub mod events_tests;
}

// Import integration tests
mod integration {
    // Scheduler runs, retries, resume and cancellation
    pub mod pipeline_run_tests;

    // Queue worker driving the scheduler
    pub mod queue_worker_tests;
}
