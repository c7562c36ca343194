mod shutdown_tests;
mod worker_tests;
