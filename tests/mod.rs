mod common;

mod retry_tests;
mod scheduler_tests;
