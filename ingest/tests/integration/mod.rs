#![cfg(feature = "test-utils")]

mod common;
mod ingestion_test;
mod lifecycle_test;
mod reports_test;
