//! # Submitter Components
//!
//! The job-originating client: one connection to the master, jobs out,
//! results in, latency accounting at the end. See [`submitter`].

pub mod submitter;

pub use submitter::{BatchSummary, JobResult, JobSpec, Submitter};
