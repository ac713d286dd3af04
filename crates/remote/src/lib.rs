//! REAPI (Remote Execution API) client for relay
//!
//! This crate runs build and test actions of relay targets on a server
//! implementing the Bazel Remote Execution API v2: it negotiates
//! capabilities, turns a target into a deterministic Command, input tree
//! and Action, uploads what the server lacks, follows the execution and
//! brings the outputs, test reports and coverage back.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod execute;
pub mod mapper;
pub mod materialize;
pub mod merkle;
pub mod negotiate;
pub mod proto;
pub mod retry;
pub mod test_results;
pub mod upload;

pub use proto::reapi;

pub use backend::{BuildOutcome, RemoteBackend, RemoteServices, TestOutcome};
pub use config::{AuthConfig, RemoteConfig, RetryConfig};
pub use error::{RemoteError, Result};
pub use mapper::{ActionOutput, ExecutionMetadata, ExecutionMode};
pub use merkle::Digest;
pub use negotiate::NegotiatedCapabilities;
pub use test_results::{TestReport, TestSummary};
