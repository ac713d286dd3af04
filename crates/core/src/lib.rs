//! Core types for relay
//!
//! This crate holds the pieces of the build tool that the remote execution
//! client consumes but does not own: build labels, build targets and their
//! state, the build configuration, a read-only view of the target graph and
//! the build policy (which outputs to download, whether coverage is wanted).

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

pub mod config;
pub mod graph;
pub mod label;
pub mod policy;
pub mod target;

pub use config::BuildConfig;
pub use graph::BuildGraph;
pub use label::BuildLabel;
pub use policy::{BuildPolicy, BuildState};
pub use target::{BuildTarget, RemoteOutput, SourceInput, TargetState, ToolRef};

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Main error type for relay core operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration could not be parsed or is invalid
    #[error("Configuration error: {message}")]
    #[diagnostic(code(relay::config::invalid))]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// A label did not have the `//package:name` form
    #[error("Invalid build label '{label}': {reason}")]
    #[diagnostic(
        code(relay::label::invalid),
        help("Labels look like //package/path:name")
    )]
    InvalidLabel {
        /// The offending label text
        label: String,
        /// Why it was rejected
        reason: String,
    },

    /// A target referenced another target that is not in the graph
    #[error("Target {target} depends on {dependency}, which is not in the build graph")]
    #[diagnostic(code(relay::graph::missing_dependency))]
    MissingDependency {
        /// The depending target
        target: String,
        /// The missing dependency
        dependency: String,
    },

    /// I/O failure with path context
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(code(relay::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path involved in the failure
        path: Box<Path>,
        /// Operation that failed (e.g., "read", "write")
        operation: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an invalid label error
    #[must_use]
    pub fn invalid_label(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLabel {
            label: label.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing dependency error
    #[must_use]
    pub fn missing_dependency(target: &BuildLabel, dependency: &BuildLabel) -> Self {
        Self::MissingDependency {
            target: target.to_string(),
            dependency: dependency.to_string(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }
}

/// Result type alias for relay core operations
pub type Result<T> = std::result::Result<T, Error>;
