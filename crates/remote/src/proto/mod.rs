//! Protocol messages of the Remote Execution API and its Google dependencies.
//!
//! Declared by hand with `prost` derives instead of generated at build time,
//! so building the crate does not need `protoc`.

#[allow(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
pub mod google;
#[allow(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
pub mod reapi;

/// `build.bazel.semver`
#[allow(missing_docs)]
pub mod semver {
    use std::fmt;

    /// Semantic version of the API
    #[derive(Clone, PartialEq, Eq, ::prost::Message)]
    pub struct SemVer {
        #[prost(int32, tag = "1")]
        pub major: i32,
        #[prost(int32, tag = "2")]
        pub minor: i32,
        #[prost(int32, tag = "3")]
        pub patch: i32,
        #[prost(string, tag = "4")]
        pub prerelease: String,
    }

    impl SemVer {
        /// Create a release version
        #[must_use]
        pub fn new(major: i32, minor: i32, patch: i32) -> Self {
            Self {
                major,
                minor,
                patch,
                prerelease: String::new(),
            }
        }

        /// Ordering key; prerelease tags are not compared
        #[must_use]
        pub fn key(&self) -> (i32, i32, i32) {
            (self.major, self.minor, self.patch)
        }
    }

    impl fmt::Display for SemVer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}
