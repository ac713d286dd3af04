//! Content digests and Merkle tree construction for input roots

pub mod digest;
pub mod directory;

pub use digest::{Digest, EMPTY_HASH};
pub use directory::{DirectoryBuilder, DirectoryTree, FileEntry};
