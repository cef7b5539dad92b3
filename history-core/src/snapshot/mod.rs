//! Snapshot extraction: hashing, YAML record handling and reading the live tree.

pub mod extract;
pub mod hash;
pub mod layout;
pub mod yaml;

pub use extract::{extract, extract_directory_entry, matches_filters};
pub use hash::hash_content;
