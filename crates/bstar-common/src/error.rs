//! Error types for the B*-tree engine.

use thiserror::Error;

/// Result type alias using BStarError.
pub type Result<T> = std::result::Result<T, BStarError>;

/// Errors that can occur in tree operations.
#[derive(Debug, Error)]
pub enum BStarError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Caller errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Tree is empty")]
    EmptyTree,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    // Resource exhaustion
    #[error("No space left for tree nodes")]
    NoSpace,

    // Structural corruption
    #[error("Node corrupted: {node}, reason: {reason}")]
    NodeCorrupted { node: u32, reason: String },

    #[error("B*-tree corrupted: {0}")]
    TreeCorrupted(String),

    /// `set` is the state the operation tried to move the bit to.
    #[error("Bitmap corrupted: bit for node {node} already in requested state (set = {set})")]
    BitmapCorrupted { node: u32, set: bool },

    #[error("Too few map nodes to cover the tree")]
    TooFewMapNodes,

    #[error("Node {node} out of range (tree has {count} nodes)")]
    NodeOutOfRange { node: u32, count: u32 },

    #[error("Node size mismatch: expected {expected}, got {actual}")]
    NodeSizeMismatch { expected: usize, actual: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BStarError {
    /// Returns true for errors that indicate on-disk structural damage.
    ///
    /// These surface as I/O-class failures and are never repaired.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BStarError::NodeCorrupted { .. }
                | BStarError::TreeCorrupted(_)
                | BStarError::BitmapCorrupted { .. }
                | BStarError::TooFewMapNodes
                | BStarError::NodeOutOfRange { .. }
                | BStarError::NodeSizeMismatch { .. }
        )
    }

    /// Shorthand for a tree-level corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        BStarError::TreeCorrupted(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: BStarError = io_err.into();
        assert!(matches!(err, BStarError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_node_corrupted_display() {
        let err = BStarError::NodeCorrupted {
            node: 12,
            reason: "offset table not monotonic".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Node corrupted: 12, reason: offset table not monotonic"
        );
    }

    #[test]
    fn test_bitmap_corrupted_display() {
        let err = BStarError::BitmapCorrupted { node: 7, set: true };
        assert_eq!(
            err.to_string(),
            "Bitmap corrupted: bit for node 7 already in requested state (set = true)"
        );

        let err = BStarError::BitmapCorrupted { node: 7, set: false };
        assert!(err.to_string().ends_with("(set = false)"));
    }

    #[test]
    fn test_out_of_range_display() {
        let err = BStarError::NodeOutOfRange { node: 99, count: 16 };
        assert_eq!(err.to_string(), "Node 99 out of range (tree has 16 nodes)");
    }

    #[test]
    fn test_caller_errors_display() {
        assert_eq!(BStarError::KeyNotFound.to_string(), "Key not found");
        assert_eq!(BStarError::DuplicateKey.to_string(), "Duplicate key");
        assert_eq!(BStarError::EmptyTree.to_string(), "Tree is empty");

        let err = BStarError::KeyTooLarge { size: 40, max: 37 };
        assert_eq!(err.to_string(), "Key too large: 40 bytes (max 37)");
    }

    #[test]
    fn test_is_corruption() {
        assert!(BStarError::corrupted("cycle").is_corruption());
        assert!(BStarError::TooFewMapNodes.is_corruption());
        assert!(BStarError::BitmapCorrupted { node: 1, set: false }.is_corruption());
        assert!(!BStarError::KeyNotFound.is_corruption());
        assert!(!BStarError::NoSpace.is_corruption());
        assert!(!BStarError::DuplicateKey.is_corruption());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BStarError>();
    }
}
