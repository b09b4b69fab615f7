//! Configuration structures for B*-trees.

use crate::error::{BStarError, Result};
use crate::node::NODE_CAPACITY;
use serde::{Deserialize, Serialize};

/// Configuration for creating or opening a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum key length in bytes (excluding the length prefix).
    pub key_len: u16,
    /// Number of nodes added each time node storage is extended.
    pub clump_nodes: u32,
    /// Number of nodes a freshly created tree starts with.
    pub initial_nodes: u32,
    /// Mirror the header node to the device's alternate location
    /// whenever the total node count changes.
    pub write_alternate: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            key_len: 37,
            clump_nodes: 64,
            initial_nodes: 16,
            write_alternate: true,
        }
    }
}

impl TreeConfig {
    /// Creates a config with the given key length and default sizing.
    pub fn with_key_len(key_len: u16) -> Self {
        Self {
            key_len,
            ..Default::default()
        }
    }

    /// Size of every index record for this key length: padded key area plus child pointer.
    pub fn index_record_size(&self) -> usize {
        round_even(1 + self.key_len as usize) + 4
    }

    /// Checks that the configuration describes a usable tree.
    pub fn validate(&self) -> Result<()> {
        if self.key_len == 0 || self.key_len > u8::MAX as u16 {
            return Err(BStarError::InvalidParameter {
                name: "key_len".to_string(),
                value: self.key_len.to_string(),
            });
        }
        // Two index records (plus offsets) must always fit in half a node.
        if self.index_record_size() + 2 > NODE_CAPACITY / 2 {
            return Err(BStarError::ConfigError(format!(
                "key_len {} makes index records larger than half a node",
                self.key_len
            )));
        }
        if self.clump_nodes == 0 {
            return Err(BStarError::InvalidParameter {
                name: "clump_nodes".to_string(),
                value: "0".to_string(),
            });
        }
        if self.initial_nodes < 2 {
            return Err(BStarError::InvalidParameter {
                name: "initial_nodes".to_string(),
                value: self.initial_nodes.to_string(),
            });
        }
        Ok(())
    }
}

/// Rounds up to the next even number.
#[inline]
pub fn round_even(n: usize) -> usize {
    (n + 1) & !1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.key_len, 37);
        assert_eq!(config.clump_nodes, 64);
        assert_eq!(config.initial_nodes, 16);
        assert!(config.write_alternate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_record_size() {
        // 1 + 37 = 38 (already even) + 4 byte child
        assert_eq!(TreeConfig::default().index_record_size(), 42);
        // 1 + 4 = 5 -> 6, + 4
        assert_eq!(TreeConfig::with_key_len(4).index_record_size(), 10);
    }

    #[test]
    fn test_round_even() {
        assert_eq!(round_even(0), 0);
        assert_eq!(round_even(1), 2);
        assert_eq!(round_even(2), 2);
        assert_eq!(round_even(7), 8);
    }

    #[test]
    fn test_validate_rejects_bad_key_len() {
        assert!(TreeConfig::with_key_len(0).validate().is_err());
        assert!(TreeConfig::with_key_len(300).validate().is_err());
        // 1 + 250 -> 252 + 4 = 256 > 248
        assert!(matches!(
            TreeConfig::with_key_len(250).validate(),
            Err(BStarError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_clump() {
        let config = TreeConfig {
            clump_nodes: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BStarError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_tiny_initial() {
        let config = TreeConfig {
            initial_nodes: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tree_config_serde_roundtrip() {
        let original = TreeConfig {
            key_len: 8,
            clump_nodes: 4,
            initial_nodes: 3,
            write_alternate: false,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TreeConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.key_len, deserialized.key_len);
        assert_eq!(original.clump_nodes, deserialized.clump_nodes);
        assert_eq!(original.initial_nodes, deserialized.initial_nodes);
        assert_eq!(original.write_alternate, deserialized.write_alternate);
    }
}
