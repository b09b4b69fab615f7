//! Shared definitions for the B*-tree engine.
//!
//! This crate provides the pieces every other layer depends on:
//! - Error taxonomy and the crate-wide `Result` alias
//! - Tree configuration
//! - The fixed 512-byte on-disk node format
//! - The storage device trait nodes are read through

pub mod config;
pub mod device;
pub mod error;
pub mod node;

pub use config::TreeConfig;
pub use device::NodeDevice;
pub use error::{BStarError, Result};
pub use node::{ChildLink, NodeBuf, NodeDescriptor, NodeKind, DESCRIPTOR_SIZE, NODE_CAPACITY, NODE_SIZE};
