//! Disk-resident B+tree index.
//!
//! Nodes are fixed-size pages interpreted through byte-slice views; the
//! discriminator between leaf and internal pages lives in the page bytes.
//! All page access goes through the buffer pool's pin/unpin contract.

mod internal;
mod iter;
mod key;
mod leaf;
mod node;
mod tree;

pub use internal::InternalNode;
pub use iter::TreeIterator;
pub use key::{IndexKey, KeyComparator, OrdComparator};
pub use leaf::LeafNode;
pub use node::{is_leaf, node_type, NodeType};
pub use tree::BPlusTree;
