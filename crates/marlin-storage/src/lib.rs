//! Storage engine for MarlinDB.
//!
//! This crate provides:
//! - The header page mapping index names to root page ids
//! - B+tree node layouts (common header, leaf, and internal views)
//! - A disk-resident B+tree index with ordered insert, point lookup,
//!   delete, and forward iteration, built on the buffer pool

mod btree;
mod header;

pub use btree::{
    is_leaf, node_type, BPlusTree, IndexKey, InternalNode, KeyComparator, LeafNode, NodeType,
    OrdComparator, TreeIterator,
};
pub use header::{HeaderPage, MAX_NAME_LEN, MAX_RECORDS};
