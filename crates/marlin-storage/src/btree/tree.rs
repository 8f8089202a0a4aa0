//! B+tree index over the buffer pool.
//!
//! The tree mutates pages only through the pool's pin/unpin contract:
//! every fetched or created page is held through a `PageHandle` whose drop
//! releases the pin exactly once, with the dirty flag the operation
//! accumulated.

use super::internal::InternalNode;
use super::iter::TreeIterator;
use super::key::{IndexKey, KeyComparator, OrdComparator};
use super::leaf::LeafNode;
use super::node::{self, NodeType};
use crate::header::HeaderPage;
use log::debug;
use marlin_buffer::{BufferPoolManager, PageHandle};
use marlin_common::page::{PageId, PAGE_SIZE};
use marlin_common::{MarlinError, Result, Rid};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Disk-resident B+tree supporting ordered insert, point lookup, delete,
/// and forward iteration. Keys are unique.
pub struct BPlusTree<K: IndexKey, C: KeyComparator<K> = OrdComparator> {
    /// Index name, the key of this tree's header-page record.
    name: String,
    /// Root page id; INVALID while the tree is empty.
    root_page_id: AtomicI32,
    /// Page cache mediating all node access.
    pool: Arc<BufferPoolManager>,
    /// Three-way key comparator.
    comparator: C,
    /// Leaf fan-out.
    leaf_max_size: i32,
    /// Internal fan-out.
    internal_max_size: i32,
    _key: std::marker::PhantomData<K>,
}

impl<K: IndexKey, C: KeyComparator<K>> BPlusTree<K, C> {
    /// Opens (or registers) the named index, reading its root page id
    /// from the header page.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
    ) -> Result<Self> {
        let leaf_max = Self::default_leaf_max();
        let internal_max = Self::default_internal_max();
        Self::with_max_sizes(name, pool, comparator, leaf_max, internal_max)
    }

    /// Opens the named index with explicit node fan-outs. Small fan-outs
    /// make split and merge behavior easy to exercise.
    pub fn with_max_sizes(
        name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: i32,
        internal_max_size: i32,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3, "fan-out too small");
        let name = name.into();

        let root = {
            let header = HeaderPage::fetch(&pool)?;
            header.get_root_id(&name)?.unwrap_or(PageId::INVALID)
        };

        Ok(Self {
            name,
            root_page_id: AtomicI32::new(root.0),
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            _key: std::marker::PhantomData,
        })
    }

    fn default_leaf_max() -> i32 {
        ((PAGE_SIZE - node::LEAF_HEADER_SIZE) / (K::ENCODED_LEN + Rid::ENCODED_LEN)) as i32
    }

    fn default_internal_max() -> i32 {
        ((PAGE_SIZE - node::COMMON_HEADER_SIZE) / (K::ENCODED_LEN + 4)) as i32
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current root page id; INVALID while empty.
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(AtomicOrdering::Acquire))
    }

    fn set_root(&self, root: PageId) {
        self.root_page_id.store(root.0, AtomicOrdering::Release);
    }

    pub(crate) fn pool(&self) -> &BufferPoolManager {
        &self.pool
    }

    /// True when the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Persists the current root page id in the header page. `register`
    /// inserts the record for a brand-new index; otherwise the existing
    /// record is updated.
    fn update_header_record(&self, register: bool) -> Result<()> {
        let mut header = HeaderPage::fetch(&self.pool)?;
        let root = self.root_page_id();
        if register && header.insert_record(&self.name, root)? {
            return Ok(());
        }
        if !header.update_record(&self.name, root)? {
            return Err(MarlinError::Internal(format!(
                "header record for index '{}' vanished",
                self.name
            )));
        }
        Ok(())
    }

    /// Descends from the root to the leaf responsible for `key`
    /// (leftmost leaf when `key` is None), unpinning each internal node
    /// along the way. Returns the pinned leaf.
    fn find_leaf(&self, key: Option<&K>) -> Result<PageHandle<'_>> {
        let mut page_id = self.root_page_id();
        loop {
            let page = self.pool.fetch_page(page_id)?;
            let child = {
                let data = page.data();
                match node::node_type(data.as_slice()) {
                    Some(NodeType::Leaf) => None,
                    Some(NodeType::Internal) => {
                        let internal = InternalNode::<_, K>::new(data.as_slice());
                        Some(match key {
                            Some(key) => internal.lookup(key, &self.comparator),
                            None => internal.value_at(0),
                        })
                    }
                    None => {
                        return Err(MarlinError::IndexCorrupted(format!(
                            "{} holds no tree node",
                            page_id
                        )))
                    }
                }
            };
            match child {
                None => return Ok(page),
                Some(child_id) => {
                    // Release the internal node before descending
                    drop(page);
                    page_id = child_id;
                }
            }
        }
    }

    /// Point lookup. Returns None for an absent key or an empty tree.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>> {
        if self.is_empty() {
            return Ok(None);
        }
        let leaf = self.find_leaf(Some(key))?;
        let data = leaf.data();
        let leaf_node = LeafNode::<_, K>::new(data.as_slice());
        Ok(leaf_node.lookup(key, &self.comparator))
    }

    /// Inserts a unique key. Returns false (leaving the tree unchanged)
    /// when the key already exists.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool> {
        if self.is_empty() {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }
        self.insert_into_leaf(key, rid)
    }

    /// Builds the first leaf, installs it as the root, and registers the
    /// index in the header page.
    fn start_new_tree(&self, key: K, rid: Rid) -> Result<()> {
        let page = self.pool.new_page()?;
        let page_id = page.page_id();
        {
            let mut data = page.data_mut();
            let mut leaf = LeafNode::init(
                data.as_mut_slice(),
                page_id,
                PageId::INVALID,
                self.leaf_max_size,
            );
            leaf.insert(&key, rid, &self.comparator);
        }
        page.mark_dirty();

        self.set_root(page_id);
        self.update_header_record(true)?;
        debug!("index '{}' rooted at {}", self.name, page_id);
        Ok(())
    }

    fn insert_into_leaf(&self, key: K, rid: Rid) -> Result<bool> {
        let leaf = self.find_leaf(Some(&key))?;

        // Fast path: room in the target leaf (or a duplicate)
        {
            let mut data = leaf.data_mut();
            let mut leaf_node = LeafNode::<_, K>::new(data.as_mut_slice());
            if leaf_node.lookup(&key, &self.comparator).is_some() {
                return Ok(false);
            }
            if leaf_node.size() < leaf_node.max_size() {
                leaf_node.insert(&key, rid, &self.comparator);
                leaf.mark_dirty();
                return Ok(true);
            }
        }

        // The leaf is full: split it, place the pending pair on the
        // correct side, and promote the new leaf's first key.
        let new_leaf = self.pool.new_page()?;
        let new_leaf_id = new_leaf.page_id();
        let promoted_key;
        {
            let mut old_data = leaf.data_mut();
            let mut new_data = new_leaf.data_mut();
            let mut old_node = LeafNode::<_, K>::new(old_data.as_mut_slice());
            let mut new_node = LeafNode::init(
                new_data.as_mut_slice(),
                new_leaf_id,
                old_node.parent_page_id(),
                self.leaf_max_size,
            );
            old_node.move_half_to(&mut new_node);

            if self.comparator.compare(&key, &new_node.key_at(0)) == Ordering::Less {
                old_node.insert(&key, rid, &self.comparator);
            } else {
                new_node.insert(&key, rid, &self.comparator);
            }
            promoted_key = new_node.key_at(0);
        }
        leaf.mark_dirty();
        new_leaf.mark_dirty();
        debug!("leaf {} split into {}", leaf.page_id(), new_leaf_id);

        self.insert_into_parent(leaf, promoted_key, new_leaf)?;
        Ok(true)
    }

    /// Links a freshly split-off node into the tree above `old`,
    /// splitting ancestors as needed. Consumes (and unpins) both handles.
    fn insert_into_parent(
        &self,
        old: PageHandle<'_>,
        key: K,
        new: PageHandle<'_>,
    ) -> Result<()> {
        let old_id = old.page_id();
        let new_id = new.page_id();
        let parent_id = {
            let data = old.data();
            node::parent_page_id(data.as_slice())
        };

        if !parent_id.is_valid() {
            // `old` was the root: grow a new root above both halves
            let root = self.pool.new_page()?;
            let root_id = root.page_id();
            {
                let mut data = root.data_mut();
                let mut root_node = InternalNode::init(
                    data.as_mut_slice(),
                    root_id,
                    PageId::INVALID,
                    self.internal_max_size,
                );
                root_node.populate_new_root(old_id, &key, new_id);
            }
            root.mark_dirty();

            for child in [&old, &new] {
                let mut data = child.data_mut();
                node::set_parent_page_id(data.as_mut_slice(), root_id);
                drop(data);
                child.mark_dirty();
            }

            self.set_root(root_id);
            self.update_header_record(false)?;
            debug!("index '{}' grew a new root {}", self.name, root_id);
            return Ok(());
        }

        let parent = self.pool.fetch_page(parent_id)?;
        let parent_has_room = {
            let data = parent.data();
            let parent_node = InternalNode::<_, K>::new(data.as_slice());
            parent_node.size() < parent_node.max_size()
        };

        if parent_has_room {
            {
                let mut data = parent.data_mut();
                let mut parent_node = InternalNode::<_, K>::new(data.as_mut_slice());
                parent_node.insert_node_after(old_id, &key, new_id);
            }
            parent.mark_dirty();
            return Ok(());
        }

        // The parent is full too: split it and recurse
        let new_internal = self.pool.new_page()?;
        let new_internal_id = new_internal.page_id();
        let promoted_key;
        let moved_children: Vec<PageId>;
        let pending_on_new;
        {
            let mut parent_data = parent.data_mut();
            let mut new_data = new_internal.data_mut();
            let mut parent_node = InternalNode::<_, K>::new(parent_data.as_mut_slice());
            let mut new_node = InternalNode::init(
                new_data.as_mut_slice(),
                new_internal_id,
                parent_node.parent_page_id(),
                self.internal_max_size,
            );
            parent_node.move_half_to(&mut new_node);
            moved_children = (0..new_node.size()).map(|i| new_node.value_at(i)).collect();

            // The pending entry goes wherever `old`'s entry ended up
            pending_on_new = parent_node.value_index(old_id).is_none();
            if pending_on_new {
                new_node.insert_node_after(old_id, &key, new_id);
            } else {
                parent_node.insert_node_after(old_id, &key, new_id);
            }
            promoted_key = new_node.key_at(0);
        }
        parent.mark_dirty();
        new_internal.mark_dirty();
        debug!("internal {} split into {}", parent_id, new_internal_id);

        // Children that moved now hang off the new internal page
        for child_id in moved_children {
            if child_id == old_id {
                let mut data = old.data_mut();
                node::set_parent_page_id(data.as_mut_slice(), new_internal_id);
                drop(data);
                old.mark_dirty();
            } else {
                let child = self.pool.fetch_page(child_id)?;
                let mut data = child.data_mut();
                node::set_parent_page_id(data.as_mut_slice(), new_internal_id);
                drop(data);
                child.mark_dirty();
            }
        }
        if pending_on_new {
            let mut data = new.data_mut();
            node::set_parent_page_id(data.as_mut_slice(), new_internal_id);
            drop(data);
            new.mark_dirty();
        }

        drop(old);
        drop(new);
        self.insert_into_parent(parent, promoted_key, new_internal)
    }

    /// Removes `key` if present, rebalancing as needed. Removing an
    /// absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let leaf = self.find_leaf(Some(key))?;
        let removed = {
            let mut data = leaf.data_mut();
            let mut leaf_node = LeafNode::<_, K>::new(data.as_mut_slice());
            leaf_node.remove(key, &self.comparator)
        };
        if !removed {
            return Ok(());
        }
        leaf.mark_dirty();
        self.coalesce_or_redistribute(leaf)
    }

    /// Restores the occupancy invariant for a node that may have
    /// underflowed. Consumes (and unpins) the handle. The caller has
    /// already marked the node dirty.
    fn coalesce_or_redistribute(&self, node_handle: PageHandle<'_>) -> Result<()> {
        let (node_id, size, max_size, parent_id) = {
            let data = node_handle.data();
            let bytes = data.as_slice();
            (
                node::page_id(bytes),
                node::size(bytes) as usize,
                node::max_size(bytes) as usize,
                node::parent_page_id(bytes),
            )
        };

        if !parent_id.is_valid() {
            return self.adjust_root(node_handle);
        }
        if size >= node::min_size_for(max_size as i32) as usize {
            return Ok(());
        }

        let parent = self.pool.fetch_page(parent_id)?;
        let (index, sibling_id) = {
            let data = parent.data();
            let parent_node = InternalNode::<_, K>::new(data.as_slice());
            let index = parent_node.value_index(node_id).ok_or_else(|| {
                MarlinError::IndexCorrupted(format!(
                    "{} missing from its parent {}",
                    node_id, parent_id
                ))
            })?;
            let sibling_index = if index == 0 { 1 } else { index - 1 };
            (index, parent_node.value_at(sibling_index))
        };
        let sibling = self.pool.fetch_page(sibling_id)?;
        let sibling_size = {
            let data = sibling.data();
            node::size(data.as_slice()) as usize
        };

        if sibling_size + size > max_size {
            return self.redistribute(&sibling, &node_handle, &parent, index);
        }

        // Coalesce right into left; the node at index 0 merges with its
        // right sibling, every other node merges into its left sibling.
        let node_is_left = index == 0;
        if node_is_left {
            self.coalesce(&node_handle, &sibling, &parent, 1)?;
        } else {
            self.coalesce(&sibling, &node_handle, &parent, index)?;
        }

        let (right_handle, left_handle) = if node_is_left {
            (sibling, node_handle)
        } else {
            (node_handle, sibling)
        };
        let right_id = right_handle.page_id();
        drop(right_handle);
        drop(left_handle);
        let deleted = self.pool.delete_page(right_id)?;
        debug_assert!(deleted, "emptied tree page should be deletable");
        debug!("coalesced {} away", right_id);

        // The parent lost an entry and may underflow in turn
        self.coalesce_or_redistribute(parent)
    }

    /// Moves one entry from `sibling` into `node` and refreshes the
    /// separator in the parent. `index` is `node`'s position under the
    /// parent; index 0 borrows from the right sibling, all others from
    /// the left.
    fn redistribute(
        &self,
        sibling: &PageHandle<'_>,
        node_handle: &PageHandle<'_>,
        parent: &PageHandle<'_>,
        index: usize,
    ) -> Result<()> {
        let node_id = node_handle.page_id();
        let mut reparented: Option<PageId> = None;
        {
            let mut sibling_data = sibling.data_mut();
            let mut node_data = node_handle.data_mut();
            let mut parent_data = parent.data_mut();
            let mut parent_node = InternalNode::<_, K>::new(parent_data.as_mut_slice());

            if node::is_leaf(node_data.as_slice()) {
                let mut sibling_node = LeafNode::<_, K>::new(sibling_data.as_mut_slice());
                let mut leaf_node = LeafNode::<_, K>::new(node_data.as_mut_slice());
                if index == 0 {
                    let separator = sibling_node.move_first_to_end_of(&mut leaf_node);
                    parent_node.set_key_at(1, &separator);
                } else {
                    let separator = sibling_node.move_last_to_front_of(&mut leaf_node);
                    parent_node.set_key_at(index, &separator);
                }
            } else {
                let mut sibling_node = InternalNode::<_, K>::new(sibling_data.as_mut_slice());
                let mut internal_node = InternalNode::<_, K>::new(node_data.as_mut_slice());
                if index == 0 {
                    // Rotate left: the separator comes down as the node's
                    // new last key, the sibling's first real key goes up
                    let moved_child = sibling_node.value_at(0);
                    let lifted_key = sibling_node.key_at(1);
                    let separator = parent_node.key_at(1);
                    internal_node.append_entry(&separator, moved_child);
                    sibling_node.remove(0);
                    parent_node.set_key_at(1, &lifted_key);
                    reparented = Some(moved_child);
                } else {
                    // Rotate right, symmetrically
                    let last = sibling_node.size() - 1;
                    let moved_child = sibling_node.value_at(last);
                    let lifted_key = sibling_node.key_at(last);
                    sibling_node.remove(last);
                    let separator = parent_node.key_at(index);
                    internal_node.prepend_entry(moved_child, &separator);
                    parent_node.set_key_at(index, &lifted_key);
                    reparented = Some(moved_child);
                }
            }
        }

        if let Some(child_id) = reparented {
            let child = self.pool.fetch_page(child_id)?;
            let mut data = child.data_mut();
            node::set_parent_page_id(data.as_mut_slice(), node_id);
            drop(data);
            child.mark_dirty();
        }

        sibling.mark_dirty();
        node_handle.mark_dirty();
        parent.mark_dirty();
        Ok(())
    }

    /// Merges `right` into `left` and removes the separator entry at
    /// `sep_index` from the parent. The caller deletes `right`'s page.
    fn coalesce(
        &self,
        left: &PageHandle<'_>,
        right: &PageHandle<'_>,
        parent: &PageHandle<'_>,
        sep_index: usize,
    ) -> Result<()> {
        let left_id = left.page_id();
        let mut moved_children: Vec<PageId> = Vec::new();
        {
            let mut left_data = left.data_mut();
            let mut right_data = right.data_mut();

            if node::is_leaf(left_data.as_slice()) {
                let mut left_node = LeafNode::<_, K>::new(left_data.as_mut_slice());
                let mut right_node = LeafNode::<_, K>::new(right_data.as_mut_slice());
                right_node.move_all_to(&mut left_node);
            } else {
                let separator = {
                    let parent_data = parent.data();
                    InternalNode::<_, K>::new(parent_data.as_slice()).key_at(sep_index)
                };
                let mut left_node = InternalNode::<_, K>::new(left_data.as_mut_slice());
                let mut right_node = InternalNode::<_, K>::new(right_data.as_mut_slice());
                let base = left_node.size();
                right_node.move_all_to(&mut left_node, &separator);
                moved_children = (base..left_node.size())
                    .map(|i| left_node.value_at(i))
                    .collect();
            }
        }

        for child_id in moved_children {
            let child = self.pool.fetch_page(child_id)?;
            let mut data = child.data_mut();
            node::set_parent_page_id(data.as_mut_slice(), left_id);
            drop(data);
            child.mark_dirty();
        }

        {
            let mut parent_data = parent.data_mut();
            let mut parent_node = InternalNode::<_, K>::new(parent_data.as_mut_slice());
            parent_node.remove(sep_index);
        }

        left.mark_dirty();
        right.mark_dirty();
        parent.mark_dirty();
        Ok(())
    }

    /// Handles underflow at the root: an emptied leaf root ends the
    /// tree; an internal root with a single child hands the root role to
    /// that child. Consumes (and unpins) the handle.
    fn adjust_root(&self, root: PageHandle<'_>) -> Result<()> {
        let (is_leaf, size) = {
            let data = root.data();
            (node::is_leaf(data.as_slice()), node::size(data.as_slice()))
        };

        if is_leaf {
            if size == 0 {
                let root_id = root.page_id();
                drop(root);
                let deleted = self.pool.delete_page(root_id)?;
                debug_assert!(deleted, "empty root should be deletable");
                self.set_root(PageId::INVALID);
                self.update_header_record(false)?;
                debug!("index '{}' emptied", self.name);
            }
            return Ok(());
        }

        if size == 1 {
            let child_id = {
                let mut data = root.data_mut();
                InternalNode::<_, K>::new(data.as_mut_slice()).remove_and_return_only_child()
            };
            let root_id = root.page_id();
            drop(root);
            let deleted = self.pool.delete_page(root_id)?;
            debug_assert!(deleted, "collapsed root should be deletable");

            self.set_root(child_id);
            self.update_header_record(false)?;

            let child = self.pool.fetch_page(child_id)?;
            {
                let mut data = child.data_mut();
                node::set_parent_page_id(data.as_mut_slice(), PageId::INVALID);
            }
            child.mark_dirty();
            debug!("index '{}' root collapsed into {}", self.name, child_id);
        }
        Ok(())
    }

    /// Iterator positioned at the first key.
    pub fn begin(&self) -> Result<TreeIterator<'_, K, C>> {
        if self.is_empty() {
            return Ok(TreeIterator::at_end(self));
        }
        let leaf = self.find_leaf(None)?;
        TreeIterator::new(self, leaf, 0)
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<'_, K, C>> {
        if self.is_empty() {
            return Ok(TreeIterator::at_end(self));
        }
        let leaf = self.find_leaf(Some(key))?;
        let index = {
            let data = leaf.data();
            LeafNode::<_, K>::new(data.as_slice()).key_index(key, &self.comparator)
        };
        TreeIterator::new(self, leaf, index)
    }

    /// Renders the tree rank by rank, for tests and debugging.
    pub fn to_pretty_string(&self) -> Result<String> {
        if self.is_empty() {
            return Ok("empty tree".to_string());
        }

        let mut out = String::new();
        let mut level: Vec<PageId> = vec![self.root_page_id()];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            for page_id in &level {
                let page = self.pool.fetch_page(*page_id)?;
                let data = page.data();
                match node::node_type(data.as_slice()) {
                    Some(NodeType::Leaf) => {
                        let leaf = LeafNode::<_, K>::new(data.as_slice());
                        let keys: Vec<String> = (0..leaf.size())
                            .map(|i| format!("{:?}", leaf.key_at(i)))
                            .collect();
                        out.push_str(&format!("[{}: {}] ", page_id, keys.join(" ")));
                    }
                    Some(NodeType::Internal) => {
                        let internal = InternalNode::<_, K>::new(data.as_slice());
                        let keys: Vec<String> = (1..internal.size())
                            .map(|i| format!("{:?}", internal.key_at(i)))
                            .collect();
                        out.push_str(&format!("({}: {}) ", page_id, keys.join(" ")));
                        for i in 0..internal.size() {
                            next_level.push(internal.value_at(i));
                        }
                    }
                    None => {
                        return Err(MarlinError::IndexCorrupted(format!(
                            "{} holds no tree node",
                            page_id
                        )))
                    }
                }
            }
            out.push('\n');
            level = next_level;
        }
        Ok(out)
    }
}
