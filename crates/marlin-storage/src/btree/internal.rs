//! Internal page view: an ordered array of fixed-width (key, child) pairs.

use super::key::{IndexKey, KeyComparator};
use super::node::{self, NodeType};
use marlin_common::page::PageId;
use std::cmp::Ordering;
use std::marker::PhantomData;

/// Encoded size of a child page id.
const CHILD_LEN: usize = 4;

#[inline]
fn pair_len<K: IndexKey>() -> usize {
    K::ENCODED_LEN + CHILD_LEN
}

#[inline]
fn pair_offset<K: IndexKey>(index: usize) -> usize {
    node::COMMON_HEADER_SIZE + index * pair_len::<K>()
}

/// View over an internal page's bytes.
///
/// The key at index 0 is a placeholder; for 1 <= i < size, key\[i\] is the
/// smallest key in the subtree rooted at child\[i\]: child\[i-1\] holds keys
/// strictly less than key\[i\], child\[i\] holds keys >= key\[i\].
pub struct InternalNode<B, K> {
    data: B,
    _key: PhantomData<K>,
}

impl<B: AsRef<[u8]>, K: IndexKey> InternalNode<B, K> {
    /// Wraps existing internal-page bytes.
    pub fn new(data: B) -> Self {
        debug_assert_eq!(node::node_type(data.as_ref()), Some(NodeType::Internal));
        Self {
            data,
            _key: PhantomData,
        }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Number of (key, child) pairs, i.e. the number of children.
    pub fn size(&self) -> usize {
        node::size(self.bytes()) as usize
    }

    /// Maximum number of pairs this page may hold.
    pub fn max_size(&self) -> usize {
        node::max_size(self.bytes()) as usize
    }

    /// Minimum occupancy for a non-root internal page.
    pub fn min_size(&self) -> usize {
        node::min_size_for(node::max_size(self.bytes())) as usize
    }

    /// This page's id.
    pub fn page_id(&self) -> PageId {
        node::page_id(self.bytes())
    }

    /// Parent page id; INVALID when this page is the root.
    pub fn parent_page_id(&self) -> PageId {
        node::parent_page_id(self.bytes())
    }

    /// Key at `index`. Index 0 is the placeholder slot.
    pub fn key_at(&self, index: usize) -> K {
        assert!(index < self.size(), "internal index {} out of bounds", index);
        K::decode(&self.bytes()[pair_offset::<K>(index)..])
    }

    /// Child page id at `index`.
    pub fn value_at(&self, index: usize) -> PageId {
        assert!(index < self.size(), "internal index {} out of bounds", index);
        PageId(node::read_i32(
            self.bytes(),
            pair_offset::<K>(index) + K::ENCODED_LEN,
        ))
    }

    /// Index whose child equals `value`, if any.
    pub fn value_index(&self, value: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.value_at(i) == value)
    }

    /// Child covering `key`: scanning from index 1, the child left of the
    /// first separator greater than `key`, else the last child.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> PageId {
        let size = self.size();
        for i in 1..size {
            if cmp.compare(key, &self.key_at(i)) == Ordering::Less {
                return self.value_at(i - 1);
            }
        }
        self.value_at(size - 1)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>, K: IndexKey> InternalNode<B, K> {
    /// Formats raw bytes as a fresh empty internal page and returns the
    /// view.
    pub fn init(mut data: B, page_id: PageId, parent_page_id: PageId, max_size: i32) -> Self {
        let bytes = data.as_mut();
        node::set_node_type(bytes, NodeType::Internal);
        node::set_size(bytes, 0);
        node::set_max_size(bytes, max_size);
        node::set_parent_page_id(bytes, parent_page_id);
        node::set_page_id(bytes, page_id);
        Self {
            data,
            _key: PhantomData,
        }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Sets the parent page id.
    pub fn set_parent_page_id(&mut self, parent: PageId) {
        node::set_parent_page_id(self.bytes_mut(), parent);
    }

    fn set_size(&mut self, size: usize) {
        node::set_size(self.bytes_mut(), size as i32);
    }

    /// Overwrites the key at `index`.
    pub fn set_key_at(&mut self, index: usize, key: &K) {
        assert!(index < self.size(), "internal index {} out of bounds", index);
        let off = pair_offset::<K>(index);
        key.encode(&mut self.bytes_mut()[off..]);
    }

    fn set_value_at(&mut self, index: usize, value: PageId) {
        assert!(index < self.size(), "internal index {} out of bounds", index);
        let off = pair_offset::<K>(index) + K::ENCODED_LEN;
        node::write_i32(self.bytes_mut(), off, value.0);
    }

    fn write_pair(&mut self, index: usize, key: &K, value: PageId) {
        let off = pair_offset::<K>(index);
        let bytes = self.bytes_mut();
        debug_assert!(off + pair_len::<K>() <= bytes.len());
        key.encode(&mut bytes[off..]);
        node::write_i32(bytes, off + K::ENCODED_LEN, value.0);
    }

    /// Fills a fresh root after its two children split off: child 0 is
    /// the old node, (key, child 1) the promoted separator and new node.
    pub fn populate_new_root(&mut self, old_child: PageId, key: &K, new_child: PageId) {
        debug_assert_eq!(self.size(), 0);
        self.set_size(2);
        self.set_value_at(0, old_child);
        self.set_key_at(1, key);
        self.set_value_at(1, new_child);
    }

    /// Inserts (key, new_child) immediately after the entry whose child
    /// is `old_child`.
    pub fn insert_node_after(&mut self, old_child: PageId, key: &K, new_child: PageId) {
        let index = self
            .value_index(old_child)
            .expect("old child missing from internal page")
            + 1;
        let size = self.size();
        debug_assert!(size < self.max_size(), "insert into full internal page");

        let start = pair_offset::<K>(index);
        let end = pair_offset::<K>(size);
        self.bytes_mut()
            .copy_within(start..end, start + pair_len::<K>());
        self.write_pair(index, key, new_child);
        self.set_size(size + 1);
    }

    /// Removes the pair at `index`, keeping the rest contiguous.
    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        assert!(index < size, "internal index {} out of bounds", index);

        let start = pair_offset::<K>(index + 1);
        let end = pair_offset::<K>(size);
        self.bytes_mut()
            .copy_within(start..end, pair_offset::<K>(index));
        self.set_size(size - 1);
    }

    /// Captures the sole remaining child and clears the page. Only
    /// meaningful on a root of size 1 during root adjustment.
    pub fn remove_and_return_only_child(&mut self) -> PageId {
        debug_assert_eq!(self.size(), 1);
        let child = self.value_at(0);
        self.set_size(0);
        child
    }

    /// Moves the upper half of the pairs to an empty recipient. The
    /// recipient's key 0 carries the promoted separator; the caller
    /// reparents the moved children.
    pub fn move_half_to<B2: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut InternalNode<B2, K>,
    ) {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size();
        let keep = size / 2;
        let moved = size - keep;

        recipient.bytes_mut()[pair_offset::<K>(0)..pair_offset::<K>(moved)]
            .copy_from_slice(&self.bytes()[pair_offset::<K>(keep)..pair_offset::<K>(size)]);
        recipient.set_size(moved);
        self.set_size(keep);
    }

    /// Sets this page's placeholder key to the separator pulled down from
    /// the parent, then appends every pair to the recipient's tail. The
    /// caller reparents the moved children. Leaves this page empty.
    pub fn move_all_to<B2: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        recipient: &mut InternalNode<B2, K>,
        separator: &K,
    ) {
        self.set_key_at(0, separator);

        let moved = self.size();
        let base = recipient.size();
        recipient.bytes_mut()[pair_offset::<K>(base)..pair_offset::<K>(base + moved)]
            .copy_from_slice(&self.bytes()[pair_offset::<K>(0)..pair_offset::<K>(moved)]);
        recipient.set_size(base + moved);
        self.set_size(0);
    }

    /// Appends a pair at the tail.
    pub fn append_entry(&mut self, key: &K, child: PageId) {
        let size = self.size();
        debug_assert!(size < self.max_size(), "append into full internal page");
        self.write_pair(size, key, child);
        self.set_size(size + 1);
    }

    /// Prepends a child: the new entry 0 holds `child`, and the shifted
    /// old entry 0 adopts `separator` as its key.
    pub fn prepend_entry(&mut self, child: PageId, separator: &K) {
        let size = self.size();
        debug_assert!(size < self.max_size(), "prepend into full internal page");

        self.bytes_mut()
            .copy_within(pair_offset::<K>(0)..pair_offset::<K>(size), pair_offset::<K>(1));
        self.set_size(size + 1);
        self.set_value_at(0, child);
        self.set_key_at(1, separator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::OrdComparator;
    use marlin_common::page::PAGE_SIZE;

    const CMP: OrdComparator = OrdComparator;

    fn pid(n: i32) -> PageId {
        PageId::new(n)
    }

    /// Builds an internal page with children c0 | k1 | c1 | k2 | c2 ...
    fn build_node<'a>(buf: &'a mut [u8], entries: &[(i32, i32)]) -> InternalNode<&'a mut [u8], i32> {
        let mut node = InternalNode::init(buf, pid(100), PageId::INVALID, 8);
        node.set_size(entries.len());
        for (i, (key, child)) in entries.iter().enumerate() {
            node.write_pair(i, key, pid(*child));
        }
        node
    }

    #[test]
    fn test_internal_init_state() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let node: InternalNode<_, i32> =
            InternalNode::init(&mut buf[..], pid(3), pid(1), 8);

        assert_eq!(node.size(), 0);
        assert_eq!(node.max_size(), 8);
        assert_eq!(node.min_size(), 4);
        assert_eq!(node.page_id(), pid(3));
        assert_eq!(node.parent_page_id(), pid(1));
    }

    #[test]
    fn test_internal_populate_new_root() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut node: InternalNode<_, i32> =
            InternalNode::init(&mut buf[..], pid(3), PageId::INVALID, 8);

        node.populate_new_root(pid(1), &50, pid(2));

        assert_eq!(node.size(), 2);
        assert_eq!(node.value_at(0), pid(1));
        assert_eq!(node.key_at(1), 50);
        assert_eq!(node.value_at(1), pid(2));
    }

    #[test]
    fn test_internal_lookup() {
        let mut buf = vec![0u8; PAGE_SIZE];
        // Children: c10 (< 20) | c20 [20, 40) | c30 [40, ...)
        let node = build_node(&mut buf, &[(0, 10), (20, 20), (40, 30)]);

        assert_eq!(node.lookup(&5, &CMP), pid(10));
        assert_eq!(node.lookup(&19, &CMP), pid(10));
        assert_eq!(node.lookup(&20, &CMP), pid(20));
        assert_eq!(node.lookup(&39, &CMP), pid(20));
        assert_eq!(node.lookup(&40, &CMP), pid(30));
        assert_eq!(node.lookup(&1000, &CMP), pid(30));
    }

    #[test]
    fn test_internal_value_index() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let node = build_node(&mut buf, &[(0, 10), (20, 20), (40, 30)]);

        assert_eq!(node.value_index(pid(10)), Some(0));
        assert_eq!(node.value_index(pid(30)), Some(2));
        assert_eq!(node.value_index(pid(99)), None);
    }

    #[test]
    fn test_internal_insert_node_after() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut node = build_node(&mut buf, &[(0, 10), (40, 30)]);

        node.insert_node_after(pid(10), &20, pid(20));

        assert_eq!(node.size(), 3);
        assert_eq!(node.value_at(0), pid(10));
        assert_eq!(node.key_at(1), 20);
        assert_eq!(node.value_at(1), pid(20));
        assert_eq!(node.key_at(2), 40);
        assert_eq!(node.value_at(2), pid(30));
    }

    #[test]
    fn test_internal_remove() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut node = build_node(&mut buf, &[(0, 10), (20, 20), (40, 30)]);

        node.remove(1);

        assert_eq!(node.size(), 2);
        assert_eq!(node.value_at(0), pid(10));
        assert_eq!(node.key_at(1), 40);
        assert_eq!(node.value_at(1), pid(30));
    }

    #[test]
    fn test_internal_remove_and_return_only_child() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut node = build_node(&mut buf, &[(0, 10)]);

        let child = node.remove_and_return_only_child();
        assert_eq!(child, pid(10));
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn test_internal_move_half_to() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];
        let mut left = build_node(&mut left_buf, &[(0, 1), (10, 2), (20, 3), (30, 4)]);
        let mut right: InternalNode<_, i32> =
            InternalNode::init(&mut right_buf[..], pid(200), PageId::INVALID, 8);

        left.move_half_to(&mut right);

        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 2);
        // The promoted separator rides along as the recipient's key 0
        assert_eq!(right.key_at(0), 20);
        assert_eq!(right.value_at(0), pid(3));
        assert_eq!(right.key_at(1), 30);
        assert_eq!(right.value_at(1), pid(4));
    }

    #[test]
    fn test_internal_move_all_to() {
        let mut left_buf = vec![0u8; PAGE_SIZE];
        let mut right_buf = vec![0u8; PAGE_SIZE];
        let mut left = build_node(&mut left_buf, &[(0, 1), (10, 2)]);
        let mut right = InternalNode::init(&mut right_buf[..], pid(200), PageId::INVALID, 8);
        right.set_size(2);
        right.write_pair(0, &0, pid(3));
        right.write_pair(1, &40, pid(4));

        // The separator (30) is pulled down onto the right page's
        // placeholder before the move
        right.move_all_to(&mut left, &30);

        assert_eq!(right.size(), 0);
        assert_eq!(left.size(), 4);
        assert_eq!(left.key_at(1), 10);
        assert_eq!(left.key_at(2), 30);
        assert_eq!(left.value_at(2), pid(3));
        assert_eq!(left.key_at(3), 40);
        assert_eq!(left.value_at(3), pid(4));
    }

    #[test]
    fn test_internal_append_and_prepend() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut node = build_node(&mut buf, &[(0, 10), (20, 20)]);

        node.append_entry(&40, pid(30));
        assert_eq!(node.size(), 3);
        assert_eq!(node.key_at(2), 40);
        assert_eq!(node.value_at(2), pid(30));

        node.prepend_entry(pid(5), &7);
        assert_eq!(node.size(), 4);
        assert_eq!(node.value_at(0), pid(5));
        // The shifted old head adopted the separator key
        assert_eq!(node.key_at(1), 7);
        assert_eq!(node.value_at(1), pid(10));
        assert_eq!(node.key_at(2), 20);
    }
}
