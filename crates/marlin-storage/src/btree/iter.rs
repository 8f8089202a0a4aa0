//! Forward iteration over the leaf chain.

use super::key::{IndexKey, KeyComparator};
use super::leaf::LeafNode;
use super::tree::BPlusTree;
use marlin_buffer::PageHandle;
use marlin_common::{Result, Rid};

/// Cursor over a tree's (key, rid) pairs in ascending key order.
///
/// Holds a pin on the current leaf between steps; dropping the iterator
/// releases it. Advancing past the last pair of a leaf follows
/// `next_page_id`, unpinning the exhausted leaf.
pub struct TreeIterator<'a, K: IndexKey, C: KeyComparator<K>> {
    tree: &'a BPlusTree<K, C>,
    leaf: Option<PageHandle<'a>>,
    index: usize,
}

impl<'a, K: IndexKey, C: KeyComparator<K>> TreeIterator<'a, K, C> {
    pub(crate) fn new(
        tree: &'a BPlusTree<K, C>,
        leaf: PageHandle<'a>,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            tree,
            leaf: Some(leaf),
            index,
        };
        iter.skip_exhausted()?;
        Ok(iter)
    }

    pub(crate) fn at_end(tree: &'a BPlusTree<K, C>) -> Self {
        Self {
            tree,
            leaf: None,
            index: 0,
        }
    }

    /// Walks forward until the cursor rests on a real pair, following the
    /// sibling chain past exhausted leaves.
    fn skip_exhausted(&mut self) -> Result<()> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(());
            };
            let (size, next) = {
                let data = leaf.data();
                let leaf_node = LeafNode::<_, K>::new(data.as_slice());
                (leaf_node.size(), leaf_node.next_page_id())
            };
            if self.index < size {
                return Ok(());
            }
            if !next.is_valid() {
                self.leaf = None;
                return Ok(());
            }
            // Fetch the successor before releasing the current leaf
            let next_leaf = self.tree.pool().fetch_page(next)?;
            self.leaf = Some(next_leaf);
            self.index = 0;
        }
    }

    /// True once iteration is exhausted.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// The pair under the cursor. Calling this at the end is a
    /// programming error.
    pub fn get(&self) -> (K, Rid) {
        let leaf = self.leaf.as_ref().expect("iterator is at end");
        let data = leaf.data();
        LeafNode::<_, K>::new(data.as_slice()).item_at(self.index)
    }

    /// Steps to the next pair; a no-op at the end.
    pub fn advance(&mut self) -> Result<()> {
        if self.leaf.is_some() {
            self.index += 1;
            self.skip_exhausted()?;
        }
        Ok(())
    }
}

impl<K: IndexKey, C: KeyComparator<K>> Iterator for TreeIterator<'_, K, C> {
    type Item = Result<(K, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let item = self.get();
        match self.advance() {
            Ok(()) => Some(Ok(item)),
            Err(e) => {
                self.leaf = None;
                Some(Err(e))
            }
        }
    }
}
