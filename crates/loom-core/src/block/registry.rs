//! Ordered block registry with tail invalidation.

use crate::error::{Error, Result};

use super::types::{BlockState, CodeBlock};

/// Ordered collection of block records, indexed `0..len` with no gaps.
///
/// Blocks run sequentially against one shared session, so a block's output
/// may depend on every block before it. A hash mismatch at position `i`
/// therefore discards every record from `i` to the end, not just `i`.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Vec<CodeBlock>,
}

impl BlockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the registry holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block at `index`, if present.
    pub fn lookup(&self, index: usize) -> Option<&CodeBlock> {
        self.blocks.get(index)
    }

    /// Mutable access to the block at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut CodeBlock> {
        self.blocks.get_mut(index)
    }

    /// Iterate over blocks in index order.
    pub fn iter(&self) -> impl Iterator<Item = &CodeBlock> {
        self.blocks.iter()
    }

    /// Return the cached result for `index` if its hash still matches.
    ///
    /// On any miss (unknown index, different hash, or no result yet) the
    /// registry is truncated from `index` onward and `None` is returned.
    pub fn cached_result(&mut self, index: usize, fresh_hash: u64) -> Option<String> {
        if let Some(block) = self.blocks.get(index)
            && block.hash == fresh_hash
            && block.state.has_result()
        {
            return block.result.clone();
        }

        let removed = self.truncate_from(index);
        if removed > 0 {
            tracing::debug!("Cache miss at block {}: invalidated {} block(s)", index, removed);
        }
        None
    }

    /// Append a block at the next index.
    pub fn append(&mut self, block: CodeBlock) -> Result<()> {
        if block.index != self.blocks.len() {
            return Err(Error::InvalidOperation(format!(
                "block index {} appended to registry of length {}",
                block.index,
                self.blocks.len()
            )));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Remove every block from `index` to the end.
    ///
    /// Returns the number of removed blocks.
    pub fn truncate_from(&mut self, index: usize) -> usize {
        let removed = self.blocks.len().saturating_sub(index);
        self.blocks.truncate(index);
        removed
    }

    /// Remove all blocks.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Indices of blocks still waiting for evaluation, ascending.
    pub fn pending(&self) -> Vec<usize> {
        self.indices_in(BlockState::Created)
    }

    /// Indices of evaluated blocks not yet patched into output, ascending.
    pub fn unpatched(&self) -> Vec<usize> {
        self.indices_in(BlockState::Evaluated)
    }

    fn indices_in(&self, state: BlockState) -> Vec<usize> {
        self.blocks
            .iter()
            .filter(|b| b.state == state)
            .map(|b| b.index)
            .collect()
    }
}
