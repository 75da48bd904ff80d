//! Block Allocator (fixed-size KV block pool) and Paged KV Cache
//! (per-sequence block tables over that pool).

use runner_backend::SeqId;
use runner_common::{Result, RunnerError};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A contiguous pool of fixed-size KV blocks with O(1) allocate/free via a
/// stack-structured free list. Never blocks; `alloc` fails fast with
/// `OutOfBlocks` once the free list is empty.
pub struct BlockAllocator {
    n_blocks: u32,
    free_list: Vec<BlockId>,
    #[cfg(debug_assertions)]
    live: Vec<bool>,
}

impl BlockAllocator {
    pub fn new(n_blocks: usize) -> Self {
        let free_list = (0..n_blocks as u32).rev().map(BlockId).collect();
        Self {
            n_blocks: n_blocks as u32,
            free_list,
            #[cfg(debug_assertions)]
            live: vec![false; n_blocks],
        }
    }

    pub fn n_blocks(&self) -> usize {
        self.n_blocks as usize
    }

    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn alloc(&mut self) -> Result<BlockId> {
        let id = self.free_list.pop().ok_or(RunnerError::OutOfBlocks)?;
        #[cfg(debug_assertions)]
        {
            assert!(!self.live[id.0 as usize], "allocator handed out a live block");
            self.live[id.0 as usize] = true;
        }
        Ok(id)
    }

    /// Double-free is a fatal programmer error: it means two sequences
    /// believed they owned the same block, violating the allocator's core
    /// invariant. We assert rather than silently ignore it.
    pub fn free(&mut self, id: BlockId) {
        #[cfg(debug_assertions)]
        {
            assert!(self.live[id.0 as usize], "double free of block {}", id.0);
            self.live[id.0 as usize] = false;
        }
        self.free_list.push(id);
    }
}

#[derive(Default, Clone)]
pub struct BlockTable(pub Vec<BlockId>);

impl BlockTable {
    pub fn len_blocks(&self) -> usize {
        self.0.len()
    }
}

struct SequenceEntry {
    table: BlockTable,
    logical_len: usize,
}

/// Per-sequence paged KV cache. Owns the sole `BlockAllocator` instance and
/// a block table per live sequence; exclusive mutation is serialized
/// behind one mutex, matching the concurrency model where only the worker
/// thread ever touches the cache.
pub struct PagedKvCache {
    block_size: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    allocator: BlockAllocator,
    sequences: HashMap<u64, SequenceEntry>,
}

impl PagedKvCache {
    pub fn new(block_size: usize, n_blocks: usize) -> Self {
        Self {
            block_size,
            inner: Mutex::new(Inner {
                allocator: BlockAllocator::new(n_blocks),
                sequences: HashMap::new(),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().unwrap().allocator.free_blocks()
    }

    pub fn n_blocks(&self) -> usize {
        self.inner.lock().unwrap().allocator.n_blocks()
    }

    /// Ensures capacity for `n` more logical positions, allocating blocks
    /// as needed. Registers the sequence on first use.
    pub fn append_positions(&self, seq: SeqId, n: usize) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        let block_size = self.block_size;
        g.sequences.entry(seq.0).or_insert_with(|| SequenceEntry {
            table: BlockTable::default(),
            logical_len: 0,
        });
        let new_len = g.sequences[&seq.0].logical_len + n;
        let blocks_needed = (new_len + block_size - 1) / block_size;
        while g.sequences[&seq.0].table.0.len() < blocks_needed {
            let id = g.allocator.alloc()?;
            g.sequences.get_mut(&seq.0).unwrap().table.0.push(id);
        }
        g.sequences.get_mut(&seq.0).unwrap().logical_len = new_len;
        Ok(())
    }

    /// Drops positions beyond `l`, freeing any block whose first logical
    /// position exceeds `l`.
    pub fn truncate_to(&self, seq: SeqId, l: usize) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        let block_size = self.block_size;
        let Some(entry) = g.sequences.get_mut(&seq.0) else {
            return Err(RunnerError::Internal(format!("truncate_to: unknown sequence {}", seq.0)));
        };
        if l > entry.logical_len {
            return Err(RunnerError::Internal("truncate_to: l exceeds current length".into()));
        }
        let blocks_needed = if l == 0 { 0 } else { (l + block_size - 1) / block_size };
        let mut freed = Vec::new();
        while entry.table.0.len() > blocks_needed {
            if let Some(id) = entry.table.0.pop() {
                freed.push(id);
            }
        }
        entry.logical_len = l;
        for id in freed {
            g.allocator.free(id);
        }
        Ok(())
    }

    /// Pure lookup: maps a logical position to its physical block and
    /// offset within that block.
    pub fn physical_index(&self, seq: SeqId, logical_pos: usize) -> Result<(BlockId, usize)> {
        let g = self.inner.lock().unwrap();
        let entry = g
            .sequences
            .get(&seq.0)
            .ok_or_else(|| RunnerError::Internal(format!("physical_index: unknown sequence {}", seq.0)))?;
        if logical_pos >= entry.logical_len {
            return Err(RunnerError::Internal("physical_index: position out of range".into()));
        }
        let block_index = logical_pos / self.block_size;
        let offset = logical_pos % self.block_size;
        let id = entry.table.0[block_index];
        Ok((id, offset))
    }

    /// Frees all blocks belonging to `seq` and forgets it.
    pub fn destroy(&self, seq: SeqId) {
        let mut g = self.inner.lock().unwrap();
        if let Some(entry) = g.sequences.remove(&seq.0) {
            for id in entry.table.0 {
                g.allocator.free(id);
            }
        }
    }

    pub fn logical_len(&self, seq: SeqId) -> usize {
        self.inner.lock().unwrap().sequences.get(&seq.0).map(|e| e.logical_len).unwrap_or(0)
    }

    pub fn allocated_blocks(&self, seq: SeqId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sequences
            .get(&seq.0)
            .map(|e| e.table.len_blocks())
            .unwrap_or(0)
    }
}
