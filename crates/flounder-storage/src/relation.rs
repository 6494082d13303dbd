use flounder_error::{FlounderError, Result};
use flounder_types::Schema;
use parking_lot::Mutex;

use crate::block::{block_capacity, DataBlock};

/// An ordered list of owned blocks plus a schema.
///
/// Relations are heap-pinned by their owners (`Box<Relation>` in the
/// operators, map slots in the database) because generated code and the
/// iterators address them through raw pointers.
#[derive(Debug, Default)]
pub struct Relation {
    pub schema: Schema,
    blocks: Vec<Box<DataBlock>>,
}

impl Relation {
    pub fn new(schema: Schema) -> Result<Self> {
        if schema.tuple_size > block_capacity() {
            return Err(FlounderError::TupleTooLarge {
                tuple: schema.tuple_size,
                capacity: block_capacity(),
            });
        }
        Ok(Self {
            schema,
            blocks: Vec::new(),
        })
    }

    pub fn add_block(&mut self) -> &mut DataBlock {
        self.blocks.push(Box::new(DataBlock::new()));
        self.blocks.last_mut().expect("just pushed")
    }

    pub fn blocks(&self) -> &[Box<DataBlock>] {
        &self.blocks
    }

    pub fn tuple_count(&self) -> usize {
        let step = self.schema.tuple_size.max(1);
        self.blocks.iter().map(|b| b.content_size() / step).sum()
    }

    /// Truncate the relation to at most `limit` tuples.
    pub fn apply_limit(&mut self, limit: usize) {
        if self.blocks.is_empty() {
            return;
        }
        let step = self.schema.tuple_size.max(1);
        let mut seen = 0usize;
        let mut keep = 0usize;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            let in_block = block.content_size() / step;
            if seen + in_block >= limit {
                block.set_content_size((limit - seen) * step);
                keep = i + 1;
                break;
            }
            seen += in_block;
            keep = i + 1;
        }
        self.blocks.truncate(keep);
    }

    /// Append one tuple slot and return its address. In-process convenience
    /// used by bulk loading and tests; compiled queries go through
    /// [`AppendIterator`].
    pub fn append_tuple(&mut self) -> *mut u8 {
        let step = self.schema.tuple_size;
        let needs_block = match self.blocks.last() {
            Some(b) => b.content_size() + step > b.capacity(),
            None => true,
        };
        if needs_block {
            self.add_block();
        }
        let block = self.blocks.last_mut().expect("block present");
        let begin = block.end();
        let new_end = unsafe { begin.add(step) };
        block.update_content_size_ptr(new_end);
        begin
    }

    /// Iterate all tuple addresses in insertion order (in-process use).
    pub fn for_each_tuple(&self, mut f: impl FnMut(*const u8)) {
        let step = self.schema.tuple_size.max(1);
        for block in &self.blocks {
            let mut pos = block.begin() as *const u8;
            let end = block.end() as *const u8;
            while pos < end {
                f(pos);
                pos = unsafe { pos.add(step) };
            }
        }
    }
}

/// Hands out whole blocks under a mutex; within a block iteration is
/// unsynchronized. `refresh` resets to the start.
#[derive(Debug)]
pub struct ReadIterator {
    pub step: usize,
    rel: *const Relation,
    cursor: Mutex<ReadCursor>,
}

#[derive(Debug)]
struct ReadCursor {
    block_index: isize,
    pos: *mut u8,
    finished: bool,
}

unsafe impl Send for ReadIterator {}
unsafe impl Sync for ReadIterator {}

impl ReadIterator {
    /// # Safety
    ///
    /// `rel` must outlive the iterator and must not be resized while worker
    /// threads are draining blocks.
    pub unsafe fn new(rel: *const Relation) -> Self {
        let finished = (*rel).blocks.is_empty();
        Self {
            step: (*rel).schema.tuple_size,
            rel,
            cursor: Mutex::new(ReadCursor {
                block_index: -1,
                pos: std::ptr::null_mut(),
                finished,
            }),
        }
    }

    /// Advance to the next block, or null when drained.
    pub fn get_block(&self) -> *mut DataBlock {
        let mut cur = self.cursor.lock();
        cur.block_index += 1;
        let rel = unsafe { &*self.rel };
        if cur.block_index as usize >= rel.blocks.len() {
            cur.finished = true;
            return std::ptr::null_mut();
        }
        let block = &rel.blocks[cur.block_index as usize];
        cur.pos = block.begin();
        (block.as_ref() as *const DataBlock).cast_mut()
    }

    /// Single-threaded tuple cursor over all blocks (in-process use).
    pub fn get(&self) -> *mut u8 {
        let mut cur = self.cursor.lock();
        loop {
            if cur.finished {
                return std::ptr::null_mut();
            }
            let rel = unsafe { &*self.rel };
            let in_block = cur.block_index >= 0
                && (cur.block_index as usize) < rel.blocks.len()
                && !cur.pos.is_null()
                && cur.pos < rel.blocks[cur.block_index as usize].end();
            if in_block {
                let res = cur.pos;
                cur.pos = unsafe { cur.pos.add(self.step) };
                return res;
            }
            cur.block_index += 1;
            if cur.block_index as usize >= rel.blocks.len() {
                cur.finished = true;
                return std::ptr::null_mut();
            }
            cur.pos = rel.blocks[cur.block_index as usize].begin();
        }
    }

    pub fn refresh(&self) {
        let mut cur = self.cursor.lock();
        cur.block_index = -1;
        cur.pos = std::ptr::null_mut();
        cur.finished = unsafe { (*self.rel).blocks.is_empty() };
    }
}

/// Serializes tuple-slot handout through a per-relation mutex, growing a new
/// block when the current one cannot fit another tuple.
#[derive(Debug)]
pub struct AppendIterator {
    pub step: usize,
    rel: *mut Relation,
    state: Mutex<AppendState>,
}

#[derive(Debug)]
struct AppendState {
    block_index: isize,
}

unsafe impl Send for AppendIterator {}
unsafe impl Sync for AppendIterator {}

impl AppendIterator {
    /// # Safety
    ///
    /// `rel` must outlive the iterator; all growth of the relation must go
    /// through this iterator while it exists.
    pub unsafe fn new(rel: *mut Relation) -> Self {
        let block_index = (*rel).blocks.len() as isize - 1;
        Self {
            step: (*rel).schema.tuple_size,
            rel,
            state: Mutex::new(AppendState { block_index }),
        }
    }

    /// Acquire a fresh block and make it current.
    pub fn get_block(&self) -> *mut DataBlock {
        let mut st = self.state.lock();
        let rel = unsafe { &mut *self.rel };
        rel.add_block();
        st.block_index = rel.blocks.len() as isize - 1;
        (rel.blocks[st.block_index as usize].as_ref() as *const DataBlock).cast_mut()
    }

    /// Hand out one tuple slot, advancing the content size.
    pub fn get(&self) -> *mut u8 {
        let mut st = self.state.lock();
        let rel = unsafe { &mut *self.rel };
        let needs_block = st.block_index < 0 || {
            let b = &rel.blocks[st.block_index as usize];
            b.capacity_end() < unsafe { b.end().add(self.step) }
        };
        if needs_block {
            rel.add_block();
            st.block_index = rel.blocks.len() as isize - 1;
        }
        let block = &mut rel.blocks[st.block_index as usize];
        let begin = block.end();
        block.update_content_size_ptr(unsafe { begin.add(self.step) });
        begin
    }
}

/// Maps a global tuple index to `(block, offset)` via binary search on
/// inclusive block-end prefix sums. Built once over a frozen relation.
#[derive(Debug)]
pub struct RandomAccessIterator {
    pub step: usize,
    rel: *const Relation,
    block_starts: Vec<usize>,
    block_ends: Vec<usize>,
    len: usize,
}

unsafe impl Send for RandomAccessIterator {}
unsafe impl Sync for RandomAccessIterator {}

impl RandomAccessIterator {
    /// # Safety
    ///
    /// `rel` must outlive the iterator and must not change shape while it is
    /// used.
    pub unsafe fn new(rel: *const Relation) -> Self {
        let r = &*rel;
        let step = r.schema.tuple_size;
        let mut block_starts = Vec::with_capacity(r.blocks.len());
        let mut block_ends = Vec::with_capacity(r.blocks.len());
        let mut sum = 0usize;
        for block in &r.blocks {
            block_starts.push(sum);
            sum += block.content_size() / step.max(1);
            // last valid index in the block is sum - 1
            block_ends.push(sum.wrapping_sub(1));
        }
        Self {
            step,
            rel,
            block_starts,
            block_ends,
            len: sum,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> *mut u8 {
        let b = self.block_ends.partition_point(|&end| end < index);
        let rel = unsafe { &*self.rel };
        let block_offset = index - self.block_starts[b];
        unsafe { rel.blocks[b].begin().add(block_offset * self.step) }
    }
}
