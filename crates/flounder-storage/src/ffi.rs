//! `extern "C"` entry points for generated code.
//!
//! Compiled queries call these through managed-call IR nodes, passing the
//! iterator/block addresses that were baked into the code as constants.

use crate::block::DataBlock;
use crate::relation::{AppendIterator, ReadIterator};

/// # Safety
///
/// `it` must point to a live [`ReadIterator`].
pub unsafe extern "C" fn read_iter_get_block(it: *mut ReadIterator) -> *mut DataBlock {
    (*it).get_block()
}

/// # Safety
///
/// `it` must point to a live [`ReadIterator`]; no worker may be mid-scan.
pub unsafe extern "C" fn read_iter_refresh(it: *mut ReadIterator) {
    (*it).refresh();
}

/// # Safety
///
/// `it` must point to a live [`AppendIterator`].
pub unsafe extern "C" fn append_iter_get_block(it: *mut AppendIterator) -> *mut DataBlock {
    (*it).get_block()
}

/// # Safety
///
/// `block` must point to a live [`DataBlock`].
pub unsafe extern "C" fn block_begin(block: *mut DataBlock) -> *mut u8 {
    (*block).begin()
}

/// # Safety
///
/// `block` must point to a live [`DataBlock`].
pub unsafe extern "C" fn block_end(block: *mut DataBlock) -> *mut u8 {
    (*block).end()
}

/// # Safety
///
/// `block` must point to a live [`DataBlock`].
pub unsafe extern "C" fn block_capacity_end(block: *mut DataBlock) -> *mut u8 {
    (*block).capacity_end()
}

/// # Safety
///
/// `block` must point to a live [`DataBlock`]; `end_write` must lie within
/// its buffer.
pub unsafe extern "C" fn block_update_content_size(block: *mut DataBlock, end_write: *mut u8) {
    (*block).update_content_size_ptr(end_write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::Relation;
    use flounder_types::{Attribute, Schema, SqlType};

    #[test]
    fn shims_walk_blocks_like_the_iterator() {
        let schema = Schema::new(
            vec![Attribute {
                name: "a".into(),
                ty: SqlType::bigint(),
            }],
            true,
        )
        .unwrap();
        let mut rel = Relation::new(schema).unwrap();
        for i in 0..4i64 {
            let slot = rel.append_tuple();
            unsafe { (slot as *mut i64).write_unaligned(i) };
        }
        let mut it = unsafe { ReadIterator::new(&rel) };
        unsafe {
            let block = read_iter_get_block(&mut it);
            assert!(!block.is_null());
            let begin = block_begin(block);
            let end = block_end(block);
            assert_eq!((end as usize - begin as usize) / 8, 4);
            assert!(block_capacity_end(block) >= end);
            assert!(read_iter_get_block(&mut it).is_null());
        }
    }
}
