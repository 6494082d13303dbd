//! In-place quicksort over a materialized relation.
//!
//! Called once per ORDER BY, by the single worker that won the guard, after
//! the whole input was materialized.

use flounder_storage::{RandomAccessIterator, Relation};
use flounder_types::{compare_at, SqlType};

/// One ORDER BY key: attribute offset within the tuple, its type, and the
/// direction.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub offset: usize,
    pub ty: SqlType,
    pub ascending: bool,
}

/// The order keys for one sort, heap-pinned so its address can be baked into
/// generated code.
pub type OrderRequestList = Vec<OrderRequest>;

struct Quicksorter<'a> {
    iter: RandomAccessIterator,
    tuple_size: usize,
    requests: &'a [OrderRequest],
    scratch: Vec<u8>,
}

impl<'a> Quicksorter<'a> {
    fn record(&self, index: usize) -> *mut u8 {
        self.iter.get(index)
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        let a = self.record(i);
        let b = self.record(j);
        unsafe {
            std::ptr::copy_nonoverlapping(a, self.scratch.as_mut_ptr(), self.tuple_size);
            std::ptr::copy(b, a, self.tuple_size);
            std::ptr::copy_nonoverlapping(self.scratch.as_ptr(), b, self.tuple_size);
        }
    }

    /// True when `first` orders strictly before `second` under the order
    /// keys.
    fn before(&self, first: *const u8, second: *const u8) -> bool {
        for req in self.requests {
            let c = unsafe { compare_at(req.ty, first.add(req.offset), second.add(req.offset)) };
            if req.ascending {
                if c < 0 {
                    return true;
                }
                if c > 0 {
                    return false;
                }
            } else {
                if c > 0 {
                    return true;
                }
                if c < 0 {
                    return false;
                }
            }
        }
        false
    }

    fn partition(&mut self, low: i64, high: i64) -> i64 {
        let pivot = self.record(high as usize) as *const u8;
        let mut i = low;
        for j in low..high {
            if self.before(self.record(j as usize), pivot) {
                self.swap(i as usize, j as usize);
                i += 1;
            }
        }
        self.swap(i as usize, high as usize);
        i
    }

    fn sort(&mut self, low: i64, high: i64) {
        if low < high {
            let pivot = self.partition(low, high);
            self.sort(low, pivot - 1);
            self.sort(pivot + 1, high);
        }
    }
}

/// Sort `rel` in place by the given order keys.
///
/// # Safety
///
/// `rel` must point to a live relation no other thread touches during the
/// sort; `requests` must point to a live [`OrderRequestList`].
pub unsafe extern "C" fn sort_relation(rel: *mut Relation, requests: *const OrderRequestList) {
    let relation = &mut *rel;
    let requests = &*requests;
    let len = relation.tuple_count();
    if len < 2 {
        return;
    }
    let tuple_size = relation.schema.tuple_size;
    let mut sorter = Quicksorter {
        iter: RandomAccessIterator::new(rel),
        tuple_size,
        requests,
        scratch: vec![0u8; tuple_size],
    };
    sorter.sort(0, len as i64 - 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flounder_types::{Attribute, Schema};

    fn two_column_rel(rows: &[(i64, i64)]) -> Relation {
        let schema = Schema::new(
            vec![
                Attribute {
                    name: "a".into(),
                    ty: SqlType::bigint(),
                },
                Attribute {
                    name: "b".into(),
                    ty: SqlType::bigint(),
                },
            ],
            true,
        )
        .unwrap();
        let mut rel = Relation::new(schema).unwrap();
        for &(a, b) in rows {
            let slot = rel.append_tuple();
            unsafe {
                (slot as *mut i64).write_unaligned(a);
                (slot.add(8) as *mut i64).write_unaligned(b);
            }
        }
        rel
    }

    fn collect(rel: &Relation) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        rel.for_each_tuple(|t| unsafe {
            out.push((
                (t as *const i64).read_unaligned(),
                (t.add(8) as *const i64).read_unaligned(),
            ));
        });
        out
    }

    #[test]
    fn ascending_single_key() {
        let mut rel = two_column_rel(&[(3, 0), (1, 1), (2, 2), (1, 3)]);
        let reqs: OrderRequestList = vec![OrderRequest {
            offset: 0,
            ty: SqlType::bigint(),
            ascending: true,
        }];
        unsafe { sort_relation(&mut rel, &reqs) };
        let rows = collect(&rel);
        let keys: Vec<i64> = rows.iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![1, 1, 2, 3]);
    }

    #[test]
    fn descending_then_secondary_key() {
        let mut rel = two_column_rel(&[(1, 5), (2, 1), (1, 2), (2, 9)]);
        let reqs: OrderRequestList = vec![
            OrderRequest {
                offset: 0,
                ty: SqlType::bigint(),
                ascending: false,
            },
            OrderRequest {
                offset: 8,
                ty: SqlType::bigint(),
                ascending: true,
            },
        ];
        unsafe { sort_relation(&mut rel, &reqs) };
        assert_eq!(collect(&rel), vec![(2, 1), (2, 9), (1, 2), (1, 5)]);
    }

    #[test]
    fn scrambled_input_becomes_non_decreasing() {
        let input = [1i64, 1, 2, 1, 2, 3, 1, 2, 3, 4, 1, 2, 3, 4, 5];
        let mut rel = two_column_rel(&input.iter().map(|&a| (a, 0)).collect::<Vec<_>>());
        let reqs: OrderRequestList = vec![OrderRequest {
            offset: 0,
            ty: SqlType::bigint(),
            ascending: true,
        }];
        unsafe { sort_relation(&mut rel, &reqs) };
        let keys: Vec<i64> = collect(&rel).iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4, 5]);
    }
}
