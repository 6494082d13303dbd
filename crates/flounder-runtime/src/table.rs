//! Open-addressed hash table with linear probing.
//!
//! Entries are packed: a one-byte status, the 64-bit hash, then the payload
//! bytes. A slot with status 0 is empty; status transitions 0 → 1 exactly
//! once via compare-and-swap, after which hash and payload are written.
//! Inserts are lock-free with respect to each other; `put` and `get` on the
//! same bucket are only safe when separated by a barrier (build-then-probe
//! discipline). Growth is single-threaded and never concurrent with probes.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::fault::{runtime_fault, RuntimeFault};

/// Bytes of the packed entry header: status (1) + hash (8).
pub const ENTRY_HEADER_SIZE: usize = 9;

const ENTRY_ALIGN: usize = 64;

/// Table capacities: the smallest prime at least the requested minimum is
/// chosen from this ladder.
const PRIME_SIZES: [u64; 62] = [
    5,
    11,
    23,
    47,
    97,
    199,
    409,
    823,
    1741,
    3469,
    6949,
    14033,
    28411,
    57557,
    116731,
    236897,
    480881,
    976369,
    1982627,
    4026031,
    8175383,
    16601593,
    33712729,
    68460391,
    139022417,
    282312799,
    573292817,
    1164186217,
    2364114217,
    4294967291,
    8589934583,
    17179869143,
    34359738337,
    68719476731,
    137438953447,
    274877906899,
    549755813881,
    1099511627689,
    2199023255531,
    4398046511093,
    8796093022151,
    17592186044399,
    35184372088777,
    70368744177643,
    140737488355213,
    281474976710597,
    562949953421231,
    1125899906842597,
    2251799813685119,
    4503599627370449,
    9007199254740881,
    18014398509481951,
    36028797018963913,
    72057594037927931,
    144115188075855859,
    288230376151711717,
    576460752303423433,
    1152921504606846883,
    2305843009213693951,
    4611686018427387847,
    9223372036854775783,
    18446744073709551557,
];

/// The hash table header. Boxed by its owner so that generated code can read
/// the `entries`/`entries_end` fields at their baked-in addresses even after
/// a grow hot-swapped the buffer.
#[derive(Debug)]
pub struct HashTable {
    /// Number of slots allocated.
    pub num_entries: usize,
    prime_index: usize,
    /// Entry stride: header + payload.
    pub full_entry_size: usize,
    pub payload_size: usize,
    /// Slot buffer start; generated code reads this field directly.
    pub entries: *mut u8,
    /// One past the last slot; generated code reads this field directly.
    pub entries_end: *mut u8,
    capacity_threshold: usize,
    num_inserts: AtomicUsize,
}

unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

fn pick_prime(min_size: usize) -> (usize, usize) {
    for (i, &p) in PRIME_SIZES.iter().enumerate() {
        if p > min_size as u64 {
            return (i, p as usize);
        }
    }
    runtime_fault(RuntimeFault::OutOfMemory);
}

impl HashTable {
    /// Allocate a table with at least `min_size` slots of `payload_size`
    /// payload bytes each. Status bytes are zeroed in parallel, one task per
    /// hardware thread with a minimum stride of 10 000 entries.
    pub fn allocate(min_size: usize, payload_size: usize) -> Box<Self> {
        // room to insert at least one element without an immediate resize
        let min_size = min_size.max(2);
        let (prime_index, num_entries) = pick_prime(min_size);
        let full_entry_size = ENTRY_HEADER_SIZE + payload_size;
        let bytes = num_entries * full_entry_size;
        let layout = Layout::from_size_align(bytes, ENTRY_ALIGN).expect("entry layout");
        let entries = unsafe { alloc(layout) };
        if entries.is_null() {
            runtime_fault(RuntimeFault::OutOfMemory);
        }
        let table = Box::new(Self {
            num_entries,
            prime_index,
            full_entry_size,
            payload_size,
            entries,
            entries_end: unsafe { entries.add(bytes) },
            capacity_threshold: num_entries * 6 / 10,
            num_inserts: AtomicUsize::new(0),
        });
        table.init_status_parallel();
        table
    }

    fn init_status_parallel(&self) {
        let nthreads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let step = ((self.num_entries + nthreads) / nthreads).max(10_000);
        let base = self.entries as usize;
        let stride = self.full_entry_size;
        std::thread::scope(|scope| {
            let mut from = 0usize;
            while from < self.num_entries {
                let to = (from + step).min(self.num_entries);
                scope.spawn(move || {
                    for i in from..to {
                        unsafe { ((base + i * stride) as *mut u8).write(0) };
                    }
                });
                from = to;
            }
        });
    }

    fn slot(&self, index: usize) -> *mut u8 {
        unsafe { self.entries.add(index * self.full_entry_size) }
    }

    fn status(&self, entry: *mut u8) -> &AtomicU8 {
        unsafe { &*(entry as *const AtomicU8) }
    }

    pub fn len(&self) -> usize {
        self.num_inserts.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reinsert every live entry into a freshly allocated, larger table and
    /// hot-swap the buffer. Must not run concurrently with `put`/`get`.
    fn grow(&mut self) {
        tracing::debug!(
            entries = self.num_entries,
            inserts = self.len(),
            "hash table grow"
        );
        let mut larger = Self::allocate(self.num_entries + 1, self.payload_size);
        let mut addr = self.entries;
        while addr < self.entries_end {
            let status = self.status(addr).load(Ordering::Relaxed);
            if status > 0 {
                let hash = unsafe { (addr.add(1) as *const u64).read_unaligned() };
                let new_payload = larger.put(hash);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        addr.add(ENTRY_HEADER_SIZE),
                        new_payload,
                        self.payload_size,
                    );
                }
            }
            addr = unsafe { addr.add(self.full_entry_size) };
        }
        // hot swap: free the old buffer and adopt the larger table's header
        let old_layout =
            Layout::from_size_align(self.num_entries * self.full_entry_size, ENTRY_ALIGN)
                .expect("entry layout");
        unsafe { dealloc(self.entries, old_layout) };
        self.num_entries = larger.num_entries;
        self.prime_index = larger.prime_index;
        self.entries = larger.entries;
        self.entries_end = larger.entries_end;
        self.capacity_threshold = larger.capacity_threshold;
        self.num_inserts = AtomicUsize::new(larger.len());
        // the buffer now belongs to self; disarm the donor's drop
        larger.entries = std::ptr::null_mut();
        larger.entries_end = std::ptr::null_mut();
        larger.num_entries = 0;
    }

    /// Insert an entry for `hash` and return the address of its payload.
    ///
    /// Linear probing from `hash mod N`; each empty slot is claimed with a
    /// status CAS. A full scan with no empty slot terminates the process.
    pub fn put(&mut self, hash: u64) -> *mut u8 {
        let inserts = self.num_inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts > self.capacity_threshold {
            self.grow();
        }

        let mut loc = (hash % self.num_entries as u64) as usize;
        let mut probes = 0usize;
        while probes < self.num_entries {
            let entry = self.slot(loc);
            let status = self.status(entry);
            let mut current = status.load(Ordering::Acquire);
            while current == 0 {
                match status.compare_exchange_weak(0, 1, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        unsafe { (entry.add(1) as *mut u64).write_unaligned(hash) };
                        return unsafe { entry.add(ENTRY_HEADER_SIZE) };
                    }
                    Err(seen) => current = seen,
                }
            }
            loc += 1;
            if loc >= self.num_entries {
                loc = 0;
            }
            probes += 1;
        }
        runtime_fault(RuntimeFault::HashTableFull);
    }

    /// Probe for entries matching `hash`.
    ///
    /// With `prev` null a new probe starts at `hash mod N`; otherwise the
    /// probe continues at the slot following `prev`. Returns the payload of
    /// the next slot with a matching hash, or null once an empty slot is
    /// reached.
    pub fn get(&self, hash: u64, prev: *const u8) -> *mut u8 {
        let mut entry = if prev.is_null() {
            self.slot((hash % self.num_entries as u64) as usize)
        } else {
            // first address after the previous payload is the next entry
            unsafe { (prev as *mut u8).add(self.payload_size) }
        };

        loop {
            if self.status(entry).load(Ordering::Acquire) == 0 {
                return std::ptr::null_mut();
            }
            let entry_hash = unsafe { (entry.add(1) as *const u64).read_unaligned() };
            if entry_hash == hash {
                return unsafe { entry.add(ENTRY_HEADER_SIZE) };
            }
            entry = unsafe { entry.add(self.full_entry_size) };
            if entry >= self.entries_end {
                entry = self.entries;
            }
        }
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        if self.entries.is_null() {
            return;
        }
        let layout = Layout::from_size_align(self.num_entries * self.full_entry_size, ENTRY_ALIGN)
            .expect("entry layout");
        unsafe { dealloc(self.entries, layout) };
    }
}

/// # Safety
///
/// `ht` must point to a live [`HashTable`]; growth must not race probes.
pub unsafe extern "C" fn ht_put(ht: *mut HashTable, hash: u64) -> *mut u8 {
    (*ht).put(hash)
}

/// # Safety
///
/// `ht` must point to a live [`HashTable`]; `prev` must be null or a payload
/// pointer previously returned for the same table.
pub unsafe extern "C" fn ht_get(ht: *mut HashTable, hash: u64, prev: *const u8) -> *mut u8 {
    (*ht).get(hash, prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn capacities_come_from_the_prime_ladder() {
        let t = HashTable::allocate(100, 8);
        assert_eq!(t.num_entries, 199);
        let t = HashTable::allocate(1, 8);
        assert_eq!(t.num_entries, 5);
    }

    #[test]
    fn put_then_get_roundtrip() {
        let mut t = HashTable::allocate(64, 8);
        for k in 0..50u64 {
            let payload = t.put(k * 31);
            unsafe { (payload as *mut u64).write_unaligned(k) };
        }
        for k in 0..50u64 {
            let payload = t.get(k * 31, std::ptr::null());
            assert!(!payload.is_null());
            assert_eq!(unsafe { (payload as *const u64).read_unaligned() }, k);
        }
        assert!(t.get(9999, std::ptr::null()).is_null());
    }

    #[test]
    fn duplicate_hashes_chain_through_prev() {
        let mut t = HashTable::allocate(64, 8);
        for v in 0..3u64 {
            let payload = t.put(7);
            unsafe { (payload as *mut u64).write_unaligned(v) };
        }
        let mut seen = Vec::new();
        let mut prev = std::ptr::null_mut::<u8>();
        loop {
            prev = t.get(7, prev);
            if prev.is_null() {
                break;
            }
            seen.push(unsafe { (prev as *const u64).read_unaligned() });
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn grow_preserves_entries() {
        let mut t = HashTable::allocate(2, 8);
        // push far past the 60% threshold of the initial prime
        for k in 0..200u64 {
            let payload = t.put(k.wrapping_mul(0x9e3779b97f4a7c15));
            unsafe { (payload as *mut u64).write_unaligned(k) };
        }
        assert!(t.num_entries > 5);
        for k in 0..200u64 {
            let payload = t.get(k.wrapping_mul(0x9e3779b97f4a7c15), std::ptr::null());
            assert!(!payload.is_null(), "key {k} lost in grow");
        }
    }

    #[test]
    fn concurrent_puts_do_not_lose_slots() {
        // large enough that no grow happens mid-test
        let mut t = HashTable::allocate(100_000, 8);
        let addr = (&mut *t) as *mut HashTable as usize;
        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                scope.spawn(move || {
                    for i in 0..2_000u64 {
                        let key = thread * 10_000 + i;
                        unsafe {
                            let payload = ht_put(addr as *mut HashTable, key);
                            (payload as *mut u64).write_unaligned(key);
                        }
                    }
                });
            }
        });
        for thread in 0..4u64 {
            for i in 0..2_000u64 {
                let key = thread * 10_000 + i;
                let mut prev = std::ptr::null_mut::<u8>();
                let mut found = false;
                loop {
                    prev = t.get(key, prev);
                    if prev.is_null() {
                        break;
                    }
                    if unsafe { (prev as *const u64).read_unaligned() } == key {
                        found = true;
                        break;
                    }
                }
                assert!(found, "key {key} missing after concurrent build");
            }
        }
    }

    proptest! {
        #[test]
        fn every_inserted_payload_is_reachable_exactly_once(keys in prop::collection::vec(0u64..1000, 1..200)) {
            let mut t = HashTable::allocate(16, 8);
            let mut inserted: Vec<(u64, usize)> = Vec::new();
            for (i, &k) in keys.iter().enumerate() {
                let payload = t.put(k);
                unsafe { (payload as *mut u64).write_unaligned(i as u64) };
                inserted.push((k, i));
            }
            for &(k, i) in &inserted {
                let mut prev = std::ptr::null_mut::<u8>();
                let mut hits = 0usize;
                loop {
                    prev = t.get(k, prev);
                    if prev.is_null() { break; }
                    if unsafe { (prev as *const u64).read_unaligned() } == i as u64 {
                        hits += 1;
                    }
                }
                prop_assert_eq!(hits, 1);
            }
        }
    }
}
