//! Heap sequences and maps. Both use the same growable, doubling layout:
//! a header (`kind` + `len` + `capacity`) followed by `capacity` inline
//! slots. Insertion/push may outgrow the current block, in which case a
//! new, larger block is allocated and the old one abandoned — this is
//! why every mutator returns a (possibly new) handle rather than mutating
//! in place (spec §4.6 "Sequence"/"Map").

use crate::heap;
use crate::value::{self, Kind};

const INITIAL_CAPACITY: u64 = 4;

#[repr(C)]
struct SeqHeader {
    kind: u8,
    _pad: [u8; 7],
    len: u64,
    capacity: u64,
}

const SEQ_HEADER_SIZE: usize = std::mem::size_of::<SeqHeader>();

#[repr(C)]
struct MapEntry {
    key: f64,
    value: f64,
}

#[repr(C)]
struct MapHeader {
    kind: u8,
    _pad: [u8; 7],
    len: u64,
    capacity: u64,
}

const MAP_HEADER_SIZE: usize = std::mem::size_of::<MapHeader>();

unsafe fn seq_header(ptr: *mut u8) -> &'static mut SeqHeader {
    unsafe { &mut *(ptr as *mut SeqHeader) }
}

unsafe fn seq_slot(ptr: *mut u8, index: u64) -> *mut f64 {
    unsafe { ptr.add(SEQ_HEADER_SIZE + index as usize * std::mem::size_of::<f64>()) as *mut f64 }
}

fn alloc_sequence(capacity: u64) -> *mut u8 {
    let size = SEQ_HEADER_SIZE + capacity as usize * std::mem::size_of::<f64>();
    let ptr = unsafe { heap::alloc(size) };
    unsafe {
        *(ptr as *mut SeqHeader) = SeqHeader { kind: Kind::Sequence as u8, _pad: [0; 7], len: 0, capacity };
    }
    ptr
}

/// Reads the items currently stored in a sequence.
///
/// # Safety
/// `ptr` must point at a live [`SeqHeader`] this module allocated.
pub unsafe fn sequence_items(ptr: *mut u8) -> &'static [f64] {
    let h = unsafe { seq_header(ptr) };
    unsafe { std::slice::from_raw_parts(ptr.add(SEQ_HEADER_SIZE) as *const f64, h.len as usize) }
}

/// # Safety
/// Called only by compiler-generated code; `count_hint` is advisory.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sequence_new(count_hint: f64) -> f64 {
    let capacity = (count_hint.max(0.0) as u64).max(INITIAL_CAPACITY);
    value::ptr_to_value(alloc_sequence(capacity))
}

/// Appends `item`, returning the handle of the (possibly reallocated)
/// sequence.
///
/// # Safety
/// `seq` must be a heap sequence produced by [`sequence_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sequence_push(seq: f64, item: f64) -> f64 {
    let ptr: *mut u8 = value::value_to_ptr(seq);
    let h = unsafe { seq_header(ptr) };
    if h.len < h.capacity {
        unsafe { *seq_slot(ptr, h.len) = item };
        h.len += 1;
        return seq;
    }
    let new_capacity = (h.capacity * 2).max(INITIAL_CAPACITY);
    let new_ptr = alloc_sequence(new_capacity);
    let new_h = unsafe { seq_header(new_ptr) };
    unsafe {
        std::ptr::copy_nonoverlapping(ptr.add(SEQ_HEADER_SIZE) as *const f64, new_ptr.add(SEQ_HEADER_SIZE) as *mut f64, h.len as usize);
        *seq_slot(new_ptr, h.len) = item;
    }
    new_h.len = h.len + 1;
    value::ptr_to_value(new_ptr)
}

unsafe fn map_header(ptr: *mut u8) -> &'static mut MapHeader {
    unsafe { &mut *(ptr as *mut MapHeader) }
}

unsafe fn map_slot(ptr: *mut u8, index: u64) -> *mut MapEntry {
    unsafe { ptr.add(MAP_HEADER_SIZE + index as usize * std::mem::size_of::<MapEntry>()) as *mut MapEntry }
}

fn alloc_map(capacity: u64) -> *mut u8 {
    let size = MAP_HEADER_SIZE + capacity as usize * std::mem::size_of::<MapEntry>();
    let ptr = unsafe { heap::alloc(size) };
    unsafe {
        *(ptr as *mut MapHeader) = MapHeader { kind: Kind::Map as u8, _pad: [0; 7], len: 0, capacity };
    }
    ptr
}

/// # Safety
/// Called only by compiler-generated code; `_unused` carries no meaning.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn map_new(_unused: f64) -> f64 {
    value::ptr_to_value(alloc_map(INITIAL_CAPACITY))
}

/// Inserts or overwrites `key` -> `value`, returning the handle of the
/// (possibly reallocated) map.
///
/// # Safety
/// `map` must be a heap map produced by [`map_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn map_insert(map: f64, key: f64, value: f64) -> f64 {
    let ptr: *mut u8 = value::value_to_ptr(map);
    let h = unsafe { map_header(ptr) };
    for i in 0..h.len {
        let entry = unsafe { &mut *map_slot(ptr, i) };
        if entry.key.to_bits() == key.to_bits() {
            entry.value = value;
            return map;
        }
    }
    if h.len < h.capacity {
        unsafe { *map_slot(ptr, h.len) = MapEntry { key, value } };
        h.len += 1;
        return map;
    }
    let new_capacity = (h.capacity * 2).max(INITIAL_CAPACITY);
    let new_ptr = alloc_map(new_capacity);
    let new_h = unsafe { map_header(new_ptr) };
    unsafe {
        std::ptr::copy_nonoverlapping(ptr.add(MAP_HEADER_SIZE) as *const MapEntry, new_ptr.add(MAP_HEADER_SIZE) as *mut MapEntry, h.len as usize);
        *map_slot(new_ptr, h.len) = MapEntry { key, value };
    }
    new_h.len = h.len + 1;
    value::ptr_to_value(new_ptr)
}

fn map_lookup(ptr: *mut u8, key: f64) -> Option<f64> {
    let h = unsafe { map_header(ptr) };
    for i in 0..h.len {
        let entry = unsafe { &*map_slot(ptr, i) };
        if entry.key.to_bits() == key.to_bits() {
            return Some(entry.value);
        }
    }
    None
}

/// Indexing into a sequence, map, or string (spec §4.6 "Index"). Takes
/// the container first (`xmm0`) and the index second (`xmm1`), matching
/// `codegen::expr::lower_runtime_binop`'s left-then-right lowering order.
///
/// # Safety
/// `container` must be a heap value this module or [`crate::strings`]
/// produced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn index_get(container: f64, index: f64) -> f64 {
    if let Some(code) = value::error_code(container) {
        return value::error_value(code);
    }
    let ptr: *mut u8 = value::value_to_ptr(container);
    if ptr.is_null() {
        return value::error_value(value::NULL_POINTER);
    }
    match unsafe { Kind::of(ptr) } {
        Kind::Sequence => {
            let items = unsafe { sequence_items(ptr) };
            let i = index as i64;
            if i < 0 || i as usize >= items.len() {
                return value::error_value(value::INDEX_OUT_OF_BOUNDS);
            }
            items[i as usize]
        }
        Kind::Map => match map_lookup(ptr, index) {
            Some(v) => v,
            None => value::error_value(value::MISSING_KEY),
        },
        Kind::Str => {
            let bytes = unsafe { crate::strings::bytes(ptr) };
            let i = index as i64;
            if i < 0 || i as usize >= bytes.len() {
                return value::error_value(value::INDEX_OUT_OF_BOUNDS);
            }
            crate::strings::make_string(&bytes[i as usize..=i as usize])
        }
        Kind::Closure => value::error_value(value::TYPE_MISMATCH),
    }
}

/// `[start, end)` slice of a sequence or string (spec §4.6 "Slice").
///
/// # Safety
/// `container` must be a heap value this module or [`crate::strings`]
/// produced; `range` must be a 2-element heap sequence `[start, end]`
/// produced by a bare `Range` value (`codegen::expr`'s `Expr::Range`
/// lowering).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn slice(container: f64, range: f64) -> f64 {
    if let Some(code) = value::error_code(container) {
        return value::error_value(code);
    }
    let ptr: *mut u8 = value::value_to_ptr(container);
    if ptr.is_null() {
        return value::error_value(value::NULL_POINTER);
    }
    let range_ptr: *mut u8 = value::value_to_ptr(range);
    let bounds = if range_ptr.is_null() { &[][..] } else { unsafe { sequence_items(range_ptr) } };
    let start = bounds.first().copied().unwrap_or(0.0).max(0.0) as usize;
    let end_bound = bounds.get(1).copied().unwrap_or(f64::INFINITY);
    let end = if end_bound.is_infinite() { usize::MAX } else { (end_bound.max(0.0) as usize).max(start) };
    match unsafe { Kind::of(ptr) } {
        Kind::Sequence => {
            let items = unsafe { sequence_items(ptr) };
            let end = end.min(items.len());
            let start = start.min(end);
            let ptr = value::ptr_to_value(alloc_sequence((end - start).max(INITIAL_CAPACITY as usize) as u64));
            let dst: *mut u8 = value::value_to_ptr(ptr);
            let h = unsafe { seq_header(dst) };
            for (i, item) in items[start..end].iter().enumerate() {
                unsafe { *seq_slot(dst, i as u64) = *item };
            }
            h.len = (end - start) as u64;
            ptr
        }
        Kind::Str => {
            let bytes = unsafe { crate::strings::bytes(ptr) };
            let end = end.min(bytes.len());
            let start = start.min(end);
            crate::strings::make_string(&bytes[start..end])
        }
        _ => value::error_value(value::TYPE_MISMATCH),
    }
}

/// Membership test (spec §4.6 "`in`").
///
/// # Safety
/// `container` must be a heap value this module or [`crate::strings`]
/// produced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn contains(needle: f64, container: f64) -> f64 {
    let ptr: *mut u8 = value::value_to_ptr(container);
    if ptr.is_null() {
        return 0.0;
    }
    let found = match unsafe { Kind::of(ptr) } {
        Kind::Sequence => unsafe { sequence_items(ptr) }.iter().any(|v| v.to_bits() == needle.to_bits()),
        Kind::Map => map_lookup(ptr, needle).is_some(),
        Kind::Str => {
            let needle_ptr: *const u8 = value::value_to_ptr(needle);
            if needle_ptr.is_null() || unsafe { Kind::of(needle_ptr) } != Kind::Str {
                false
            } else {
                let haystack = unsafe { crate::strings::bytes(ptr) };
                let needle_bytes = unsafe { crate::strings::bytes(needle_ptr) };
                haystack.windows(needle_bytes.len().max(1)).any(|w| w == needle_bytes) && !needle_bytes.is_empty()
            }
        }
        Kind::Closure => false,
    };
    if found { 1.0 } else { 0.0 }
}

/// Prepends `item` to a sequence, returning a new handle (spec §4.6
/// "Cons").
///
/// # Safety
/// `seq` must be a heap sequence produced by [`sequence_new`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cons(item: f64, seq: f64) -> f64 {
    let ptr: *mut u8 = value::value_to_ptr(seq);
    let items = if ptr.is_null() { &[][..] } else { unsafe { sequence_items(ptr) } };
    let new_ptr = alloc_sequence((items.len() as u64 + 1).max(INITIAL_CAPACITY));
    let h = unsafe { seq_header(new_ptr) };
    unsafe {
        *seq_slot(new_ptr, 0) = item;
        for (i, v) in items.iter().enumerate() {
            *seq_slot(new_ptr, i as u64 + 1) = *v;
        }
    }
    h.len = items.len() as u64 + 1;
    value::ptr_to_value(new_ptr)
}

/// Element/entry/byte count, dispatched by [`Kind`] (spec §4.6 "`length`").
///
/// # Safety
/// `v` must either be a heap value this module or [`crate::strings`]
/// produced, or a plain number/null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn length(v: f64) -> f64 {
    if let Some(code) = value::error_code(v) {
        return value::error_value(code);
    }
    let ptr: *mut u8 = value::value_to_ptr(v);
    if ptr.is_null() {
        return value::error_value(value::TYPE_MISMATCH);
    }
    match unsafe { Kind::of(ptr) } {
        Kind::Sequence => unsafe { seq_header(ptr) }.len as f64,
        Kind::Map => unsafe { map_header(ptr) }.len as f64,
        Kind::Str => unsafe { crate::strings::bytes(ptr) }.len() as f64,
        Kind::Closure => value::error_value(value::TYPE_MISMATCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_grows_past_initial_capacity() {
        let mut seq = unsafe { sequence_new(0.0) };
        for i in 0..10 {
            seq = unsafe { sequence_push(seq, i as f64) };
        }
        let ptr: *mut u8 = value::value_to_ptr(seq);
        assert_eq!(unsafe { sequence_items(ptr) }.len(), 10);
        assert_eq!(unsafe { length(seq) }, 10.0);
    }

    #[test]
    fn map_insert_then_get_round_trips() {
        let mut map = unsafe { map_new(0.0) };
        map = unsafe { map_insert(map, 1.0, 100.0) };
        map = unsafe { map_insert(map, 2.0, 200.0) };
        assert_eq!(unsafe { index_get(map, 1.0) }, 100.0);
        assert_eq!(unsafe { index_get(map, 2.0) }, 200.0);
    }

    #[test]
    fn index_get_on_missing_key_is_a_key_error() {
        let map = unsafe { map_new(0.0) };
        let result = unsafe { index_get(map, 99.0) };
        assert_eq!(value::error_code(result), Some(value::MISSING_KEY));
    }

    #[test]
    fn index_get_out_of_bounds_on_sequence() {
        let seq = unsafe { sequence_push(sequence_new(0.0), 1.0) };
        let result = unsafe { index_get(seq, 5.0) };
        assert_eq!(value::error_code(result), Some(value::INDEX_OUT_OF_BOUNDS));
    }

    #[test]
    fn cons_prepends_without_mutating_original() {
        let seq = unsafe { sequence_push(sequence_new(0.0), 2.0) };
        let grown = unsafe { cons(1.0, seq) };
        let ptr: *mut u8 = value::value_to_ptr(grown);
        assert_eq!(unsafe { sequence_items(ptr) }, &[1.0, 2.0]);
    }
}
