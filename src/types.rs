//! Core types shared by the sharder, the shards and the engine.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::slice;

/// The vertex id type. Vertex ids are dense in `[0, max_vertex_id]` after
/// sharding.
pub type VId = u32;

/// Capability contract for edge-value and vertex-data types.
///
/// A value is stored on disk as its in-memory representation, so it must be
/// a fixed-size plain-old-data type. `parse_text` supports ingestion of
/// weighted edge lists; types that cannot be parsed keep the default.
pub trait FixedWidth: Copy + Default + Send + Sync + 'static {
    fn parse_text(_s: &str) -> Option<Self> {
        None
    }
}

impl FixedWidth for () {}

impl FixedWidth for u32 {
    fn parse_text(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl FixedWidth for i32 {
    fn parse_text(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl FixedWidth for u64 {
    fn parse_text(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl FixedWidth for f32 {
    fn parse_text(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl FixedWidth for f64 {
    fn parse_text(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// A shared mutable cell for fixed-width values.
///
/// Edge-value buffers are handed out to parallel vertex updates as slices of
/// `SyncCell`. Two vertices whose edge lists reference the same cell are
/// never updated concurrently (the engine runs conflicting vertices one at
/// a time), so plain loads and stores suffice.
#[repr(transparent)]
pub struct SyncCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncCell<T> {}

impl<T: Copy> SyncCell<T> {
    pub fn new(value: T) -> Self {
        SyncCell(UnsafeCell::new(value))
    }

    #[inline]
    pub fn get(&self) -> T {
        unsafe { self.0.get().read() }
    }

    #[inline]
    pub fn set(&self, value: T) {
        unsafe { self.0.get().write(value) }
    }
}

/// Reinterprets a value slice as raw bytes.
pub fn as_bytes<T: Copy>(values: &[T]) -> &[u8] {
    unsafe { slice::from_raw_parts(values.as_ptr() as *const u8, values.len() * size_of::<T>()) }
}

/// Reinterprets a byte slice as a value slice. The byte length must be a
/// multiple of `size_of::<T>()`.
pub unsafe fn from_bytes<T: Copy>(bytes: &[u8]) -> &[T] {
    debug_assert_eq!(bytes.len() % size_of::<T>().max(1), 0);
    slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / size_of::<T>())
}

/// Mutable variant of [`from_bytes`].
pub unsafe fn from_bytes_mut<T: Copy>(bytes: &mut [u8]) -> &mut [T] {
    debug_assert_eq!(bytes.len() % size_of::<T>().max(1), 0);
    slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, bytes.len() / size_of::<T>())
}

/// Copies values out of a byte image with no alignment requirement, e.g.
/// a file read straight into a `Vec<u8>`.
pub fn copy_values<T: Copy>(bytes: &[u8]) -> Vec<T> {
    let width = size_of::<T>().max(1);
    debug_assert_eq!(bytes.len() % width, 0);
    (0..bytes.len() / width)
        .map(|i| unsafe { (bytes.as_ptr().add(i * width) as *const T).read_unaligned() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_views() {
        let values: [u32; 3] = [1, 2, 3];
        let bytes = as_bytes(&values);
        assert_eq!(bytes.len(), 12);
        assert_eq!(unsafe { from_bytes::<u32>(bytes) }, &values);
    }

    #[test]
    fn test_sync_cell() {
        let cell = SyncCell::new(7u32);
        assert_eq!(cell.get(), 7);
        cell.set(9);
        assert_eq!(cell.get(), 9);
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(f32::parse_text("2.5"), Some(2.5));
        assert_eq!(u32::parse_text("x"), None);
    }
}
