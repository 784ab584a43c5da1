//! Per-chunk exchange point for the current block array backend.
//!
//! A chunk owns one [`BlockDataSlot`]. Reads and writes go to whatever
//! backend the slot currently holds; deflation and widening publish a new
//! backend by swapping the slot's [`Arc`]. Mutations share a read lock and a
//! swap takes the write lock, so no mutation can land on a backend after it
//! has been copied for replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tera_config::StorageConfig;

use crate::array::{BlockArray, TypeTag, deflate_array};
use crate::codec::{BlobError, decode_blob, encode_blob};
use crate::deflate::Deflator;
use crate::dense::dense_copy;
use crate::error::BlockDataError;
use crate::extent::Extent;
use crate::handler::{ArrayFactory, HandlerRegistry, SerializedArray};
use crate::width::{Bits16, ElementWidth, fits_bits, narrowest_bits};

/// Holds the current backend of one chunk and swaps it atomically.
#[derive(Debug)]
pub struct BlockDataSlot {
    current: RwLock<Arc<dyn BlockArray>>,
    extent: Extent,
    /// Number of backend swaps so far.
    version: AtomicU64,
    /// Successful `set`/`compare_and_set` calls so far.
    mutations: AtomicU64,
    /// Value of `mutations` at the last deflation request.
    deflated_at: AtomicU64,
}

impl BlockDataSlot {
    /// Wraps an existing backend.
    pub fn new(array: Arc<dyn BlockArray>) -> Self {
        Self {
            extent: array.extent(),
            current: RwLock::new(array),
            version: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            deflated_at: AtomicU64::new(0),
        }
    }

    /// Creates a slot holding an empty array from `factory`.
    pub fn new_empty(factory: &dyn ArrayFactory, extent: Extent) -> Self {
        Self::new(Arc::from(factory.create(extent)))
    }

    /// Creates an empty slot with the configured chunk extent and default
    /// dense width.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::InvalidExtent`] or
    /// [`BlockDataError::UnsupportedBitWidth`] for bad configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self, BlockDataError> {
        let [size_x, size_y, size_z] = config.chunk_extent.map(|size| size as usize);
        let extent = Extent::try_new(size_x, size_y, size_z)?;
        let factory = HandlerRegistry::global().dense_factory(config.default_bit_width)?;
        Ok(Self::new_empty(factory, extent))
    }

    /// Decodes a slot from a TBLK blob.
    pub fn from_blob(data: &[u8]) -> Result<Self, BlobError> {
        Ok(Self::new(Arc::from(decode_blob(data)?)))
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Tag of the backend currently held.
    pub fn type_tag(&self) -> TypeTag {
        self.read().type_tag()
    }

    pub fn bit_width(&self) -> u8 {
        self.read().bit_width()
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> i32 {
        self.read().get(x, y, z)
    }

    /// Stores `value` and returns the previous element.
    ///
    /// If the current backend is too narrow for `value` (for example after
    /// deflation narrowed it), the slot first switches to a dense backend
    /// wide enough to hold it.
    pub fn set(&self, x: usize, y: usize, z: usize, value: i32) -> i32 {
        let previous = self.with_room_for(value, |array| array.set(x, y, z, value));
        self.mutations.fetch_add(1, Ordering::Relaxed);
        previous
    }

    /// Stores `value` only if the current element equals `expected`.
    ///
    /// Widens the backend like [`set`](Self::set) when `value` does not fit.
    pub fn compare_and_set(
        &self,
        x: usize,
        y: usize,
        z: usize,
        value: i32,
        expected: i32,
    ) -> bool {
        let stored =
            self.with_room_for(value, |array| array.compare_and_set(x, y, z, value, expected));
        if stored {
            self.mutations.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    /// Offers the current backend to `deflator` and adopts the result.
    ///
    /// Blocks mutations for the duration. Returns the backend held afterwards,
    /// which is the previous one if the deflator declined.
    pub fn request_deflate(&self, deflator: &dyn Deflator) -> Arc<dyn BlockArray> {
        let mut current = self.write();
        let before = Arc::clone(&current);
        let after = deflate_array(Arc::clone(&before), deflator);
        self.deflated_at
            .store(self.mutations.load(Ordering::Relaxed), Ordering::Relaxed);

        if !Arc::ptr_eq(&before, &after) {
            tracing::debug!(
                from = ?before.type_tag(),
                to = ?after.type_tag(),
                before_bytes = before.storage_bytes(),
                after_bytes = after.storage_bytes(),
                "adopted deflated block array"
            );
            *current = Arc::clone(&after);
            self.version.fetch_add(1, Ordering::Release);
        }
        after
    }

    /// Returns the backend currently held. Writes made through the slot after
    /// a later swap are not visible through the returned snapshot.
    pub fn snapshot(&self) -> Arc<dyn BlockArray> {
        Arc::clone(&self.read())
    }

    /// Installs `array` and returns the backend it replaces.
    ///
    /// # Panics
    ///
    /// Panics if `array` has a different extent from the slot.
    pub fn replace(&self, array: Arc<dyn BlockArray>) -> Arc<dyn BlockArray> {
        assert_eq!(array.extent(), self.extent, "replacement changes the extent");
        let mut current = self.write();
        self.version.fetch_add(1, Ordering::Release);
        std::mem::replace(&mut *current, array)
    }

    /// Number of backend swaps (deflations, widenings, replacements) so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Successful mutations since the last deflation request. Owners use it
    /// to decide when another deflation is worth trying.
    pub fn mutations_since_deflate(&self) -> u64 {
        self.mutations
            .load(Ordering::Relaxed)
            .saturating_sub(self.deflated_at.load(Ordering::Relaxed))
    }

    /// Serializes the current backend with the process-wide registry.
    pub fn serialize(&self) -> Result<SerializedArray, BlockDataError> {
        HandlerRegistry::global().serialize(self.read().as_ref())
    }

    /// Encodes the current backend as a TBLK blob.
    pub fn to_blob(&self) -> Vec<u8> {
        encode_blob(self.read().as_ref())
    }

    /// Runs `op` on a backend able to represent `value`, widening first if
    /// needed. Values no width can hold go straight to the backend, which
    /// treats them as a contract violation.
    fn with_room_for<R>(&self, value: i32, op: impl Fn(&dyn BlockArray) -> R) -> R {
        loop {
            let current = self.read();
            if fits_bits(current.bit_width(), value) || !Bits16::fits(value) {
                return op(current.as_ref());
            }
            drop(current);
            self.widen_for(value);
        }
    }

    fn widen_for(&self, value: i32) {
        let mut current = self.write();
        let bits = current.bit_width();
        if fits_bits(bits, value) {
            // Another writer widened it first.
            return;
        }
        let target = narrowest_bits(value, value).max(bits);
        match dense_copy(current.as_ref(), target) {
            Ok(wider) => {
                tracing::debug!(
                    from = ?current.type_tag(),
                    to = ?wider.type_tag(),
                    value,
                    "widened block array"
                );
                *current = Arc::from(wider);
                self.version.fetch_add(1, Ordering::Release);
            }
            Err(err) => tracing::warn!("cannot widen block array: {err}"),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<dyn BlockArray>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<dyn BlockArray>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::contents_equal;
    use crate::deflate::ColumnDeflator;
    use crate::dense::{DenseArray8Bit, DenseArray16Bit};
    use crate::handler::DenseFactory;
    use crate::width::Bits8;

    fn column_of_nines() -> BlockDataSlot {
        BlockDataSlot::new(Arc::new(DenseArray8Bit::from_fn(
            Extent::new(1, 4, 1),
            |_, _, _| 9,
        )))
    }

    #[test]
    fn test_mutations_go_to_current_backend() {
        let factory = DenseFactory::<Bits8>::default();
        let slot = BlockDataSlot::new_empty(&factory, Extent::new(2, 2, 2));
        assert_eq!(slot.set(1, 1, 1, 5), 0);
        assert_eq!(slot.get(1, 1, 1), 5);
        assert_eq!(slot.get(0, 0, 0), 0);
        assert!(!slot.compare_and_set(1, 1, 1, 7, 3));
        assert!(slot.compare_and_set(1, 1, 1, 7, 5));
        assert_eq!(slot.get(1, 1, 1), 7);
        assert_eq!(slot.mutations_since_deflate(), 2);
        assert_eq!(slot.version(), 0);
    }

    #[test]
    fn test_request_deflate_adopts_smaller_backend() {
        let slot = column_of_nines();
        let original = slot.snapshot();
        let deflated = slot.request_deflate(&ColumnDeflator::default());

        assert!(!Arc::ptr_eq(&original, &deflated));
        assert!(deflated.encoded_len() < original.encoded_len());
        assert!(Arc::ptr_eq(&deflated, &slot.snapshot()));
        assert_eq!(slot.version(), 1);
        for y in 0..4 {
            assert_eq!(slot.get(0, y, 0), 9);
        }
    }

    #[test]
    fn test_declined_deflation_keeps_instance() {
        let slot = BlockDataSlot::new(Arc::new(DenseArray16Bit::from_fn(
            Extent::new(2, 2, 2),
            |x, y, z| (x * 1_000 + y * 100 + z) as i32 - 500,
        )));
        let before = slot.snapshot();
        let after = slot.request_deflate(&ColumnDeflator::default());
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(slot.version(), 0);
    }

    #[test]
    fn test_set_widens_narrowed_backend() {
        let slot = column_of_nines();
        slot.set(0, 3, 0, 1);
        slot.request_deflate(&ColumnDeflator::default());
        assert_eq!(slot.bit_width(), 4);
        assert_eq!(slot.mutations_since_deflate(), 0);

        assert_eq!(slot.set(0, 0, 0, -3), 9);
        assert_eq!(slot.type_tag(), TypeTag::Dense8Bit);
        assert_eq!(slot.get(0, 0, 0), -3);
        assert_eq!(slot.get(0, 1, 0), 9);
        assert_eq!(slot.get(0, 3, 0), 1);

        assert!(slot.compare_and_set(0, 1, 0, 1_000, 9));
        assert_eq!(slot.type_tag(), TypeTag::Dense16Bit);
        assert_eq!(slot.get(0, 1, 0), 1_000);
        assert_eq!(slot.version(), 3);
    }

    #[test]
    fn test_snapshot_outlives_swap() {
        let slot = column_of_nines();
        let old = slot.snapshot();
        slot.request_deflate(&ColumnDeflator::default());
        slot.set(0, 0, 0, 2);

        assert_eq!(old.get(0, 0, 0), 9);
        assert_eq!(slot.get(0, 0, 0), 2);
    }

    #[test]
    fn test_replace_returns_previous() {
        let slot = column_of_nines();
        let fresh: Arc<dyn BlockArray> = Arc::new(DenseArray8Bit::new(Extent::new(1, 4, 1)));
        let previous = slot.replace(Arc::clone(&fresh));
        assert_eq!(previous.get(0, 2, 0), 9);
        assert_eq!(slot.get(0, 2, 0), 0);
        assert_eq!(slot.version(), 1);
    }

    #[test]
    #[should_panic(expected = "replacement changes the extent")]
    fn test_replace_with_other_extent_panics() {
        let slot = column_of_nines();
        slot.replace(Arc::new(DenseArray8Bit::new(Extent::new(4, 1, 1))));
    }

    #[test]
    fn test_from_config() {
        let slot = BlockDataSlot::from_config(&StorageConfig::default()).unwrap();
        assert_eq!(slot.extent(), Extent::new(16, 256, 16));
        assert_eq!(slot.type_tag(), TypeTag::Dense8Bit);

        let config = StorageConfig {
            default_bit_width: 3,
            ..StorageConfig::default()
        };
        assert_eq!(
            BlockDataSlot::from_config(&config).err(),
            Some(BlockDataError::UnsupportedBitWidth(3))
        );

        let config = StorageConfig {
            chunk_extent: [16, 0, 16],
            ..StorageConfig::default()
        };
        assert!(matches!(
            BlockDataSlot::from_config(&config).err(),
            Some(BlockDataError::InvalidExtent { .. })
        ));
    }

    #[test]
    fn test_serialize_and_blob_roundtrip() {
        let slot = column_of_nines();
        slot.set(0, 1, 0, -7);
        slot.request_deflate(&ColumnDeflator::default());

        let stored = slot.serialize().unwrap();
        assert_eq!(stored.tag, slot.type_tag());
        let restored = BlockDataSlot::from_blob(&slot.to_blob()).unwrap();
        assert!(contents_equal(slot.snapshot().as_ref(), restored.snapshot().as_ref()));
    }

    #[test]
    fn test_concurrent_writers_and_deflation() {
        let factory = DenseFactory::<Bits8>::default();
        let slot = BlockDataSlot::new_empty(&factory, Extent::new(4, 8, 4));
        let deflator = ColumnDeflator::default();

        std::thread::scope(|scope| {
            for x in 0..4 {
                let slot = &slot;
                scope.spawn(move || {
                    for _ in 0..300 {
                        loop {
                            let seen = slot.get(x, 0, 0);
                            if slot.compare_and_set(x, 0, 0, seen + 1, seen) {
                                break;
                            }
                        }
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..100 {
                    slot.request_deflate(&deflator);
                    std::thread::yield_now();
                }
            });
        });

        for x in 0..4 {
            assert_eq!(slot.get(x, 0, 0), 300);
            assert_eq!(slot.get(x, 1, 0), 0);
        }
        assert_eq!(slot.get(0, 0, 3), 0);
    }
}
