//! Typed owning views over guest heap blocks.
//!
//! This module provides:
//! - [`GuestType`]: Fixed-size plain data that can live in guest memory
//! - [`TypedMemoryPointer`]: One value in a guest block
//! - [`TypedMemoryArray`]: `n` values in a guest block
//!
//! Blocks come from the instance's app heap. Host access goes through the
//! instance's memory export on every read and write; no host address is
//! ever cached, since guest memory may move when it grows.

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::handle::{Deleter, ForeignHandle, SharedHandle};
use crate::heap::BLOCK_ALIGN;
use crate::instance::ModuleInstance;
use crate::marshal::{IntoWasmValue, WasmValue};
use wasm_sandbox_common::RuntimeError;

/// Plain data with a fixed little-endian guest layout.
///
/// `SIZE` must be non-zero. `ALIGN` must be a power of two no larger than
/// [`BLOCK_ALIGN`]; allocating a type that breaks this fails.
pub trait GuestType: Sized {
    /// Size in guest memory, in bytes.
    const SIZE: u32;

    /// Required alignment, in bytes.
    const ALIGN: u32;

    /// Write `self` into `slot` (exactly `SIZE` bytes).
    fn store(&self, slot: &mut [u8]);

    /// Read a value from `slot` (exactly `SIZE` bytes).
    fn load(slot: &[u8]) -> Self;

    /// Tear down the value in `slot` before its block is freed.
    ///
    /// Runs once per constructed element.
    fn release(_slot: &mut [u8]) {}
}

macro_rules! impl_guest_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            #[allow(clippy::cast_possible_truncation)]
            impl GuestType for $ty {
                const SIZE: u32 = size_of::<$ty>() as u32;
                const ALIGN: u32 = align_of::<$ty>() as u32;

                fn store(&self, slot: &mut [u8]) {
                    slot[..size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn load(slot: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$ty>()];
                    raw.copy_from_slice(&slot[..size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_guest_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Frees a guest block back to its instance's app heap.
pub struct GuestFree {
    instance: SharedHandle<ModuleInstance>,
}

impl Deleter<u32> for GuestFree {
    fn delete(&mut self, address: u32) {
        self.instance.free_block(address);
    }
}

type GuestBlock = ForeignHandle<u32, GuestFree>;

fn allocate_block<T: GuestType>(
    instance: &SharedHandle<ModuleInstance>,
    bytes: u64,
) -> Result<GuestBlock, RuntimeError> {
    if !T::ALIGN.is_power_of_two() || T::ALIGN > BLOCK_ALIGN {
        return Err(RuntimeError::allocation(
            bytes,
            format!("alignment {} is not a power of two up to {BLOCK_ALIGN}", T::ALIGN),
        ));
    }

    let address = instance.alloc_block(bytes)?;
    Ok(ForeignHandle::new(
        address,
        GuestFree {
            instance: instance.clone(),
        },
    ))
}

/// One `T` in a guest block.
///
/// Move-only. On drop the value's release hook runs once, then the block is
/// freed. The instance stays alive for as long as the pointer does.
pub struct TypedMemoryPointer<T: GuestType> {
    block: GuestBlock,
    _marker: PhantomData<T>,
}

impl<T: GuestType> TypedMemoryPointer<T> {
    pub(crate) fn allocate(
        instance: &SharedHandle<ModuleInstance>,
        value: &T,
    ) -> Result<Self, RuntimeError> {
        // Dropping `block` on a failed write frees it without a release
        let block = allocate_block::<T>(instance, u64::from(T::SIZE))?;
        instance.with_guest_bytes(block.get(), T::SIZE, |slot| value.store(slot))?;

        debug!(address = block.get(), size = T::SIZE, "Guest value allocated");

        Ok(Self {
            block,
            _marker: PhantomData,
        })
    }

    /// Guest address of the value.
    pub fn guest_address(&self) -> u32 {
        self.block.get()
    }

    /// Size of the value in bytes.
    pub fn size(&self) -> u32 {
        T::SIZE
    }

    /// The owning instance.
    pub fn instance(&self) -> &SharedHandle<ModuleInstance> {
        &self.block.deleter().instance
    }

    /// Read the current value.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight on the instance.
    pub fn read(&self) -> Result<T, RuntimeError> {
        self.instance()
            .with_guest_bytes(self.guest_address(), T::SIZE, |slot| T::load(slot))
    }

    /// Overwrite the value.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight on the instance.
    pub fn write(&mut self, value: &T) -> Result<(), RuntimeError> {
        self.instance()
            .with_guest_bytes(self.guest_address(), T::SIZE, |slot| value.store(slot))
    }
}

impl<T: GuestType> Drop for TypedMemoryPointer<T> {
    fn drop(&mut self) {
        if self.block.is_null() {
            return;
        }
        if let Err(e) =
            self.instance()
                .with_guest_bytes(self.guest_address(), T::SIZE, |slot| T::release(slot))
        {
            warn!(address = self.guest_address(), error = %e, "Release hook skipped");
        }
    }
}

impl<T: GuestType> fmt::Debug for TypedMemoryPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMemoryPointer")
            .field("guest_address", &self.guest_address())
            .field("size", &T::SIZE)
            .finish()
    }
}

/// Passed to the guest as its address.
impl<T: GuestType> IntoWasmValue for &TypedMemoryPointer<T> {
    #[allow(clippy::cast_possible_wrap)]
    fn into_wasm_value(self) -> WasmValue {
        WasmValue::I32(self.guest_address() as i32)
    }
}

/// `n` contiguous `T`s in a guest block.
///
/// The block is zero-filled on allocation, so all `n` elements count as
/// constructed and the release hook runs exactly `n` times on drop.
pub struct TypedMemoryArray<T: GuestType> {
    block: GuestBlock,
    len: u32,
    _marker: PhantomData<T>,
}

impl<T: GuestType> TypedMemoryArray<T> {
    pub(crate) fn allocate(
        instance: &SharedHandle<ModuleInstance>,
        len: usize,
    ) -> Result<Self, RuntimeError> {
        let bytes = (len as u64)
            .checked_mul(u64::from(T::SIZE))
            .filter(|&bytes| bytes <= u64::from(u32::MAX))
            .ok_or_else(|| {
                RuntimeError::allocation(
                    (len as u64).saturating_mul(u64::from(T::SIZE)),
                    format!("{len} elements of {} bytes exceed the 32-bit guest range", T::SIZE),
                )
            })?;

        let block = allocate_block::<T>(instance, bytes)?;
        let size = u32::try_from(bytes).unwrap_or(u32::MAX);
        instance.with_guest_bytes(block.get(), size, |slot| slot.fill(0))?;

        debug!(address = block.get(), len, bytes, "Guest array allocated");

        Ok(Self {
            block,
            len: u32::try_from(len).unwrap_or(u32::MAX),
            _marker: PhantomData,
        })
    }

    /// Guest address of the first element.
    pub fn guest_address(&self) -> u32 {
        self.block.get()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size in bytes.
    pub fn size_bytes(&self) -> u32 {
        self.len * T::SIZE
    }

    /// The owning instance.
    pub fn instance(&self) -> &SharedHandle<ModuleInstance> {
        &self.block.deleter().instance
    }

    fn element_address(&self, index: usize) -> Result<u32, RuntimeError> {
        u32::try_from(index)
            .ok()
            .filter(|&i| i < self.len)
            .map(|i| self.guest_address() + i * T::SIZE)
            .ok_or(RuntimeError::OutOfBounds {
                index: index as u64,
                len: u64::from(self.len),
            })
    }

    /// Read element `index`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<T, RuntimeError> {
        let address = self.element_address(index)?;
        self.instance()
            .with_guest_bytes(address, T::SIZE, |slot| T::load(slot))
    }

    /// Overwrite element `index`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if `index >= len()`.
    pub fn set(&mut self, index: usize, value: &T) -> Result<(), RuntimeError> {
        let address = self.element_address(index)?;
        self.instance()
            .with_guest_bytes(address, T::SIZE, |slot| value.store(slot))
    }

    /// Read every element.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight on the instance.
    pub fn to_vec(&self) -> Result<Vec<T>, RuntimeError> {
        self.instance()
            .with_guest_bytes(self.guest_address(), self.size_bytes(), |bytes| {
                bytes.chunks_exact(T::SIZE as usize).map(T::load).collect()
            })
    }

    /// Overwrite every element from `src`.
    ///
    /// # Errors
    ///
    /// Returns `SizeMismatch` if `src.len() != len()`; nothing is written.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<(), RuntimeError> {
        if src.len() != self.len() {
            return Err(RuntimeError::SizeMismatch {
                expected: self.len(),
                actual: src.len(),
            });
        }

        let mut encoded = vec![0u8; self.size_bytes() as usize];
        for (value, slot) in src.iter().zip(encoded.chunks_exact_mut(T::SIZE as usize)) {
            value.store(slot);
        }

        self.instance()
            .with_guest_bytes(self.guest_address(), self.size_bytes(), |bytes| {
                bytes.copy_from_slice(&encoded);
            })
    }
}

impl<T: GuestType> Drop for TypedMemoryArray<T> {
    fn drop(&mut self) {
        if self.block.is_null() {
            return;
        }
        let released =
            self.instance()
                .with_guest_bytes(self.guest_address(), self.size_bytes(), |bytes| {
                    for slot in bytes.chunks_exact_mut(T::SIZE as usize) {
                        T::release(slot);
                    }
                });
        if let Err(e) = released {
            warn!(address = self.guest_address(), len = self.len, error = %e, "Release hooks skipped");
        }
    }
}

impl<T: GuestType> fmt::Debug for TypedMemoryArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMemoryArray")
            .field("guest_address", &self.guest_address())
            .field("len", &self.len)
            .field("element_size", &T::SIZE)
            .finish()
    }
}

/// Passed to the guest as the address of the first element.
impl<T: GuestType> IntoWasmValue for &TypedMemoryArray<T> {
    #[allow(clippy::cast_possible_wrap)]
    fn into_wasm_value(self) -> WasmValue {
        WasmValue::I32(self.guest_address() as i32)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::testing::test_instance;

    const MEMORY_ONLY: &str = r#"(module (memory (export "memory") 1))"#;

    thread_local! {
        static RELEASED: Cell<usize> = const { Cell::new(0) };
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Tracked(u32);

    impl GuestType for Tracked {
        const SIZE: u32 = 4;
        const ALIGN: u32 = 4;

        fn store(&self, slot: &mut [u8]) {
            self.0.store(slot);
        }

        fn load(slot: &[u8]) -> Self {
            Tracked(u32::load(slot))
        }

        fn release(_slot: &mut [u8]) {
            RELEASED.with(|count| count.set(count.get() + 1));
        }
    }

    fn released() -> usize {
        RELEASED.with(Cell::get)
    }

    #[test]
    fn test_scalar_layout_is_little_endian() {
        let mut slot = [0u8; 4];
        0x0102_0304u32.store(&mut slot);
        assert_eq!(slot, [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(u32::load(&slot), 0x0102_0304);
        assert_eq!(<f64 as GuestType>::SIZE, 8);
    }

    #[test]
    fn test_pointer_read_write() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let mut pointer = instance.allocate(41u64).unwrap();
        assert_ne!(pointer.guest_address(), 0);
        assert_eq!(pointer.size(), 8);
        assert_eq!(pointer.read().unwrap(), 41);

        pointer.write(&42).unwrap();
        assert_eq!(pointer.read().unwrap(), 42);
    }

    #[test]
    fn test_pointer_release_runs_once() {
        let instance = test_instance(MEMORY_ONLY, 65536);
        let before = released();

        let pointer = instance.allocate(Tracked(9)).unwrap();
        assert_eq!(pointer.read().unwrap(), Tracked(9));
        drop(pointer);

        assert_eq!(released(), before + 1);
        assert_eq!(instance.heap_stats().unwrap().unwrap().live_blocks, 0);
    }

    #[test]
    fn test_moved_pointer_frees_once() {
        let instance = test_instance(MEMORY_ONLY, 65536);
        let before = released();

        let pointer = instance.allocate(Tracked(1)).unwrap();
        let address = pointer.guest_address();
        let moved = pointer;
        assert_eq!(moved.guest_address(), address);
        assert_eq!(instance.heap_stats().unwrap().unwrap().live_blocks, 1);

        drop(moved);
        assert_eq!(released(), before + 1);
        assert_eq!(instance.heap_stats().unwrap().unwrap().live_blocks, 0);

        // The freed address is handed out again
        let again = instance.allocate(Tracked(2)).unwrap();
        assert_eq!(again.guest_address(), address);
    }

    #[test]
    fn test_array_zero_filled() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let array = instance.allocate_array::<i32>(16).unwrap();
        assert_eq!(array.len(), 16);
        assert_eq!(array.size_bytes(), 64);
        assert_eq!(array.to_vec().unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_array_get_set_bounds() {
        let instance = test_instance(MEMORY_ONLY, 65536);
        let mut array = instance.allocate_array::<u16>(3).unwrap();

        array.set(2, &7).unwrap();
        assert_eq!(array.get(2).unwrap(), 7);

        let err = array.get(3).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfBounds { index: 3, len: 3 }));
        assert!(array.set(usize::MAX, &1).is_err());
    }

    #[test]
    fn test_array_release_count() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let before = released();
        drop(instance.allocate_array::<Tracked>(5).unwrap());
        assert_eq!(released(), before + 5);

        let before = released();
        let mut array = instance.allocate_array::<Tracked>(5).unwrap();
        array
            .copy_from_slice(&[Tracked(1), Tracked(2), Tracked(3), Tracked(4), Tracked(5)])
            .unwrap();
        drop(array);
        assert_eq!(released(), before + 5);
    }

    #[test]
    fn test_copy_size_mismatch_writes_nothing() {
        let instance = test_instance(MEMORY_ONLY, 65536);
        let mut array = instance.allocate_array::<u32>(4).unwrap();
        array.copy_from_slice(&[1, 2, 3, 4]).unwrap();

        let err = array.copy_from_slice(&[9, 9, 9]).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::SizeMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(array.to_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[derive(Debug)]
    struct Wide([u8; 16]);

    impl GuestType for Wide {
        const SIZE: u32 = 16;
        const ALIGN: u32 = 16;

        fn store(&self, slot: &mut [u8]) {
            slot[..16].copy_from_slice(&self.0);
        }

        fn load(slot: &[u8]) -> Self {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&slot[..16]);
            Wide(raw)
        }
    }

    #[test]
    fn test_over_aligned_type_rejected() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let err = instance.allocate(Wide([1; 16])).unwrap_err();
        assert!(matches!(err, RuntimeError::Allocation { requested: 16, .. }));
        assert!(instance.allocate_array::<Wide>(2).is_err());
        assert_eq!(instance.heap_stats().unwrap().unwrap().live_blocks, 0);
    }

    #[test]
    fn test_array_beyond_guest_range() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let err = instance.allocate_array::<u64>(1 << 30).unwrap_err();
        assert!(matches!(err, RuntimeError::Allocation { .. }));
    }

    #[test]
    fn test_heap_exhausted() {
        let instance = test_instance(MEMORY_ONLY, 65536);

        let err = instance.allocate_array::<u8>(65536 + 1).unwrap_err();
        assert!(matches!(err, RuntimeError::Allocation { .. }));
        assert_eq!(instance.heap_stats().unwrap().unwrap().live_blocks, 0);
    }

    #[test]
    fn test_no_heap() {
        let instance = test_instance(MEMORY_ONLY, 0);

        let err = instance.allocate(1u8).unwrap_err();
        assert!(matches!(err, RuntimeError::Allocation { .. }));
    }

    #[test]
    fn test_pointer_encodes_as_address() {
        let instance = test_instance(MEMORY_ONLY, 65536);
        let pointer = instance.allocate(1u32).unwrap();

        let expected = WasmValue::I32(pointer.guest_address() as i32);
        assert_eq!((&pointer).into_wasm_value(), expected);
    }
}
