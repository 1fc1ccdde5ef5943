use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
};

use memmap2::{MmapMut, MmapOptions};

use crate::{
    format::LayoutError,
    types::{TypeHandlerRef, MAX_VALUE_LENGTH},
};

/// A file mapped for shared read/write access.
///
/// All values are written in native byte order. Once created, the length of the mapping never changes.
pub(crate) struct MappedBuffer {
    path: PathBuf,
    mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: `base` points into `mmap`, which is owned by this struct and never remapped, so the pointer stays valid for as
// long as the buffer exists, on whichever thread that is.
unsafe impl Send for MappedBuffer {}

// SAFETY: Shared access only ever writes through `base` via `write_value`, which copies into a caller-chosen range with
// raw pointer writes and never hands out references into the mapping.
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Creates (or truncates) the file at `path`, sizes it to exactly `len` bytes, and maps it.
    ///
    /// The file is truncated to zero bytes before being grown, so every byte of the mapping starts out as zero.
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        // SAFETY: The file was just truncated and sized by us. Other processes may read it concurrently, which is the
        // point of the mapping; nothing in this process touches the file other than through the mapping.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| io::Error::other("mapping returned a null pointer"))?;

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            base,
            len,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the length of the mapping, in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the whole mapping for exclusive access.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `base` is valid for `len` bytes, and `&mut self` guarantees no concurrent `write_value`.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    /// Returns the whole mapping.
    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `base` is valid for `len` bytes. Tests never write while holding this slice.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// Encodes `value` with `handler` and writes it at `offset`.
    ///
    /// The value is encoded into a stack buffer first and then copied into the mapping, so no allocation happens and no
    /// reference into the mapping is ever created.
    ///
    /// Concurrent writes to the same range are not synchronized with each other, and a reader may observe a torn
    /// multi-byte value. Writes to disjoint ranges never interfere.
    ///
    /// Returns `Ok(false)` if `value` is not of the type `handler` encodes, in which case nothing is written.
    pub fn write_value(
        &self, offset: usize, handler: &TypeHandlerRef, value: &dyn std::any::Any,
    ) -> Result<bool, LayoutError> {
        let length = handler.data_length();
        match offset.checked_add(length) {
            Some(end) if end <= self.len && length <= MAX_VALUE_LENGTH => {}
            _ => {
                return Err(LayoutError::OutOfBounds {
                    offset,
                    length,
                    buffer_length: self.len,
                })
            }
        }

        let mut scratch = [0u8; MAX_VALUE_LENGTH];
        let encoded = &mut scratch[..length];
        if !handler.put_any(value, encoded) {
            return Ok(false);
        }

        // SAFETY: `offset + length` was checked against the length of the mapping above, and `base` is valid for the
        // whole mapping. The source is a local stack buffer, so the ranges cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(encoded.as_ptr(), self.base.as_ptr().add(offset), length);
        }

        Ok(true)
    }

    /// Asks the operating system to write dirty pages back to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}
