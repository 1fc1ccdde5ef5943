//! Binary formats for the backing file.
//!
//! The engine knows nothing about the structure of the backing file: it hands the frozen [`Catalog`] to a
//! [`MetricFormat`], which assigns every offset, reports the length of the file, and writes the initial contents. After
//! that, the engine only ever writes individual values at the offsets the format assigned.

use snafu::Snafu;

use crate::Catalog;

pub mod mmv;

/// A layout error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum LayoutError {
    /// A write fell outside of the buffer.
    #[snafu(display(
        "write of {} bytes at offset {} exceeds buffer length {}",
        length,
        offset,
        buffer_length
    ))]
    OutOfBounds {
        /// Offset of the write.
        offset: usize,

        /// Length of the write.
        length: usize,

        /// Length of the buffer.
        buffer_length: usize,
    },

    /// An entity was never assigned an offset.
    #[snafu(display("{} was not assigned an offset", entity))]
    MissingOffset {
        /// Description of the entity.
        entity: String,
    },

    /// Two values were assigned overlapping byte ranges.
    #[snafu(display("values {} and {} overlap", first, second))]
    Overlap {
        /// Name of the first value.
        first: String,

        /// Name of the second value.
        second: String,
    },

    /// An initial value could not be encoded by its metric's handler.
    #[snafu(display("initial value of {} could not be encoded", name))]
    InitialValue {
        /// Name of the value.
        name: String,
    },

    /// The populate step was called before offsets were assigned.
    #[snafu(display("offsets have not been assigned"))]
    NotLaidOut,
}

/// Character encoding used for metric names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameEncoding {
    /// 7-bit ASCII.
    Ascii,

    /// UTF-8.
    Utf8,
}

impl NameEncoding {
    /// Returns the name of the encoding.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ascii => "US-ASCII",
            Self::Utf8 => "UTF-8",
        }
    }

    /// Returns the length of `s` once encoded, in bytes, or `None` if `s` cannot be represented in this encoding.
    pub fn encoded_len(self, s: &str) -> Option<usize> {
        match self {
            Self::Ascii => s.is_ascii().then_some(s.len()),
            Self::Utf8 => Some(s.len()),
        }
    }
}

/// A concrete binary layout for the backing file.
///
/// The writer drives a format through three steps when it starts, always in this order and exactly once:
///
/// 1. [`assign_offsets`][Self::assign_offsets] gives every domain, instance, metric descriptor, and value in the
///    catalog its byte offset.
/// 2. [`file_length`][Self::file_length] reports how long the file must be.
/// 3. [`populate`][Self::populate] writes the initial contents of the file, including the initial bytes of every
///    value, into a zeroed buffer of exactly that length.
///
/// The remaining methods describe the constraints that are checked while metrics are registered.
pub trait MetricFormat: Send + 'static {
    /// Returns the maximum length of a metric name, in bytes, once encoded.
    fn metric_name_limit(&self) -> usize;

    /// Returns the maximum length of an instance name, in bytes, once encoded.
    ///
    /// Defaults to the metric name limit.
    fn instance_name_limit(&self) -> usize {
        self.metric_name_limit()
    }

    /// Returns the encoding used for metric and instance names.
    fn name_encoding(&self) -> NameEncoding;

    /// Returns `true` if the format can represent instanced metrics.
    fn supports_instances(&self) -> bool;

    /// Assigns the offset of every entity in the catalog.
    ///
    /// Every value must receive both a block offset and a value offset, and every metric must receive a descriptor
    /// offset. Value ranges must not overlap.
    ///
    /// # Errors
    ///
    /// If the catalog cannot be laid out, an error is returned.
    fn assign_offsets(&mut self, catalog: &mut Catalog) -> Result<(), LayoutError>;

    /// Returns the total length of the file, in bytes.
    fn file_length(&self, catalog: &Catalog) -> usize;

    /// Writes the initial contents of the file.
    ///
    /// # Errors
    ///
    /// If the contents cannot be written, an error is returned.
    fn populate(&self, buffer: &mut [u8], catalog: &Catalog) -> Result<(), LayoutError>;
}

/// Bounds-checked, native-endian writes into a byte buffer at explicit offsets.
pub struct BufferWriter<'a> {
    buf: &'a mut [u8],
}

impl<'a> BufferWriter<'a> {
    /// Creates a new `BufferWriter` over the given buffer.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Returns the length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if the underlying buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// If the range falls outside of the buffer, an error is returned.
    pub fn slice_mut(&mut self, offset: usize, length: usize) -> Result<&mut [u8], LayoutError> {
        let buffer_length = self.buf.len();
        match offset.checked_add(length) {
            Some(end) if end <= buffer_length => Ok(&mut self.buf[offset..end]),
            _ => OutOfBounds {
                offset,
                length,
                buffer_length,
            }
            .fail(),
        }
    }

    /// Writes raw bytes at `offset`.
    ///
    /// # Errors
    ///
    /// If the write falls outside of the buffer, an error is returned.
    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), LayoutError> {
        self.slice_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Writes a `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// If the write falls outside of the buffer, an error is returned.
    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<(), LayoutError> {
        self.put_bytes(offset, &value.to_ne_bytes())
    }

    /// Writes a `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// If the write falls outside of the buffer, an error is returned.
    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<(), LayoutError> {
        self.put_bytes(offset, &value.to_ne_bytes())
    }

    /// Writes `s` into a NUL-padded field of `field_length` bytes at `offset`.
    ///
    /// Strings that do not fit alongside a terminating NUL are truncated at the last character boundary that fits.
    ///
    /// # Errors
    ///
    /// If the field falls outside of the buffer, an error is returned.
    pub fn put_padded_str(&mut self, offset: usize, field_length: usize, s: &str) -> Result<(), LayoutError> {
        let field = self.slice_mut(offset, field_length)?;
        let mut end = s.len().min(field_length.saturating_sub(1));
        while !s.is_char_boundary(end) {
            end -= 1;
        }

        field[..end].copy_from_slice(&s.as_bytes()[..end]);
        field[end..].fill(0);
        Ok(())
    }
}

/// Rounds `offset` up to the next multiple of eight.
pub const fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}
