//! Exporting live metric values through a shared, memory-mapped file.
//!
//! ## Overview
//!
//! A monitored process registers a set of named metrics with a [`MetricWriter`], optionally grouping per-instance
//! values under an instance domain. Once every metric is registered, [`MetricWriter::start`] freezes the catalog,
//! asks the configured [`MetricFormat`] to lay out every descriptor and value at a fixed byte offset, creates a file of
//! exactly the required length, maps it for shared read/write access, and writes the initial structure into it.
//!
//! From then on, [`MetricWriter::update_metric`] encodes new values directly into the mapped region at their
//! precomputed offsets: no allocation, no locking, and no change to the layout of the file. An external reader polls
//! the same file independently.
//!
//! ## Formats
//!
//! The byte layout of the file belongs to the format. The engine only guarantees that every offset computed by the
//! format is honored verbatim for every subsequent write, and that the file is exactly as long as the format reported.
//! [`MmvFormat`] is the format shipped with this crate, along with [`MmvFile`] for decoding it.
//!
//! ## Types
//!
//! Values are encoded by [type handlers][TypeHandler], resolved either from the runtime type of the initial value or
//! given explicitly when registering a metric. Default handlers cover the primitive integer and float types, `bool`,
//! strings, and the standard atomic integer types.
#![deny(warnings)]
#![deny(missing_docs)]

mod buffer;

mod catalog;
pub use self::catalog::{Catalog, MetricInfo, MetricRef, ValueInfo, ValueOffsets};

mod collections;

mod error;
pub use self::error::WriterError;

pub mod format;
pub use self::format::mmv::{MmvFile, MmvFlags, MmvFormat, MmvFormatConfig};
pub use self::format::{LayoutError, MetricFormat, NameEncoding};

mod identity;
pub use self::identity::{calculate_id, string_hash, DomainRef, Instance, InstanceDomain, InstanceDomains, InstanceRef};

mod name;
pub use self::name::{MetricName, ParseMetricNameError};

pub mod types;
pub use self::types::{MetricType, MetricValue, TypeHandler, TypeHandlerRef, TypeHandlers};

mod writer;
pub use self::writer::MetricWriter;
