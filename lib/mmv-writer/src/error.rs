use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::{format::LayoutError, MetricName};

/// A writer error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum WriterError {
    /// A metric was registered after the writer was started.
    #[snafu(display("cannot add metric {} after the writer has started", name))]
    Started {
        /// Name of the metric.
        name: MetricName,
    },

    /// A value was updated before the writer was started.
    #[snafu(display("cannot update metric {} unless the writer is running", name))]
    NotStarted {
        /// Name of the metric.
        name: MetricName,
    },

    /// The writer was started more than once.
    #[snafu(display("writer is already started"))]
    AlreadyStarted,

    /// An earlier attempt to start the writer failed partway through.
    #[snafu(display("writer failed to start previously and can no longer be used"))]
    Unusable,

    /// The writer was started without any metrics.
    #[snafu(display("cannot create a metrics file with no metrics"))]
    NoMetrics,

    /// The same name was registered twice.
    #[snafu(display("metric {} has already been added to the writer", name))]
    DuplicateMetric {
        /// Name of the metric.
        name: MetricName,
    },

    /// A metric or instance name is longer than the format allows.
    #[snafu(display(
        "cannot add {} '{}': name is {} bytes long, exceeding the limit of {}",
        part,
        name,
        length,
        limit
    ))]
    NameTooLong {
        /// The rejected name.
        name: String,

        /// Which part of the metric name was rejected: `metric` or `instance`.
        part: &'static str,

        /// Encoded length of the name, in bytes.
        length: usize,

        /// Maximum encoded length allowed by the format, in bytes.
        limit: usize,
    },

    /// A metric or instance name contains characters the format cannot encode.
    #[snafu(display("cannot add {} '{}': name cannot be encoded as {}", part, name, encoding))]
    NameNotEncodable {
        /// The rejected name.
        name: String,

        /// Which part of the metric name was rejected: `metric` or `instance`.
        part: &'static str,

        /// Name of the format's character encoding.
        encoding: &'static str,
    },

    /// An instanced metric was registered with a format that has no instance support.
    #[snafu(display("metric {} contains an instance but this format does not support them", name))]
    InstancesNotSupported {
        /// Name of the metric.
        name: MetricName,
    },

    /// An instance of a metric named a different instance domain than earlier instances of the same metric.
    #[snafu(display("metric {} does not match the previously specified instance layout", name))]
    InconsistentInstanceDomain {
        /// Name of the metric.
        name: MetricName,
    },

    /// An instance of a metric used a different type handler than earlier instances of the same metric.
    #[snafu(display("metric {} cannot use different type handlers for different instances", name))]
    InconsistentTypeHandler {
        /// Name of the metric.
        name: MetricName,
    },

    /// No type handler is registered for the runtime type of the value.
    #[snafu(display("no handler registered for type {} (metric {})", type_name, name))]
    NoTypeHandler {
        /// Name of the metric.
        name: MetricName,

        /// Name of the value's type.
        type_name: &'static str,
    },

    /// The value is not of the type the metric's handler encodes.
    #[snafu(display(
        "metric {} is handled as {}, but was given a value of type {}",
        name,
        expected,
        actual
    ))]
    HandlerTypeMismatch {
        /// Name of the metric.
        name: MetricName,

        /// Name of the type the handler encodes.
        expected: &'static str,

        /// Name of the type that was given.
        actual: &'static str,
    },

    /// The type handler produces values larger than the writer supports.
    #[snafu(display("metric {} has a {}-byte value, exceeding the limit of {}", name, length, limit))]
    ValueTooLarge {
        /// Name of the metric.
        name: MetricName,

        /// Length of the handler's values, in bytes.
        length: usize,

        /// Maximum supported value length, in bytes.
        limit: usize,
    },

    /// A value was updated that was never registered.
    #[snafu(display("metric {} was not added before starting the writer", name))]
    UnknownMetric {
        /// Name of the metric.
        name: MetricName,
    },

    /// The format produced an invalid layout.
    #[snafu(display("failed to lay out metrics file"))]
    Layout {
        /// Error source.
        source: LayoutError,
    },

    /// The backing file could not be created, sized, or mapped.
    #[snafu(display("failed to map metrics file '{}'", path.display()))]
    Io {
        /// Path to the backing file.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Mapped pages could not be flushed to the backing file.
    #[snafu(display("failed to flush metrics file '{}'", path.display()))]
    Flush {
        /// Path to the backing file.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },
}
