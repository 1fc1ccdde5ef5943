use std::{
    any::{type_name, Any},
    fmt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
};

use snafu::{ensure, OptionExt as _, ResultExt as _};
use tracing::{debug, info};

use crate::{
    buffer::MappedBuffer,
    error::*,
    format::{LayoutError, MissingOffset, OutOfBounds, Overlap},
    types::MAX_VALUE_LENGTH,
    Catalog, MetricFormat, MetricName, MmvFormat, TypeHandlerRef, TypeHandlers, ValueOffsets,
};

struct Registration<F> {
    format: F,
    catalog: Catalog,
    type_handlers: TypeHandlers,
}

impl<F: MetricFormat> Registration<F> {
    fn register(
        &mut self, name: MetricName, type_handler: TypeHandlerRef, initial_value: Box<dyn Any + Send + Sync>,
    ) -> Result<(), WriterError> {
        ensure!(!self.catalog.contains(&name), DuplicateMetric { name });

        check_name(&self.format, "metric", name.metric(), self.format.metric_name_limit())?;
        ensure!(
            !name.has_instance() || self.format.supports_instances(),
            InstancesNotSupported { name }
        );
        if let Some(instance) = name.instance() {
            check_name(&self.format, "instance", instance, self.format.instance_name_limit())?;
        }

        let data_length = type_handler.data_length();
        ensure!(
            data_length <= MAX_VALUE_LENGTH,
            ValueTooLarge {
                name,
                length: data_length,
                limit: MAX_VALUE_LENGTH
            }
        );

        // Every instance of a metric shares the domain and handler of the first one registered.
        if let Some(existing) = self.catalog.find_metric(name.metric()) {
            let metric = self.catalog.metric(existing);
            let same_domain = match (metric.domain(), name.instance_domain()) {
                (None, None) => true,
                (Some(domain), Some(domain_name)) => self.catalog.domains().domain(domain).name() == domain_name,
                _ => false,
            };
            ensure!(same_domain, InconsistentInstanceDomain { name });
            ensure!(
                metric.type_handler().same_handler(&type_handler),
                InconsistentTypeHandler { name }
            );
        }

        let instance = match (name.instance_domain(), name.instance()) {
            (Some(domain), Some(instance)) => Some(self.catalog.domains_mut().get_or_create_instance(domain, instance)),
            _ => None,
        };
        let metric = self.catalog.get_or_create_metric(
            name.metric(),
            instance.map(|instance| instance.domain()),
            &type_handler,
        );

        debug!(metric = %name, metric_type = ?type_handler.metric_type(), "Registered metric.");

        self.catalog.insert_value(name, metric, instance, initial_value);
        Ok(())
    }
}

/// Checks that `name` can be encoded by the format and fits within `limit` bytes once encoded.
fn check_name<F: MetricFormat>(format: &F, part: &'static str, name: &str, limit: usize) -> Result<(), WriterError> {
    let encoding = format.name_encoding();
    let length = encoding.encoded_len(name).context(NameNotEncodable {
        name,
        part,
        encoding: encoding.as_str(),
    })?;
    ensure!(length <= limit, NameTooLong { name, part, length, limit });
    Ok(())
}

enum WriterState<F> {
    Registering(Registration<F>),
    Running,
    Failed,
}

struct LiveLayout {
    catalog: Catalog,
    buffer: MappedBuffer,
}

/// Exports metric values through a memory-mapped file.
///
/// A writer goes through two phases. While registering, metrics are added with [`add_metric`][Self::add_metric] (and
/// its variants), and custom type handlers can be installed with [`register_type`][Self::register_type]. Calling
/// [`start`][Self::start] lays out the file, creates and maps it, and writes the initial value of every metric. From
/// then on, the set of metrics is frozen and values can only be changed with [`update_metric`][Self::update_metric].
///
/// Registration is serialized behind a lock. Updates are lock-free: updates to distinct metrics never interfere, but
/// concurrent updates to the _same_ metric are not synchronized, and a reader may observe a torn value.
///
/// If `start` fails after it has begun laying out the file, the writer can no longer be used, and every subsequent
/// call to `start` fails with [`WriterError::Unusable`].
pub struct MetricWriter<F: MetricFormat = MmvFormat> {
    path: PathBuf,
    state: Mutex<WriterState<F>>,
    live: OnceLock<LiveLayout>,
}

impl MetricWriter<MmvFormat> {
    /// Creates a new `MetricWriter` using the default MMV format.
    pub fn mmv<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, MmvFormat::default())
    }
}

impl<F: MetricFormat> MetricWriter<F> {
    /// Creates a new `MetricWriter` that lays out its file with `format` and writes it to `path` when started.
    pub fn new<P: Into<PathBuf>>(path: P, format: F) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(WriterState::Registering(Registration {
                format,
                catalog: Catalog::default(),
                type_handlers: TypeHandlers::default(),
            })),
            live: OnceLock::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WriterState<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the writer has been started.
    pub fn is_started(&self) -> bool {
        self.live.get().is_some()
    }

    /// Returns the number of registered values, counting each instance of a metric separately.
    pub fn metric_count(&self) -> usize {
        if let Some(live) = self.live.get() {
            return live.catalog.len();
        }

        match &*self.lock_state() {
            WriterState::Registering(registration) => registration.catalog.len(),
            _ => 0,
        }
    }

    /// Returns the frozen catalog, once the writer has started.
    pub fn catalog(&self) -> Option<&Catalog> {
        self.live.get().map(|live| &live.catalog)
    }

    /// Installs a type handler, replacing the default handler for the same type.
    ///
    /// Does nothing if the writer has already started, since no more metrics can be added at that point.
    pub fn register_type(&self, type_handler: TypeHandlerRef) {
        match &mut *self.lock_state() {
            WriterState::Registering(registration) => {
                debug!(value_type = type_handler.value_type_name(), "Registered type handler.");
                registration.type_handlers.register(type_handler);
            }
            _ => debug!(
                value_type = type_handler.value_type_name(),
                "Ignoring type handler registered after the writer started."
            ),
        }
    }

    /// Registers a metric, encoding it with the handler registered for `T`.
    ///
    /// # Errors
    ///
    /// If the writer has started, if no handler is registered for `T`, or if the name is rejected (see
    /// [`add_metric_with_handler`][Self::add_metric_with_handler]), an error is returned and nothing is registered.
    pub fn add_metric<T>(&self, name: MetricName, initial_value: T) -> Result<(), WriterError>
    where
        T: Any + Send + Sync,
    {
        let mut state = self.lock_state();
        let registration = match &mut *state {
            WriterState::Registering(registration) => registration,
            _ => return Started { name }.fail(),
        };

        let type_handler = match registration.type_handlers.get::<T>() {
            Some(type_handler) => type_handler.clone(),
            None => {
                return NoTypeHandler {
                    name,
                    type_name: type_name::<T>(),
                }
                .fail()
            }
        };

        registration.register(name, type_handler, Box::new(initial_value))
    }

    /// Registers a metric, encoding it with the given handler instead of the one registered for `T`.
    ///
    /// Every instance of the same metric must use the same handler, so callers that register several instances should
    /// clone one [`TypeHandlerRef`] rather than creating a new one for each.
    ///
    /// # Errors
    ///
    /// An error is returned, and nothing is registered, if:
    ///
    /// - the writer has started
    /// - `type_handler` does not encode values of type `T`
    /// - `name` is already registered
    /// - the metric or instance name cannot be encoded by the format, or is too long
    /// - `name` has an instance, but the format does not support instances
    /// - the handler writes values larger than the writer supports
    /// - another instance of the same metric was registered with a different instance domain or handler
    pub fn add_metric_with_handler<T>(
        &self, name: MetricName, initial_value: T, type_handler: TypeHandlerRef,
    ) -> Result<(), WriterError>
    where
        T: Any + Send + Sync,
    {
        let mut state = self.lock_state();
        let registration = match &mut *state {
            WriterState::Registering(registration) => registration,
            _ => return Started { name }.fail(),
        };

        ensure!(
            type_handler.handles::<T>(),
            HandlerTypeMismatch {
                name,
                expected: type_handler.value_type_name(),
                actual: type_name::<T>(),
            }
        );

        registration.register(name, type_handler, Box::new(initial_value))
    }

    /// Returns the identifier of the instance domain with the given name, creating the domain if needed.
    ///
    /// Once the writer has started, only existing domains can be looked up.
    ///
    /// # Errors
    ///
    /// If the writer has started and no such domain exists, or if the writer is unusable, an error is returned.
    pub fn instance_domain(&self, name: &str) -> Result<u32, WriterError> {
        if let Some(live) = self.live.get() {
            let domains = live.catalog.domains();
            return domains
                .find(name)
                .map(|domain| domains.domain(domain).id())
                .context(AlreadyStarted);
        }

        match &mut *self.lock_state() {
            WriterState::Registering(registration) => {
                let domains = registration.catalog.domains_mut();
                let domain = domains.get_or_create(name);
                Ok(domains.domain(domain).id())
            }
            WriterState::Running => AlreadyStarted.fail(),
            WriterState::Failed => Unusable.fail(),
        }
    }

    /// Returns the identifier of the named instance within the named domain, creating either if needed.
    ///
    /// Once the writer has started, only existing instances can be looked up.
    ///
    /// # Errors
    ///
    /// If the instance name cannot be encoded by the format or is too long, if the writer has started and no such
    /// instance exists, or if the writer is unusable, an error is returned.
    pub fn instance(&self, domain: &str, instance: &str) -> Result<u32, WriterError> {
        if let Some(live) = self.live.get() {
            let domains = live.catalog.domains();
            return domains
                .find_instance(domain, instance)
                .map(|instance| domains.instance(instance).id())
                .context(AlreadyStarted);
        }

        match &mut *self.lock_state() {
            WriterState::Registering(registration) => {
                check_name(
                    &registration.format,
                    "instance",
                    instance,
                    registration.format.instance_name_limit(),
                )?;
                let domains = registration.catalog.domains_mut();
                let instance = domains.get_or_create_instance(domain, instance);
                Ok(domains.instance(instance).id())
            }
            WriterState::Running => AlreadyStarted.fail(),
            WriterState::Failed => Unusable.fail(),
        }
    }

    /// Lays out, creates, and populates the backing file.
    ///
    /// The file is created (or truncated) at the writer's path, sized to exactly the length reported by the format, and
    /// mapped for shared read/write access.
    ///
    /// # Errors
    ///
    /// If the writer has already started, or no metrics were registered, an error is returned and the writer is left
    /// as it was. If laying out, creating, mapping, or populating the file fails, an error is returned and the writer
    /// can no longer be used.
    pub fn start(&self) -> Result<(), WriterError> {
        let mut state = self.lock_state();
        let registration = match std::mem::replace(&mut *state, WriterState::Failed) {
            WriterState::Registering(registration) => registration,
            WriterState::Running => {
                *state = WriterState::Running;
                return AlreadyStarted.fail();
            }
            WriterState::Failed => return Unusable.fail(),
        };

        if registration.catalog.is_empty() {
            *state = WriterState::Registering(registration);
            return NoMetrics.fail();
        }

        // From here on, any failure leaves the state as `Failed`.
        let Registration {
            mut format,
            mut catalog,
            ..
        } = registration;

        format.assign_offsets(&mut catalog).context(Layout)?;
        let length = format.file_length(&catalog);
        validate_layout(&catalog, length).context(Layout)?;

        let mut buffer = MappedBuffer::create(&self.path, length).context(Io { path: self.path.as_path() })?;
        format.populate(buffer.as_mut_slice(), &catalog).context(Layout)?;

        info!(
            path = %buffer.path().display(),
            length = buffer.len(),
            metrics = catalog.metric_count(),
            values = catalog.len(),
            instance_domains = catalog.domains().len(),
            "Metrics writer started."
        );

        if self.live.set(LiveLayout { catalog, buffer }).is_err() {
            return AlreadyStarted.fail();
        }
        *state = WriterState::Running;

        Ok(())
    }

    /// Writes a new value for a registered metric.
    ///
    /// The value is encoded by the metric's type handler directly into the mapped file, at the offset assigned when the
    /// writer started.
    ///
    /// # Errors
    ///
    /// If the writer has not started, if `name` was never registered, or if `value` is not of the type the metric's
    /// handler encodes, an error is returned and the file is left unchanged.
    pub fn update_metric<T: Any>(&self, name: &MetricName, value: &T) -> Result<(), WriterError> {
        let live = self.live.get().with_context(|| NotStarted { name: name.clone() })?;
        let value_info = live
            .catalog
            .value(name)
            .with_context(|| UnknownMetric { name: name.clone() })?;
        let type_handler = live.catalog.metric_of(value_info).type_handler();
        let offsets = value_info
            .offsets()
            .with_context(|| MissingOffset {
                entity: format!("value {}", name),
            })
            .context(Layout)?;

        let written = live
            .buffer
            .write_value(offsets.value_offset(), type_handler, value)
            .context(Layout)?;
        ensure!(
            written,
            HandlerTypeMismatch {
                name: name.clone(),
                expected: type_handler.value_type_name(),
                actual: type_name::<T>(),
            }
        );

        Ok(())
    }

    /// Returns the offsets of a registered value, once the writer has started.
    pub fn value_offsets(&self, name: &MetricName) -> Option<ValueOffsets> {
        self.live.get()?.catalog.value(name)?.offsets()
    }

    /// Returns the offset of a metric's descriptor, once the writer has started.
    pub fn descriptor_offset(&self, metric: &str) -> Option<usize> {
        let catalog = &self.live.get()?.catalog;
        let metric = catalog.find_metric(metric)?;
        catalog.metric(metric).descriptor_offset()
    }

    /// Flushes the mapped file to disk.
    ///
    /// Readers see updates without flushing. This only forces the contents of the file out to storage. Does nothing if
    /// the writer has not started.
    ///
    /// # Errors
    ///
    /// If the flush fails, an error is returned.
    pub fn flush(&self) -> Result<(), WriterError> {
        match self.live.get() {
            Some(live) => live.buffer.flush().context(Flush { path: self.path.as_path() }),
            None => Ok(()),
        }
    }
}

impl<F: MetricFormat> fmt::Debug for MetricWriter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricWriter")
            .field("path", &self.path)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

/// Checks that every entity was laid out, and that every value fits in the file without overlapping another.
fn validate_layout(catalog: &Catalog, length: usize) -> Result<(), LayoutError> {
    for (_, metric) in catalog.metrics() {
        metric.descriptor_offset().with_context(|| MissingOffset {
            entity: format!("metric {}", metric.name()),
        })?;
    }

    let mut ranges = Vec::with_capacity(catalog.len());
    for value in catalog.values() {
        let offsets = value.offsets().with_context(|| MissingOffset {
            entity: format!("value {}", value.name()),
        })?;
        let data_length = catalog.metric_of(value).type_handler().data_length();
        let start = offsets.value_offset();

        match start.checked_add(data_length) {
            Some(end) if end <= length => ranges.push((start, end, value.name())),
            _ => {
                return OutOfBounds {
                    offset: start,
                    length: data_length,
                    buffer_length: length,
                }
                .fail()
            }
        }
    }

    ranges.sort_unstable_by_key(|(start, end, _)| (*start, *end));
    for pair in ranges.windows(2) {
        let (_, first_end, first) = pair[0];
        let (second_start, _, second) = pair[1];
        ensure!(
            first_end <= second_start,
            Overlap {
                first: first.to_string(),
                second: second.to_string(),
            }
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{
        format::{align8, NameEncoding},
        types::{I64Handler, MetricType, MetricValue, U64Handler},
        MmvFile, TypeHandler,
    };

    /// Values only, packed back to back, with no header and no instance support.
    #[derive(Default)]
    struct PackedFormat {
        length: usize,
        overlap: bool,
    }

    impl MetricFormat for PackedFormat {
        fn metric_name_limit(&self) -> usize {
            8
        }

        fn name_encoding(&self) -> NameEncoding {
            NameEncoding::Utf8
        }

        fn supports_instances(&self) -> bool {
            false
        }

        fn assign_offsets(&mut self, catalog: &mut Catalog) -> Result<(), LayoutError> {
            for (_, metric) in catalog.metrics_mut() {
                metric.set_descriptor_offset(0);
            }

            let lengths = catalog
                .values()
                .map(|value| catalog.metric_of(value).type_handler().data_length())
                .collect::<Vec<_>>();
            let mut offset = 0;
            for (value, length) in catalog.values_mut().zip(lengths) {
                value.set_offsets(ValueOffsets::new(offset, offset));
                if !self.overlap {
                    offset += align8(length);
                }
            }

            self.length = offset.max(8);
            Ok(())
        }

        fn file_length(&self, _catalog: &Catalog) -> usize {
            self.length
        }

        fn populate(&self, buffer: &mut [u8], catalog: &Catalog) -> Result<(), LayoutError> {
            for value in catalog.values() {
                let handler = catalog.metric_of(value).type_handler();
                let offset = value.offsets().map(|offsets| offsets.value_offset()).unwrap_or(0);
                let slot = &mut buffer[offset..offset + handler.data_length()];
                if !handler.put_any(value.initial_value(), slot) {
                    return Err(LayoutError::InitialValue {
                        name: value.name().to_string(),
                    });
                }
            }
            Ok(())
        }
    }

    struct WideHandler;

    impl TypeHandler<u8> for WideHandler {
        fn metric_type(&self) -> MetricType {
            MetricType::String
        }

        fn data_length(&self) -> usize {
            MAX_VALUE_LENGTH + 1
        }

        fn put_bytes(&self, _value: &u8, dst: &mut [u8]) {
            dst.fill(0);
        }
    }

    fn read_value<F: MetricFormat>(
        writer: &MetricWriter<F>, name: &MetricName, metric_type: MetricType,
    ) -> Option<MetricValue> {
        let offset = writer.value_offsets(name)?.value_offset();
        let contents = std::fs::read(writer.path()).ok()?;
        MetricValue::decode(metric_type, &contents[offset..])
    }

    #[test]
    fn requests_and_queue_depth_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("scenario.mmv"));

        let requests = MetricName::new("requests.count");
        let worker_a = MetricName::with_instance("queue.depth", "workerA", "pool");
        let worker_b = MetricName::with_instance("queue.depth", "workerB", "pool");

        writer.add_metric(requests.clone(), 0i32).unwrap();
        writer.add_metric(worker_a.clone(), 3i32).unwrap();
        writer.add_metric(worker_b.clone(), 5i32).unwrap();
        writer.start().unwrap();

        writer.update_metric(&requests, &42i32).unwrap();
        writer.update_metric(&worker_b, &7i32).unwrap();

        assert_eq!(read_value(&writer, &requests, MetricType::I32), Some(MetricValue::I32(42)));
        assert_eq!(read_value(&writer, &worker_b, MetricType::I32), Some(MetricValue::I32(7)));
        assert_eq!(read_value(&writer, &worker_a, MetricType::I32), Some(MetricValue::I32(3)));

        let contents = std::fs::read(writer.path()).unwrap();
        let file = MmvFile::parse(&contents).unwrap();
        assert_eq!(file.value("queue.depth", Some("workerB")), Some(&MetricValue::I32(7)));
    }

    #[test]
    fn inconsistent_type_handler_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("handlers.mmv"));

        writer
            .add_metric(MetricName::with_instance("queue.depth", "a", "pool"), 1u64)
            .unwrap();
        let err = writer
            .add_metric(MetricName::with_instance("queue.depth", "b", "pool"), 1i64)
            .unwrap_err();
        assert!(matches!(err, WriterError::InconsistentTypeHandler { .. }));

        // Two distinct handler objects for the same type also count as different handlers.
        let first = TypeHandlerRef::new::<u64, _>(U64Handler);
        let second = TypeHandlerRef::new::<u64, _>(U64Handler);
        writer
            .add_metric_with_handler(MetricName::with_instance("custom", "a", "pool"), 1u64, first.clone())
            .unwrap();
        writer
            .add_metric_with_handler(MetricName::with_instance("custom", "b", "pool"), 2u64, first)
            .unwrap();
        let err = writer
            .add_metric_with_handler(MetricName::with_instance("custom", "c", "pool"), 3u64, second)
            .unwrap_err();
        assert!(matches!(err, WriterError::InconsistentTypeHandler { .. }));

        assert_eq!(writer.metric_count(), 3);
    }

    #[test]
    fn inconsistent_instance_domain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("domains.mmv"));

        writer
            .add_metric(MetricName::with_instance("queue.depth", "a", "pool"), 1u64)
            .unwrap();
        let err = writer
            .add_metric(MetricName::with_instance("queue.depth", "b", "other"), 1u64)
            .unwrap_err();
        assert!(matches!(err, WriterError::InconsistentInstanceDomain { .. }));

        let err = writer.add_metric(MetricName::new("queue.depth"), 1u64).unwrap_err();
        assert!(matches!(err, WriterError::InconsistentInstanceDomain { .. }));

        // The rejected registration must not have created the other domain.
        writer.start().unwrap();
        assert!(writer.instance_domain("other").is_err());
    }

    #[test]
    fn registration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("errors.mmv"));

        writer.add_metric(MetricName::new("a"), 1u32).unwrap();
        assert!(matches!(
            writer.add_metric(MetricName::new("a"), 2u32),
            Err(WriterError::DuplicateMetric { .. })
        ));
        assert!(matches!(
            writer.add_metric(MetricName::new("b"), 'c'),
            Err(WriterError::NoTypeHandler { .. })
        ));
        assert!(matches!(
            writer.add_metric(MetricName::new("x".repeat(64)), 1u32),
            Err(WriterError::NameTooLong { length: 64, limit: 63, .. })
        ));
        assert!(writer.add_metric(MetricName::new("x".repeat(63)), 1u32).is_ok());
        assert!(matches!(
            writer.add_metric(MetricName::new("caf\u{e9}"), 1u32),
            Err(WriterError::NameNotEncodable { .. })
        ));
        assert!(matches!(
            writer.add_metric_with_handler(MetricName::new("c"), 1u32, TypeHandlerRef::new::<i64, _>(I64Handler)),
            Err(WriterError::HandlerTypeMismatch { .. })
        ));
        assert!(matches!(
            writer.add_metric_with_handler(MetricName::new("d"), 1u8, TypeHandlerRef::new::<u8, _>(WideHandler)),
            Err(WriterError::ValueTooLarge { .. })
        ));

        assert_eq!(writer.metric_count(), 2);
    }

    #[test]
    fn instance_names_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("instances.mmv"));

        let long_a = format!("{}A", "w".repeat(70));
        let long_b = format!("{}B", "w".repeat(70));
        assert!(matches!(
            writer.add_metric(MetricName::with_instance("m", long_a.as_str(), "rejected"), 1u32),
            Err(WriterError::NameTooLong {
                part: "instance",
                length: 71,
                limit: 63,
                ..
            })
        ));
        assert!(matches!(
            writer.add_metric(MetricName::with_instance("m", long_b.as_str(), "rejected"), 2u32),
            Err(WriterError::NameTooLong { part: "instance", .. })
        ));
        assert!(matches!(
            writer.add_metric(MetricName::with_instance("m", "caf\u{e9}", "rejected"), 3u32),
            Err(WriterError::NameNotEncodable { part: "instance", .. })
        ));
        assert!(matches!(
            writer.instance("rejected", &long_a),
            Err(WriterError::NameTooLong { part: "instance", .. })
        ));
        assert_eq!(writer.metric_count(), 0);

        // Names that differ only in their 63rd byte still fit, and stay distinct in the file.
        let edge_a = format!("{}A", "w".repeat(62));
        let edge_b = format!("{}B", "w".repeat(62));
        writer
            .add_metric(MetricName::with_instance("m", edge_a.as_str(), "d"), 1u32)
            .unwrap();
        writer
            .add_metric(MetricName::with_instance("m", edge_b.as_str(), "d"), 2u32)
            .unwrap();
        writer.start().unwrap();

        let domains = writer.catalog().unwrap().domains();
        assert_eq!(domains.len(), 1);
        assert!(domains.find("rejected").is_none());

        let file = MmvFile::parse(&std::fs::read(writer.path()).unwrap()).unwrap();
        assert_eq!(file.value("m", Some(edge_a.as_str())), Some(&MetricValue::U32(1)));
        assert_eq!(file.value("m", Some(edge_b.as_str())), Some(&MetricValue::U32(2)));
    }

    #[test]
    fn registration_racing_start_is_all_or_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 32;

        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("race.mmv"));
        writer.add_metric(MetricName::new("seed"), 0u64).unwrap();

        let results = std::thread::scope(|scope| {
            let registrations = (0..THREADS)
                .map(|t| {
                    let writer = &writer;
                    scope.spawn(move || {
                        (0..PER_THREAD)
                            .map(|i| {
                                let name = MetricName::new(format!("t{}.m{}", t, i));
                                let result = writer.add_metric(name.clone(), i as u64);
                                (name, result)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            let starter = scope.spawn(|| writer.start());

            assert!(starter.join().unwrap().is_ok());
            registrations
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        let catalog = writer.catalog().unwrap();
        let mut added = 0;
        for (name, result) in results {
            match result {
                Ok(()) => {
                    added += 1;
                    assert!(catalog.contains(&name), "{} was added but is not in the catalog", name);
                }
                Err(WriterError::Started { .. }) => {
                    assert!(!catalog.contains(&name), "{} was rejected but is in the catalog", name)
                }
                Err(e) => panic!("unexpected error for {}: {}", name, e),
            }
        }

        assert_eq!(writer.metric_count(), added + 1);
        assert_eq!(catalog.len(), added + 1);
    }

    #[test]
    fn format_constraints_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::new(dir.path().join("packed"), PackedFormat::default());

        assert!(matches!(
            writer.add_metric(MetricName::with_instance("a", "i", "d"), 1u32),
            Err(WriterError::InstancesNotSupported { .. })
        ));
        assert!(matches!(
            writer.add_metric(MetricName::new("ninechars"), 1u32),
            Err(WriterError::NameTooLong { length: 9, limit: 8, .. })
        ));
        assert!(writer.add_metric(MetricName::new("caf\u{e9}"), 1u32).is_ok());
        assert!(writer.add_metric(MetricName::new("b"), 2u64).is_ok());

        writer.start().unwrap();
        assert_eq!(std::fs::metadata(writer.path()).unwrap().len(), 16);
        assert_eq!(
            read_value(&writer, &MetricName::new("b"), MetricType::U64),
            Some(MetricValue::U64(2))
        );
    }

    #[test]
    fn lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("lifecycle.mmv"));
        let name = MetricName::new("a");

        assert!(matches!(writer.start(), Err(WriterError::NoMetrics)));
        assert!(matches!(
            writer.update_metric(&name, &1u64),
            Err(WriterError::NotStarted { .. })
        ));

        // A failed start with no metrics leaves the writer usable.
        writer.add_metric(name.clone(), 0u64).unwrap();
        writer.start().unwrap();
        assert!(writer.is_started());

        assert!(matches!(writer.start(), Err(WriterError::AlreadyStarted)));
        assert!(matches!(
            writer.update_metric(&MetricName::new("b"), &1u64),
            Err(WriterError::UnknownMetric { .. })
        ));
        assert!(matches!(
            writer.update_metric(&name, &1i64),
            Err(WriterError::HandlerTypeMismatch { .. })
        ));
        assert!(writer.flush().is_ok());
    }

    #[test]
    fn add_after_start_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("frozen.mmv"));

        writer.add_metric(MetricName::new("a"), 0u64).unwrap();
        writer.start().unwrap();
        let length = std::fs::metadata(writer.path()).unwrap().len();

        for i in 0..4u64 {
            assert!(matches!(
                writer.add_metric(MetricName::new(format!("late.{}", i)), i),
                Err(WriterError::Started { .. })
            ));
        }

        assert_eq!(writer.metric_count(), 1);
        assert_eq!(std::fs::metadata(writer.path()).unwrap().len(), length);
    }

    #[test]
    fn register_type_after_start_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("types.mmv"));

        writer.register_type(TypeHandlerRef::new::<u8, _>(WideHandler));
        assert!(matches!(
            writer.add_metric(MetricName::new("wide"), 1u8),
            Err(WriterError::ValueTooLarge { .. })
        ));

        writer.add_metric(MetricName::new("a"), 0u64).unwrap();
        writer.start().unwrap();
        writer.register_type(TypeHandlerRef::new::<u64, _>(U64Handler));
    }

    #[test]
    fn custom_handler_overrides_default() {
        struct Doubled;

        impl TypeHandler<u64> for Doubled {
            fn metric_type(&self) -> MetricType {
                MetricType::U64
            }

            fn put_bytes(&self, value: &u64, dst: &mut [u8]) {
                dst.copy_from_slice(&(value * 2).to_ne_bytes());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("custom.mmv"));
        let name = MetricName::new("doubled");

        writer.register_type(TypeHandlerRef::new::<u64, _>(Doubled));
        writer.add_metric(name.clone(), 2u64).unwrap();
        writer.start().unwrap();
        assert_eq!(read_value(&writer, &name, MetricType::U64), Some(MetricValue::U64(4)));

        writer.update_metric(&name, &21u64).unwrap();
        assert_eq!(read_value(&writer, &name, MetricType::U64), Some(MetricValue::U64(42)));
    }

    #[test]
    fn atomics_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("atomics.mmv"));
        let name = MetricName::new("atomic");

        writer.add_metric(name.clone(), AtomicU64::new(5)).unwrap();
        writer.start().unwrap();

        let counter = AtomicU64::new(0);
        counter.fetch_add(9, Ordering::Relaxed);
        writer.update_metric(&name, &counter).unwrap();
        assert_eq!(read_value(&writer, &name, MetricType::U64), Some(MetricValue::U64(9)));
    }

    #[test]
    fn failed_layout_leaves_writer_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::new(
            dir.path().join("overlap"),
            PackedFormat {
                overlap: true,
                ..Default::default()
            },
        );

        writer.add_metric(MetricName::new("a"), 1u64).unwrap();
        writer.add_metric(MetricName::new("b"), 2u64).unwrap();

        assert!(matches!(
            writer.start(),
            Err(WriterError::Layout {
                source: LayoutError::Overlap { .. }
            })
        ));
        assert!(!writer.is_started());
        assert!(!writer.path().exists());
        assert!(matches!(writer.start(), Err(WriterError::Unusable)));
        assert!(matches!(
            writer.add_metric(MetricName::new("c"), 3u64),
            Err(WriterError::Started { .. })
        ));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("missing").join("file.mmv"));

        writer.add_metric(MetricName::new("a"), 1u64).unwrap();
        assert!(matches!(writer.start(), Err(WriterError::Io { .. })));
        assert!(matches!(writer.start(), Err(WriterError::Unusable)));
    }

    #[test]
    fn domains_can_be_precreated() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("domains.mmv"));

        let pool = writer.instance_domain("pool").unwrap();
        assert_eq!(writer.instance_domain("pool").unwrap(), pool);
        let worker = writer.instance("pool", "worker").unwrap();
        assert_eq!(writer.instance("pool", "worker").unwrap(), worker);

        writer
            .add_metric(MetricName::with_instance("depth", "worker", "pool"), 0u32)
            .unwrap();
        writer.start().unwrap();

        assert_eq!(writer.instance_domain("pool").unwrap(), pool);
        assert_eq!(writer.instance("pool", "worker").unwrap(), worker);
        assert!(matches!(writer.instance_domain("new"), Err(WriterError::AlreadyStarted)));
        assert!(writer.descriptor_offset("depth").is_some());
        assert!(writer.descriptor_offset("nope").is_none());
    }
}
