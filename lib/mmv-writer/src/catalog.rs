use std::any::Any;

use crate::{
    collections::FastIndexMap,
    identity::{DomainRef, InstanceDomains, InstanceRef},
    MetricName, TypeHandlerRef,
};

/// A handle to a metric within a [`Catalog`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MetricRef(usize);

impl MetricRef {
    /// Returns the position of the metric in registration order.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Metadata shared by every value of one metric.
#[derive(Debug)]
pub struct MetricInfo {
    name: String,
    domain: Option<DomainRef>,
    type_handler: TypeHandlerRef,
    descriptor_offset: Option<usize>,
}

impl MetricInfo {
    /// Returns the metric name, without any instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance domain of the metric, if the metric is instanced.
    pub const fn domain(&self) -> Option<DomainRef> {
        self.domain
    }

    /// Returns the type handler used for every value of the metric.
    pub const fn type_handler(&self) -> &TypeHandlerRef {
        &self.type_handler
    }

    /// Returns the byte offset of the metric descriptor, once laid out.
    pub const fn descriptor_offset(&self) -> Option<usize> {
        self.descriptor_offset
    }

    /// Sets the byte offset of the metric descriptor.
    pub fn set_descriptor_offset(&mut self, offset: usize) {
        self.descriptor_offset = Some(offset);
    }
}

/// Byte offsets of a single value within the backing file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ValueOffsets {
    block_offset: usize,
    value_offset: usize,
}

impl ValueOffsets {
    /// Creates a new set of offsets.
    pub const fn new(block_offset: usize, value_offset: usize) -> Self {
        Self {
            block_offset,
            value_offset,
        }
    }

    /// Returns the offset of the block holding the value and its metadata.
    pub const fn block_offset(&self) -> usize {
        self.block_offset
    }

    /// Returns the offset of the value itself.
    pub const fn value_offset(&self) -> usize {
        self.value_offset
    }
}

/// A single registered (metric, instance) pair.
pub struct ValueInfo {
    name: MetricName,
    metric: MetricRef,
    instance: Option<InstanceRef>,
    initial_value: Box<dyn Any + Send + Sync>,
    offsets: Option<ValueOffsets>,
}

impl ValueInfo {
    /// Returns the full name of the value.
    pub const fn name(&self) -> &MetricName {
        &self.name
    }

    /// Returns the metric the value belongs to.
    pub const fn metric(&self) -> MetricRef {
        self.metric
    }

    /// Returns the instance the value belongs to, if the metric is instanced.
    pub const fn instance(&self) -> Option<InstanceRef> {
        self.instance
    }

    /// Returns the value given when the metric was registered.
    pub fn initial_value(&self) -> &(dyn Any + Send + Sync) {
        self.initial_value.as_ref()
    }

    /// Returns the offsets of the value, once laid out.
    pub const fn offsets(&self) -> Option<ValueOffsets> {
        self.offsets
    }

    /// Sets the offsets of the value.
    pub fn set_offsets(&mut self, offsets: ValueOffsets) {
        self.offsets = Some(offsets);
    }
}

impl std::fmt::Debug for ValueInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueInfo")
            .field("name", &self.name)
            .field("metric", &self.metric)
            .field("instance", &self.instance)
            .field("offsets", &self.offsets)
            .finish_non_exhaustive()
    }
}

/// Every metric, value, instance domain, and instance known to a writer.
///
/// The catalog is built up during registration and handed to the format to lay out when the writer starts. Metrics
/// and values are kept in registration order.
#[derive(Debug, Default)]
pub struct Catalog {
    domains: InstanceDomains,
    metrics: FastIndexMap<String, MetricInfo>,
    values: FastIndexMap<MetricName, ValueInfo>,
}

impl Catalog {
    /// Returns the instance domains.
    pub const fn domains(&self) -> &InstanceDomains {
        &self.domains
    }

    /// Returns the instance domains, mutably.
    pub fn domains_mut(&mut self) -> &mut InstanceDomains {
        &mut self.domains
    }

    /// Returns the number of registered values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no values have been registered.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns `true` if a value with the given name has been registered.
    pub fn contains(&self, name: &MetricName) -> bool {
        self.values.contains_key(name)
    }

    /// Returns the number of distinct metrics.
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Looks up a metric by name.
    pub fn find_metric(&self, name: &str) -> Option<MetricRef> {
        self.metrics.get_index_of(name).map(MetricRef)
    }

    /// Returns the metric behind the given handle.
    pub fn metric(&self, metric: MetricRef) -> &MetricInfo {
        &self.metrics[metric.0]
    }

    /// Returns an iterator over all metrics, in registration order.
    pub fn metrics(&self) -> impl Iterator<Item = (MetricRef, &MetricInfo)> {
        self.metrics.values().enumerate().map(|(i, m)| (MetricRef(i), m))
    }

    /// Returns a mutable iterator over all metrics, in registration order.
    pub fn metrics_mut(&mut self) -> impl Iterator<Item = (MetricRef, &mut MetricInfo)> {
        self.metrics.values_mut().enumerate().map(|(i, m)| (MetricRef(i), m))
    }

    /// Looks up a value by name.
    pub fn value(&self, name: &MetricName) -> Option<&ValueInfo> {
        self.values.get(name)
    }

    /// Returns an iterator over all values, in registration order.
    pub fn values(&self) -> impl Iterator<Item = &ValueInfo> {
        self.values.values()
    }

    /// Returns a mutable iterator over all values, in registration order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut ValueInfo> {
        self.values.values_mut()
    }

    /// Returns the metric that `value` belongs to.
    pub fn metric_of(&self, value: &ValueInfo) -> &MetricInfo {
        self.metric(value.metric)
    }

    /// Gets the metric with the given name, creating it if needed.
    ///
    /// Consistency of the domain and type handler with an existing metric is the caller's responsibility.
    pub(crate) fn get_or_create_metric(
        &mut self, name: &str, domain: Option<DomainRef>, type_handler: &TypeHandlerRef,
    ) -> MetricRef {
        if let Some(index) = self.metrics.get_index_of(name) {
            return MetricRef(index);
        }

        let (index, _) = self.metrics.insert_full(
            name.to_string(),
            MetricInfo {
                name: name.to_string(),
                domain,
                type_handler: type_handler.clone(),
                descriptor_offset: None,
            },
        );
        MetricRef(index)
    }

    /// Inserts a new value.
    ///
    /// The name must not already be present.
    pub(crate) fn insert_value(
        &mut self, name: MetricName, metric: MetricRef, instance: Option<InstanceRef>,
        initial_value: Box<dyn Any + Send + Sync>,
    ) {
        debug_assert!(!self.values.contains_key(&name));

        let value = ValueInfo {
            name: name.clone(),
            metric,
            instance,
            initial_value,
            offsets: None,
        };
        self.values.insert(name, value);
    }
}
