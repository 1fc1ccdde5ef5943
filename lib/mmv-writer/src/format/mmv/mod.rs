//! The MMV format.
//!
//! A small, self-describing layout: a fixed header, a table of contents pointing at each section, and then one
//! section each for instance domains, instances, metric descriptors, and values. Sections with no entries are left out
//! of the table of contents. Every integer is written in native byte order, and every section starts on an 8-byte
//! boundary.
//!
//! | Record | Length | Fields |
//! |---|---|---|
//! | Header | 40 | magic `MMV\0`, version `u32`, generation 1 `u64`, generation 2 `u64`, TOC count `u32`, flags `u32`, process ID `u32`, cluster ID `u32` |
//! | TOC entry | 16 | section type `u32`, entry count `u32`, section offset `u64` |
//! | Instance domain | 16 | ID `u32`, instance count `u32`, offset of first instance `u64` |
//! | Instance | 80 | domain offset `u64`, padding `u32`, ID `u32`, name `[u8; 64]` |
//! | Metric | 80 | name `[u8; 64]`, item ID `u32`, type code `u32`, domain ID `u32`, value length `u32` |
//! | Value | 16 + slot | metric offset `u64`, instance offset `u64`, value slot (value length rounded up to 8) |
//!
//! Both generation fields are zero while the file is being populated, and are set to the same non-zero timestamp once
//! the file is complete. A reader that sees a zero or mismatched generation should treat the file as not ready.

use std::time::{SystemTime, UNIX_EPOCH};

use bitmask_enum::bitmask;
use serde::Deserialize;

use super::{align8, BufferWriter, LayoutError, MetricFormat, NameEncoding};
use crate::{identity::calculate_id, Catalog};

mod reader;
pub use self::reader::{MmvFile, MmvHeader, MmvInstance, MmvInstanceDomain, MmvMetric, MmvValue, ParseError};

/// Magic bytes at the start of every file.
pub const MMV_MAGIC: [u8; 4] = *b"MMV\0";

/// Version of the layout described in this module.
pub const MMV_VERSION: u32 = 1;

/// Length of name fields, including the terminating NUL.
pub const MMV_NAME_LENGTH: usize = 64;

/// Domain ID written for metrics that have no instance domain.
pub const NO_INSTANCE_DOMAIN: u32 = u32::MAX;

/// Mask applied to cluster IDs, which are 12 bits wide.
pub const CLUSTER_ID_MASK: u32 = 0xFFF;

const HEADER_LENGTH: usize = 40;
const TOC_ENTRY_LENGTH: usize = 16;
const DOMAIN_LENGTH: usize = 16;
const INSTANCE_LENGTH: usize = 80;
const METRIC_LENGTH: usize = 80;
const VALUE_HEADER_LENGTH: usize = 16;

/// Section types, as written in the table of contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SectionType {
    /// Instance domain records.
    InstanceDomains = 1,

    /// Instance records.
    Instances = 2,

    /// Metric descriptors.
    Metrics = 3,

    /// Value blocks.
    Values = 4,
}

impl SectionType {
    /// Returns the section type for the given code, if known.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::InstanceDomains,
            2 => Self::Instances,
            3 => Self::Metrics,
            4 => Self::Values,
            _ => return None,
        })
    }
}

/// Flags written to the file header.
#[bitmask(u32)]
pub enum MmvFlags {
    /// Readers should not prefix metric names with the file name.
    NoPrefix = 0x1,

    /// Readers should only export the file while the writing process is alive.
    Process = 0x2,
}

/// Configuration of the MMV format.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MmvFormatConfig {
    /// Cluster ID, distinguishing this file from others read by the same agent.
    ///
    /// Only the low 12 bits are used.
    pub cluster_id: u32,

    /// Whether to set the no-prefix flag.
    pub no_prefix: bool,

    /// Whether to set the process flag.
    pub process: bool,

    /// Process ID written to the header.
    ///
    /// Defaults to the ID of the current process.
    pub process_id: Option<u32>,
}

impl MmvFormatConfig {
    /// Returns the header flags selected by this configuration.
    pub fn flags(&self) -> MmvFlags {
        let mut flags = MmvFlags::none();
        if self.no_prefix {
            flags |= MmvFlags::NoPrefix;
        }
        if self.process {
            flags |= MmvFlags::Process;
        }
        flags
    }
}

#[derive(Clone, Copy, Debug)]
struct TocEntry {
    section: SectionType,
    count: usize,
    offset: usize,
}

#[derive(Debug)]
struct SectionLayout {
    toc: Vec<TocEntry>,
    item_ids: Vec<u32>,
    length: usize,
}

/// The MMV format.
#[derive(Debug, Default)]
pub struct MmvFormat {
    config: MmvFormatConfig,
    layout: Option<SectionLayout>,
}

impl MmvFormat {
    /// Creates a new `MmvFormat` with the given configuration.
    pub fn new(config: MmvFormatConfig) -> Self {
        Self { config, layout: None }
    }
}

fn generation_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .max(1)
}

fn missing(entity: impl Into<String>) -> LayoutError {
    LayoutError::MissingOffset { entity: entity.into() }
}

impl MetricFormat for MmvFormat {
    fn metric_name_limit(&self) -> usize {
        MMV_NAME_LENGTH - 1
    }

    fn instance_name_limit(&self) -> usize {
        MMV_NAME_LENGTH - 1
    }

    fn name_encoding(&self) -> NameEncoding {
        NameEncoding::Ascii
    }

    fn supports_instances(&self) -> bool {
        true
    }

    fn assign_offsets(&mut self, catalog: &mut Catalog) -> Result<(), LayoutError> {
        let domain_count = catalog.domains().len();
        let instance_count = catalog.domains().instance_count();
        let metric_count = catalog.metric_count();
        let value_count = catalog.len();

        let sections = [
            (SectionType::InstanceDomains, domain_count),
            (SectionType::Instances, instance_count),
            (SectionType::Metrics, metric_count),
            (SectionType::Values, value_count),
        ];
        let toc_count = sections.iter().filter(|(_, count)| *count > 0).count();

        let mut toc = Vec::with_capacity(toc_count);
        let mut offset = align8(HEADER_LENGTH + toc_count * TOC_ENTRY_LENGTH);

        for (section, count) in sections {
            if count > 0 {
                toc.push(TocEntry { section, count, offset });
            }

            match section {
                SectionType::InstanceDomains => {
                    for (_, domain) in catalog.domains_mut().iter_mut() {
                        domain.set_offset(offset);
                        offset += DOMAIN_LENGTH;
                    }
                }
                SectionType::Instances => {
                    for (_, domain) in catalog.domains_mut().iter_mut() {
                        for instance in domain.instances_mut() {
                            instance.set_offset(offset);
                            offset += INSTANCE_LENGTH;
                        }
                    }
                }
                SectionType::Metrics => {
                    for (_, metric) in catalog.metrics_mut() {
                        metric.set_descriptor_offset(offset);
                        offset += METRIC_LENGTH;
                    }
                }
                SectionType::Values => {
                    let slot_lengths = catalog
                        .values()
                        .map(|value| align8(catalog.metric_of(value).type_handler().data_length()))
                        .collect::<Vec<_>>();

                    for (value, slot_length) in catalog.values_mut().zip(slot_lengths) {
                        value.set_offsets(crate::ValueOffsets::new(offset, offset + VALUE_HEADER_LENGTH));
                        offset += VALUE_HEADER_LENGTH + slot_length;
                    }
                }
            }

            offset = align8(offset);
        }

        // Item IDs share the collision-resolving scheme used for instance domains, scoped to metric names.
        let mut item_ids: Vec<u32> = Vec::with_capacity(metric_count);
        for (_, metric) in catalog.metrics() {
            let id = calculate_id(metric.name(), |id| item_ids.contains(&id));
            item_ids.push(id);
        }

        self.layout = Some(SectionLayout {
            toc,
            item_ids,
            length: offset,
        });

        Ok(())
    }

    fn file_length(&self, _catalog: &Catalog) -> usize {
        self.layout.as_ref().map_or(0, |layout| layout.length)
    }

    fn populate(&self, buffer: &mut [u8], catalog: &Catalog) -> Result<(), LayoutError> {
        let layout = self.layout.as_ref().ok_or(LayoutError::NotLaidOut)?;
        let mut writer = BufferWriter::new(buffer);

        // Header, with both generations zeroed until everything else is written.
        writer.put_bytes(0, &MMV_MAGIC)?;
        writer.put_u32(4, MMV_VERSION)?;
        writer.put_u64(8, 0)?;
        writer.put_u64(16, 0)?;
        writer.put_u32(24, layout.toc.len() as u32)?;
        writer.put_u32(28, self.config.flags().bits())?;
        writer.put_u32(32, self.config.process_id.unwrap_or_else(std::process::id))?;
        writer.put_u32(36, self.config.cluster_id & CLUSTER_ID_MASK)?;

        for (i, entry) in layout.toc.iter().enumerate() {
            let toc_offset = HEADER_LENGTH + i * TOC_ENTRY_LENGTH;
            writer.put_u32(toc_offset, entry.section as u32)?;
            writer.put_u32(toc_offset + 4, entry.count as u32)?;
            writer.put_u64(toc_offset + 8, entry.offset as u64)?;
        }

        for (_, domain) in catalog.domains().iter() {
            let offset = domain.offset().ok_or_else(|| missing(format!("instance domain {}", domain.name())))?;
            let first_instance = domain.instances().next().and_then(|instance| instance.offset()).unwrap_or(0);

            writer.put_u32(offset, domain.id())?;
            writer.put_u32(offset + 4, domain.len() as u32)?;
            writer.put_u64(offset + 8, first_instance as u64)?;

            for instance in domain.instances() {
                let instance_offset = instance
                    .offset()
                    .ok_or_else(|| missing(format!("instance {} of {}", instance.name(), domain.name())))?;

                writer.put_u64(instance_offset, offset as u64)?;
                writer.put_u32(instance_offset + 8, 0)?;
                writer.put_u32(instance_offset + 12, instance.id())?;
                writer.put_padded_str(instance_offset + 16, MMV_NAME_LENGTH, instance.name())?;
            }
        }

        for (metric_ref, metric) in catalog.metrics() {
            let offset = metric
                .descriptor_offset()
                .ok_or_else(|| missing(format!("metric {}", metric.name())))?;
            let domain_id = metric
                .domain()
                .map_or(NO_INSTANCE_DOMAIN, |domain| catalog.domains().domain(domain).id());

            writer.put_padded_str(offset, MMV_NAME_LENGTH, metric.name())?;
            writer.put_u32(offset + 64, layout.item_ids[metric_ref.index()])?;
            writer.put_u32(offset + 68, metric.type_handler().metric_type().code())?;
            writer.put_u32(offset + 72, domain_id)?;
            writer.put_u32(offset + 76, metric.type_handler().data_length() as u32)?;
        }

        for value in catalog.values() {
            let offsets = value
                .offsets()
                .ok_or_else(|| missing(format!("value {}", value.name())))?;
            let metric = catalog.metric_of(value);
            let descriptor_offset = metric
                .descriptor_offset()
                .ok_or_else(|| missing(format!("metric {}", metric.name())))?;
            let instance_offset = match value.instance() {
                Some(instance) => catalog
                    .domains()
                    .instance(instance)
                    .offset()
                    .ok_or_else(|| missing(format!("instance of {}", value.name())))?,
                None => 0,
            };

            writer.put_u64(offsets.block_offset(), descriptor_offset as u64)?;
            writer.put_u64(offsets.block_offset() + 8, instance_offset as u64)?;

            let handler = metric.type_handler();
            let slot = writer.slice_mut(offsets.value_offset(), handler.data_length())?;
            if !handler.put_any(value.initial_value(), slot) {
                return Err(LayoutError::InitialValue {
                    name: value.name().to_string(),
                });
            }
        }

        let generation = generation_now();
        writer.put_u64(8, generation)?;
        writer.put_u64(16, generation)?;

        Ok(())
    }
}
