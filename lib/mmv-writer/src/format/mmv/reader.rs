use snafu::{ensure, OptionExt as _, Snafu};

use super::{
    MmvFlags, SectionType, DOMAIN_LENGTH, HEADER_LENGTH, INSTANCE_LENGTH, METRIC_LENGTH, MMV_MAGIC, MMV_NAME_LENGTH,
    MMV_VERSION, NO_INSTANCE_DOMAIN, TOC_ENTRY_LENGTH, VALUE_HEADER_LENGTH,
};
use crate::{MetricType, MetricValue};

/// An error decoding an MMV file.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseError {
    /// The file does not start with the MMV magic bytes.
    #[snafu(display("not an MMV file"))]
    BadMagic,

    /// The file was written with an unsupported layout version.
    #[snafu(display("unsupported MMV version {}", version))]
    UnsupportedVersion {
        /// Version found in the header.
        version: u32,
    },

    /// The writer has not finished populating the file.
    #[snafu(display("file is not ready (generations {} and {})", first, second))]
    NotReady {
        /// First generation field.
        first: u64,

        /// Second generation field.
        second: u64,
    },

    /// A field lies outside of the file.
    #[snafu(display("{} at offset {} lies outside of the file", what, offset))]
    Truncated {
        /// Description of the field.
        what: &'static str,

        /// Offset of the field.
        offset: usize,
    },

    /// The table of contents names an unknown section.
    #[snafu(display("unknown section type {}", code))]
    UnknownSection {
        /// Section type code.
        code: u32,
    },

    /// A metric descriptor names an unknown value type.
    #[snafu(display("metric {} has unknown type code {}", metric, code))]
    UnknownType {
        /// Name of the metric.
        metric: String,

        /// Type code.
        code: u32,
    },

    /// A record refers to an offset that holds no record of the expected kind.
    #[snafu(display("{} refers to unknown offset {}", what, offset))]
    DanglingReference {
        /// Description of the referring record.
        what: &'static str,

        /// Offset that was referred to.
        offset: u64,
    },
}

/// Decoded file header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MmvHeader {
    /// Layout version.
    pub version: u32,

    /// Generation shared by both generation fields.
    pub generation: u64,

    /// Number of table of contents entries.
    pub toc_count: u32,

    /// Header flags.
    pub flags: MmvFlags,

    /// ID of the process that wrote the file.
    pub process_id: u32,

    /// Cluster ID.
    pub cluster_id: u32,
}

/// Decoded instance domain record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MmvInstanceDomain {
    /// Offset of the record.
    pub offset: usize,

    /// Domain ID.
    pub id: u32,

    /// Number of instances in the domain.
    pub instance_count: u32,

    /// Offset of the first instance record, or zero if the domain has no instances.
    pub first_instance_offset: u64,
}

/// Decoded instance record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MmvInstance {
    /// Offset of the record.
    pub offset: usize,

    /// Offset of the owning domain record.
    pub domain_offset: u64,

    /// Instance ID, unique within its domain.
    pub id: u32,

    /// Instance name.
    pub name: String,
}

/// Decoded metric descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MmvMetric {
    /// Offset of the descriptor.
    pub offset: usize,

    /// Metric name.
    pub name: String,

    /// Item ID.
    pub item_id: u32,

    /// Value type.
    pub metric_type: MetricType,

    /// Instance domain ID, if the metric is instanced.
    pub domain_id: Option<u32>,

    /// Length of each value, in bytes.
    pub value_length: u32,
}

/// Decoded value block.
#[derive(Clone, Debug, PartialEq)]
pub struct MmvValue {
    /// Offset of the block.
    pub offset: usize,

    /// Offset of the value itself.
    pub value_offset: usize,

    /// Name of the metric the value belongs to.
    pub metric: String,

    /// Name of the instance the value belongs to, if the metric is instanced.
    pub instance: Option<String>,

    /// Current value.
    pub value: MetricValue,
}

/// A decoded MMV file.
#[derive(Clone, Debug, PartialEq)]
pub struct MmvFile {
    /// File header.
    pub header: MmvHeader,

    /// Instance domains.
    pub domains: Vec<MmvInstanceDomain>,

    /// Instances, grouped by domain.
    pub instances: Vec<MmvInstance>,

    /// Metric descriptors.
    pub metrics: Vec<MmvMetric>,

    /// Values.
    pub values: Vec<MmvValue>,
}

fn bytes_at<'a>(buf: &'a [u8], offset: usize, length: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
    offset
        .checked_add(length)
        .and_then(|end| buf.get(offset..end))
        .context(Truncated { what, offset })
}

fn u32_at(buf: &[u8], offset: usize, what: &'static str) -> Result<u32, ParseError> {
    let mut raw = [0; 4];
    raw.copy_from_slice(bytes_at(buf, offset, 4, what)?);
    Ok(u32::from_ne_bytes(raw))
}

fn u64_at(buf: &[u8], offset: usize, what: &'static str) -> Result<u64, ParseError> {
    let mut raw = [0; 8];
    raw.copy_from_slice(bytes_at(buf, offset, 8, what)?);
    Ok(u64::from_ne_bytes(raw))
}

fn name_at(buf: &[u8], offset: usize, what: &'static str) -> Result<String, ParseError> {
    let field = bytes_at(buf, offset, MMV_NAME_LENGTH, what)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

impl MmvFile {
    /// Decodes an MMV file.
    ///
    /// # Errors
    ///
    /// If the file is malformed, was written by an unsupported version, or is still being populated by its writer, an
    /// error is returned.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        ensure!(bytes_at(buf, 0, 4, "magic")? == MMV_MAGIC, BadMagic);
        let version = u32_at(buf, 4, "version")?;
        ensure!(version == MMV_VERSION, UnsupportedVersion { version });

        let first = u64_at(buf, 8, "generation")?;
        let second = u64_at(buf, 16, "generation")?;
        ensure!(first != 0 && first == second, NotReady { first, second });

        let header = MmvHeader {
            version,
            generation: first,
            toc_count: u32_at(buf, 24, "table of contents count")?,
            flags: MmvFlags::from(u32_at(buf, 28, "flags")?),
            process_id: u32_at(buf, 32, "process ID")?,
            cluster_id: u32_at(buf, 36, "cluster ID")?,
        };

        let mut file = MmvFile {
            header,
            domains: Vec::new(),
            instances: Vec::new(),
            metrics: Vec::new(),
            values: Vec::new(),
        };

        let mut value_section = None;
        for i in 0..file.header.toc_count as usize {
            let toc_offset = HEADER_LENGTH + i * TOC_ENTRY_LENGTH;
            let code = u32_at(buf, toc_offset, "table of contents entry")?;
            let count = u32_at(buf, toc_offset + 4, "table of contents entry")? as usize;
            let offset = u64_at(buf, toc_offset + 8, "table of contents entry")? as usize;

            match SectionType::from_code(code).context(UnknownSection { code })? {
                SectionType::InstanceDomains => {
                    for record in (0..count).map(|i| offset + i * DOMAIN_LENGTH) {
                        file.domains.push(MmvInstanceDomain {
                            offset: record,
                            id: u32_at(buf, record, "instance domain")?,
                            instance_count: u32_at(buf, record + 4, "instance domain")?,
                            first_instance_offset: u64_at(buf, record + 8, "instance domain")?,
                        });
                    }
                }
                SectionType::Instances => {
                    for record in (0..count).map(|i| offset + i * INSTANCE_LENGTH) {
                        file.instances.push(MmvInstance {
                            offset: record,
                            domain_offset: u64_at(buf, record, "instance")?,
                            id: u32_at(buf, record + 12, "instance")?,
                            name: name_at(buf, record + 16, "instance")?,
                        });
                    }
                }
                SectionType::Metrics => {
                    for record in (0..count).map(|i| offset + i * METRIC_LENGTH) {
                        let name = name_at(buf, record, "metric")?;
                        let code = u32_at(buf, record + 68, "metric")?;
                        let metric_type = match MetricType::from_code(code) {
                            Some(metric_type) => metric_type,
                            None => return UnknownType { metric: name, code }.fail(),
                        };
                        let domain_id = u32_at(buf, record + 72, "metric")?;

                        file.metrics.push(MmvMetric {
                            offset: record,
                            item_id: u32_at(buf, record + 64, "metric")?,
                            metric_type,
                            domain_id: (domain_id != NO_INSTANCE_DOMAIN).then_some(domain_id),
                            value_length: u32_at(buf, record + 76, "metric")?,
                            name,
                        });
                    }
                }
                // Values refer back to metrics and instances, so they're decoded once every other section has been.
                SectionType::Values => value_section = Some((offset, count)),
            }
        }

        if let Some((mut record, count)) = value_section {
            for _ in 0..count {
                let metric_offset = u64_at(buf, record, "value")?;
                let instance_offset = u64_at(buf, record + 8, "value")?;

                let metric = file
                    .metrics
                    .iter()
                    .find(|metric| metric.offset as u64 == metric_offset)
                    .context(DanglingReference {
                        what: "value",
                        offset: metric_offset,
                    })?;
                let instance = match instance_offset {
                    0 => None,
                    offset => Some(
                        file.instances
                            .iter()
                            .find(|instance| instance.offset as u64 == offset)
                            .context(DanglingReference { what: "value", offset })?
                            .name
                            .clone(),
                    ),
                };

                let value_offset = record + VALUE_HEADER_LENGTH;
                let value_length = metric.value_length as usize;
                let raw = bytes_at(buf, value_offset, value_length, "value")?;
                let value = MetricValue::decode(metric.metric_type, raw).context(Truncated {
                    what: "value",
                    offset: value_offset,
                })?;

                file.values.push(MmvValue {
                    offset: record,
                    value_offset,
                    metric: metric.name.clone(),
                    instance,
                    value,
                });

                record = value_offset + super::align8(value_length);
            }
        }

        Ok(file)
    }

    /// Returns the metric with the given name.
    pub fn metric(&self, name: &str) -> Option<&MmvMetric> {
        self.metrics.iter().find(|metric| metric.name == name)
    }

    /// Returns the instance domain with the given ID.
    pub fn domain(&self, id: u32) -> Option<&MmvInstanceDomain> {
        self.domains.iter().find(|domain| domain.id == id)
    }

    /// Returns the instances of the given domain.
    pub fn instances_of<'a>(&'a self, domain: &'a MmvInstanceDomain) -> impl Iterator<Item = &'a MmvInstance> + 'a {
        self.instances
            .iter()
            .filter(move |instance| instance.domain_offset == domain.offset as u64)
    }

    /// Returns the current value of the given metric and instance.
    pub fn value(&self, metric: &str, instance: Option<&str>) -> Option<&MetricValue> {
        self.values
            .iter()
            .find(|value| value.metric == metric && value.instance.as_deref() == instance)
            .map(|value| &value.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricName, MetricWriter, MmvFormat, MmvFormatConfig};

    fn started_writer(dir: &tempfile::TempDir, config: MmvFormatConfig) -> MetricWriter {
        let writer = MetricWriter::new(dir.path().join("test.mmv"), MmvFormat::new(config));
        writer.add_metric(MetricName::new("uptime"), 10u64).unwrap();
        writer.add_metric(MetricName::new("label"), String::from("ok")).unwrap();
        writer
            .add_metric(MetricName::with_instance("depth", "a", "pool"), -1i32)
            .unwrap();
        writer
            .add_metric(MetricName::with_instance("depth", "b", "pool"), 2i32)
            .unwrap();
        writer.add_metric(MetricName::new("ratio"), 0.5f64).unwrap();
        writer.start().unwrap();
        writer
    }

    #[test]
    fn parses_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = started_writer(
            &dir,
            MmvFormatConfig {
                cluster_id: 0x1123,
                no_prefix: true,
                process: false,
                process_id: Some(4242),
            },
        );

        let contents = std::fs::read(writer.path()).unwrap();
        let file = MmvFile::parse(&contents).unwrap();

        assert_eq!(file.header.version, MMV_VERSION);
        assert_ne!(file.header.generation, 0);
        assert_eq!(file.header.toc_count, 4);
        assert_eq!(file.header.flags, MmvFlags::NoPrefix);
        assert_eq!(file.header.process_id, 4242);
        assert_eq!(file.header.cluster_id, 0x123);

        assert_eq!(file.domains.len(), 1);
        assert_eq!(file.instances.len(), 2);
        assert_eq!(file.metrics.len(), 4);
        assert_eq!(file.values.len(), 5);

        assert_eq!(file.value("uptime", None), Some(&MetricValue::U64(10)));
        assert_eq!(file.value("label", None), Some(&MetricValue::String("ok".into())));
        assert_eq!(file.value("depth", Some("a")), Some(&MetricValue::I32(-1)));
        assert_eq!(file.value("depth", Some("b")), Some(&MetricValue::I32(2)));
        assert_eq!(file.value("ratio", None), Some(&MetricValue::F64(0.5)));

        let depth = file.metric("depth").unwrap();
        let domain = file.domain(depth.domain_id.unwrap()).unwrap();
        assert_eq!(domain.instance_count, 2);
        assert_eq!(domain.first_instance_offset, file.instances[0].offset as u64);
        let names = file.instances_of(domain).map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["a", "b"]);

        assert_eq!(file.metric("uptime").unwrap().domain_id, None);
        assert_eq!(file.metric("label").unwrap().value_length, 256);

        for value in &file.values {
            assert_eq!(value.value_offset % 8, 0);
            let name = match &value.instance {
                Some(instance) => MetricName::with_instance(value.metric.as_str(), instance.as_str(), "pool"),
                None => MetricName::new(value.metric.as_str()),
            };
            assert_eq!(writer.value_offsets(&name).unwrap().value_offset(), value.value_offset);
        }
    }

    #[test]
    fn empty_sections_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetricWriter::mmv(dir.path().join("flat.mmv"));
        writer.add_metric(MetricName::new("only"), 1u32).unwrap();
        writer.start().unwrap();

        let contents = std::fs::read(writer.path()).unwrap();
        let file = MmvFile::parse(&contents).unwrap();
        assert_eq!(file.header.toc_count, 2);
        assert!(file.domains.is_empty());
        assert!(file.instances.is_empty());
        assert_eq!(file.value("only", None), Some(&MetricValue::U32(1)));
    }

    #[test]
    fn rejects_incomplete_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = started_writer(&dir, MmvFormatConfig::default());
        let contents = std::fs::read(writer.path()).unwrap();

        let mut bad_magic = contents.clone();
        bad_magic[0] = b'X';
        assert_eq!(MmvFile::parse(&bad_magic), Err(ParseError::BadMagic));

        let mut not_ready = contents.clone();
        not_ready[16..24].copy_from_slice(&0u64.to_ne_bytes());
        assert!(matches!(MmvFile::parse(&not_ready), Err(ParseError::NotReady { .. })));

        assert!(matches!(
            MmvFile::parse(&contents[..contents.len() - 8]),
            Err(ParseError::Truncated { .. })
        ));
        assert!(matches!(MmvFile::parse(&contents[..2]), Err(ParseError::Truncated { .. })));
    }
}
