use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

use anyhow::Context as _;
use memmap2::Mmap;
use mmv_app::GenericError;
use mmv_writer::MmvFile;

/// Maps the given MMV file read-only and prints its header and every value to standard output.
pub fn dump(path: &Path) -> Result<(), GenericError> {
    let file = File::open(path).with_context(|| format!("Failed to open '{}'.", path.display()))?;

    // SAFETY: The mapping is only read, and `MmvFile::parse` copies everything it decodes, so a writer changing the
    // file underneath us can only produce torn values, never invalid memory accesses.
    let map = unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to map '{}'.", path.display()))?;

    let decoded = MmvFile::parse(&map).with_context(|| format!("Failed to decode '{}'.", path.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_dump(&decoded, &mut out)?;
    out.flush()?;

    Ok(())
}

fn write_dump<W: Write>(file: &MmvFile, out: &mut W) -> io::Result<()> {
    let header = &file.header;
    writeln!(
        out,
        "version={} generation={} toc={} flags={:?} pid={} cluster={}",
        header.version, header.generation, header.toc_count, header.flags, header.process_id, header.cluster_id
    )?;

    for metric in &file.metrics {
        let domain = metric.domain_id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string());
        writeln!(
            out,
            "metric {} item={} type={:?} domain={} length={}",
            metric.name, metric.item_id, metric.metric_type, domain, metric.value_length
        )?;
    }

    for value in &file.values {
        match &value.instance {
            Some(instance) => writeln!(out, "  {}[{}] = {}", value.metric, instance, value.value)?,
            None => writeln!(out, "  {} = {}", value.metric, value.value)?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use mmv_writer::{MetricName, MetricWriter};

    use super::*;

    #[test]
    fn dumps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.mmv");

        let writer = MetricWriter::mmv(&path);
        writer.add_metric(MetricName::new("app.requests"), 12u64).unwrap();
        writer
            .add_metric(MetricName::with_instance("app.queue", "east", "app.queues"), 3i32)
            .unwrap();
        writer.start().unwrap();

        let map = unsafe { Mmap::map(&File::open(&path).unwrap()) }.unwrap();
        let decoded = MmvFile::parse(&map).unwrap();

        let mut out = Vec::new();
        write_dump(&decoded, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.starts_with("version=1 "), "{}", out);
        assert!(out.contains("  app.requests = 12\n"), "{}", out);
        assert!(out.contains("  app.queue[east] = 3\n"), "{}", out);
        assert!(out.contains("metric app.requests item="), "{}", out);
    }

    #[test]
    fn rejects_files_that_are_not_mmv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, [0xffu8; 64]).unwrap();

        assert!(dump(&path).is_err());
    }
}
