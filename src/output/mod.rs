//! CSV datasets written at the end of a run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::reconcile::{ArrivedRecord, NeverArrivedRecord, ReconcileReport};
use crate::sampler::ResourceSample;

pub const ARRIVED_FILE: &str = "arrived_messages.csv";
pub const NEVER_ARRIVED_FILE: &str = "invalid_ids_never_arrived.csv";
pub const ARRIVED_TOO_LATE_FILE: &str = "invalid_ids_arrived_too_late.csv";
pub const SYSTEM_USAGE_FILE: &str = "system_usage.csv";

const ARRIVED_HEADER: &str = "ID,Sent Time,Received Time";
const NEVER_ARRIVED_HEADER: &str = "ID,Sent Time";
const SYSTEM_USAGE_HEADER: &str = "Time,CPU Usage,Memory Usage";

/// Writes the classification collections and resource trace into one
/// directory, one file per dataset.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    dir: PathBuf,
}

/// Paths of the files a [`DatasetWriter`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenDatasets {
    pub arrived: PathBuf,
    pub never_arrived: PathBuf,
    pub arrived_too_late: PathBuf,
    pub system_usage: PathBuf,
}

impl DatasetWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write all four datasets, creating the directory if needed. Existing
    /// files are replaced.
    pub fn write_all(
        &self,
        report: &ReconcileReport,
        trace: &[ResourceSample],
    ) -> Result<WrittenDatasets> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating output directory {}", self.dir.display()))?;

        let written = WrittenDatasets {
            arrived: self.write_arrived(ARRIVED_FILE, &report.arrived)?,
            never_arrived: self.write_never_arrived(&report.never_arrived)?,
            arrived_too_late: self.write_arrived(ARRIVED_TOO_LATE_FILE, &report.arrived_too_late)?,
            system_usage: self.write_system_usage(trace)?,
        };

        info!(
            dir = %self.dir.display(),
            arrived = report.arrived.len(),
            never_arrived = report.never_arrived.len(),
            arrived_too_late = report.arrived_too_late.len(),
            samples = trace.len(),
            "datasets written",
        );

        Ok(written)
    }

    fn write_arrived(&self, name: &str, records: &[ArrivedRecord]) -> Result<PathBuf> {
        self.write_file(name, ARRIVED_HEADER, |w| {
            for r in records {
                writeln!(w, "{},{},{}", r.id, r.sent_ns, r.received_ns)?;
            }
            Ok(())
        })
    }

    fn write_never_arrived(&self, records: &[NeverArrivedRecord]) -> Result<PathBuf> {
        self.write_file(NEVER_ARRIVED_FILE, NEVER_ARRIVED_HEADER, |w| {
            for r in records {
                writeln!(w, "{},{}", r.id, r.sent_ns)?;
            }
            Ok(())
        })
    }

    fn write_system_usage(&self, trace: &[ResourceSample]) -> Result<PathBuf> {
        self.write_file(SYSTEM_USAGE_FILE, SYSTEM_USAGE_HEADER, |w| {
            for s in trace {
                writeln!(
                    w,
                    "{},{:.1},{:.1}",
                    s.elapsed_ms, s.cpu_percent, s.memory_percent
                )?;
            }
            Ok(())
        })
    }

    fn write_file<F>(&self, name: &str, header: &str, rows: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        let path = self.dir.join(name);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{header}").with_context(|| format!("writing {}", path.display()))?;
        rows(&mut writer).with_context(|| format!("writing {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flushing {}", path.display()))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::AnomalyCounts;

    fn report() -> ReconcileReport {
        ReconcileReport {
            arrived: vec![
                ArrivedRecord {
                    id: 0,
                    sent_ns: 100,
                    received_ns: 250,
                },
                ArrivedRecord {
                    id: 2,
                    sent_ns: 300,
                    received_ns: 420,
                },
            ],
            never_arrived: vec![NeverArrivedRecord { id: 3, sent_ns: 400 }],
            arrived_too_late: vec![ArrivedRecord {
                id: 1,
                sent_ns: 200,
                received_ns: 500,
            }],
            anomalies: AnomalyCounts::default(),
            pending: 0,
        }
    }

    #[test]
    fn test_write_all_datasets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("benchmark");
        let trace = vec![
            ResourceSample {
                elapsed_ms: 100,
                cpu_percent: 12.5,
                memory_percent: 40.3,
            },
            ResourceSample {
                elapsed_ms: 200,
                cpu_percent: 3.0,
                memory_percent: 40.0,
            },
        ];

        let written = DatasetWriter::new(&out)
            .write_all(&report(), &trace)
            .expect("write");

        let arrived = std::fs::read_to_string(&written.arrived).expect("read");
        assert_eq!(arrived, "ID,Sent Time,Received Time\n0,100,250\n2,300,420\n");

        let never = std::fs::read_to_string(&written.never_arrived).expect("read");
        assert_eq!(never, "ID,Sent Time\n3,400\n");

        let late = std::fs::read_to_string(&written.arrived_too_late).expect("read");
        assert_eq!(late, "ID,Sent Time,Received Time\n1,200,500\n");

        let usage = std::fs::read_to_string(&written.system_usage).expect("read");
        assert_eq!(
            usage,
            "Time,CPU Usage,Memory Usage\n100,12.5,40.3\n200,3.0,40.0\n"
        );
    }

    #[test]
    fn test_empty_collections_write_headers_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let written = DatasetWriter::new(dir.path())
            .write_all(&ReconcileReport::default(), &[])
            .expect("write");

        let never = std::fs::read_to_string(&written.never_arrived).expect("read");
        assert_eq!(never, "ID,Sent Time\n");
        assert_eq!(written.system_usage, dir.path().join(SYSTEM_USAGE_FILE));
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write");

        let err = DatasetWriter::new(&blocker)
            .write_all(&ReconcileReport::default(), &[])
            .expect_err("should fail");
        assert!(err.to_string().contains("creating output directory"), "{err}");
    }
}
