//! Measurement file writers with clean feature flag handling.
//!
//! Every frequency of a campaign gets its own file. [`ResultWriter::begin`]
//! creates (or overwrites) it with the header row and every
//! [`ResultWriter::append`] adds one row and flushes, so a crash never loses
//! more than the point being acquired.

use crate::error::{AppResult, DaqError};
use crate::measurement::MeasurementRecord;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// What a measurement file is named after.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTag {
    /// Sample name, also the output subdirectory
    pub sample_id: String,
    /// Temperature step (K)
    pub temperature_k: f64,
    /// RF frequency (GHz)
    pub frequency_ghz: f64,
    /// RF output power (dBm)
    pub rf_power_dbm: i64,
    /// Modulation current amplitude (mA)
    pub ac_current_ma: f64,
}

impl RunTag {
    /// `{sample}_{T}K_{f}GHz_{P}dBm_{I}mA.csv`, with `.` written as `p` in
    /// the frequency and current tokens and the temperature truncated.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}K_{}GHz_{}dBm_{}mA.csv",
            self.sample_id,
            self.temperature_k.trunc() as i64,
            decimal_token(self.frequency_ghz),
            self.rf_power_dbm,
            decimal_token(self.ac_current_ma)
        )
    }
}

/// Always keeps one decimal place (`19` becomes `19p0`).
fn decimal_token(value: f64) -> String {
    let text = if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    };
    text.replace('.', "p")
}

/// Parse temperature and frequency back out of a measurement file name.
pub fn parse_file_name(path: &Path) -> Option<(f64, f64)> {
    let stem = path.file_stem()?.to_str()?;
    let mut temperature = None;
    let mut frequency = None;
    for token in stem.split('_') {
        if let Some(ghz) = token.strip_suffix("GHz") {
            frequency = ghz.replace('p', ".").parse().ok();
        } else if let Some(kelvin) = token.strip_suffix('K') {
            temperature = kelvin.parse().ok();
        }
    }
    Some((temperature?, frequency?))
}

/// Sink for measurement rows.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    /// Start a new file for `tag`, replacing any file of the same name, and
    /// write the header. Returns the file path.
    async fn begin(&mut self, tag: &RunTag) -> Result<PathBuf>;

    /// Append one row to the current file and flush it.
    async fn append(&mut self, record: &MeasurementRecord) -> Result<()>;

    /// Close the current file.
    async fn finish(&mut self) -> Result<()>;
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::measurement::HEADER;
    use anyhow::{anyhow, Context};
    use std::fs::File;

    /// Writes one CSV file per frequency below a sample directory.
    pub struct CsvResultWriter {
        directory: PathBuf,
        writer: Option<csv::Writer<File>>,
        path: Option<PathBuf>,
    }

    impl CsvResultWriter {
        pub fn new(directory: impl Into<PathBuf>) -> Self {
            Self {
                directory: directory.into(),
                writer: None,
                path: None,
            }
        }

        pub fn current_path(&self) -> Option<&Path> {
            self.path.as_deref()
        }
    }

    #[async_trait]
    impl ResultWriter for CsvResultWriter {
        async fn begin(&mut self, tag: &RunTag) -> Result<PathBuf> {
            self.finish().await?;
            if !self.directory.exists() {
                std::fs::create_dir_all(&self.directory).with_context(|| {
                    format!("Failed to create storage directory at {:?}", self.directory)
                })?;
            }
            let path = self.directory.join(tag.file_name());
            let file = File::create(&path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer
                .write_record(HEADER)
                .context("Failed to write CSV header")?;
            writer.flush().context("Failed to flush CSV header")?;

            log::info!("Writing measurements to '{}'", path.display());
            self.writer = Some(writer);
            self.path = Some(path.clone());
            Ok(path)
        }

        async fn append(&mut self, record: &MeasurementRecord) -> Result<()> {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| anyhow!("append called before begin"))?;
            writer
                .serialize(record)
                .context("Failed to write measurement to CSV file")?;
            writer.flush().context("Failed to flush CSV writer")?;
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            Ok(())
        }
    }

    /// Read every row of a measurement file.
    pub fn read_records(path: &Path) -> AppResult<Vec<MeasurementRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<std::result::Result<Vec<MeasurementRecord>, csv::Error>>()?;
        Ok(records)
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub struct CsvResultWriter;

    impl CsvResultWriter {
        pub fn new(_directory: impl Into<PathBuf>) -> Self {
            Self
        }

        pub fn current_path(&self) -> Option<&Path> {
            None
        }
    }

    #[async_trait]
    impl ResultWriter for CsvResultWriter {
        async fn begin(&mut self, _tag: &RunTag) -> Result<PathBuf> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn append(&mut self, _record: &MeasurementRecord) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub fn read_records(_path: &Path) -> AppResult<Vec<MeasurementRecord>> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_records, CsvResultWriter};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_records, CsvResultWriter};

/// Turn a writer failure into a storage error.
pub(crate) fn storage_error(err: anyhow::Error) -> DaqError {
    match err.downcast::<DaqError>() {
        Ok(daq) => daq,
        Err(other) => DaqError::Storage(format!("{other:#}")),
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;

    fn tag() -> RunTag {
        RunTag {
            sample_id: "YIG".to_string(),
            temperature_k: 21.7,
            frequency_ghz: 19.0,
            rf_power_dbm: 12,
            ac_current_ma: 100.0,
        }
    }

    fn record(field: f64) -> MeasurementRecord {
        MeasurementRecord {
            temperature_k: 21.7,
            frequency_ghz: 19.0,
            field_gauss: field,
            lockin_x: 1.5e-6,
            lockin_y: -2.5e-7,
            time_constant: 0.1,
        }
    }

    #[test]
    fn file_name_follows_convention() {
        assert_eq!(tag().file_name(), "YIG_21K_19p0GHz_12dBm_100p0mA.csv");
        let tag = RunTag {
            frequency_ghz: 19.5,
            rf_power_dbm: -3,
            ac_current_ma: 12.5,
            ..tag()
        };
        assert_eq!(tag.file_name(), "YIG_21K_19p5GHz_-3dBm_12p5mA.csv");
    }

    #[test]
    fn file_name_parses_back() {
        let path = PathBuf::from("/data").join(tag().file_name());
        assert_eq!(parse_file_name(&path), Some((21.0, 19.0)));
        assert_eq!(parse_file_name(Path::new("notes.csv")), None);
    }

    #[tokio::test]
    async fn header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::new(dir.path().join("YIG"));
        let path = writer.begin(&tag()).await.unwrap();
        writer.append(&record(2944.0)).await.unwrap();
        writer.append(&record(2948.7)).await.unwrap();
        writer.finish().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Temp(K),RF Freq(GHz),Field(G),Lockin_X_Ave,Lockin_Y_Ave,TimeConst")
        );
        assert_eq!(text.lines().count(), 3);

        let rows = read_records(&path).unwrap();
        assert_eq!(rows, vec![record(2944.0), record(2948.7)]);
    }

    #[tokio::test]
    async fn begin_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::new(dir.path());
        let path = writer.begin(&tag()).await.unwrap();
        writer.append(&record(1.0)).await.unwrap();
        writer.begin(&tag()).await.unwrap();
        writer.finish().await.unwrap();
        assert!(read_records(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_without_begin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvResultWriter::new(dir.path());
        assert!(writer.append(&record(1.0)).await.is_err());
    }

    #[test]
    fn writer_errors_become_storage_errors() {
        let err = storage_error(anyhow::anyhow!("disk full"));
        assert!(matches!(err, DaqError::Storage(_)));
        let err = storage_error(DaqError::FeatureNotEnabled("storage_csv".into()).into());
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
    }
}
