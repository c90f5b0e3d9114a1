//! Measurement files and post-processing.

pub mod lineshape;
pub mod storage;

pub use lineshape::{estimate, LineshapeEstimate};
pub use storage::{parse_file_name, read_records, CsvResultWriter, ResultWriter, RunTag};
