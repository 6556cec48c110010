//! Orchestrates one prostate MRI segmentation request: stage the three
//! modalities, run the detection model container, pick up its prediction
//! and summarize it.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod staging;
pub mod stats;
pub mod workspace;

pub use config::{ConfigError, PipelineConfig};
pub use error::{ErrorReport, PipelineError};
pub use pipeline::{Pipeline, PipelineResult, ResultStatus};
pub use resolver::{OutputPolicy, OutputResolver, ResolvedOutput};
pub use staging::{staged_file_name, InputManifest, InputStager, SourcePaths};
pub use stats::{summarize, summarize_values, StatisticsSummary, DECISION_THRESHOLD};
pub use workspace::{CaseId, RequestWorkspace};
