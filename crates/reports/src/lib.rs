//! Extraction of test results and code-quality markers from CI artifact archives.

mod artifacts;
pub mod junit;

pub use artifacts::{
    ArtifactsContentsInfo, ReportError, extract_artifacts_contents, is_code_quality_report,
};
pub use junit::{parse_junit, remove_duplicate_part_in_class_name};
