mod build_commit_parents;
mod process_in_progress_job;
mod process_job_run;
mod recalculate_test_statistics;

pub use build_commit_parents::process_build_commit_parents;
pub use process_in_progress_job::process_in_progress_job;
pub use process_job_run::process_job_run;
pub use recalculate_test_statistics::process_recalculate_test_statistics;
