use anyhow::{Context, Result};
use argp::FromArgs;
use ci_insights_core::models::TestResult;
use ci_insights_reports::extract_artifacts_contents;
use time::OffsetDateTime;
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Extract test results from a local artifact archive and print a summary.
#[argp(subcommand, name = "parse")]
pub struct Args {
    #[argp(option, short = 'i', from_str_fn(native_path))]
    /// artifact archive (.zip)
    input: Utf8NativePathBuf,
}

pub fn run(args: Args) -> Result<()> {
    let data = std::fs::read(args.input.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", args.input))?;
    let info = extract_artifacts_contents(&data, OffsetDateTime::now_utc())
        .with_context(|| format!("Failed to parse {}", args.input))?;

    match &info.test_report {
        Some(report) => {
            let counters = &report.counters;
            println!(
                "Tests: {} total, {} passed, {} failed, {} skipped",
                counters.total, counters.success, counters.failed, counters.skipped
            );
            for run in report.runs.iter().filter(|r| r.result == TestResult::Failed) {
                println!("  FAILED {}", run.test_id);
            }
        }
        None => println!("No test results found"),
    }
    println!("Code quality report: {}", if info.has_code_quality_report { "yes" } else { "no" });
    Ok(())
}
