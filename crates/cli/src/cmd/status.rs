use anyhow::{Context, Result};
use argp::FromArgs;
use ci_insights_gitlab::trace::extract_custom_status_message;
use typed_path::Utf8NativePathBuf;

use crate::util::native_path;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Print the custom status message reported in a job trace.
#[argp(subcommand, name = "status")]
pub struct Args {
    #[argp(option, short = 'i', from_str_fn(native_path))]
    /// job trace file
    input: Utf8NativePathBuf,
}

pub fn run(args: Args) -> Result<()> {
    let trace = std::fs::read_to_string(args.input.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", args.input))?;
    match extract_custom_status_message(&trace) {
        Some(message) => print!("{message}"),
        None => eprintln!("No status message in {}", args.input),
    }
    Ok(())
}
