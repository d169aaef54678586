use std::sync::OnceLock;

use regex::Regex;

/// Custom status message a job printed as a TeamCity service message.
///
/// The last `##teamcity[buildStatus text='...']` (or `##testcity`) in the log
/// wins, so multi-stage builds can refine their status as they go.
pub fn extract_custom_status_message(trace: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(r"##(team|test)city\[buildStatus text='(?<statusText>.*?)'\]").unwrap()
    });
    let mut last = None;
    for line in trace.lines() {
        for captures in regex.captures_iter(line) {
            last = captures.name("statusText");
        }
    }
    last.map(|m| unescape_status_text(m.as_str()))
}

/// Reverse TeamCity service-message escaping.
///
/// Substitutions run in a fixed order: `|'`, `|n`, `|r`, `||`, `|[`, `|]`.
pub fn unescape_status_text(text: &str) -> String {
    text.replace("|'", "'")
        .replace("|n", "\n")
        .replace("|r", "\r")
        .replace("||", "|")
        .replace("|[", "[")
        .replace("|]", "]")
}
