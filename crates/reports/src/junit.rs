//! Forward-only JUnit XML reader.
//!
//! Reports can be hundreds of megabytes, so the document is never loaded as a
//! tree; a small state machine folds each `testcase` into a [`TestRun`] as soon
//! as its end tag is read.

use std::{borrow::Cow, io::BufRead, mem};

use ci_insights_core::models::{TestReportData, TestResult, TestRun};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use time::{
    OffsetDateTime, PrimitiveDateTime,
    format_description::well_known::{Iso8601, Rfc3339},
};

/// Number of leading lines searched for a `<testsuite` marker.
pub const PEEK_LINES: usize = 20;

const TESTSUITE_MARKER: &[u8] = b"<testsuite";

/// Cheap check on the head of a file before committing to a full parse.
pub fn looks_like_junit(head: &[u8]) -> bool {
    head.windows(TESTSUITE_MARKER.len()).any(|w| w == TESTSUITE_MARKER)
}

/// Parse a JUnit document.
///
/// Returns `Ok(None)` when the root element is not `testsuites`.
pub fn parse_junit<R: BufRead>(
    reader: R,
    fallback_start_time: OffsetDateTime,
) -> Result<Option<TestReportData>, quick_xml::Error> {
    let mut reader = Reader::from_reader(reader);
    let mut parser = JUnitParser::new(fallback_start_time);
    let mut buf = Vec::new();
    let mut seen_root = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if !seen_root {
                    if e.local_name().as_ref() != b"testsuites" {
                        return Ok(None);
                    }
                    seen_root = true;
                }
                parser.start(&e)?;
            }
            Event::Empty(e) => {
                if !seen_root {
                    let empty_root = e.local_name().as_ref() == b"testsuites";
                    return Ok(empty_root.then(TestReportData::default));
                }
                parser.empty(&e)?;
            }
            Event::End(e) => parser.end(e.local_name().as_ref()),
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .unwrap_or_else(|_| Cow::Owned(String::from_utf8_lossy(&e).into_owned()));
                parser.text(&text);
            }
            Event::CData(e) => parser.text(&String::from_utf8_lossy(&e)),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(seen_root.then_some(parser.report))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InTestSuite,
    InTestCase,
    InFailure,
    InSystemOut,
}

/// Fields of the test case currently being read; reset on every `testcase`.
#[derive(Debug, Default)]
struct CaseScratch {
    class_name: String,
    name: String,
    time: Option<String>,
    failed: bool,
    skipped: bool,
    failure_message: Option<String>,
    failure_output: String,
    system_out: String,
}

/// An open `testsuite`; suites may nest.
#[derive(Debug)]
struct Suite {
    name: String,
    start_time: OffsetDateTime,
}

struct JUnitParser {
    state: State,
    suites: Vec<Suite>,
    fallback_start_time: OffsetDateTime,
    case: CaseScratch,
    report: TestReportData,
}

impl JUnitParser {
    fn new(fallback_start_time: OffsetDateTime) -> Self {
        Self {
            state: State::Idle,
            suites: vec![],
            fallback_start_time,
            case: CaseScratch::default(),
            report: TestReportData::default(),
        }
    }

    fn start(&mut self, e: &BytesStart<'_>) -> Result<(), quick_xml::Error> {
        match (self.state, e.local_name().as_ref()) {
            (State::Idle | State::InTestSuite, b"testsuite") => {
                self.begin_suite(e)?;
                self.state = State::InTestSuite;
            }
            (State::InTestSuite, b"testcase") => {
                self.begin_case(e)?;
                self.state = State::InTestCase;
            }
            (State::InTestCase, b"failure" | b"error") => {
                self.case.failed = true;
                self.capture_message(e)?;
                self.state = State::InFailure;
            }
            (State::InTestCase, b"skipped") => {
                self.case.skipped = true;
                self.capture_message(e)?;
                self.state = State::InFailure;
            }
            (State::InTestCase, b"system-out") => self.state = State::InSystemOut,
            _ => {}
        }
        Ok(())
    }

    fn empty(&mut self, e: &BytesStart<'_>) -> Result<(), quick_xml::Error> {
        match (self.state, e.local_name().as_ref()) {
            (State::InTestSuite, b"testcase") => {
                self.begin_case(e)?;
                self.finish_case();
            }
            (State::InTestCase, b"failure" | b"error") => {
                self.case.failed = true;
                self.capture_message(e)?;
            }
            (State::InTestCase, b"skipped") => {
                self.case.skipped = true;
                self.capture_message(e)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &[u8]) {
        match (self.state, name) {
            (State::InFailure, b"failure" | b"error" | b"skipped")
            | (State::InSystemOut, b"system-out") => self.state = State::InTestCase,
            (State::InTestCase, b"testcase") => {
                self.finish_case();
                self.state = State::InTestSuite;
            }
            (State::InTestSuite, b"testsuite") => {
                self.suites.pop();
                if self.suites.is_empty() {
                    self.state = State::Idle;
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        match self.state {
            State::InFailure => self.case.failure_output.push_str(text),
            State::InSystemOut => self.case.system_out.push_str(text),
            _ => {}
        }
    }

    fn begin_suite(&mut self, e: &BytesStart<'_>) -> Result<(), quick_xml::Error> {
        let parent_start_time =
            self.suites.last().map_or(self.fallback_start_time, |s| s.start_time);
        let start_time = attribute(e, b"timestamp")?
            .and_then(|s| parse_timestamp(&s))
            .unwrap_or(parent_start_time);
        self.suites.push(Suite { name: attribute(e, b"name")?.unwrap_or_default(), start_time });
        Ok(())
    }

    fn begin_case(&mut self, e: &BytesStart<'_>) -> Result<(), quick_xml::Error> {
        self.case = CaseScratch {
            class_name: attribute(e, b"classname")?.unwrap_or_default(),
            name: attribute(e, b"name")?.unwrap_or_default(),
            time: attribute(e, b"time")?,
            ..Default::default()
        };
        Ok(())
    }

    fn capture_message(&mut self, e: &BytesStart<'_>) -> Result<(), quick_xml::Error> {
        if let Some(message) = attribute(e, b"message")? {
            self.case.failure_message = Some(message);
        }
        Ok(())
    }

    fn finish_case(&mut self) {
        let case = mem::take(&mut self.case);
        let result = if case.failed {
            TestResult::Failed
        } else if case.skipped {
            TestResult::Skipped
        } else {
            TestResult::Success
        };
        let (suite_name, start_time) = self
            .suites
            .last()
            .map_or(("", self.fallback_start_time), |s| (s.name.as_str(), s.start_time));
        let test_id = format!(
            "{}: {}{}",
            assembly_name(suite_name),
            remove_duplicate_part_in_class_name(&case.class_name, &case.name),
            case.name
        );
        let (failure_message, failure_output, system_output) = match result {
            TestResult::Success => (None, None, None),
            _ => (
                Some(case.failure_message.unwrap_or_default()),
                Some(case.failure_output),
                (!case.system_out.is_empty()).then_some(case.system_out),
            ),
        };
        self.report.push(TestRun {
            test_id,
            result,
            duration_ms: parse_duration_ms(case.time.as_deref()),
            start_time,
            failure_message,
            failure_output,
            system_output,
        });
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, quick_xml::Error> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .unwrap_or_else(|_| Cow::Owned(String::from_utf8_lossy(&attr.value).into_owned()));
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn assembly_name(suite_name: &str) -> &str {
    suite_name
        .strip_suffix(".dll.")
        .or_else(|| suite_name.strip_suffix(".dll"))
        .unwrap_or(suite_name)
}

/// `time` attribute in (invariant-culture) seconds to whole milliseconds.
fn parse_duration_ms(time: Option<&str>) -> u64 {
    time.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map_or(0, |secs| (secs * 1000.0).round() as u64)
}

fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(value, &Iso8601::DEFAULT))
        .ok()
        .or_else(|| {
            PrimitiveDateTime::parse(value, &Iso8601::DEFAULT)
                .ok()
                .map(PrimitiveDateTime::assume_utc)
        })
}

/// Strip the part of `class_name` that `test_case_name` repeats.
///
/// Frameworks often prefix the case name with the innermost class name
/// (class `Foo.Bar.MyTests`, case `MyTests.DoThing`). Every prefix of the case
/// name before its first `.` is searched for (last occurrence) in the class
/// name; the match of the longest prefix found wins and the class name is cut
/// at its start. Case names without a `.` are searched prefix by prefix over
/// their whole length.
pub fn remove_duplicate_part_in_class_name<'a>(
    class_name: &'a str,
    test_case_name: &str,
) -> &'a str {
    let mut best = None;
    for (idx, ch) in test_case_name.char_indices().skip(1) {
        if ch == '.' {
            break;
        }
        if let Some(pos) = class_name.rfind(&test_case_name[..idx]) {
            best = Some(pos);
        }
    }
    match best {
        Some(pos) => &class_name[..pos],
        None => class_name,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn parse(xml: &str) -> Option<TestReportData> {
        parse_junit(xml.as_bytes(), OffsetDateTime::UNIX_EPOCH).unwrap()
    }

    #[test]
    fn test_remove_duplicate_part_in_class_name() {
        let cases: &[(&str, &str, &str)] = &[
            (
                "Kontur.Forms.Candy...GetDigestTests.GetDigestTests",
                "GetDigestTests.GetDigest_FindExactBik",
                "Kontur.Forms.Candy...GetDigestTests.",
            ),
            ("Foo.Bar.MyTests", "MyTests.DoThing", "Foo.Bar."),
            ("MyTests", "MyTests.DoThing", ""),
            ("Foo.Bar", "Zed.Do", "Foo.Bar"),
            ("", "Any.Case", ""),
            // No dot: every prefix of the whole name is tried
            ("Foo.MyTests", "Test", "Foo.My"),
            ("Foo.Bar", "Xyz", "Foo.Bar"),
        ];
        for &(class_name, case_name, expected) in cases {
            assert_eq!(
                remove_duplicate_part_in_class_name(class_name, case_name),
                expected,
                "class={class_name} case={case_name}"
            );
        }
    }

    #[test]
    fn test_parse_cases_and_outcomes() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="Kontur.Tests.dll" timestamp="2024-03-01T10:15:00">
    <testcase classname="Kontur.Tests.MathTests" name="MathTests.Adds" time="0.0126" />
    <testcase classname="Kontur.Tests.MathTests" name="MathTests.Divides" time="1.5">
      <failure message="expected 2 but was 3"><![CDATA[at MathTests.Divides()]]></failure>
      <system-out>dividing</system-out>
    </testcase>
    <testcase classname="Kontur.Tests.MathTests" name="MathTests.Ignored">
      <skipped message="not today"/>
    </testcase>
    <testcase classname="Kontur.Tests.IoTests" name="Reads" time="abc">
      <properties><property name="x" value="y"/></properties>
    </testcase>
  </testsuite>
</testsuites>"#;
        let report = parse(xml).unwrap();
        assert_eq!(report.counters.total, 4);
        assert_eq!(report.counters.success, 2);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.skipped, 1);

        let adds = &report.runs[0];
        assert_eq!(adds.test_id, "Kontur.Tests: Kontur.Tests.MathTests.Adds");
        assert_eq!(adds.duration_ms, 13);
        assert_eq!(adds.start_time, datetime!(2024-03-01 10:15:00 UTC));
        assert_eq!(adds.failure_message, None);
        assert_eq!(adds.failure_output, None);
        assert_eq!(adds.system_output, None);

        let divides = &report.runs[1];
        assert_eq!(divides.result, TestResult::Failed);
        assert_eq!(divides.duration_ms, 1500);
        assert_eq!(divides.failure_message.as_deref(), Some("expected 2 but was 3"));
        assert_eq!(divides.failure_output.as_deref(), Some("at MathTests.Divides()"));
        assert_eq!(divides.system_output.as_deref(), Some("dividing"));

        let ignored = &report.runs[2];
        assert_eq!(ignored.result, TestResult::Skipped);
        assert_eq!(ignored.failure_message.as_deref(), Some("not today"));
        assert_eq!(ignored.duration_ms, 0);

        let reads = &report.runs[3];
        assert_eq!(reads.test_id, "Kontur.Tests: Kontur.Tests.IoTestsReads");
        assert_eq!(reads.duration_ms, 0);
        assert_eq!(reads.result, TestResult::Success);
    }

    #[test]
    fn test_scratch_is_reset_between_cases() {
        let xml = r#"<testsuites><testsuite name="s">
            <testcase classname="A" name="first"><failure message="boom">trace</failure></testcase>
            <testcase classname="A" name="second"></testcase>
        </testsuite></testsuites>"#;
        let report = parse(xml).unwrap();
        assert_eq!(report.runs[0].result, TestResult::Failed);
        assert_eq!(report.runs[1].result, TestResult::Success);
        assert_eq!(report.runs[1].failure_message, None);
    }

    #[test]
    fn test_nested_suites() {
        let xml = r#"<testsuites>
  <testsuite name="Outer.dll" timestamp="2024-03-01T10:00:00">
    <testsuite name="Inner.dll" timestamp="2024-03-01T11:00:00">
      <testcase classname="Inner.A" name="a"/>
    </testsuite>
    <testcase classname="Outer.B" name="b"/>
    <testsuite name="Untimed.dll">
      <testcase classname="Untimed.C" name="c"><failure message="boom"/></testcase>
    </testsuite>
  </testsuite>
  <testsuite name="Next.dll"><testcase classname="Next.D" name="d"/></testsuite>
</testsuites>"#;
        let report = parse(xml).unwrap();
        assert_eq!(report.counters.total, 4);
        assert_eq!(report.counters.failed, 1);
        let ids: Vec<_> = report.runs.iter().map(|r| r.test_id.as_str()).collect();
        assert_eq!(ids, [
            "Inner: Inner.Aa",
            "Outer: Outer.Bb",
            "Untimed: Untimed.Cc",
            "Next: Next.Dd"
        ]);
        assert_eq!(report.runs[0].start_time, datetime!(2024-03-01 11:00:00 UTC));
        assert_eq!(report.runs[1].start_time, datetime!(2024-03-01 10:00:00 UTC));
        assert_eq!(report.runs[2].start_time, datetime!(2024-03-01 10:00:00 UTC));
        assert_eq!(report.runs[3].start_time, OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_non_testsuites_root_is_rejected() {
        assert!(parse(r#"<project><testsuite name="x"/></project>"#).is_none());
        assert!(parse(r#"<testsuite name="x"><testcase name="a"/></testsuite>"#).is_none());
    }

    #[test]
    fn test_empty_testsuites_root() {
        let report = parse(r#"<?xml version="1.0"?><!-- c --><testsuites/>"#).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_missing_timestamp_uses_fallback() {
        let fallback = datetime!(2024-01-02 03:04:05 UTC);
        let xml = r#"<testsuites><testsuite name="s"><testcase name="a"/></testsuite></testsuites>"#;
        let report = parse_junit(xml.as_bytes(), fallback).unwrap().unwrap();
        assert_eq!(report.runs[0].start_time, fallback);
    }

    #[test]
    fn test_looks_like_junit() {
        assert!(looks_like_junit(b"<?xml version=\"1.0\"?>\n<testsuites>"));
        assert!(looks_like_junit(b"<testsuite name=\"a\">"));
        assert!(!looks_like_junit(b"<project><module/></project>"));
    }

    #[test]
    fn test_parse_duration_ms() {
        let cases: &[(Option<&str>, u64)] = &[
            (Some("1"), 1000),
            (Some("0.001"), 1),
            (Some(" 2.5 "), 2500),
            (Some("1,5"), 0),
            (Some("-3"), 0),
            (Some("NaN"), 0),
            (None, 0),
        ];
        for &(input, expected) in cases {
            assert_eq!(parse_duration_ms(input), expected, "{input:?}");
        }
    }
}
