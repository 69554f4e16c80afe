//! Field extraction from result pages. Everything here is pure.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use cohort_core::{CandidateRecord, DecisionStatus};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Date shown on result pages whose entry was never filled in.
pub const PLACEHOLDER_DATE: &str = "31/12/1969";

pub const GPA_MAX: f64 = 5.0;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

static TERM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Fall|Spring|Summer|Winter)\b(?:\s+((?:19|20)\d{2}))?").expect("term regex")
});
static DECISION_ON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bon\s+(.+)$").expect("decision date regex"));
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number regex"));
static DT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("dt").expect("dt selector"));

/// Labels that head a field on result pages. A label is never a value.
const FIELD_LABELS: &[&str] = &[
    "Institution",
    "Program",
    "Degree Type",
    "Degree's Country of Origin",
    "Decision",
    "Notification",
    "Term",
    "Undergrad GPA",
    "GRE General",
    "GRE Verbal",
    "Analytical Writing",
    "Notes",
    "Timeline",
    "Added On",
    "Date Added",
];

/// Visible text of a page, one trimmed line per non-empty text node.
///
/// Script and style contents are skipped, so nothing returned carries markup.
pub fn page_lines(html: &str) -> Vec<String> {
    lines_of(&Html::parse_document(html))
}

fn lines_of(document: &Html) -> Vec<String> {
    document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name()));
            if matches!(parent, Some("script" | "style" | "noscript" | "template")) {
                return None;
            }
            let line = collapse_whitespace(text);
            (!line.is_empty()).then_some(line)
        })
        .collect()
}

pub fn is_placeholder_text(text: &str) -> bool {
    text.contains(PLACEHOLDER_DATE)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reduce free text to printable ASCII with single spaces.
pub fn sanitize_text(value: &str) -> Option<String> {
    let ascii = value
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { ' ' })
        .collect::<String>();
    let collapsed = collapse_whitespace(&ascii);
    (!collapsed.is_empty()).then_some(collapsed)
}

fn label_matches(line: &str, label: &str) -> bool {
    line.trim_end_matches(':').trim().eq_ignore_ascii_case(label)
}

fn is_field_label(line: &str) -> bool {
    FIELD_LABELS.iter().any(|label| label_matches(line, label))
}

/// `<dt>`/`<dd>` pairs in document order; an empty `<dd>` keeps an empty value.
fn definition_pairs(document: &Html) -> Vec<(String, String)> {
    document
        .select(&DT)
        .filter_map(|dt| {
            let dd = dt.next_siblings().find_map(ElementRef::wrap)?;
            if dd.value().name() != "dd" {
                return None;
            }
            let term = collapse_whitespace(&dt.text().collect::<Vec<_>>().join(" "));
            let value = collapse_whitespace(&dd.text().collect::<Vec<_>>().join(" "));
            Some((term, value))
        })
        .collect()
}

struct Page {
    lines: Vec<String>,
    pairs: Vec<(String, String)>,
}

impl Page {
    fn parse(html: &str) -> Self {
        let document = Html::parse_document(html);
        Self {
            lines: lines_of(&document),
            pairs: definition_pairs(&document),
        }
    }

    /// Value for `label`. A definition pair is authoritative, even when empty.
    fn labelled(&self, label: &str) -> Option<String> {
        if let Some((_, value)) = self.pairs.iter().find(|(term, _)| label_matches(term, label)) {
            return (!value.is_empty()).then(|| value.clone());
        }
        labelled(&self.lines, label)
    }
}

/// Value belonging to `label`: the rest of the label's line, or else the next
/// line unless that line is another field's label.
fn labelled(lines: &[String], label: &str) -> Option<String> {
    for (idx, line) in lines.iter().enumerate() {
        if label_matches(line, label) {
            return lines.get(idx + 1).filter(|next| !is_field_label(next)).cloned();
        }
        let Some(head) = line.get(..label.len()) else {
            continue;
        };
        if head.eq_ignore_ascii_case(label) {
            let rest = line[label.len()..].trim_start_matches(':').trim();
            if !rest.is_empty() && line[label.len()..].starts_with([':', ' ']) {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// Lines after `start` up to (not including) a line equal to `stop`.
fn section(lines: &[String], start: &str, stop: &str) -> Option<String> {
    let begin = lines.iter().position(|l| label_matches(l, start))?;
    let body = lines[begin + 1..]
        .iter()
        .take_while(|l| !label_matches(l, stop))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    sanitize_text(&body)
}

/// Parse a calendar date in any of the formats the listing service uses.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let text = value.trim();
    if text.is_empty() || text == PLACEHOLDER_DATE {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

/// Short decision dates ("17 Jan") carry no year; borrow one from elsewhere.
pub fn parse_decision_date(value: &str, year: Option<i32>) -> Option<NaiveDate> {
    if let Some(date) = parse_date(value) {
        return Some(date);
    }
    let year = year?;
    let with_year = format!("{} {year}", value.trim());
    ["%d %b %Y", "%d %B %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&with_year, fmt).ok())
}

fn first_number(value: &str) -> Option<f64> {
    NUMBER_RE.find(value)?.as_str().parse().ok()
}

/// Zero scores mean "not reported".
fn score(value: Option<String>) -> Option<f64> {
    value
        .as_deref()
        .and_then(first_number)
        .filter(|v| *v > 0.0)
}

pub fn parse_gpa(value: &str) -> Option<f64> {
    first_number(value).filter(|v| *v > 0.0 && *v <= GPA_MAX)
}

fn citizenship(page: &Page) -> Option<String> {
    let hint = page.labelled("Degree's Country of Origin");
    hint.into_iter()
        .chain(page.lines.iter().cloned())
        .find_map(|l| match l.as_str() {
            "International" | "American" | "Other" => Some(l),
            _ => None,
        })
}

fn term(page: &Page) -> Option<String> {
    let hint = page.labelled("Term");
    hint.into_iter().chain(page.lines.iter().cloned()).find_map(|l| {
        let caps = TERM_RE.captures(&l)?;
        let season = caps[1].to_string();
        let mut season = season[..1].to_ascii_uppercase() + &season[1..].to_ascii_lowercase();
        if let Some(year) = caps.get(2) {
            season.push(' ');
            season.push_str(year.as_str());
        }
        Some(season)
    })
}

/// Build a candidate from a result page.
///
/// Returns `None` when the page lacks the institution or program block.
/// `added_on_hint` is the listing's "Added On" value for this entry, if any;
/// without it only the page's own "Added On" field supplies `date_added`.
pub fn extract_candidate(
    html: &str,
    source_url: &str,
    added_on_hint: Option<&str>,
) -> Option<CandidateRecord> {
    let page = Page::parse(html);
    let university = page.labelled("Institution").and_then(|v| sanitize_text(&v))?;
    let program = page.labelled("Program").and_then(|v| sanitize_text(&v))?;

    let date_added = added_on_hint.and_then(parse_date).or_else(|| {
        page.labelled("Added On")
            .or_else(|| page.labelled("Date Added"))
            .as_deref()
            .and_then(parse_date)
    });

    let decision = page.labelled("Decision");
    let status = decision
        .as_deref()
        .map(DecisionStatus::from_decision_text)
        .unwrap_or_default();
    let decision_date = decision
        .as_deref()
        .and_then(|d| DECISION_ON_RE.captures(d).map(|c| c[1].trim().to_string()))
        .and_then(|d| parse_decision_date(&d, date_added.map(|a| a.year())));

    Some(CandidateRecord {
        source_url: source_url.to_string(),
        program: Some(program),
        university: Some(university),
        comments: section(&page.lines, "Notes", "Timeline"),
        date_added,
        decision_date,
        status,
        term: term(&page),
        citizenship: citizenship(&page),
        gre_total: score(page.labelled("GRE General")).map(|v| v as i32),
        gre_verbal: score(page.labelled("GRE Verbal")).map(|v| v as i32),
        gre_aw: score(page.labelled("Analytical Writing")),
        gpa: page.labelled("Undergrad GPA").as_deref().and_then(parse_gpa),
        degree: page.labelled("Degree Type").and_then(|v| sanitize_text(&v)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_parse_in_listing_formats() {
        let jan17 = NaiveDate::from_ymd_opt(2025, 1, 17);
        assert_eq!(parse_date("17/01/2025"), jan17);
        assert_eq!(parse_date("January 17, 2025"), jan17);
        assert_eq!(parse_date("Jan 17, 2025"), jan17);
        assert_eq!(parse_date("17 Jan 2025"), jan17);
        assert_eq!(parse_date("2025-01-17"), jan17);
        assert_eq!(parse_date(PLACEHOLDER_DATE), None);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn short_decision_dates_borrow_a_year() {
        assert_eq!(
            parse_decision_date("17 Jan", Some(2025)),
            NaiveDate::from_ymd_opt(2025, 1, 17)
        );
        assert_eq!(parse_decision_date("17 Jan", None), None);
    }

    #[test]
    fn gpa_outside_range_is_absent() {
        assert_eq!(parse_gpa("3.85"), Some(3.85));
        assert_eq!(parse_gpa("5.0"), Some(5.0));
        assert_eq!(parse_gpa("0"), None);
        assert_eq!(parse_gpa("9.2"), None);
        assert_eq!(parse_gpa("n/a"), None);
    }

    #[test]
    fn sanitize_drops_non_ascii_and_collapses_space() {
        assert_eq!(
            sanitize_text("Great  news \u{1F389}\n\u{201C}finally\u{201D}"),
            Some("Great news finally".to_string())
        );
        assert_eq!(sanitize_text(" \u{2728} "), None);
    }

    #[test]
    fn page_lines_skip_markup_and_scripts() {
        let lines = page_lines(
            "<html><head><script>var x = 1;</script></head><body><p>Hello <b>there</b></p></body></html>",
        );
        assert_eq!(lines, vec!["Hello".to_string(), "there".to_string()]);
    }

    #[test]
    fn missing_structural_markers_yield_none() {
        let html = "<html><body><dl><dt>Program</dt><dd>Physics</dd></dl></body></html>";
        assert!(extract_candidate(html, "https://example.test/result/1", None).is_none());
    }

    #[test]
    fn missing_optional_fields_stay_absent() {
        let html = "<html><body><dl>\
            <dt>Institution</dt><dd>Rice University</dd>\
            <dt>Program</dt><dd>Physics</dd>\
            <dt>GRE General:</dt><dd>0</dd>\
            </dl></body></html>";
        let record = extract_candidate(html, "https://example.test/result/2", None).unwrap();
        assert_eq!(record.university.as_deref(), Some("Rice University"));
        assert_eq!(record.gre_total, None);
        assert_eq!(record.gpa, None);
        assert_eq!(record.comments, None);
        assert_eq!(record.status, DecisionStatus::Unknown);
        assert_eq!(record.date_added, None);
    }

    #[test]
    fn empty_required_value_does_not_borrow_the_next_label() {
        let html = "<html><body><dl>\
            <dt>Institution</dt><dd></dd>\
            <dt>Program</dt><dd>Physics</dd>\
            </dl></body></html>";
        assert!(extract_candidate(html, "https://example.test/result/3", None).is_none());
    }

    #[test]
    fn empty_optional_value_stays_absent() {
        let html = "<html><body><dl>\
            <dt>Institution</dt><dd>Rice University</dd>\
            <dt>Program</dt><dd>Physics</dd>\
            <dt>Degree Type</dt><dd> </dd>\
            <dt>Degree's Country of Origin</dt><dd>American</dd>\
            <dt>Term</dt><dd>Fall 2025</dd>\
            </dl></body></html>";
        let record = extract_candidate(html, "https://example.test/result/4", None).unwrap();
        assert_eq!(record.degree, None);
        assert_eq!(record.citizenship.as_deref(), Some("American"));
        assert_eq!(record.term.as_deref(), Some("Fall 2025"));
    }

    #[test]
    fn loose_labels_never_take_a_following_label_as_value() {
        let html = "<html><body>\
            <p>Institution</p><p>Rice University</p>\
            <p>Program</p><p>Physics</p>\
            <p>Degree Type</p>\
            <p>Term</p><p>Spring 2026</p>\
            </body></html>";
        let record = extract_candidate(html, "https://example.test/result/5", None).unwrap();
        assert_eq!(record.university.as_deref(), Some("Rice University"));
        assert_eq!(record.degree, None);
        assert_eq!(record.term.as_deref(), Some("Spring 2026"));
    }

    #[test]
    fn unrelated_page_dates_are_not_taken_as_date_added() {
        let html = "<html><body><dl>\
            <dt>Institution</dt><dd>Rice University</dd>\
            <dt>Program</dt><dd>Physics</dd>\
            <dt>Notification</dt><dd>on 17/01/2025 via E-mail</dd>\
            </dl><p>Submitted January 3, 2025</p></body></html>";
        let record = extract_candidate(html, "https://example.test/result/6", None).unwrap();
        assert_eq!(record.date_added, None);
    }

    #[test]
    fn date_added_comes_from_hint_then_the_added_on_field() {
        let html = "<html><body><dl>\
            <dt>Institution</dt><dd>Rice University</dd>\
            <dt>Program</dt><dd>Physics</dd>\
            <dt>Added On</dt><dd>February 2, 2025</dd>\
            <dt>Decision</dt><dd>Rejected on 9 Feb</dd>\
            </dl></body></html>";
        let url = "https://example.test/result/7";
        let record = extract_candidate(html, url, None).unwrap();
        assert_eq!(record.date_added, NaiveDate::from_ymd_opt(2025, 2, 2));
        assert_eq!(record.decision_date, NaiveDate::from_ymd_opt(2025, 2, 9));

        let record = extract_candidate(html, url, Some("17/01/2025")).unwrap();
        assert_eq!(record.date_added, NaiveDate::from_ymd_opt(2025, 1, 17));
    }
}
