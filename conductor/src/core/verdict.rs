//! Review verdict grammar.
//!
//! A status marker is `status:` or `verdict:` (any case, optionally wrapped
//! in markdown emphasis) followed by `PASS`, `NEEDS_ATTENTION` or
//! `NEEDS_REPLAN` (`_`, `-` or a space between words). The scanner walks the
//! text once; every marker overwrites the previous state, so the last marker
//! wins. Text with no marker falls through to `NEEDS_ATTENTION`: a bare
//! "pass" in prose is never a marker. A marker never spans a line break.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ReviewVerdict, Verdict};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:status|verdict)\b[*_` \t]*[:=][*_` \t]*(pass|needs[_ \t-]attention|needs[_ \t-]replan)\b",
    )
    .expect("verdict marker regex should compile")
});

/// Scanner state: nothing recognized yet, or the latest marker seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Unmarked,
    Marked(Verdict),
}

impl ScanState {
    fn on_marker(self, marker: Verdict) -> Self {
        ScanState::Marked(marker)
    }

    fn finish(self) -> Verdict {
        match self {
            ScanState::Marked(verdict) => verdict,
            ScanState::Unmarked => Verdict::NeedsAttention,
        }
    }
}

fn classify_marker(word: &str) -> Verdict {
    let word = word.to_ascii_lowercase();
    if word == "pass" {
        Verdict::Pass
    } else if word.ends_with("replan") {
        Verdict::NeedsReplan
    } else {
        Verdict::NeedsAttention
    }
}

/// Parse the verdict out of free-text review output.
pub fn parse_verdict(text: &str) -> Verdict {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|word| classify_marker(word.as_str()))
        .fold(ScanState::Unmarked, ScanState::on_marker)
        .finish()
}

/// Parse and keep the raw text alongside the verdict.
pub fn parse_review(text: &str) -> ReviewVerdict {
    ReviewVerdict {
        verdict: parse_verdict(text),
        raw: text.to_string(),
    }
}
