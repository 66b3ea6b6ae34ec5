//! String helpers for the `<reasoning>`/`<answer>` completion format.

use tracing::debug;

pub const ANSWER_OPEN: &str = "<answer>";
pub const ANSWER_CLOSE: &str = "</answer>";

/// Credit for each expected marker found exactly once.
pub const MARKER_CREDIT: f64 = 0.125;

/// Penalty per character of text trailing the closing answer tag.
pub const TRAILING_PENALTY: f64 = 0.001;

const REASONING_OPEN_MARKER: &str = "<reasoning>\n";
const REASONING_CLOSE_MARKER: &str = "\n</reasoning>\n";
const ANSWER_OPEN_MARKER: &str = "\n<answer>\n";
const ANSWER_CLOSE_MARKER: &str = "\n</answer>";

/// Extract the content of the last `<answer>` block, trimmed.
///
/// Returns an empty string when the text has no `<answer>` tag. An unterminated
/// block runs to the end of the text.
pub fn extract_xml_answer(text: &str) -> String {
    let Some((_, after)) = text.rsplit_once(ANSWER_OPEN) else {
        debug!("no <answer> tag found, returning empty answer");
        return String::new();
    };
    let inner = after.find(ANSWER_CLOSE).map_or(after, |end| &after[..end]);
    let answer = inner.trim().to_string();
    debug!(answer = %answer, "extracted xml answer");
    answer
}

/// Partial credit for the shape of a completion.
///
/// Each of the four markers earns [`MARKER_CREDIT`] when it occurs exactly once. The
/// answer-open and answer-close checks each subtract [`TRAILING_PENALTY`] per character
/// that follows the closing `\n</answer>` (one trailing newline is free).
pub fn count_xml(text: &str) -> f64 {
    let penalty = trailing_chars(text) as f64 * TRAILING_PENALTY;
    let mut count = 0.0;

    if occurs_once(text, REASONING_OPEN_MARKER) {
        count += MARKER_CREDIT;
    }
    if occurs_once(text, REASONING_CLOSE_MARKER) {
        count += MARKER_CREDIT;
    }
    if occurs_once(text, ANSWER_OPEN_MARKER) {
        count += MARKER_CREDIT - penalty;
    }
    if occurs_once(text, ANSWER_CLOSE_MARKER) {
        count += MARKER_CREDIT - penalty;
    }

    debug!(count, "xml marker count");
    count
}

fn occurs_once(text: &str, marker: &str) -> bool {
    text.matches(marker).count() == 1
}

fn trailing_chars(text: &str) -> usize {
    text.rsplit_once(ANSWER_CLOSE_MARKER).map_or(0, |(_, tail)| {
        tail.strip_prefix('\n').unwrap_or(tail).chars().count()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "<reasoning>\n6 x 7 = 42\n</reasoning>\n<answer>\n42\n</answer>\n";

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_extract_answer_block() {
        assert_eq!(extract_xml_answer("<answer>\n42\n</answer>"), "42");
        assert_eq!(extract_xml_answer(WELL_FORMED), "42");
    }

    #[test]
    fn test_extract_without_answer_tag_is_empty() {
        assert_eq!(extract_xml_answer("The answer is 42."), "");
        assert_eq!(extract_xml_answer(""), "");
        assert_eq!(extract_xml_answer("</answer> only a closing tag"), "");
    }

    #[test]
    fn test_extract_uses_last_answer_block() {
        let text = "<answer>1</answer> then <answer> 2 </answer>";
        assert_eq!(extract_xml_answer(text), "2");
    }

    #[test]
    fn test_extract_unterminated_block_runs_to_end() {
        assert_eq!(extract_xml_answer("<answer>\n17  "), "17");
    }

    #[test]
    fn test_count_xml_well_formed_scores_all_markers() {
        assert_eq!(count_xml(WELL_FORMED), 0.5);
        assert_eq!(count_xml(WELL_FORMED.trim_end_matches('\n')), 0.5);
    }

    #[test]
    fn test_count_xml_penalizes_trailing_text_twice() {
        let text = format!("{WELL_FORMED}extra");
        assert!(approx(count_xml(&text), 0.5 - 2.0 * 5.0 * TRAILING_PENALTY));
    }

    #[test]
    fn test_count_xml_duplicate_marker_gets_no_credit() {
        let text = "<reasoning>\na\n</reasoning>\n<reasoning>\nb\n</reasoning>\n<answer>\n1\n</answer>\n";
        assert!(approx(count_xml(text), 0.25));
    }

    #[test]
    fn test_count_xml_plain_text_is_zero() {
        assert_eq!(count_xml("just some words"), 0.0);
    }
}
