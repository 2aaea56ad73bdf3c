//! Review prompt assembly. Pure string building, no I/O.

/// Upper bound on the length of a review that reports issues.
pub const MAX_RESPONSE_CHARS: usize = 500;

/// Separator placed between criterion labels.
pub const CRITERIA_DELIMITER: &str = ", ";

/// System instruction sent alongside every review request.
pub const SYSTEM_INSTRUCTION: &str = "Please output in Markdown format";

/// Build the user message for a review of `source_text` against `criteria`.
///
/// The file text is fenced verbatim. An empty `criteria` slice still yields a
/// well-formed prompt with an empty criteria clause; callers decide whether to
/// allow that.
pub fn build_review_prompt(source_text: &str, criteria: &[String], language: &str) -> String {
    let fence = fence_for(source_text);
    let joined = criteria.join(CRITERIA_DELIMITER);
    format!(
        "{fence}\n{source_text}\n{fence}\n\n\
         You are an experienced software engineer.\n\
         Review the code above for problems from the following perspectives only: {joined}.\n\
         Do not report problems outside those perspectives and avoid unnecessary remarks.\n\
         Include corrected code examples where helpful.\n\
         Keep the answer concise.\n\
         If there are problems, answer in at most {MAX_RESPONSE_CHARS} characters; if there are none, answer in a single line.\n\
         Answer in {language}."
    )
}

/// A backtick fence longer than any backtick run inside `text`, so the file
/// content cannot terminate the fence early.
fn fence_for(text: &str) -> String {
    let mut longest = 0usize;
    let mut run = 0usize;
    for c in text.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fences_source_verbatim() {
        let prompt = build_review_prompt("x=1", &labels(&["naming"]), "English");
        assert!(prompt.starts_with("```\nx=1\n```\n"));
    }

    #[test]
    fn joins_criteria_with_delimiter() {
        let prompt = build_review_prompt("x=1", &labels(&["naming", "duplication"]), "English");
        assert!(prompt.contains("naming, duplication"));
    }

    #[test]
    fn states_budget_and_language() {
        let prompt = build_review_prompt("", &labels(&["naming"]), "Japanese");
        assert!(prompt.contains("at most 500 characters"));
        assert!(prompt.contains("single line"));
        assert!(prompt.ends_with("Answer in Japanese."));
    }

    #[test]
    fn empty_criteria_still_well_formed() {
        let prompt = build_review_prompt("fn main() {}", &[], "English");
        assert!(prompt.contains("following perspectives only: ."));
        assert!(prompt.contains("fn main() {}"));
    }

    #[test]
    fn fence_outgrows_embedded_backticks() {
        let source = "let s = \"```\";";
        let prompt = build_review_prompt(source, &labels(&["naming"]), "English");
        assert!(prompt.starts_with("````\n"));
    }

    #[test]
    fn deterministic() {
        let c = labels(&["a", "b"]);
        assert_eq!(
            build_review_prompt("src", &c, "English"),
            build_review_prompt("src", &c, "English")
        );
    }
}
