use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::context::ContextPacket;

/// A bracket holding one or more labels: `[S1]`, `[S1, S7]`, `[S2;S3]`.
static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(S\d+(?:\s*[,;]\s*S\d+)*)\s*\]").unwrap());

static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"S(\d+)").unwrap());

/// Every label token inside citation brackets, in order of appearance.
fn cited_labels(text: &str) -> impl Iterator<Item = &str> {
    CITATION_RE
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .flat_map(|group| LABEL_RE.find_iter(group.as_str()))
        .map(|m| m.as_str())
}

/// Ordinals of every cited label in `text`, sorted and deduplicated.
/// Labels whose ordinal doesn't fit a `usize` are left out here; see
/// [`unknown_citations`].
pub fn cited_ordinals(text: &str) -> BTreeSet<usize> {
    cited_labels(text)
        .filter_map(|label| label[1..].parse().ok())
        .collect()
}

pub fn has_citations(text: &str) -> bool {
    CITATION_RE.is_match(text)
}

/// Labels cited in `text` that the packet never issued, in order of first
/// appearance. An ordinal too large to parse is always unknown.
pub fn unknown_citations(text: &str, packet: &ContextPacket) -> Vec<String> {
    let mut unknown: Vec<String> = Vec::new();
    for label in cited_labels(text) {
        let known = matches!(
            label[1..].parse::<usize>(),
            Ok(n) if n >= 1 && n <= packet.len()
        );
        if !known && !unknown.iter().any(|u| u == label) {
            unknown.push(label.to_string());
        }
    }
    unknown
}

/// Append a references list naming the chunks `answer` actually cites.
pub fn references_section(answer: &str, packet: &ContextPacket) -> String {
    let cited: Vec<_> = cited_ordinals(answer)
        .into_iter()
        .filter_map(|n| packet.citation(&format!("S{}", n)))
        .collect();

    if cited.is_empty() {
        return answer.to_string();
    }

    tracing::debug!("Answer cites {} of {} sources", cited.len(), packet.len());

    let mut output = answer.to_string();
    if !output.ends_with("\n\n") {
        output.push_str(if output.ends_with('\n') { "\n" } else { "\n\n" });
    }
    output.push_str("---\n\n## References\n\n");
    for citation in cited {
        output.push_str(&format!(
            "- [{}] {}\n",
            citation.label(),
            citation.chunk.provenance()
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::Chunk;
    use std::sync::Arc;

    fn packet(sources: &[&str]) -> ContextPacket {
        let hits = sources
            .iter()
            .map(|s| {
                (
                    Arc::new(Chunk {
                        source_id: s.to_string(),
                        chunk_index: 0,
                        text: format!("text of {}", s),
                        vector: vec![1.0],
                    }),
                    1.0,
                )
            })
            .collect();
        ContextPacket::assemble(hits, 10_000)
    }

    #[test]
    fn test_cited_ordinals() {
        let ords = cited_ordinals("Paris [S1], Lyon [S3] and again [S1]. Not [s2] or [S].");
        assert_eq!(ords.into_iter().collect::<Vec<_>>(), vec![1, 3]);
        assert!(has_citations("see [S12]"));
        assert!(!has_citations("no markers"));
    }

    #[test]
    fn test_unknown_citations() {
        let p = packet(&["a.txt", "b.txt"]);
        assert!(unknown_citations("[S1] and [S2]", &p).is_empty());
        assert_eq!(unknown_citations("[S0] [S2] [S3]", &p), vec!["S0", "S3"]);
        assert_eq!(unknown_citations("[S1]", &ContextPacket::empty()), vec!["S1"]);
    }

    #[test]
    fn test_grouped_labels_are_all_checked() {
        let p = packet(&["a.txt"]);
        assert_eq!(unknown_citations("Paris [S1, S7].", &p), vec!["S7"]);
        assert_eq!(unknown_citations("Paris [S1,S7].", &p), vec!["S7"]);
        assert_eq!(unknown_citations("Paris [S7; S1] and [S7].", &p), vec!["S7"]);
        assert!(unknown_citations("Paris [ S1 ].", &p).is_empty());
        assert_eq!(
            cited_ordinals("[S2, S1] [S3]").into_iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(has_citations("see [S1, S2]"));
    }

    #[test]
    fn test_overflowing_ordinal_is_unknown() {
        let p = packet(&["a.txt"]);
        assert_eq!(
            unknown_citations("Paris [S99999999999999999999999].", &p),
            vec!["S99999999999999999999999"]
        );
        assert!(cited_ordinals("[S99999999999999999999999]").is_empty());
    }

    #[test]
    fn test_references_section_lists_only_cited() {
        let p = packet(&["a.txt", "b.txt", "c.txt"]);
        let out = references_section("Fact one [S3]. Fact two [S1].", &p);
        assert!(out.contains("## References"));
        assert!(out.contains("- [S1] a.txt (chunk 0)"));
        assert!(out.contains("- [S3] c.txt (chunk 0)"));
        assert!(!out.contains("b.txt"));
        assert!(out.find("[S1] a.txt").unwrap() < out.find("[S3] c.txt").unwrap());
    }

    #[test]
    fn test_references_section_without_citations_is_unchanged() {
        let p = packet(&["a.txt"]);
        assert_eq!(references_section("plain answer", &p), "plain answer");
    }
}
