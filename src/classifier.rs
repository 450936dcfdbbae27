//! Document type classification.
//!
//! Samples structural features from extracted text (and the original PDF's
//! raw byte layout where applicable) to classify a document into one of the
//! [`DocumentType`] buckets, driving downstream chunking/extraction choices
//! (e.g. a `textbook` gets a denser TOC-aware chunker than a `business`
//! memo). Classification is heuristic and feature-weighted, not ML-based —
//! cheap enough to run inline during ingestion on every document.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Academic,
    Technical,
    Textbook,
    Business,
    Book,
    Scanned,
    Presentation,
    MixedContent,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Academic => "academic",
            DocumentType::Technical => "technical",
            DocumentType::Textbook => "textbook",
            DocumentType::Business => "business",
            DocumentType::Book => "book",
            DocumentType::Scanned => "scanned",
            DocumentType::Presentation => "presentation",
            DocumentType::MixedContent => "mixed_content",
            DocumentType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub doc_type: DocumentType,
    pub confidence: f64,
    pub reasoning: String,
    pub features: serde_json::Value,
}

/// Classify `text` (the whole-document extracted text, or a representative
/// sample of its first N pages for large documents) into a [`DocumentType`].
pub fn classify_document(text: &str, page_count: Option<i64>) -> ClassificationResult {
    let sample: String = text.chars().take(20_000).collect();
    let lower = sample.to_lowercase();

    let has_abstract = has_abstract(&lower);
    let has_references = has_references(&lower);
    let citation_count = count_citations(&sample);
    let has_code = has_code_pattern(&sample);
    let avg_chars_per_page = page_count
        .filter(|&p| p > 0)
        .map(|p| text.len() as f64 / p as f64)
        .unwrap_or(f64::NAN);
    let chapter_markers = count_pattern(&lower, &["chapter ", "section "]);
    let bullet_density = bullet_line_ratio(&sample);
    let alnum_ratio = alnum_char_ratio(&sample);
    let has_tables = has_tables(&sample);
    let has_formulas = has_formulas(&sample);

    let mut scores: Vec<(DocumentType, f64)> = Vec::new();

    let mut academic_score = 0.0;
    if has_abstract {
        academic_score += 0.35;
    }
    if has_references {
        academic_score += 0.25;
    }
    if citation_count >= 3 {
        academic_score += 0.25;
    }
    scores.push((DocumentType::Academic, academic_score));

    let mut technical_score = 0.0;
    if has_code {
        technical_score += 0.5;
    }
    if lower.contains("api") || lower.contains("function") || lower.contains("parameter") {
        technical_score += 0.2;
    }
    scores.push((DocumentType::Technical, technical_score));

    let mut textbook_score = 0.0;
    if chapter_markers >= 3 {
        textbook_score += 0.4;
    }
    if page_count.unwrap_or(0) >= 80 {
        textbook_score += 0.2;
    }
    if lower.contains("exercise") || lower.contains("problem set") {
        textbook_score += 0.2;
    }
    scores.push((DocumentType::Textbook, textbook_score));

    let mut book_score = 0.0;
    if page_count.unwrap_or(0) >= 80 && chapter_markers < 3 {
        book_score += 0.4;
    }
    scores.push((DocumentType::Book, book_score));

    let mut business_score = 0.0;
    if lower.contains("confidential") || lower.contains("quarterly") || lower.contains("revenue") {
        business_score += 0.4;
    }
    if page_count.unwrap_or(99) <= 20 && !has_abstract {
        business_score += 0.2;
    }
    scores.push((DocumentType::Business, business_score));

    let mut presentation_score = 0.0;
    if bullet_density > 0.3 {
        presentation_score += 0.5;
    }
    scores.push((DocumentType::Presentation, presentation_score));

    let mut scanned_score = 0.0;
    if !alnum_ratio.is_nan() && alnum_ratio < 0.4 {
        scanned_score += 0.4;
    }
    if sample.trim().is_empty() {
        scanned_score += 0.5;
    }
    scores.push((DocumentType::Scanned, scanned_score));

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (best_type, best_score) = scores[0];

    // Below the confidence floor, fall back to mixed_content only when the
    // text actually carries tabular or formulaic structure; otherwise the
    // document just didn't match any bucket well.
    let (doc_type, confidence) = if best_score < 0.3 {
        if has_tables || has_formulas {
            (DocumentType::MixedContent, best_score.min(1.0))
        } else {
            (DocumentType::Unknown, 0.0)
        }
    } else {
        (best_type, best_score.min(1.0))
    };

    let reasoning = format!(
        "abstract={} references={} citations={} code={} chapters={} bullets={:.2} tables={} formulas={} page_avg_chars={:.0}",
        has_abstract, has_references, citation_count, has_code, chapter_markers, bullet_density, has_tables, has_formulas, avg_chars_per_page
    );

    ClassificationResult {
        doc_type,
        confidence,
        reasoning,
        features: serde_json::json!({
            "has_abstract": has_abstract,
            "has_references": has_references,
            "citation_count": citation_count,
            "has_code_pattern": has_code,
            "chapter_markers": chapter_markers,
            "bullet_density": bullet_density,
            "alnum_ratio": alnum_ratio,
            "has_tables": has_tables,
            "has_formulas": has_formulas,
        }),
    }
}

fn has_abstract(lower: &str) -> bool {
    lower.lines().take(200).any(|l| l.trim() == "abstract")
        || lower.contains("\nabstract\n")
        || lower.starts_with("abstract")
}

fn has_references(lower: &str) -> bool {
    lower.contains("\nreferences\n") || lower.contains("\nbibliography\n")
}

fn count_citations(text: &str) -> usize {
    // Counts bracketed numeric citations like [12] and author-year like (Smith, 2020).
    let bracket_re = regex::Regex::new(r"\[\d{1,3}\]").unwrap();
    let authoryear_re = regex::Regex::new(r"\([A-Z][a-zA-Z]+,\s*\d{4}\)").unwrap();
    bracket_re.find_iter(text).count() + authoryear_re.find_iter(text).count()
}

fn has_code_pattern(text: &str) -> bool {
    let indicators = ["fn ", "def ", "class ", "function(", "```", "{\n", "import ", "#include"];
    indicators.iter().filter(|p| text.contains(*p)).count() >= 2
}

fn count_pattern(lower: &str, patterns: &[&str]) -> usize {
    patterns.iter().map(|p| lower.matches(p).count()).sum()
}

fn bullet_line_ratio(text: &str) -> f64 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 0.0;
    }
    let bullets = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('-') || t.starts_with('•') || t.starts_with('*')
        })
        .count();
    bullets as f64 / lines.len() as f64
}

/// A crude tabular-layout detector: at least two lines carrying multiple
/// column separators (pipes or runs of tabs/spaces used as alignment).
fn has_tables(text: &str) -> bool {
    text.lines()
        .filter(|l| l.matches('|').count() >= 2 || l.matches('\t').count() >= 2)
        .count()
        >= 2
}

/// Detects math notation: symbol characters common in formulas, or an
/// `A = B op C`-shaped equation pattern.
fn has_formulas(text: &str) -> bool {
    let symbols = ['±', '√', '∑', '∫', '≤', '≥', '≠', '×', '÷', '∞'];
    let symbol_hits = text.chars().filter(|c| symbols.contains(c)).count();
    if symbol_hits >= 2 {
        return true;
    }
    let equation_re = regex::Regex::new(r"[A-Za-z]\w*\s*=\s*[-+]?[\w().]+\s*[+\-*/±]").unwrap();
    equation_re.is_match(text)
}

fn alnum_char_ratio(text: &str) -> f64 {
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return f64::NAN;
    }
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    alnum as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_academic_paper() {
        let text = "Abstract\nWe present a novel method [1] based on prior work (Smith, 2020) [2] [3].\nReferences\n1. ...";
        let result = classify_document(text, Some(10));
        assert_eq!(result.doc_type, DocumentType::Academic);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn detects_presentation_from_bullets() {
        let text = "- point one\n- point two\n- point three\n- point four\n- point five\n";
        let result = classify_document(text, Some(15));
        assert_eq!(result.doc_type, DocumentType::Presentation);
    }

    #[test]
    fn empty_text_is_scanned_or_unknown() {
        let result = classify_document("", Some(5));
        assert!(matches!(
            result.doc_type,
            DocumentType::Scanned | DocumentType::Unknown
        ));
    }

    #[test]
    fn low_confidence_with_table_is_mixed_content() {
        let text = "a | b | c\n1 | 2 | 3\nsome unrelated filler text with no other signal\n";
        let result = classify_document(text, Some(3));
        assert_eq!(result.doc_type, DocumentType::MixedContent);
    }

    #[test]
    fn low_confidence_without_structure_is_unknown() {
        let text = "just some plain filler sentences with nothing distinctive about them at all.";
        let result = classify_document(text, Some(3));
        assert_eq!(result.doc_type, DocumentType::Unknown);
    }

    #[test]
    fn has_formulas_detects_equation_pattern() {
        assert!(has_formulas("the result is x = y + z for all inputs"));
        assert!(!has_formulas("this sentence has an equals sign = but no equation"));
    }
}
