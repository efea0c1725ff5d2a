//! BM25 lexical scoring with a language-aware tokenizer.
//!
//! Latin-script text tokenizes on whitespace, lowercased with punctuation
//! trimmed. Text with at least 10% CJK characters tokenizes into character
//! bi- and tri-grams, which is what makes BM25 usable without a segmenter.

use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const CJK_THRESHOLD: f64 = 0.10;

/// Fraction of alphabetic characters in CJK ranges.
pub fn cjk_ratio(text: &str) -> f64 {
    let mut cjk = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        if c.is_whitespace() || c.is_ascii_punctuation() {
            continue;
        }
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        cjk as f64 / total as f64
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK unified ideographs
        | 0x3400..=0x4DBF    // extension A
        | 0x3040..=0x30FF    // hiragana + katakana
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xF900..=0xFAFF    // compatibility ideographs
    )
}

/// Tokenize a document or query, choosing the strategy by script.
pub fn tokenize(text: &str) -> Vec<String> {
    if cjk_ratio(text) >= CJK_THRESHOLD {
        tokenize_cjk(text)
    } else {
        tokenize_latin(text)
    }
}

fn tokenize_latin(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn tokenize_cjk(text: &str) -> Vec<String> {
    let chars: Vec<char> = text
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation())
        .collect();
    let mut tokens = Vec::new();
    for n in [2usize, 3] {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            tokens.push(window.iter().collect::<String>().to_lowercase());
        }
    }
    if tokens.is_empty() && !chars.is_empty() {
        tokens.push(chars.iter().collect::<String>().to_lowercase());
    }
    tokens
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scorer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// BM25 over a small, per-request candidate corpus.
pub struct Bm25 {
    term_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avg_len: f64,
    doc_freq: HashMap<String, usize>,
    n_docs: usize,
}

impl Bm25 {
    pub fn new(docs: &[String]) -> Self {
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in docs {
            let tokens = tokenize(doc);
            doc_lens.push(tokens.len());
            let mut tf: HashMap<String, usize> = HashMap::new();
            for t in tokens {
                *tf.entry(t).or_default() += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
            term_freqs.push(tf);
        }

        let n_docs = docs.len();
        let avg_len = if n_docs == 0 {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / n_docs as f64
        };

        Self { term_freqs, doc_lens, avg_len, doc_freq, n_docs }
    }

    /// Score every document against the query. Empty corpus → empty vec.
    pub fn score(&self, query: &str) -> Vec<f64> {
        let q_tokens = tokenize(query);
        (0..self.n_docs)
            .map(|i| self.score_doc(i, &q_tokens))
            .collect()
    }

    fn score_doc(&self, i: usize, q_tokens: &[String]) -> f64 {
        if self.avg_len == 0.0 {
            return 0.0;
        }
        let len_norm = 1.0 - B + B * self.doc_lens[i] as f64 / self.avg_len;
        q_tokens
            .iter()
            .map(|t| {
                let tf = *self.term_freqs[i].get(t).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    return 0.0;
                }
                let df = *self.doc_freq.get(t).unwrap_or(&0) as f64;
                let idf =
                    ((self.n_docs as f64 - df + 0.5) / (df + 0.5) + 1.0).ln();
                idf * tf * (K1 + 1.0) / (tf + K1 * len_norm)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin_tokenizer_lowercases_and_trims() {
        assert_eq!(
            tokenize("Tesla's Q3 earnings, (record!)"),
            vec!["tesla's", "q3", "earnings", "record"]
        );
    }

    #[test]
    fn cjk_detection_uses_ten_percent_threshold() {
        assert!(cjk_ratio("テスラの決算") > 0.9);
        assert!(cjk_ratio("tesla earnings report") == 0.0);
        // One CJK char in a long latin string stays under the threshold.
        let mixed = format!("{} 株", "tesla earnings report for the third quarter");
        assert!(cjk_ratio(&mixed) < CJK_THRESHOLD);
    }

    #[test]
    fn cjk_text_becomes_bi_and_trigrams() {
        let tokens = tokenize("株価予測");
        assert!(tokens.contains(&"株価".to_string()));
        assert!(tokens.contains(&"価予".to_string()));
        assert!(tokens.contains(&"株価予".to_string()));
    }

    #[test]
    fn single_cjk_char_still_tokenizes() {
        assert_eq!(tokenize("株"), vec!["株"]);
    }

    #[test]
    fn matching_docs_outscore_unrelated_ones() {
        let docs = vec![
            "tesla stock price surges after earnings".to_string(),
            "federal reserve interest rate decision".to_string(),
            "tesla delivery numbers beat estimates".to_string(),
        ];
        let scores = Bm25::new(&docs).score("tesla earnings");
        assert!(scores[0] > scores[1]);
        assert!(scores[2] > scores[1]);
        assert!(scores[0] > scores[2], "doc matching both terms wins");
    }

    #[test]
    fn empty_corpus_scores_empty() {
        assert!(Bm25::new(&[]).score("anything").is_empty());
    }

    #[test]
    fn rare_terms_weigh_more_than_common_ones() {
        let docs = vec![
            "stock stock stock market commentary".to_string(),
            "lithium refinery expansion stock".to_string(),
            "stock market daily wrap".to_string(),
        ];
        let scores = Bm25::new(&docs).score("lithium stock");
        assert!(scores[1] > scores[0]);
        assert!(scores[1] > scores[2]);
    }
}
