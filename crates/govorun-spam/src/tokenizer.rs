//! Message preprocessing for the Bayes filter.
//!
//! Lowercase → URLs reduced to their domain → unicode word split → drop
//! short tokens → optional stemming for the chat's locale. The output is a
//! multiset: each token paired with its occurrence count.

use std::collections::HashMap;

use rust_stemmers::{Algorithm, Stemmer};
use unicode_segmentation::UnicodeSegmentation;

/// Tokenize `text` into `(token, count)` pairs.
///
/// `min_len` is measured in characters. `locale` selects the stemmer
/// ("ru", "en", …); unknown locales skip stemming.
pub fn tokenize(text: &str, min_len: usize, locale: &str) -> Vec<(String, i64)> {
    let lowered = text.to_lowercase();
    let stemmer = stemmer_for(locale);

    let mut counts: HashMap<String, i64> = HashMap::new();
    for word in lowered.split_whitespace() {
        if let Some(domain) = url_domain(word) {
            *counts.entry(domain).or_default() += 1;
            continue;
        }
        for token in word.unicode_words() {
            if token.chars().count() < min_len {
                continue;
            }
            let token = match &stemmer {
                Some(s) => s.stem(token).into_owned(),
                None => token.to_string(),
            };
            if token.chars().count() >= min_len {
                *counts.entry(token).or_default() += 1;
            }
        }
    }

    let mut out: Vec<(String, i64)> = counts.into_iter().collect();
    out.sort();
    out
}

/// Flat token list (with repetition) — what scoring iterates over.
pub fn token_list(text: &str, min_len: usize, locale: &str) -> Vec<String> {
    tokenize(text, min_len, locale)
        .into_iter()
        .flat_map(|(token, count)| std::iter::repeat(token).take(count.max(0) as usize))
        .collect()
}

/// If `word` looks like a URL, return its host as a single token.
fn url_domain(word: &str) -> Option<String> {
    let rest = word
        .strip_prefix("http://")
        .or_else(|| word.strip_prefix("https://"))
        .or_else(|| word.strip_prefix("www."))?;
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let host: String = rest
        .chars()
        .take_while(|c| *c != '/' && *c != '?' && *c != '#')
        .collect();
    if host.contains('.') {
        Some(host.trim_end_matches('.').to_string())
    } else {
        None
    }
}

fn stemmer_for(locale: &str) -> Option<Stemmer> {
    let algorithm = match locale {
        "ru" => Algorithm::Russian,
        "en" => Algorithm::English,
        "de" => Algorithm::German,
        "es" => Algorithm::Spanish,
        "fr" => Algorithm::French,
        _ => return None,
    };
    Some(Stemmer::create(algorithm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_repeated_tokens() {
        let tokens = tokenize("buy buy buy now", 3, "");
        assert_eq!(
            tokens,
            vec![("buy".to_string(), 3), ("now".to_string(), 1)]
        );
    }

    #[test]
    fn urls_collapse_to_domain() {
        let tokens = tokenize("visit http://evil.example/path?q=1 today", 3, "");
        assert!(tokens.iter().any(|(t, _)| t == "evil.example"));
        assert!(!tokens.iter().any(|(t, _)| t.contains("path")));
    }

    #[test]
    fn short_tokens_are_dropped() {
        let tokens = tokenize("a an the cat", 3, "");
        assert_eq!(tokens, vec![("cat".to_string(), 1), ("the".to_string(), 1)]);
    }

    #[test]
    fn empty_text_yields_empty_list() {
        assert!(tokenize("", 3, "").is_empty());
        assert!(tokenize("   \n\t  ", 3, "ru").is_empty());
    }

    #[test]
    fn unicode_text_does_not_crash() {
        // RTL, combining marks, emoji — tokenizer must stay calm.
        let text = "مرحبا بالعالم e\u{0301}toile \u{1F680} привет";
        let tokens = tokenize(text, 3, "");
        assert!(tokens.iter().any(|(t, _)| t.contains("привет")));
    }

    #[test]
    fn very_long_text_is_handled() {
        let text = "spam ".repeat(20_000); // ~100 KiB
        let tokens = tokenize(&text, 3, "");
        assert_eq!(tokens, vec![("spam".to_string(), 20_000)]);
    }

    #[test]
    fn russian_stemming_merges_forms() {
        let a = tokenize("покупка", 3, "ru");
        let b = tokenize("покупки", 3, "ru");
        assert_eq!(a[0].0, b[0].0);
    }

    #[test]
    fn token_list_repeats_by_count() {
        let list = token_list("buy buy now", 3, "");
        assert_eq!(list.len(), 3);
    }
}
