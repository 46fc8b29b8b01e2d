//! Token-overlap and vector similarity used by the tiered cache.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Inputs are truncated to this many characters before tokenization.
/// Long requests beyond this point add noise, not signal.
const MAX_TOKENIZE_CHARS: usize = 2_000;

/// Minimum token length kept after filtering.
const MIN_TOKEN_LEN: usize = 3;

/// Stop words for the two request languages we see in practice.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    const ENGLISH: &[&str] = &[
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
        "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "will",
        "would", "there", "their", "what", "about", "which", "when", "make", "like", "time",
        "just", "him", "know", "take", "into", "your", "some", "could", "them", "than",
        "then", "now", "only", "come", "its", "over", "also", "back", "after", "use", "two",
        "how", "work", "well", "way", "want", "because", "any", "these", "give", "most",
        "should", "please", "need", "using", "create", "add",
    ];
    // "todo"/"todos" are excluded: they collide with the English task-list
    // noun, which carries real signal in build requests.
    const SPANISH: &[&str] = &[
        "que", "los", "las", "una", "por", "con", "para", "del", "est", "esta", "este",
        "como", "mas", "pero", "sus", "les", "nos", "ese", "esa", "eso", "hay", "ser",
        "son", "fue", "muy", "sin", "sobre", "tambien", "hasta", "donde", "quien", "desde",
        "durante", "uno", "bien", "puede", "cada", "nueva", "nuevo",
        "hacer", "crear", "agregar", "necesito", "quiero", "favor",
    ];
    ENGLISH.iter().chain(SPANISH.iter()).copied().collect()
});

/// Tokenize a request for fingerprint matching.
///
/// Lowercase, strip punctuation, collapse whitespace, truncate, drop stop
/// words and tokens shorter than 3 characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    let truncated: String = text.chars().take(MAX_TOKENIZE_CHARS).collect();
    let lowered = truncated.to_lowercase();

    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .filter(|t| !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Jaccard similarity `|A∩B| / |A∪B|`, 0 when either set is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Token-overlap similarity between two raw request texts.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    jaccard(&tokenize(a), &tokenize(b))
}

/// Cosine similarity between two embedding vectors, 0 on mismatched
/// dimensions or zero norms.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        na += *x as f64 * *x as f64;
        nb += *y as f64 * *y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_tokenize_lowercases_and_strips_punctuation() {
        let tokens = tokenize("Build a TODO-app, with React!");
        assert!(tokens.contains("build"));
        assert!(tokens.contains("todo"));
        assert!(tokens.contains("app"));
        assert!(tokens.contains("react"));
    }

    #[test]
    fn test_tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("the app is for you and me");
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("for"));
        assert!(!tokens.contains("is"));
        assert!(!tokens.contains("me"));
        assert!(tokens.contains("app"));
    }

    #[test]
    fn test_tokenize_spanish_stop_words() {
        let tokens = tokenize("crear una aplicacion para gestionar tareas");
        assert!(!tokens.contains("una"));
        assert!(!tokens.contains("para"));
        assert!(tokens.contains("aplicacion"));
        assert!(tokens.contains("tareas"));
    }

    #[test]
    fn test_todo_survives_stop_word_filtering() {
        let tokens = tokenize("quiero crear una app de lista todo");
        assert!(tokens.contains("todo"));
        assert!(!tokens.contains("quiero"));
        assert!(!tokens.contains("crear"));
    }

    #[test]
    fn test_jaccard_identical_nonempty_is_one() {
        let a = set(&["alpha", "beta", "gamma"]);
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_jaccard_disjoint_is_zero() {
        let a = set(&["alpha", "beta"]);
        let b = set(&["gamma", "delta"]);
        assert_eq!(jaccard(&a, &b), 0.0);
    }

    #[test]
    fn test_jaccard_empty_is_zero() {
        let a = set(&[]);
        let b = set(&["alpha"]);
        assert_eq!(jaccard(&a, &b), 0.0);
        assert_eq!(jaccard(&b, &a), 0.0);
        assert_eq!(jaccard(&a, &a), 0.0);
    }

    #[test]
    fn test_jaccard_symmetric() {
        let a = set(&["alpha", "beta", "gamma"]);
        let b = set(&["beta", "gamma", "delta"]);
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        // 2 shared / 4 union
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_token_overlap_order_invariant() {
        let x = "build todo application react frontend";
        let y = "react frontend build application todo";
        assert!((token_overlap(x, y) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_basics() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [1.0f32, 0.0, 0.0];
        let c = [0.0f32, 1.0, 0.0];
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine(&a, &c).abs() < 1e-9);
        assert_eq!(cosine(&a, &[]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }
}
