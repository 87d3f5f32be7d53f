//! Deterministic payee-name canonicalization.
//!
//! One pure function shared by the exclusion filter, the supplier match
//! worker and classifier prompt hygiene. No network calls; same input,
//! same output.

/// Punctuation stripped from names before tokenization.
const PUNCTUATION: [char; 11] = ['.', ',', ';', ':', '!', '?', '\'', '"', '(', ')', '-'];

/// Whole-word tokens removed after punctuation stripping, in order:
/// corporate suffixes first, then articles.
const DROPPED_TOKENS: [&str; 14] = [
    "llc",
    "inc",
    "corp",
    "co",
    "ltd",
    "lp",
    "llp",
    "corporation",
    "incorporated",
    "company",
    "limited",
    "the",
    "a",
    "an",
];

/// Canonicalize a raw payee name.
///
/// Casefolds, trims, collapses internal whitespace, strips punctuation,
/// and removes corporate suffixes and articles as whole tokens.
/// Idempotent: `normalize_name(normalize_name(x)) == normalize_name(x)`.
pub fn normalize_name(raw: &str) -> String {
    let folded = raw.to_lowercase();

    let stripped: String = folded
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();

    stripped
        .split_whitespace()
        .filter(|token| !DROPPED_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}
