use std::collections::HashSet;

/// Splits `s` into distinct lower-cased tokens.
///
/// A token is a maximal run of alphanumeric characters or `_`. Tokens are
/// returned in first-seen order without duplicates.
pub fn tokenize(s: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for word in s.split(|c: char| !is_token_char(c)) {
        if word.is_empty() {
            continue;
        }
        let token = word.to_lowercase();
        if seen.insert(token.clone()) {
            tokens.push(token);
        }
    }
    tokens
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
