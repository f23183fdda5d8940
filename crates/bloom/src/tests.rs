use super::*;

// -------------------- Construction --------------------

#[test]
fn with_capacity_reserves_bits_per_token() {
    let bf = BloomFilter::with_capacity(100);
    assert!(bf.num_bits() >= (100 * BITS_PER_TOKEN) as u64);
    assert_eq!(bf.num_bits() % 64, 0);
    assert_eq!(bf.num_hashes(), HASHES_COUNT);
}

#[test]
fn zero_capacity_still_has_one_word() {
    let bf = BloomFilter::with_capacity(0);
    assert_eq!(bf.num_bits(), 64);
    assert!(!bf.may_contain("anything"));
}

// -------------------- Insert / Contains --------------------

#[test]
fn inserted_token_is_found() {
    let mut bf = BloomFilter::with_capacity(10);
    bf.insert("hello");
    assert!(bf.may_contain("hello"));
}

#[test]
fn empty_filter_contains_nothing() {
    let bf = BloomFilter::with_capacity(100);
    assert!(!bf.may_contain("hello"));
    assert!(!bf.may_contain(""));
}

#[test]
fn from_tokens_contains_all_tokens() {
    let tokens: Vec<String> = (0..1000).map(|i| format!("token{}", i)).collect();
    let bf = BloomFilter::from_tokens(&tokens);
    for t in &tokens {
        assert!(bf.may_contain(t), "false negative for {}", t);
    }
    assert!(bf.contains_all(&tokens));
}

#[test]
fn false_positive_rate_is_low() {
    let tokens: Vec<String> = (0..1000).map(|i| format!("present{}", i)).collect();
    let bf = BloomFilter::from_tokens(&tokens);

    let false_positives = (0..10_000)
        .filter(|i| bf.may_contain(&format!("absent{}", i)))
        .count();

    // 16 bits and 6 probes per token gives roughly 0.1% in theory.
    assert!(
        false_positives < 100,
        "too many false positives: {} / 10000",
        false_positives
    );
}

#[test]
fn contains_all_fails_on_missing_token() {
    let bf = BloomFilter::from_tokens(&["foo", "bar"]);
    assert!(bf.contains_all(&["foo", "bar"]));
    assert!(!bf.contains_all(&["foo", "definitely_not_there_1234567"]));
}

// -------------------- Serialization --------------------

#[test]
fn marshal_unmarshal_preserves_membership() {
    let bf = BloomFilter::from_tokens(&["alpha", "beta", "gamma"]);
    let mut buf = Vec::new();
    bf.marshal(&mut buf);
    assert_eq!(buf.len(), bf.serialized_size());

    let bf2 = BloomFilter::unmarshal(&buf).unwrap();
    assert_eq!(bf, bf2);
    assert!(bf2.contains_all(&["alpha", "beta", "gamma"]));
}

#[test]
fn unmarshal_rejects_bad_length() {
    assert!(BloomFilter::unmarshal(&[]).is_err());
    assert!(BloomFilter::unmarshal(&[0u8; 7]).is_err());
}

#[test]
fn debug_format() {
    let bf = BloomFilter::with_capacity(4);
    let debug = format!("{:?}", bf);
    assert!(debug.contains("BloomFilter"));
    assert!(debug.contains("num_bits"));
}

// -------------------- Hashing --------------------

#[test]
fn hash128_halves_differ() {
    let (hi, lo) = hash128(b"stream{app=\"nginx\"}");
    assert_ne!(hi, lo);
    assert_eq!(hash128(b"x"), hash128(b"x"));
    assert_ne!(hash128(b"x"), hash128(b"y"));
}

#[test]
fn hash64_is_deterministic() {
    assert_eq!(hash64(b"field"), hash64(b"field"));
    assert_ne!(hash64(b"field"), hash64(b"Field"));
}

// -------------------- Tokenizer --------------------

#[test]
fn tokenize_splits_on_punctuation_and_lowercases() {
    let tokens = tokenize("GET /Api/v1?User=42 done");
    assert_eq!(tokens, vec!["get", "api", "v1", "user", "42", "done"]);
}

#[test]
fn tokenize_dedups_and_keeps_underscores() {
    let tokens = tokenize("foo_bar foo_bar FOO_BAR baz");
    assert_eq!(tokens, vec!["foo_bar", "baz"]);
}

#[test]
fn tokenize_handles_unicode_and_empty() {
    assert!(tokenize("").is_empty());
    assert!(tokenize("  ,;- ").is_empty());
    assert_eq!(tokenize("Привет мир"), vec!["привет", "мир"]);
}
