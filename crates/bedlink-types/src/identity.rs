//! Identifier normalization and the tolerant advertisement-matching predicate.
//!
//! These are pure functions on purpose: discovery matching is the kind of
//! logic that benefits from being tested with hand-picked strings rather
//! than wired through a scan loop, and the normalization round-trip law
//! (`normalize(normalize(x)) == normalize(x)`) only means anything if the
//! function has no hidden state.

/// Lowercase + trim. The first step of every normalization.
pub fn normalize_identifier(s: &str) -> String {
    s.trim().to_lowercase()
}

/// First run of 12+ consecutive hex digits in `s`, sliced to exactly 12.
fn first_12_hex_substring(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut run_start = 0usize;
    for i in 0..=chars.len() {
        let is_hex = i < chars.len() && chars[i].is_ascii_hexdigit();
        if !is_hex {
            let run_len = i - run_start;
            if run_len >= 12 {
                let hex: String = chars[run_start..run_start + 12].iter().collect();
                return Some(hex);
            }
            run_start = i + 1;
        }
    }
    None
}

/// All normalized forms a single configured token expands to:
/// the normalized token itself, its pure-hex form (if it is exactly 12 hex
/// digits once non-hex characters are stripped), and the first 12-hex
/// substring found anywhere inside it.
///
/// Idempotent: `identifier_variants` applied to any variant of `s` returns
/// a set of variants no larger than applying it to `s` itself, and
/// `normalize_identifier(normalize_identifier(x)) == normalize_identifier(x)`
/// holds for every variant produced.
pub fn identifier_variants(s: &str) -> Vec<String> {
    let base = normalize_identifier(s);
    let mut variants = vec![base.clone()];

    let hex_only: String = base.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex_only.len() == 12 && !variants.contains(&hex_only) {
        variants.push(hex_only);
    }

    if let Some(sub) = first_12_hex_substring(&base) {
        if !variants.contains(&sub) {
            variants.push(sub);
        }
    }

    variants
}

/// If `token` is itself exactly 12 hex digits, return it; used to pick the
/// stable bed identity out of a set of identifier variants.
pub fn first_hex_mac(token: &str) -> Option<String> {
    if token.len() == 12 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_string())
    } else {
        None
    }
}

/// Expand a `BedConfig`'s `name` plus its comma/space-separated `aliases`
/// into the full set of normalized identifier variants to match against.
pub fn expand_bed_identifiers(name: &str, aliases: &str) -> Vec<String> {
    let mut tokens: Vec<&str> = vec![name];
    tokens.extend(aliases.split(|c: char| c == ',' || c.is_whitespace()));

    let mut out = Vec::new();
    for token in tokens {
        if token.trim().is_empty() {
            continue;
        }
        for variant in identifier_variants(token) {
            if !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    out
}

fn mutual_prefix_or_suffix(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(b) || b.starts_with(a) || a.ends_with(b) || b.ends_with(a)
}

/// Does a configured `identifier` (a single raw token, pre-normalization)
/// match an advertisement with the given `adv_name` and `adv_mac_hex`
/// (12-hex, lowercase or not)?
///
/// Per §4.3: exact match on mac or lowercased name; 12-hex form of either;
/// either starts-with or ends-with the other; or the configured token is a
/// substring of the advertised name and is long enough (≥6 chars, ≥7 if it
/// begins with a leading "b").
pub fn matches_identifier(adv_name: &str, adv_mac_hex: &str, identifier: &str) -> bool {
    let adv_name_norm = normalize_identifier(adv_name);
    let adv_mac_norm = normalize_identifier(adv_mac_hex);

    for id in identifier_variants(identifier) {
        if id == adv_mac_norm || id == adv_name_norm {
            return true;
        }
        if mutual_prefix_or_suffix(&id, &adv_name_norm) || mutual_prefix_or_suffix(&id, &adv_mac_norm) {
            return true;
        }
        let min_len = if id.starts_with('b') { 7 } else { 6 };
        if id.len() >= min_len && adv_name_norm.contains(id.as_str()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_idempotent() {
        let samples = ["  Bed1-ABCDEF123456  ", "AA:BB:CC:DD:EE:FF", "already lower"];
        for s in samples {
            let once = normalize_identifier(s);
            let twice = normalize_identifier(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn exact_mac_match() {
        assert!(matches_identifier(
            "Some Bed",
            "aabbccddeeff",
            "AABBCCDDEEFF"
        ));
    }

    #[test]
    fn exact_name_match_case_insensitive() {
        assert!(matches_identifier("KEESON BED1", "000000000000", "keeson bed1"));
    }

    #[test]
    fn pure_hex_extracted_from_noisy_token() {
        // identifier has separators but is exactly 12 hex digits once stripped
        assert!(matches_identifier("noise", "aabbccddeeff", "AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn first_12_hex_substring_anywhere() {
        assert!(matches_identifier(
            "noise",
            "aabbccddeeff",
            "prefix-aabbccddeeff-suffix"
        ));
    }

    #[test]
    fn prefix_or_suffix_match() {
        assert!(matches_identifier("bed1-controller", "000000000000", "bed1"));
        assert!(matches_identifier("my-bed1", "000000000000", "bed1"));
    }

    #[test]
    fn substring_requires_minimum_length() {
        // "bed1" is only 4 chars, below the 6-char floor, should not match by substring alone
        assert!(!matches_identifier("xxbed1yy", "000000000000", "bed1"));
        // 6+ chars does match by substring
        assert!(matches_identifier("xxbedone1yy", "000000000000", "bedone1"));
    }

    #[test]
    fn leading_b_requires_seven_chars() {
        // "bedone" is 6 chars and starts with 'b' -> needs 7, should not match by substring
        assert!(!matches_identifier("xxbedoneyy", "000000000000", "bedone"));
        assert!(matches_identifier("xxbedone1yy", "000000000000", "bedone1"));
    }

    #[test]
    fn match_implies_match_on_normalized_identifier() {
        let samples = [
            ("Bed1-Controller", "000000000000", "BED1"),
            ("aabbccddeeff", "aabbccddeeff", "AA:BB:CC:DD:EE:FF"),
        ];
        for (name, mac, id) in samples {
            if matches_identifier(name, mac, id) {
                assert!(matches_identifier(name, mac, &normalize_identifier(id)));
            }
        }
    }

    #[test]
    fn expand_bed_identifiers_splits_aliases() {
        let variants = expand_bed_identifiers("Bed1", "alias-one, alias_two bed1-alt");
        assert!(variants.contains(&"bed1".to_string()));
        assert!(variants.contains(&"alias-one".to_string()));
        assert!(variants.contains(&"alias_two".to_string()));
        assert!(variants.contains(&"bed1-alt".to_string()));
    }
}
