use std::collections::HashSet;

/// Lowercase, strip punctuation to spaces, collapse runs of whitespace.
pub fn normalize_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.chars() {
        let c = if c.is_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            ' '
        };
        if c == ' ' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Character bigrams of a normalized string.
pub fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Bigram Jaccard similarity on the lowercased, punctuation-stripped strings.
/// Both empty → 1.0; exactly one empty → 0.0.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_title(a);
    let nb = normalize_title(b);
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let ba = bigrams(&na);
    let bb = bigrams(&nb);
    jaccard(&ba, &bb)
}

/// Jaccard index over precomputed bigram sets (consolidation avoids O(N²)
/// re-tokenization by computing the sets once).
pub fn jaccard(a: &HashSet<(char, char)>, b: &HashSet<(char, char)>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// Turn a ticket title into a branch-safe slug, capped at 40 chars.
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= 40 {
            break;
        }
    }
    out.trim_matches('-').to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_title("Fix: the  Thing!"), "fix the thing");
    }

    #[test]
    fn similarity_identity_is_one() {
        let s = "Refactor session loader";
        assert!((title_similarity(s, s) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = "Add retry logic to fetcher";
        let b = "Add retry logic to the fetch layer";
        let ab = title_similarity(a, b);
        let ba = title_similarity(b, a);
        assert!((ab - ba).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&ab));
    }

    #[test]
    fn similarity_empty_edge_cases() {
        assert!((title_similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert_eq!(title_similarity("", "something"), 0.0);
        assert_eq!(title_similarity("something", ""), 0.0);
    }

    #[test]
    fn unrelated_titles_score_low() {
        let s = title_similarity("Rewrite auth middleware", "Document metrics sink");
        assert!(s < 0.3, "got {s}");
    }

    #[test]
    fn slugify_caps_and_cleans() {
        assert_eq!(slugify("Fix: the Thing"), "fix-the-thing");
        let long = slugify(
            "An extremely long ticket title that keeps going well past forty characters",
        );
        assert!(long.len() <= 40);
        assert!(!long.ends_with('-'));
    }
}
