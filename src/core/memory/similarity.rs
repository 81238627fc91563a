// =============================================================================
// SIMILARITY MATCHER
// =============================================================================
//
// Approximate text similarity used by both the training store and the named
// knowledge collections. The score is a matching-blocks ratio:
//
//     score = 2 * M / (|a| + |b|)
//
// where M is the total length of the contiguous blocks found by repeatedly
// taking the longest common substring and recursing on the pieces to its left
// and right. Both inputs are case-folded first and lengths are counted in
// characters, not bytes.

use std::collections::HashMap;

/// Returns a similarity score in `[0.0, 1.0]` for two strings.
///
/// - `similarity("", "") == 1.0`
/// - `similarity("", "x") == 0.0`
/// - `similarity(a, a) == 1.0`
/// - symmetric: `similarity(a, b) == similarity(b, a)`
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    // Tie-breaking between equal-length blocks depends on argument order, so
    // fix an order to keep the score symmetric.
    let (a, b) = if a <= b { (a, b) } else { (b, a) };

    let matched = matching_characters(&a, &b);
    (2.0 * matched as f64) / total as f64
}

/// A contiguous run shared by both sequences: `a[a_start..a_start + len]`
/// equals `b[b_start..b_start + len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    a_start: usize,
    b_start: usize,
    len: usize,
}

/// Total length of all matching blocks between `a` and `b`.
fn matching_characters(a: &[char], b: &[char]) -> usize {
    // Positions of every character in `b`, ascending.
    let mut b_index: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, ch) in b.iter().enumerate() {
        b_index.entry(*ch).or_default().push(j);
    }

    let mut matched = 0;
    // Explicit stack instead of recursion so very long inputs can't overflow.
    let mut pending = vec![(0, a.len(), 0, b.len())];

    while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
        let block = longest_match(a, &b_index, a_lo, a_hi, b_lo, b_hi);
        if block.len == 0 {
            continue;
        }

        matched += block.len;

        if a_lo < block.a_start && b_lo < block.b_start {
            pending.push((a_lo, block.a_start, b_lo, block.b_start));
        }
        let a_end = block.a_start + block.len;
        let b_end = block.b_start + block.len;
        if a_end < a_hi && b_end < b_hi {
            pending.push((a_end, a_hi, b_end, b_hi));
        }
    }

    matched
}

/// Longest common substring of `a[a_lo..a_hi]` and `b[b_lo..b_hi]`.
///
/// Among equally long candidates the one starting earliest in `a` wins, and
/// then the one starting earliest in `b`.
fn longest_match(
    a: &[char],
    b_index: &HashMap<char, Vec<usize>>,
    a_lo: usize,
    a_hi: usize,
    b_lo: usize,
    b_hi: usize,
) -> Block {
    let mut best = Block {
        a_start: a_lo,
        b_start: b_lo,
        len: 0,
    };

    // run_len[j] = length of the match ending at a[i - 1] and b[j]
    let mut run_len: HashMap<usize, usize> = HashMap::new();

    for (i, ch) in a.iter().enumerate().take(a_hi).skip(a_lo) {
        let mut next_run_len: HashMap<usize, usize> = HashMap::new();

        if let Some(positions) = b_index.get(ch) {
            for &j in positions {
                if j < b_lo {
                    continue;
                }
                if j >= b_hi {
                    break;
                }

                let len = j
                    .checked_sub(1)
                    .and_then(|prev| run_len.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                next_run_len.insert(j, len);

                if len > best.len {
                    best = Block {
                        a_start: i + 1 - len,
                        b_start: j + 1 - len,
                        len,
                    };
                }
            }
        }

        run_len = next_run_len;
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_strings() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("", "hello"), 0.0);
        assert_eq!(similarity("hello", ""), 0.0);
    }

    #[test]
    fn identical_strings_score_one() {
        for s in ["a", "How do I reset my password?", "ünïcödé text", "aaaa"] {
            assert_eq!(similarity(s, s), 1.0, "{s}");
        }
    }

    #[test]
    fn case_is_ignored() {
        assert_eq!(similarity("HELLO World", "hello world"), 1.0);
    }

    #[test]
    fn matches_reference_ratios() {
        // Values produced by the classic matching-blocks algorithm.
        assert!(close(similarity("abcd", "bcde"), 0.75));
        assert!(close(similarity("abc", "xyz"), 0.0));
        assert!(close(similarity("qabxcd", "abycdf"), 2.0 * 4.0 / 12.0));
    }

    #[test]
    fn is_symmetric() {
        let pairs = [
            ("abab", "baba"),
            ("what are your hours", "hours of operation"),
            ("tide", "diet"),
            ("refund policy", "policy on refunds"),
        ];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a), "{a} / {b}");
        }
    }

    #[test]
    fn punctuation_difference_stays_high() {
        let score = similarity("How do I reset my password?", "how do i reset my password");
        assert!(score >= 0.7, "score was {score}");
        assert!(score < 1.0);
    }

    #[test]
    fn longer_shared_run_scores_higher() {
        let base = "billing question";
        let near = similarity(base, "billing questions");
        let far = similarity(base, "bill");
        assert!(near > far);
    }

    #[test]
    fn score_is_bounded() {
        let score = similarity("the quick brown fox", "jumps over the lazy dog");
        assert!((0.0..=1.0).contains(&score));
    }
}
