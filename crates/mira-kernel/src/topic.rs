// Hierarchical topic matching: `.` separates levels, `*` matches exactly one
// level and `#` matches zero or more.
use smallvec::SmallVec;

pub const LEVEL_SEPARATOR: char = '.';
pub const SINGLE_LEVEL_WILDCARD: &str = "*";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

type Levels<'a> = SmallVec<[&'a str; 8]>;

/// Does a subscription `pattern` match a published `routing_key`?
///
/// ```
/// use mira_kernel::topic::matches;
///
/// assert!(matches("sports.*", "sports.cricket"));
/// assert!(matches("sports.#", "sports.cricket.scores"));
/// assert!(!matches("sports.*", "sports.cricket.scores"));
/// ```
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == routing_key {
        return true;
    }
    let pattern: Levels<'_> = pattern.split(LEVEL_SEPARATOR).collect();
    let key: Levels<'_> = routing_key.split(LEVEL_SEPARATOR).collect();
    matches_levels(&pattern, &key)
}

// Single backtrack point: on mismatch, resume after the last `#` with it
// absorbing one more key level. Bounded by pattern levels times key levels.
fn matches_levels(pattern: &[&str], key: &[&str]) -> bool {
    let (mut p_idx, mut k_idx) = (0usize, 0usize);
    let (mut hash_idx, mut resume_idx) = (None, 0usize);

    while k_idx < key.len() {
        if p_idx < pattern.len() && pattern[p_idx] == MULTI_LEVEL_WILDCARD {
            hash_idx = Some(p_idx);
            resume_idx = k_idx;
            p_idx += 1;
            continue;
        }

        if p_idx < pattern.len()
            && (pattern[p_idx] == SINGLE_LEVEL_WILDCARD || pattern[p_idx] == key[k_idx])
        {
            p_idx += 1;
            k_idx += 1;
            continue;
        }

        if let Some(hash) = hash_idx {
            p_idx = hash + 1;
            resume_idx += 1;
            k_idx = resume_idx;
            continue;
        }

        return false;
    }

    while p_idx < pattern.len() && pattern[p_idx] == MULTI_LEVEL_WILDCARD {
        p_idx += 1;
    }

    p_idx == pattern.len()
}
