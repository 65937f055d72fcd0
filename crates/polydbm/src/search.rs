//! Pattern search over keys and lines
//!
//! A [`Matcher`] is fed candidates one at a time and collects the hits.
//! Substring and regex modes keep hits in feed order up to the capacity.
//! Edit-distance modes keep the `capacity` nearest candidates and return
//! them by ascending distance, ties broken by byte order.

use polydbm_common::{Result, Status};
use regex::bytes::Regex;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

/// How a pattern is matched against a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchMode {
    /// Candidate contains the pattern
    Contain,
    /// Candidate starts with the pattern
    Begin,
    /// Candidate ends with the pattern
    End,
    /// Candidate has a partial match of the regular expression
    Regex,
    /// Nearest by Levenshtein distance over UTF-8 code points
    Edit,
    /// Nearest by Levenshtein distance over bytes
    EditBin,
}

impl SearchMode {
    pub fn name(self) -> &'static str {
        match self {
            SearchMode::Contain => "contain",
            SearchMode::Begin => "begin",
            SearchMode::End => "end",
            SearchMode::Regex => "regex",
            SearchMode::Edit => "edit",
            SearchMode::EditBin => "editbin",
        }
    }

    fn is_nearest(self) -> bool {
        matches!(self, SearchMode::Edit | SearchMode::EditBin)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SearchMode {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "contain" => Ok(SearchMode::Contain),
            "begin" => Ok(SearchMode::Begin),
            "end" => Ok(SearchMode::End),
            "regex" => Ok(SearchMode::Regex),
            "edit" => Ok(SearchMode::Edit),
            "editbin" => Ok(SearchMode::EditBin),
            _ => Err(Status::invalid_argument(format!("unknown search mode: {}", s))),
        }
    }
}

/// Levenshtein distance between two sequences
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, x) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(x != y);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }
    row[b.len()]
}

fn chars(data: &[u8]) -> Vec<char> {
    String::from_utf8_lossy(data).chars().collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Accumulates search hits
pub struct Matcher {
    mode: SearchMode,
    pattern: Vec<u8>,
    pattern_chars: Vec<char>,
    regex: Option<Regex>,
    capacity: usize,
    hits: Vec<Vec<u8>>,
    /// Max-heap of (distance, candidate) so the worst hit pops first
    nearest: BinaryHeap<(usize, Vec<u8>)>,
}

impl Matcher {
    /// `capacity` of 0 means unlimited
    pub fn new(mode: SearchMode, pattern: &[u8], capacity: usize) -> Result<Self> {
        let regex = match mode {
            SearchMode::Regex => {
                let text = std::str::from_utf8(pattern)
                    .map_err(|_| Status::invalid_argument("the regex pattern is not UTF-8"))?;
                let regex = Regex::new(text)
                    .map_err(|e| Status::invalid_argument(format!("invalid regex: {}", e)))?;
                Some(regex)
            }
            _ => None,
        };
        Ok(Self {
            mode,
            pattern: pattern.to_vec(),
            pattern_chars: chars(pattern),
            regex,
            capacity,
            hits: Vec::new(),
            nearest: BinaryHeap::new(),
        })
    }

    /// True once more candidates cannot change the result
    pub fn is_full(&self) -> bool {
        !self.mode.is_nearest() && self.capacity > 0 && self.hits.len() >= self.capacity
    }

    fn matches(&self, candidate: &[u8]) -> bool {
        match self.mode {
            SearchMode::Contain => contains(candidate, &self.pattern),
            SearchMode::Begin => candidate.starts_with(&self.pattern),
            SearchMode::End => candidate.ends_with(&self.pattern),
            SearchMode::Regex => self.regex.as_ref().is_some_and(|r| r.is_match(candidate)),
            SearchMode::Edit | SearchMode::EditBin => false,
        }
    }

    /// Offer one candidate
    pub fn feed(&mut self, candidate: &[u8]) {
        match self.mode {
            SearchMode::Edit => {
                let distance = edit_distance(chars(candidate).as_slice(), self.pattern_chars.as_slice());
                self.offer_nearest(distance, candidate);
            }
            SearchMode::EditBin => {
                let distance = edit_distance(candidate, self.pattern.as_slice());
                self.offer_nearest(distance, candidate);
            }
            _ => {
                if !self.is_full() && self.matches(candidate) {
                    self.hits.push(candidate.to_vec());
                }
            }
        }
    }

    fn offer_nearest(&mut self, distance: usize, candidate: &[u8]) {
        if self.capacity > 0 && self.nearest.len() >= self.capacity {
            let closer = match self.nearest.peek() {
                Some((worst, key)) => (distance, candidate) < (*worst, key.as_slice()),
                None => true,
            };
            if !closer {
                return;
            }
            self.nearest.pop();
        }
        self.nearest.push((distance, candidate.to_vec()));
    }

    /// Hits in result order
    pub fn finish(self) -> Vec<Vec<u8>> {
        if self.mode.is_nearest() {
            self.nearest
                .into_sorted_vec()
                .into_iter()
                .map(|(_, candidate)| candidate)
                .collect()
        } else {
            self.hits
        }
    }
}

/// Search LF-delimited lines of a text
pub fn search_lines(
    text: &[u8],
    mode: SearchMode,
    pattern: &[u8],
    capacity: usize,
) -> Result<Vec<Vec<u8>>> {
    let mut matcher = Matcher::new(mode, pattern, capacity)?;
    let body = text.strip_suffix(b"\n").unwrap_or(text);
    if !text.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            if matcher.is_full() {
                break;
            }
            matcher.feed(line);
        }
    }
    Ok(matcher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mode: SearchMode, pattern: &str, capacity: usize, keys: &[&str]) -> Vec<String> {
        let mut matcher = Matcher::new(mode, pattern.as_bytes(), capacity).unwrap();
        for key in keys {
            matcher.feed(key.as_bytes());
        }
        matcher
            .finish()
            .into_iter()
            .map(|k| String::from_utf8(k).unwrap())
            .collect()
    }

    #[test]
    fn test_substring_modes() {
        let keys = ["apple", "pineapple", "apricot", "grape"];
        assert_eq!(run(SearchMode::Contain, "ap", 0, &keys), vec!["apple", "pineapple", "apricot", "grape"]);
        assert_eq!(run(SearchMode::Begin, "ap", 0, &keys), vec!["apple", "apricot"]);
        assert_eq!(run(SearchMode::End, "ple", 1, &keys), vec!["apple"]);
    }

    #[test]
    fn test_regex_mode() {
        let keys = ["user:1", "user:22", "group:3"];
        assert_eq!(run(SearchMode::Regex, r"^user:\d{2}$", 0, &keys), vec!["user:22"]);
        assert_eq!(run(SearchMode::Regex, "oup", 0, &keys), vec!["group:3"]);
        assert!(Matcher::new(SearchMode::Regex, b"(", 0).is_err());
    }

    #[test]
    fn test_edit_nearest() {
        let keys = ["kitten", "sitting", "mitten", "bitten", "smitten"];
        assert_eq!(run(SearchMode::Edit, "kitten", 3, &keys), vec!["kitten", "bitten", "mitten"]);
    }

    #[test]
    fn test_edit_counts_code_points() {
        // "日本" vs "日米": one substituted code point, three differing bytes
        let keys = ["日米", "abcd"];
        assert_eq!(run(SearchMode::Edit, "日本", 1, &keys), vec!["日米"]);
        assert_eq!(edit_distance(chars("日米".as_bytes()).as_slice(), chars("日本".as_bytes()).as_slice()), 1);
        assert_eq!(edit_distance("日米".as_bytes(), "日本".as_bytes()), 3);
        assert_eq!(run(SearchMode::EditBin, "日本", 1, &keys), vec!["日米"]);
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(&b""[..], &b"abc"[..]), 3);
        assert_eq!(edit_distance(&b"kitten"[..], &b"sitting"[..]), 3);
        assert_eq!(edit_distance(&b"same"[..], &b"same"[..]), 0);
    }

    #[test]
    fn test_search_lines() {
        let text = b"alpha\nbeta\nalphabet\ngamma";
        let lines = search_lines(text, SearchMode::Begin, b"alpha", 0).unwrap();
        assert_eq!(lines, vec![b"alpha".to_vec(), b"alphabet".to_vec()]);
        let lines = search_lines(b"one\ntwo\n", SearchMode::Contain, b"", 0).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(search_lines(b"", SearchMode::Contain, b"", 0).unwrap().is_empty());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("EditBin".parse::<SearchMode>().unwrap(), SearchMode::EditBin);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
