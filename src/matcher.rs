/*
Copyright 2021 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The match engine the search driver runs over a file body.
//!
//! `LineMatcher` walks a byte haystack with the primary regex and keeps
//! incremental line number and line boundary state. `CnfMatcher` holds
//! the compiled CNF sub-matchers and evaluates AND-terms per candidate
//! line, or accumulates per-file satisfaction bitmaps in files mode.
//! The engine is not shared: every worker compiles its own instance.

use memchr::{memchr, memchr_iter, memrchr};
use regex::bytes::{Regex, RegexBuilder};

use crate::query::Cnf;
use crate::Error;

/// Options applied to every compiled pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    pub ignore_case: bool,
    pub dotall: bool,
    /// -U: no Unicode classes, plain byte semantics.
    pub ascii: bool,
}

/// Compile one pattern with the shared options. `^` and `$` anchor at
/// line boundaries.
pub fn compile(pattern: &str, opts: &MatchOptions) -> Result<Regex, Error> {
    Ok(RegexBuilder::new(pattern)
        .case_insensitive(opts.ignore_case)
        .multi_line(true)
        .dot_matches_new_line(opts.dotall)
        .unicode(!opts.ascii)
        .build()?)
}

/// One match span in the haystack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Drives the primary regex over an in-memory file body and answers the
/// line-oriented questions the driver asks: where does the matching
/// line begin and end, what line number is this, how many lines does
/// the match span.
pub struct LineMatcher<'h> {
    re: &'h Regex,
    hay: &'h [u8],
    pos: usize,
    // incremental line accounting: hay[..line_off] contains line_no - 1 newlines
    line_off: usize,
    line_no: u64,
}

impl<'h> LineMatcher<'h> {
    pub fn new(re: &'h Regex, hay: &'h [u8]) -> LineMatcher<'h> {
        LineMatcher {
            re,
            hay,
            pos: 0,
            line_off: 0,
            line_no: 1,
        }
    }

    pub fn haystack(&self) -> &'h [u8] {
        self.hay
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Advance to the next match at or after the current position.
    pub fn find(&mut self) -> Option<Span> {
        if self.pos > self.hay.len() {
            return None;
        }
        let m = self.re.find_at(self.hay, self.pos)?;
        let span = Span {
            start: m.start(),
            end: m.end(),
        };
        // never stall on an empty match
        self.pos = if m.end() > m.start() { m.end() } else { m.end() + 1 };
        Some(span)
    }

    /// Fast-forward so the next find starts at `pos`.
    pub fn skip_to(&mut self, pos: usize) {
        if pos > self.pos {
            self.pos = pos;
        }
    }

    /// Beginning of the line containing `off`.
    pub fn bol(&self, off: usize) -> usize {
        memrchr(b'\n', &self.hay[..off.min(self.hay.len())]).map_or(0, |i| i + 1)
    }

    /// End of the line containing `off`, excluding the newline.
    pub fn eol(&self, off: usize) -> usize {
        let off = off.min(self.hay.len());
        memchr(b'\n', &self.hay[off..]).map_or(self.hay.len(), |i| off + i)
    }

    /// End of the line containing `off`, including the newline if present.
    pub fn eol_nl(&self, off: usize) -> usize {
        let eol = self.eol(off);
        if eol < self.hay.len() {
            eol + 1
        } else {
            eol
        }
    }

    /// 1-based line number of `off`, maintained incrementally while the
    /// driver advances; positions before the last query recount from the
    /// start.
    pub fn lineno(&mut self, off: usize) -> u64 {
        let off = off.min(self.hay.len());
        if off < self.line_off {
            self.line_off = 0;
            self.line_no = 1;
        }
        self.line_no += memchr_iter(b'\n', &self.hay[self.line_off..off]).count() as u64;
        self.line_off = off;
        self.line_no
    }

    /// Number of lines a match spans.
    pub fn lines(&self, span: Span) -> u64 {
        memchr_iter(b'\n', &self.hay[span.start..span.end]).count() as u64 + 1
    }

    /// Bytes on the matching line before the match starts.
    pub fn border(&self, span: Span) -> usize {
        span.start - self.bol(span.start)
    }
}

/// One compiled AND-term: an optional positive alternation followed by
/// negated sub-matchers.
pub struct CnfTerm {
    pub head: Option<Regex>,
    pub nots: Vec<Regex>,
}

/// The compiled CNF, cloned per worker (compiled from the plan's term
/// strings; the regex engine state is never shared across threads).
pub struct CnfMatcher {
    pub terms: Vec<CnfTerm>,
}

impl CnfMatcher {
    /// Compile the CNF sub-matchers. Returns None when the primary
    /// matcher alone decides (a singleton or undefined CNF).
    pub fn compile(cnf: &Cnf, opts: &MatchOptions) -> Result<Option<CnfMatcher>, Error> {
        if cnf.singleton_or_undefined() {
            return Ok(None);
        }

        let mut terms = Vec::with_capacity(cnf.lists().len());

        for term in cnf.lists() {
            let head = match term.first() {
                Some(Some(p)) => Some(compile(p, opts)?),
                _ => None,
            };
            let mut nots = Vec::new();
            for p in term.iter().skip(1).flatten() {
                nots.push(compile(p, opts)?);
            }
            terms.push(CnfTerm { head, nots });
        }

        Ok(Some(CnfMatcher { terms }))
    }

    /// Evaluate all AND-terms against one candidate line. A term holds
    /// when its positive alternation matches the line or any of its
    /// negated patterns fails to match it.
    pub fn line_matches(&self, line: &[u8]) -> bool {
        self.terms.iter().all(|term| {
            if let Some(head) = &term.head {
                if head.is_match(line) {
                    return true;
                }
            }
            term.nots.iter().any(|n| !n.is_match(line))
        })
    }

    pub fn file_state(&self) -> CnfFileState {
        CnfFileState {
            pos_seen: vec![false; self.terms.len()],
            not_seen: self.terms.iter().map(|t| vec![false; t.nots.len()]).collect(),
        }
    }
}

/// Per-file satisfaction bitmaps for files mode: which positive heads
/// matched anywhere, and which NOT patterns matched anywhere.
pub struct CnfFileState {
    pos_seen: Vec<bool>,
    not_seen: Vec<Vec<bool>>,
}

impl CnfFileState {
    /// Record one line's contribution.
    pub fn update(&mut self, cnf: &CnfMatcher, line: &[u8]) {
        for (i, term) in cnf.terms.iter().enumerate() {
            if !self.pos_seen[i] {
                if let Some(head) = &term.head {
                    if head.is_match(line) {
                        self.pos_seen[i] = true;
                    }
                }
            }
            for (j, n) in term.nots.iter().enumerate() {
                if !self.not_seen[i][j] && n.is_match(line) {
                    self.not_seen[i][j] = true;
                }
            }
        }
    }

    /// The file passes when every term saw a positive hit somewhere, or
    /// kept at least one of its NOT patterns unmatched.
    pub fn passes(&self, cnf: &CnfMatcher) -> bool {
        cnf.terms.iter().enumerate().all(|(i, term)| {
            if self.pos_seen[i] {
                return true;
            }
            if !term.nots.is_empty() {
                return self.not_seen[i].iter().any(|seen| !seen);
            }
            // an empty or undefined-positive term without NOTs
            term.head.is_none()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PatternFlags;

    fn cnf_of(query: &str) -> CnfMatcher {
        let mut cnf = Cnf::new(PatternFlags {
            bool_query: true,
            ..Default::default()
        });
        cnf.compile(query);
        cnf.prune();
        CnfMatcher::compile(&cnf, &MatchOptions::default())
            .unwrap()
            .expect("query should not be a singleton")
    }

    #[test]
    fn find_iterates_in_order() {
        let re = compile("o+", &MatchOptions::default()).unwrap();
        let hay = b"foo boo\no";
        let mut m = LineMatcher::new(&re, hay);
        let spans: Vec<Span> = std::iter::from_fn(|| m.find()).collect();
        assert_eq!(
            spans,
            vec![
                Span { start: 1, end: 3 },
                Span { start: 5, end: 7 },
                Span { start: 8, end: 9 }
            ]
        );
    }

    #[test]
    fn line_accounting() {
        let re = compile("x", &MatchOptions::default()).unwrap();
        let hay = b"a\nbb\nccc\nx\n";
        let mut m = LineMatcher::new(&re, hay);
        let span = m.find().unwrap();
        assert_eq!(m.lineno(span.start), 4);
        assert_eq!(m.bol(span.start), 9);
        assert_eq!(m.eol(span.start), 10);
        assert_eq!(m.eol_nl(span.start), 11);
        assert_eq!(m.border(span), 0);
    }

    #[test]
    fn multiline_span() {
        let opts = MatchOptions {
            dotall: true,
            ..Default::default()
        };
        let re = compile("a.*c", &opts).unwrap();
        let hay = b"a\nb\nc\n";
        let mut m = LineMatcher::new(&re, hay);
        let span = m.find().unwrap();
        assert_eq!(m.lines(span), 3);
    }

    #[test]
    fn empty_match_does_not_stall() {
        let re = compile("x*", &MatchOptions::default()).unwrap();
        let hay = b"ab";
        let mut m = LineMatcher::new(&re, hay);
        let mut n = 0;
        while m.find().is_some() {
            n += 1;
            assert!(n < 10);
        }
    }

    #[test]
    fn cnf_and_lines() {
        let cnf = cnf_of("foo bar");
        assert!(cnf.line_matches(b"foo bar baz"));
        assert!(!cnf.line_matches(b"foo baz"));
    }

    #[test]
    fn cnf_not_lines() {
        let cnf = cnf_of("foo -bar");
        assert!(cnf.line_matches(b"foo baz"));
        assert!(!cnf.line_matches(b"foo bar"));
        assert!(!cnf.line_matches(b"baz"));
    }

    #[test]
    fn cnf_or_not_disjunct() {
        // term (foo OR -bar): a line without bar passes even without foo
        let cnf = cnf_of("foo|-bar");
        assert!(cnf.line_matches(b"plain"));
        assert!(cnf.line_matches(b"foo bar"));
        assert!(!cnf.line_matches(b"bar"));
    }

    #[test]
    fn cnf_files_mode() {
        let cnf = cnf_of("foo -bar");
        let mut state = cnf.file_state();
        state.update(&cnf, b"foo");
        state.update(&cnf, b"baz");
        assert!(state.passes(&cnf));

        let mut state = cnf.file_state();
        state.update(&cnf, b"foo");
        state.update(&cnf, b"bar");
        assert!(!state.passes(&cnf));

        let mut state = cnf.file_state();
        state.update(&cnf, b"baz");
        assert!(!state.passes(&cnf));
    }
}
