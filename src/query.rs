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

//! Boolean search query compiler.
//!
//! Queries use spacing for AND, `|` or `OR` for alternation and `-` or
//! `NOT` for negation, with parentheses for grouping and double quotes
//! for literal strings. The parser builds an operator tree, normalizes
//! it to conjunctive normal form and flattens it into an AND-list of
//! OR-term lists that the per-line and per-file checkers evaluate.

/// A pattern slot in a term: `None` is undefined, `Some("")` matches anything.
pub type Pattern = Option<String>;

/// One OR clause of the CNF: the first slot is the positive alternation
/// (or undefined), every following slot is a negated pattern.
pub type Term = Vec<Pattern>;

/// Pattern syntax options that shape CNF construction.
#[derive(Debug, Default, Clone)]
pub struct PatternFlags {
    /// -F: patterns are literal strings.
    pub fixed_strings: bool,
    /// -x: patterns match whole lines.
    pub line_regexp: bool,
    /// -w: patterns match whole words.
    pub word_regexp: bool,
    /// --bool: patterns are Boolean queries.
    pub bool_query: bool,
    /// -f FILE pattern feed is active; keeps the first term during prune.
    pub from_file: bool,
}

/// A Boolean query normalized to conjunctive normal form: an AND-list of
/// OR-term lists of (NOT-)patterns.
#[derive(Debug, Default)]
pub struct Cnf {
    terms: Vec<Term>,
    pub flags: PatternFlags,
    /// Set when an anchored pattern may match the empty string (-Y).
    pub match_empty: bool,
}

impl Cnf {
    pub fn new(flags: PatternFlags) -> Cnf {
        Cnf {
            terms: Vec::new(),
            flags,
            match_empty: false,
        }
    }

    /// True if any pattern was added.
    pub fn defined(&self) -> bool {
        !self.terms.is_empty()
    }

    /// True if the CNF only holds one empty pattern after prune().
    pub fn empty(&self) -> bool {
        self.terms.is_empty() || (self.terms.len() == 1 && self.terms[0].is_empty())
    }

    /// True if undefined or a single positive pattern without NOT patterns,
    /// i.e. the primary matcher alone decides and no CNF evaluation is needed.
    pub fn singleton_or_undefined(&self) -> bool {
        self.terms.is_empty()
            || (self.terms.len() == 1 && self.terms[0].len() == 1 && self.terms[0][0].is_some())
    }

    /// True if the first OR-list term is an empty pattern.
    pub fn first_empty(&self) -> bool {
        self.terms
            .first()
            .and_then(|t| t.first())
            .map_or(false, |p| p.as_deref() == Some(""))
    }

    pub fn lists(&self) -> &[Term] {
        &self.terms
    }

    /// Open a new OR-list term in the AND-list.
    pub fn new_term(&mut self) {
        if self.terms.is_empty() {
            self.terms.push(Term::new());
        }
        self.terms.push(Term::new());
    }

    /// Add an OR pattern or OR-NOT pattern to the current term. In Boolean
    /// query mode the pattern is compiled as a subquery instead.
    pub fn new_pattern(&mut self, not: bool, pattern: &str) {
        if self.terms.is_empty() {
            self.terms.push(Term::new());
        }

        if self.flags.bool_query {
            if not {
                let mut not_pattern = String::from("-(");
                not_pattern.push_str(pattern);
                not_pattern.push(')');
                self.compile(&not_pattern);
            } else {
                self.compile(pattern);
            }
            return;
        }

        let mut spattern = pattern.to_string();

        if self.flags.fixed_strings {
            spattern = quote(&spattern);
        }

        anchor(&mut spattern, &self.flags, &mut self.match_empty);

        let term = self.terms.last_mut().unwrap();

        if not {
            if !spattern.is_empty() {
                if term.is_empty() {
                    term.push(None);
                } else if term[0].as_deref() == Some("") {
                    // an empty positive pattern matches anything
                    return;
                }
                term.push(Some(spattern));
            }
        } else {
            add_positive(term, spattern);
        }
    }

    /// Compile a Boolean query into an operator tree, normalize to CNF and
    /// append the result to the AND-list.
    pub fn compile(&mut self, pattern: &str) {
        if self.terms.is_empty() {
            self.terms.push(Term::new());
        }
        let mut tree = OpTree::new(Op::And);
        let mut cur = Cursor::new(pattern);
        tree.parse(&mut cur, &self.flags, &mut self.match_empty);
        tree.normalize(false);
        tree.convert(&mut self.terms);
    }

    /// Prune empty OR terms and OR terms with empty patterns that match
    /// anything. With -x empty patterns match empty lines, so nothing is
    /// pruned.
    pub fn prune(&mut self) {
        if self.flags.line_regexp {
            return;
        }

        let keep_first = self.flags.from_file;
        let mut first = true;

        self.terms.retain(|term| {
            let useless = term.is_empty()
                || (term.len() == 1 && term[0].as_deref().map_or(true, |p| p.is_empty()));
            let keep = !useless || (first && keep_first);
            first = false;
            keep
        });
    }

    /// Split patterns at embedded newlines, making a pattern file with one
    /// pattern per line behave as "any of these lines". Boolean queries use
    /// spacing as AND and are left alone.
    pub fn split(&mut self) {
        if self.flags.bool_query {
            return;
        }

        for term in &mut self.terms {
            for pattern in term.iter_mut().flatten() {
                if pattern.contains(['\n', '\r']) {
                    let parts: Vec<&str> = pattern
                        .split(['\n', '\r'])
                        .filter(|s| !s.is_empty())
                        .collect();
                    *pattern = parts.join("|");
                }
            }
        }
    }

    /// Join OR terms into the single pattern the primary matcher compiles.
    /// In files mode all OR and OR-NOT patterns participate; in lines mode
    /// the NOT patterns are left out, and nothing is joined when every term
    /// is NOT-paired (the per-line checker alone decides then).
    pub fn adjoin(&self, files: bool) -> String {
        let mut adjoined = String::new();

        if files {
            for term in &self.terms {
                for pattern in term.iter().flatten() {
                    if !pattern.is_empty() {
                        if !adjoined.is_empty() {
                            adjoined.push('|');
                        }
                        adjoined.push_str(pattern);
                    }
                }
            }
        } else {
            let allnot = !self.terms.is_empty() && self.terms.iter().all(|t| t.len() > 1);

            if !allnot {
                for term in &self.terms {
                    if let Some(Some(head)) = term.first() {
                        if !head.is_empty() {
                            if !adjoined.is_empty() {
                                adjoined.push('|');
                            }
                            adjoined.push_str(head);
                        }
                    }
                }
            }
        }

        adjoined
    }

    /// The first OR term's positive pattern, used to seed index lookups.
    pub fn first(&self) -> &str {
        match self.terms.first().and_then(|t| t.first()) {
            Some(Some(p)) => p,
            _ => "",
        }
    }

    /// Render the CNF in readable form for --stats.
    pub fn report(&self, files: bool, invert: bool) -> String {
        let mut s = String::new();
        s.push_str(if files {
            "Files matched if:\n  "
        } else {
            "Lines matched if:\n  "
        });

        let mut and_sep = false;
        for term in &self.terms {
            if and_sep {
                s.push_str(", and\n  ");
            }
            let mut or_sep = false;
            for (i, pattern) in term.iter().enumerate() {
                if let Some(p) = pattern {
                    if or_sep {
                        s.push_str(" or ");
                    }
                    if p.is_empty() {
                        s.push_str("anything");
                    } else {
                        s.push('"');
                        s.push_str(p);
                        s.push('"');
                    }
                    if i > 0 || invert {
                        s.push_str(" does not match");
                    } else {
                        s.push_str(" matches");
                    }
                    if files {
                        s.push_str(" a line");
                    }
                    or_sep = true;
                    and_sep = true;
                }
            }
        }
        s.push('\n');
        s
    }
}

/// Append a positive pattern to a term's head slot, collapsing the
/// "empty pattern matches anything" cases.
fn add_positive(term: &mut Term, pattern: String) {
    if term.is_empty() {
        term.push(Some(pattern));
    } else if term[0].is_none() {
        term[0] = Some(pattern);
    } else if term[0].as_deref() == Some("") {
        // anything matches already
    } else if pattern.is_empty() {
        term[0] = Some(String::new());
    } else {
        let head = term[0].as_mut().unwrap();
        head.push('|');
        head.push_str(&pattern);
    }

    if term[0].as_deref() == Some("") {
        term.truncate(1);
    }
}

/// Quote a pattern into a literal regex.
pub fn quote(pattern: &str) -> String {
    regex::escape(pattern)
}

/// Anchor a pattern per -w or -x. Patterns that already start with ^ or
/// end with $ count as anchored and enable empty matching.
pub fn anchor(pattern: &mut String, flags: &PatternFlags, match_empty: &mut bool) {
    if !pattern.is_empty() && (pattern.starts_with('^') || pattern.ends_with('$')) {
        if !flags.line_regexp && flags.word_regexp && !pattern.starts_with('^') {
            pattern.insert_str(0, "\\b(");
            pattern.push_str(")\\b");
        }
        *match_empty = true;
    } else if flags.line_regexp {
        if pattern.is_empty() {
            pattern.push_str("^$");
        } else {
            pattern.insert_str(0, "^(");
            pattern.push_str(")$");
        }
    } else if flags.word_regexp && !pattern.is_empty() {
        pattern.insert_str(0, "\\b(");
        pattern.push_str(")\\b");
    }
}

/// Translate a POSIX basic regular expression (-G) to the extended form
/// the regex crate understands: `\(` `\)` `\{` `\}` `\|` `\+` `\?` become
/// operators and the bare characters become literals.
pub fn bre_to_ere(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(m @ ('(' | ')' | '{' | '}' | '|' | '+' | '?')) => out.push(m),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            '(' | ')' | '{' | '}' | '|' | '+' | '?' => {
                out.push('\\');
                out.push(c);
            }
            '[' => {
                // bracket expressions are shared syntax, copy verbatim
                out.push('[');
                if let Some(&'^') = chars.peek() {
                    out.push(chars.next().unwrap());
                }
                if let Some(&']') = chars.peek() {
                    out.push(chars.next().unwrap());
                }
                for cc in chars.by_ref() {
                    out.push(cc);
                    if cc == ']' {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Leaf,
    And,
    Or,
    Not,
}

/// Operator tree built by the recursive descent parser. A node is either
/// a leaf with a regex pattern or an AND, OR, NOT operation over operands.
#[derive(Debug, Clone)]
struct OpTree {
    op: Op,
    regex: String,
    list: Vec<OpTree>,
}

impl OpTree {
    fn new(op: Op) -> OpTree {
        OpTree {
            op,
            regex: String::new(),
            list: Vec::new(),
        }
    }

    /// <parse> -> <parse1> until end of input; a dangling ')' is skipped,
    /// tolerating mismatched parentheses by closing at end of input.
    fn parse(&mut self, cur: &mut Cursor, flags: &PatternFlags, empty: &mut bool) {
        loop {
            self.parse1(cur, flags, empty);
            if cur.at_end() {
                break;
            }
            cur.bump();
        }
    }

    /// <parse1> -> <parse2> { <space>+ [ 'AND' <space>+ ] <parse2> }*
    fn parse1(&mut self, cur: &mut Cursor, flags: &PatternFlags, empty: &mut bool) {
        cur.skip_space();

        if cur.at_end() && flags.line_regexp {
            let mut leaf = OpTree::new(Op::Leaf);
            leaf.regex.push_str("^$");
            let mut or = OpTree::new(Op::Or);
            or.list.push(leaf);
            self.list.push(or);
            return;
        }

        while !cur.at_end() {
            let mut or = OpTree::new(Op::Or);
            or.parse2(cur, flags, empty);
            self.list.push(or);

            cur.skip_space();

            if cur.peek() == b')' {
                break;
            }

            if cur.take_oper("AND") {
                cur.skip_space();
            }
        }
    }

    /// <parse2> -> <parse3> { [ '|'+ | 'OR' <space>+ ] <parse3> }*
    fn parse2(&mut self, cur: &mut Cursor, flags: &PatternFlags, empty: &mut bool) {
        loop {
            let mut operand = OpTree::new(Op::Leaf);
            operand.parse3(cur, flags, empty);
            self.list.push(operand);
            if !cur.take_alternation() {
                break;
            }
        }
    }

    /// <parse3> -> [ '-' <space>* | 'NOT' <space>+ ] <parse4>
    /// <parse4> -> '(' <parse1> ')' | <raw-pattern>
    ///
    /// A parenthesized group only counts as Boolean grouping when the
    /// matching ')' is followed by spacing, '|', ')' or end of input, so
    /// that e.g. (foo|bar)? stays one regex instead of foo|bar AND ?.
    fn parse3(&mut self, cur: &mut Cursor, flags: &PatternFlags, empty: &mut bool) {
        if cur.peek() == b'-' {
            self.op = Op::Not;
            cur.bump();
            cur.skip_space();
        } else if cur.take_oper("NOT") {
            self.op = Op::Not;
            cur.bump();
            cur.skip_space();
        }

        let mut parens = false;

        if cur.peek() == b'(' && (flags.fixed_strings || cur.peek_at(1) != b'?') && cur.group_is_boolean(flags) {
            cur.bump();

            let mut and = OpTree::new(Op::And);
            and.parse1(cur, flags, empty);
            self.list.push(and);

            if cur.peek() == b')' {
                cur.bump();
            }
            parens = true;
        }

        if !parens {
            self.regex = cur.raw_pattern(flags);

            if flags.line_regexp && self.regex.is_empty() {
                self.regex.push_str("^$");
            } else if flags.fixed_strings {
                self.regex = quote(&self.regex);
            }

            anchor(&mut self.regex, flags, empty);
        }
    }

    /// Normalize the operator tree to CNF with double negation, De Morgan,
    /// flattening and distribution of OR over AND.
    fn normalize(&mut self, invert: bool) {
        let invert = invert ^ (self.op == Op::Not);

        if self.list.is_empty() {
            self.op = if invert { Op::Not } else { Op::Leaf };
            return;
        }

        for operand in &mut self.list {
            operand.normalize(invert);
        }

        if self.list.len() == 1 {
            // (P) => P
            let only = self.list.pop().unwrap();
            *self = only;
        } else if invert {
            // !(P&Q) => !P|!Q and !(P|Q) => !P&!Q
            if self.op == Op::And {
                self.op = Op::Or;
            } else if self.op == Op::Or {
                self.op = Op::And;
            }
        }

        // P&(Q&R) => P&Q&R and P|(Q|R) => P|Q|R
        if !self.list.is_empty() {
            let op = self.op;
            let mut flat = Vec::with_capacity(self.list.len());
            for operand in self.list.drain(..) {
                if operand.op == op {
                    flat.extend(operand.list);
                } else {
                    flat.push(operand);
                }
            }
            self.list = flat;
        }

        if self.op == Op::Or {
            // (P&Q)|R => (P|R)&(Q|R)
            // (P&Q)|(R&S) => (P|R)&(P|S)&(Q|R)&(Q|S)
            if let Some(pos) = self.list.iter().position(|o| o.op == Op::And) {
                let isolated = self.list.remove(pos);

                let mut newlist: Vec<OpTree> = isolated
                    .list
                    .into_iter()
                    .map(|operand| {
                        let mut or = OpTree::new(Op::Or);
                        or.list.push(operand);
                        or
                    })
                    .collect();

                for operand in self.list.drain(..) {
                    if operand.op == Op::And {
                        let mut product = Vec::new();
                        for factor in &operand.list {
                            let mut duplist = newlist.clone();
                            for dup in &mut duplist {
                                dup.list.push(factor.clone());
                            }
                            product.extend(duplist);
                        }
                        newlist = product;
                    } else {
                        for dup in &mut newlist {
                            dup.list.push(operand.clone());
                        }
                    }
                }

                self.op = Op::And;
                self.list = newlist;
            }
        }
    }

    /// Convert a CNF-normalized operator tree to an AND-list of OR-term
    /// lists.
    fn convert(&self, terms: &mut Vec<Term>) {
        match self.op {
            Op::And => {
                for operand in &self.list {
                    if !terms.last().map_or(true, |t| t.is_empty()) {
                        terms.push(Term::new());
                    }

                    if operand.op == Op::Or {
                        // an empty leaf in an OR matches anything and wins
                        if let Some(any) = operand
                            .list
                            .iter()
                            .find(|k| k.op == Op::Leaf && k.regex.is_empty() && k.list.is_empty())
                        {
                            any.add_to(terms);
                        } else {
                            for alt in &operand.list {
                                alt.add_to(terms);
                            }
                        }
                    } else {
                        operand.add_to(terms);
                    }

                    if terms.last().map_or(false, |t| t.is_empty()) {
                        terms.pop();
                    }
                }
            }
            Op::Or => {
                for operand in &self.list {
                    operand.add_to(terms);
                }
            }
            _ => self.add_to(terms),
        }
    }

    /// Add a [NOT] leaf of the operator tree to the current term.
    fn add_to(&self, terms: &mut Vec<Term>) {
        let term = terms.last_mut().unwrap();

        if self.op == Op::Not {
            if !self.regex.is_empty() {
                if term.is_empty() {
                    term.push(None);
                } else if term[0].as_deref() == Some("") {
                    return;
                }
                term.push(Some(self.regex.clone()));
            }
        } else {
            add_positive(term, self.regex.clone());
        }
    }
}

/// Byte cursor over the query string with the lookahead scanners the
/// grammar needs: bracket classes, quoted literals and escapes keep
/// their inner spacing, bars and parentheses.
struct Cursor<'a> {
    b: &'a [u8],
    i: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Cursor<'a> {
        Cursor {
            b: s.as_bytes(),
            i: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.i >= self.b.len()
    }

    fn peek(&self) -> u8 {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> u8 {
        *self.b.get(self.i + n).unwrap_or(&0)
    }

    fn bump(&mut self) {
        if self.i < self.b.len() {
            self.i += 1;
        }
    }

    fn skip_space(&mut self) {
        while self.peek().is_ascii_whitespace() {
            self.i += 1;
        }
    }

    /// Consume the operator word when present and followed by space.
    fn take_oper(&mut self, word: &str) -> bool {
        let w = word.as_bytes();
        if self.b[self.i..].starts_with(w) && self.peek_at(w.len()).is_ascii_whitespace() {
            self.i += w.len();
            return true;
        }
        false
    }

    /// Look ahead for '|' or OR; consume it and return true when found.
    fn take_alternation(&mut self) -> bool {
        let mut j = self.i;

        while self.b.get(j).map_or(false, |c| c.is_ascii_whitespace()) {
            j += 1;
        }

        let found = if self.b.get(j) == Some(&b'|') {
            while self.b.get(j) == Some(&b'|') {
                j += 1;
            }
            true
        } else if self.b[j..].starts_with(b"OR")
            && self.b.get(j + 2).map_or(false, |c| c.is_ascii_whitespace())
        {
            j += 2;
            true
        } else {
            false
        };

        if !found {
            return false;
        }

        while self.b.get(j).map_or(false, |c| c.is_ascii_whitespace()) {
            j += 1;
        }

        self.i = j;
        true
    }

    /// Check whether the '(' at the cursor closes with a ')' followed by
    /// spacing, '|', ')' or end of input, skipping classes, quotes and
    /// escapes, so it can be parsed as Boolean grouping.
    fn group_is_boolean(&self, flags: &PatternFlags) -> bool {
        let mut level = 0usize;
        let mut j = self.i;

        loop {
            j += 1;
            let c = match self.b.get(j) {
                Some(c) => *c,
                None => return false,
            };

            match c {
                b'(' => level += 1,
                b')' => {
                    if level == 0 {
                        let after = *self.b.get(j + 1).unwrap_or(&0);
                        return after == 0
                            || after == b'|'
                            || after == b')'
                            || after.is_ascii_whitespace();
                    }
                    level -= 1;
                }
                b'[' if !flags.fixed_strings => {
                    j += 1;
                    if self.b.get(j) == Some(&b'^') {
                        j += 1;
                    }
                    if self.b.get(j).is_some() {
                        j += 1;
                    }
                    while self.b.get(j).map_or(false, |c| *c != b']') {
                        if self.b[j] == b'\\' && self.b.get(j + 1).is_some() {
                            j += 1;
                        }
                        j += 1;
                    }
                }
                b'"' => {
                    j += 1;
                    while self.b.get(j).map_or(false, |c| *c != b'"') {
                        if self.b[j] == b'\\' && self.b.get(j + 1).is_some() {
                            j += 1;
                        }
                        j += 1;
                    }
                }
                b'\\' => {
                    j += 1;
                }
                _ => {}
            }
        }
    }

    /// Scan one raw pattern: it ends at an unquoted space, a '|' or a ')'
    /// at the outer level. Quoted literals are unescaped and, unless in
    /// fixed-strings mode, turned into literal regexes on the spot.
    fn raw_pattern(&mut self, flags: &PatternFlags) -> String {
        let mut regex = String::new();
        let mut level = 0usize;
        let mut j = self.i;

        while j < self.b.len() {
            let c = self.b[j];

            if c == b'"' {
                regex.push_str(&String::from_utf8_lossy(&self.b[self.i..j]));
                j += 1;
                self.i = j;

                while self.b.get(j).map_or(false, |c| *c != b'"') {
                    if self.b[j] == b'\\' && self.b.get(j + 1) == Some(&b'"') {
                        j += 1;
                    }
                    j += 1;
                }

                let quoted = String::from_utf8_lossy(&self.b[self.i..j]).replace("\\\"", "\"");

                if flags.fixed_strings {
                    regex.push_str(&quoted);
                } else {
                    regex.push_str(&quote(&quoted));
                }

                if self.b.get(j) == Some(&b'"') {
                    j += 1;
                }
                self.i = j;
            } else if c == b'[' && !flags.fixed_strings {
                j += 1;
                if self.b.get(j) == Some(&b'^') {
                    j += 1;
                }
                if self.b.get(j).is_some() {
                    j += 1;
                }
                while self.b.get(j).map_or(false, |c| *c != b']') {
                    if self.b[j] == b'\\' && self.b.get(j + 1).is_some() {
                        j += 1;
                    }
                    j += 1;
                }
                if self.b.get(j) == Some(&b']') {
                    j += 1;
                }
            } else if c == b'\\' {
                j += if j + 1 < self.b.len() { 2 } else { 1 };
            } else if c == b'(' {
                level += 1;
                j += 1;
            } else if c == b')' && level > 0 {
                level -= 1;
                j += 1;
            } else {
                j += 1;
            }

            if level == 0 {
                let next = *self.b.get(j).unwrap_or(&0);
                if next == b')' || next == b'|' || next.is_ascii_whitespace() {
                    break;
                }
            }
        }

        let j = j.min(self.b.len());
        regex.push_str(&String::from_utf8_lossy(&self.b[self.i..j]));
        self.i = j;
        regex
    }
}
