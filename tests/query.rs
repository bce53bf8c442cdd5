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

//! CNF equivalence: compiling a Boolean query and evaluating the
//! normalized terms against a line must agree with evaluating the
//! query directly.

use qgrep::matcher::{CnfMatcher, MatchOptions};
use qgrep::query::{Cnf, PatternFlags};

fn eval(query: &str, line: &str) -> bool {
    let mut cnf = Cnf::new(PatternFlags {
        bool_query: true,
        ..Default::default()
    });
    cnf.compile(query);
    cnf.prune();

    match CnfMatcher::compile(&cnf, &MatchOptions::default()).unwrap() {
        Some(m) => m.line_matches(line.as_bytes()),
        None => {
            // a singleton decides via its head pattern alone
            let head = cnf.lists()[0][0].as_deref().unwrap();
            regex::Regex::new(head).unwrap().is_match(line)
        }
    }
}

#[test]
fn and_semantics() {
    assert!(eval("foo bar", "foo and bar"));
    assert!(!eval("foo bar", "only foo"));
    assert!(!eval("foo bar", "only bar"));
    assert!(eval("foo AND bar", "bar foo"));
}

#[test]
fn or_semantics() {
    assert!(eval("foo|bar", "has foo"));
    assert!(eval("foo|bar", "has bar"));
    assert!(eval("foo OR bar", "has bar"));
    assert!(!eval("foo|bar", "neither"));
}

#[test]
fn not_semantics() {
    assert!(eval("foo -bar", "foo here"));
    assert!(!eval("foo -bar", "foo bar"));
    assert!(!eval("foo -bar", "nothing"));
    assert!(eval("foo NOT bar", "foo here"));
}

#[test]
fn nested_groups() {
    // (foo OR bar) AND (baz OR qux)
    assert!(eval("(foo|bar) (baz|qux)", "foo qux"));
    assert!(eval("(foo|bar) (baz|qux)", "bar baz"));
    assert!(!eval("(foo|bar) (baz|qux)", "foo only"));
    assert!(!eval("(foo|bar) (baz|qux)", "baz only"));
}

#[test]
fn de_morgan() {
    // -(foo|bar) == -foo AND -bar
    for line in ["clean", "has foo", "has bar", "foo bar"] {
        assert_eq!(
            eval("-(foo|bar)", line),
            !(line.contains("foo") || line.contains("bar")),
            "line: {}",
            line
        );
    }

    // -(foo bar) == -foo OR -bar
    for line in ["clean", "has foo", "has bar", "foo bar"] {
        assert_eq!(
            eval("-(foo bar)", line),
            !(line.contains("foo") && line.contains("bar")),
            "line: {}",
            line
        );
    }
}

#[test]
fn distribution_preserves_semantics() {
    // (foo AND bar) OR baz
    for line in ["foo bar", "just baz", "foo baz", "foo", "bar", "none"] {
        let direct = (line.contains("foo") && line.contains("bar")) || line.contains("baz");
        assert_eq!(eval("(foo bar)|baz", line), direct, "line: {}", line);
    }
}

#[test]
fn quoted_literals_match_verbatim() {
    assert!(eval("\"foo bar\"", "a foo bar b"));
    assert!(!eval("\"foo bar\"", "foo and bar"));
    assert!(eval("\"a|b\"", "has a|b literally"));
    assert!(!eval("\"a|b\"", "only a"));
}

#[test]
fn mixed_depth_queries() {
    let q = "(alpha|beta) -(gamma delta)";
    for (line, want) in [
        ("alpha", true),
        ("beta gamma", true),
        ("alpha gamma delta", false),
        ("delta", false),
        ("beta delta", true),
    ] {
        assert_eq!(eval(q, line), want, "line: {}", line);
    }
}
