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

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::glob::Glob;
use crate::query::Cnf;

/// How to sort directory entries before they are submitted to the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Best,
    Size,
    Used,
    Changed,
    Created,
    List,
}

/// Symlink policy for the walker: never follow, follow command-line
/// arguments only (-r), or follow everywhere (-R/-S).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymlinkPolicy {
    Never,
    #[default]
    CommandLine,
    Always,
}

/// What to do with directories and devices encountered during the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Skip,
    Read,
    Recurse,
}

/// Behavior when a file's initial window looks binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMode {
    /// Search and report "Binary file ... matches" (default).
    Binary,
    /// -I / --binary-files=without-match: skip binary files entirely.
    WithoutMatch,
    /// -a / --binary-files=text: treat binary data as text.
    Text,
    /// --binary-files=hex: hex dump all output.
    Hex,
    /// -W / --binary-files=with-hex: text output, hex dump for binary lines.
    WithHex,
}

/// The mutually exclusive output modes of the search driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Default per-line output (plus context and invert variants).
    Lines,
    /// -c: count matching lines (or matches with -o, non-matching with -v).
    Count,
    /// -l: print names of files with at least one match.
    FilesWithMatches,
    /// -L: print names of files without a match.
    FilesWithoutMatch,
    /// -q: no output at all, exit status only.
    Quiet,
}

/// Fuzzy matching parameters parsed from -Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fuzzy {
    pub max: u16,
    pub ins: bool,
    pub del: bool,
    pub sub: bool,
    /// -Zbest: keep only the best-cost matches per file.
    pub best: bool,
}

impl Fuzzy {
    pub fn all(max: u16) -> Fuzzy {
        Fuzzy {
            max,
            ins: true,
            del: true,
            sub: true,
            best: false,
        }
    }
}

/// gitignore-style include/exclude pools. Exclude globs are checked
/// before include globs; a glob starting with `!` flips its pool.
#[derive(Debug, Default)]
pub struct GlobPools {
    pub include: Vec<Glob>,
    pub include_dir: Vec<Glob>,
    pub exclude: Vec<Glob>,
    pub exclude_dir: Vec<Glob>,
}

impl GlobPools {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.include_dir.is_empty()
            && self.exclude.is_empty()
            && self.exclude_dir.is_empty()
    }
}

/// Everything the selector needs to accept or reject one directory entry.
#[derive(Debug, Default)]
pub struct SelectionPredicate {
    pub globs: GlobPools,
    /// -O: file name extensions to include.
    pub extensions: Vec<String>,
    /// -M: magic byte patterns matched against the initial file window.
    pub magic: Vec<String>,
    /// -M '!PATTERN': magic byte patterns that must not match.
    pub not_magic: Vec<String>,
    pub min_depth: usize,
    pub max_depth: usize,
    pub hidden: bool,
    pub symlinks: SymlinkPolicy,
    pub directories: Action,
    pub devices: Action,
    /// --include-fs / --exclude-fs mount scoping by device id.
    pub include_fs: BTreeSet<u64>,
    pub exclude_fs: BTreeSet<u64>,
}

impl SelectionPredicate {
    /// True when a positive include filter restricts the file set, which
    /// gates whether magic byte probing applies to unfiltered files.
    pub fn has_positive_filters(&self) -> bool {
        !self.globs.include.is_empty() || !self.extensions.is_empty()
    }
}

/// One immutable bundle of compiled search options, constructed by the CLI
/// layer and shared read-only by the walker, the workers and the emitter.
/// Core components never mutate it.
#[derive(Debug)]
pub struct SearchPlan {
    /// The primary pattern the matcher is compiled from (CNF adjoined).
    pub pattern: String,
    /// The Boolean query in CNF; a singleton when one pattern suffices.
    pub cnf: Cnf,
    /// --files: CNF terms are satisfied per file instead of per line.
    pub files: bool,

    pub ignore_case: bool,
    pub dotall: bool,
    /// -U: ASCII byte patterns, no Unicode classes.
    pub ascii: bool,
    /// -Y: permit patterns to match empty.
    pub match_empty: bool,
    pub fuzzy: Option<Fuzzy>,

    pub mode: OutputMode,
    pub invert: bool,
    /// -o: report each match instead of whole lines.
    pub only_matching: bool,
    /// -y: pass every line through, matching lines highlighted.
    pub any_line: bool,
    pub after_context: usize,
    pub before_context: usize,
    pub group_separator: Option<String>,

    pub with_filename: bool,
    pub heading: bool,
    pub line_number: bool,
    pub column_number: bool,
    pub byte_offset: bool,
    /// --null: NUL after file names.
    pub null: bool,
    pub separator: String,
    pub binary: BinaryMode,

    pub replace: Option<String>,
    pub format: Option<String>,
    pub format_open: Option<String>,
    pub format_close: Option<String>,
    pub format_begin: Option<String>,
    pub format_end: Option<String>,

    pub max_count: Option<u64>,
    pub min_count: u64,
    pub max_files: Option<usize>,
    pub min_line: Option<u64>,
    pub max_line: Option<u64>,
    /// Display width budget for only-matching context output.
    pub width: usize,

    pub select: SelectionPredicate,
    pub sort: Option<(SortKey, bool)>,
    /// Names of per-directory ignore files (e.g. ".gitignore").
    pub ignore_files: Vec<String>,
    /// Basename of the per-directory index files used for skip acceleration.
    pub index_name: Option<String>,

    pub jobs: usize,
    pub max_queue: usize,
    pub min_steal: usize,

    /// -z: search compressed files and archives.
    pub decompress: bool,
    /// --zmax: maximum decompression nesting.
    pub zmax: usize,

    /// Use a memory-mapped window for regular files of at least this size.
    pub min_mmap: u64,

    /// Label used for standard input headers.
    pub label: String,
    pub stats: bool,
}

impl SearchPlan {
    /// True when emitted chunks must be released in job-slot order.
    /// Unsorted output may interleave by completion order.
    pub fn ordered(&self) -> bool {
        self.sort.is_some()
    }

    /// True when the driver has to look at every line of the input, not
    /// only at lines the primary matcher stops on.
    pub fn needs_line_scan(&self) -> bool {
        self.invert || self.any_line || !self.cnf.singleton_or_undefined()
    }

    /// Context requested and applicable.
    pub fn has_context(&self) -> bool {
        (self.after_context > 0 || self.before_context > 0) && self.mode == OutputMode::Lines
    }
}

/// Starting points handed to the walker. Stdin is a pseudo path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Path(PathBuf),
    Stdin,
}

impl Input {
    pub fn display_name(&self, plan: &SearchPlan) -> String {
        match self {
            Input::Path(p) => p.display().to_string(),
            Input::Stdin => plan.label.clone(),
        }
    }
}
