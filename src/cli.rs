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

//! Command-line parsing and translation into the immutable SearchPlan
//! the core searches with. The clap crate handles program exit and
//! error messages for invalid arguments.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use simplelog::{Config, LevelFilter, SimpleLogger};

use qgrep::glob::Glob;
use qgrep::matcher::{self, MatchOptions};
use qgrep::plan::{
    Action, BinaryMode, Fuzzy, GlobPools, Input, OutputMode, SearchPlan, SelectionPredicate,
    SortKey, SymlinkPolicy,
};
use qgrep::query::{bre_to_ere, Cnf, PatternFlags};

const ABOUT: &str = "\
qgrep searches files and directories for lines (or byte ranges)
matching patterns, with Boolean queries (AND/OR/NOT), gitignore-style
file selection, context, and transparent search of compressed files
and archives (-z).";

const DEFAULT_MIN_MMAP: u64 = 256 * 1024;
const MAX_JOBS: usize = 16;

#[derive(Parser, Debug)]
#[command(
    name = "qgrep",
    version,
    about = ABOUT,
    disable_help_flag = true,
    args_override_self = true
)]
pub struct Args {
    /// Search pattern, unless -e or -f supplies one.
    pub pattern: Option<String>,

    /// Files and directories to search; '-' reads standard input.
    pub paths: Vec<PathBuf>,

    #[arg(long = "help", action = ArgAction::Help, help = "Print help information.")]
    help: Option<bool>,

    /// Specify an additional pattern; all positionals become files.
    #[arg(short = 'e', long = "regexp", value_name = "PATTERN")]
    regexp: Vec<String>,

    /// Read newline-separated patterns from a file.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Vec<PathBuf>,

    /// Add a pattern that must also match (a new CNF term).
    #[arg(long = "and", value_name = "PATTERN")]
    and_patterns: Vec<String>,

    /// Add a pattern that must not match in the current term.
    #[arg(long = "not", value_name = "PATTERN")]
    not_patterns: Vec<String>,

    /// Add a new term whose pattern must not match.
    #[arg(long = "andnot", value_name = "PATTERN")]
    andnot_patterns: Vec<String>,

    /// Patterns are Boolean queries: spacing is AND, |/OR, -/NOT.
    #[arg(short = '%', long = "bool")]
    bool_query: bool,

    /// With --bool: CNF terms must be satisfied per file, not per line.
    #[arg(long = "files")]
    files: bool,

    /// Extended regular expressions (default).
    #[arg(short = 'E', long = "extended-regexp")]
    extended_regexp: bool,

    /// Basic regular expressions.
    #[arg(short = 'G', long = "basic-regexp")]
    basic_regexp: bool,

    /// Patterns are literal strings.
    #[arg(short = 'F', long = "fixed-strings")]
    fixed_strings: bool,

    /// Perl-compatible syntax (handled by the same engine).
    #[arg(short = 'P', long = "perl-regexp")]
    perl_regexp: bool,

    /// Patterns match whole words.
    #[arg(short = 'w', long = "word-regexp")]
    word_regexp: bool,

    /// Patterns match whole lines.
    #[arg(short = 'x', long = "line-regexp")]
    line_regexp: bool,

    /// Case-insensitive matching.
    #[arg(short = 'i', long = "ignore-case")]
    ignore_case: bool,

    /// Case-insensitive unless the pattern contains an upper case letter.
    #[arg(short = 'j', long = "smart-case")]
    smart_case: bool,

    /// ASCII byte patterns, no Unicode classes.
    #[arg(short = 'U', long = "ascii")]
    ascii: bool,

    /// Permit patterns to match empty lines.
    #[arg(short = 'Y', long = "empty")]
    empty: bool,

    /// Dot matches newline.
    #[arg(long = "dotall")]
    dotall: bool,

    /// Fuzzy matching up to MAX extra/missing/replaced characters;
    /// prefix + insertions only, - deletions only, ~ substitutions
    /// only; 'best' keeps only each file's best matches.
    #[arg(short = 'Z', long = "fuzzy", value_name = "[best][+-~]MAX", num_args = 0..=1, default_missing_value = "1", require_equals = true)]
    fuzzy: Option<String>,

    /// Count matching lines per file (matches with -o, non-matching with -v).
    #[arg(short = 'c', long = "count")]
    count: bool,

    /// List files with at least one match.
    #[arg(short = 'l', long = "files-with-matches")]
    files_with_matches: bool,

    /// List files without a match.
    #[arg(short = 'L', long = "files-without-match")]
    files_without_match: bool,

    /// No output; exit status reports whether a match was found.
    #[arg(short = 'q', long = "quiet", alias = "silent")]
    quiet: bool,

    /// Print only the matched parts of lines.
    #[arg(short = 'o', long = "only-matching")]
    only_matching: bool,

    /// Select non-matching lines.
    #[arg(short = 'v', long = "invert-match")]
    invert_match: bool,

    /// Pass every line through; matching lines are highlighted.
    #[arg(short = 'y', long = "any-line")]
    any_line: bool,

    /// Always print file names.
    #[arg(short = 'H', long = "with-filename")]
    with_filename: bool,

    /// Never print file names.
    #[arg(short = 'h', long = "no-filename")]
    no_filename: bool,

    /// Group matches per file under a heading line.
    #[arg(long = "heading")]
    heading: bool,

    /// Print line numbers.
    #[arg(short = 'n', long = "line-number")]
    line_number: bool,

    /// Print column numbers.
    #[arg(short = 'k', long = "column-number")]
    column_number: bool,

    /// Print byte offsets.
    #[arg(short = 'b', long = "byte-offset")]
    byte_offset: bool,

    /// NUL byte after file names.
    #[arg(long = "null")]
    null: bool,

    /// Print NUM lines of trailing context.
    #[arg(short = 'A', long = "after-context", value_name = "NUM")]
    after_context: Option<usize>,

    /// Print NUM lines of leading context.
    #[arg(short = 'B', long = "before-context", value_name = "NUM")]
    before_context: Option<usize>,

    /// Print NUM lines of context around matches.
    #[arg(short = 'C', long = "context", value_name = "NUM")]
    context: Option<usize>,

    /// Separator between groups of context lines.
    #[arg(long = "group-separator", value_name = "SEP", default_value = "--")]
    group_separator: String,

    /// No separator between groups of context lines.
    #[arg(long = "no-group-separator")]
    no_group_separator: bool,

    /// Separator between the header fields and the line.
    #[arg(long = "separator", value_name = "SEP", default_value = ":")]
    separator: String,

    /// Output every match via a FORMAT string.
    #[arg(long = "format", value_name = "FORMAT")]
    format: Option<String>,

    /// FORMAT emitted when a file starts producing output.
    #[arg(long = "format-open", value_name = "FORMAT")]
    format_open: Option<String>,

    /// FORMAT emitted after a file produced output.
    #[arg(long = "format-close", value_name = "FORMAT")]
    format_close: Option<String>,

    /// FORMAT emitted before all output.
    #[arg(long = "format-begin", value_name = "FORMAT")]
    format_begin: Option<String>,

    /// FORMAT emitted after all output.
    #[arg(long = "format-end", value_name = "FORMAT")]
    format_end: Option<String>,

    /// Replace matches by a FORMAT expansion of capture groups.
    #[arg(long = "replace", value_name = "FORMAT")]
    replace: Option<String>,

    /// Hex dump binary output.
    #[arg(short = 'X', long = "hexdump")]
    hexdump: bool,

    /// Output text, hex dump binary lines.
    #[arg(short = 'W', long = "with-hex")]
    with_hex: bool,

    /// Ignore binary files.
    #[arg(short = 'I')]
    no_binary: bool,

    /// Treat binary files as text.
    #[arg(short = 'a', long = "text")]
    text: bool,

    /// Binary file handling: binary, text, hex, with-hex, without-match.
    #[arg(long = "binary-files", value_name = "TYPE")]
    binary_files: Option<String>,

    /// Label for standard input headers.
    #[arg(long = "label", value_name = "LABEL", default_value = "(standard input)")]
    label: String,

    /// Recurse into directories (the default), symlinks from the
    /// command line only.
    #[arg(short = 'r', long = "recursive")]
    recursive: bool,

    /// Recurse following all symbolic links.
    #[arg(short = 'R', long = "dereference-recursive")]
    dereference_recursive: bool,

    /// Follow symbolic links to files and directories.
    #[arg(short = 'S', long = "dereference")]
    dereference: bool,

    /// Never follow symbolic links.
    #[arg(short = 'p', long = "no-dereference")]
    no_dereference: bool,

    /// Directory action: read, recurse or skip.
    #[arg(short = 'd', long = "directories", value_name = "ACTION")]
    directories: Option<String>,

    /// Device action: read or skip.
    #[arg(short = 'D', long = "devices", value_name = "ACTION")]
    devices: Option<String>,

    /// Restrict search depth to [MIN,]MAX directory levels.
    #[arg(long = "depth", value_name = "[MIN,]MAX")]
    depth: Option<String>,

    /// Search files and directories matching a glob; '!' negates,
    /// a glob ending in '/' applies to directories.
    #[arg(short = 'g', long = "glob", value_name = "GLOB")]
    glob: Vec<String>,

    /// Case-insensitive --glob.
    #[arg(long = "iglob", value_name = "GLOB")]
    iglob: Vec<String>,

    /// Only search files whose name matches a glob.
    #[arg(long = "include", value_name = "GLOB")]
    include: Vec<String>,

    /// Only recurse into directories whose name matches a glob.
    #[arg(long = "include-dir", value_name = "GLOB")]
    include_dir: Vec<String>,

    /// Read --include globs from a file.
    #[arg(long = "include-from", value_name = "FILE")]
    include_from: Vec<PathBuf>,

    /// Only search file systems the given paths are mounted on.
    #[arg(long = "include-fs", value_name = "MOUNT")]
    include_fs: Vec<PathBuf>,

    /// Skip files whose name matches a glob.
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,

    /// Skip directories whose name matches a glob.
    #[arg(long = "exclude-dir", value_name = "GLOB")]
    exclude_dir: Vec<String>,

    /// Read --exclude globs from a file.
    #[arg(long = "exclude-from", value_name = "FILE")]
    exclude_from: Vec<PathBuf>,

    /// Skip file systems the given paths are mounted on.
    #[arg(long = "exclude-fs", value_name = "MOUNT")]
    exclude_fs: Vec<PathBuf>,

    /// Only search files with the given extensions (comma-separated).
    #[arg(short = 'O', long = "file-extension", value_name = "EXTS")]
    file_extension: Vec<String>,

    /// Only search files whose first bytes match a pattern; '!' negates.
    #[arg(short = 'M', long = "file-magic", value_name = "MAGIC")]
    file_magic: Vec<String>,

    /// Only search files of the named types (-t list to show them).
    #[arg(short = 't', long = "file-type", value_name = "TYPES")]
    file_type: Vec<String>,

    /// Also search hidden files and directories.
    #[arg(long = "hidden", short = '.')]
    hidden: bool,

    /// Respect gitignore-style exclusions from per-directory FILE.
    #[arg(long = "ignore-files", value_name = "FILE", num_args = 0..=1, default_missing_value = ".gitignore", require_equals = true)]
    ignore_files: Vec<String>,

    /// Use per-directory index files to skip unmatchable files.
    #[arg(long = "index", value_name = "FILE", num_args = 0..=1, default_missing_value = ".qgrep-index", require_equals = true)]
    index: Option<String>,

    /// Stop searching a file after NUM matching lines.
    #[arg(short = 'm', long = "max-count", value_name = "NUM")]
    max_count: Option<u64>,

    /// Emit nothing from a file with fewer than NUM matching lines.
    #[arg(long = "min-count", value_name = "NUM")]
    min_count: Option<u64>,

    /// Stop the search after NUM files produced output.
    #[arg(long = "max-files", value_name = "NUM")]
    max_files: Option<usize>,

    /// Only search lines MIN through MAX.
    #[arg(long = "range", value_name = "MIN[,MAX]")]
    range: Option<String>,

    /// Display width budget for only-matching context.
    #[arg(long = "width", value_name = "NUM")]
    width: Option<usize>,

    /// Number of worker threads.
    #[arg(short = 'J', long = "jobs", value_name = "NUM")]
    jobs: Option<usize>,

    /// Soft bound on each worker's job queue.
    #[arg(long = "max-queue", value_name = "NUM")]
    max_queue: Option<usize>,

    /// Minimum queued jobs before a peer may steal one.
    #[arg(long = "min-steal", value_name = "NUM")]
    min_steal: Option<usize>,

    /// Sort output by: name, best, size, used, changed, created, list;
    /// prefix r to reverse.
    #[arg(long = "sort", value_name = "KEY", num_args = 0..=1, default_missing_value = "name", require_equals = true)]
    sort: Option<String>,

    /// Search compressed files and archives.
    #[arg(short = 'z', long = "decompress")]
    decompress: bool,

    /// Maximum decompression nesting (1..99).
    #[arg(long = "zmax", value_name = "NUM")]
    zmax: Option<usize>,

    /// Colorize output: always, never or auto.
    #[arg(long = "color", value_name = "WHEN", num_args = 0..=1, default_missing_value = "always", require_equals = true)]
    color: Option<String>,

    /// Print the search plan and counters when done.
    #[arg(long = "stats")]
    stats: bool,

    /// Verbose logging; repeat for debug output.
    #[arg(long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

/// File type table: type name to extensions and an optional magic
/// pattern, resolved into the selection predicate by -t.
const FILE_TYPES: &[(&str, &[&str], Option<&str>)] = &[
    ("asm", &["s", "S", "asm"], None),
    ("c", &["c", "h"], None),
    ("cpp", &["cc", "cpp", "cxx", "hh", "hpp", "hxx", "h"], None),
    ("cmake", &["cmake"], None),
    ("css", &["css"], None),
    ("csv", &["csv"], None),
    ("go", &["go"], None),
    ("html", &["html", "htm", "xhtml"], None),
    ("ini", &["ini", "cfg", "conf"], None),
    ("java", &["java"], None),
    ("js", &["js", "mjs", "cjs", "jsx"], None),
    ("json", &["json"], None),
    ("kotlin", &["kt", "kts"], None),
    ("lua", &["lua"], None),
    ("make", &["mk", "mak"], None),
    ("markdown", &["md", "markdown"], None),
    ("perl", &["pl", "pm"], Some(r"^#!.*\bperl")),
    ("php", &["php", "php3", "php4", "phtml"], Some(r"^#!.*\bphp")),
    ("python", &["py", "pyi"], Some(r"^#!.*\bpython")),
    ("ruby", &["rb", "erb"], Some(r"^#!.*\bruby")),
    ("rust", &["rs"], None),
    ("shell", &["sh", "bash", "zsh"], Some(r"^#!.*\bsh")),
    ("sql", &["sql"], None),
    ("swift", &["swift"], None),
    ("tex", &["tex", "sty", "cls"], None),
    ("text", &["txt", "text"], None),
    ("toml", &["toml"], None),
    ("ts", &["ts", "tsx"], None),
    ("xml", &["xml", "xsd", "xsl"], None),
    ("yaml", &["yaml", "yml"], None),
];

pub fn parse_arguments() -> Args {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let _ = SimpleLogger::init(level, Config::default());

    match args.color.as_deref() {
        Some("always") => colored::control::set_override(true),
        Some("never") => colored::control::set_override(false),
        _ => {}
    }

    args
}

/// Build the immutable SearchPlan and the list of starting points.
pub fn build_plan(mut args: Args) -> Result<(SearchPlan, Vec<Input>), String> {
    let flags = PatternFlags {
        fixed_strings: args.fixed_strings,
        line_regexp: args.line_regexp,
        word_regexp: args.word_regexp,
        bool_query: args.bool_query,
        from_file: !args.file.is_empty(),
    };

    if args.perl_regexp {
        log::debug!("perl syntax is handled by the default engine");
    }

    let translate = |p: &str| -> String {
        if args.basic_regexp && !args.extended_regexp && !args.fixed_strings {
            bre_to_ere(p)
        } else {
            p.to_string()
        }
    };

    let mut cnf = Cnf::new(flags);

    // with -e or -f the positional pattern is a path
    let mut paths = std::mem::take(&mut args.paths);
    let have_e_or_f = !args.regexp.is_empty() || !args.file.is_empty();

    match args.pattern.take() {
        Some(p) if have_e_or_f => paths.insert(0, PathBuf::from(p)),
        Some(p) => cnf.new_pattern(false, &translate(&p)),
        None if !have_e_or_f => return Err("no pattern given".to_string()),
        None => {}
    }

    for p in &args.regexp {
        cnf.new_pattern(false, &translate(p));
    }

    for file in &args.file {
        let content = std::fs::read_to_string(file)
            .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
        // one pattern per line, joined by split() below
        cnf.new_pattern(false, content.trim_end_matches(['\n', '\r']));
    }

    for p in &args.and_patterns {
        cnf.new_term();
        cnf.new_pattern(false, &translate(p));
    }
    for p in &args.andnot_patterns {
        cnf.new_term();
        cnf.new_pattern(true, &translate(p));
    }
    for p in &args.not_patterns {
        cnf.new_pattern(true, &translate(p));
    }

    cnf.split();
    cnf.prune();

    let files_mode = args.files;
    let pattern = cnf.adjoin(files_mode);

    let ignore_case = args.ignore_case
        || (args.smart_case && !pattern.chars().any(|c| c.is_ascii_uppercase()));

    // abort on regex errors before any search starts
    let opts = MatchOptions {
        ignore_case,
        dotall: args.dotall,
        ascii: args.ascii,
    };
    matcher::compile(&pattern, &opts).map_err(|e| e.to_string())?;
    for term in cnf.lists() {
        for p in term.iter().flatten() {
            matcher::compile(p, &opts).map_err(|e| e.to_string())?;
        }
    }

    let mode = if args.quiet {
        OutputMode::Quiet
    } else if args.count {
        OutputMode::Count
    } else if args.files_with_matches {
        OutputMode::FilesWithMatches
    } else if args.files_without_match {
        OutputMode::FilesWithoutMatch
    } else {
        OutputMode::Lines
    };

    let fuzzy = match &args.fuzzy {
        Some(spec) => Some(parse_fuzzy(spec)?),
        None => None,
    };

    let sort = match &args.sort {
        Some(spec) => Some(parse_sort(spec)?),
        None => None,
    };

    let (min_line, max_line) = match &args.range {
        Some(spec) => parse_range(spec)?,
        None => (None, None),
    };

    let (min_depth, max_depth) = match &args.depth {
        Some(spec) => parse_depth(spec)?,
        None => (0, 0),
    };

    let binary = if let Some(kind) = &args.binary_files {
        match kind.as_str() {
            "binary" => BinaryMode::Binary,
            "text" => BinaryMode::Text,
            "hex" => BinaryMode::Hex,
            "with-hex" => BinaryMode::WithHex,
            "without-match" => BinaryMode::WithoutMatch,
            other => return Err(format!("invalid --binary-files value '{}'", other)),
        }
    } else if args.hexdump {
        BinaryMode::Hex
    } else if args.with_hex {
        BinaryMode::WithHex
    } else if args.no_binary {
        BinaryMode::WithoutMatch
    } else if args.text {
        BinaryMode::Text
    } else {
        BinaryMode::Binary
    };

    let symlinks = if args.no_dereference {
        SymlinkPolicy::Never
    } else if args.dereference_recursive || args.dereference {
        SymlinkPolicy::Always
    } else {
        SymlinkPolicy::CommandLine
    };

    let directories = match args.directories.as_deref() {
        Some("skip") => Action::Skip,
        Some("read") => Action::Read,
        Some("recurse") | None => Action::Recurse,
        Some(other) => return Err(format!("invalid --directories action '{}'", other)),
    };
    let devices = match args.devices.as_deref() {
        Some("read") => Action::Read,
        Some("skip") | None => Action::Skip,
        Some(other) => return Err(format!("invalid --devices action '{}'", other)),
    };

    let mut globs = GlobPools::default();

    let add_glob = |g: &str, ignore_case: bool, pools: &mut GlobPools| {
        let parsed = Glob::new(g, ignore_case);
        let negated = parsed.negated;
        let dir_only = parsed.dir_only;
        match (negated, dir_only) {
            (false, false) => pools.include.push(parsed),
            (false, true) => pools.include_dir.push(parsed),
            (true, false) => pools.exclude.push(parsed),
            (true, true) => pools.exclude_dir.push(parsed),
        }
    };

    // -g/--glob: '!' selects the exclude pool and is consumed there
    for g in &args.glob {
        let stripped = g.strip_prefix('!').unwrap_or(g);
        let target = Glob::new(stripped, false);
        if g.starts_with('!') {
            if target.dir_only {
                globs.exclude_dir.push(target);
            } else {
                globs.exclude.push(target);
            }
        } else {
            add_glob(g, false, &mut globs);
        }
    }
    for g in &args.iglob {
        let stripped = g.strip_prefix('!').unwrap_or(g);
        let target = Glob::new(stripped, true);
        if g.starts_with('!') {
            if target.dir_only {
                globs.exclude_dir.push(target);
            } else {
                globs.exclude.push(target);
            }
        } else {
            add_glob(g, true, &mut globs);
        }
    }

    for g in &args.include {
        globs.include.push(Glob::new(g, false));
    }
    for g in &args.include_dir {
        globs.include_dir.push(Glob::new(g, false));
    }
    for g in &args.exclude {
        globs.exclude.push(Glob::new(g, false));
    }
    for g in &args.exclude_dir {
        globs.exclude_dir.push(Glob::new(g, false));
    }

    for (files, pool) in [
        (&args.include_from, false),
        (&args.exclude_from, true),
    ] {
        for file in files.iter() {
            let content = std::fs::read_to_string(file)
                .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let g = Glob::new(line, false);
                match (pool, g.dir_only) {
                    (false, false) => globs.include.push(g),
                    (false, true) => globs.include_dir.push(g),
                    (true, false) => globs.exclude.push(g),
                    (true, true) => globs.exclude_dir.push(g),
                }
            }
        }
    }

    let mut extensions: Vec<String> = Vec::new();
    for list in &args.file_extension {
        extensions.extend(list.split(',').map(|s| s.trim_start_matches('.').to_string()));
    }

    let mut magic: Vec<String> = Vec::new();
    let mut not_magic: Vec<String> = Vec::new();
    for m in &args.file_magic {
        match m.strip_prefix('!') {
            Some(neg) => not_magic.push(neg.to_string()),
            None => magic.push(m.clone()),
        }
    }

    for list in &args.file_type {
        for ty in list.split(',') {
            if ty == "list" {
                let names: Vec<&str> = FILE_TYPES.iter().map(|(n, _, _)| *n).collect();
                return Err(format!("file types: {}", names.join(" ")));
            }
            let entry = FILE_TYPES
                .iter()
                .find(|(n, _, _)| *n == ty)
                .ok_or_else(|| format!("unknown file type '{}'", ty))?;
            extensions.extend(entry.1.iter().map(|e| e.to_string()));
            if let Some(m) = entry.2 {
                magic.push(m.to_string());
            }
        }
    }

    let fs_set = |paths: &[PathBuf]| -> Result<BTreeSet<u64>, String> {
        let mut set = BTreeSet::new();
        for p in paths {
            set.insert(device_of(p)?);
        }
        Ok(set)
    };

    let select = SelectionPredicate {
        globs,
        extensions,
        magic,
        not_magic,
        min_depth,
        max_depth,
        hidden: args.hidden,
        symlinks,
        directories,
        devices,
        include_fs: fs_set(&args.include_fs)?,
        exclude_fs: fs_set(&args.exclude_fs)?,
    };

    let cores = num_cpus::get();
    // keep one core for the master when there are plenty
    let reserve = usize::from(cores >= 8);
    let jobs = args
        .jobs
        .unwrap_or_else(|| (cores - reserve).clamp(1, MAX_JOBS));

    let (after_context, before_context) = match args.context {
        Some(c) => (
            args.after_context.unwrap_or(c),
            args.before_context.unwrap_or(c),
        ),
        None => (
            args.after_context.unwrap_or(0),
            args.before_context.unwrap_or(0),
        ),
    };

    let inputs = resolve_inputs(paths, args.recursive || args.dereference_recursive);

    // file names are shown when more than one input may produce output
    let multi = inputs.len() > 1
        || inputs.iter().any(|i| match i {
            Input::Path(p) => p.is_dir(),
            Input::Stdin => false,
        });
    let with_filename = if args.no_filename {
        false
    } else {
        args.with_filename || multi
    };

    let match_empty = args.empty || cnf.match_empty;

    let plan = SearchPlan {
        pattern,
        cnf,
        files: files_mode,
        ignore_case,
        dotall: args.dotall,
        ascii: args.ascii,
        match_empty,
        fuzzy,
        mode,
        invert: args.invert_match,
        only_matching: args.only_matching,
        any_line: args.any_line,
        after_context,
        before_context,
        group_separator: if args.no_group_separator {
            None
        } else {
            Some(args.group_separator.clone())
        },
        with_filename,
        heading: args.heading,
        line_number: args.line_number,
        column_number: args.column_number,
        byte_offset: args.byte_offset,
        null: args.null,
        separator: args.separator.clone(),
        binary,
        replace: args.replace.clone(),
        format: args.format.clone(),
        format_open: args.format_open.clone(),
        format_close: args.format_close.clone(),
        format_begin: args.format_begin.clone(),
        format_end: args.format_end.clone(),
        max_count: args.max_count,
        min_count: args.min_count.unwrap_or(0),
        max_files: args.max_files,
        min_line,
        max_line,
        width: args.width.unwrap_or(0),
        select,
        sort,
        ignore_files: args.ignore_files.clone(),
        index_name: args.index.clone(),
        jobs,
        max_queue: args.max_queue.unwrap_or(64),
        min_steal: args.min_steal.unwrap_or(3),
        decompress: args.decompress,
        zmax: args.zmax.unwrap_or(1).clamp(1, 99),
        min_mmap: DEFAULT_MIN_MMAP,
        label: args.label.clone(),
        stats: args.stats,
    };

    Ok((plan, inputs))
}

fn resolve_inputs(paths: Vec<PathBuf>, recursive: bool) -> Vec<Input> {
    if paths.is_empty() {
        // no file arguments: -r searches the working directory,
        // otherwise standard input is read
        if recursive {
            return vec![Input::Path(PathBuf::from("."))];
        }
        return vec![Input::Stdin];
    }
    paths
        .into_iter()
        .map(|p| {
            if p.as_os_str() == "-" {
                Input::Stdin
            } else {
                Input::Path(p)
            }
        })
        .collect()
}

#[cfg(unix)]
fn device_of(path: &std::path::Path) -> Result<u64, String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .map(|m| m.dev())
        .map_err(|e| format!("cannot stat {}: {}", path.display(), e))
}

#[cfg(not(unix))]
fn device_of(_path: &std::path::Path) -> Result<u64, String> {
    Ok(0)
}

/// -Z[best][+-~]MAX
fn parse_fuzzy(spec: &str) -> Result<Fuzzy, String> {
    let mut rest = spec;
    let best = rest.starts_with("best");
    if best {
        rest = &rest["best".len()..];
    }

    let mut ins = false;
    let mut del = false;
    let mut sub = false;
    while let Some(c) = rest.chars().next() {
        match c {
            '+' => ins = true,
            '-' => del = true,
            '~' => sub = true,
            _ => break,
        }
        rest = &rest[1..];
    }
    if !ins && !del && !sub {
        ins = true;
        del = true;
        sub = true;
    }

    let max: u16 = if rest.is_empty() {
        1
    } else {
        rest.parse()
            .map_err(|_| format!("invalid fuzzy distance '{}'", spec))?
    };

    Ok(Fuzzy {
        max: max.max(1),
        ins,
        del,
        sub,
        best,
    })
}

/// --sort=[r]KEY
fn parse_sort(spec: &str) -> Result<(SortKey, bool), String> {
    let (key, reverse) = match spec.strip_prefix('r') {
        // "reverse" prefixes only when the rest still names a key
        Some(rest) if !rest.is_empty() => (rest, true),
        _ => (spec, false),
    };

    let key = match key {
        "name" => SortKey::Name,
        "best" => SortKey::Best,
        "size" => SortKey::Size,
        "used" => SortKey::Used,
        "changed" => SortKey::Changed,
        "created" => SortKey::Created,
        "list" => SortKey::List,
        other => return Err(format!("invalid sort key '{}'", other)),
    };

    Ok((key, reverse))
}

/// --range=MIN[,MAX]
fn parse_range(spec: &str) -> Result<(Option<u64>, Option<u64>), String> {
    let bad = || format!("invalid --range '{}'", spec);
    match spec.split_once(',') {
        Some((min, max)) => {
            let min = min.parse().map_err(|_| bad())?;
            let max = max.parse().map_err(|_| bad())?;
            Ok((Some(min), Some(max)))
        }
        None => {
            let min = spec.parse().map_err(|_| bad())?;
            Ok((Some(min), None))
        }
    }
}

/// --depth=[MIN,]MAX
fn parse_depth(spec: &str) -> Result<(usize, usize), String> {
    let bad = || format!("invalid --depth '{}'", spec);
    match spec.split_once(',') {
        Some((min, max)) => {
            let min = min.parse().map_err(|_| bad())?;
            let max = max.parse().map_err(|_| bad())?;
            Ok((min, max))
        }
        None => {
            let max = spec.parse().map_err(|_| bad())?;
            Ok((0, max))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzy_spec() {
        let f = parse_fuzzy("2").unwrap();
        assert_eq!(f.max, 2);
        assert!(f.ins && f.del && f.sub && !f.best);

        let f = parse_fuzzy("best+3").unwrap();
        assert!(f.best && f.ins && !f.del && !f.sub);
        assert_eq!(f.max, 3);

        let f = parse_fuzzy("~").unwrap();
        assert!(f.sub && !f.ins && !f.del);
        assert_eq!(f.max, 1);

        assert!(parse_fuzzy("bad").is_err());
    }

    #[test]
    fn sort_spec() {
        assert_eq!(parse_sort("name").unwrap(), (SortKey::Name, false));
        assert_eq!(parse_sort("rsize").unwrap(), (SortKey::Size, true));
        assert_eq!(parse_sort("list").unwrap(), (SortKey::List, false));
        assert!(parse_sort("bogus").is_err());
    }

    #[test]
    fn range_spec() {
        assert_eq!(parse_range("5").unwrap(), (Some(5), None));
        assert_eq!(parse_range("5,9").unwrap(), (Some(5), Some(9)));
        assert!(parse_range("x").is_err());
    }

    #[test]
    fn depth_spec() {
        assert_eq!(parse_depth("3").unwrap(), (0, 3));
        assert_eq!(parse_depth("2,5").unwrap(), (2, 5));
    }
}
