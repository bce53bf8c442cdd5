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

//! Recursive traversal on the master thread.
//!
//! The walker reads each directory, runs the selector over every entry,
//! submits accepted files to the worker pool (sorted first when a sort
//! key is active) and recurses into accepted subdirectories. It owns
//! the visited-inode set for symlink loop detection, the stack of
//! per-directory ignore files, and the index-assisted skip check; all
//! of that state is only ever touched from this thread.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashSet;

use crate::fuzzy::FuzzyMatcher;
use crate::glob::Glob;
use crate::index::{DirIndex, IndexQuery};
use crate::plan::{Action, Input, SearchPlan, SortKey, SymlinkPolicy};
use crate::pool::Pool;
use crate::select::{EntryCtx, EntryType, Selector};
use crate::stats::Stats;

/// Hard ceiling on directory recursion.
const MAX_RECURSION: usize = 100;

/// Bytes sampled per file when precomputing best-match costs.
const COST_WINDOW: usize = 64 * 1024;

struct Entry {
    path: PathBuf,
    name: String,
    meta: Metadata,
    was_symlink: bool,
    cost: Option<u16>,
}

pub struct Walker<'a> {
    plan: &'a SearchPlan,
    selector: &'a Selector,
    stats: &'a Stats,
    cancel: &'a AtomicBool,
    pool: &'a mut Pool,
    /// (device, inode) pairs of directories reached through symlinks.
    visited: FxHashSet<(u64, u64)>,
    /// Exclusions collected from ignore files, popped on unwind.
    ignore_globs: Vec<Glob>,
    index_query: Option<IndexQuery>,
    fuzzy: Option<FuzzyMatcher>,
    root: PathBuf,
}

impl<'a> Walker<'a> {
    pub fn new(
        plan: &'a SearchPlan,
        selector: &'a Selector,
        stats: &'a Stats,
        cancel: &'a AtomicBool,
        pool: &'a mut Pool,
        index_query: Option<IndexQuery>,
        fuzzy: Option<FuzzyMatcher>,
    ) -> Walker<'a> {
        Walker {
            plan,
            selector,
            stats,
            cancel,
            pool,
            visited: FxHashSet::default(),
            ignore_globs: Vec::new(),
            index_query,
            fuzzy,
            root: PathBuf::new(),
        }
    }

    pub fn walk(&mut self, inputs: &[Input]) {
        for input in inputs {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            match input {
                Input::Stdin => self.pool.submit(Input::Stdin, None),
                Input::Path(path) => self.walk_arg(path),
            }
        }
    }

    fn walk_arg(&mut self, path: &Path) {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                self.stats.warn(&format!("cannot stat {}: {}", path.display(), e));
                return;
            }
        };

        let is_symlink = meta.file_type().is_symlink();
        if is_symlink && self.plan.select.symlinks == SymlinkPolicy::Never {
            return;
        }

        let meta = if is_symlink {
            match std::fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    self.stats.warn(&format!("cannot stat {}: {}", path.display(), e));
                    return;
                }
            }
        } else {
            meta
        };

        if meta.is_dir() {
            if self.plan.select.directories != Action::Recurse {
                if self.plan.select.directories == Action::Read {
                    self.stats
                        .warn(&format!("{} is a directory", path.display()));
                }
                return;
            }
            self.root = path.to_path_buf();
            self.mark_visited(&meta);
            self.walk_dir(path, 1);
        } else {
            // command-line file arguments are always searched
            let cost = self.precompute_cost(path);
            self.pool.submit(Input::Path(path.to_path_buf()), cost);
        }
    }

    fn walk_dir(&mut self, dir: &Path, level: usize) {
        if level > MAX_RECURSION {
            self.stats.warn(&format!(
                "{}: recursion too deep, not descending further",
                dir.display()
            ));
            return;
        }
        if self.cancel.load(Ordering::Relaxed) {
            return;
        }

        self.stats.dirs_walked.fetch_add(1, Ordering::Relaxed);

        let read = match std::fs::read_dir(dir) {
            Ok(r) => r,
            Err(e) => {
                self.stats.warn(&format!("cannot read {}: {}", dir.display(), e));
                return;
            }
        };

        let pushed = self.push_ignore_files(dir);
        let dir_index = self
            .index_query
            .as_ref()
            .and_then(|_| self.plan.index_name.as_ref())
            .and_then(|name| DirIndex::read(&dir.join(name)));

        let mut files: Vec<Entry> = Vec::new();
        let mut dirs: Vec<Entry> = Vec::new();

        for dirent in read {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }

            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    self.stats.warn(&format!("cannot read {}: {}", dir.display(), e));
                    continue;
                }
            };

            let path = dirent.path();
            let name = dirent.file_name().to_string_lossy().into_owned();

            let link_meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    self.stats.warn(&format!("cannot stat {}: {}", path.display(), e));
                    continue;
                }
            };
            let was_symlink = link_meta.file_type().is_symlink();

            let meta = if was_symlink && self.follows_symlinks() {
                match std::fs::metadata(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        self.stats.warn(&format!("cannot stat {}: {}", path.display(), e));
                        continue;
                    }
                }
            } else {
                link_meta
            };

            self.stats.files_scored.fetch_add(1, Ordering::Relaxed);

            let rel = self.relative(&path);
            let ctx = EntryCtx {
                path: &path,
                rel: &rel,
                name: &name,
                meta: &meta,
                is_symlink: was_symlink,
                level,
                is_arg: false,
            };

            match self.selector.select(self.plan, &ctx, &self.ignore_globs, self.stats) {
                EntryType::Skip => {}
                EntryType::Directory => dirs.push(Entry {
                    path,
                    name,
                    meta,
                    was_symlink,
                    cost: None,
                }),
                EntryType::Other => {
                    if let (Some(query), Some(index)) = (&self.index_query, &dir_index) {
                        if index.skippable(&name, query) {
                            log::debug!("index: skip {}", rel);
                            self.stats.index_skipped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                    let cost = self.precompute_cost(&path);
                    files.push(Entry {
                        path,
                        name,
                        meta,
                        was_symlink,
                        cost,
                    });
                }
            }
        }

        if dir_index.is_some() {
            log::debug!("index: read {}", dir.display());
        }

        if let Some((key, reverse)) = self.plan.sort {
            sort_entries(&mut files, key, reverse);
            let dir_key = match key {
                SortKey::Best | SortKey::List => SortKey::Name,
                k => k,
            };
            sort_entries(&mut dirs, dir_key, reverse);
        }

        for entry in files {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            self.pool.submit(Input::Path(entry.path), entry.cost);
        }

        for entry in dirs {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if entry.was_symlink && !self.mark_visited(&entry.meta) {
                self.stats.warn(&format!(
                    "{}: symbolic link cycle, not followed",
                    entry.path.display()
                ));
                continue;
            }
            self.walk_dir(&entry.path, level + 1);
        }

        self.ignore_globs.truncate(self.ignore_globs.len() - pushed);
    }

    fn follows_symlinks(&self) -> bool {
        self.plan.select.symlinks == SymlinkPolicy::Always
    }

    /// Record a directory inode; false when it was already visited.
    #[cfg(unix)]
    fn mark_visited(&mut self, meta: &Metadata) -> bool {
        use std::os::unix::fs::MetadataExt;
        self.visited.insert((meta.dev(), meta.ino()))
    }

    #[cfg(not(unix))]
    fn mark_visited(&mut self, _meta: &Metadata) -> bool {
        true
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    /// Load this directory's ignore files; their globs extend the
    /// exclusions for the subtree. Returns how many globs to pop.
    fn push_ignore_files(&mut self, dir: &Path) -> usize {
        let mut pushed = 0;

        for name in &self.plan.ignore_files {
            let path = dir.join(name);
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };

            self.stats.add_ignore_file(path.display().to_string());
            let rel_dir = self.relative(dir);

            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                let (neg, body) = match line.strip_prefix('!') {
                    Some(rest) => ("!", rest),
                    None => ("", line),
                };

                // slash globs are relative to the ignore file's directory
                let scoped = if body.trim_end_matches('/').contains('/') && !rel_dir.is_empty() {
                    format!("{}{}/{}", neg, rel_dir, body.trim_start_matches('/'))
                } else {
                    format!("{}{}", neg, body)
                };

                self.ignore_globs.push(Glob::new(&scoped, false));
                pushed += 1;
            }
        }

        pushed
    }

    /// Best-match cost over the file head, used as sort key and filter.
    fn precompute_cost(&self, path: &Path) -> Option<u16> {
        let fuzzy = self.fuzzy.as_ref()?;
        if self.plan.sort.map(|(k, _)| k) != Some(SortKey::Best) {
            return None;
        }

        let mut window = vec![0u8; COST_WINDOW];
        let n = std::fs::File::open(path)
            .and_then(|mut f| std::io::Read::read(&mut f, &mut window))
            .ok()?;
        Some(fuzzy.best_cost(&window[..n]))
    }
}

fn sort_entries(entries: &mut [Entry], key: SortKey, reverse: bool) {
    match key {
        SortKey::Name => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        SortKey::Size => entries.sort_by_key(|e| e.meta.len()),
        SortKey::Best => entries.sort_by_key(|e| e.cost.unwrap_or(u16::MAX)),
        SortKey::Used => entries.sort_by_key(|e| time_key(&e.meta, TimeField::Used)),
        SortKey::Changed => entries.sort_by_key(|e| time_key(&e.meta, TimeField::Changed)),
        SortKey::Created => entries.sort_by_key(|e| time_key(&e.meta, TimeField::Created)),
        SortKey::List => {}
    }
    if reverse {
        entries.reverse();
    }
}

enum TimeField {
    Used,
    Changed,
    Created,
}

/// File timestamps packed as microseconds.
#[cfg(unix)]
fn time_key(meta: &Metadata, field: TimeField) -> u64 {
    use std::os::unix::fs::MetadataExt;
    let (secs, nsecs) = match field {
        TimeField::Used => (meta.atime(), meta.atime_nsec()),
        TimeField::Changed => (meta.mtime(), meta.mtime_nsec()),
        TimeField::Created => (meta.ctime(), meta.ctime_nsec()),
    };
    (secs.max(0) as u64) * 1_000_000 + (nsecs.max(0) as u64) / 1_000
}

#[cfg(not(unix))]
fn time_key(meta: &Metadata, _field: TimeField) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
