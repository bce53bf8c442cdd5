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

//! Per-entry include/exclude decisions for the walker.

use std::fs::Metadata;
use std::io::Read;
use std::path::Path;

use regex::bytes::Regex;

use crate::glob::Glob;
use crate::matcher;
use crate::plan::{Action, SearchPlan, SymlinkPolicy};
use crate::stats::Stats;
use crate::Error;

/// Initial window probed for -M magic byte patterns.
const MAGIC_WINDOW: usize = 512;

/// The walker's verdict for one directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Skip,
    Directory,
    Other,
}

/// One entry as seen by the selector.
pub struct EntryCtx<'a> {
    pub path: &'a Path,
    /// Pathname relative to the traversal root, for full-path globs.
    pub rel: &'a str,
    pub name: &'a str,
    /// Metadata after following the link when the policy allows it.
    pub meta: &'a Metadata,
    pub is_symlink: bool,
    pub level: usize,
    /// Entry was named on the command line.
    pub is_arg: bool,
}

/// Compiled selection state shared by walker and archive demux. The
/// magic matcher's pattern table is immutable; each caller probes with
/// its own buffer so no matching state is shared.
pub struct Selector {
    magic: Option<Regex>,
    not_magic: Option<Regex>,
}

impl Selector {
    pub fn new(plan: &SearchPlan) -> Result<Selector, Error> {
        let opts = matcher::MatchOptions {
            ascii: true,
            ..Default::default()
        };
        let join = |patterns: &[String]| -> Result<Option<Regex>, Error> {
            if patterns.is_empty() {
                return Ok(None);
            }
            let joined = patterns
                .iter()
                .map(|p| format!("(?:{})", p))
                .collect::<Vec<_>>()
                .join("|");
            Ok(Some(matcher::compile(&joined, &opts)?))
        };

        Ok(Selector {
            magic: join(&plan.select.magic)?,
            not_magic: join(&plan.select.not_magic)?,
        })
    }

    /// Decide what to do with one directory entry. `extra_excludes` holds
    /// the globs collected from per-directory ignore files on the current
    /// walk path.
    pub fn select(
        &self,
        plan: &SearchPlan,
        ctx: &EntryCtx,
        extra_excludes: &[Glob],
        stats: &Stats,
    ) -> EntryType {
        let sel = &plan.select;

        // hidden files only when asked for, command-line arguments always
        if !sel.hidden && !ctx.is_arg && ctx.name.starts_with('.') && ctx.name.len() > 1 {
            return EntryType::Skip;
        }

        if ctx.is_symlink {
            match sel.symlinks {
                SymlinkPolicy::Never => return EntryType::Skip,
                SymlinkPolicy::CommandLine if !ctx.is_arg => return EntryType::Skip,
                _ => {}
            }
        }

        if ctx.meta.is_dir() {
            return self.select_dir(plan, ctx, extra_excludes);
        }

        if !ctx.meta.is_file() {
            // devices, sockets, fifos
            if sel.devices != Action::Read {
                return EntryType::Skip;
            }
        }

        if ctx.level < sel.min_depth {
            return EntryType::Skip;
        }

        if !fs_in_scope(sel, ctx.meta) {
            return EntryType::Skip;
        }

        // exclude globs first; a negated exclude re-includes
        let mut excluded = last_match(&sel.globs.exclude, ctx, false);
        if excluded.is_none() {
            excluded = last_match(extra_excludes, ctx, false);
        }

        if let Some(true) = excluded {
            // an include glob may override the exclusion
            if !sel
                .globs
                .include
                .iter()
                .any(|g| !g.negated && g.matches(ctx.rel, ctx.name, false))
            {
                return EntryType::Skip;
            }
        }

        let mut accepted = !sel.has_positive_filters();

        if !accepted {
            if !sel.extensions.is_empty() {
                if let Some(ext) = ctx.path.extension().and_then(|e| e.to_str()) {
                    accepted = sel.extensions.iter().any(|e| e == ext);
                }
            }
            if !accepted {
                match last_match(&sel.globs.include, ctx, false) {
                    Some(true) => accepted = true,
                    Some(false) => return EntryType::Skip,
                    None => {}
                }
            }
            if !accepted {
                return EntryType::Skip;
            }
        }

        // magic byte probing runs only on files the name filters accepted
        if (self.magic.is_some() || self.not_magic.is_some())
            && !self.magic_accepts(ctx.path, stats)
        {
            return EntryType::Skip;
        }

        EntryType::Other
    }

    fn select_dir(&self, plan: &SearchPlan, ctx: &EntryCtx, extra_excludes: &[Glob]) -> EntryType {
        let sel = &plan.select;

        if sel.directories != Action::Recurse && !ctx.is_arg {
            return EntryType::Skip;
        }

        // max depth bounds recursion; level counts from 1 for root entries
        if sel.max_depth > 0 && ctx.level >= sel.max_depth {
            return EntryType::Skip;
        }

        if !fs_in_scope(sel, ctx.meta) {
            return EntryType::Skip;
        }

        let mut excluded = last_match_dir(&sel.globs.exclude_dir, ctx);
        if excluded.is_none() {
            excluded = last_match(extra_excludes, ctx, true);
        }
        if let Some(true) = excluded {
            if !sel
                .globs
                .include_dir
                .iter()
                .any(|g| !g.negated && g.matches(ctx.rel, ctx.name, true))
            {
                return EntryType::Skip;
            }
        }

        if !sel.globs.include_dir.is_empty() {
            match last_match_dir(&sel.globs.include_dir, ctx) {
                Some(true) => {}
                Some(false) => return EntryType::Skip,
                None => return EntryType::Skip,
            }
        }

        EntryType::Directory
    }

    /// Probe the file's initial window against the -M patterns.
    fn magic_accepts(&self, path: &Path, stats: &Stats) -> bool {
        let mut window = [0u8; MAGIC_WINDOW];
        let n = match std::fs::File::open(path).and_then(|mut f| f.read(&mut window)) {
            Ok(n) => n,
            Err(e) => {
                stats.warn(&format!("cannot read {}: {}", path.display(), e));
                return false;
            }
        };
        self.magic_accepts_bytes(&window[..n])
    }

    /// Probe an already-read initial window, as the archive demux does
    /// for entries. The pattern table is immutable and safely shared.
    pub fn magic_accepts_bytes(&self, window: &[u8]) -> bool {
        let window = &window[..window.len().min(MAGIC_WINDOW)];

        if let Some(not) = &self.not_magic {
            if not.is_match(window) {
                return false;
            }
        }
        if let Some(magic) = &self.magic {
            return magic.is_match(window);
        }
        true
    }
}

/// Apply a glob pool; the last matching glob wins. Returns None when no
/// glob matched, Some(true) when the effective result is "excluded" and
/// Some(false) when a negated glob re-included the entry.
fn last_match(globs: &[Glob], ctx: &EntryCtx, is_dir: bool) -> Option<bool> {
    let mut verdict = None;
    for g in globs {
        if g.matches(ctx.rel, ctx.name, is_dir) {
            verdict = Some(!g.negated);
        }
    }
    verdict
}

fn last_match_dir(globs: &[Glob], ctx: &EntryCtx) -> Option<bool> {
    let mut verdict = None;
    for g in globs {
        if g.matches(ctx.rel, ctx.name, true) {
            verdict = Some(!g.negated);
        }
    }
    verdict
}

#[cfg(unix)]
fn fs_in_scope(sel: &crate::plan::SelectionPredicate, meta: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;

    let dev = meta.dev();
    if !sel.include_fs.is_empty() && !sel.include_fs.contains(&dev) {
        return false;
    }
    !sel.exclude_fs.contains(&dev)
}

#[cfg(not(unix))]
fn fs_in_scope(_sel: &crate::plan::SelectionPredicate, _meta: &Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::GlobPools;

    fn ctx_with<'a>(
        path: &'a Path,
        rel: &'a str,
        name: &'a str,
        meta: &'a Metadata,
    ) -> EntryCtx<'a> {
        EntryCtx {
            path,
            rel,
            name,
            meta,
            is_symlink: false,
            level: 1,
            is_arg: false,
        }
    }

    fn plan_with_globs(globs: GlobPools) -> SearchPlan {
        let mut plan = crate::test_plan();
        plan.select.globs = globs;
        plan
    }

    #[test]
    fn exclude_then_include_override() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keep.log");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();

        let mut pools = GlobPools::default();
        pools.exclude.push(Glob::new("*.log", false));
        let plan = plan_with_globs(pools);
        let selector = Selector::new(&plan).unwrap();
        let stats = Stats::new();

        let ctx = ctx_with(&file, "keep.log", "keep.log", &meta);
        assert_eq!(
            selector.select(&plan, &ctx, &[], &stats),
            EntryType::Skip
        );

        let mut pools = GlobPools::default();
        pools.exclude.push(Glob::new("*.log", false));
        pools.include.push(Glob::new("keep.*", false));
        let plan = plan_with_globs(pools);
        let ctx = ctx_with(&file, "keep.log", "keep.log", &meta);
        assert_eq!(
            selector.select(&plan, &ctx, &[], &stats),
            EntryType::Other
        );
    }

    #[test]
    fn negated_exclude_reincludes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("important.log");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();

        let mut pools = GlobPools::default();
        pools.exclude.push(Glob::new("*.log", false));
        pools.exclude.push(Glob::new("!important.log", false));
        let plan = plan_with_globs(pools);
        let selector = Selector::new(&plan).unwrap();
        let stats = Stats::new();

        let ctx = ctx_with(&file, "important.log", "important.log", &meta);
        assert_eq!(
            selector.select(&plan, &ctx, &[], &stats),
            EntryType::Other
        );
    }

    #[test]
    fn hidden_needs_flag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".secret");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();

        let plan = crate::test_plan();
        let selector = Selector::new(&plan).unwrap();
        let stats = Stats::new();

        let ctx = ctx_with(&file, ".secret", ".secret", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Skip);

        let mut plan = crate::test_plan();
        plan.select.hidden = true;
        let ctx = ctx_with(&file, ".secret", ".secret", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Other);
    }

    #[test]
    fn extension_filter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();

        let mut plan = crate::test_plan();
        plan.select.extensions.push("rs".to_string());
        let selector = Selector::new(&plan).unwrap();
        let stats = Stats::new();

        let ctx = ctx_with(&file, "main.rs", "main.rs", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Other);

        let other = dir.path().join("main.c");
        std::fs::write(&other, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&other).unwrap();
        let ctx = ctx_with(&other, "main.c", "main.c", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Skip);
    }

    #[test]
    fn magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run");
        std::fs::write(&script, b"#!/bin/sh\necho hi\n").unwrap();
        let meta = std::fs::symlink_metadata(&script).unwrap();

        let mut plan = crate::test_plan();
        plan.select.magic.push("^#!".to_string());
        let selector = Selector::new(&plan).unwrap();
        let stats = Stats::new();

        let ctx = ctx_with(&script, "run", "run", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Other);

        let plain = dir.path().join("data");
        std::fs::write(&plain, b"no shebang").unwrap();
        let meta = std::fs::symlink_metadata(&plain).unwrap();
        let ctx = ctx_with(&plain, "data", "data", &meta);
        assert_eq!(selector.select(&plan, &ctx, &[], &stats), EntryType::Skip);
    }
}
