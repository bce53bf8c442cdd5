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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Run-wide counters, updated atomically by the walker and the workers
/// and read once by the closing report.
#[derive(Debug, Default)]
pub struct Stats {
    /// Files considered by the selector.
    pub files_scored: AtomicU64,
    /// Files actually searched.
    pub files_searched: AtomicU64,
    /// Files with at least one released match.
    pub files_matched: AtomicU64,
    /// Archive parts searched and matched.
    pub parts_searched: AtomicU64,
    pub parts_matched: AtomicU64,
    pub lines_matched: AtomicU64,
    pub dirs_walked: AtomicU64,
    /// Files skipped by the index signature check.
    pub index_skipped: AtomicU64,
    pub bytes_searched: AtomicU64,
    pub warnings: AtomicU64,
    /// Per-directory ignore files that contributed exclusions.
    ignore_files: Mutex<BTreeSet<String>>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn add_ignore_file(&self, path: String) {
        self.ignore_files.lock().unwrap().insert(path);
    }

    pub fn warn(&self, msg: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        eprintln!("qgrep: {}", msg);
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> bool {
        self.files_matched.load(Ordering::Relaxed) > 0
            || self.lines_matched.load(Ordering::Relaxed) > 0
    }

    /// Render the end-of-run summary for --stats.
    pub fn report(&self) -> String {
        let dirs = self.dirs_walked.load(Ordering::Relaxed);
        let searched = self.files_searched.load(Ordering::Relaxed);
        let matched = self.files_matched.load(Ordering::Relaxed);
        let parts = self.parts_searched.load(Ordering::Relaxed);
        let lines = self.lines_matched.load(Ordering::Relaxed);
        let skipped = self.index_skipped.load(Ordering::Relaxed);

        let mut s = format!(
            "Searched {} file{} in {} director{}: {} matching ({} line{})\n",
            searched,
            if searched == 1 { "" } else { "s" },
            dirs,
            if dirs == 1 { "y" } else { "ies" },
            matched,
            lines,
            if lines == 1 { "" } else { "s" },
        );

        if parts > searched {
            s.push_str(&format!(
                "Searched {} archive part{}\n",
                parts,
                if parts == 1 { "" } else { "s" }
            ));
        }
        if skipped > 0 {
            s.push_str(&format!("Skipped {} file{} by index\n", skipped, if skipped == 1 { "" } else { "s" }));
        }

        let ignore = self.ignore_files.lock().unwrap();
        if !ignore.is_empty() {
            s.push_str("Applied ignore files:\n");
            for f in ignore.iter() {
                s.push_str("  ");
                s.push_str(f);
                s.push('\n');
            }
        }

        s
    }
}
