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

//! qgrep core: a concurrent recursive pattern search engine.
//!
//! The CLI layer builds one immutable [`plan::SearchPlan`] and calls
//! [`run`]: the master thread walks the starting points, submits file
//! jobs to the worker pool and joins it; each worker owns its compiled
//! matchers and drives the per-file search loop, streaming formatted
//! output through the slot-synchronized sink.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[macro_use]
extern crate log;

pub mod archive;
pub mod decode;
pub mod format;
pub mod fuzzy;
pub mod glob;
pub mod index;
pub mod matcher;
pub mod output;
pub mod plan;
pub mod pool;
pub mod query;
pub mod search;
pub mod select;
pub mod stats;
pub mod walk;

use crate::format::FormatContext;
use crate::fuzzy::{literal_of, FuzzyMatcher};
use crate::index::IndexQuery;
use crate::output::Sink;
use crate::plan::{Input, SearchPlan};
use crate::search::Worker;
use crate::select::Selector;
use crate::stats::Stats;
use crate::walk::Walker;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// What the run produced, for exit-code mapping.
pub struct RunSummary {
    pub matched: bool,
    pub warnings: u64,
}

/// Search all `inputs` according to `plan`.
pub fn run(plan: SearchPlan, inputs: Vec<Input>) -> Result<RunSummary, Error> {
    let plan = Arc::new(plan);
    let stats = Arc::new(Stats::new());
    let cancel = Arc::new(AtomicBool::new(false));
    let selector = Arc::new(Selector::new(&plan)?);
    let found_files = Arc::new(AtomicUsize::new(0));

    // a broken sink sets the shared cancel flag
    let sink = Arc::new(Sink::new(
        plan.ordered(),
        Box::new(std::io::stdout()),
        Arc::clone(&cancel),
    ));

    if let Some(begin) = &plan.format_begin {
        let mut buf = Vec::new();
        let ctx = FormatContext {
            separator: &plan.separator,
            ..Default::default()
        };
        format::format(&mut buf, begin, &ctx);
        sink.write_direct(&buf);
    }

    // each worker thread owns its own compiled matchers
    let workers: Vec<Worker> = (0..plan.jobs.max(1))
        .map(|_| {
            Worker::new(
                Arc::clone(&plan),
                Arc::clone(&selector),
                Arc::clone(&stats),
                Arc::clone(&sink),
                Arc::clone(&cancel),
                Arc::clone(&found_files),
            )
        })
        .collect::<Result<_, _>>()?;

    let mut pool = pool::Pool::new(
        plan.jobs,
        plan.max_queue,
        plan.min_steal,
        Arc::clone(&cancel),
        move |id, job| workers[id % workers.len()].run_job(job),
    )?;

    let pattern_literal = literal_of(plan.cnf.first())
        .or_else(|| literal_of(&plan.pattern))
        .and_then(|b| String::from_utf8(b).ok());

    let index_query = match (&plan.index_name, &pattern_literal) {
        (Some(_), Some(lit)) => IndexQuery::from_literals(std::slice::from_ref(lit)),
        _ => None,
    };

    let walker_fuzzy = plan.fuzzy.and_then(|f| {
        pattern_literal
            .as_ref()
            .map(|lit| FuzzyMatcher::new(lit.as_bytes(), f, plan.ignore_case))
    });

    {
        let mut walker = Walker::new(
            &plan,
            &selector,
            &stats,
            &cancel,
            &mut pool,
            index_query,
            walker_fuzzy,
        );
        walker.walk(&inputs);
    }

    pool.finish();

    if let Some(end) = &plan.format_end {
        let mut buf = Vec::new();
        let ctx = FormatContext {
            separator: &plan.separator,
            ..Default::default()
        };
        format::format(&mut buf, end, &ctx);
        sink.write_direct(&buf);
    }

    // the summary is suppressed when the sink broke mid-run
    if plan.stats && !cancel.load(Ordering::Relaxed) {
        let mut report = String::new();
        if plan.cnf.defined() {
            report.push_str(&plan.cnf.report(plan.files, plan.invert));
        }
        report.push_str(&stats.report());
        sink.write_direct(report.as_bytes());
    }

    sink.flush();
    info!(
        "searched {} files, {} matched",
        stats.files_searched.load(Ordering::Relaxed),
        stats.files_matched.load(Ordering::Relaxed)
    );

    Ok(RunSummary {
        matched: stats.matched(),
        warnings: stats.warning_count(),
    })
}

/// A neutral plan for unit tests.
#[cfg(test)]
pub fn test_plan() -> SearchPlan {
    SearchPlan {
        pattern: String::new(),
        cnf: query::Cnf::default(),
        files: false,
        ignore_case: false,
        dotall: false,
        ascii: false,
        match_empty: false,
        fuzzy: None,
        mode: plan::OutputMode::Lines,
        invert: false,
        only_matching: false,
        any_line: false,
        after_context: 0,
        before_context: 0,
        group_separator: Some("--".to_string()),
        with_filename: false,
        heading: false,
        line_number: false,
        column_number: false,
        byte_offset: false,
        null: false,
        separator: ":".to_string(),
        binary: plan::BinaryMode::Binary,
        replace: None,
        format: None,
        format_open: None,
        format_close: None,
        format_begin: None,
        format_end: None,
        max_count: None,
        min_count: 0,
        max_files: None,
        min_line: None,
        max_line: None,
        width: 0,
        select: plan::SelectionPredicate {
            directories: plan::Action::Recurse,
            ..Default::default()
        },
        sort: None,
        ignore_files: Vec::new(),
        index_name: None,
        jobs: 2,
        max_queue: 64,
        min_steal: 3,
        decompress: false,
        zmax: 1,
        min_mmap: u64::MAX,
        label: "(standard input)".to_string(),
        stats: false,
    }
}
