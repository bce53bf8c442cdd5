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

//! The per-file search driver.
//!
//! A worker owns one `Worker` instance with its own compiled matchers
//! (the regex engine is never shared between threads). For every job it
//! opens the input, optionally routes it through the decompression
//! demux, detects binary content, dispatches on the output mode and
//! accumulates formatted output in the job's buffer. The buffer is
//! released to the sink when the job ends; files-mode CNF and
//! --min-count hold the output and may discard it instead.

use std::io::Read;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use colored::control::SHOULD_COLORIZE;
use regex::bytes::Regex;

use crate::archive;
use crate::format::{self, FormatContext};
use crate::fuzzy::{literal_of, FuzzyMatcher};
use crate::matcher::{self, CnfMatcher, LineMatcher, MatchOptions};
use crate::output::{OutputBuffer, Sink};
use crate::plan::{BinaryMode, Input, OutputMode, SearchPlan};
use crate::pool::Job;
use crate::select::Selector;
use crate::stats::Stats;
use crate::Error;

/// Initial window inspected for binary detection.
const BINARY_WINDOW: usize = 16384;

const ANSI_MATCH: &str = "\x1b[1;31m";
const ANSI_RESET: &str = "\x1b[0m";

/// True when the window holds a NUL byte or invalid UTF-8. An
/// incomplete multibyte sequence at the window edge is not binary.
pub fn looks_binary(window: &[u8]) -> bool {
    if memchr::memchr(0, window).is_some() {
        return true;
    }
    match std::str::from_utf8(window) {
        Ok(_) => false,
        Err(e) => e.error_len().is_some(),
    }
}

/// One worker's search state, constructed per worker thread.
pub struct Worker {
    plan: Arc<SearchPlan>,
    selector: Arc<Selector>,
    stats: Arc<Stats>,
    sink: Arc<Sink>,
    cancel: Arc<AtomicBool>,
    /// Global count of files that produced output, for --max-files.
    found_files: Arc<AtomicUsize>,
    re: Regex,
    empty_pattern: bool,
    cnf: Option<CnfMatcher>,
    fuzzy: Option<FuzzyMatcher>,
}

struct PartResult {
    matched: bool,
    lines: u64,
}

impl Worker {
    pub fn new(
        plan: Arc<SearchPlan>,
        selector: Arc<Selector>,
        stats: Arc<Stats>,
        sink: Arc<Sink>,
        cancel: Arc<AtomicBool>,
        found_files: Arc<AtomicUsize>,
    ) -> Result<Worker, Error> {
        let opts = MatchOptions {
            ignore_case: plan.ignore_case,
            dotall: plan.dotall,
            ascii: plan.ascii,
        };

        let empty_pattern = plan.pattern.is_empty();
        let re = matcher::compile(&plan.pattern, &opts)?;
        let cnf = CnfMatcher::compile(&plan.cnf, &opts)?;

        let fuzzy = match plan.fuzzy {
            Some(f) => match literal_of(&plan.pattern) {
                Some(lit) => Some(FuzzyMatcher::new(&lit, f, plan.ignore_case)),
                None => {
                    stats.warn("fuzzy matching needs a literal pattern; matching exactly");
                    None
                }
            },
            None => None,
        };

        Ok(Worker {
            plan,
            selector,
            stats,
            sink,
            cancel,
            found_files,
            re,
            empty_pattern,
            cnf,
            fuzzy,
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Entry point from the worker pool.
    pub fn run_job(&self, job: Job) {
        let mut out = OutputBuffer::new(job.slot);

        if let Some(input) = &job.input {
            self.search_input(input, &mut out);
        }

        out.flush_hex();

        // --max-files: a file claims a slot only when it emits output
        if !out.is_empty() {
            if let Some(max) = self.plan.max_files {
                let claimed = self
                    .found_files
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        if n < max {
                            Some(n + 1)
                        } else {
                            None
                        }
                    });
                match claimed {
                    Ok(n) if n + 1 == max => self.cancel.store(true, Ordering::Relaxed),
                    Ok(_) => {}
                    Err(_) => out.buf.clear(),
                }
            }
        }

        self.sink.release(out.slot, std::mem::take(&mut out.buf));
    }

    fn search_input(&self, input: &Input, out: &mut OutputBuffer) {
        let name = input.display_name(&self.plan);
        self.stats.files_searched.fetch_add(1, Ordering::Relaxed);

        let mut parts: Vec<(Option<String>, Vec<u8>)> = Vec::new();

        if self.plan.decompress {
            let rx = match input {
                Input::Path(path) => archive::demux(
                    path,
                    Arc::clone(&self.plan),
                    Arc::clone(&self.selector),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.cancel),
                ),
                Input::Stdin => archive::demux_reader(
                    Box::new(std::io::stdin()),
                    &name,
                    Arc::clone(&self.plan),
                    Arc::clone(&self.selector),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.cancel),
                ),
            };
            for part in rx.iter() {
                if self.cancelled() {
                    break;
                }
                let part_name = part.name.clone();
                parts.push((part_name, part.collect()));
            }
        } else {
            match self.read_input(input) {
                Ok(data) => parts.push((None, data)),
                Err(e) => {
                    self.stats.warn(&format!("cannot read {}: {}", name, e));
                    return;
                }
            }
        }

        let file_mark = out.len();
        let mut file_matched = false;
        let mut total_lines: u64 = 0;
        let mut emitted_open = false;

        for (part_name, data) in &parts {
            if self.cancelled() {
                break;
            }
            self.stats.parts_searched.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_searched
                .fetch_add(data.len() as u64, Ordering::Relaxed);

            let result = self.search_part(
                &name,
                part_name.as_deref(),
                data,
                out,
                &mut emitted_open,
            );

            if result.matched {
                file_matched = true;
                self.stats.parts_matched.fetch_add(1, Ordering::Relaxed);
            }
            total_lines += result.lines;
        }

        if emitted_open {
            if let Some(close) = &self.plan.format_close {
                let ctx = FormatContext {
                    path: &name,
                    separator: &self.plan.separator,
                    ..Default::default()
                };
                format::format(&mut out.buf, close, &ctx);
            }
        }

        // file-level output modes
        match self.plan.mode {
            OutputMode::Count => {
                self.emit_name(out, &name);
                out.str(&total_lines.to_string());
                out.nl();
            }
            OutputMode::FilesWithMatches => {
                if file_matched {
                    self.emit_name_line(out, &name);
                }
            }
            OutputMode::FilesWithoutMatch => {
                if !file_matched {
                    self.emit_name_line(out, &name);
                }
            }
            OutputMode::Quiet => {
                if file_matched {
                    self.cancel.store(true, Ordering::Relaxed);
                }
            }
            OutputMode::Lines => {}
        }

        // nothing is emitted unless min-count matches accumulated
        if total_lines < self.plan.min_count {
            out.truncate(file_mark);
            if self.plan.mode == OutputMode::Lines {
                file_matched = false;
            }
        }

        if file_matched {
            self.stats.files_matched.fetch_add(1, Ordering::Relaxed);
            self.stats
                .lines_matched
                .fetch_add(total_lines, Ordering::Relaxed);
        }
    }

    fn read_input(&self, input: &Input) -> std::io::Result<Vec<u8>> {
        match input {
            Input::Stdin => {
                let mut data = Vec::new();
                std::io::stdin().lock().read_to_end(&mut data)?;
                Ok(data)
            }
            Input::Path(path) => {
                let file = std::fs::File::open(path)?;
                let meta = file.metadata()?;
                if meta.is_file() && meta.len() >= self.plan.min_mmap {
                    // large regular files get a read-only window
                    let map = unsafe { memmap2::Mmap::map(&file)? };
                    return Ok(map.to_vec());
                }
                let mut data = Vec::with_capacity(meta.len() as usize);
                let mut file = file;
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Search one decoded buffer. Emission depends on the output mode;
    /// the file-level modes only evaluate here.
    fn search_part(
        &self,
        name: &str,
        part: Option<&str>,
        data: &[u8],
        out: &mut OutputBuffer,
        emitted_open: &mut bool,
    ) -> PartResult {
        // hex rows never continue across part boundaries
        out.flush_hex();

        let window = &data[..data.len().min(BINARY_WINDOW)];
        let mut binary = looks_binary(window);

        match self.plan.binary {
            BinaryMode::WithoutMatch if binary => {
                return PartResult {
                    matched: false,
                    lines: 0,
                }
            }
            BinaryMode::Text => binary = false,
            _ => {}
        }

        match self.plan.mode {
            OutputMode::Lines => {
                if self.plan.format.is_some() {
                    self.format_mode(name, part, data, out, emitted_open)
                } else if self.plan.only_matching {
                    self.only_matching(name, part, data, out, binary)
                } else if binary && self.plan.binary == BinaryMode::Binary {
                    let r = self.evaluate(data, false);
                    if r.matched {
                        out.str("Binary file ");
                        out.str(name);
                        if let Some(part) = part {
                            out.chr(b':');
                            out.str(part);
                        }
                        out.str(" matches\n");
                    }
                    r
                } else if self.fast_path() {
                    self.search_lines_fast(name, part, data, out)
                } else {
                    self.search_lines(name, part, data, out)
                }
            }
            _ => self.evaluate(data, self.plan.mode == OutputMode::Count),
        }
    }

    /// The match-driven loop: only used when nothing forces a look at
    /// every line.
    fn fast_path(&self) -> bool {
        !self.plan.needs_line_scan()
            && !self.plan.has_context()
            && !self.plan.files
            && self.fuzzy.is_none()
            && !self.empty_pattern
    }

    fn search_lines_fast(
        &self,
        name: &str,
        part: Option<&str>,
        data: &[u8],
        out: &mut OutputBuffer,
    ) -> PartResult {
        let mut m = LineMatcher::new(&self.re, data);
        let mut count: u64 = 0;
        let mut headed = false;

        if let Some(min) = self.plan.min_line {
            m.skip_to(line_offset(data, min));
        }

        while let Some(span) = m.find() {
            if self.cancelled() {
                break;
            }

            let lineno = m.lineno(span.start);
            if let Some(max) = self.plan.max_line {
                if lineno > max {
                    break;
                }
            }

            let bol = m.bol(span.start);
            let eol = m.eol(span.start);

            count += 1;
            self.emit_line(
                out,
                name,
                part,
                &mut headed,
                lineno,
                bol..eol,
                data,
                true,
            );

            if let Some(max) = self.plan.max_count {
                if count >= max {
                    break;
                }
            }

            // one emission per line
            m.skip_to(m.eol_nl(span.start));
        }

        PartResult {
            matched: count > 0,
            lines: count,
        }
    }

    /// The per-line loop: context, invert, any-line, CNF, fuzzy and
    /// files-mode held output all live here.
    fn search_lines(
        &self,
        name: &str,
        part: Option<&str>,
        data: &[u8],
        out: &mut OutputBuffer,
    ) -> PartResult {
        let before_n = self.plan.before_context;
        let after_n = self.plan.after_context;

        let part_mark = out.len();
        let mut count: u64 = 0;
        let mut headed = false;
        let mut after_left = 0usize;
        let mut before: std::collections::VecDeque<(u64, Range<usize>)> =
            std::collections::VecDeque::new();
        let mut last_emitted: u64 = 0;
        let mut any_group = false;

        let mut file_state = if self.plan.files {
            self.cnf.as_ref().map(|c| c.file_state())
        } else {
            None
        };

        // best-match filtering needs the file's minimum cost first
        let best = self.best_cost_of(data);

        let mut lineno: u64 = 0;
        let mut pos = 0usize;

        while pos <= data.len() {
            let (range, next) = match next_line(data, pos) {
                Some(r) => r,
                None => break,
            };
            lineno += 1;
            let at_end = next > data.len();
            pos = next;

            if self.cancelled() {
                break;
            }
            if let Some(min) = self.plan.min_line {
                if lineno < min {
                    continue;
                }
            }
            if let Some(max) = self.plan.max_line {
                if lineno > max {
                    break;
                }
            }

            let line = &data[range.clone()];

            if let (Some(state), Some(cnf)) = (&mut file_state, &self.cnf) {
                state.update(cnf, line);
            }

            let selected = self.line_selected(line, best);

            if selected {
                count += 1;

                // a gap since the last emitted line gets a separator
                let first = lineno - before.len() as u64;
                if any_group && (before_n > 0 || after_n > 0) && last_emitted + 1 < first {
                    if let Some(sep) = &self.plan.group_separator {
                        out.str(sep);
                        out.nl();
                    }
                }

                for (blineno, brange) in before.drain(..) {
                    self.emit_line(out, name, part, &mut headed, blineno, brange, data, false);
                    last_emitted = blineno;
                }

                self.emit_line(
                    out,
                    name,
                    part,
                    &mut headed,
                    lineno,
                    range.clone(),
                    data,
                    true,
                );
                last_emitted = lineno;
                any_group = true;

                after_left = after_n;

                if let Some(max) = self.plan.max_count {
                    if count >= max {
                        break;
                    }
                }
            } else if self.plan.any_line {
                self.emit_line(out, name, part, &mut headed, lineno, range, data, false);
                last_emitted = lineno;
            } else if after_left > 0 {
                after_left -= 1;
                self.emit_line(out, name, part, &mut headed, lineno, range, data, false);
                last_emitted = lineno;
            } else if before_n > 0 {
                before.push_back((lineno, range));
                if before.len() > before_n {
                    before.pop_front();
                }
            }

            if at_end {
                break;
            }
        }

        // files-mode CNF: discard held output unless the file passes
        if let (Some(state), Some(cnf)) = (&file_state, &self.cnf) {
            if !state.passes(cnf) {
                out.truncate(part_mark);
                return PartResult {
                    matched: false,
                    lines: 0,
                };
            }
        }

        PartResult {
            matched: count > 0,
            lines: count,
        }
    }

    /// -o: emit header plus match body per match; multi-line matches
    /// continue line by line behind a bar separator.
    fn only_matching(
        &self,
        name: &str,
        part: Option<&str>,
        data: &[u8],
        out: &mut OutputBuffer,
        binary: bool,
    ) -> PartResult {
        let mut m = LineMatcher::new(&self.re, data);
        let mut count: u64 = 0;
        let mut headed = false;

        if let Some(min) = self.plan.min_line {
            m.skip_to(line_offset(data, min));
        }

        while let Some(span) = m.find() {
            if self.cancelled() {
                break;
            }

            let lineno = m.lineno(span.start);
            if let Some(max) = self.plan.max_line {
                if lineno > max {
                    break;
                }
            }

            let bol = m.bol(span.start);
            let eol = m.eol(span.start);
            let line = &data[bol..eol];

            if let Some(cnf) = &self.cnf {
                let ok = cnf.line_matches(line) ^ self.plan.invert;
                if !ok {
                    m.skip_to(m.eol_nl(span.start));
                    continue;
                }
            }

            count += 1;
            let columno = (span.start - bol) as u64 + 1;

            if self.plan.heading && self.plan.with_filename && !headed {
                out.heading(name, part);
                headed = true;
            }
            let path = self.header_path(name);

            if binary && matches!(self.plan.binary, BinaryMode::Hex | BinaryMode::WithHex) {
                let header_mark = out.len();
                out.header(
                    &self.plan,
                    path,
                    part,
                    lineno,
                    columno,
                    span.start as u64,
                    &self.plan.separator,
                );
                if out.len() > header_mark {
                    out.nl();
                }
                out.hex(span.start as u64, &data[span.start..span.end]);
            } else if let Some(replace) = &self.plan.replace {
                out.header(
                    &self.plan,
                    path,
                    part,
                    lineno,
                    columno,
                    span.start as u64,
                    &self.plan.separator,
                );
                let caps = self.re.captures_at(data, span.start);
                let ctx = FormatContext {
                    path: name,
                    part,
                    lineno,
                    columno,
                    offset: span.start as u64,
                    line,
                    matched: &data[span.start..span.end],
                    captures: caps.as_ref(),
                    ordinal: count,
                    separator: &self.plan.separator,
                };
                format::format(&mut out.buf, replace, &ctx);
                out.nl();
            } else if (self.plan.before_context > 0 || self.plan.after_context > 0)
                && self.plan.width > 0
            {
                out.header(
                    &self.plan,
                    path,
                    part,
                    lineno,
                    columno,
                    span.start as u64,
                    &self.plan.separator,
                );
                let skipped = self.push_budgeted(out, line, bol, span);
                out.nl();
                if skipped {
                    m.skip_to(m.eol_nl(span.start));
                }
            } else {
                // multi-line matches get a fresh header per line
                let text = &data[span.start..span.end];
                let mut first = true;
                let mut sub_lineno = lineno;
                for seg in text.split(|&b| b == b'\n') {
                    let sep = if first { &self.plan.separator } else { "|" };
                    out.header(
                        &self.plan,
                        path,
                        part,
                        sub_lineno,
                        if first { columno } else { 1 },
                        span.start as u64,
                        sep,
                    );
                    self.push_match_colored(out, seg);
                    out.nl();
                    first = false;
                    sub_lineno += 1;
                }
            }

            if let Some(max) = self.plan.max_count {
                if count >= max {
                    break;
                }
            }
        }

        PartResult {
            matched: count > 0,
            lines: count,
        }
    }

    /// --format: run the field interpreter for every match.
    fn format_mode(
        &self,
        name: &str,
        part: Option<&str>,
        data: &[u8],
        out: &mut OutputBuffer,
        emitted_open: &mut bool,
    ) -> PartResult {
        let spec = self.plan.format.as_deref().unwrap_or("");
        let mut m = LineMatcher::new(&self.re, data);
        let mut count: u64 = 0;

        while let Some(span) = m.find() {
            if self.cancelled() {
                break;
            }

            let lineno = m.lineno(span.start);
            let bol = m.bol(span.start);
            let eol = m.eol(span.start);
            let line = &data[bol..eol];

            if let Some(cnf) = &self.cnf {
                if !(cnf.line_matches(line) ^ self.plan.invert) {
                    m.skip_to(m.eol_nl(span.start));
                    continue;
                }
            }

            count += 1;

            if !*emitted_open {
                *emitted_open = true;
                if let Some(open) = &self.plan.format_open {
                    let ctx = FormatContext {
                        path: name,
                        part,
                        separator: &self.plan.separator,
                        ..Default::default()
                    };
                    format::format(&mut out.buf, open, &ctx);
                }
            }

            let caps = self.re.captures_at(data, span.start);
            let ctx = FormatContext {
                path: name,
                part,
                lineno,
                columno: (span.start - bol) as u64 + 1,
                offset: span.start as u64,
                line,
                matched: &data[span.start..span.end],
                captures: caps.as_ref(),
                ordinal: count,
                separator: &self.plan.separator,
            };
            format::format(&mut out.buf, spec, &ctx);

            if let Some(max) = self.plan.max_count {
                if count >= max {
                    break;
                }
            }
        }

        PartResult {
            matched: count > 0,
            lines: count,
        }
    }

    /// Evaluate a part without emitting lines (count, -l, -L, -q).
    fn evaluate(&self, data: &[u8], need_count: bool) -> PartResult {
        // the cheap path: one regex sweep decides
        if !self.plan.needs_line_scan() && self.fuzzy.is_none() && !self.plan.files {
            if !need_count {
                let matched = !self.empty_pattern && self.re.is_match(data);
                return PartResult {
                    matched,
                    lines: u64::from(matched),
                };
            }
            if self.plan.only_matching {
                let mut m = LineMatcher::new(&self.re, data);
                let mut count = 0u64;
                while m.find().is_some() {
                    count += 1;
                    if let Some(max) = self.plan.max_count {
                        if count >= max {
                            break;
                        }
                    }
                }
                return PartResult {
                    matched: count > 0,
                    lines: count,
                };
            }
        }

        let best = self.best_cost_of(data);
        let mut file_state = if self.plan.files {
            self.cnf.as_ref().map(|c| c.file_state())
        } else {
            None
        };

        let mut count: u64 = 0;
        let mut lineno: u64 = 0;
        let mut pos = 0usize;

        while pos <= data.len() {
            let (range, next) = match next_line(data, pos) {
                Some(r) => r,
                None => break,
            };
            lineno += 1;
            let at_end = next > data.len();
            pos = next;

            if let Some(min) = self.plan.min_line {
                if lineno < min {
                    continue;
                }
            }
            if let Some(max) = self.plan.max_line {
                if lineno > max {
                    break;
                }
            }

            let line = &data[range];

            if let (Some(state), Some(cnf)) = (&mut file_state, &self.cnf) {
                state.update(cnf, line);
            }

            if self.line_selected(line, best) {
                count += 1;
                if let Some(max) = self.plan.max_count {
                    if count >= max && file_state.is_none() {
                        break;
                    }
                }
                // -l can stop at the first hit
                if !need_count && file_state.is_none() {
                    break;
                }
            }

            if at_end {
                break;
            }
        }

        if let (Some(state), Some(cnf)) = (&file_state, &self.cnf) {
            if !state.passes(cnf) {
                return PartResult {
                    matched: false,
                    lines: 0,
                };
            }
        }

        PartResult {
            matched: count > 0,
            lines: count,
        }
    }

    /// Is this line selected, before inversion context is applied.
    fn line_selected(&self, line: &[u8], best: Option<u16>) -> bool {
        let hit = if let Some(fz) = &self.fuzzy {
            match fz.min_cost(line) {
                Some(cost) => best.map_or(true, |b| cost <= b),
                None => false,
            }
        } else if self.plan.files {
            // candidate lines in files mode: any positive head hits
            match &self.cnf {
                Some(cnf) => cnf
                    .terms
                    .iter()
                    .any(|t| t.head.as_ref().map_or(false, |h| h.is_match(line))),
                None => !self.empty_pattern && self.re.is_match(line),
            }
        } else if let Some(cnf) = &self.cnf {
            cnf.line_matches(line)
        } else if self.empty_pattern {
            // an empty pattern matches every line
            true
        } else {
            self.re.is_match(line)
        };

        hit ^ self.plan.invert
    }

    /// Minimum fuzzy cost over the part, for -Zbest filtering.
    fn best_cost_of(&self, data: &[u8]) -> Option<u16> {
        let fz = self.fuzzy.as_ref()?;
        if !self.plan.fuzzy.map_or(false, |f| f.best) {
            return None;
        }

        let mut best: Option<u16> = None;
        let mut pos = 0usize;
        while pos <= data.len() {
            let (range, next) = match next_line(data, pos) {
                Some(r) => r,
                None => break,
            };
            let at_end = next > data.len();
            pos = next;
            if let Some(cost) = fz.min_cost(&data[range]) {
                best = Some(best.map_or(cost, |b| b.min(cost)));
                if best == Some(0) {
                    break;
                }
            }
            if at_end {
                break;
            }
        }
        best
    }

    fn header_path<'n>(&self, name: &'n str) -> Option<&'n str> {
        if self.plan.with_filename && !self.plan.heading {
            Some(name)
        } else {
            None
        }
    }

    /// Emit one output line with header and match colorization.
    #[allow(clippy::too_many_arguments)]
    fn emit_line(
        &self,
        out: &mut OutputBuffer,
        name: &str,
        part: Option<&str>,
        headed: &mut bool,
        lineno: u64,
        range: Range<usize>,
        data: &[u8],
        selected: bool,
    ) {
        if self.plan.heading && self.plan.with_filename && !*headed {
            out.heading(name, part);
            *headed = true;
        }

        let line = &data[range.clone()];
        let sep = if selected { &self.plan.separator } else { "-" };

        let columno = if self.plan.column_number {
            self.re
                .find(line)
                .map(|m| m.start() as u64 + 1)
                .unwrap_or(1)
        } else {
            1
        };

        let path = if self.plan.with_filename && !self.plan.heading {
            Some(name)
        } else {
            None
        };
        let header_mark = out.len();
        out.header(
            &self.plan,
            path,
            part,
            lineno,
            columno,
            range.start as u64,
            sep,
        );

        if self.plan.binary == BinaryMode::Hex
            || (self.plan.binary == BinaryMode::WithHex && looks_binary(line))
        {
            if out.len() > header_mark {
                out.nl();
            }
            out.hex(range.start as u64, line);
            return;
        }

        self.push_line_colored(out, line);
        out.nl();
    }

    /// Copy a line into the buffer with every primary match wrapped in
    /// the match color (or substituted by --replace).
    fn push_line_colored(&self, out: &mut OutputBuffer, line: &[u8]) {
        let colorize = SHOULD_COLORIZE.should_colorize();
        let replacing = self.plan.replace.is_some();

        if self.empty_pattern || (!colorize && !replacing) {
            out.bytes(line);
            return;
        }

        if let Some(fz) = &self.fuzzy {
            if let Some((start, end, _)) = fz.find_in(line) {
                out.bytes(&line[..start]);
                if colorize {
                    out.str(ANSI_MATCH);
                }
                out.bytes(&line[start..end]);
                if colorize {
                    out.str(ANSI_RESET);
                }
                out.bytes(&line[end..]);
                return;
            }
            out.bytes(line);
            return;
        }

        let mut at = 0usize;
        for m in self.re.find_iter(line) {
            if m.start() >= line.len() || m.end() == m.start() {
                break;
            }
            out.bytes(&line[at..m.start()]);

            if let Some(replace) = &self.plan.replace {
                let caps = self.re.captures_at(line, m.start());
                let ctx = FormatContext {
                    matched: &line[m.start()..m.end()],
                    line,
                    captures: caps.as_ref(),
                    ordinal: 1,
                    separator: &self.plan.separator,
                    ..Default::default()
                };
                format::format(&mut out.buf, replace, &ctx);
            } else {
                if colorize {
                    out.str(ANSI_MATCH);
                }
                out.bytes(&line[m.start()..m.end()]);
                if colorize {
                    out.str(ANSI_RESET);
                }
            }
            at = m.end();
        }
        out.bytes(&line[at..]);
    }

    /// -o with -ABC: the match and its adjacent line context, budgeted
    /// to the display width. Overflow is elided and further matches on
    /// the line are summarized as "[+N more]". Returns whether the rest
    /// of the line was skipped.
    fn push_budgeted(
        &self,
        out: &mut OutputBuffer,
        line: &[u8],
        bol: usize,
        span: crate::matcher::Span,
    ) -> bool {
        let start = span.start - bol;
        let end = (span.end - bol).min(line.len());
        let matched = &line[start..end];

        let budget = self.plan.width.max(matched.len());
        let avail = budget - matched.len();
        let left_take = start.min(avail / 2);
        let right_take = (line.len() - end).min(avail - left_take);

        if left_take < start {
            out.str("...");
        }
        out.bytes(&line[start - left_take..start]);
        self.push_match_colored(out, matched);
        out.bytes(&line[end..end + right_take]);

        let visible_end = end + right_take;
        if visible_end < line.len() {
            out.str("...");
            let more = self.re.find_iter(&line[visible_end..]).count();
            if more > 0 {
                out.str(&format!("[+{} more]", more));
                return true;
            }
        }
        false
    }

    fn push_match_colored(&self, out: &mut OutputBuffer, text: &[u8]) {
        if SHOULD_COLORIZE.should_colorize() {
            out.str(ANSI_MATCH);
            out.bytes(text);
            out.str(ANSI_RESET);
        } else {
            out.bytes(text);
        }
    }

    /// Count/-l/-L name prefix: "path:" (or NUL-terminated with --null).
    fn emit_name(&self, out: &mut OutputBuffer, name: &str) {
        if self.plan.with_filename {
            out.colored(colored::Colorize::magenta(name));
            if self.plan.null {
                out.chr(0);
            } else {
                out.colored(colored::Colorize::cyan(self.plan.separator.as_str()));
            }
        }
    }

    fn emit_name_line(&self, out: &mut OutputBuffer, name: &str) {
        out.colored(colored::Colorize::magenta(name));
        if self.plan.null {
            out.chr(0);
        } else {
            out.nl();
        }
    }
}

/// The next line's byte range (newline excluded) and the position after
/// its newline. None at end of input.
fn next_line(data: &[u8], pos: usize) -> Option<(Range<usize>, usize)> {
    if pos >= data.len() {
        return None;
    }
    match memchr::memchr(b'\n', &data[pos..]) {
        Some(i) => Some((pos..pos + i, pos + i + 1)),
        None => Some((pos..data.len(), data.len() + 1)),
    }
}

/// Byte offset of the start of 1-based line `lineno`.
fn line_offset(data: &[u8], lineno: u64) -> usize {
    if lineno <= 1 {
        return 0;
    }
    let mut count = 0u64;
    for p in memchr::memchr_iter(b'\n', data) {
        count += 1;
        if count + 1 == lineno {
            return p + 1;
        }
    }
    data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Sink;
    use crate::query::{Cnf, PatternFlags};
    use std::io::Write;
    use std::sync::Mutex;

    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_on(plan: crate::plan::SearchPlan, data: &[u8]) -> String {
        colored::control::set_override(false);

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        std::fs::write(&file, data).unwrap();

        let plan = Arc::new(plan);
        let out = Arc::new(Mutex::new(Vec::new()));
        let broken = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(Sink::new(
            false,
            Box::new(Shared(Arc::clone(&out))),
            broken,
        ));
        let worker = Worker::new(
            Arc::clone(&plan),
            Arc::new(Selector::new(&plan).unwrap()),
            Arc::new(Stats::new()),
            sink,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicUsize::new(0)),
        )
        .unwrap();

        worker.run_job(Job {
            slot: 0,
            input: Some(Input::Path(file)),
            cost: None,
        });

        let v = out.lock().unwrap().clone();
        String::from_utf8(v).unwrap()
    }

    fn plan_for(pattern: &str) -> crate::plan::SearchPlan {
        let mut plan = crate::test_plan();
        let mut cnf = Cnf::new(PatternFlags::default());
        cnf.new_pattern(false, pattern);
        plan.pattern = cnf.adjoin(false);
        plan.cnf = cnf;
        plan
    }

    fn bool_plan(query: &str) -> crate::plan::SearchPlan {
        let mut plan = crate::test_plan();
        let mut cnf = Cnf::new(PatternFlags {
            bool_query: true,
            ..Default::default()
        });
        cnf.compile(query);
        cnf.prune();
        plan.pattern = cnf.adjoin(false);
        plan.cnf = cnf;
        plan
    }

    #[test]
    fn simple_match() {
        let out = run_on(plan_for("foo"), b"a\nfoo bar\nbaz\n");
        assert_eq!(out, "foo bar\n");
    }

    #[test]
    fn count_with_invert() {
        let mut plan = plan_for("foo");
        plan.mode = OutputMode::Count;
        plan.invert = true;
        let out = run_on(plan, b"foo\nbar\nfoo\nbaz\n");
        assert_eq!(out, "2\n");
    }

    #[test]
    fn boolean_and_query() {
        let plan = bool_plan("foo bar");
        let out = run_on(plan, b"foo bar\nfoo\nbar\nfoo baz bar\n");
        assert_eq!(out, "foo bar\nfoo baz bar\n");
    }

    #[test]
    fn context_lines() {
        let mut plan = plan_for("mid");
        plan.after_context = 1;
        plan.before_context = 1;
        let out = run_on(plan, b"a\nb\nmid\nc\nd\n");
        assert_eq!(out, "b\nmid\nc\n");
    }

    #[test]
    fn context_group_separator() {
        let mut plan = plan_for("x");
        plan.after_context = 1;
        plan.before_context = 1;
        let out = run_on(plan, b"x\na\nb\nc\nd\nx\ne\n");
        assert_eq!(out, "x\na\n--\nd\nx\ne\n");
    }

    #[test]
    fn invert_identity() {
        // lines_matched + lines_matched_by_invert == total lines
        let data = b"foo\nbar\nfoo baz\nqux\n";

        let mut plan = plan_for("foo");
        plan.mode = OutputMode::Count;
        let m: u64 = run_on(plan, data).trim().parse().unwrap();

        let mut plan = plan_for("foo");
        plan.mode = OutputMode::Count;
        plan.invert = true;
        let v: u64 = run_on(plan, data).trim().parse().unwrap();

        assert_eq!(m + v, 4);
    }

    #[test]
    fn only_matching() {
        let mut plan = plan_for("o+");
        plan.only_matching = true;
        let out = run_on(plan, b"foo boo\nno\n");
        assert_eq!(out, "oo\noo\no\n");
    }

    #[test]
    fn only_matching_width_budget() {
        let mut plan = plan_for("needle");
        plan.only_matching = true;
        plan.after_context = 1;
        plan.before_context = 1;
        plan.width = 16;
        let out = run_on(
            plan,
            b"left left left needle right right right needle tail\n",
        );
        assert!(out.contains("needle"));
        assert!(out.contains("..."));
        assert!(out.contains("[+1 more]"));
    }

    #[test]
    fn line_numbers_and_filename() {
        let mut plan = plan_for("foo");
        plan.line_number = true;
        plan.with_filename = false;
        let out = run_on(plan, b"x\nfoo\n");
        assert_eq!(out, "2:foo\n");
    }

    #[test]
    fn files_mode_not_discards_output() {
        let mut plan = bool_plan("foo -bar");
        plan.files = true;
        let out = run_on(plan, b"foo\nbar\n");
        assert_eq!(out, "");

        let mut plan = bool_plan("foo -bar");
        plan.files = true;
        let out = run_on(plan, b"foo\nbaz\n");
        assert_eq!(out, "foo\n");
    }

    #[test]
    fn max_count_stops() {
        let mut plan = plan_for("x");
        plan.max_count = Some(2);
        let out = run_on(plan, b"x1\nx2\nx3\n");
        assert_eq!(out, "x1\nx2\n");
    }

    #[test]
    fn min_count_holds_output() {
        let mut plan = plan_for("x");
        plan.min_count = 3;
        let out = run_on(plan, b"x1\nx2\n");
        assert_eq!(out, "");
    }

    #[test]
    fn range_limits_lines() {
        let mut plan = plan_for("x");
        plan.min_line = Some(2);
        plan.max_line = Some(3);
        let out = run_on(plan, b"x1\nx2\nx3\nx4\n");
        assert_eq!(out, "x2\nx3\n");
    }

    #[test]
    fn any_line_emits_everything() {
        let mut plan = plan_for("b");
        plan.any_line = true;
        let out = run_on(plan, b"a\nb\nc\n");
        assert_eq!(out, "a\nb\nc\n");
    }

    #[test]
    fn binary_reports_instead_of_dumping() {
        let plan = plan_for("foo");
        let out = run_on(plan, b"foo\x00bar\n");
        assert!(out.starts_with("Binary file "));
        assert!(out.ends_with(" matches\n"));
    }

    #[test]
    fn binary_without_match_skips() {
        let mut plan = plan_for("foo");
        plan.binary = BinaryMode::WithoutMatch;
        let out = run_on(plan, b"foo\x00bar\n");
        assert_eq!(out, "");
    }

    #[test]
    fn replace_substitutes_match() {
        let mut plan = plan_for("(o+)");
        plan.replace = Some("<%1>".to_string());
        let out = run_on(plan, b"foo\n");
        assert_eq!(out, "f<oo>\n");
    }

    #[test]
    fn format_mode_fields() {
        let mut plan = plan_for("o+");
        plan.format = Some("%n:%o%~".to_string());
        let out = run_on(plan, b"foo\nboo\n");
        assert_eq!(out, "1:oo\n2:oo\n");
    }

    #[test]
    fn last_line_without_newline() {
        let plan = plan_for("end");
        let out = run_on(plan, b"start\nthe end");
        assert_eq!(out, "the end\n");
    }

    #[test]
    fn empty_pattern_matches_all() {
        let plan = plan_for("");
        let out = run_on(plan, b"a\nb\n");
        assert_eq!(out, "a\nb\n");
    }
}
