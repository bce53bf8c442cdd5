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

//! Synchronized output.
//!
//! Every job accumulates its formatted output in its own buffer; no
//! lock is taken while searching. Releasing the buffer either flushes
//! it straight to the shared sink (unordered) or parks it until its
//! slot becomes the next to emit (ordered), which keeps multi-worker
//! output identical to a single-threaded scan when sorting is on.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use colored::{ColoredString, Colorize};

use crate::plan::SearchPlan;

/// Bytes per hex dump row.
const HEX_COLS: u64 = 16;

/// Per-job output buffer, owned by the worker while the job runs.
pub struct OutputBuffer {
    pub slot: u64,
    pub buf: Vec<u8>,
    // the trailing partial hex row, held open between consecutive dumps
    hex_row: Option<(u64, [Option<u8>; HEX_COLS as usize])>,
}

impl OutputBuffer {
    pub fn new(slot: u64) -> OutputBuffer {
        OutputBuffer {
            slot,
            buf: Vec::new(),
            hex_row: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything past `len`, including an open hex row.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
        self.hex_row = None;
    }

    pub fn str(&mut self, s: &str) {
        self.flush_hex();
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.flush_hex();
        self.buf.extend_from_slice(b);
    }

    pub fn chr(&mut self, c: u8) {
        self.flush_hex();
        self.buf.push(c);
    }

    pub fn nl(&mut self) {
        self.flush_hex();
        self.buf.push(b'\n');
    }

    pub fn colored(&mut self, s: ColoredString) {
        self.str(&s.to_string());
    }

    /// Emit the configured combination of pathname, archive partname,
    /// line number, column number and byte offset. `path` is None when
    /// a heading already named the file or -h suppressed it. Context
    /// lines pass "-" as separator, matches the plan separator.
    #[allow(clippy::too_many_arguments)]
    pub fn header(
        &mut self,
        plan: &SearchPlan,
        path: Option<&str>,
        part: Option<&str>,
        lineno: u64,
        columno: u64,
        offset: u64,
        sep: &str,
    ) {
        if let Some(path) = path {
            self.colored(path.magenta());
            if let Some(part) = part {
                self.colored(":".cyan());
                self.colored(part.magenta());
            }
            if plan.null {
                self.chr(0);
            } else {
                self.colored(sep.cyan());
            }
        }

        if plan.line_number {
            self.colored(lineno.to_string().as_str().green());
            self.colored(sep.cyan());
        }
        if plan.column_number {
            self.colored(columno.to_string().as_str().green());
            self.colored(sep.cyan());
        }
        if plan.byte_offset {
            self.colored(offset.to_string().as_str().green());
            self.colored(sep.cyan());
        }
    }

    /// Emit the heading line used with --heading: the pathname (plus
    /// partname) on its own line before the file's matches.
    pub fn heading(&mut self, path: &str, part: Option<&str>) {
        self.colored(path.magenta().bold());
        if let Some(part) = part {
            self.colored(":".cyan());
            self.colored(part.magenta().bold());
        }
        self.nl();
    }

    /// Hex dump `data` starting at file offset `offset`, 16 bytes per
    /// row with an ASCII column. A dump landing inside the row the
    /// previous call left open continues that row (gap cells stay
    /// blank); any other append flushes the open row first, so rows
    /// stay aligned and no row label is emitted twice.
    pub fn hex(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut pos = offset;
        let end = offset + data.len() as u64;

        let mut current: (u64, [Option<u8>; HEX_COLS as usize]) = match self.hex_row.take() {
            Some((row, cells)) if pos >= row && pos < row + HEX_COLS => (row, cells),
            Some((row, cells)) => {
                self.render_hex_row(row, &cells);
                (pos - pos % HEX_COLS, [None; HEX_COLS as usize])
            }
            None => (pos - pos % HEX_COLS, [None; HEX_COLS as usize]),
        };

        while pos < end {
            if pos >= current.0 + HEX_COLS {
                self.render_hex_row(current.0, &current.1);
                current = (pos - pos % HEX_COLS, [None; HEX_COLS as usize]);
            }
            current.1[(pos - current.0) as usize] = Some(data[(pos - offset) as usize]);
            pos += 1;
        }

        if end == current.0 + HEX_COLS {
            self.render_hex_row(current.0, &current.1);
        } else {
            // keep the incomplete row open for the next dump
            self.hex_row = Some(current);
        }
    }

    /// Emit the open hex row, if any.
    pub fn flush_hex(&mut self) {
        if let Some((row, cells)) = self.hex_row.take() {
            self.render_hex_row(row, &cells);
        }
    }

    fn render_hex_row(&mut self, row: u64, cells: &[Option<u8>; HEX_COLS as usize]) {
        self.buf
            .extend_from_slice(format!("{:08x}: ", row).as_bytes());

        let mut ascii = String::with_capacity(HEX_COLS as usize);
        for cell in cells {
            match cell {
                Some(b) => {
                    self.buf
                        .extend_from_slice(format!("{:02x} ", b).as_bytes());
                    ascii.push(if (0x20..0x7f).contains(b) {
                        *b as char
                    } else {
                        '.'
                    });
                }
                None => {
                    self.buf.extend_from_slice(b"   ");
                    ascii.push(' ');
                }
            }
        }

        self.buf.push(b'|');
        self.buf.extend_from_slice(ascii.as_bytes());
        self.buf.extend_from_slice(b"|\n");
    }
}

/// Highlight a matched region.
pub fn paint_match(text: &str) -> ColoredString {
    text.red().bold()
}

/// The shared sink all buffers drain into.
pub struct Sink {
    inner: Mutex<SinkInner>,
    ordered: bool,
    /// Raised on write failure; the master treats it as cancellation.
    pub broken: Arc<AtomicBool>,
}

struct SinkInner {
    out: Box<dyn Write + Send>,
    next_slot: u64,
    parked: BTreeMap<u64, Vec<u8>>,
}

impl Sink {
    pub fn new(ordered: bool, out: Box<dyn Write + Send>, broken: Arc<AtomicBool>) -> Sink {
        Sink {
            inner: Mutex::new(SinkInner {
                out,
                next_slot: 0,
                parked: BTreeMap::new(),
            }),
            ordered,
            broken,
        }
    }

    /// Release one job's buffer. In ordered mode every slot must be
    /// released exactly once, even with an empty buffer, so the cursor
    /// advances past files that produced no output.
    pub fn release(&self, slot: u64, buf: Vec<u8>) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if !self.ordered {
            if !buf.is_empty() {
                Self::write(&mut inner, &buf, &self.broken);
            }
            return;
        }

        if slot == inner.next_slot {
            Self::write(&mut inner, &buf, &self.broken);
            inner.next_slot += 1;

            while let Some(deferred) = {
                let next = inner.next_slot;
                inner.parked.remove(&next)
            } {
                Self::write(&mut inner, &deferred, &self.broken);
                inner.next_slot += 1;
            }
        } else {
            inner.parked.insert(slot, buf);
        }
    }

    /// Write bytes that bypass slot ordering: the --format begin/end
    /// sections and the stats report.
    pub fn write_direct(&self, bytes: &[u8]) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, bytes, &self.broken);
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let _ = inner.out.flush();
    }

    fn write(inner: &mut SinkInner, bytes: &[u8], broken: &AtomicBool) {
        if bytes.is_empty() {
            return;
        }
        if inner.out.write_all(bytes).is_err() {
            broken.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn sink(ordered: bool) -> (Sink, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let broken = Arc::new(AtomicBool::new(false));
        (
            Sink::new(ordered, Box::new(Shared(Arc::clone(&out))), broken),
            out,
        )
    }

    #[test]
    fn ordered_release_sorts_slots() {
        let (sink, out) = sink(true);
        sink.release(2, b"c".to_vec());
        sink.release(0, b"a".to_vec());
        sink.release(1, b"b".to_vec());
        assert_eq!(&*out.lock().unwrap(), b"abc");
    }

    #[test]
    fn ordered_empty_slot_advances_cursor() {
        let (sink, out) = sink(true);
        sink.release(1, b"b".to_vec());
        sink.release(0, Vec::new());
        assert_eq!(&*out.lock().unwrap(), b"b");
    }

    #[test]
    fn unordered_flushes_immediately() {
        let (sink, out) = sink(false);
        sink.release(5, b"x".to_vec());
        sink.release(1, b"y".to_vec());
        assert_eq!(&*out.lock().unwrap(), b"xy");
    }

    #[test]
    fn hex_dump_rows_align() {
        let mut out = OutputBuffer::new(0);
        out.hex(5, b"abcdefghijklmnop");
        out.flush_hex();
        let text = String::from_utf8(out.buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000: "));
        assert!(lines[1].starts_with("00000010: "));
        // offset 5 pads the first five cells
        assert!(lines[0].contains("   61 62 63"));
        assert!(lines[0].ends_with("|     abcdefghijk|"));
    }

    #[test]
    fn hex_dump_continues_a_row_across_calls() {
        let mut out = OutputBuffer::new(0);
        out.hex(0, b"abc");
        out.hex(4, b"defgh");
        out.flush_hex();
        let text = String::from_utf8(out.buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // both dumps share one row under a single label
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("00000000: "));
        // the skipped byte at cell 3 stays blank
        assert!(lines[0].contains("61 62 63    64 65"));
        assert!(lines[0].ends_with("|abc defgh       |"));
    }

    #[test]
    fn hex_dump_flushes_before_other_output() {
        let mut out = OutputBuffer::new(0);
        out.hex(0, b"ab");
        out.str("tail");
        let text = String::from_utf8(out.buf).unwrap();
        assert!(text.starts_with("00000000: 61 62 "));
        assert!(text.ends_with("|ab              |\ntail"));
    }
}
