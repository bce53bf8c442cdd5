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

//! The decompression/archive demultiplexer.
//!
//! Each stage runs on its own producer thread: it identifies the
//! stream, unwraps single-file codecs in place and iterates archive
//! entries, piping one selected entry at a time to the consumer
//! through a bounded channel. Entries that are themselves compressed
//! or archives chain a child stage, bounded by --zmax, and partnames
//! join the chain with ':'. A consumer that drops a part's receiver
//! makes the producer drain and discard the rest of that entry
//! without aborting.

use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::decode::{self, parse_octal, Format};
use crate::plan::SearchPlan;
use crate::select::Selector;
use crate::stats::Stats;

const CHUNK: usize = 64 * 1024;
const PIPE_DEPTH: usize = 64;
const HEAD: usize = 4096;

/// One logical part of an opened file: the decoded file itself
/// (name None) or one archive entry (name = partname chain).
pub struct Part {
    pub name: Option<String>,
    pub chunks: Receiver<Vec<u8>>,
}

impl Part {
    /// Drain the part into memory for the search driver.
    pub fn collect(self) -> Vec<u8> {
        let mut data = Vec::new();
        for chunk in self.chunks.iter() {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

/// Read adapter over a chunk pipe, feeding a chained stage.
pub struct ChanReader {
    rx: Receiver<Vec<u8>>,
    cur: Vec<u8>,
    pos: usize,
}

impl ChanReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> ChanReader {
        ChanReader {
            rx,
            cur: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChanReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.cur.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.cur = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.cur.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.cur[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Open `path` and run the stage pipeline on a producer thread,
/// returning the stream of selected parts.
pub fn demux(
    path: &Path,
    plan: Arc<SearchPlan>,
    selector: Arc<Selector>,
    stats: Arc<Stats>,
    cancel: Arc<AtomicBool>,
) -> Receiver<Part> {
    let (tx, rx) = bounded(1);
    let stage = Stage {
        plan,
        selector,
        stats,
        cancel,
        tx,
        container: path.display().to_string(),
    };
    let path = path.to_path_buf();

    std::thread::spawn(move || match std::fs::File::open(&path) {
        Ok(f) => stage.run(Box::new(f), None, 1),
        Err(e) => stage
            .stats
            .warn(&format!("cannot open {}: {}", path.display(), e)),
    });

    rx
}

/// Run a pipeline over an already-open stream (standard input).
pub fn demux_reader(
    reader: Box<dyn Read + Send>,
    label: &str,
    plan: Arc<SearchPlan>,
    selector: Arc<Selector>,
    stats: Arc<Stats>,
    cancel: Arc<AtomicBool>,
) -> Receiver<Part> {
    let (tx, rx) = bounded(1);
    let stage = Stage {
        plan,
        selector,
        stats,
        cancel,
        tx,
        container: label.to_string(),
    };

    std::thread::spawn(move || stage.run(reader, None, 1));

    rx
}

#[derive(Clone)]
struct Stage {
    plan: Arc<SearchPlan>,
    selector: Arc<Selector>,
    stats: Arc<Stats>,
    cancel: Arc<AtomicBool>,
    tx: Sender<Part>,
    /// Name of the container being decoded, for warnings.
    container: String,
}

impl Stage {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn run(&self, reader: Box<dyn Read + Send>, prefix: Option<String>, depth: usize) {
        let mut reader = reader;

        // unwrap chained single-stream codecs in place
        for _ in 0..10 {
            let (head, replay) = match decode::peek(reader, HEAD) {
                Ok(r) => r,
                Err(e) => {
                    self.warn_decompress(&e.to_string());
                    return;
                }
            };
            reader = replay;
            let fmt = decode::sniff(&head);

            if fmt.is_unsupported() {
                self.warn_decompress("unsupported compression format");
                return;
            }

            if fmt.is_codec() {
                reader = match decode::wrap(fmt, reader) {
                    Ok(r) => r,
                    Err(e) => {
                        self.warn_decompress(&e.to_string());
                        return;
                    }
                };
                continue;
            }

            let result = match fmt {
                Format::Tar => self.iterate_tar(&mut reader, prefix.as_deref(), depth),
                Format::CpioOdc => self.iterate_cpio(&mut reader, prefix.as_deref(), depth, false),
                Format::CpioNewc | Format::CpioCrc => {
                    self.iterate_cpio(&mut reader, prefix.as_deref(), depth, true)
                }
                Format::Zip => self.iterate_zip(&mut reader, prefix.as_deref(), depth),
                _ => self.stream_all(&mut reader, prefix.clone()),
            };

            if let Err(e) = result {
                self.warn_decompress(&e.to_string());
            }
            return;
        }

        self.warn_decompress("too many nested compression layers");
    }

    fn warn_decompress(&self, detail: &str) {
        self.stats
            .warn(&format!("cannot decompress {}: {}", self.container, detail));
    }

    /// Announce one part to the consumer; None when the consumer went away.
    fn emit_part(&self, name: Option<String>) -> Option<Sender<Vec<u8>>> {
        let (ctx, crx) = bounded(PIPE_DEPTH);
        self.tx.send(Part { name, chunks: crx }).ok()?;
        Some(ctx)
    }

    /// Pipe the whole remaining stream as a single part.
    fn stream_all(&self, reader: &mut dyn Read, name: Option<String>) -> io::Result<()> {
        let ctx = match self.emit_part(name) {
            Some(tx) => tx,
            None => return Ok(()),
        };

        let mut buf = vec![0u8; CHUNK];
        loop {
            if self.cancelled() {
                break;
            }
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if ctx.send(buf[..n].to_vec()).is_err() {
                drain(reader)?;
                break;
            }
        }
        Ok(())
    }

    /// Apply the on-disk selection rules to an archive entry name and
    /// its initial bytes.
    fn entry_selected(&self, name: &str, head: &[u8]) -> bool {
        let base = name.rsplit('/').next().unwrap_or(name);

        if !self.plan.select.hidden && base.starts_with('.') {
            return false;
        }

        let globs = &self.plan.select.globs;

        let mut excluded = None;
        for g in &globs.exclude {
            if g.matches(name, base, false) {
                excluded = Some(!g.negated);
            }
        }
        if excluded == Some(true)
            && !globs
                .include
                .iter()
                .any(|g| !g.negated && g.matches(name, base, false))
        {
            return false;
        }

        if self.plan.select.has_positive_filters() {
            let ext = base.rsplit('.').next().filter(|e| *e != base);
            let ext_ok = ext.map_or(false, |e| {
                self.plan.select.extensions.iter().any(|x| x == e)
            });
            let glob_ok = globs
                .include
                .iter()
                .any(|g| !g.negated && g.matches(name, base, false));
            if !ext_ok && !glob_ok {
                return false;
            }
        }

        self.selector.magic_accepts_bytes(head)
    }

    /// Ship one selected entry: chain a child stage when the body is
    /// itself compressed or an archive and nesting remains, otherwise
    /// pipe the bytes straight to the consumer.
    fn deliver(
        &self,
        entry_name: &str,
        prefix: Option<&str>,
        depth: usize,
        body: &mut dyn Read,
    ) -> io::Result<()> {
        let joined = match prefix {
            Some(p) => format!("{}:{}", p, entry_name),
            None => entry_name.to_string(),
        };

        let head = read_head(body, HEAD)?;

        if !self.entry_selected(entry_name, &head) {
            return drain(body);
        }

        let inner = decode::sniff(&head);
        if depth < self.plan.zmax && (inner.is_codec() || inner.is_archive()) {
            // chain the next stage; this thread feeds its pipe
            let (ptx, prx) = bounded::<Vec<u8>>(PIPE_DEPTH);
            let child = Stage {
                container: format!("{}:{}", self.container, entry_name),
                ..self.clone()
            };
            let handle = std::thread::spawn(move || {
                child.run(Box::new(ChanReader::new(prx)), Some(joined), depth + 1)
            });

            let mut fed = ptx.send(head).is_ok();
            let mut buf = vec![0u8; CHUNK];
            while fed {
                let n = body.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                fed = ptx.send(buf[..n].to_vec()).is_ok();
            }
            drop(ptx);
            let _ = handle.join();
            if !fed {
                drain(body)?;
            }
            return Ok(());
        }

        let ctx = match self.emit_part(Some(joined)) {
            Some(tx) => tx,
            None => return drain(body),
        };

        if ctx.send(head).is_err() {
            return drain(body);
        }

        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if ctx.send(buf[..n].to_vec()).is_err() {
                return drain(body);
            }
        }
        Ok(())
    }

    /// Iterate 512-byte tar headers: v7, ustar, gnu long names ('L')
    /// and pax extended headers ('x', with path= records).
    fn iterate_tar(&self, reader: &mut dyn Read, prefix: Option<&str>, depth: usize) -> io::Result<()> {
        let mut long_name: Option<String> = None;
        let mut pax_path: Option<String> = None;

        loop {
            if self.cancelled() {
                return Ok(());
            }

            let mut header = [0u8; 512];
            if !read_exact_or_eof(reader, &mut header)? {
                return Ok(());
            }
            if header.iter().all(|&b| b == 0) {
                return Ok(());
            }

            let size = parse_octal(&header[124..136]);
            let typeflag = header[156];

            let name = match pax_path.take().or_else(|| long_name.take()) {
                Some(n) => n,
                None => {
                    let mut n = cstr(&header[0..100]);
                    if &header[257..262] == b"ustar" {
                        let pre = cstr(&header[345..500]);
                        if !pre.is_empty() {
                            n = format!("{}/{}", pre, n);
                        }
                    }
                    n
                }
            };

            match typeflag {
                b'L' => {
                    let body = read_body(reader, size)?;
                    long_name = Some(cstr(&body));
                }
                b'x' | b'g' => {
                    let body = read_body(reader, size)?;
                    if typeflag == b'x' {
                        if let Some(path) = pax_record(&body, "path") {
                            pax_path = Some(path);
                        }
                    }
                }
                b'0' | 0 | b'7' => {
                    let mut body = LimitedRead::new(reader, size);
                    self.deliver(&name, prefix, depth, &mut body)?;
                    body.drain_rest()?;
                }
                _ => {
                    skip_body(reader, size)?;
                }
            }

            // bodies are padded to 512-byte blocks
            let pad = (512 - (size % 512) as usize) % 512;
            if pad > 0 {
                skip_exact(reader, pad as u64)?;
            }
        }
    }

    /// Iterate cpio entries: the 76-byte ASCII-octal odc header or the
    /// 110-byte ASCII-hex newc/crc header with 4-byte padding. The
    /// archive ends at the entry named TRAILER!!!.
    fn iterate_cpio(
        &self,
        reader: &mut dyn Read,
        prefix: Option<&str>,
        depth: usize,
        newc: bool,
    ) -> io::Result<()> {
        loop {
            if self.cancelled() {
                return Ok(());
            }

            let header_len = if newc { 110 } else { 76 };
            let mut header = vec![0u8; header_len];
            if !read_exact_or_eof(reader, &mut header)? {
                return Ok(());
            }

            let (mode, name_size, file_size) = if newc {
                if &header[..5] != b"07070" {
                    return Err(bad_data("bad cpio header"));
                }
                (
                    parse_hex(&header[14..22]),
                    parse_hex(&header[94..102]),
                    parse_hex(&header[54..62]),
                )
            } else {
                if &header[..6] != b"070707" {
                    return Err(bad_data("bad cpio header"));
                }
                (
                    parse_octal(&header[18..24]),
                    parse_octal(&header[59..65]),
                    parse_octal(&header[65..76]),
                )
            };

            let mut name_buf = vec![0u8; name_size as usize];
            if !read_exact_or_eof(reader, &mut name_buf)? {
                return Ok(());
            }
            let name = cstr(&name_buf);

            if newc {
                // header + name is padded to a multiple of 4
                let pad = (4 - ((header_len + name_size as usize) % 4)) % 4;
                skip_exact(reader, pad as u64)?;
            }

            if name == "TRAILER!!!" {
                return Ok(());
            }

            let regular = mode & 0o170000 == 0o100000;
            if regular {
                let mut body = LimitedRead::new(reader, file_size);
                self.deliver(&name, prefix, depth, &mut body)?;
                body.drain_rest()?;
            } else {
                skip_body(reader, file_size)?;
            }

            if newc {
                let pad = (4 - (file_size % 4) as usize) % 4;
                skip_exact(reader, pad as u64)?;
            }
        }
    }

    /// Zip needs random access for its central directory, so a nested
    /// zip stream is buffered in memory first.
    fn iterate_zip(&self, reader: &mut dyn Read, prefix: Option<&str>, depth: usize) -> io::Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut archive = zip::ZipArchive::new(io::Cursor::new(data))
            .map_err(|e| bad_data(&e.to_string()))?;

        for i in 0..archive.len() {
            if self.cancelled() {
                return Ok(());
            }

            let mut entry = match archive.by_index(i) {
                Ok(e) => e,
                Err(e) => {
                    self.warn_decompress(&e.to_string());
                    continue;
                }
            };
            if !entry.is_file() {
                continue;
            }
            let name = entry.name().to_string();
            self.deliver(&name, prefix, depth, &mut entry)?;
        }
        Ok(())
    }
}

/// A Read over exactly `limit` bytes of the underlying stream.
struct LimitedRead<'a> {
    inner: &'a mut dyn Read,
    left: u64,
}

impl<'a> LimitedRead<'a> {
    fn new(inner: &'a mut dyn Read, limit: u64) -> LimitedRead<'a> {
        LimitedRead { inner, left: limit }
    }

    /// Consume whatever the entry's reader left behind.
    fn drain_rest(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        while self.left > 0 {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl Read for LimitedRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.left == 0 {
            return Ok(0);
        }
        let n = buf.len().min(self.left as usize);
        let got = self.inner.read(&mut buf[..n])?;
        if got == 0 && self.left > 0 {
            return Err(bad_data("truncated archive entry"));
        }
        self.left -= got as u64;
        Ok(got)
    }
}

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end])
        .trim_end_matches(['\n'])
        .to_string()
}

fn parse_hex(field: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in field {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => break,
        };
        v = v * 16 + d as u64;
    }
    v
}

/// Extract one `len key=value\n` record from a pax extended header.
fn pax_record(body: &[u8], key: &str) -> Option<String> {
    let mut i = 0;
    while i < body.len() {
        let rest = &body[i..];
        let sp = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..sp]).ok()?.parse().ok()?;
        if len == 0 || i + len > body.len() {
            return None;
        }
        let record = &body[i + sp + 1..i + len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(key.as_bytes()) {
            if let Some(value) = value.strip_prefix(b"=") {
                return Some(String::from_utf8_lossy(value).into_owned());
            }
        }
        i += len;
    }
    None
}

fn read_head(reader: &mut dyn Read, n: usize) -> io::Result<Vec<u8>> {
    let mut head = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(m) => filled += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    head.truncate(filled);
    Ok(head)
}

/// Read a full buffer, or report a clean EOF before the first byte.
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(bad_data("truncated archive header"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_body(reader: &mut dyn Read, size: u64) -> io::Result<Vec<u8>> {
    let mut body = vec![0u8; size as usize];
    if !read_exact_or_eof(reader, &mut body)? {
        return Err(bad_data("truncated archive entry"));
    }
    Ok(body)
}

fn skip_body(reader: &mut dyn Read, size: u64) -> io::Result<()> {
    skip_exact(reader, size)
}

fn skip_exact(reader: &mut dyn Read, mut n: u64) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    while n > 0 {
        let want = buf.len().min(n as usize);
        let got = reader.read(&mut buf[..want])?;
        if got == 0 {
            return Ok(());
        }
        n -= got as u64;
    }
    Ok(())
}

fn drain(reader: &mut dyn Read) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    while reader.read(&mut buf)? > 0 {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_header(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
        let mut h = [0u8; 512];
        h[..name.len()].copy_from_slice(name.as_bytes());
        let sz = format!("{:011o}\0", size);
        h[124..136].copy_from_slice(sz.as_bytes());
        h[156] = typeflag;
        h[257..262].copy_from_slice(b"ustar");
        h[263] = b'0';
        h[148..156].copy_from_slice(b"        ");
        let sum: u64 = h.iter().map(|&b| b as u64).sum();
        let cks = format!("{:06o}\0 ", sum);
        h[148..156].copy_from_slice(cks.as_bytes());
        h
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut t = Vec::new();
        for (name, body) in entries {
            t.extend_from_slice(&tar_header(name, body.len() as u64, b'0'));
            t.extend_from_slice(body);
            let pad = (512 - body.len() % 512) % 512;
            t.extend_from_slice(&vec![0u8; pad]);
        }
        t.extend_from_slice(&[0u8; 1024]);
        t
    }

    fn run_parts(data: Vec<u8>, zmax: usize) -> Vec<(Option<String>, Vec<u8>)> {
        let mut plan = crate::test_plan();
        plan.zmax = zmax;
        let plan = Arc::new(plan);
        let selector = Arc::new(Selector::new(&plan).unwrap());
        let stats = Arc::new(Stats::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let rx = demux_reader(
            Box::new(io::Cursor::new(data)),
            "test",
            plan,
            selector,
            stats,
            cancel,
        );

        rx.iter().map(|p| {
            let name = p.name.clone();
            (name, p.collect())
        }).collect()
    }

    #[test]
    fn tar_entries_become_parts() {
        let tar = tar_with(&[("x/a.txt", b"hit\n"), ("x/b.txt", b"miss\n")]);
        let parts = run_parts(tar, 1);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.as_deref(), Some("x/a.txt"));
        assert_eq!(parts[0].1, b"hit\n");
        assert_eq!(parts[1].0.as_deref(), Some("x/b.txt"));
        assert_eq!(parts[1].1, b"miss\n");
    }

    #[test]
    fn gnu_long_name() {
        let long = "very/long/".repeat(15) + "name.txt";
        let mut t = Vec::new();
        t.extend_from_slice(&tar_header("././@LongLink", long.len() as u64, b'L'));
        t.extend_from_slice(long.as_bytes());
        let pad = (512 - long.len() % 512) % 512;
        t.extend_from_slice(&vec![0u8; pad]);
        t.extend_from_slice(&tar_header("truncated", 2, b'0'));
        t.extend_from_slice(b"ok");
        t.extend_from_slice(&vec![0u8; 510]);
        t.extend_from_slice(&[0u8; 1024]);

        let parts = run_parts(t, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some(long.as_str()));
        assert_eq!(parts[0].1, b"ok");
    }

    #[test]
    fn pax_path_record() {
        let pax = b"25 path=pax/override.txt\n";
        let mut t = Vec::new();
        t.extend_from_slice(&tar_header("pax-header", pax.len() as u64, b'x'));
        t.extend_from_slice(pax);
        t.extend_from_slice(&vec![0u8; (512 - pax.len() % 512) % 512]);
        t.extend_from_slice(&tar_header("short-name", 4, b'0'));
        t.extend_from_slice(b"body");
        t.extend_from_slice(&vec![0u8; 508]);
        t.extend_from_slice(&[0u8; 1024]);

        let parts = run_parts(t, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some("pax/override.txt"));
        assert_eq!(parts[0].1, b"body");
    }

    #[test]
    fn gzip_tar_chains_in_one_stage() {
        let tar = tar_with(&[("inner.txt", b"content here")]);
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(&tar).unwrap();
        let gz = enc.finish().unwrap();

        let parts = run_parts(gz, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some("inner.txt"));
        assert_eq!(parts[0].1, b"content here");
    }

    #[test]
    fn nested_tar_needs_zmax() {
        let inner = tar_with(&[("deep.txt", b"deep")]);
        let outer = tar_with(&[("inner.tar", &inner)]);

        // zmax=1 delivers the nested archive as an opaque part
        let parts = run_parts(outer.clone(), 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some("inner.tar"));
        assert_eq!(parts[0].1, inner);

        // zmax=2 chains a stage and searches inside
        let parts = run_parts(outer, 2);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some("inner.tar:deep.txt"));
        assert_eq!(parts[0].1, b"deep");
    }

    #[test]
    fn cpio_newc_entries() {
        fn newc_entry(name: &str, body: &[u8]) -> Vec<u8> {
            let mut e = Vec::new();
            e.extend_from_slice(b"070701");
            let fields = [
                1u64,                 // ino
                0o100644,             // mode
                0,                    // uid
                0,                    // gid
                1,                    // nlink
                0,                    // mtime
                body.len() as u64,    // filesize
                0,
                0,
                0,
                0,
                (name.len() + 1) as u64, // namesize incl NUL
                0,
            ];
            for f in fields {
                e.extend_from_slice(format!("{:08x}", f).as_bytes());
            }
            e.extend_from_slice(name.as_bytes());
            e.push(0);
            while e.len() % 4 != 0 {
                e.push(0);
            }
            e.extend_from_slice(body);
            while e.len() % 4 != 0 {
                e.push(0);
            }
            e
        }

        let mut c = Vec::new();
        c.extend_from_slice(&newc_entry("a.txt", b"alpha"));
        c.extend_from_slice(&newc_entry("b.txt", b"beta"));
        c.extend_from_slice(&newc_entry("TRAILER!!!", b""));

        let parts = run_parts(c, 1);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.as_deref(), Some("a.txt"));
        assert_eq!(parts[0].1, b"alpha");
        assert_eq!(parts[1].0.as_deref(), Some("b.txt"));
        assert_eq!(parts[1].1, b"beta");
    }

    #[test]
    fn zip_entries() {
        let mut z = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let opts = zip::write::FileOptions::default();
        z.start_file("z/a.txt", opts).unwrap();
        z.write_all(b"zip body").unwrap();
        let data = z.finish().unwrap().into_inner();

        let parts = run_parts(data, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.as_deref(), Some("z/a.txt"));
        assert_eq!(parts[0].1, b"zip body");
    }

    #[test]
    fn plain_stream_is_one_unnamed_part() {
        let parts = run_parts(b"just text\n".to_vec(), 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, None);
        assert_eq!(parts[0].1, b"just text\n");
    }
}
