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

//! The --format / --replace field interpreter.
//!
//! A FORMAT string is copied to the output with %-fields expanded:
//!
//! `%f` pathname, `%p` parent directory, `%z` archive partname,
//! `%n` line number, `%k` column, `%b` byte offset,
//! `%o`/`%O` match/line raw, `%c`/`%C` C quoted, `%j`/`%J` JSON,
//! `%v`/`%V` CSV, `%x`/`%X` XML, `%y`/`%Y` hex escaped, `%q`/`%Q`
//! shell quoted, `%1`..`%9` and `%[N]#` or `%[name]#` capture groups
//! (suffix `j`, `q`, `x`, `y` select the representation, `b`/`e` the
//! group's byte offsets), `%s` separator, `%t` tab, `%~` newline,
//! `%,` `%:` `%;` `%|` literal punctuation, `%%` percent,
//! `%[text]<` only before the first match of a file, `%[text]>` from
//! the second match on, `%[name]=`...`%=` an ANSI color span. A number
//! between `%` and `n`, `k` or `b` pads the field to that width.

use colored::control::SHOULD_COLORIZE;
use regex::bytes::Captures;

/// Everything a format expansion may refer to.
#[derive(Default)]
pub struct FormatContext<'a> {
    pub path: &'a str,
    pub part: Option<&'a str>,
    pub lineno: u64,
    pub columno: u64,
    pub offset: u64,
    /// The matching line, without its newline.
    pub line: &'a [u8],
    /// The matched bytes.
    pub matched: &'a [u8],
    pub captures: Option<&'a Captures<'a>>,
    /// 1-based ordinal of this match within the current file part.
    pub ordinal: u64,
    pub separator: &'a str,
}

/// Expand `spec` into `out`.
pub fn format(out: &mut Vec<u8>, spec: &str, ctx: &FormatContext) {
    let b = spec.as_bytes();
    let mut i = 0;

    while i < b.len() {
        if b[i] != b'%' {
            out.push(b[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= b.len() {
            out.push(b'%');
            break;
        }

        // optional field width
        let mut width = 0usize;
        let mut left = false;
        if b[i] == b'-' && i + 1 < b.len() && b[i + 1].is_ascii_digit() {
            left = true;
            i += 1;
        }
        while i < b.len() && b[i].is_ascii_digit() {
            width = width * 10 + (b[i] - b'0') as usize;
            i += 1;
        }
        if i >= b.len() {
            break;
        }

        // bracketed argument: %[arg]X
        let mut arg: Option<&str> = None;
        if b[i] == b'[' {
            if let Some(close) = spec[i..].find(']') {
                arg = Some(&spec[i + 1..i + close]);
                i += close + 1;
                if i >= b.len() {
                    break;
                }
            }
        }

        let field = b[i];
        i += 1;

        match field {
            b'f' => {
                out.extend_from_slice(ctx.path.as_bytes());
                if let Some(part) = ctx.part {
                    out.push(b':');
                    out.extend_from_slice(part.as_bytes());
                }
            }
            b'p' => {
                let parent = std::path::Path::new(ctx.path)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                out.extend_from_slice(parent.as_bytes());
            }
            b'z' => {
                if let Some(part) = ctx.part {
                    out.extend_from_slice(part.as_bytes());
                }
            }
            b'n' => pad_number(out, ctx.lineno, width, left),
            b'k' => pad_number(out, ctx.columno, width, left),
            b'b' => pad_number(out, ctx.offset, width, left),
            b'o' => out.extend_from_slice(ctx.matched),
            b'O' => out.extend_from_slice(ctx.line),
            b'c' => c_quote(out, ctx.matched),
            b'C' => c_quote(out, ctx.line),
            b'j' => json_escape(out, ctx.matched),
            b'J' => json_escape(out, ctx.line),
            b'v' => csv_quote(out, ctx.matched),
            b'V' => csv_quote(out, ctx.line),
            b'x' => xml_escape(out, ctx.matched),
            b'X' => xml_escape(out, ctx.line),
            b'y' => hex_escape(out, ctx.matched),
            b'Y' => hex_escape(out, ctx.line),
            b'q' => shell_quote(out, ctx.matched),
            b'Q' => shell_quote(out, ctx.line),
            b's' => out.extend_from_slice(ctx.separator.as_bytes()),
            b't' => out.push(b'\t'),
            b'~' => out.push(b'\n'),
            b',' => out.push(b','),
            b':' => out.push(b':'),
            b';' => out.push(b';'),
            b'|' => out.push(b'|'),
            b'%' => out.push(b'%'),
            b'1'..=b'9' => group(out, ctx, &(field - b'0').to_string(), b'#'),
            b'#' => {
                if let Some(name) = arg {
                    group(out, ctx, name, b'#');
                }
            }
            b'<' => {
                if ctx.ordinal <= 1 {
                    if let Some(text) = arg {
                        out.extend_from_slice(text.as_bytes());
                    }
                }
            }
            b'>' => {
                if ctx.ordinal > 1 {
                    if let Some(text) = arg {
                        out.extend_from_slice(text.as_bytes());
                    }
                }
            }
            b'=' => {
                if let Some(name) = arg {
                    if SHOULD_COLORIZE.should_colorize() {
                        out.extend_from_slice(color_code(name).as_bytes());
                    }
                } else if SHOULD_COLORIZE.should_colorize() {
                    out.extend_from_slice(b"\x1b[0m");
                }
            }
            rep @ (b'd' | b'e') => {
                if let Some(name) = arg {
                    group(out, ctx, name, rep);
                }
            }
            _ => {
                // unknown field, copy it through
                out.push(b'%');
                out.push(field);
            }
        }

    }
}

/// Expand one capture group by number or name; `rep` selects the
/// representation (`#` raw, `b` start offset, `e` end offset).
fn group(out: &mut Vec<u8>, ctx: &FormatContext, name: &str, rep: u8) {
    let caps = match ctx.captures {
        Some(c) => c,
        None => return,
    };

    // trailing representation letter in the name itself: "[2]q" style
    let (name, rep) = match name.as_bytes().last() {
        Some(&r @ (b'j' | b'q' | b'x' | b'y' | b'b' | b'e'))
            if name.len() > 1 && name[..name.len() - 1].chars().all(|c| c.is_ascii_digit()) =>
        {
            (&name[..name.len() - 1], r)
        }
        _ => (name, rep),
    };

    let m = match name.parse::<usize>() {
        Ok(n) => caps.get(n),
        Err(_) => caps.name(name),
    };
    let m = match m {
        Some(m) => m,
        None => return,
    };

    match rep {
        b'b' => out.extend_from_slice(m.start().to_string().as_bytes()),
        b'e' => out.extend_from_slice(m.end().to_string().as_bytes()),
        b'j' => json_escape(out, m.as_bytes()),
        b'q' => shell_quote(out, m.as_bytes()),
        b'x' => xml_escape(out, m.as_bytes()),
        b'y' => hex_escape(out, m.as_bytes()),
        _ => out.extend_from_slice(m.as_bytes()),
    }
}

fn pad_number(out: &mut Vec<u8>, n: u64, width: usize, left: bool) {
    let s = n.to_string();
    if s.len() >= width {
        out.extend_from_slice(s.as_bytes());
        return;
    }
    if left {
        out.extend_from_slice(s.as_bytes());
        out.resize(out.len() + width - s.len(), b' ');
    } else {
        out.resize(out.len() + width - s.len(), b' ');
        out.extend_from_slice(s.as_bytes());
    }
}

fn c_quote(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'"');
    for &c in data {
        match c {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x20..=0x7e => out.push(c),
            _ => out.extend_from_slice(format!("\\x{:02x}", c).as_bytes()),
        }
    }
    out.push(b'"');
}

fn json_escape(out: &mut Vec<u8>, data: &[u8]) {
    for &c in data {
        match c {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x00..=0x1f => out.extend_from_slice(format!("\\u{:04x}", c).as_bytes()),
            _ => out.push(c),
        }
    }
}

fn csv_quote(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'"');
    for &c in data {
        if c == b'"' {
            out.extend_from_slice(b"\"\"");
        } else {
            out.push(c);
        }
    }
    out.push(b'"');
}

fn xml_escape(out: &mut Vec<u8>, data: &[u8]) {
    for &c in data {
        match c {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            _ => out.push(c),
        }
    }
}

fn hex_escape(out: &mut Vec<u8>, data: &[u8]) {
    for &c in data {
        if (0x20..0x7f).contains(&c) && c != b'\\' {
            out.push(c);
        } else {
            out.extend_from_slice(format!("\\x{:02x}", c).as_bytes());
        }
    }
}

fn shell_quote(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'\'');
    for &c in data {
        if c == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(c);
        }
    }
    out.push(b'\'');
}

/// ANSI code for a named color field.
fn color_code(name: &str) -> &'static str {
    match name {
        "ms" | "mt" => "\x1b[1;31m",
        "mc" => "\x1b[31m",
        "fn" => "\x1b[35m",
        "ln" => "\x1b[32m",
        "cn" => "\x1b[32m",
        "bn" => "\x1b[32m",
        "se" => "\x1b[36m",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex;

    fn fmt(spec: &str, ctx: &FormatContext) -> String {
        let mut out = Vec::new();
        format(&mut out, spec, ctx);
        String::from_utf8(out).unwrap()
    }

    fn ctx<'a>() -> FormatContext<'a> {
        FormatContext {
            path: "dir/file.txt",
            part: None,
            lineno: 42,
            columno: 7,
            offset: 1234,
            line: b"the quick fox",
            matched: b"quick",
            captures: None,
            ordinal: 1,
            separator: ":",
        }
    }

    #[test]
    fn basic_fields() {
        let c = ctx();
        assert_eq!(fmt("%f:%n:%O%~", &c), "dir/file.txt:42:the quick fox\n");
        assert_eq!(fmt("%o at %b", &c), "quick at 1234");
        assert_eq!(fmt("%p", &c), "dir");
        assert_eq!(fmt("%%", &c), "%");
    }

    #[test]
    fn partname() {
        let mut c = ctx();
        c.part = Some("inner/a.txt");
        assert_eq!(fmt("%f", &c), "dir/file.txt:inner/a.txt");
        assert_eq!(fmt("%z", &c), "inner/a.txt");
    }

    #[test]
    fn width_padding() {
        let c = ctx();
        assert_eq!(fmt("%6n|", &c), "    42|");
        assert_eq!(fmt("%-6n|", &c), "42    |");
    }

    #[test]
    fn quoting() {
        let mut c = ctx();
        c.matched = b"a\"b\\c\n";
        assert_eq!(fmt("%c", &c), "\"a\\\"b\\\\c\\n\"");
        assert_eq!(fmt("%j", &c), "a\\\"b\\\\c\\n");
        assert_eq!(fmt("%q", &c), "'a\"b\\c\n'");
        c.matched = b"<a&b>";
        assert_eq!(fmt("%x", &c), "&lt;a&amp;b&gt;");
        c.matched = b"ab\x01";
        assert_eq!(fmt("%y", &c), "ab\\x01");
        c.matched = b"say \"hi\"";
        assert_eq!(fmt("%v", &c), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn capture_groups() {
        let re = Regex::new(r"(?P<word>\w+) (\w+)").unwrap();
        let hay = b"hello world";
        let caps = re.captures(hay).unwrap();
        let mut c = ctx();
        c.captures = Some(&caps);

        assert_eq!(fmt("%1-%2", &c), "hello-world");
        assert_eq!(fmt("%[word]#", &c), "hello");
        assert_eq!(fmt("%[2]#", &c), "world");
        assert_eq!(fmt("%[2q]#", &c), "'world'");
        assert_eq!(fmt("%[1]d %[1]e", &c), "hello 5");
    }

    #[test]
    fn group_offsets() {
        let re = Regex::new(r"(world)").unwrap();
        let hay = b"hello world";
        let caps = re.captures(hay).unwrap();
        let mut c = ctx();
        c.captures = Some(&caps);
        assert_eq!(fmt("%[1b]# %[1e]#", &c), "6 11");
    }

    #[test]
    fn conditionals() {
        let mut c = ctx();
        assert_eq!(fmt("%[first]<%o", &c), "firstquick");
        assert_eq!(fmt("%[again]>%o", &c), "quick");
        c.ordinal = 2;
        assert_eq!(fmt("%[first]<%o", &c), "quick");
        assert_eq!(fmt("%[again]>%o", &c), "againquick");
    }

    #[test]
    fn separators() {
        let c = ctx();
        assert_eq!(fmt("%s%,%:%;%|%t", &c), ":,:;|\t");
    }
}
