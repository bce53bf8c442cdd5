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

//! Compressed-stream format detection and codec wrapping.
//!
//! Formats are identified by magic bytes at known offsets; tar needs a
//! block of the stream buffered first. Formats without a decoder are
//! still detected so the demux can warn instead of searching garbage.

use std::io::{self, Cursor, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Lz4,
    Zip,
    SevenZ,
    Bzip3,
    Tar,
    CpioOdc,
    CpioNewc,
    CpioCrc,
    Plain,
}

impl Format {
    /// Single-stream codec with an available decoder.
    pub fn is_codec(self) -> bool {
        matches!(
            self,
            Format::Gzip | Format::Bzip2 | Format::Xz | Format::Zstd | Format::Lz4
        )
    }

    /// Multi-entry container iterated by the demux.
    pub fn is_archive(self) -> bool {
        matches!(
            self,
            Format::Zip | Format::Tar | Format::CpioOdc | Format::CpioNewc | Format::CpioCrc
        )
    }

    /// Detected but not decodable; reported as "cannot decompress".
    pub fn is_unsupported(self) -> bool {
        matches!(self, Format::SevenZ | Format::Bzip3)
    }
}

/// Identify the stream from its buffered head.
pub fn sniff(head: &[u8]) -> Format {
    if head.starts_with(&[0x1f, 0x8b]) {
        return Format::Gzip;
    }
    if head.starts_with(b"BZh") {
        return Format::Bzip2;
    }
    if head.starts_with(b"BZ3v1") {
        return Format::Bzip3;
    }
    if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        return Format::Xz;
    }
    if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        return Format::Zstd;
    }
    if head.starts_with(&[0x04, 0x22, 0x4d, 0x18]) {
        return Format::Lz4;
    }
    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        return Format::Zip;
    }
    if head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
        return Format::SevenZ;
    }
    if head.starts_with(b"070707") {
        return Format::CpioOdc;
    }
    if head.starts_with(b"070701") {
        return Format::CpioNewc;
    }
    if head.starts_with(b"070702") {
        return Format::CpioCrc;
    }
    if head.len() >= 512 && (&head[257..262] == b"ustar" || tar_checksum_ok(&head[..512])) {
        return Format::Tar;
    }
    Format::Plain
}

/// Validate a pre-POSIX tar header by its checksum field: the sum of
/// all header bytes with the checksum field read as spaces.
pub fn tar_checksum_ok(block: &[u8]) -> bool {
    if block.len() < 512 {
        return false;
    }
    let stored = parse_octal(&block[148..156]);
    if stored == 0 {
        return false;
    }
    let mut sum: u64 = 0;
    for (i, &b) in block[..512].iter().enumerate() {
        sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    sum == stored
}

/// Parse a tar numeric field: NUL/space padded octal, or base-256 when
/// the leading byte has the high bit set.
pub fn parse_octal(field: &[u8]) -> u64 {
    if let Some(&first) = field.first() {
        if first == 0x80 || first == 0xff {
            // base-256: big-endian binary in the remaining bytes
            let mut v: u64 = 0;
            for &b in &field[1..] {
                v = (v << 8) | b as u64;
            }
            return v;
        }
    }

    let mut v: u64 = 0;
    for &b in field {
        match b {
            b'0'..=b'7' => v = v * 8 + (b - b'0') as u64,
            b' ' | 0 => {
                if v > 0 {
                    break;
                }
            }
            _ => break,
        }
    }
    v
}

/// Wrap a reader in the decoder for `format`.
pub fn wrap(
    format: Format,
    reader: Box<dyn Read + Send>,
) -> io::Result<Box<dyn Read + Send>> {
    Ok(match format {
        Format::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        Format::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
        Format::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        Format::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        Format::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        _ => reader,
    })
}

/// Read up to `n` bytes from the reader without losing them: returns
/// the head and a reader that replays it before the rest.
pub fn peek(
    mut reader: Box<dyn Read + Send>,
    n: usize,
) -> io::Result<(Vec<u8>, Box<dyn Read + Send>)> {
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

    let replay: Box<dyn Read + Send> = Box::new(Cursor::new(head.clone()).chain(reader));
    Ok((head, replay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sniff_magics() {
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08]), Format::Gzip);
        assert_eq!(sniff(b"BZh91AY"), Format::Bzip2);
        assert_eq!(sniff(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]), Format::Xz);
        assert_eq!(sniff(&[0x28, 0xb5, 0x2f, 0xfd, 0]), Format::Zstd);
        assert_eq!(sniff(&[0x04, 0x22, 0x4d, 0x18, 0]), Format::Lz4);
        assert_eq!(sniff(b"PK\x03\x04rest"), Format::Zip);
        assert_eq!(sniff(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]), Format::SevenZ);
        assert_eq!(sniff(b"070707rest"), Format::CpioOdc);
        assert_eq!(sniff(b"070701rest"), Format::CpioNewc);
        assert_eq!(sniff(b"hello world"), Format::Plain);
    }

    #[test]
    fn sniff_ustar() {
        let mut block = vec![0u8; 512];
        block[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff(&block), Format::Tar);
    }

    #[test]
    fn octal_fields() {
        assert_eq!(parse_octal(b"0000644\0"), 0o644);
        assert_eq!(parse_octal(b"00000001234 "), 0o1234);
        assert_eq!(parse_octal(b"        "), 0);

        // base-256 size
        let mut f = [0u8; 12];
        f[0] = 0x80;
        f[10] = 0x01;
        f[11] = 0x00;
        assert_eq!(parse_octal(&f), 256);
    }

    #[test]
    fn gzip_round_trip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(b"needle in a haystack").unwrap();
        let gz = enc.finish().unwrap();

        assert_eq!(sniff(&gz), Format::Gzip);

        let mut out = Vec::new();
        wrap(Format::Gzip, Box::new(Cursor::new(gz)))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"needle in a haystack");
    }

    #[test]
    fn peek_replays() {
        let data = b"0123456789".to_vec();
        let (head, mut rest) = peek(Box::new(Cursor::new(data)), 4).unwrap();
        assert_eq!(head, b"0123");
        let mut all = Vec::new();
        rest.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"0123456789");
    }
}
