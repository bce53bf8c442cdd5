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

//! Read-only consumption of per-directory index files for skip
//! acceleration.
//!
//! An index file is a 4-byte magic followed by one record per indexed
//! basename: name length (u16 LE), name bytes, one flags byte, the
//! log2 of the signature table size (u8) and the table itself, a Bloom
//! style bitmap of the hashes of all 1..4-byte windows of the file's
//! content. A file whose table lacks a window hash that every match of
//! the required pattern literal would need cannot match and is skipped
//! by the walker. The walker never writes index files.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

pub const INDEX_MAGIC: &[u8; 4] = b"QGX1";

/// Window hashes a matching file must contain, derived from a required
/// pattern literal.
pub struct IndexQuery {
    grams: Vec<u64>,
}

impl IndexQuery {
    /// Build a query from the pattern's required literals. Only literal
    /// patterns can seed the index; None disables index skipping.
    pub fn from_literals(literals: &[String]) -> Option<IndexQuery> {
        let mut grams = Vec::new();

        for lit in literals {
            let b = lit.as_bytes();
            if b.len() < 2 {
                // single bytes are too common to discriminate
                return None;
            }
            let w = b.len().min(4);
            for win in b.windows(w) {
                grams.push(hash_window(win));
            }
        }

        if grams.is_empty() {
            None
        } else {
            Some(IndexQuery { grams })
        }
    }

    /// True when the signature table may contain the pattern; false means
    /// the file provably has no match.
    pub fn may_match(&self, table: &[u8]) -> bool {
        if table.is_empty() {
            return true;
        }
        let bits = (table.len() * 8) as u64;
        self.grams.iter().all(|g| {
            let bit = g % bits;
            table[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }
}

/// FNV-1a over one window.
fn hash_window(win: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in win {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// The parsed index of one directory: basename to signature table.
pub struct DirIndex {
    tables: HashMap<String, Vec<u8>>,
}

impl DirIndex {
    /// Read a directory's index file. Errors and format mismatches yield
    /// None so the walker falls back to searching everything.
    pub fn read(path: &Path) -> Option<DirIndex> {
        let mut data = Vec::new();
        std::fs::File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .ok()?;

        if data.len() < 4 || &data[..4] != INDEX_MAGIC {
            return None;
        }

        let mut tables = HashMap::new();
        let mut i = 4;

        while i + 2 <= data.len() {
            let name_len = u16::from_le_bytes([data[i], data[i + 1]]) as usize;
            i += 2;
            if i + name_len + 2 > data.len() {
                return None;
            }
            let name = String::from_utf8_lossy(&data[i..i + name_len]).into_owned();
            i += name_len;

            let _flags = data[i];
            let log2 = data[i + 1];
            i += 2;
            if log2 > 24 {
                return None;
            }
            let table_len = 1usize << log2;
            if i + table_len > data.len() {
                return None;
            }
            tables.insert(name, data[i..i + table_len].to_vec());
            i += table_len;
        }

        Some(DirIndex { tables })
    }

    /// True when `name` is indexed and its signature rules out a match.
    pub fn skippable(&self, name: &str, query: &IndexQuery) -> bool {
        match self.tables.get(name) {
            Some(table) => !query.may_match(table),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn signature(content: &[u8], log2: u8) -> Vec<u8> {
        let mut table = vec![0u8; 1 << log2];
        let bits = (table.len() * 8) as u64;
        for w in 1..=4usize {
            for win in content.windows(w) {
                let bit = hash_window(win) % bits;
                table[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        table
    }

    fn write_index(path: &Path, entries: &[(&str, &[u8])]) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(INDEX_MAGIC).unwrap();
        for (name, content) in entries {
            let table = signature(content, 10);
            f.write_all(&(name.len() as u16).to_le_bytes()).unwrap();
            f.write_all(name.as_bytes()).unwrap();
            f.write_all(&[0u8, 10u8]).unwrap();
            f.write_all(&table).unwrap();
        }
    }

    #[test]
    fn skip_decision() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(".qgrep-index");
        write_index(
            &index,
            &[
                ("hit.txt", b"the needle is here"),
                ("miss.txt", b"nothing of note"),
            ],
        );

        let idx = DirIndex::read(&index).unwrap();
        let q = IndexQuery::from_literals(&["needle".to_string()]).unwrap();

        assert!(!idx.skippable("hit.txt", &q));
        assert!(idx.skippable("miss.txt", &q));
        // unknown names are never skipped
        assert!(!idx.skippable("other.txt", &q));
    }

    #[test]
    fn bad_magic_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index");
        std::fs::write(&index, b"XXXXgarbage").unwrap();
        assert!(DirIndex::read(&index).is_none());
    }

    #[test]
    fn short_literals_disable_skipping() {
        assert!(IndexQuery::from_literals(&["a".to_string()]).is_none());
        assert!(IndexQuery::from_literals(&[]).is_none());
    }
}
