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

use assert_cmd::Command;
use predicates::prelude::*; // Used for writing assertions
use std::io::Write;

fn qgrep() -> Command {
    let mut cmd = Command::cargo_bin("qgrep").unwrap();
    cmd.arg("--color=never");
    cmd
}

fn write_file(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn simple_match() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"a\nfoo bar\nbaz\n");

    qgrep()
        .arg("foo")
        .arg(&file)
        .assert()
        .success()
        .stdout("foo bar\n");

    Ok(())
}

#[test]
fn no_match_exits_one() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"nothing here\n");

    qgrep()
        .arg("absent")
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());

    Ok(())
}

#[test]
fn count_with_invert() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"foo\nbar\nfoo\nbaz\n");

    qgrep()
        .arg("-c")
        .arg("-v")
        .arg("foo")
        .arg(&file)
        .assert()
        .success()
        .stdout("2\n");

    Ok(())
}

#[test]
fn boolean_and_query() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"foo bar\nfoo\nbar\nfoo baz bar\n");

    qgrep()
        .arg("-%")
        .arg("foo bar")
        .arg(&file)
        .assert()
        .success()
        .stdout("foo bar\nfoo baz bar\n");

    Ok(())
}

#[test]
fn files_mode_with_not() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    write_file(dir.path(), "f1.txt", b"foo\nbaz\n");
    write_file(dir.path(), "f2.txt", b"foo\nbar\n");

    qgrep()
        .arg("-l")
        .arg("--files")
        .arg("-%")
        .arg("foo -bar")
        .arg("--sort=name")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("f1.txt").and(predicate::str::contains("f2.txt").not()),
        );

    Ok(())
}

#[test]
fn context_lines() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"a\nb\nmid\nc\nd\n");

    qgrep()
        .arg("-A1")
        .arg("-B1")
        .arg("mid")
        .arg(&file)
        .assert()
        .success()
        .stdout("b\nmid\nc\n");

    // -C takes its count as a separate argument too
    qgrep()
        .arg("-C")
        .arg("1")
        .arg("mid")
        .arg(&file)
        .assert()
        .success()
        .stdout("b\nmid\nc\n");

    Ok(())
}

#[test]
fn archive_part_naming() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let mut tar = Vec::new();
    for (name, body) in [("x/a.txt", b"hit\n".as_slice()), ("x/b.txt", b"miss\n")] {
        tar.extend_from_slice(&tar_header(name, body.len() as u64));
        tar.extend_from_slice(body);
        tar.extend_from_slice(&vec![0u8; (512 - body.len() % 512) % 512]);
    }
    tar.extend_from_slice(&[0u8; 1024]);
    let archive = write_file(dir.path(), "archive.tar", &tar);

    qgrep()
        .arg("-z")
        .arg("-H")
        .arg("hit")
        .arg(&archive)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("archive.tar:x/a.txt:hit")
                .and(predicate::str::contains("b.txt").not()),
        );

    Ok(())
}

#[test]
fn gzip_search() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    enc.write_all(b"plain before\nneedle inside\n")?;
    let file = write_file(dir.path(), "data.gz", &enc.finish()?);

    qgrep()
        .arg("-z")
        .arg("needle")
        .arg(&file)
        .assert()
        .success()
        .stdout("needle inside\n");

    Ok(())
}

#[test]
fn recursive_with_exclude() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir(dir.path().join("sub"))?;
    write_file(dir.path(), "keep.txt", b"needle\n");
    write_file(&dir.path().join("sub"), "skip.log", b"needle\n");

    qgrep()
        .arg("-r")
        .arg("--exclude=*.log")
        .arg("--sort=name")
        .arg("needle")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("keep.txt").and(predicate::str::contains("skip.log").not()),
        );

    Ok(())
}

#[test]
fn max_files_bounds_output() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    write_file(dir.path(), "a.txt", b"needle\n");
    write_file(dir.path(), "b.txt", b"needle\n");
    write_file(dir.path(), "c.txt", b"needle\n");

    let out = qgrep()
        .arg("-l")
        .arg("--sort=name")
        .arg("-J1")
        .arg("--max-files=1")
        .arg("needle")
        .arg(dir.path())
        .assert()
        .success();

    let stdout = String::from_utf8(out.get_output().stdout.clone())?;
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.contains("a.txt"));

    Ok(())
}

#[test]
fn line_numbers_and_only_matching() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"one\ntwo foo\nfoo three\n");

    qgrep()
        .arg("-n")
        .arg("foo")
        .arg(&file)
        .assert()
        .success()
        .stdout("2:two foo\n3:foo three\n");

    qgrep()
        .arg("-o")
        .arg("fo+")
        .arg(&file)
        .assert()
        .success()
        .stdout("foo\nfoo\n");

    Ok(())
}

#[test]
fn stdin_search() -> Result<(), Box<dyn std::error::Error>> {
    qgrep()
        .arg("needle")
        .write_stdin("hay\nneedle here\n")
        .assert()
        .success()
        .stdout("needle here\n");

    Ok(())
}

#[test]
fn invalid_regex_fails_early() -> Result<(), Box<dyn std::error::Error>> {
    qgrep()
        .arg("(unclosed")
        .arg("/dev/null")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("regex"));

    Ok(())
}

#[test]
fn fixed_strings_literal() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"a.b\naxb\n");

    qgrep()
        .arg("-F")
        .arg("a.b")
        .arg(&file)
        .assert()
        .success()
        .stdout("a.b\n");

    Ok(())
}

#[test]
fn word_and_line_regexp() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"foobar\nfoo\nx foo bar\n");

    qgrep()
        .arg("-w")
        .arg("foo")
        .arg(&file)
        .assert()
        .success()
        .stdout("foo\nx foo bar\n");

    qgrep()
        .arg("-x")
        .arg("foo")
        .arg(&file)
        .assert()
        .success()
        .stdout("foo\n");

    Ok(())
}

#[test]
fn format_output() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "a.txt", b"alpha\nbeta\n");

    qgrep()
        .arg("--format=%n>%o%~")
        .arg("al|be")
        .arg(&file)
        .assert()
        .success()
        .stdout("1>al\n2>be\n");

    Ok(())
}

#[test]
fn binary_file_reported() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = write_file(dir.path(), "bin.dat", b"needle\x00data\n");

    qgrep()
        .arg("needle")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Binary file "));

    qgrep()
        .arg("-I")
        .arg("needle")
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());

    Ok(())
}

#[test]
fn ordered_output_with_sort() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    write_file(dir.path(), "b.txt", b"needle b\n");
    write_file(dir.path(), "a.txt", b"needle a\n");
    write_file(dir.path(), "c.txt", b"needle c\n");

    // slot-ordered release keeps multi-worker output in walk order
    qgrep()
        .arg("-h")
        .arg("--sort=name")
        .arg("-J4")
        .arg("needle")
        .arg(dir.path())
        .assert()
        .success()
        .stdout("needle a\nneedle b\nneedle c\n");

    Ok(())
}

fn tar_header(name: &str, size: u64) -> [u8; 512] {
    let mut h = [0u8; 512];
    h[..name.len()].copy_from_slice(name.as_bytes());
    let sz = format!("{:011o}\0", size);
    h[124..136].copy_from_slice(sz.as_bytes());
    h[156] = b'0';
    h[257..262].copy_from_slice(b"ustar");
    h[263] = b'0';
    h[148..156].copy_from_slice(b"        ");
    let sum: u64 = h.iter().map(|&b| b as u64).sum();
    let cks = format!("{:06o}\0 ", sum);
    h[148..156].copy_from_slice(cks.as_bytes());
    h
}
