//! E2E Integration tests for qmdfix
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

fn get_binary_path() -> PathBuf {
    if let Ok(bin_path) = std::env::var("CARGO_BIN_EXE_qmdfix") {
        let path = PathBuf::from(bin_path);
        if path.exists() {
            return path;
        }
    }

    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let release_path = PathBuf::from(manifest_dir).join("target/release/qmdfix");
    let debug_path = PathBuf::from(manifest_dir).join("target/debug/qmdfix");

    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        let custom_release = PathBuf::from(&target_dir).join("release/qmdfix");
        let custom_debug = PathBuf::from(&target_dir).join("debug/qmdfix");
        if custom_release.exists() {
            return custom_release;
        }
        if custom_debug.exists() {
            return custom_debug;
        }
    }

    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        panic!(
            "qmdfix binary not found. Run 'cargo build' or 'cargo build --release' first.\n\
             Looked in:\n  - {}\n  - {}",
            release_path.display(),
            debug_path.display()
        );
    }
}

/// Command with a sandboxed HOME so no user config leaks into tests
fn qmdfix_command(home: &Path) -> Command {
    let mut cmd = Command::new(get_binary_path());
    cmd.env("HOME", home).env("NO_COLOR", "1");
    cmd
}

fn run_qmdfix_stdin(input: &str, args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "qmdfix with args: {:?}", args);
    test_log!("INPUT", "Input length: {} bytes", input.len());

    let home = TempDir::new().unwrap();
    let mut child = qmdfix_command(home.path())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn qmdfix");

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .expect("Failed to write to stdin");
    }

    let output = child.wait_with_output().expect("Failed to wait on qmdfix");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

fn run_qmdfix_in(dir: &Path, args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "qmdfix in {} with args: {:?}", dir.display(), args);

    let output = qmdfix_command(dir)
        .current_dir(dir)
        .args(args)
        .output()
        .expect("Failed to run qmdfix");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);

    (stdout, stderr, code)
}

const MISALIGNED_DOC: &str = "# Chapter\n\nSome text.\n\n```\n┌───┐\n│ab│\n└──┘\n```\n";
const ALIGNED_DOC: &str = "# Chapter\n\nSome text.\n\n```\n┌──┐\n│ab│\n└──┘\n```\n";

fn write_book(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for (name, content) in files {
        let path = temp.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
    temp
}

// ============================================================================
// Boxes: stdin mode
// ============================================================================

#[test]
fn test_e2e_boxes_plain_scenario() {
    test_log!("START", "Plain box realignment over stdin");

    let (stdout, _stderr, code) = run_qmdfix_stdin(MISALIGNED_DOC, &["boxes"]);

    assert_eq!(code, 0, "Should exit successfully");
    assert_eq!(stdout, ALIGNED_DOC);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_boxes_labeled_separator() {
    let input = "```\n┌──────────┐\n│0123456789│\n├ Label ─┤\n│x│\n└──────────┘\n```\n";
    let expected =
        "```\n┌──────────┐\n│0123456789│\n├Label     ┤\n│x         │\n└──────────┘\n```\n";

    let (stdout, _stderr, code) = run_qmdfix_stdin(input, &["boxes"]);

    assert_eq!(code, 0);
    assert_eq!(stdout, expected);
}

#[test]
fn test_e2e_boxes_idempotent() {
    let (first, _stderr, _code) = run_qmdfix_stdin(MISALIGNED_DOC, &["boxes"]);
    let (second, _stderr, code) = run_qmdfix_stdin(&first, &["boxes"]);

    assert_eq!(code, 0);
    assert_eq!(first, second, "Second run should not change anything");
}

#[test]
fn test_e2e_boxes_passthrough_without_diagrams() {
    let input = "This is just plain text.\nNo diagrams here.\n";
    let (stdout, _stderr, code) = run_qmdfix_stdin(input, &["boxes"]);

    assert_eq!(code, 0);
    assert_eq!(stdout, input, "Should pass through unchanged");
}

#[test]
fn test_e2e_boxes_empty_input() {
    let (stdout, _stderr, code) = run_qmdfix_stdin("", &["boxes"]);

    assert_eq!(code, 0);
    assert!(stdout.is_empty());
}

#[test]
fn test_e2e_boxes_wide_char_warning() {
    test_log!("START", "Wide character warning");

    let input = "```\n┌─┐\n│あ│\n└─┘\n```\n";
    let (stdout, stderr, code) = run_qmdfix_stdin(input, &["boxes"]);

    assert_eq!(code, 0, "Warnings must not fail the run");
    assert_eq!(stdout, input, "Width math is unchanged by wide chars");
    assert!(
        stderr.contains("Full-width characters detected: あ"),
        "stderr was: {}",
        stderr
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_boxes_dry_run_exit_codes() {
    let (stdout, _stderr, code) = run_qmdfix_stdin(MISALIGNED_DOC, &["boxes", "--dry-run"]);
    assert_eq!(code, 3, "Dry run with pending changes exits 3");
    assert!(stdout.is_empty());

    let (_stdout, _stderr, code) = run_qmdfix_stdin(ALIGNED_DOC, &["boxes", "--dry-run"]);
    assert_eq!(code, 0, "Dry run without changes exits 0");
}

#[test]
fn test_e2e_boxes_diff() {
    let (stdout, _stderr, code) = run_qmdfix_stdin(MISALIGNED_DOC, &["boxes", "--diff"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("--- a/stdin"));
    assert!(stdout.contains("-┌───┐"));
    assert!(stdout.contains("+┌──┐"));
}

#[test]
fn test_e2e_boxes_json_stdin() {
    let (stdout, _stderr, code) = run_qmdfix_stdin(MISALIGNED_DOC, &["boxes", "--json"]);

    assert_eq!(code, 0);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(value["command"], "boxes");
    assert_eq!(value["processing"]["blocks_detected"], 1);
    assert_eq!(value["processing"]["blocks_modified"], 1);
    assert_eq!(value["output"]["changed"], true);
    assert_eq!(value["content"], ALIGNED_DOC);
}

#[test]
fn test_e2e_binary_input_is_parse_error() {
    let (_stdout, stderr, code) = run_qmdfix_stdin("abc\0def", &["boxes"]);

    assert_eq!(code, 4);
    assert!(stderr.contains("binary"));
}

// ============================================================================
// Boxes: file mode
// ============================================================================

#[test]
fn test_e2e_boxes_directory_in_place() {
    test_log!("START", "Directory rewrite in place");

    let book = write_book(&[
        ("intro.qmd", MISALIGNED_DOC),
        ("done.qmd", ALIGNED_DOC),
        ("notes.md", MISALIGNED_DOC),
        ("part/chapter.qmd", MISALIGNED_DOC),
    ]);

    let (stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "boxes", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd")).unwrap(),
        ALIGNED_DOC
    );
    assert_eq!(
        fs::read_to_string(book.path().join("notes.md")).unwrap(),
        MISALIGNED_DOC,
        "Files outside the glob are untouched"
    );
    assert_eq!(
        fs::read_to_string(book.path().join("part/chapter.qmd")).unwrap(),
        MISALIGNED_DOC,
        "Subdirectories need --recursive"
    );
    let combined = format!("{}{}", stdout, stderr);
    assert!(combined.contains("Fixed 1 file(s)"), "output: {}", combined);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_boxes_recursive() {
    let book = write_book(&[
        ("intro.qmd", MISALIGNED_DOC),
        ("part/chapter.qmd", MISALIGNED_DOC),
    ]);

    let (_stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "boxes", "-r", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(book.path().join("part/chapter.qmd")).unwrap(),
        ALIGNED_DOC
    );
}

#[test]
fn test_e2e_boxes_dry_run_leaves_files() {
    let book = write_book(&[("intro.qmd", MISALIGNED_DOC)]);

    let (_stdout, _stderr, code) =
        run_qmdfix_in(book.path(), &["--no-config", "boxes", "-n", "intro.qmd"]);

    assert_eq!(code, 3);
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd")).unwrap(),
        MISALIGNED_DOC
    );
}

#[test]
fn test_e2e_boxes_backup() {
    let book = write_book(&[("intro.qmd", MISALIGNED_DOC)]);

    let (_stdout, stderr, code) =
        run_qmdfix_in(book.path(), &["--no-config", "boxes", "--backup", "intro.qmd"]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd.bak")).unwrap(),
        MISALIGNED_DOC
    );
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd")).unwrap(),
        ALIGNED_DOC
    );
}

#[test]
fn test_e2e_boxes_json_files() {
    let book = write_book(&[("intro.qmd", MISALIGNED_DOC)]);

    let (stdout, _stderr, code) =
        run_qmdfix_in(book.path(), &["--no-config", "boxes", "--json", "-n", "intro.qmd"]);

    assert_eq!(code, 3);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(value["status"], "dry_run");
    assert_eq!(value["output"]["changed"], true);
    assert!(value.get("content").is_none());
}

#[test]
fn test_e2e_boxes_directory_dry_run_summary() {
    let book = write_book(&[("intro.qmd", MISALIGNED_DOC), ("done.qmd", ALIGNED_DOC)]);

    let (stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "boxes", "-n", "."]);

    assert_eq!(code, 3, "stderr: {}", stderr);
    let combined = format!("{}{}", stdout, stderr);
    assert!(combined.contains("Would fix 1 file(s)"), "output: {}", combined);
    assert!(combined.contains("Would fix ./intro.qmd") || combined.contains("Would fix intro.qmd"));
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd")).unwrap(),
        MISALIGNED_DOC
    );
}

#[test]
fn test_e2e_boxes_continues_after_bad_file() {
    test_log!("START", "One unreadable file among valid ones");

    let book = write_book(&[("good.qmd", MISALIGNED_DOC)]);
    fs::write(book.path().join("bad.qmd"), b"```\n\0\n```\n").unwrap();

    let (_stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "boxes", "."]);

    assert_eq!(code, 4, "Binary input anywhere in the run is a parse error");
    assert_eq!(
        fs::read_to_string(book.path().join("good.qmd")).unwrap(),
        ALIGNED_DOC,
        "Valid files are still fixed"
    );
    assert!(stderr.contains("Error processing"), "stderr: {}", stderr);
    assert!(stderr.contains("bad.qmd"), "stderr: {}", stderr);
    assert!(stderr.contains("1 file(s) had parse errors"), "stderr: {}", stderr);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_missing_path() {
    let temp = TempDir::new().unwrap();
    let (_stdout, stderr, code) = run_qmdfix_in(temp.path(), &["--no-config", "boxes", "missing"]);

    assert_eq!(code, 1);
    assert!(stderr.contains("Path not found"));
}

#[test]
fn test_e2e_config_file_glob() {
    let book = write_book(&[
        (".qmdfixrc", "glob = \"*.md\"\n"),
        ("notes.md", MISALIGNED_DOC),
        ("intro.qmd", MISALIGNED_DOC),
    ]);

    let (_stdout, stderr, code) = run_qmdfix_in(book.path(), &["boxes", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(book.path().join("notes.md")).unwrap(),
        ALIGNED_DOC
    );
    assert_eq!(
        fs::read_to_string(book.path().join("intro.qmd")).unwrap(),
        MISALIGNED_DOC
    );
}

// ============================================================================
// Spacing
// ============================================================================

#[test]
fn test_e2e_spacing_lists_and_quotes() {
    let input = "Intro:\n- a\n- b\nSaid:\n> quote\n";
    let (stdout, _stderr, code) = run_qmdfix_stdin(input, &["spacing"]);

    assert_eq!(code, 0);
    assert_eq!(stdout, "Intro:\n\n- a\n- b\nSaid:\n\n> quote\n");
}

#[test]
fn test_e2e_spacing_no_blockquotes() {
    let input = "Intro:\n1. a\nSaid:\n> quote\n";
    let (stdout, _stderr, code) = run_qmdfix_stdin(input, &["spacing", "--no-blockquotes"]);

    assert_eq!(code, 0);
    assert_eq!(stdout, "Intro:\n\n1. a\nSaid:\n> quote\n");
}

#[test]
fn test_e2e_spacing_in_place() {
    let book = write_book(&[("ch.qmd", "Text\n- item\n")]);

    let (_stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "spacing", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(
        fs::read_to_string(book.path().join("ch.qmd")).unwrap(),
        "Text\n\n- item\n"
    );
}

// ============================================================================
// Categories
// ============================================================================

fn category_book() -> TempDir {
    write_book(&[
        ("index.qmd", "categories: [Ignored]\n"),
        ("rust-book/index.qmd", "---\ncategories: [Rust, CLI]\n---\n"),
        ("testing/index.qmd", "---\ncategories: [CLI, Testing]\n---\n"),
        ("drafts/index.qmd", "---\ntitle: no categories\n---\n"),
    ])
}

#[test]
fn test_e2e_categories_report() {
    test_log!("START", "Category usage report");

    let book = category_book();
    let (stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "categories", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("Found 3 index.qmd file(s)"));
    assert!(stdout.contains("CATEGORY USAGE"));
    assert!(stdout.contains(&format!("{:<40} (2)", "CLI")));
    assert!(!stdout.contains("Ignored"), "Base index.qmd is not scanned");
    assert!(stdout.contains("Total unique categories: 3"));
    assert!(stdout.contains("Total category instances: 4"));

    let usage = &stdout[stdout.find("CATEGORY USAGE").unwrap()..];
    let cli = usage.find("CLI").unwrap();
    let rust = usage.find("Rust").unwrap();
    assert!(cli < rust, "Most used category comes first");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_categories_json() {
    let book = category_book();
    let (stdout, _stderr, code) =
        run_qmdfix_in(book.path(), &["--no-config", "categories", "--json"]);

    assert_eq!(code, 0);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(value["files_scanned"], 3);
    assert_eq!(value["total_instances"], 4);
    assert_eq!(value["usage"][0]["name"], "CLI");
    assert_eq!(value["usage"][0]["count"], 2);
}

#[test]
fn test_e2e_categories_skips_unreadable_index() {
    let book = write_book(&[("rust-book/index.qmd", "categories: [Rust, CLI]\n")]);
    fs::create_dir_all(book.path().join("broken")).unwrap();
    fs::write(
        book.path().join("broken/index.qmd"),
        b"categories: [Bad\xFF]\n",
    )
    .unwrap();

    let (stdout, stderr, code) = run_qmdfix_in(book.path(), &["--no-config", "categories", "."]);

    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stderr.contains("Warning: Could not read"), "stderr: {}", stderr);
    assert!(stderr.contains("broken"), "stderr: {}", stderr);
    assert!(stdout.contains("Total unique categories: 2"));
    assert!(stdout.contains("Total category instances: 2"));
    assert!(!stdout.contains("Bad"));
}

#[test]
fn test_e2e_categories_none_found() {
    let temp = TempDir::new().unwrap();
    let (stdout, _stderr, code) = run_qmdfix_in(temp.path(), &["--no-config", "categories"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("No index.qmd files found"));
}

#[test]
fn test_e2e_categories_missing_dir() {
    let temp = TempDir::new().unwrap();
    let (_stdout, stderr, code) =
        run_qmdfix_in(temp.path(), &["--no-config", "categories", "nope"]);

    assert_eq!(code, 1);
    assert!(stderr.contains("Directory not found"));
}

// ============================================================================
// CLI surface
// ============================================================================

#[test]
fn test_e2e_missing_subcommand() {
    let temp = TempDir::new().unwrap();
    let (_stdout, _stderr, code) = run_qmdfix_in(temp.path(), &[]);

    assert_eq!(code, 2);
}

#[test]
fn test_e2e_invalid_flag_combination() {
    let temp = TempDir::new().unwrap();
    let (_stdout, _stderr, code) =
        run_qmdfix_in(temp.path(), &["boxes", "--max-depth", "3", "."]);

    assert_eq!(code, 2);
}

#[test]
fn test_e2e_config_init_and_path() {
    let temp = TempDir::new().unwrap();

    let (_stdout, _stderr, code) = run_qmdfix_in(temp.path(), &["config", "path"]);
    assert_eq!(code, 1, "No config file yet");

    let (_stdout, _stderr, code) = run_qmdfix_in(temp.path(), &["config", "init"]);
    assert_eq!(code, 0);
    assert!(temp.path().join(".qmdfixrc").exists());

    let (stdout, _stderr, code) = run_qmdfix_in(temp.path(), &["config", "path"]);
    assert_eq!(code, 0);
    assert!(stdout.trim().ends_with(".qmdfixrc"));

    let (_stdout, stderr, code) = run_qmdfix_in(temp.path(), &["config", "init"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("already exists"));
}
