//! # qmdfix
//!
//! Maintenance tool for a directory of Quarto markdown (`.qmd`) book sources.
//!
//! ## Overview
//!
//! `qmdfix` bundles the small formatting passes a book repository needs
//! before review:
//!
//! - **`boxes`**: re-aligns Unicode box diagrams inside bare ```` ``` ````
//!   fences so that every border and content line has the same interior
//!   width.
//! - **`spacing`**: inserts the blank line markdown requires before a list
//!   or blockquote that directly follows a paragraph line.
//! - **`categories`**: aggregates the `categories: [...]` front-matter field
//!   of every `*/index.qmd` so inconsistent names stand out.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Input → Fence Scan → Qualifying Box Spans → Normalize Each Span → Output
//!                                                  ↓
//!                                    Measurement pass (target width)
//!                                    Rewrite pass (borders, labels, padding)
//! ```
//!
//! Every pass returns its result (new text, counts, warnings) as a value;
//! printing happens only in the driver.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (path not found, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: changes would be made |
//! | 4 | Parse error (invalid UTF-8 or binary input) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use regex::Regex;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use unicode_width::UnicodeWidthChar;

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (path not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Default)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Default file pattern for directory scans
const DEFAULT_GLOB: &str = "*.qmd";

/// Default backup extension
const DEFAULT_BACKUP_EXT: &str = ".bak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Formatting maintenance for Quarto book sources
#[derive(Parser, Debug)]
#[command(
    name = "qmdfix",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (path not found, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: changes would be made\n  4  Parse error (invalid UTF-8 or binary input)\n"
)]
struct Args {
    /// Path to config file (default: search for .qmdfixrc)
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config", global = true)]
    no_config: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Verbose output showing per-block detail and a summary
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Align box-drawing diagrams inside fenced code blocks
    Boxes {
        #[command(flatten)]
        fix: FixArgs,
    },
    /// Insert blank lines before lists and blockquotes
    Spacing {
        #[command(flatten)]
        fix: FixArgs,

        /// Only fix list spacing, leave blockquotes alone
        #[arg(long = "no-blockquotes")]
        no_blockquotes: bool,
    },
    /// Report `categories` usage across */index.qmd files
    Categories {
        /// Base directory (default: current directory)
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

impl Commands {
    fn fix_args(&self) -> Option<&FixArgs> {
        match self {
            Self::Boxes { fix } | Self::Spacing { fix, .. } => Some(fix),
            Self::Categories { .. } | Self::Config { .. } => None,
        }
    }

    /// First path named on the command line, used to anchor config discovery
    fn first_input(&self) -> Option<&Path> {
        match self {
            Self::Boxes { fix } | Self::Spacing { fix, .. } => {
                fix.inputs.first().map(PathBuf::as_path)
            }
            Self::Categories { dir, .. } => dir.as_deref(),
            Self::Config { .. } => None,
        }
    }
}

/// Options shared by the rewriting commands
#[derive(clap::Args, Debug, Clone)]
struct FixArgs {
    /// Files or directories to fix. Reads stdin and writes stdout if omitted.
    #[arg(value_name = "PATH")]
    inputs: Vec<PathBuf>,

    /// Descend into subdirectories
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Glob pattern(s) selecting files inside directories (comma-separated)
    #[arg(long, default_value = DEFAULT_GLOB)]
    glob: String,

    /// Do not respect .gitignore when scanning directories
    #[arg(long = "no-gitignore")]
    no_gitignore: bool,

    /// Maximum directory depth when recursing (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_depth: usize,

    /// Preview changes without modifying files (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Show unified diff of changes
    #[arg(short = 'd', long)]
    diff: bool,

    /// Create backup file before rewriting
    #[arg(long, conflicts_with = "dry_run")]
    backup: bool,

    /// Extension for backup files
    #[arg(long, default_value = DEFAULT_BACKUP_EXT, requires = "backup")]
    backup_ext: String,

    /// Output results as JSON for programmatic processing
    #[arg(long, conflicts_with = "diff")]
    json: bool,
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .qmdfixrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
struct Config {
    glob: String,
    recursive: bool,
    gitignore: bool,
    max_depth: usize,
    color: ColorMode,
    verbose: bool,
    dry_run: bool,
    diff: bool,
    json: bool,
    backup: bool,
    backup_ext: String,
    blockquotes: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        let fix = args.command.fix_args();
        let blockquotes = !matches!(
            args.command,
            Commands::Spacing {
                no_blockquotes: true,
                ..
            }
        );
        let json = match &args.command {
            Commands::Categories { json, .. } => *json,
            _ => fix.is_some_and(|f| f.json),
        };

        Self {
            glob: fix.map_or_else(|| DEFAULT_GLOB.to_string(), |f| f.glob.clone()),
            recursive: fix.is_some_and(|f| f.recursive),
            gitignore: !fix.is_some_and(|f| f.no_gitignore),
            max_depth: fix.map_or(0, |f| f.max_depth),
            color: args.color,
            verbose: args.verbose,
            dry_run: fix.is_some_and(|f| f.dry_run),
            diff: fix.is_some_and(|f| f.diff),
            json,
            backup: fix.is_some_and(|f| f.backup),
            backup_ext: fix.map_or_else(|| DEFAULT_BACKUP_EXT.to_string(), |f| f.backup_ext.clone()),
            blockquotes,
        }
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn block(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Print a statistics summary
fn print_stats_summary(
    stats: &Stats,
    files_processed: usize,
    files_changed: usize,
    errors: usize,
    console: &Console,
    styles: &VerboseStyle,
) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    if files_processed > 1 {
        console.print(&format!(
            "  {} {} processed, {} modified, {} unchanged",
            styles.stat_label("Files:"),
            files_processed,
            files_changed,
            files_processed.saturating_sub(files_changed)
        ));
    }

    if stats.blocks_found > 0 {
        console.print(&format!(
            "  {} {} found, {} realigned",
            styles.stat_label("Boxes:"),
            stats.blocks_found,
            stats.blocks_changed
        ));
    }

    if stats.blank_lines_inserted > 0 {
        console.print(&format!(
            "  {} {} blank line(s) inserted",
            styles.stat_label("Spacing:"),
            stats.blank_lines_inserted
        ));
    }

    if stats.warnings > 0 {
        console.print(&format!(
            "  {} {} wide-character warning(s)",
            styles.wrap("bold yellow", "Warnings:"),
            stats.warnings
        ));
    }

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms ({} lines)",
        styles.stat_label("Time:"),
        elapsed_ms,
        stats.total_lines
    ));

    if errors > 0 {
        console.print(&format!(
            "  {} {}",
            styles.wrap("bold red", "Errors:"),
            errors
        ));
    }

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => {
            let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
            let console = Console::builder()
                .force_terminal(true)
                .color_system(system)
                .build();
            (console, VerboseStyle::new(true))
        }
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
                let console = Console::builder()
                    .force_terminal(true)
                    .color_system(system)
                    .build();
                return (console, VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".qmdfixrc", ".qmdfixrc.toml", "qmdfixrc.toml"];

/// Configuration loaded from a .qmdfixrc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Glob patterns for directory scans
    glob: Option<String>,
    /// Enable recursive mode
    recursive: Option<bool>,
    /// Respect .gitignore
    gitignore: Option<bool>,
    /// Maximum directory depth
    max_depth: Option<usize>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Output as JSON
    json: Option<bool>,
    /// Create backup before rewriting
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
    /// Fix blockquote spacing in addition to list spacing
    blockquotes: Option<bool>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory config discovery starts from
fn config_search_dir(args: &Args) -> PathBuf {
    args.command
        .first_input()
        .and_then(|p| {
            if p.is_dir() {
                Some(p.to_path_buf())
            } else {
                p.parent().map(Path::to_path_buf)
            }
        })
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// Locate the config file that applies to this invocation, if any
fn resolve_config_path(args: &Args) -> Result<Option<PathBuf>> {
    if args.no_config {
        return Ok(None);
    }

    if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path.clone()));
    }

    Ok(find_config_file(&config_search_dir(args)))
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    let Some(path) = resolve_config_path(args)? else {
        return Ok(config);
    };
    let file_config = load_config_file(&path)?;
    merge_file_config(&mut config, file_config);
    Ok(config)
}

/// Apply file values wherever the CLI left the default in place
fn merge_file_config(config: &mut Config, file_config: FileConfig) {
    if config.glob == DEFAULT_GLOB {
        if let Some(g) = file_config.glob {
            config.glob = g;
        }
    }

    if !config.recursive {
        if let Some(r) = file_config.recursive {
            config.recursive = r;
        }
    }

    if config.gitignore {
        if let Some(gi) = file_config.gitignore {
            config.gitignore = gi;
        }
    }

    if config.max_depth == 0 {
        if let Some(d) = file_config.max_depth {
            config.max_depth = d;
        }
    }

    if config.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !config.verbose {
        if let Some(v) = file_config.verbose {
            config.verbose = v;
        }
    }

    // JSON cannot be combined with --diff
    if !config.json && !config.diff {
        if let Some(j) = file_config.json {
            config.json = j;
        }
    }

    if !config.backup && !config.dry_run {
        if let Some(b) = file_config.backup {
            config.backup = b;
        }
    }

    if config.backup_ext == DEFAULT_BACKUP_EXT {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }

    if config.blockquotes {
        if let Some(bq) = file_config.blockquotes {
            config.blockquotes = bq;
        }
    }
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .qmdfixrc - qmdfix configuration file

# File selection inside directories
# glob = "*.qmd"
# recursive = false
# gitignore = true
# max_depth = 0

# Output options
# verbose = false
# color = "auto"
# json = false

# Backup options
# backup = false
# backup_ext = ".bak"

# spacing: also insert blank lines before blockquotes
# blockquotes = true
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction, args: &Args) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".qmdfixrc")
            } else {
                PathBuf::from(".qmdfixrc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let config = create_config(args)?;

            eprintln!("Effective configuration:");
            eprintln!("  glob: {}", config.glob);
            eprintln!("  recursive: {}", config.recursive);
            eprintln!("  gitignore: {}", config.gitignore);
            eprintln!("  max_depth: {}", config.max_depth);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  json: {}", config.json);
            eprintln!("  backup: {}", config.backup);
            eprintln!("  backup_ext: {}", config.backup_ext);
            eprintln!("  blockquotes: {}", config.blockquotes);

            if let Some(path) = resolve_config_path(args)? {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => match resolve_config_path(args)? {
            Some(path) => {
                println!("{}", path.display());
                Ok(())
            }
            None => Err(anyhow::anyhow!("No config file found")),
        },
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if let Some(fix) = args.command.fix_args() {
        if fix.backup_ext.is_empty() {
            return Err(ArgError("--backup-ext must not be empty".to_string()).into());
        }

        if fix.max_depth > 0 && !fix.recursive {
            return Err(ArgError("--max-depth requires --recursive".to_string()).into());
        }
    }

    Ok(())
}

/// Statistics collected while fixing
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Number of qualifying box blocks found
    blocks_found: usize,
    /// Number of box blocks whose text changed
    blocks_changed: usize,
    /// Number of blank lines inserted by the spacing passes
    blank_lines_inserted: usize,
    /// Number of wide-character warnings raised
    warnings: usize,
    /// Total number of lines processed
    total_lines: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    /// Merge another Stats into this one (for aggregating across files)
    fn merge(&mut self, other: &Stats) {
        self.blocks_found += other.blocks_found;
        self.blocks_changed += other.blocks_changed;
        self.blank_lines_inserted += other.blank_lines_inserted;
        self.warnings += other.warnings;
        self.total_lines += other.total_lines;
        self.elapsed += other.elapsed;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput<'a> {
    version: &'static str,
    command: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    input: InputStats,
    processing: ProcessingStats,
    output: OutputStats,
    warnings: &'a [WideCharWarning],
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct InputStats {
    lines: usize,
    bytes: usize,
}

#[derive(Serialize)]
struct ProcessingStats {
    blocks_detected: usize,
    blocks_modified: usize,
    blank_lines_inserted: usize,
}

#[derive(Serialize)]
struct OutputStats {
    lines: usize,
    bytes: usize,
    changed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Display Width
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum number of offending characters reported per warning
const MAX_REPORTED_WIDE_CHARS: usize = 10;

/// Width of a fragment under the one-unit-per-character convention, plus
/// any characters that break that convention.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Measurement {
    /// Character count
    width: usize,
    /// Fullwidth/Wide characters found, capped at `MAX_REPORTED_WIDE_CHARS`
    wide_chars: Vec<char>,
}

impl Measurement {
    fn has_wide_chars(&self) -> bool {
        !self.wide_chars.is_empty()
    }
}

/// True for characters whose East Asian Width is Fullwidth or Wide.
///
/// `unicode-width` reports those as two terminal columns; Ambiguous
/// characters (box drawing included) stay at one. A handful of Wide
/// characters are combining or filler marks that render with zero columns,
/// so they are listed explicitly.
fn is_wide_char(c: char) -> bool {
    c.width() == Some(2) || is_zero_width_wide(c)
}

/// East Asian Width W characters that `unicode-width` reports as zero columns
fn is_zero_width_wide(c: char) -> bool {
    matches!(
        c,
        '\u{302A}'..='\u{302F}'
            | '\u{3099}'
            | '\u{309A}'
            | '\u{3164}'
            | '\u{16FE4}'
            | '\u{16FF0}'
            | '\u{16FF1}'
    )
}

/// Width of a fragment in diagram units: every character counts once.
///
/// This is deliberately not a terminal-cell width. Box diagrams are expected
/// to hold single-width text only; see [`measure`] for the check.
fn display_width(s: &str) -> usize {
    s.chars().count()
}

/// Measure a fragment and collect the wide characters it contains
fn measure(s: &str) -> Measurement {
    let wide_chars = s
        .chars()
        .filter(|&c| is_wide_char(c))
        .take(MAX_REPORTED_WIDE_CHARS)
        .collect();

    Measurement {
        width: display_width(s),
        wide_chars,
    }
}

/// Advisory diagnostic for a diagram line holding wide characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct WideCharWarning {
    /// 1-based line number (within the block, or the document once mapped)
    line: usize,
    /// Offending characters, at most `MAX_REPORTED_WIDE_CHARS`
    chars: String,
}

impl fmt::Display for WideCharWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Full-width characters detected: {} (line {})",
            self.chars, self.line
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Box Drawing Characters
// ─────────────────────────────────────────────────────────────────────────────

const TOP_LEFT: char = '┌';
const TOP_RIGHT: char = '┐';
const BOTTOM_LEFT: char = '└';
const BOTTOM_RIGHT: char = '┘';
const VERTICAL: char = '│';
const TEE_LEFT: char = '├';
const TEE_RIGHT: char = '┤';
const HORIZONTAL: char = '─';

/// Role of a single line inside a box diagram.
///
/// Classification only looks at the first and last characters, checked in
/// the order top, bottom, separator, content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxLine<'a> {
    /// `┌───┐`
    Top,
    /// `└───┘`
    Bottom,
    /// `├───┤` or `├ Label ┤`, carrying the interior
    Separator(&'a str),
    /// `│ text │`, carrying the interior
    Content(&'a str),
    /// Anything else, passed through untouched
    Other,
}

impl<'a> BoxLine<'a> {
    fn classify(line: &'a str) -> Self {
        if interior(line, TOP_LEFT, TOP_RIGHT).is_some() {
            Self::Top
        } else if interior(line, BOTTOM_LEFT, BOTTOM_RIGHT).is_some() {
            Self::Bottom
        } else if let Some(inner) = interior(line, TEE_LEFT, TEE_RIGHT) {
            Self::Separator(inner)
        } else if let Some(inner) = interior(line, VERTICAL, VERTICAL) {
            Self::Content(inner)
        } else {
            Self::Other
        }
    }

    /// Interior text of lines that take part in width measurement
    fn measured_interior(self) -> Option<&'a str> {
        match self {
            Self::Separator(inner) | Self::Content(inner) => Some(inner),
            Self::Top | Self::Bottom | Self::Other => None,
        }
    }
}

/// Text between `left` and `right` when the line starts and ends with them.
///
/// A single `│` satisfies both ends at once and has an empty interior.
fn interior(line: &str, left: char, right: char) -> Option<&str> {
    let rest = line.strip_prefix(left)?;
    if !line.ends_with(right) {
        return None;
    }
    Some(rest.strip_suffix(right).unwrap_or(""))
}

fn border(left: char, right: char, width: usize) -> String {
    let mut line = String::with_capacity((width + 2) * HORIZONTAL.len_utf8());
    line.push(left);
    line.extend(std::iter::repeat_n(HORIZONTAL, width));
    line.push(right);
    line
}

/// Enclose text in border characters, right-padding it to `width`.
/// Text wider than `width` is never truncated.
fn enclose(left: char, text: &str, right: char, width: usize) -> String {
    let padding = width.saturating_sub(display_width(text));
    let mut line = String::with_capacity(text.len() + padding + 2 * left.len_utf8());
    line.push(left);
    line.push_str(text);
    line.extend(std::iter::repeat_n(' ', padding));
    line.push(right);
    line
}

// ─────────────────────────────────────────────────────────────────────────────
// Box Normalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Result of normalizing one box block
#[derive(Debug, Clone, PartialEq, Eq)]
struct NormalizedBox {
    /// Rewritten block, lines joined with `\n`
    text: String,
    /// Interior width every bordered line was rewritten to
    target_width: usize,
    /// Wide-character diagnostics, line numbers relative to the block
    warnings: Vec<WideCharWarning>,
}

/// Rewrite a box diagram so every bordered line has the same interior width.
///
/// The target width is the widest content or separator interior. Borders
/// are regenerated at that width, content lines and labels are right-padded
/// to it, and unrecognized lines are left alone. Running it on its own
/// output is a no-op.
fn normalize_box(block: &str) -> NormalizedBox {
    let lines: Vec<&str> = block.split('\n').collect();

    let mut target_width = 0;
    let mut warnings = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(inner) = BoxLine::classify(line).measured_interior() else {
            continue;
        };
        let measured = measure(inner);
        if measured.has_wide_chars() {
            warnings.push(WideCharWarning {
                line: idx + 1,
                chars: measured.wide_chars.iter().collect(),
            });
        }
        target_width = target_width.max(measured.width);
    }

    let text = lines
        .iter()
        .map(|line| rewrite_box_line(line, target_width))
        .collect::<Vec<_>>()
        .join("\n");

    NormalizedBox {
        text,
        target_width,
        warnings,
    }
}

fn rewrite_box_line(line: &str, width: usize) -> String {
    match BoxLine::classify(line) {
        BoxLine::Top => border(TOP_LEFT, TOP_RIGHT, width),
        BoxLine::Bottom => border(BOTTOM_LEFT, BOTTOM_RIGHT, width),
        BoxLine::Separator(inner) => {
            let stripped: String = inner.chars().filter(|&c| c != HORIZONTAL).collect();
            let label = stripped.trim();
            if label.is_empty() {
                border(TEE_LEFT, TEE_RIGHT, width)
            } else {
                enclose(TEE_LEFT, label, TEE_RIGHT, width)
            }
        }
        BoxLine::Content(inner) => enclose(VERTICAL, inner, VERTICAL, width),
        BoxLine::Other => line.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Document Lines and Fences
// ─────────────────────────────────────────────────────────────────────────────

/// One document line split from its terminator (`\n`, `\r\n` or nothing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Line<'a> {
    body: &'a str,
    ending: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    text.split_inclusive('\n')
        .map(|raw| {
            let body_len = if raw.ends_with("\r\n") {
                raw.len() - 2
            } else if raw.ends_with('\n') {
                raw.len() - 1
            } else {
                raw.len()
            };
            let (body, ending) = raw.split_at(body_len);
            Line { body, ending }
        })
        .collect()
}

fn join_lines<'a>(lines: impl IntoIterator<Item = Line<'a>>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.body);
        out.push_str(line.ending);
    }
    out
}

/// A fenced code region, as line indices into the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FencedSpan {
    /// Index of the opening fence line
    open: usize,
    /// Index of the closing fence line, `None` when the fence runs to EOF
    close: Option<usize>,
}

impl FencedSpan {
    /// Index range of the lines between the fences
    fn interior(&self, total: usize) -> std::ops::Range<usize> {
        self.open + 1..self.close.unwrap_or(total)
    }
}

/// Opening fence marker: the fence character and run length
fn fence_marker(body: &str) -> Option<(char, usize)> {
    let trimmed = body.trim_start();
    let fence_char = trimmed.chars().next().filter(|&c| matches!(c, '`' | '~'))?;
    let run = trimmed.chars().take_while(|&c| c == fence_char).count();
    // Backtick fences cannot carry a backtick in the info string; such a
    // line is inline code
    let info = &trimmed[run * fence_char.len_utf8()..];
    if fence_char == '`' && info.contains('`') {
        return None;
    }
    (run >= 3).then_some((fence_char, run))
}

fn closes_fence(body: &str, fence_char: char, run: usize) -> bool {
    let trimmed = body.trim();
    trimmed.chars().count() >= run && trimmed.chars().all(|c| c == fence_char)
}

/// Locate every fenced code region in document order
fn find_fenced_spans(lines: &[Line<'_>]) -> Vec<FencedSpan> {
    let mut spans = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some((fence_char, run)) = fence_marker(lines[i].body) else {
            i += 1;
            continue;
        };

        let open = i;
        let close = (open + 1..lines.len()).find(|&j| closes_fence(lines[j].body, fence_char, run));
        spans.push(FencedSpan { open, close });

        i = match close {
            Some(c) => c + 1,
            None => lines.len(),
        };
    }

    spans
}

/// Whether a fenced region holds a box diagram the normalizer should touch.
///
/// The opening fence must be a bare ```` ``` ````, the first interior line a
/// top border, the last a bottom border made only of `─`/`┘`, and at least
/// one line must carry a `│`.
fn is_box_span(lines: &[Line<'_>], span: &FencedSpan) -> bool {
    if lines[span.open].body != "```" || span.close.is_none() {
        return false;
    }

    let interior = &lines[span.interior(lines.len())];
    let (Some(first), Some(last)) = (interior.first(), interior.last()) else {
        return false;
    };

    let top_ok = first
        .body
        .strip_prefix(TOP_LEFT)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c == HORIZONTAL || c == TOP_RIGHT);

    let bottom_ok = last.body.strip_prefix(BOTTOM_LEFT).is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c == HORIZONTAL || c == BOTTOM_RIGHT)
    });

    top_ok && bottom_ok && interior.iter().any(|l| l.body.contains(VERTICAL))
}

// ─────────────────────────────────────────────────────────────────────────────
// Box Fixing (Document Level)
// ─────────────────────────────────────────────────────────────────────────────

/// Per-block detail reported in verbose mode
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockReport {
    /// 1-based document line of the first diagram line
    line: usize,
    /// Number of diagram lines
    height: usize,
    target_width: usize,
    changed: bool,
}

/// Result of fixing all box blocks in a document
#[derive(Debug, Clone, PartialEq, Eq)]
struct BoxScan {
    content: String,
    blocks: Vec<BlockReport>,
    /// Diagnostics with document line numbers
    warnings: Vec<WideCharWarning>,
}

impl BoxScan {
    fn blocks_changed(&self) -> usize {
        self.blocks.iter().filter(|b| b.changed).count()
    }
}

/// Find every qualifying box block in a document and normalize it in place.
///
/// Text outside the blocks, fence lines and line terminators are kept
/// byte for byte.
fn fix_box_drawings(text: &str) -> BoxScan {
    let lines = split_lines(text);
    let spans = find_fenced_spans(&lines);

    let mut rewritten: Vec<String> = lines.iter().map(|l| l.body.to_string()).collect();
    let mut blocks = Vec::new();
    let mut warnings = Vec::new();

    for span in spans.iter().filter(|s| is_box_span(&lines, s)) {
        let range = span.interior(lines.len());
        let original = lines[range.clone()]
            .iter()
            .map(|l| l.body)
            .collect::<Vec<_>>()
            .join("\n");

        let normalized = normalize_box(&original);
        let changed = normalized.text != original;

        warnings.extend(normalized.warnings.into_iter().map(|w| WideCharWarning {
            line: range.start + w.line,
            chars: w.chars,
        }));

        for (slot, new_body) in rewritten[range.clone()]
            .iter_mut()
            .zip(normalized.text.split('\n'))
        {
            *slot = new_body.to_string();
        }

        blocks.push(BlockReport {
            line: range.start + 1,
            height: range.len(),
            target_width: normalized.target_width,
            changed,
        });
    }

    let content = join_lines(rewritten.iter().zip(&lines).map(|(body, line)| Line {
        body: body.as_str(),
        ending: line.ending,
    }));

    BoxScan {
        content,
        blocks,
        warnings,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// List and Blockquote Spacing
// ─────────────────────────────────────────────────────────────────────────────

/// A line that is itself a list item, possibly indented
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+\.) ").expect("valid list item pattern"));

/// A list marker at column 0
static LIST_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+\.) ").expect("valid list start pattern"));

/// A blockquote line, possibly indented
static BLOCKQUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*>").expect("valid blockquote pattern"));

/// Result of the spacing passes over one document
#[derive(Debug, Clone, PartialEq, Eq)]
struct SpacingFix {
    content: String,
    /// Blank lines inserted before list items
    lists: usize,
    /// Blank lines inserted before blockquotes
    blockquotes: usize,
}

impl SpacingFix {
    fn inserted(&self) -> usize {
        self.lists + self.blockquotes
    }
}

fn needs_blank_before_list(prev: &str, next: &str) -> bool {
    !prev.trim().is_empty() && !LIST_ITEM_RE.is_match(prev) && LIST_START_RE.is_match(next)
}

/// The preceding line must end in a visible character, so a trailing-space
/// hard break (or an empty `- ` item) keeps the quote attached.
fn needs_blank_before_blockquote(prev: &str, next: &str) -> bool {
    prev.ends_with(|c: char| !c.is_whitespace())
        && !BLOCKQUOTE_RE.is_match(prev)
        && BLOCKQUOTE_RE.is_match(next)
}

/// Insert an empty line between every adjacent pair matching `needs_blank`.
///
/// Pairs touching the inside of a fenced code block are skipped. Returns the
/// new text and the number of lines inserted.
fn insert_blank_lines(text: &str, needs_blank: impl Fn(&str, &str) -> bool) -> (String, usize) {
    let lines = split_lines(text);
    let mut in_code = vec![false; lines.len()];
    for span in find_fenced_spans(&lines) {
        for idx in span.interior(lines.len()) {
            in_code[idx] = true;
        }
    }

    let mut out = Vec::with_capacity(lines.len());
    let mut inserted = 0;
    for (idx, line) in lines.iter().enumerate() {
        if idx > 0 && !in_code[idx - 1] && !in_code[idx] {
            let prev = lines[idx - 1];
            if needs_blank(prev.body, line.body) {
                out.push(Line {
                    body: "",
                    ending: prev.ending,
                });
                inserted += 1;
            }
        }
        out.push(*line);
    }

    (join_lines(out), inserted)
}

/// Make sure lists (and optionally blockquotes) are preceded by a blank line
fn fix_spacing(text: &str, blockquotes: bool) -> SpacingFix {
    let (content, lists) = insert_blank_lines(text, needs_blank_before_list);
    let (content, quotes) = if blockquotes {
        insert_blank_lines(&content, needs_blank_before_blockquote)
    } else {
        (content, 0)
    };

    SpacingFix {
        content,
        lists,
        blockquotes: quotes,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Category Aggregation
// ─────────────────────────────────────────────────────────────────────────────

/// Name of the per-chapter front-matter file the report reads
const INDEX_FILENAME: &str = "index.qmd";

static CATEGORIES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^categories:\s*\[(.*?)\]").expect("valid categories pattern")
});

/// Categories listed in the first `categories: [...]` line of a document
fn extract_categories(content: &str) -> Vec<String> {
    CATEGORIES_RE
        .captures(content)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CategoryCount {
    name: String,
    count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FileCategories {
    /// Path relative to the base directory
    file: String,
    categories: Vec<String>,
}

/// Aggregated category usage across a book repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct CategoryReport {
    files_scanned: usize,
    /// Most used first; ties keep first-seen order
    usage: Vec<CategoryCount>,
    by_file: Vec<FileCategories>,
    total_instances: usize,
}

impl CategoryReport {
    fn unique(&self) -> usize {
        self.usage.len()
    }
}

/// Build the report from `(relative path, file content)` pairs in path order
fn build_category_report<'a>(
    files: impl IntoIterator<Item = (String, &'a str)>,
) -> CategoryReport {
    let mut report = CategoryReport::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (file, content) in files {
        report.files_scanned += 1;
        let categories = extract_categories(content);
        if categories.is_empty() {
            continue;
        }

        for name in &categories {
            match index.get(name) {
                Some(&pos) => report.usage[pos].count += 1,
                None => {
                    index.insert(name.clone(), report.usage.len());
                    report.usage.push(CategoryCount {
                        name: name.clone(),
                        count: 1,
                    });
                }
            }
        }
        report.total_instances += categories.len();
        report.by_file.push(FileCategories { file, categories });
    }

    // Stable sort keeps first-seen order among equal counts
    report.usage.sort_by(|a, b| b.count.cmp(&a.count));
    report
}

/// Every `index.qmd` below `base` (not `base/index.qmd` itself), sorted
fn discover_index_files(base: &Path, config: &Config) -> Vec<PathBuf> {
    let mut walker = WalkBuilder::new(base);
    walker.git_ignore(config.gitignore);
    walker.git_exclude(config.gitignore);
    walker.git_global(config.gitignore);
    walker.ignore(config.gitignore);
    walker.hidden(false);

    let mut files: Vec<PathBuf> = walker
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.depth() >= 2)
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter(|entry| entry.file_name() == INDEX_FILENAME)
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn run_categories(
    dir: Option<&Path>,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    let base = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };

    if !base.is_dir() {
        anyhow::bail!("Directory not found: {}", base.display());
    }

    let index_files = discover_index_files(&base, config);
    if index_files.is_empty() && !config.json {
        println!("No {} files found in {}", INDEX_FILENAME, base.display());
        return Ok(RunOutcome::default());
    }

    let mut contents = Vec::with_capacity(index_files.len());
    for path in &index_files {
        match read_text(path) {
            Ok(content) => {
                let rel = path.strip_prefix(&base).unwrap_or(path);
                contents.push((rel.display().to_string(), content));
            }
            Err(err) => eprintln!("Warning: Could not read {}: {:#}", path.display(), err),
        }
    }

    if config.verbose {
        console.print(&styles.dim(format!(
            "Scanned {} of {} {} file(s)",
            contents.len(),
            index_files.len(),
            INDEX_FILENAME
        )));
    }

    let report = build_category_report(contents.iter().map(|(f, c)| (f.clone(), c.as_str())));

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize JSON output")?
        );
        return Ok(RunOutcome::default());
    }

    let mut stdout = io::stdout().lock();
    writeln!(
        stdout,
        "Found {} {} file(s) in {}\n",
        index_files.len(),
        INDEX_FILENAME,
        base.display()
    )?;

    if report.usage.is_empty() {
        writeln!(stdout, "No categories found in any {} files", INDEX_FILENAME)?;
        return Ok(RunOutcome::default());
    }

    write_category_report(&mut stdout, &report)?;
    Ok(RunOutcome::default())
}

fn write_category_report(out: &mut impl Write, report: &CategoryReport) -> io::Result<()> {
    let rule = "=".repeat(60);

    writeln!(out, "{}", rule)?;
    writeln!(out, "CATEGORY USAGE")?;
    writeln!(out, "{}", rule)?;
    for entry in &report.usage {
        writeln!(out, "{:<40} ({})", entry.name, entry.count)?;
    }

    writeln!(out, "\n{}", rule)?;
    writeln!(out, "CATEGORIES BY FILE")?;
    writeln!(out, "{}", rule)?;
    for file in &report.by_file {
        writeln!(out, "\n{}:", file.file)?;
        for category in &file.categories {
            writeln!(out, "  - {}", category)?;
        }
    }

    writeln!(out, "\n{}", rule)?;
    writeln!(out, "Total unique categories: {}", report.unique())?;
    writeln!(out, "Total category instances: {}", report.total_instances)?;
    writeln!(out, "{}", rule)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// File Discovery
// ─────────────────────────────────────────────────────────────────────────────

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    builder
        .build()
        .map_err(|err| ArgError(format!("Invalid glob set: {}", err)).into())
}

/// Expand the given paths into the sorted set of files to fix.
///
/// Files are taken as-is. Directories contribute their matching entries,
/// only the top level unless recursion is enabled.
fn discover_files(
    paths: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<Vec<PathBuf>> {
    let globs = build_globset(&config.glob)?;
    let mut files = BTreeSet::new();

    for path in paths {
        if path.is_file() {
            files.insert(path.clone());
            continue;
        }

        if !path.is_dir() {
            anyhow::bail!("Path not found: {}", path.display());
        }

        let mut walker = WalkBuilder::new(path);
        walker.git_ignore(config.gitignore);
        walker.git_exclude(config.gitignore);
        walker.git_global(config.gitignore);
        walker.ignore(config.gitignore);
        walker.hidden(false);

        if !config.recursive {
            walker.max_depth(Some(1));
        } else if config.max_depth > 0 {
            walker.max_depth(Some(config.max_depth));
        }

        for entry in walker.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if config.verbose {
                        console.print(&styles.dim(format!("Warning: {}", err)));
                    }
                    continue;
                }
            };

            let entry_path = entry.path();
            if entry_path.is_file() {
                if let Some(name) = entry_path.file_name() {
                    if globs.is_match(name) {
                        files.insert(entry_path.to_path_buf());
                    }
                }
            }
        }
    }

    Ok(files.into_iter().collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Input / Output
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a backup of the file by appending the extension to the filename.
/// For example: "intro.qmd" with extension ".bak" becomes "intro.qmd.bak"
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read a whole text file
fn read_text(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let source_label = path.display().to_string();
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    parse_bytes_to_text(bytes, &source_label)
}

/// Read all of stdin
fn read_stdin_text() -> Result<String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("Failed to read stdin")?;
    parse_bytes_to_text(buf, "stdin")
}

/// Convert raw bytes to text, checking for binary content and valid UTF-8
fn parse_bytes_to_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Fix Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Which rewrite a fix run applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixKind {
    Boxes,
    Spacing { blockquotes: bool },
}

impl FixKind {
    fn command_name(self) -> &'static str {
        match self {
            Self::Boxes => "boxes",
            Self::Spacing { .. } => "spacing",
        }
    }
}

/// Result of processing a single file or stdin
struct FileResult {
    filename: String,
    original: String,
    corrected: String,
    stats: Stats,
    blocks: Vec<BlockReport>,
    warnings: Vec<WideCharWarning>,
    would_change: bool,
}

/// Run one fix over a document's text
fn process_input(text: String, filename: String, kind: FixKind) -> FileResult {
    let start_time = Instant::now();
    let mut stats = Stats {
        total_lines: text.lines().count(),
        ..Stats::default()
    };

    let (corrected, blocks, warnings) = match kind {
        FixKind::Boxes => {
            let scan = fix_box_drawings(&text);
            stats.blocks_found = scan.blocks.len();
            stats.blocks_changed = scan.blocks_changed();
            (scan.content, scan.blocks, scan.warnings)
        }
        FixKind::Spacing { blockquotes } => {
            let fix = fix_spacing(&text, blockquotes);
            stats.blank_lines_inserted = fix.inserted();
            (fix.content, Vec::new(), Vec::new())
        }
    };

    stats.warnings = warnings.len();
    stats.elapsed = start_time.elapsed();
    let would_change = corrected != text;

    FileResult {
        filename,
        original: text,
        corrected,
        stats,
        blocks,
        warnings,
        would_change,
    }
}

/// Wide-character warnings always go to stderr so stdout stays usable
fn report_warnings(result: &FileResult) {
    for warning in &result.warnings {
        eprintln!("    WARNING: {}: {}", result.filename, warning);
    }
}

fn report_blocks(result: &FileResult, console: &Console, styles: &VerboseStyle) {
    for (i, block) in result.blocks.iter().enumerate() {
        let status = if block.changed { "realigned" } else { "aligned" };
        console.print(&styles.block(format!(
            "  Block {}: lines {}-{}, width {} ({})",
            i + 1,
            block.line,
            block.line + block.height.saturating_sub(1),
            block.target_width,
            status
        )));
    }
}

/// Output a unified diff for a file result
fn output_diff(result: &FileResult, proposed: bool) -> Result<()> {
    if !result.would_change {
        return Ok(());
    }

    let diff = TextDiff::from_lines(&result.original, &result.corrected);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", result.filename)?;
    if proposed {
        writeln!(stdout, "+++ b/{} (proposed)", result.filename)?;
    } else {
        writeln!(stdout, "+++ b/{}", result.filename)?;
    }

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

/// Output JSON for a single file result
fn output_json(
    kind: FixKind,
    config: &Config,
    result: &FileResult,
    include_content: bool,
) -> Result<()> {
    let json_output = JsonOutput {
        version: "1.0",
        command: kind.command_name(),
        status: if config.dry_run { "dry_run" } else { "success" },
        file: Some(result.filename.as_str()),
        input: InputStats {
            lines: result.original.lines().count(),
            bytes: result.original.len(),
        },
        processing: ProcessingStats {
            blocks_detected: result.stats.blocks_found,
            blocks_modified: result.stats.blocks_changed,
            blank_lines_inserted: result.stats.blank_lines_inserted,
        },
        output: OutputStats {
            lines: result.corrected.lines().count(),
            bytes: result.corrected.len(),
            changed: result.would_change,
        },
        warnings: &result.warnings,
        content: include_content.then_some(result.corrected.as_str()),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json_output).context("Failed to serialize JSON output")?
    );
    Ok(())
}

/// Fix stdin and write the result to stdout
fn run_fix_stdin(kind: FixKind, config: &Config) -> Result<RunOutcome> {
    let text = read_stdin_text()?;
    let result = process_input(text, "stdin".to_string(), kind);
    report_warnings(&result);

    if config.json {
        output_json(kind, config, &result, !config.dry_run)?;
    } else if config.diff {
        output_diff(&result, config.dry_run)?;
    } else if !config.dry_run {
        io::stdout()
            .lock()
            .write_all(result.corrected.as_bytes())
            .context("Failed to write stdout")?;
    }

    if config.verbose && !config.json {
        // stdout carries the document here, keep the summary on stderr
        eprintln!(
            "stdin: {} box(es), {} realigned, {} blank line(s) inserted",
            result.stats.blocks_found,
            result.stats.blocks_changed,
            result.stats.blank_lines_inserted
        );
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: result.would_change,
    })
}

/// Fix every file selected by `paths`
fn run_fix_files(
    kind: FixKind,
    paths: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    let files = discover_files(paths, config, console, styles)?;
    let chatty = !config.json && !config.diff;

    if files.is_empty() {
        eprintln!(
            "Warning: No files matched pattern '{}' in provided paths",
            config.glob
        );
        return Ok(RunOutcome {
            dry_run: config.dry_run,
            would_change: false,
        });
    }

    if chatty {
        console.print(&styles.header(format!("Found {} file(s) to check", files.len())));
        console.print("");
    }

    let mut files_processed = 0;
    let mut files_changed = 0;
    let mut aggregated = Stats::default();
    let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();

    for path in &files {
        let text = match read_text(path) {
            Ok(text) => text,
            Err(err) => {
                eprintln!("Error processing {}: {:#}", path.display(), err);
                errors.push((path.clone(), err));
                continue;
            }
        };

        if config.verbose && chatty {
            console.print(&styles.bold(format!("Processing {}...", path.display())));
        }

        let result = process_input(text, path.display().to_string(), kind);
        report_warnings(&result);
        files_processed += 1;
        aggregated.merge(&result.stats);
        if result.would_change {
            files_changed += 1;
        }

        if config.verbose && chatty {
            report_blocks(&result, console, styles);
        }

        if config.json {
            output_json(kind, config, &result, false)?;
        } else if config.diff {
            output_diff(&result, config.dry_run)?;
        }

        if config.dry_run {
            if chatty {
                let line = if result.would_change {
                    styles.block(format!("  ~ Would fix {}", path.display()))
                } else {
                    styles.dim(format!("  - No changes needed for {}", path.display()))
                };
                console.print(&line);
            }
            continue;
        }

        if !result.would_change {
            if chatty {
                console.print(&styles.dim(format!(
                    "  - No changes needed for {}",
                    path.display()
                )));
            }
            continue;
        }

        if let Err(err) = write_result(path, &result, config, console, styles) {
            eprintln!("Error processing {}: {:#}", path.display(), err);
            errors.push((path.clone(), err));
            continue;
        }

        if chatty {
            console.print(&styles.success(format!("  ✓ Fixed {}", path.display())));
        }
    }

    if chatty {
        console.print("");
        console.print(&"=".repeat(60));
        let verb = if config.dry_run { "Would fix" } else { "Fixed" };
        console.print(&styles.bold(format!("{} {} file(s)", verb, files_changed)));
    }

    if config.verbose && chatty {
        print_stats_summary(
            &aggregated,
            files_processed,
            files_changed,
            errors.len(),
            console,
            styles,
        );
    }

    if !errors.is_empty() {
        let names = errors
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let has_parse_error = errors
            .iter()
            .any(|(_, err)| error_chain_has::<ParseError>(err));

        if has_parse_error {
            return Err(ParseError(format!(
                "{} file(s) had parse errors: {}",
                errors.len(),
                names
            ))
            .into());
        }

        anyhow::bail!("{} file(s) had errors: {}", errors.len(), names);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: files_changed > 0,
    })
}

/// Write a changed file, taking a backup first when configured
fn write_result(
    path: &Path,
    result: &FileResult,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    if config.backup {
        let backup_path = create_backup(path, &config.backup_ext)?;
        if config.verbose && !config.json {
            console.print(&styles.dim(format!(
                "  Created backup: {}",
                backup_path.display()
            )));
        }
    }

    fs::write(path, &result.corrected)
        .with_context(|| format!("Failed to write to file: {}", path.display()))
}

fn run_fix(
    kind: FixKind,
    inputs: &[PathBuf],
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    if inputs.is_empty() {
        run_fix_stdin(kind, config)
    } else {
        run_fix_files(kind, inputs, config, console, styles)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

fn run(args: Args) -> Result<RunOutcome> {
    if let Commands::Config { action } = &args.command {
        run_config_command(action, &args)?;
        return Ok(RunOutcome::default());
    }

    validate_args(&args)?;
    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    match &args.command {
        Commands::Boxes { fix } => run_fix(FixKind::Boxes, &fix.inputs, &config, &console, &styles),
        Commands::Spacing { fix, .. } => run_fix(
            FixKind::Spacing {
                blockquotes: config.blockquotes,
            },
            &fix.inputs,
            &config,
            &console,
            &styles,
        ),
        Commands::Categories { dir, .. } => {
            run_categories(dir.as_deref(), &config, &console, &styles)
        }
        Commands::Config { .. } => Ok(RunOutcome::default()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
