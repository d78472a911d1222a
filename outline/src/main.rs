use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug};
use outline::{DateAndTime, Notice, OutlineSettings, OutlineStorage, TextRange, Token};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Inspect outline documents with the incremental outline engine",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and list every token.
    Tokens(TokensArgs),

    /// Print the heading tree with planning keywords and tags.
    Headings(HeadingsArgs),

    /// List date-and-time tokens with their notice relative to a day.
    Dates(DatesArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Outline files or directories containing `.org` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// JSON settings file (planning keywords, enabled constructs).
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TokensArgs {
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Debug, Args)]
struct HeadingsArgs {
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Debug, Args)]
struct DatesArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Reference day for notices (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Tokens(args) => handle_tokens(args),
        Commands::Headings(args) => handle_headings(args),
        Commands::Dates(args) => handle_dates(args),
    }
}

fn init_logging(verbose: bool) {
    if verbose {
        pretty_env_logger::formatted_builder()
            .filter_level(LevelFilter::Debug)
            .init();
    } else {
        pretty_env_logger::init();
    }
}

#[derive(Debug, Serialize)]
struct TokenRow<'a> {
    name: &'static str,
    text: &'a str,
    #[serde(flatten)]
    token: &'a Token,
}

#[derive(Debug, Serialize)]
struct HeadingRow<'a> {
    level: usize,
    identifier: &'a str,
    planning: Option<&'a str>,
    finished: bool,
    title: &'a str,
    tags: Vec<String>,
    range: TextRange,
}

#[derive(Debug, Serialize)]
struct DateRow<'a> {
    text: &'a str,
    mark: String,
    date: &'a DateAndTime,
    notice: Option<Notice>,
}

#[derive(Debug, Serialize)]
struct FileReport<T> {
    path: PathBuf,
    entries: Vec<T>,
}

fn handle_tokens(args: TokensArgs) -> Result<()> {
    let SourceArgs {
        inputs,
        settings,
        json,
    } = args.source;
    let documents = load_documents(&inputs, settings.as_deref())?;

    let mut reports = Vec::new();
    for (path, storage) in &documents {
        let entries: Vec<TokenRow> = storage
            .tokens()
            .map(|token| TokenRow {
                name: token.name(),
                text: storage.substring(token.range()).unwrap_or_default(),
                token,
            })
            .collect();
        reports.push(FileReport {
            path: path.clone(),
            entries,
        });
    }

    print_reports(&reports, json, |row| {
        let range = row.token.range();
        format!(
            "{:>6}..{:<6} {:<22} {:?}",
            range.location,
            range.upper_bound(),
            row.name,
            row.text
        )
    })
}

fn handle_headings(args: HeadingsArgs) -> Result<()> {
    let SourceArgs {
        inputs,
        settings,
        json,
    } = args.source;
    let documents = load_documents(&inputs, settings.as_deref())?;

    let mut reports = Vec::new();
    for (path, storage) in &documents {
        reports.push(FileReport {
            path: path.clone(),
            entries: heading_rows(storage),
        });
    }

    print_reports(&reports, json, |row| {
        let mut line = "  ".repeat(row.level.saturating_sub(1));
        line.push_str(&"*".repeat(row.level));
        if let Some(keyword) = row.planning {
            line.push(' ');
            line.push_str(keyword);
        }
        line.push(' ');
        line.push_str(row.title);
        if !row.tags.is_empty() {
            line.push_str(&format!(" :{}:", row.tags.join(":")));
        }
        line
    })
}

fn heading_rows(storage: &OutlineStorage) -> Vec<HeadingRow<'_>> {
    storage
        .headings()
        .filter_map(|heading| {
            let data = heading.heading()?;
            Some(HeadingRow {
                level: data.level,
                identifier: &data.identifier,
                planning: storage.planning_keyword(heading),
                finished: storage.is_finished(heading),
                title: storage
                    .substring(storage.heading_text_range(heading))
                    .unwrap_or_default()
                    .trim(),
                tags: storage.heading_tags(heading),
                range: heading.range(),
            })
        })
        .collect()
}

fn handle_dates(args: DatesArgs) -> Result<()> {
    let SourceArgs {
        inputs,
        settings,
        json,
    } = args.source;
    let today = args.today.unwrap_or_else(|| Local::now().date_naive());
    let relative = today.and_time(NaiveTime::MIN);
    debug!("computing notices relative to {relative}");
    let documents = load_documents(&inputs, settings.as_deref())?;

    let mut reports = Vec::new();
    for (path, storage) in &documents {
        let entries: Vec<DateRow> = storage
            .tokens()
            .filter_map(|token| {
                let date = token.date_and_time()?;
                Some(DateRow {
                    text: storage.substring(token.range()).unwrap_or_default(),
                    mark: date.mark_string(),
                    date,
                    notice: date.check_notice(relative),
                })
            })
            .collect();
        reports.push(FileReport {
            path: path.clone(),
            entries,
        });
    }

    print_reports(&reports, json, |row| match &row.notice {
        Some(notice) => format!("{:<40} {} ({})", row.mark, row.date, notice.message()),
        None => format!("{:<40} {}", row.mark, row.date),
    })
}

fn print_reports<T: Serialize>(
    reports: &[FileReport<T>],
    json: bool,
    render: impl Fn(&T) -> String,
) -> Result<()> {
    if json {
        if let [single] = reports {
            println!("{}", serde_json::to_string_pretty(single)?);
        } else {
            println!("{}", serde_json::to_string_pretty(reports)?);
        }
        return Ok(());
    }

    for (idx, report) in reports.iter().enumerate() {
        if reports.len() > 1 {
            if idx > 0 {
                println!();
            }
            println!("== {} ==", report.path.display());
        }
        for entry in &report.entries {
            println!("{}", render(entry));
        }
    }
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<OutlineSettings> {
    match path {
        Some(path) => OutlineSettings::from_path(path)
            .with_context(|| format!("loading settings {:?}", path)),
        None => Ok(OutlineSettings::default()),
    }
}

fn load_documents(
    inputs: &[PathBuf],
    settings: Option<&Path>,
) -> Result<Vec<(PathBuf, OutlineStorage)>> {
    let settings = load_settings(settings)?;
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no outline files found in the provided inputs");
    }

    let mut documents = Vec::with_capacity(expanded.len());
    for path in expanded {
        debug!("Parsing {:?}", path);
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let storage = OutlineStorage::new(text, settings.clone());
        documents.push((path, storage));
    }
    Ok(documents)
}

fn is_outline_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("Scanning directory {:?}", canonical);
            for file in collect_outline_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_outline_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            debug!("Adding file {:?}", canonical);
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn collect_outline_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_outline_file(&canonical) {
        debug!("Found outline file {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_walks_directories_and_skips_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("notes").join("2024");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("a.org"), "* A\n").expect("write a");
        fs::write(nested.join("b.org"), "* B\n").expect("write b");
        fs::write(root.join("readme.txt"), "plain").expect("write txt");

        let expanded = expand_inputs(&[root.to_path_buf()]).expect("expand");
        let names: Vec<_> = expanded
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a.org".to_string()));
        assert!(names.contains(&"b.org".to_string()));
    }

    #[test]
    fn expand_inputs_deduplicates_files_named_twice() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("doc.org");
        fs::write(&file, "* Doc\n").expect("write doc");

        let expanded =
            expand_inputs(&[file.clone(), tmp.path().to_path_buf()]).expect("expand");
        assert_eq!(expanded, vec![fs::canonicalize(&file).expect("canonical")]);
    }

    #[test]
    fn expand_inputs_rejects_non_outline_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.md");
        fs::write(&file, "# md").expect("write md");
        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn missing_settings_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("settings.json");
        assert!(load_settings(Some(missing.as_path())).is_err());
        assert_eq!(
            load_settings(None).expect("default settings"),
            OutlineSettings::default()
        );
    }

    #[test]
    fn heading_rows_report_planning_titles_and_tags() {
        let storage = OutlineStorage::new(
            "* TODO Write report :work:urgent:\n** Draft\n",
            OutlineSettings::default(),
        );
        let rows = heading_rows(&storage);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].planning, Some("TODO"));
        assert!(!rows[0].finished);
        assert_eq!(rows[0].title, "Write report");
        assert_eq!(rows[0].tags, vec!["work", "urgent"]);
        assert_eq!(rows[1].level, 2);
        assert_eq!(rows[1].title, "Draft");
        assert!(rows[1].tags.is_empty());
    }

    #[test]
    fn documents_load_with_custom_settings() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = tmp.path().join("doc.org");
        fs::write(&doc, "* WAIT reply\n").expect("write doc");
        let settings = tmp.path().join("settings.json");
        fs::write(&settings, r#"{"custom_planning_keywords": ["WAIT"]}"#)
            .expect("write settings");

        let documents = load_documents(&[doc], Some(settings.as_path())).expect("load");
        let (_, storage) = &documents[0];
        let heading = storage.headings().next().expect("heading");
        assert_eq!(storage.planning_keyword(heading), Some("WAIT"));
    }
}
