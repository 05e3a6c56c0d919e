use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use hrlinks_core::reconcile::{ReconcileReport, run_install};
use hrlinks_core::runlog::RunLog;
use hrlinks_core::runtime::{
    ResolutionContext, RunConfig, RunOverrides, normalize_for_display, parse_year, resolve_config,
};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(
    name = "hrlinks",
    version,
    about = "Link published open-water HR result pages into the public results index",
    disable_help_flag = true
)]
struct Cli {
    #[arg(value_name = "YEAR", help = "Season to process (default: current year)")]
    year: Option<String>,
    #[arg(
        short = 't',
        long = "debug",
        value_name = "LEVEL",
        default_value_t = 0,
        help = "Debug verbosity: 0 warn, 1 info, 2 debug, 3 trace"
    )]
    debug: u8,
    #[arg(short = 'p', long, value_name = "PATH", help = "Primary property file")]
    properties: Option<PathBuf>,
    #[arg(short = 's', long, value_name = "DIR", help = "Source data directory")]
    source_dir: Option<PathBuf>,
    #[arg(short = 'g', long, value_name = "DIR", help = "Generated files directory")]
    generated_dir: Option<PathBuf>,
    #[arg(long, help = "Check everything but do not insert rows")]
    dry_run: bool,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
    #[arg(long, help = "Print resolved configuration")]
    diagnostics: bool,
    #[arg(short = 'h', long, action = ArgAction::SetTrue, help = "Print usage and exit")]
    help: bool,
}

/// Console stream handle that can be cloned into the run log.
#[derive(Clone)]
enum Console {
    Stdout,
    Stderr,
    #[cfg(test)]
    Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>),
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout => io::stdout().write(buf),
            Self::Stderr => io::stderr().write(buf),
            #[cfg(test)]
            Self::Captured(buffer) => match buffer.lock() {
                Ok(mut buffer) => {
                    buffer.extend_from_slice(buf);
                    Ok(buf.len())
                }
                Err(_) => Err(io::Error::other("console buffer poisoned")),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
            #[cfg(test)]
            Self::Captured(_) => Ok(()),
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) if error.kind() == ErrorKind::DisplayVersion => {
            let _ = error.print();
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(abort(&mut Console::Stderr, 1));
        }
    };
    init_tracing(cli.debug);
    ExitCode::from(exit_for(
        &cli,
        ResolutionContext::from_process(),
        Console::Stdout,
        Console::Stderr,
    ))
}

/// Run the parsed command and return the process exit status.
fn exit_for(
    cli: &Cli,
    context: Result<ResolutionContext>,
    mut out: Console,
    mut err: Console,
) -> u8 {
    if cli.help {
        let _ = writeln!(out, "{}", Cli::command().render_help());
        return 1;
    }

    let context = match context {
        Ok(context) => context,
        Err(error) => {
            let _ = writeln!(err, "hrlinks: {error:#}");
            return abort(&mut err, 1);
        }
    };
    let overrides = match collect_overrides(cli, context.current_year) {
        Ok(overrides) => overrides,
        Err(errors) => {
            for error in &errors {
                let _ = writeln!(err, "hrlinks: {error}");
            }
            return abort(&mut err, errors.len());
        }
    };

    match run(cli, &context, &overrides, &mut out, &err) {
        Ok(()) => 0,
        Err(error) => {
            let _ = writeln!(err, "hrlinks: {error:#}");
            abort(&mut err, 1)
        }
    }
}

/// Under `--json` stdout carries the report alone; everything else the run
/// prints goes to stderr.
fn run(
    cli: &Cli,
    context: &ResolutionContext,
    overrides: &RunOverrides,
    out: &mut Console,
    err: &Console,
) -> Result<()> {
    let config = resolve_run_config(context, overrides)?;
    let chatter = if cli.json { err.clone() } else { out.clone() };
    if cli.diagnostics {
        let mut chatter = chatter.clone();
        writeln!(chatter, "[diagnostics]\n{}", config.diagnostics())?;
    }

    let mut log = RunLog::open_with_console(&config.log_path, !cli.json, Box::new(chatter))?;
    let report = run_install(&config, &mut log, cli.dry_run)?;

    if cli.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        print_report(out, &config, &log, &report)?;
    }
    out.flush()?;
    Ok(())
}

/// Validate arguments, reporting every problem rather than the first one.
fn collect_overrides(cli: &Cli, current_year: i32) -> Result<RunOverrides, Vec<String>> {
    let mut errors = Vec::new();

    let year = match cli.year.as_deref() {
        Some(value) => match parse_year(value, current_year) {
            Ok(year) => Some(year),
            Err(error) => {
                errors.push(error.to_string());
                None
            }
        },
        None => None,
    };
    check_dir_flag(&mut errors, "--source-dir", cli.source_dir.as_deref());
    check_dir_flag(&mut errors, "--generated-dir", cli.generated_dir.as_deref());
    if let Some(path) = cli.properties.as_deref()
        && !path.is_file()
    {
        errors.push(format!(
            "--properties: no such file {}",
            normalize_for_display(path)
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(RunOverrides {
        year,
        properties: cli.properties.clone(),
        source_data_dir: cli.source_dir.clone(),
        generated_dir: cli.generated_dir.clone(),
    })
}

fn check_dir_flag(errors: &mut Vec<String>, flag: &str, path: Option<&Path>) {
    if let Some(path) = path
        && !path.is_dir()
    {
        errors.push(format!(
            "{flag}: no such directory {}",
            normalize_for_display(path)
        ));
    }
}

fn resolve_run_config(context: &ResolutionContext, overrides: &RunOverrides) -> Result<RunConfig> {
    dotenvy::dotenv().ok();

    let initial = resolve_config(context, overrides)?;
    let Some(properties_dir) = initial.properties_path.parent() else {
        return Ok(initial);
    };
    let project_env = properties_dir.join(".env");
    if !project_env.exists() {
        return Ok(initial);
    }
    let _ = dotenvy::from_path_override(&project_env);
    resolve_config(context, overrides)
}

fn print_report(
    out: &mut Console,
    config: &RunConfig,
    log: &RunLog,
    report: &ReconcileReport,
) -> io::Result<()> {
    writeln!(out, "hrlinks install")?;
    writeln!(out, "year: {}", report.year)?;
    writeln!(out, "dry_run: {}", report.dry_run)?;
    writeln!(out, "db_path: {}", normalize_for_display(&config.db_path))?;
    writeln!(out, "log_path: {}", normalize_for_display(log.path()))?;
    writeln!(out, "calendar_entries: {}", report.calendar_entries)?;
    writeln!(out, "production_files: {}", report.production_files)?;
    writeln!(out, "skipped_no_results: {}", report.skipped_no_results)?;
    writeln!(out, "checked: {}", report.checked)?;
    writeln!(out, "installed: {}", report.installed)?;
    writeln!(out, "already_installed: {}", report.already_installed)?;
    writeln!(out, "missing: {}", report.missing)?;
    writeln!(out, "ambiguous: {}", report.ambiguous)?;
    writeln!(out, "failed: {}", report.failed)?;
    writeln!(out, "logged_errors: {}", log.error_count())
}

fn init_tracing(debug: u8) {
    let level = match debug {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn abort(err: &mut Console, errors: usize) -> u8 {
    let _ = writeln!(err, "hrlinks: {errors} error(s), abort");
    1
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use clap::Parser;
    use hrlinks_core::runtime::ResolutionContext;
    use tempfile::{TempDir, tempdir};

    use super::{Cli, Console, collect_overrides, exit_for};

    fn captured() -> (Console, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Console::Captured(buffer.clone()), buffer)
    }

    fn text(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buffer.lock().expect("lock").clone()).expect("utf8")
    }

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write file");
    }

    /// Season 2024 workspace whose listing command fails, so the single
    /// calendar entry is logged as missing from production.
    fn failing_listing_workspace() -> TempDir {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("properties.txt"), "SshCommand false\n");
        fs::create_dir_all(root.join("Generated")).expect("mkdir");
        write_file(
            &root.join("SourceData").join("2024").join("calendar-2024.txt"),
            ">calendar\n2 | 2024-Berryessa.csv | 1 | 2024-06-08 | 1 | Lake Berryessa 1 Mile | 24-berryessa-1 | Berryessa |\n>endcalendar\n",
        );
        temp
    }

    fn run_in(temp: &TempDir, extra: &[&str]) -> (u8, String, String) {
        let properties = temp.path().join("properties.txt");
        let properties = properties.to_string_lossy().to_string();
        let mut args = vec!["hrlinks", "2024", "-p", properties.as_str()];
        args.extend_from_slice(extra);
        let cli = Cli::try_parse_from(args).expect("parse");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
            current_year: 2024,
        };
        let (out, out_buffer) = captured();
        let (err, err_buffer) = captured();
        let status = exit_for(&cli, Ok(context), out, err);
        (status, text(&out_buffer), text(&err_buffer))
    }

    #[test]
    fn help_prints_usage_and_exits_one() {
        let cli = Cli::try_parse_from(["hrlinks", "-h"]).expect("parse");
        let (out, out_buffer) = captured();
        let (err, err_buffer) = captured();
        let status = exit_for(&cli, Err(anyhow!("context not needed")), out, err);
        assert_eq!(status, 1);
        assert!(text(&out_buffer).contains("Usage"));
        assert!(text(&err_buffer).is_empty());
    }

    #[test]
    fn bad_arguments_are_counted_and_abort() {
        let cli = Cli::try_parse_from([
            "hrlinks",
            "1999",
            "-s",
            "/nonexistent/source",
            "-g",
            "/nonexistent/generated",
        ])
        .expect("parse");
        let context = ResolutionContext {
            cwd: std::env::temp_dir(),
            current_year: 2025,
        };
        let (out, out_buffer) = captured();
        let (err, err_buffer) = captured();
        let status = exit_for(&cli, Ok(context), out, err);
        assert_eq!(status, 1);
        assert!(text(&out_buffer).is_empty());
        let err_text = text(&err_buffer);
        assert_eq!(err_text.lines().count(), 4);
        assert!(err_text.ends_with("hrlinks: 3 error(s), abort\n"));
    }

    #[test]
    fn fatal_configuration_error_aborts() {
        let temp = tempdir().expect("tempdir");
        write_file(&temp.path().join("properties.txt"), "");
        let (status, out, err) = run_in(&temp, &[]);
        assert_eq!(status, 1);
        assert!(out.is_empty());
        assert!(err.contains("required directories are missing"));
        assert!(err.ends_with("hrlinks: 1 error(s), abort\n"));
    }

    #[cfg(unix)]
    #[test]
    fn json_stdout_stays_parseable_when_errors_are_logged() {
        let temp = failing_listing_workspace();
        let (status, out, err) = run_in(&temp, &["--json", "--diagnostics"]);

        assert_eq!(status, 0);
        let report: serde_json::Value = serde_json::from_str(&out).expect("stdout is json");
        assert_eq!(report["missing"], 1);
        assert_eq!(report["outcomes"][0]["status"], "missing_from_production");
        assert!(err.contains("! ERROR: production listing:"));
        assert!(err.contains("! ERROR: #2 'Lake Berryessa 1 Mile'"));
        assert!(err.contains("[diagnostics]"));
    }

    #[cfg(unix)]
    #[test]
    fn text_mode_echoes_errors_with_the_report() {
        let temp = failing_listing_workspace();
        let (status, out, err) = run_in(&temp, &[]);

        assert_eq!(status, 0);
        assert!(out.contains("! ERROR: #2 'Lake Berryessa 1 Mile'"));
        assert!(out.contains("missing: 1"));
        assert!(out.contains("logged_errors: 2"));
        assert!(err.is_empty());
    }

    #[test]
    fn supplied_year_is_applied() {
        let cli = Cli::try_parse_from(["hrlinks", "2019"]).expect("parse");
        let overrides = collect_overrides(&cli, 2025).expect("overrides");
        assert_eq!(overrides.year, Some(2019));
    }

    #[test]
    fn missing_year_defers_to_current_year() {
        let cli = Cli::try_parse_from(["hrlinks"]).expect("parse");
        let overrides = collect_overrides(&cli, 2025).expect("overrides");
        assert_eq!(overrides.year, None);
    }

    #[test]
    fn every_bad_argument_is_reported() {
        let cli = Cli::try_parse_from([
            "hrlinks",
            "1999",
            "-s",
            "/nonexistent/source",
            "-g",
            "/nonexistent/generated",
        ])
        .expect("parse");
        let errors = collect_overrides(&cli, 2025).expect_err("must fail");
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("between 2008 and 2025"));
    }

    #[test]
    fn short_flags_parse() {
        let cli = Cli::try_parse_from(["hrlinks", "-t", "2", "-h", "--dry-run", "--json"])
            .expect("parse");
        assert_eq!(cli.debug, 2);
        assert!(cli.help);
        assert!(cli.dry_run);
        assert!(cli.json);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(Cli::try_parse_from(["hrlinks", "--frobnicate"]).is_err());
    }
}
