use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Local};

use crate::listing::SshTarget;
use crate::properties::{PropertyMap, load_properties};

/// Earliest season with open-water results.
pub const MIN_YEAR: i32 = 2008;

pub const DEFAULT_PROPERTIES_FILENAME: &str = "properties.txt";

pub const KEY_YEAR: &str = "YearBeingProcessed";
pub const KEY_PROPERTIES_DIR: &str = "PropertiesDir";
pub const KEY_SOURCE_DATA_DIR: &str = "SourceDataDir";
pub const KEY_GENERATED_DIR: &str = "GeneratedFilesDir";
pub const KEY_CALENDAR_FILE: &str = "CalendarFile";
pub const KEY_LOG_FILE: &str = "HRInstallLog";
pub const KEY_DATABASE: &str = "ResultsDatabase";
pub const KEY_REMOTE_USER: &str = "RemoteUser";
pub const KEY_REMOTE_HOST: &str = "RemoteHost";
pub const KEY_REMOTE_DIR: &str = "RemoteResultsDir";
pub const KEY_RESULTS_URL: &str = "ProductionResultsURL";
pub const KEY_SSH_COMMAND: &str = "SshCommand";

const DEFAULT_CALENDAR_FILE: &str =
    "{SourceDataDir}/{YearBeingProcessed}/calendar-{YearBeingProcessed}.txt";
const DEFAULT_LOG_FILE: &str = "{GeneratedFilesDir}/{YearBeingProcessed}/HRInstall.log";
const DEFAULT_DATABASE: &str = "{GeneratedFilesDir}/results.sqlite";
const DEFAULT_REMOTE_USER: &str = "pms";
const DEFAULT_REMOTE_HOST: &str = "production";
const DEFAULT_REMOTE_DIR: &str = "public_html/results/ow/{YearBeingProcessed}";
const DEFAULT_RESULTS_URL: &str = "https://production/results/ow/{YearBeingProcessed}/";
const DEFAULT_SSH_COMMAND: &str = "ssh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Property,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Property => "property",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub year: Option<i32>,
    pub properties: Option<PathBuf>,
    pub source_data_dir: Option<PathBuf>,
    pub generated_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub current_year: i32,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self {
            cwd,
            current_year: Local::now().year(),
        })
    }
}

/// Everything a run needs, resolved once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub year: i32,
    pub properties_path: PathBuf,
    pub properties_source: ValueSource,
    pub properties: PropertyMap,
    pub source_data_dir: PathBuf,
    pub source_data_source: ValueSource,
    pub generated_dir: PathBuf,
    pub generated_source: ValueSource,
    pub calendar_path: PathBuf,
    pub log_path: PathBuf,
    pub db_path: PathBuf,
    pub db_source: ValueSource,
    pub ssh: SshTarget,
    pub results_base_url: String,
}

impl RunConfig {
    pub fn diagnostics(&self) -> String {
        format!(
            "year={}\nproperties_path={} ({})\nproperties.count={}\nsource_data_dir={} ({})\ngenerated_dir={} ({})\ncalendar_path={}\nlog_path={}\ndb_path={} ({})\nremote={}@{}:{}\nresults_base_url={}",
            self.year,
            normalize_for_display(&self.properties_path),
            self.properties_source.as_str(),
            self.properties.len(),
            normalize_for_display(&self.source_data_dir),
            self.source_data_source.as_str(),
            normalize_for_display(&self.generated_dir),
            self.generated_source.as_str(),
            normalize_for_display(&self.calendar_path),
            normalize_for_display(&self.log_path),
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
            self.ssh.user,
            self.ssh.host,
            self.ssh.results_dir,
            self.results_base_url,
        )
    }
}

/// Parse a four-digit season year between `MIN_YEAR` and `current_year`.
pub fn parse_year(value: &str, current_year: i32) -> Result<i32> {
    let trimmed = value.trim();
    if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        bail!("invalid year `{value}`: expected four digits");
    }
    let year: i32 = trimmed
        .parse()
        .with_context(|| format!("invalid year `{value}`"))?;
    check_year(year, current_year)?;
    Ok(year)
}

fn check_year(year: i32, current_year: i32) -> Result<()> {
    if !(MIN_YEAR..=current_year).contains(&year) {
        bail!("invalid year {year}: must be between {MIN_YEAR} and {current_year}");
    }
    Ok(())
}

pub fn resolve_config(context: &ResolutionContext, overrides: &RunOverrides) -> Result<RunConfig> {
    resolve_config_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_config_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &RunOverrides,
    lookup_env: F,
) -> Result<RunConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let year = overrides.year.unwrap_or(context.current_year);
    check_year(year, context.current_year)?;

    let (properties_path, properties_source) = if let Some(path) = overrides.properties.as_deref()
    {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("HRLINKS_PROPERTIES")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (
            context.cwd.join(DEFAULT_PROPERTIES_FILENAME),
            ValueSource::Default,
        )
    };
    if !properties_path.is_file() {
        bail!(
            "property file not found: {}",
            normalize_for_display(&properties_path)
        );
    }
    let properties_dir = properties_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| context.cwd.clone());

    let source_override = overrides
        .source_data_dir
        .as_deref()
        .map(|path| absolutize(path, &context.cwd));
    let generated_override = overrides
        .generated_dir
        .as_deref()
        .map(|path| absolutize(path, &context.cwd));

    let mut properties = PropertyMap::new();
    seed_recomputed_keys(
        &mut properties,
        year,
        source_override.as_deref(),
        generated_override.as_deref(),
    );
    properties.set(KEY_PROPERTIES_DIR, path_value(&properties_dir));
    load_properties(&properties_path, &mut properties)?;
    seed_recomputed_keys(
        &mut properties,
        year,
        source_override.as_deref(),
        generated_override.as_deref(),
    );

    let (source_data_dir, source_data_source) = resolve_dir(
        &mut properties,
        KEY_SOURCE_DATA_DIR,
        source_override,
        properties_dir.join("SourceData"),
        &properties_dir,
    )?;
    let (generated_dir, generated_source) = resolve_dir(
        &mut properties,
        KEY_GENERATED_DIR,
        generated_override,
        properties_dir.join("Generated"),
        &properties_dir,
    )?;

    let mut missing = Vec::new();
    for dir in [&source_data_dir, &generated_dir] {
        if !dir.is_dir() {
            missing.push(normalize_for_display(dir));
        }
    }
    if !missing.is_empty() {
        bail!("required directories are missing: {}", missing.join(", "));
    }

    let calendar_path = resolve_file(
        &properties,
        KEY_CALENDAR_FILE,
        DEFAULT_CALENDAR_FILE,
        &properties_dir,
    )?;
    let log_path = resolve_file(&properties, KEY_LOG_FILE, DEFAULT_LOG_FILE, &properties_dir)?;
    let (db_path, db_source) = if let Some(value) = non_empty(lookup_env("HRLINKS_DB")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        let source = if properties.get(KEY_DATABASE).is_some() {
            ValueSource::Property
        } else {
            ValueSource::Default
        };
        (
            resolve_file(&properties, KEY_DATABASE, DEFAULT_DATABASE, &properties_dir)?,
            source,
        )
    };

    let ssh = SshTarget {
        ssh_command: property_or(&properties, KEY_SSH_COMMAND, DEFAULT_SSH_COMMAND),
        user: property_or(&properties, KEY_REMOTE_USER, DEFAULT_REMOTE_USER),
        host: property_or(&properties, KEY_REMOTE_HOST, DEFAULT_REMOTE_HOST),
        results_dir: properties
            .expand(&property_or(&properties, KEY_REMOTE_DIR, DEFAULT_REMOTE_DIR))
            .with_context(|| format!("failed to expand {KEY_REMOTE_DIR}"))?,
    };
    let mut results_base_url = properties
        .expand(&property_or(&properties, KEY_RESULTS_URL, DEFAULT_RESULTS_URL))
        .with_context(|| format!("failed to expand {KEY_RESULTS_URL}"))?;
    if !results_base_url.ends_with('/') {
        results_base_url.push('/');
    }

    Ok(RunConfig {
        year,
        properties_path,
        properties_source,
        properties,
        source_data_dir,
        source_data_source,
        generated_dir,
        generated_source,
        calendar_path,
        log_path,
        db_path,
        db_source,
        ssh,
        results_base_url,
    })
}

fn seed_recomputed_keys(
    properties: &mut PropertyMap,
    year: i32,
    source_override: Option<&Path>,
    generated_override: Option<&Path>,
) {
    properties.set(KEY_YEAR, year.to_string());
    if let Some(path) = source_override {
        properties.set(KEY_SOURCE_DATA_DIR, path_value(path));
    }
    if let Some(path) = generated_override {
        properties.set(KEY_GENERATED_DIR, path_value(path));
    }
}

fn resolve_dir(
    properties: &mut PropertyMap,
    key: &str,
    flag: Option<PathBuf>,
    default: PathBuf,
    base: &Path,
) -> Result<(PathBuf, ValueSource)> {
    let (dir, source) = if let Some(path) = flag {
        (path, ValueSource::Flag)
    } else if let Some(value) = properties.get(key) {
        let expanded = properties
            .expand(value)
            .with_context(|| format!("failed to expand {key}"))?;
        (absolutize(Path::new(&expanded), base), ValueSource::Property)
    } else {
        (default, ValueSource::Default)
    };
    properties.set(key, path_value(&dir));
    Ok((dir, source))
}

fn resolve_file(properties: &PropertyMap, key: &str, default: &str, base: &Path) -> Result<PathBuf> {
    let template = property_or(properties, key, default);
    let expanded = properties
        .expand(&template)
        .with_context(|| format!("failed to expand {key}"))?;
    Ok(absolutize(Path::new(&expanded), base))
}

fn property_or(properties: &PropertyMap, key: &str, default: &str) -> String {
    properties
        .get(key)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
