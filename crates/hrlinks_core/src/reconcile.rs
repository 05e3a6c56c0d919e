use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::calendar::{Calendar, CalendarEntry, load_calendar};
use crate::distance::format_distance;
use crate::listing::{FileLister, ProductionListing, SshFileLister};
use crate::runlog::RunLog;
use crate::runtime::RunConfig;
use crate::store::{RESULTS_TYPE_AGE_GROUP_OVERALL, ResultLinkRow, ResultStore, SqliteResultStore};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub year: i32,
    /// Prefix of every published file URL, ending with `/`.
    pub results_base_url: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    MissingFromProduction,
    AlreadyInstalled,
    AmbiguousInstalledRows { rows: usize },
    Installed { event_id: i64 },
    WouldInstall { event_id: i64 },
    EventTitleNotFound { keywords: String },
    EventTitleAmbiguous { keywords: String, event_ids: Vec<i64> },
    StoreError { message: String },
}

impl EntryStatus {
    pub fn is_anomaly(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyInstalled | Self::Installed { .. } | Self::WouldInstall { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryOutcome {
    pub key: u32,
    pub event_name: String,
    pub expected_file: String,
    #[serde(flatten)]
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub year: i32,
    pub dry_run: bool,
    pub calendar_entries: usize,
    pub production_files: usize,
    pub skipped_no_results: usize,
    pub checked: usize,
    pub missing: usize,
    pub already_installed: usize,
    pub installed: usize,
    pub ambiguous: usize,
    pub failed: usize,
    pub outcomes: Vec<EntryOutcome>,
}

impl ReconcileReport {
    pub fn anomalies(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status.is_anomaly())
            .count()
    }

    fn record(&mut self, outcome: EntryOutcome) {
        match &outcome.status {
            EntryStatus::MissingFromProduction => self.missing += 1,
            EntryStatus::AlreadyInstalled => self.already_installed += 1,
            EntryStatus::AmbiguousInstalledRows { .. } => self.ambiguous += 1,
            EntryStatus::Installed { .. } | EntryStatus::WouldInstall { .. } => {
                self.installed += 1
            }
            EntryStatus::EventTitleNotFound { .. }
            | EntryStatus::EventTitleAmbiguous { .. }
            | EntryStatus::StoreError { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Compare the calendar against the production listing and add result-link
/// rows for published Age-Group pages that the index does not know yet.
/// Rows are only ever inserted.
pub fn reconcile<S: ResultStore>(
    calendar: &Calendar,
    listing: &ProductionListing,
    store: &mut S,
    log: &mut RunLog,
    options: &ReconcileOptions,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        year: options.year,
        dry_run: options.dry_run,
        calendar_entries: calendar.len(),
        production_files: listing.len(),
        ..ReconcileReport::default()
    };

    for entry in calendar.entries() {
        if !entry.has_results() {
            report.skipped_no_results += 1;
            continue;
        }
        report.checked += 1;
        let expected_file = entry.age_group_file_name();
        let status = reconcile_entry(entry, &expected_file, listing, store, options);
        log_outcome(log, entry, &expected_file, &status)?;
        report.record(EntryOutcome {
            key: entry.key,
            event_name: entry.event_name.clone(),
            expected_file,
            status,
        });
    }

    info!(
        year = options.year,
        checked = report.checked,
        installed = report.installed,
        anomalies = report.anomalies(),
        "reconciliation finished"
    );
    Ok(report)
}

fn reconcile_entry<S: ResultStore>(
    entry: &CalendarEntry,
    expected_file: &str,
    listing: &ProductionListing,
    store: &mut S,
    options: &ReconcileOptions,
) -> EntryStatus {
    if !listing.contains(expected_file) {
        return EntryStatus::MissingFromProduction;
    }

    let rows = match store.count_installed(expected_file, options.year) {
        Ok(rows) => rows,
        Err(error) => return store_error(error),
    };
    match rows {
        0 => {}
        1 => return EntryStatus::AlreadyInstalled,
        rows => return EntryStatus::AmbiguousInstalledRows { rows },
    }

    let event_ids = match store.find_open_water_events(&entry.keywords) {
        Ok(event_ids) => event_ids,
        Err(error) => return store_error(error),
    };
    let event_id = match event_ids.len() {
        0 => {
            return EntryStatus::EventTitleNotFound {
                keywords: entry.keywords.clone(),
            };
        }
        1 => event_ids[0],
        _ => {
            return EntryStatus::EventTitleAmbiguous {
                keywords: entry.keywords.clone(),
                event_ids,
            };
        }
    };

    if options.dry_run {
        return EntryStatus::WouldInstall { event_id };
    }
    let row = result_link_row(entry, event_id, expected_file, options);
    match store.insert_result_link(&row) {
        Ok(()) => EntryStatus::Installed { event_id },
        Err(error) => store_error(error),
    }
}

pub fn result_link_row(
    entry: &CalendarEntry,
    event_id: i64,
    expected_file: &str,
    options: &ReconcileOptions,
) -> ResultLinkRow {
    ResultLinkRow {
        event_id,
        event_date: entry.date,
        category: format!("Cat {}", entry.category),
        distance: format_distance(entry.distance),
        results_type: RESULTS_TYPE_AGE_GROUP_OVERALL.to_string(),
        results_file: format!("{}{expected_file}", options.results_base_url),
        remote: true,
    }
}

fn store_error(error: anyhow::Error) -> EntryStatus {
    EntryStatus::StoreError {
        message: format!("{error:#}"),
    }
}

fn log_outcome(
    log: &mut RunLog,
    entry: &CalendarEntry,
    expected_file: &str,
    status: &EntryStatus,
) -> Result<()> {
    let subject = format!("#{} '{}' ({expected_file})", entry.key, entry.event_name);
    match status {
        EntryStatus::MissingFromProduction => log.error(&format!(
            "{subject}: expected file is missing from production"
        )),
        EntryStatus::AlreadyInstalled => log.note(&format!("{subject}: already installed")),
        EntryStatus::AmbiguousInstalledRows { rows } => log.error(&format!(
            "{subject}: {rows} result rows match, manual review required"
        )),
        EntryStatus::Installed { event_id } => {
            log.progress(&format!("{subject}: installed for event id {event_id}"))
        }
        EntryStatus::WouldInstall { event_id } => log.progress(&format!(
            "{subject}: would install for event id {event_id} (dry run)"
        )),
        EntryStatus::EventTitleNotFound { keywords } => log.error(&format!(
            "{subject}: install failed, no open-water event title contains '{keywords}'"
        )),
        EntryStatus::EventTitleAmbiguous {
            keywords,
            event_ids,
        } => log.error(&format!(
            "{subject}: install failed, {} open-water event titles contain '{keywords}' (ids {event_ids:?})",
            event_ids.len()
        )),
        EntryStatus::StoreError { message } => {
            warn!(key = entry.key, %message, "result store error");
            log.error(&format!("{subject}: datastore error: {message}"))
        }
    }
}

/// Fetch the production listing and record it in the run log.
pub fn fetch_production_listing<L: FileLister>(
    lister: &mut L,
    year: i32,
    log: &mut RunLog,
) -> Result<ProductionListing> {
    let listing = lister.list_results(year)?;
    for diagnostic in &listing.diagnostics {
        log.error(&format!("production listing: {diagnostic}"))?;
    }
    log.note(&format!(
        "production listing for {year} ({} files):",
        listing.len()
    ))?;
    for file in &listing.files {
        log.note(&format!("    {file}"))?;
    }
    Ok(listing)
}

pub fn run_install_with<L: FileLister, S: ResultStore>(
    config: &RunConfig,
    lister: &mut L,
    store: &mut S,
    log: &mut RunLog,
    dry_run: bool,
) -> Result<ReconcileReport> {
    log.progress(&format!(
        "hrlinks: installing HR result links for {} (calendar {})",
        config.year,
        config.calendar_path.display()
    ))?;
    let calendar = load_calendar(&config.calendar_path, &config.properties)?;
    log.note(&format!("calendar entries: {}", calendar.len()))?;
    let listing = fetch_production_listing(lister, config.year, log)?;

    let options = ReconcileOptions {
        year: config.year,
        results_base_url: config.results_base_url.clone(),
        dry_run,
    };
    let report = reconcile(&calendar, &listing, store, log, &options)?;
    log.progress(&format!(
        "done: checked={} installed={} already_installed={} missing={} ambiguous={} failed={}",
        report.checked,
        report.installed,
        report.already_installed,
        report.missing,
        report.ambiguous,
        report.failed
    ))?;
    Ok(report)
}

pub fn run_install(config: &RunConfig, log: &mut RunLog, dry_run: bool) -> Result<ReconcileReport> {
    let mut lister = SshFileLister::new(config.ssh.clone());
    let mut store = SqliteResultStore::open(&config.db_path)?;
    run_install_with(config, &mut lister, &mut store, log, dry_run)
}
