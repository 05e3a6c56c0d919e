use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tracing::debug;

use crate::properties::{PropertyMap, collect_calendar_lines};

/// File name recorded for events whose results have not been generated yet.
pub const NO_RESULTS: &str = "NO RESULTS";

const FIELD_SEPARATOR: char = '|';
const REQUIRED_FIELDS: usize = 9;
const MAX_FIELDS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub key: u32,
    pub file_name: String,
    pub category: String,
    pub date: NaiveDate,
    pub distance: f64,
    pub event_name: String,
    pub unique_id: String,
    pub keywords: String,
    pub link: String,
    pub hr_link: Option<String>,
}

impl CalendarEntry {
    pub fn has_results(&self) -> bool {
        self.file_name != NO_RESULTS
    }

    /// Name of the published Age-Group page for this event.
    pub fn age_group_file_name(&self) -> String {
        format!(
            "{}-cat{}-AG.html",
            self.event_name.replace(' ', "_"),
            self.category
        )
    }
}

/// Season calendar: records keyed by event number plus a reverse index from
/// result file name to event number. Both are only written by `insert`.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    entries: BTreeMap<u32, CalendarEntry>,
    by_file: HashMap<String, u32>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CalendarEntry) -> Result<()> {
        if self.entries.contains_key(&entry.key) {
            bail!("duplicate calendar key {}", entry.key);
        }
        if entry.has_results() {
            if let Some(existing) = self.by_file.get(&entry.file_name) {
                bail!(
                    "result file {} is claimed by calendar keys {existing} and {}",
                    entry.file_name,
                    entry.key
                );
            }
            self.by_file.insert(entry.file_name.clone(), entry.key);
        }
        self.entries.insert(entry.key, entry);
        Ok(())
    }

    pub fn get(&self, key: u32) -> Option<&CalendarEntry> {
        self.entries.get(&key)
    }

    pub fn file_name(&self, key: u32) -> Option<&str> {
        self.entries.get(&key).map(|entry| entry.file_name.as_str())
    }

    pub fn key_for_file(&self, file_name: &str) -> Option<u32> {
        self.by_file.get(file_name).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CalendarEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn load_calendar(path: &Path, properties: &PropertyMap) -> Result<Calendar> {
    let lines = collect_calendar_lines(path, properties)?;
    let mut calendar = Calendar::new();
    for line in &lines {
        let entry = parse_calendar_line(&line.text)
            .with_context(|| format!("bad calendar line at {}", line.location()))?;
        calendar
            .insert(entry)
            .with_context(|| format!("bad calendar line at {}", line.location()))?;
    }
    debug!(
        path = %path.display(),
        entries = calendar.len(),
        "loaded calendar"
    );
    Ok(calendar)
}

pub fn parse_calendar_line(text: &str) -> Result<CalendarEntry> {
    let fields: Vec<&str> = text.split(FIELD_SEPARATOR).map(str::trim).collect();
    if fields.len() < REQUIRED_FIELDS || fields.len() > MAX_FIELDS {
        bail!(
            "expected {REQUIRED_FIELDS} or {MAX_FIELDS} `|`-separated fields, found {}",
            fields.len()
        );
    }

    let key: u32 = fields[0]
        .parse()
        .with_context(|| format!("invalid event key `{}`", fields[0]))?;
    if key == 0 {
        bail!("event key must be positive");
    }
    let distance: f64 = fields[4]
        .parse()
        .with_context(|| format!("invalid distance `{}`", fields[4]))?;
    if !distance.is_finite() || distance <= 0.0 {
        bail!("distance must be a positive number of miles, got `{}`", fields[4]);
    }

    Ok(CalendarEntry {
        key,
        file_name: required(fields[1], "file")?,
        category: required(fields[2], "CAT")?,
        date: parse_event_date(fields[3])?,
        distance,
        event_name: required(fields[5], "event name")?,
        unique_id: required(fields[6], "unique id")?,
        keywords: required(fields[7], "keywords")?,
        link: fields[8].to_string(),
        hr_link: fields
            .get(9)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string()),
    })
}

fn required(value: &str, field: &str) -> Result<String> {
    if value.is_empty() {
        bail!("calendar field `{field}` is empty");
    }
    Ok(value.to_string())
}

fn parse_event_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%m/%d/%Y"))
        .with_context(|| format!("invalid event date `{value}`"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::{Calendar, NO_RESULTS, load_calendar, parse_calendar_line};
    use crate::properties::PropertyMap;

    const BERRYESSA: &str = "2 | 2024-Berryessa.csv | 1 | 2024-06-08 | 1 | Lake Berryessa 1 Mile | 24-berryessa-1 | Berryessa | https://example.org/berryessa";

    #[test]
    fn parses_a_full_line() {
        let entry = parse_calendar_line(&format!("{BERRYESSA} | https://example.org/hr"))
            .expect("parse");
        assert_eq!(entry.key, 2);
        assert_eq!(entry.file_name, "2024-Berryessa.csv");
        assert_eq!(entry.category, "1");
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2024, 6, 8).expect("date"));
        assert_eq!(entry.distance, 1.0);
        assert_eq!(entry.event_name, "Lake Berryessa 1 Mile");
        assert_eq!(entry.unique_id, "24-berryessa-1");
        assert_eq!(entry.keywords, "Berryessa");
        assert_eq!(entry.link, "https://example.org/berryessa");
        assert_eq!(entry.hr_link.as_deref(), Some("https://example.org/hr"));
    }

    #[test]
    fn hr_link_is_optional() {
        let entry = parse_calendar_line(BERRYESSA).expect("parse");
        assert!(entry.hr_link.is_none());
        let entry = parse_calendar_line(&format!("{BERRYESSA} | ")).expect("parse");
        assert!(entry.hr_link.is_none());
    }

    #[test]
    fn accepts_us_style_dates() {
        let entry = parse_calendar_line(
            "4 | NO RESULTS | 2 | 7/4/2024 | 3.107 | Spring Lake 5k | 24-spring | Spring Lake | ",
        )
        .expect("parse");
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2024, 7, 4).expect("date"));
        assert!(!entry.has_results());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_calendar_line("1 | too | few").is_err());
        assert!(parse_calendar_line(&BERRYESSA.replacen("2 |", "x |", 1)).is_err());
        assert!(parse_calendar_line(&BERRYESSA.replace("2024-06-08", "June 8")).is_err());
        assert!(parse_calendar_line(&BERRYESSA.replace("| Berryessa |", "|  |")).is_err());
    }

    #[test]
    fn age_group_file_name_replaces_spaces() {
        let entry = parse_calendar_line(BERRYESSA).expect("parse");
        assert_eq!(
            entry.age_group_file_name(),
            "Lake_Berryessa_1_Mile-cat1-AG.html"
        );
    }

    #[test]
    fn index_works_both_directions() {
        let mut calendar = Calendar::new();
        calendar
            .insert(parse_calendar_line(BERRYESSA).expect("parse"))
            .expect("insert");
        assert_eq!(calendar.file_name(2), Some("2024-Berryessa.csv"));
        assert_eq!(calendar.key_for_file("2024-Berryessa.csv"), Some(2));
        assert_eq!(calendar.key_for_file("other.csv"), None);
    }

    #[test]
    fn sentinel_files_stay_out_of_reverse_index() {
        let mut calendar = Calendar::new();
        for key in [1, 3] {
            let mut entry = parse_calendar_line(BERRYESSA).expect("parse");
            entry.key = key;
            entry.file_name = NO_RESULTS.to_string();
            calendar.insert(entry).expect("insert");
        }
        assert_eq!(calendar.len(), 2);
        assert_eq!(calendar.key_for_file(NO_RESULTS), None);
    }

    #[test]
    fn duplicate_keys_and_files_are_rejected() {
        let mut calendar = Calendar::new();
        let entry = parse_calendar_line(BERRYESSA).expect("parse");
        calendar.insert(entry.clone()).expect("insert");
        assert!(calendar.insert(entry.clone()).is_err());

        let mut other = entry;
        other.key = 9;
        let error = calendar.insert(other).expect_err("same file");
        assert!(error.to_string().contains("claimed by calendar keys 2 and 9"));
    }

    #[test]
    fn load_calendar_reads_block_and_ignores_the_rest() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("calendar-2024.txt");
        fs::write(
            &path,
            format!(
                "Title Season 2024\n>calendar\n1 | NO RESULTS | 1 | 2024-05-01 | 1 | Opener | 24-open | Opener | \n>skip\nnot | a | calendar | line\n>endskip\n{BERRYESSA}\n>endcalendar\n"
            ),
        )
        .expect("write");

        let calendar = load_calendar(&path, &PropertyMap::new()).expect("load");
        assert_eq!(calendar.len(), 2);
        assert_eq!(calendar.get(1).map(|e| e.event_name.as_str()), Some("Opener"));
        let keys: Vec<u32> = calendar.entries().map(|entry| entry.key).collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn load_calendar_reports_line_location() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("calendar-2024.txt");
        fs::write(&path, ">calendar\nbroken line\n>endcalendar\n").expect("write");

        let error = load_calendar(&path, &PropertyMap::new()).expect_err("must fail");
        assert!(error.to_string().contains("calendar-2024.txt:2"));
    }
}
