use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Flat name→value mapping built from layered property files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    values: BTreeMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every `{name}` token in `template` with its current value.
    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                bail!("unterminated macro in `{template}`");
            };
            let name = &after[..close];
            match self.get(name) {
                Some(value) => out.push_str(value),
                None => bail!("undefined macro {{{name}}} in `{template}`"),
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub file: PathBuf,
    pub line: usize,
    pub text: String,
}

impl SourceLine {
    pub fn location(&self) -> String {
        format!("{}:{}", self.file.display(), self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Assign { name: String, value: String, line: usize },
    Include { path: String, line: usize },
    Calendar(Vec<SourceLine>),
    EndOfFile,
}

/// One property file parsed into directives. Skip blocks are consumed by the
/// parser and leave no trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDocument {
    pub path: PathBuf,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Assignments apply, calendar blocks are ignored.
    Properties,
    /// Calendar lines are collected, assignments are ignored.
    Calendar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Include(String),
    Skip,
    EndSkip,
    Calendar,
    EndCalendar,
    EndOfFile,
}

#[derive(Debug, Clone)]
struct LogicalLine {
    number: usize,
    text: String,
}

pub fn parse_document(path: &Path, content: &str) -> Result<PropertyDocument> {
    let lines = logical_lines(content);
    let mut parser = Parser {
        path,
        lines: &lines,
        position: 0,
    };
    let items = parser.parse_items()?;
    Ok(PropertyDocument {
        path: path.to_path_buf(),
        items,
    })
}

pub fn read_document(path: &Path) -> Result<PropertyDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to open property file {}", path.display()))?;
    parse_document(path, &content)
}

/// Parse `path` and every file it includes into `properties`.
pub fn load_properties(path: &Path, properties: &mut PropertyMap) -> Result<()> {
    let mut calendar = Vec::new();
    Evaluator {
        mode: Mode::Properties,
        properties,
        calendar: &mut calendar,
        stack: Vec::new(),
    }
    .evaluate_file(path)
}

/// Collect the calendar lines of `path` and its includes. The property map is
/// only read for include macro substitution.
pub fn collect_calendar_lines(path: &Path, properties: &PropertyMap) -> Result<Vec<SourceLine>> {
    let mut scratch = properties.clone();
    let mut calendar = Vec::new();
    Evaluator {
        mode: Mode::Calendar,
        properties: &mut scratch,
        calendar: &mut calendar,
        stack: Vec::new(),
    }
    .evaluate_file(path)?;
    Ok(calendar)
}

struct Evaluator<'a> {
    mode: Mode,
    properties: &'a mut PropertyMap,
    calendar: &'a mut Vec<SourceLine>,
    stack: Vec<PathBuf>,
}

impl Evaluator<'_> {
    fn evaluate_file(&mut self, path: &Path) -> Result<()> {
        if self.stack.iter().any(|open| open == path) {
            bail!("include cycle detected at {}", path.display());
        }
        let document = read_document(path)?;
        self.stack.push(path.to_path_buf());
        let result = self.evaluate_document(&document);
        self.stack.pop();
        result
    }

    fn evaluate_document(&mut self, document: &PropertyDocument) -> Result<()> {
        for item in &document.items {
            match item {
                Item::Assign { name, value, .. } => {
                    if self.mode == Mode::Properties {
                        self.properties.set(name.clone(), value.clone());
                    }
                }
                Item::Include { path, line } => {
                    let expanded = self.properties.expand(path).with_context(|| {
                        format!("bad include at {}:{line}", document.path.display())
                    })?;
                    let target = resolve_include(&document.path, &expanded);
                    debug!(
                        from = %document.path.display(),
                        include = %target.display(),
                        "resolving include"
                    );
                    self.evaluate_file(&target).with_context(|| {
                        format!("included from {}:{line}", document.path.display())
                    })?;
                }
                Item::Calendar(lines) => {
                    if self.mode == Mode::Calendar {
                        self.calendar.extend(lines.iter().cloned());
                    }
                }
                Item::EndOfFile => break,
            }
        }
        Ok(())
    }
}

fn resolve_include(from: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match from.parent() {
        Some(parent) => parent.join(target),
        None => target.to_path_buf(),
    }
}

struct Parser<'a> {
    path: &'a Path,
    lines: &'a [LogicalLine],
    position: usize,
}

impl Parser<'_> {
    fn next_line(&mut self) -> Option<&LogicalLine> {
        let line = self.lines.get(self.position)?;
        self.position += 1;
        Some(line)
    }

    fn parse_items(&mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        while let Some(line) = self.next_line().cloned() {
            match directive(&line.text) {
                Some(Ok(Directive::Include(path))) => items.push(Item::Include {
                    path,
                    line: line.number,
                }),
                Some(Ok(Directive::Skip)) => self.skip_block(line.number)?,
                Some(Ok(Directive::Calendar)) => {
                    items.push(Item::Calendar(self.calendar_block(line.number)?))
                }
                Some(Ok(Directive::EndOfFile)) => {
                    items.push(Item::EndOfFile);
                    break;
                }
                Some(Ok(Directive::EndSkip)) => {
                    bail!("{}: >endskip without >skip", self.location(line.number))
                }
                Some(Ok(Directive::EndCalendar)) => {
                    bail!(
                        "{}: >endcalendar without >calendar",
                        self.location(line.number)
                    )
                }
                Some(Err(keyword)) => {
                    bail!(
                        "{}: unknown directive >{keyword}",
                        self.location(line.number)
                    )
                }
                None => {
                    let (name, value) = split_assignment(&line.text);
                    items.push(Item::Assign {
                        name: name.to_string(),
                        value: value.to_string(),
                        line: line.number,
                    });
                }
            }
        }
        Ok(items)
    }

    fn skip_block(&mut self, start: usize) -> Result<()> {
        while let Some(line) = self.next_line() {
            if matches!(directive(&line.text), Some(Ok(Directive::EndSkip))) {
                return Ok(());
            }
        }
        bail!("{}: unterminated >skip block", self.location(start))
    }

    fn calendar_block(&mut self, start: usize) -> Result<Vec<SourceLine>> {
        let mut out = Vec::new();
        while let Some(line) = self.next_line().cloned() {
            match directive(&line.text) {
                Some(Ok(Directive::EndCalendar)) => return Ok(out),
                Some(Ok(Directive::Skip)) => self.skip_block(line.number)?,
                Some(Ok(Directive::Calendar)) => {
                    bail!("{}: nested >calendar block", self.location(line.number))
                }
                _ => out.push(SourceLine {
                    file: self.path.to_path_buf(),
                    line: line.number,
                    text: line.text,
                }),
            }
        }
        bail!("{}: unterminated >calendar block", self.location(start))
    }

    fn location(&self, line: usize) -> String {
        format!("{}:{line}", self.path.display())
    }
}

/// `Some(Err(keyword))` for an unrecognized `>` directive.
fn directive(text: &str) -> Option<std::result::Result<Directive, String>> {
    let body = text.strip_prefix('>')?;
    let (keyword, rest) = match body.find(char::is_whitespace) {
        Some(split) => (&body[..split], body[split..].trim()),
        None => (body, ""),
    };
    let parsed = match keyword.to_ascii_lowercase().as_str() {
        "include" => Directive::Include(rest.to_string()),
        "skip" => Directive::Skip,
        "endskip" => Directive::EndSkip,
        "calendar" => Directive::Calendar,
        "endcalendar" => Directive::EndCalendar,
        "endoffile" => Directive::EndOfFile,
        _ => return Some(Err(keyword.to_string())),
    };
    Some(Ok(parsed))
}

fn split_assignment(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(split) => (&text[..split], text[split..].trim()),
        None => (text, ""),
    }
}

fn strip_comment(raw: &str) -> &str {
    match raw.find('#') {
        Some(index) => &raw[..index],
        None => raw,
    }
}

fn logical_lines(content: &str) -> Vec<LogicalLine> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in content.lines().enumerate() {
        let text = strip_comment(raw).trim();
        let (start, joined) = match pending.take() {
            Some((start, head)) => (start, join_continuation(&head, text)),
            None => (index + 1, text.to_string()),
        };
        match joined.strip_suffix('\\') {
            Some(head) => pending = Some((start, head.to_string())),
            None => push_logical(&mut out, start, joined),
        }
    }
    // A dangling continuation at end of file keeps what was accumulated.
    if let Some((start, head)) = pending {
        push_logical(&mut out, start, head);
    }
    out
}

fn join_continuation(head: &str, next: &str) -> String {
    let trimmed = head.trim();
    if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
        format!("{trimmed} {next}")
    } else {
        format!("{head}{next}")
    }
}

fn push_logical(out: &mut Vec<LogicalLine>, number: usize, text: String) {
    let text = text.trim();
    if !text.is_empty() {
        out.push(LogicalLine {
            number,
            text: text.to_string(),
        });
    }
}
