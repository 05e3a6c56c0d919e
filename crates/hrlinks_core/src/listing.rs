use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

/// Filenames present in the production results directory for one season.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductionListing {
    pub files: Vec<String>,
    /// Problems reported by the listing command. The listing may be empty or
    /// partial when this is non-empty.
    pub diagnostics: Vec<String>,
}

impl ProductionListing {
    pub fn from_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            diagnostics: Vec::new(),
        }
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.files.iter().any(|file| file == file_name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub trait FileLister {
    fn list_results(&mut self, year: i32) -> Result<ProductionListing>;
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub ssh_command: String,
    pub user: String,
    pub host: String,
    /// Remote directory of the season being processed, macros expanded.
    pub results_dir: String,
}

/// Lists the production directory with `ssh <user>@<host> ls -1 <dir>`.
/// No retry and no timeout: the call blocks until ssh returns.
#[derive(Debug, Clone)]
pub struct SshFileLister {
    target: SshTarget,
}

impl SshFileLister {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn remote_dir(&self) -> &str {
        &self.target.results_dir
    }

    pub fn command_args(&self) -> Vec<String> {
        vec![
            format!("{}@{}", self.target.user, self.target.host),
            "ls".to_string(),
            "-1".to_string(),
            self.target.results_dir.clone(),
        ]
    }
}

impl FileLister for SshFileLister {
    fn list_results(&mut self, year: i32) -> Result<ProductionListing> {
        let args = self.command_args();
        debug!(command = %self.target.ssh_command, year, ?args, "listing production directory");
        let output = Command::new(&self.target.ssh_command)
            .args(&args)
            .output()
            .with_context(|| format!("failed to execute {}", self.target.ssh_command))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut listing = ProductionListing {
            files: parse_listing(&stdout),
            diagnostics: Vec::new(),
        };
        if !output.status.success() {
            listing.diagnostics.push(format!(
                "`{} {}` exited with {}",
                self.target.ssh_command,
                args.join(" "),
                output.status
            ));
        }
        for line in stderr.lines().map(str::trim).filter(|line| !line.is_empty()) {
            listing.diagnostics.push(format!("remote stderr: {line}"));
        }
        Ok(listing)
    }
}

pub fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{FileLister, ProductionListing, SshFileLister, SshTarget, parse_listing};

    fn target(command: &str) -> SshTarget {
        SshTarget {
            ssh_command: command.to_string(),
            user: "pms".to_string(),
            host: "production".to_string(),
            results_dir: "public_html/results/ow/2024".to_string(),
        }
    }

    #[test]
    fn parse_listing_splits_one_name_per_line() {
        let files = parse_listing("a-cat1-AG.html\nb-cat2-AG.html\r\n\n");
        assert_eq!(files, vec!["a-cat1-AG.html", "b-cat2-AG.html"]);
        assert!(parse_listing("").is_empty());
    }

    #[test]
    fn listing_contains_exact_names_only() {
        let listing = ProductionListing::from_files(["Lake_Berryessa_1_Mile-cat1-AG.html"]);
        assert!(listing.contains("Lake_Berryessa_1_Mile-cat1-AG.html"));
        assert!(!listing.contains("Lake_Berryessa_1_Mile-cat1-AG"));
        assert!(!listing.contains("lake_berryessa_1_mile-cat1-AG.html"));
    }

    #[test]
    fn command_targets_year_directory() {
        let lister = SshFileLister::new(target("ssh"));
        assert_eq!(
            lister.command_args(),
            vec![
                "pms@production".to_string(),
                "ls".to_string(),
                "-1".to_string(),
                "public_html/results/ow/2024".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_yields_diagnostics_not_error() {
        let mut lister = SshFileLister::new(target("false"));
        let listing = lister.list_results(2024).expect("listing");
        assert!(listing.is_empty());
        assert_eq!(listing.diagnostics.len(), 1);
        assert!(listing.diagnostics[0].contains("exited with"));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let mut lister = SshFileLister::new(target("/nonexistent/hrlinks-ssh"));
        let error = lister.list_results(2024).expect_err("must fail");
        assert!(error.to_string().contains("failed to execute"));
    }
}
