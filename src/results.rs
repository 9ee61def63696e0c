//! The per-batch result table and its CSV files.
//!
//! Scored files go to `result_<timestamp>.csv` with one column per question;
//! files that could not be scored go to `failures_<timestamp>.csv`. Both are
//! written next to their final name first and renamed into place once
//! complete.

use std::borrow::Cow;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;

use crate::batch::FileError;
use crate::template::QuestionId;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const FAILURES_HEADER: &str = "FileName,ErrorKind,Message";

#[derive(Debug, Clone)]
pub struct ResultRow {
    /// File stem of the scan, or its file name when stems collide.
    pub file_name: String,
    /// Selected label per question, in question order.
    pub answers: Vec<String>,
}

#[derive(Debug)]
pub struct FileFailure {
    pub file_name: String,
    pub error: FileError,
}

#[derive(Debug)]
pub struct ResultTable {
    questions: Vec<QuestionId>,
    rows: Vec<ResultRow>,
    failures: Vec<FileFailure>,
}

/// Paths of the files written for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenResults {
    pub results: PathBuf,
    pub failures: Option<PathBuf>,
}

/// Quotes a field if it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = fields
        .into_iter()
        .map(csv_field)
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.csv`
pub fn timestamped_file_name(prefix: &str, now: &DateTime<Local>) -> String {
    format!("{}_{}.csv", prefix, now.format(TIMESTAMP_FORMAT))
}

/// Writes `contents` to `<path>.partial` and renames it to `path`.
pub fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let result = fs::File::create(&partial).and_then(|mut file| {
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, path)
}

impl ResultTable {
    pub fn new(questions: Vec<QuestionId>) -> Self {
        Self {
            questions,
            rows: vec![],
            failures: vec![],
        }
    }

    pub fn push_row(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn push_failure(&mut self, failure: FileFailure) {
        self.failures.push(failure);
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }

    pub fn results_csv(&self) -> String {
        let mut csv = csv_line(
            std::iter::once("FileName").chain(self.questions.iter().map(QuestionId::as_str)),
        );
        for row in &self.rows {
            let answers = row.answers.iter().map(String::as_str);
            csv.push_str(&csv_line(
                std::iter::once(row.file_name.as_str()).chain(answers),
            ));
        }
        csv
    }

    pub fn failures_csv(&self) -> String {
        let mut csv = format!("{}\n", FAILURES_HEADER);
        for failure in &self.failures {
            let message = failure.error.to_string();
            csv.push_str(&csv_line([
                failure.file_name.as_str(),
                failure.error.kind(),
                message.as_str(),
            ]));
        }
        csv
    }

    /// Writes the result table, and the failure table when any file failed,
    /// into `dir`.
    pub fn write_to(&self, dir: &Path, now: &DateTime<Local>) -> io::Result<WrittenResults> {
        let results_path = dir.join(timestamped_file_name("result", now));
        let failures_path =
            (!self.failures.is_empty()).then(|| dir.join(timestamped_file_name("failures", now)));

        let (results, failures) = rayon::join(
            || write_atomically(&results_path, &self.results_csv()),
            || match &failures_path {
                Some(path) => write_atomically(path, &self.failures_csv()),
                None => Ok(()),
            },
        );
        results?;
        failures?;

        info!(
            "wrote {} rows to {}",
            self.rows.len(),
            results_path.display()
        );
        if let Some(path) = &failures_path {
            info!("wrote {} failures to {}", self.failures.len(), path.display());
        }

        Ok(WrittenResults {
            results: results_path,
            failures: failures_path,
        })
    }
}
