use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use chrono::NaiveDateTime;

use crate::domain::TransferRecord;
use crate::error::DeliveryError;

pub const REPORT_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const HEADER_BLANK_LINES: usize = 2;
const PATH_PREFIX_SEGMENTS: usize = 3;
const FILE_LEVEL: &str = "1";

const COL_LEVEL: &str = "level";
const COL_PATH: &str = "file_path";
const COL_USER: &str = "ssh_user";
const COL_STOPPED: &str = "stopped_at";
const COL_BYTES: &str = "bytes_transferred";

#[derive(Debug, Clone, Copy)]
struct Columns {
    level: usize,
    path: usize,
    user: usize,
    stopped: usize,
    bytes: usize,
}

/// Single-pass reader over a transfer-audit export. Yields file-level rows only.
pub struct TransferReport<R: BufRead> {
    source_name: String,
    lines: Lines<R>,
    line_no: usize,
    columns: Option<Columns>,
    failed: bool,
}

impl TransferReport<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, DeliveryError> {
        let file = File::open(path).map_err(|err| {
            DeliveryError::Filesystem(format!("open report {}: {err}", path.display()))
        })?;
        Self::from_reader(&path.display().to_string(), BufReader::new(file))
    }
}

impl<R: BufRead> TransferReport<R> {
    pub fn from_reader(source_name: &str, reader: R) -> Result<Self, DeliveryError> {
        let mut report = Self {
            source_name: source_name.to_string(),
            lines: reader.lines(),
            line_no: 0,
            columns: None,
            failed: false,
        };
        report.skip_preamble()?;
        report.columns = report.read_columns()?;
        Ok(report)
    }

    fn next_line(&mut self) -> Option<Result<String, DeliveryError>> {
        let line = self.lines.next()?;
        self.line_no += 1;
        Some(line.map_err(|err| {
            DeliveryError::format(&self.source_name, self.line_no, format!("read error: {err}"))
        }))
    }

    fn skip_preamble(&mut self) -> Result<(), DeliveryError> {
        let mut blank_lines = 0;
        while blank_lines < HEADER_BLANK_LINES {
            match self.next_line() {
                Some(line) => {
                    if line?.trim().is_empty() {
                        blank_lines += 1;
                    }
                }
                None => {
                    return Err(DeliveryError::format(
                        &self.source_name,
                        self.line_no,
                        "report ended before the end of its header block",
                    ));
                }
            }
        }
        Ok(())
    }

    fn read_columns(&mut self) -> Result<Option<Columns>, DeliveryError> {
        let header = loop {
            match self.next_line() {
                Some(line) => {
                    let line = line?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(None),
            }
        };
        let names = split_csv_line(&header)
            .map_err(|message| DeliveryError::format(&self.source_name, self.line_no, message))?;
        let find = |name: &str| {
            names
                .iter()
                .position(|col| col.trim() == name)
                .ok_or_else(|| {
                    DeliveryError::format(
                        &self.source_name,
                        self.line_no,
                        format!("missing column {name}"),
                    )
                })
        };
        Ok(Some(Columns {
            level: find(COL_LEVEL)?,
            path: find(COL_PATH)?,
            user: find(COL_USER)?,
            stopped: find(COL_STOPPED)?,
            bytes: find(COL_BYTES)?,
        }))
    }

    fn parse_row(
        &self,
        columns: Columns,
        line: &str,
    ) -> Result<Option<TransferRecord>, DeliveryError> {
        let fail =
            |message: String| DeliveryError::format(&self.source_name, self.line_no, message);
        let fields = split_csv_line(line).map_err(fail)?;
        let field = |idx: usize, name: &str| {
            fields
                .get(idx)
                .map(String::as_str)
                .ok_or_else(|| fail(format!("row is missing field {name}")))
        };

        if field(columns.level, COL_LEVEL)? != FILE_LEVEL {
            return Ok(None);
        }

        let raw_path = field(columns.path, COL_PATH)?;
        let stopped_at = field(columns.stopped, COL_STOPPED)?;
        let completed_at = NaiveDateTime::parse_from_str(stopped_at.trim(), REPORT_TIME_FORMAT)
            .map_err(|err| fail(format!("invalid {COL_STOPPED} '{stopped_at}': {err}")))?;
        let bytes = field(columns.bytes, COL_BYTES)?;
        let bytes_transferred = bytes
            .trim()
            .parse::<u64>()
            .map_err(|_| fail(format!("invalid {COL_BYTES} '{bytes}'")))?;

        Ok(Some(TransferRecord {
            relative_path: strip_transfer_prefix(raw_path),
            operator: field(columns.user, COL_USER)?.to_string(),
            completed_at,
            bytes_transferred,
        }))
    }
}

impl<R: BufRead> Iterator for TransferReport<R> {
    type Item = Result<TransferRecord, DeliveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let columns = self.columns?;
        loop {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_row(columns, &line) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Parses a whole report. Any malformed row rejects the report.
pub fn parse_transfer_report(path: &Path) -> Result<Vec<TransferRecord>, DeliveryError> {
    TransferReport::open(path)?.collect()
}

pub fn strip_transfer_prefix(raw_path: &str) -> String {
    raw_path
        .split('/')
        .skip(PATH_PREFIX_SEGMENTS)
        .collect::<Vec<_>>()
        .join("/")
}

fn split_csv_line(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            '\r' if !in_quotes && chars.peek().is_none() => {}
            _ => current.push(ch),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
