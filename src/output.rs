use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CheckStatus, RunResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        Self::write_run(&mut stdout, result)
    }

    pub fn write_run<W: Write>(out: &mut W, result: &RunResult) -> io::Result<()> {
        if let Some(ingest) = &result.ingest {
            writeln!(
                out,
                "Reports: {} ({} transfers, {} attributed, {} unattributable)",
                ingest.reports.len(),
                ingest.records,
                ingest.attributed,
                ingest.unattributable.len()
            )?;
            writeln!(
                out,
                "Recorded {} new downloads across {} samples",
                ingest.files_recorded, ingest.samples_updated
            )?;
        }

        for check in &result.checks {
            let label = match check.status {
                CheckStatus::Complete => "complete".to_string(),
                CheckStatus::Incomplete => format!("{} files missing", check.missing.len()),
                CheckStatus::NoManifest => "no delivered files known".to_string(),
                CheckStatus::NoData => "no data".to_string(),
            };
            if check.requested_id == check.sample_id {
                writeln!(out, "{}: {label}", check.sample_id)?;
            } else {
                writeln!(out, "{} ({}): {label}", check.sample_id, check.requested_id)?;
            }
            for path in &check.missing {
                writeln!(out, "    - {path}")?;
            }
        }

        if let Some(confirmation) = &result.confirmation {
            match &confirmation.step {
                Some(step) => writeln!(
                    out,
                    "Confirmed {} samples in LIMS step {} ({} newly queued)",
                    confirmation.already_queued.len() + confirmation.newly_queued.len(),
                    step.limsid,
                    confirmation.newly_queued.len()
                )?,
                None => writeln!(out, "No samples could be confirmed in LIMS")?,
            }
            for name in &confirmation.not_in_lims {
                writeln!(out, "    not in LIMS: {name}")?;
            }
        }
        Ok(())
    }
}
