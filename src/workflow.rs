use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::WorkflowTarget;
use crate::error::DeliveryError;
use crate::lims::{Artifact, LimsClient, StepRef};

/// Lifecycle of a confirmation step. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    /// Created over queued artifacts, still recording details.
    Queued,
    /// Advanced once; waiting on its next actions.
    Advancing,
    Complete,
}

impl StepPhase {
    pub fn next(self) -> Option<StepPhase> {
        match self {
            StepPhase::Queued => Some(StepPhase::Advancing),
            StepPhase::Advancing => Some(StepPhase::Complete),
            StepPhase::Complete => None,
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Queued => write!(f, "queued"),
            StepPhase::Advancing => write!(f, "advancing"),
            StepPhase::Complete => write!(f, "complete"),
        }
    }
}

pub struct StepDriver<'a, L: LimsClient> {
    lims: &'a L,
    step: StepRef,
    phase: StepPhase,
}

impl<'a, L: LimsClient> StepDriver<'a, L> {
    pub fn new(lims: &'a L, step: StepRef) -> Self {
        Self {
            lims,
            step,
            phase: StepPhase::Queued,
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn step(&self) -> &StepRef {
        &self.step
    }

    /// Performs the single external transition out of the current phase.
    /// Every transition is one advance; completing requires the next actions
    /// to be set first.
    pub fn advance(&mut self) -> Result<StepPhase, DeliveryError> {
        let next = self
            .phase
            .next()
            .ok_or_else(|| DeliveryError::InvalidTransition {
                step: self.step.limsid.clone(),
                phase: self.phase.to_string(),
            })?;
        if next == StepPhase::Complete {
            self.lims.complete_next_actions(&self.step)?;
        }
        self.lims.advance_step(&self.step)?;
        info!(step = %self.step.limsid, from = %self.phase, to = %next, "step advanced");
        self.phase = next;
        Ok(next)
    }

    pub fn run_to_completion(&mut self) -> Result<(), DeliveryError> {
        while self.phase != StepPhase::Complete {
            self.advance()?;
        }
        Ok(())
    }
}

/// Sample ids found complete during a run, waiting to be confirmed in the LIMS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmedSamples(BTreeSet<String>);

impl ConfirmedSamples {
    pub fn insert(&mut self, sample_id: &str) -> bool {
        self.0.insert(sample_id.to_string())
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.0.contains(sample_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationReport {
    pub already_queued: Vec<String>,
    pub newly_queued: Vec<String>,
    pub not_in_lims: Vec<String>,
    pub step: Option<StepRef>,
    pub phase: Option<StepPhase>,
}

pub struct WorkflowSynchronizer<L: LimsClient> {
    lims: L,
    target: WorkflowTarget,
}

impl<L: LimsClient> WorkflowSynchronizer<L> {
    pub fn new(lims: L, target: WorkflowTarget) -> Self {
        Self { lims, target }
    }

    /// Queues what is missing from the stage queue, then runs one step over
    /// every confirmed artifact to completion. The accumulator is cleared only
    /// when every call succeeded.
    pub fn confirm(
        &self,
        confirmed: &mut ConfirmedSamples,
    ) -> Result<Option<ConfirmationReport>, DeliveryError> {
        if confirmed.is_empty() {
            return Ok(None);
        }
        info!(
            samples = confirmed.len(),
            stage = %self.target.stage,
            "confirming samples in LIMS"
        );

        let stage = self.lims.workflow_stage(&self.target)?;
        let queue = self.lims.queued_artifacts(&stage)?;

        let mut inputs: Vec<Artifact> = Vec::new();
        let mut queued_names = BTreeSet::new();
        for artifact in queue {
            queued_names.insert(artifact.sample_name.clone());
            if confirmed.contains(&artifact.sample_name) {
                inputs.push(artifact);
            }
        }
        let already_queued = confirmed
            .iter()
            .filter(|name| queued_names.contains(*name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        let not_queued = confirmed
            .iter()
            .filter(|name| !queued_names.contains(*name))
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut newly_queued = Vec::new();
        let mut not_in_lims = Vec::new();
        if !not_queued.is_empty() {
            let artifacts = self.lims.sample_artifacts(&not_queued)?;
            let found: BTreeSet<&str> = artifacts
                .iter()
                .map(|artifact| artifact.sample_name.as_str())
                .collect();
            not_in_lims = not_queued
                .iter()
                .filter(|name| !found.contains(name.as_str()))
                .cloned()
                .collect();
            for name in &not_in_lims {
                warn!(sample = %name, "confirmed sample not found in LIMS");
            }
            if !artifacts.is_empty() {
                self.lims.route_artifacts(&artifacts, &stage)?;
                info!(count = artifacts.len(), "queued confirmed samples");
                newly_queued = artifacts.iter().map(|a| a.sample_name.clone()).collect();
                inputs.extend(artifacts);
            }
        }

        if inputs.is_empty() {
            warn!("no confirmed sample has an artifact to confirm");
            confirmed.clear();
            return Ok(Some(ConfirmationReport {
                already_queued,
                newly_queued,
                not_in_lims,
                step: None,
                phase: None,
            }));
        }

        let step = self.lims.create_step(&stage, &inputs)?;
        info!(step = %step.limsid, inputs = inputs.len(), "created confirmation step");
        let mut driver = StepDriver::new(&self.lims, step);
        driver.run_to_completion()?;

        confirmed.clear();
        Ok(Some(ConfirmationReport {
            already_queued,
            newly_queued,
            not_in_lims,
            step: Some(driver.step().clone()),
            phase: Some(driver.phase()),
        }))
    }
}
