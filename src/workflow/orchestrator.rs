//! Workflow orchestrator - drives a research record through its phases
//!
//! This module contains the run loop that takes a research record from source
//! processing through outline generation, section drafting, and export:
//! - Status transitions gated by the capability flags
//! - Phase selection derived from persisted entities on every step
//! - Cooperative cancellation between units of work
//! - Failure context for resuming

use crate::config::Config;
use crate::crawler::{ContentFetcher, Disposition, ScheduleReport, SourceScheduler};
use crate::document::{ExportFormat, ExportService, SectionService, SectionTree};
use crate::sources::SourceManager;
use crate::state::{
    ResearchStatus, SectionStatus, SourceStatus, SourceType, WorkflowCapabilities, WorkflowPhase,
};
use crate::storage::{
    lock, timestamp_now, ResearchRecord, SectionRecord, SharedStorage, SourceRecord,
    StorageError,
};
use crate::workflow::drafter::{DraftError, DraftedSection, Drafter, SectionBrief, SourceDigest};
use crate::workflow::phase::derive_phase;
use crate::{ResearchError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shape of a generated outline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlineOptions {
    /// Number of top-level sections
    pub sections_count: u32,
    /// Nesting depth; 1 means no subsections
    pub depth: u32,
}

impl OutlineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sections_count: config.workflow.sections_count,
            depth: config.workflow.outline_depth,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=50).contains(&self.sections_count) {
            return Err(ResearchError::Validation(format!(
                "sections_count must be between 1 and 50, got {}",
                self.sections_count
            )));
        }
        if !(1..=3).contains(&self.depth) {
            return Err(ResearchError::Validation(format!(
                "depth must be between 1 and 3, got {}",
                self.depth
            )));
        }
        Ok(())
    }
}

/// Result of a `stop_workflow` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// A run in this process was asked to pause after its current unit
    Signalled,
    /// No run was active here; the record was paused directly
    Paused,
    /// The record was not running
    NotRunning(ResearchStatus),
}

/// How a call to `execute_workflow` or `resume_workflow` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The status did not allow the call; nothing happened
    NotStarted(ResearchStatus),
    Completed,
    /// Stopped through `stop_workflow` in this process
    Paused,
    /// The persisted status left `running` while the run was active
    Interrupted(ResearchStatus),
    Failed {
        phase: WorkflowPhase,
        entity_id: Option<String>,
        message: String,
    },
}

/// Context of the last failed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFailure {
    pub phase: Option<WorkflowPhase>,
    pub entity_id: Option<String>,
    pub message: Option<String>,
}

/// Snapshot returned by `get_workflow_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStatus {
    pub research_id: String,
    pub status: ResearchStatus,
    pub capabilities: WorkflowCapabilities,
    pub phase: WorkflowPhase,
    pub failure: Option<WorkflowFailure>,
}

/// Drives research records through the workflow phases
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    storage: SharedStorage,
    config: Arc<Config>,
    drafter: Arc<dyn Drafter>,
    sources: SourceManager,
    sections: SectionService,
    exports: ExportService,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator over a storage handle
    ///
    /// # Arguments
    ///
    /// * `storage` - Shared storage for all entities
    /// * `config` - Validated configuration
    /// * `fetcher` - Content fetcher used for source processing
    /// * `drafter` - Outline and section generator
    pub fn new(
        storage: SharedStorage,
        config: Config,
        fetcher: Arc<dyn ContentFetcher>,
        drafter: Arc<dyn Drafter>,
    ) -> Self {
        let sources = SourceManager::new(storage.clone(), fetcher, &config);
        let sections = SectionService::new(storage.clone());
        let exports = ExportService::new(storage.clone(), config.export.ttl());

        Self {
            storage,
            config: Arc::new(config),
            drafter,
            sources,
            sections,
            exports,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn sections(&self) -> &SectionService {
        &self.sections
    }

    pub fn exports(&self) -> &ExportService {
        &self.exports
    }

    fn active(&self) -> Result<MutexGuard<'_, HashMap<String, CancellationToken>>> {
        self.active
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()).into())
    }

    /// Creates a research record in `initializing`
    pub fn create_research(
        &self,
        topic: &str,
        description: Option<&str>,
        strategy: &str,
    ) -> Result<ResearchRecord> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ResearchError::Validation("topic must not be empty".to_string()));
        }

        let record = ResearchRecord::new(topic, description, strategy);
        lock(&self.storage)?.insert_research(&record)?;
        info!("Created research {} ({})", record.id, record.topic);
        Ok(record)
    }

    pub fn get_research(&self, research_id: &str) -> Result<ResearchRecord> {
        lock(&self.storage)?
            .get_research(research_id)?
            .ok_or_else(|| ResearchError::not_found("research", research_id))
    }

    pub fn list_sources(&self, research_id: &str) -> Result<Vec<SourceRecord>> {
        self.get_research(research_id)?;
        Ok(lock(&self.storage)?.list_sources(research_id)?)
    }

    /// Adds a source; duplicates of an existing canonical URL return the existing source
    pub fn add_source(
        &self,
        research_id: &str,
        url: &str,
        source_type: SourceType,
    ) -> Result<SourceRecord> {
        self.sources.add_source(research_id, url, source_type)
    }

    /// Moves a failed source back to `pending`
    pub fn retry_source(&self, source_id: &str) -> Result<bool> {
        self.sources.retry(source_id)
    }

    /// Starts the workflow of a fresh research record
    ///
    /// Does nothing unless the record is `initializing`.
    ///
    /// # Returns
    ///
    /// * `Ok(RunOutcome)` - How the run ended, including workflow failures
    /// * `Err(ResearchError::Precondition)` - The record has no sources
    /// * `Err(ResearchError)` - Storage failure or unknown id
    pub async fn execute_workflow(&self, research_id: &str) -> Result<RunOutcome> {
        let record = self.get_research(research_id)?;
        if !record.status.capabilities().can_execute {
            debug!("Research {} is {}, not executing", research_id, record.status);
            return Ok(RunOutcome::NotStarted(record.status));
        }

        if lock(&self.storage)?.list_sources(research_id)?.is_empty() {
            return Err(ResearchError::Precondition(format!(
                "research {} has no sources",
                research_id
            )));
        }

        if let Some(status) = self.enter_running(research_id, |c| c.can_execute)? {
            return Ok(RunOutcome::NotStarted(status));
        }
        info!("Executing workflow for research {}", research_id);
        self.drive(research_id).await
    }

    /// Continues a paused or failed workflow from its first unfinished phase
    ///
    /// Failed sources are retried, work stranded by an interrupted run is
    /// returned to `pending`, and finished sources and sections are kept.
    pub async fn resume_workflow(&self, research_id: &str) -> Result<RunOutcome> {
        let record = self.get_research(research_id)?;
        if !record.status.capabilities().can_resume {
            debug!("Research {} is {}, not resuming", research_id, record.status);
            return Ok(RunOutcome::NotStarted(record.status));
        }

        if let Some(status) = self.enter_running(research_id, |c| c.can_resume)? {
            return Ok(RunOutcome::NotStarted(status));
        }

        let failed: Vec<String> = lock(&self.storage)?
            .list_sources(research_id)?
            .into_iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .map(|s| s.id)
            .collect();
        for source_id in &failed {
            self.sources.retry(source_id)?;
        }
        self.sources.recover_interrupted(research_id)?;
        let released = self.release_stranded_sections(research_id)?;

        info!(
            "Resuming workflow for research {} ({} sources retried, {} sections released)",
            research_id,
            failed.len(),
            released
        );
        self.drive(research_id).await
    }

    /// Requests a running workflow to pause
    ///
    /// A run active in this process finishes its current source or section
    /// first. Otherwise the record is paused directly, and a run in another
    /// process stops when it next checks the status.
    pub fn stop_workflow(&self, research_id: &str) -> Result<StopOutcome> {
        let record = self.get_research(research_id)?;
        if !record.status.capabilities().can_stop {
            return Ok(StopOutcome::NotRunning(record.status));
        }

        if let Some(token) = self.active()?.get(research_id) {
            token.cancel();
            info!("Stop requested for research {}", research_id);
            return Ok(StopOutcome::Signalled);
        }

        match self.pause(research_id)? {
            RunOutcome::Paused => Ok(StopOutcome::Paused),
            _ => Ok(StopOutcome::NotRunning(self.get_research(research_id)?.status)),
        }
    }

    /// Creates the section outline once every source is complete
    ///
    /// Returns the existing sections unchanged when an outline already exists.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<SectionRecord>)` - The sections of the outline
    /// * `Err(ResearchError::Precondition)` - Some source is not complete; nothing was created
    /// * `Err(ResearchError::Drafting | Timeout)` - The drafter failed
    pub async fn generate_outline(
        &self,
        research_id: &str,
        options: OutlineOptions,
    ) -> Result<Vec<SectionRecord>> {
        options.validate()?;
        let research = self.get_research(research_id)?;

        {
            let storage = lock(&self.storage)?;
            let sources = storage.list_sources(research_id)?;
            let unfinished = sources
                .iter()
                .filter(|s| s.status != SourceStatus::Complete)
                .count();
            if sources.is_empty() || unfinished > 0 {
                return Err(ResearchError::Precondition(format!(
                    "outline needs all sources complete ({} of {} are not)",
                    unfinished,
                    sources.len()
                )));
            }

            let existing = storage.list_sections(research_id)?;
            if !existing.is_empty() {
                debug!("Research {} already has an outline", research_id);
                return Ok(existing);
            }
        }

        let digests = self.digests(research_id)?;
        let outline = match tokio::time::timeout(
            self.config.workflow.draft_timeout(),
            self.drafter.generate_outline(
                &research.topic,
                &digests,
                options.sections_count,
                options.depth,
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ResearchError::Timeout {
                    operation: "outline generation",
                    id: research_id.to_string(),
                })
            }
        };
        if outline.is_empty() {
            return Err(DraftError::Failed("drafter returned an empty outline".to_string()).into());
        }

        // Another caller may have finished first while the drafter ran
        let existing = lock(&self.storage)?.list_sections(research_id)?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        self.sections.create_outline(research_id, &outline)
    }

    /// Drafts one pending section
    ///
    /// On drafter failure or timeout the section goes back to `pending` and
    /// the error is returned.
    pub async fn build_section(&self, section_id: &str) -> Result<SectionRecord> {
        let now = timestamp_now();
        let mut claimed = false;
        let section = lock(&self.storage)?
            .modify_section(section_id, &mut |section| {
                if section.status != SectionStatus::Pending {
                    return false;
                }
                section.status = SectionStatus::Drafting;
                section.updated_at = now;
                claimed = true;
                true
            })?
            .ok_or_else(|| ResearchError::not_found("section", section_id))?;
        if !claimed {
            return Err(ResearchError::Precondition(format!(
                "section {} is {}, expected pending",
                section_id, section.status
            )));
        }

        let drafted = match self.draft(&section).await {
            Ok(drafted) => drafted,
            Err(e) => {
                self.release_section(section_id)?;
                warn!("Drafting section {} failed: {}", section_id, e);
                return Err(e);
            }
        };

        let now = timestamp_now();
        let built = lock(&self.storage)?
            .modify_section(section_id, &mut |section| {
                if !section.status.can_transition_to(SectionStatus::Complete) {
                    return false;
                }
                section.status = SectionStatus::Complete;
                section.content = Some(drafted.content.clone());
                section.word_count = Some(drafted.word_count);
                section.token_count = Some(drafted.token_count);
                section.updated_at = now;
                true
            })?
            .ok_or_else(|| ResearchError::not_found("section", section_id))?;

        info!(
            "Built section '{}' ({} words)",
            built.title,
            built.word_count.unwrap_or(0)
        );
        Ok(built)
    }

    /// Reports status, capabilities, derived phase, and failure context
    pub fn get_workflow_status(&self, research_id: &str) -> Result<WorkflowStatus> {
        let record = self.get_research(research_id)?;
        let phase = self.current_phase(research_id)?;

        let failure = if record.failed_phase.is_some()
            || record.failed_entity_id.is_some()
            || record.error_message.is_some()
        {
            Some(WorkflowFailure {
                phase: record.failed_phase,
                entity_id: record.failed_entity_id.clone(),
                message: record.error_message.clone(),
            })
        } else {
            None
        };

        Ok(WorkflowStatus {
            research_id: record.id,
            status: record.status,
            capabilities: record.status.capabilities(),
            phase,
            failure,
        })
    }

    fn current_phase(&self, research_id: &str) -> Result<WorkflowPhase> {
        let storage = lock(&self.storage)?;
        let sources = storage.list_sources(research_id)?;
        let sections = storage.list_sections(research_id)?;
        let has_export = !storage.list_exports(research_id)?.is_empty();
        Ok(derive_phase(&sources, &sections, has_export))
    }

    /// Moves the record to `running` if `allowed` holds for its current status
    ///
    /// Returns the blocking status when it does not.
    fn enter_running(
        &self,
        research_id: &str,
        allowed: fn(&WorkflowCapabilities) -> bool,
    ) -> Result<Option<ResearchStatus>> {
        let now = timestamp_now();
        let mut entered = false;
        let record = lock(&self.storage)?
            .modify_research(research_id, &mut |record| {
                if !allowed(&record.status.capabilities())
                    || !record.status.can_transition_to(ResearchStatus::Running)
                {
                    return false;
                }
                record.status = ResearchStatus::Running;
                record.clear_failure();
                record.updated_at = now;
                entered = true;
                true
            })?
            .ok_or_else(|| ResearchError::not_found("research", research_id))?;

        Ok(if entered { None } else { Some(record.status) })
    }

    /// Sets a status reachable from `running`; false if the record already left it
    fn leave_running(
        &self,
        research_id: &str,
        next: ResearchStatus,
        failure: Option<(WorkflowPhase, Option<String>, String)>,
    ) -> Result<bool> {
        let now = timestamp_now();
        let mut changed = false;
        lock(&self.storage)?
            .modify_research(research_id, &mut |record| {
                if record.status != ResearchStatus::Running
                    || !record.status.can_transition_to(next)
                {
                    return false;
                }
                record.status = next;
                match &failure {
                    Some((phase, entity_id, message)) => {
                        record.failed_phase = Some(*phase);
                        record.failed_entity_id = entity_id.clone();
                        record.error_message = Some(message.clone());
                    }
                    None => record.clear_failure(),
                }
                record.updated_at = now;
                changed = true;
                true
            })?
            .ok_or_else(|| ResearchError::not_found("research", research_id))?;
        Ok(changed)
    }

    fn pause(&self, research_id: &str) -> Result<RunOutcome> {
        if self.leave_running(research_id, ResearchStatus::Paused, None)? {
            info!("Research {} paused", research_id);
            Ok(RunOutcome::Paused)
        } else {
            Ok(RunOutcome::Interrupted(self.get_research(research_id)?.status))
        }
    }

    fn fail(
        &self,
        research_id: &str,
        phase: WorkflowPhase,
        entity_id: Option<String>,
        message: String,
    ) -> Result<RunOutcome> {
        error!(
            "Research {} failed in {} ({}): {}",
            research_id,
            phase,
            entity_id.as_deref().unwrap_or("-"),
            message
        );
        let failure = Some((phase, entity_id.clone(), message.clone()));
        if !self.leave_running(research_id, ResearchStatus::Failed, failure)? {
            return Ok(RunOutcome::Interrupted(self.get_research(research_id)?.status));
        }
        Ok(RunOutcome::Failed {
            phase,
            entity_id,
            message,
        })
    }

    /// Registers a cancellation token for the run and drives the phases
    async fn drive(&self, research_id: &str) -> Result<RunOutcome> {
        let token = CancellationToken::new();
        self.active()?.insert(research_id.to_string(), token.clone());

        let result = self.run_phases(research_id, &token).await;
        self.active()?.remove(research_id);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Storage and other unexpected errors still leave the record resumable
                let phase = self
                    .current_phase(research_id)
                    .unwrap_or(WorkflowPhase::SourceProcessing);
                if let Err(mark) = self.fail(research_id, phase, None, e.to_string()) {
                    warn!("Could not record failure of research {}: {}", research_id, mark);
                }
                Err(e)
            }
        }
    }

    async fn run_phases(&self, research_id: &str, token: &CancellationToken) -> Result<RunOutcome> {
        loop {
            if token.is_cancelled() {
                return self.pause(research_id);
            }
            let status = self.get_research(research_id)?.status;
            if status != ResearchStatus::Running {
                info!("Research {} is now {}, stopping run", research_id, status);
                return Ok(RunOutcome::Interrupted(status));
            }

            let phase = self.current_phase(research_id)?;
            debug!("Research {} in phase {}", research_id, phase);

            match phase {
                WorkflowPhase::SourceProcessing => {
                    let report = self.process_sources(research_id, token).await?;
                    if report.cancelled {
                        continue;
                    }
                    if let Some(outcome) = self.check_sources(research_id)? {
                        return Ok(outcome);
                    }
                }
                WorkflowPhase::OutlineGeneration => {
                    let options = OutlineOptions::from_config(&self.config);
                    match self.generate_outline(research_id, options).await {
                        Ok(sections) => {
                            info!("Outline for research {} has {} sections", research_id, sections.len());
                        }
                        Err(e @ (ResearchError::Drafting(_) | ResearchError::Timeout { .. })) => {
                            return self.fail(research_id, phase, None, e.to_string());
                        }
                        Err(e) => return Err(e),
                    }
                }
                WorkflowPhase::SectionBuilding => {
                    if let Some(outcome) = self.build_sections(research_id, token).await? {
                        return Ok(outcome);
                    }
                }
                WorkflowPhase::Export => {
                    let format: ExportFormat = self.config.workflow.export_format.parse()?;
                    self.exports.create_export(research_id, format)?;
                }
                WorkflowPhase::Done => {
                    if self.leave_running(research_id, ResearchStatus::Complete, None)? {
                        info!("Research {} complete", research_id);
                        return Ok(RunOutcome::Completed);
                    }
                    return Ok(RunOutcome::Interrupted(self.get_research(research_id)?.status));
                }
            }
        }
    }

    /// Runs the worker pool over the pending sources
    async fn process_sources(
        &self,
        research_id: &str,
        token: &CancellationToken,
    ) -> Result<ScheduleReport> {
        let pending = self.sources.pending_source_ids(research_id)?;
        info!("Processing {} pending sources for research {}", pending.len(), research_id);

        let scheduler = SourceScheduler::new(self.config.crawler.max_concurrent_fetches, pending);
        let manager = self.sources.clone();
        let storage = self.storage.clone();
        let run_token = token.clone();
        let research_id_owned = research_id.to_string();

        let report = scheduler
            .run(token.clone(), move |source_id| {
                let manager = manager.clone();
                let storage = storage.clone();
                let token = run_token.clone();
                let research_id = research_id_owned.clone();
                async move {
                    if !is_running(&storage, &research_id)? {
                        token.cancel();
                        return Ok(Disposition::Skipped);
                    }
                    let outcome = manager.process_source(&source_id).await?;
                    Ok::<Disposition, ResearchError>(outcome.disposition())
                }
            })
            .await?;

        info!(
            "Source processing for research {}: {} completed, {} failed, {} skipped, {} requeued",
            research_id, report.completed, report.failed, report.skipped, report.requeued
        );
        Ok(report)
    }

    /// Fails the workflow on the first source that did not complete
    fn check_sources(&self, research_id: &str) -> Result<Option<RunOutcome>> {
        let sources = lock(&self.storage)?.list_sources(research_id)?;
        let blocking = sources
            .iter()
            .find(|s| s.status == SourceStatus::Failed)
            .or_else(|| sources.iter().find(|s| s.status != SourceStatus::Complete));

        match blocking {
            None => Ok(None),
            Some(source) => {
                let message = match (&source.status, &source.error_message) {
                    (SourceStatus::Failed, Some(message)) => {
                        format!("source {} failed: {}", source.url, message)
                    }
                    (status, _) => format!("source {} is {}", source.url, status),
                };
                self.fail(
                    research_id,
                    WorkflowPhase::SourceProcessing,
                    Some(source.id.clone()),
                    message,
                )
                .map(Some)
            }
        }
    }

    /// Drafts pending sections in document order, one at a time
    async fn build_sections(
        &self,
        research_id: &str,
        token: &CancellationToken,
    ) -> Result<Option<RunOutcome>> {
        let tree = SectionTree::build(lock(&self.storage)?.list_sections(research_id)?);
        let ordered: Vec<(String, SectionStatus)> = tree
            .pre_order()
            .into_iter()
            .map(|(_, s)| (s.id.clone(), s.status))
            .collect();

        let pending: Vec<&String> = ordered
            .iter()
            .filter(|(_, status)| *status == SectionStatus::Pending)
            .map(|(id, _)| id)
            .collect();
        if pending.is_empty() {
            // Only sections held by another run are left
            let Some((id, status)) = ordered
                .iter()
                .find(|(_, status)| *status != SectionStatus::Complete)
            else {
                return Ok(None);
            };
            return self
                .fail(
                    research_id,
                    WorkflowPhase::SectionBuilding,
                    Some(id.clone()),
                    format!("section {} is {}", id, status),
                )
                .map(Some);
        }

        for section_id in pending {
            if token.is_cancelled() || !is_running(&self.storage, research_id)? {
                return Ok(None);
            }
            match self.build_section(section_id).await {
                Ok(_) => {}
                Err(e @ (ResearchError::Drafting(_) | ResearchError::Timeout { .. })) => {
                    return self
                        .fail(
                            research_id,
                            WorkflowPhase::SectionBuilding,
                            Some(section_id.clone()),
                            e.to_string(),
                        )
                        .map(Some);
                }
                // Claimed elsewhere in the meantime
                Err(ResearchError::Precondition(reason)) => debug!("{}", reason),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn draft(&self, section: &SectionRecord) -> Result<DraftedSection> {
        let research = self.get_research(&section.research_id)?;
        let parent_title = match &section.parent_section_id {
            Some(parent_id) => lock(&self.storage)?
                .get_section(parent_id)?
                .map(|parent| parent.title),
            None => None,
        };
        let brief = SectionBrief {
            section_id: section.id.clone(),
            topic: research.topic,
            title: section.title.clone(),
            description: section.description.clone(),
            parent_title,
        };
        let digests = self.digests(&section.research_id)?;

        match tokio::time::timeout(
            self.config.workflow.draft_timeout(),
            self.drafter.draft_section(&brief, &digests),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ResearchError::Timeout {
                operation: "section draft",
                id: section.id.clone(),
            }),
        }
    }

    /// `drafting -> pending`
    fn release_section(&self, section_id: &str) -> Result<()> {
        let now = timestamp_now();
        lock(&self.storage)?.modify_section(section_id, &mut |section| {
            if section.status != SectionStatus::Drafting {
                return false;
            }
            section.status = SectionStatus::Pending;
            section.updated_at = now;
            true
        })?;
        Ok(())
    }

    fn release_stranded_sections(&self, research_id: &str) -> Result<usize> {
        let stranded: Vec<String> = lock(&self.storage)?
            .list_sections(research_id)?
            .into_iter()
            .filter(|s| s.status == SectionStatus::Drafting)
            .map(|s| s.id)
            .collect();
        for section_id in &stranded {
            self.release_section(section_id)?;
        }
        Ok(stranded.len())
    }

    /// Material from every completed source, in source creation order
    fn digests(&self, research_id: &str) -> Result<Vec<SourceDigest>> {
        let storage = lock(&self.storage)?;
        let mut processed: HashMap<String, _> = storage
            .list_processed_data(research_id)?
            .into_iter()
            .map(|data| (data.source_id.clone(), data))
            .collect();

        let mut digests = Vec::new();
        for source in storage.list_sources(research_id)? {
            if source.status != SourceStatus::Complete {
                continue;
            }
            let text = storage
                .get_crawled_content(&source.url_hash)?
                .map(|content| content.extracted_text)
                .unwrap_or_default();
            let mut digest = SourceDigest {
                source_id: source.id.clone(),
                url: source.url,
                title: source.title,
                text,
                ..SourceDigest::default()
            };
            if let Some(data) = processed.remove(&source.id) {
                digest.keywords = data.keywords;
                digest.facts = data.facts;
                digest.summary = data.summary;
            }
            digests.push(digest);
        }
        Ok(digests)
    }
}

fn is_running(storage: &SharedStorage, research_id: &str) -> Result<bool> {
    Ok(lock(storage)?
        .get_research(research_id)?
        .map_or(false, |r| r.status == ResearchStatus::Running))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::FetchError;
    use crate::test_support::{create_test_config, test_storage, ScriptedDrafter, ScriptedFetcher};
    use crate::workflow::OutlineNode;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Harness {
        orchestrator: WorkflowOrchestrator,
        storage: SharedStorage,
        fetcher: Arc<ScriptedFetcher>,
        drafter: Arc<ScriptedDrafter>,
    }

    fn harness_with(config: Config) -> Harness {
        let storage = test_storage();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let drafter = Arc::new(ScriptedDrafter::new());
        let orchestrator = WorkflowOrchestrator::new(
            storage.clone(),
            config,
            fetcher.clone(),
            drafter.clone(),
        );
        Harness {
            orchestrator,
            storage,
            fetcher,
            drafter,
        }
    }

    fn harness() -> Harness {
        let mut config = create_test_config();
        config.workflow.sections_count = 3;
        harness_with(config)
    }

    fn seed(h: &Harness, urls: &[&str]) -> (String, Vec<SourceRecord>) {
        let research = h
            .orchestrator
            .create_research("Soil carbon", None, "breadth")
            .unwrap();
        let sources = urls
            .iter()
            .map(|url| {
                h.orchestrator
                    .add_source(&research.id, url, SourceType::Web)
                    .unwrap()
            })
            .collect();
        (research.id, sources)
    }

    fn script_pages(h: &Harness, urls: &[&str]) {
        for url in urls {
            h.fetcher.respond_page(
                url,
                "Field study",
                "Soil carbon increased under cover crops. Yields were stable.",
                &[],
            );
        }
    }

    #[tokio::test]
    async fn test_execute_requires_sources() {
        let h = harness();
        let research = h.orchestrator.create_research("Empty", None, "breadth").unwrap();

        let result = h.orchestrator.execute_workflow(&research.id).await;
        assert!(matches!(result, Err(ResearchError::Precondition(_))));
        assert_eq!(
            h.orchestrator.get_research(&research.id).unwrap().status,
            ResearchStatus::Initializing
        );
    }

    #[tokio::test]
    async fn test_full_run_reaches_done() {
        let h = harness();
        let urls = ["https://example.com/a", "https://example.org/b"];
        script_pages(&h, &urls);
        let (research_id, _) = seed(&h, &urls);

        let outcome = h.orchestrator.execute_workflow(&research_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let status = h.orchestrator.get_workflow_status(&research_id).unwrap();
        assert_eq!(status.status, ResearchStatus::Complete);
        assert_eq!(status.phase, WorkflowPhase::Done);
        assert_eq!(status.failure, None);
        assert!(!status.capabilities.can_execute);
        assert!(!status.capabilities.can_resume);

        let sections = lock(&h.storage).unwrap().list_sections(&research_id).unwrap();
        assert_eq!(sections.len(), 3);
        assert!(sections.iter().all(|s| s.status == SectionStatus::Complete));
        assert_eq!(lock(&h.storage).unwrap().list_exports(&research_id).unwrap().len(), 1);
        assert_eq!(
            h.drafter.drafted.lock().unwrap().clone(),
            vec!["Part 1", "Part 2", "Part 3"]
        );
    }

    #[tokio::test]
    async fn test_execute_is_noop_when_not_initializing() {
        let h = harness();
        script_pages(&h, &["https://example.com/a"]);
        let (research_id, _) = seed(&h, &["https://example.com/a"]);
        h.orchestrator.execute_workflow(&research_id).await.unwrap();

        let again = h.orchestrator.execute_workflow(&research_id).await.unwrap();
        assert_eq!(again, RunOutcome::NotStarted(ResearchStatus::Complete));
        let resumed = h.orchestrator.resume_workflow(&research_id).await.unwrap();
        assert_eq!(resumed, RunOutcome::NotStarted(ResearchStatus::Complete));
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_source_fails_workflow_and_resume_retries_only_it() {
        let h = harness();
        let good = ["https://example.com/one", "https://example.org/two"];
        script_pages(&h, &good);
        let bad = "https://example.net/three";
        h.fetcher.respond(bad, Err(FetchError::HttpStatus { status: 404 }));
        h.fetcher.respond_page(bad, "Recovered", "Cover crops held soil carbon.", &[]);

        let (research_id, sources) = seed(&h, &[good[0], good[1], bad]);
        let outcome = h.orchestrator.execute_workflow(&research_id).await.unwrap();

        match outcome {
            RunOutcome::Failed {
                phase, entity_id, ..
            } => {
                assert_eq!(phase, WorkflowPhase::SourceProcessing);
                assert_eq!(entity_id.as_deref(), Some(sources[2].id.as_str()));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let status = h.orchestrator.get_workflow_status(&research_id).unwrap();
        assert_eq!(status.status, ResearchStatus::Failed);
        assert!(status.capabilities.can_resume);
        assert!(status.failure.unwrap().message.unwrap().contains("HTTP 404"));

        let outcome = h.orchestrator.resume_workflow(&research_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let calls = h.fetcher.calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == good[0]).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.as_str() == good[1]).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.as_str() == bad).count(), 2);
        assert_eq!(h.orchestrator.get_workflow_status(&research_id).unwrap().failure, None);
    }

    #[tokio::test]
    async fn test_section_failure_and_resume_keeps_completed_sections() {
        let h = harness();
        script_pages(&h, &["https://example.com/a"]);
        h.drafter.fail_on("Part 2");
        let (research_id, _) = seed(&h, &["https://example.com/a"]);

        let outcome = h.orchestrator.execute_workflow(&research_id).await.unwrap();
        let failed_section = match outcome {
            RunOutcome::Failed {
                phase: WorkflowPhase::SectionBuilding,
                entity_id: Some(id),
                ..
            } => id,
            other => panic!("expected section failure, got {:?}", other),
        };
        let section = h.orchestrator.sections().get_section(&failed_section).unwrap();
        assert_eq!(section.status, SectionStatus::Pending);
        assert_eq!(section.title, "Part 2");

        h.drafter.clear_failures();
        let outcome = h.orchestrator.resume_workflow(&research_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(*h.drafter.outlines.lock().unwrap(), 1);
        assert_eq!(
            h.drafter.drafted.lock().unwrap().clone(),
            vec!["Part 1", "Part 2", "Part 3"]
        );
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_outline_requires_complete_sources() {
        let h = harness();
        let (research_id, _) = seed(&h, &["https://example.com/a"]);

        let options = OutlineOptions {
            sections_count: 3,
            depth: 1,
        };
        let result = h.orchestrator.generate_outline(&research_id, options).await;
        assert!(matches!(result, Err(ResearchError::Precondition(_))));
        assert!(lock(&h.storage).unwrap().list_sections(&research_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outline_is_idempotent_and_nested() {
        let h = harness();
        script_pages(&h, &["https://example.com/a"]);
        let (research_id, sources) = seed(&h, &["https://example.com/a"]);
        h.orchestrator
            .sources()
            .process_source(&sources[0].id)
            .await
            .unwrap();

        let options = OutlineOptions {
            sections_count: 2,
            depth: 2,
        };
        let first = h.orchestrator.generate_outline(&research_id, options).await.unwrap();
        let second = h.orchestrator.generate_outline(&research_id, options).await.unwrap();

        assert_eq!(first.len(), 4);
        let mut first_ids: Vec<String> = first.into_iter().map(|s| s.id).collect();
        let mut second_ids: Vec<String> = second.into_iter().map(|s| s.id).collect();
        first_ids.sort();
        second_ids.sort();
        assert_eq!(first_ids, second_ids);
        assert_eq!(*h.drafter.outlines.lock().unwrap(), 1);

        let top = h.orchestrator.sections().get_top_level_sections(&research_id).unwrap();
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|s| s.status == SectionStatus::Pending));
        assert_eq!(
            h.orchestrator.sections().get_subsections(&top[0].id).unwrap()[0].title,
            "Part 1.1"
        );

        assert!(matches!(
            h.orchestrator
                .generate_outline(&research_id, OutlineOptions { sections_count: 0, depth: 1 })
                .await,
            Err(ResearchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_build_section_requires_pending() {
        let h = harness();
        script_pages(&h, &["https://example.com/a"]);
        let (research_id, sources) = seed(&h, &["https://example.com/a"]);
        h.orchestrator
            .sources()
            .process_source(&sources[0].id)
            .await
            .unwrap();
        let sections = h
            .orchestrator
            .generate_outline(&research_id, OutlineOptions { sections_count: 1, depth: 1 })
            .await
            .unwrap();

        let built = h.orchestrator.build_section(&sections[0].id).await.unwrap();
        assert_eq!(built.status, SectionStatus::Complete);
        assert_eq!(built.content.as_deref(), Some("Body of Part 1."));
        assert_eq!(built.word_count, Some(4));

        assert!(matches!(
            h.orchestrator.build_section(&sections[0].id).await,
            Err(ResearchError::Precondition(_))
        ));
        assert!(matches!(
            h.orchestrator.build_section("missing").await,
            Err(ResearchError::NotFound { .. })
        ));
    }

    struct SlowDrafter;

    #[async_trait]
    impl Drafter for SlowDrafter {
        async fn generate_outline(
            &self,
            _topic: &str,
            _sources: &[SourceDigest],
            _sections_count: u32,
            _depth: u32,
        ) -> std::result::Result<Vec<OutlineNode>, DraftError> {
            Ok(vec![OutlineNode::leaf("Slow", None)])
        }

        async fn draft_section(
            &self,
            _section: &SectionBrief,
            _sources: &[SourceDigest],
        ) -> std::result::Result<DraftedSection, DraftError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(DraftedSection::from_content("late".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_draft_timeout_returns_section_to_pending() {
        let storage = test_storage();
        let fetcher = Arc::new(ScriptedFetcher::new());
        script_pages_on(&fetcher, "https://example.com/a");
        let mut config = create_test_config();
        config.workflow.draft_timeout_ms = 200;
        let orchestrator =
            WorkflowOrchestrator::new(storage.clone(), config, fetcher, Arc::new(SlowDrafter));

        let research = orchestrator.create_research("Slow topic", None, "breadth").unwrap();
        let source = orchestrator
            .add_source(&research.id, "https://example.com/a", SourceType::Web)
            .unwrap();
        orchestrator.sources().process_source(&source.id).await.unwrap();
        let sections = orchestrator
            .generate_outline(&research.id, OutlineOptions { sections_count: 1, depth: 1 })
            .await
            .unwrap();

        let result = orchestrator.build_section(&sections[0].id).await;
        assert!(matches!(result, Err(ResearchError::Timeout { .. })));
        assert_eq!(
            orchestrator.sections().get_section(&sections[0].id).unwrap().status,
            SectionStatus::Pending
        );
    }

    fn script_pages_on(fetcher: &ScriptedFetcher, url: &str) {
        fetcher.respond_page(url, "Page", "Some soil text.", &[]);
    }

    #[tokio::test]
    async fn test_stop_without_active_run_pauses_directly() {
        let h = harness();
        let (research_id, _) = seed(&h, &["https://example.com/a"]);

        assert_eq!(
            h.orchestrator.stop_workflow(&research_id).unwrap(),
            StopOutcome::NotRunning(ResearchStatus::Initializing)
        );

        lock(&h.storage)
            .unwrap()
            .modify_research(&research_id, &mut |r| {
                r.status = ResearchStatus::Running;
                true
            })
            .unwrap();
        assert_eq!(h.orchestrator.stop_workflow(&research_id).unwrap(), StopOutcome::Paused);

        let status = h.orchestrator.get_workflow_status(&research_id).unwrap();
        assert_eq!(status.status, ResearchStatus::Paused);
        assert!(status.capabilities.can_resume);
        assert!(!status.capabilities.can_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_fetch_finish() {
        let mut config = create_test_config();
        config.crawler.max_concurrent_fetches = 1;
        let h = harness_with(config);
        let urls = ["https://example.com/a", "https://example.org/b"];
        script_pages(&h, &urls);
        h.fetcher.delay(Duration::from_secs(1));
        let (research_id, sources) = seed(&h, &urls);

        let orchestrator = h.orchestrator.clone();
        let id = research_id.clone();
        let run = tokio::spawn(async move { orchestrator.execute_workflow(&id).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            h.orchestrator.stop_workflow(&research_id).unwrap(),
            StopOutcome::Signalled
        );

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Paused);

        let stored = h.orchestrator.list_sources(&research_id).unwrap();
        assert_eq!(stored[0].id, sources[0].id);
        assert_eq!(stored[0].status, SourceStatus::Complete);
        assert_eq!(stored[1].status, SourceStatus::Pending);
        assert_eq!(h.fetcher.calls().len(), 1);

        // Resume picks up only the remaining source
        let outcome = h.orchestrator.resume_workflow(&research_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_status_changes_elsewhere() {
        let h = harness();
        script_pages(&h, &["https://example.com/a"]);
        let (research_id, _) = seed(&h, &["https://example.com/a"]);

        // Another process paused the record before this run's first unit
        lock(&h.storage)
            .unwrap()
            .modify_research(&research_id, &mut |r| {
                r.status = ResearchStatus::Paused;
                true
            })
            .unwrap();
        let outcome = h.orchestrator.drive(&research_id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted(ResearchStatus::Paused));
        assert!(h.fetcher.calls().is_empty());
    }
}
