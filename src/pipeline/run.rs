use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{error, info, warn};

use super::bundle::{
    BUNDLE_FILE_NAME, PRESENCE_TABLE_NAME, SPLIT_DIR_NAME, build_review_bundle, segment_log_entries,
    segment_log_json,
};
use super::extract::IdentityExtractor;
use super::matcher::{LocalHashNameSimilarity, Matcher, NameSimilarity};
use super::presence::{aggregate_presence, presence_csv_bytes};
use super::render::{PageRenderer, PopplerRenderer};
use super::roster::load_roster;
use super::segment::{FrontPageClassifier, KeywordClassifier, is_front_page, segments_from_front_pages};
use super::split::{LopdfExtractor, PageRangeExtractor, SplitOutcome, split_segments};
use crate::jobs::{CheckpointOutcome, ControlError, JobControl, JobService, StoreControl};
use crate::model::{Job, JobState, MatchResult, RunCounts, RunManifest, RunPaths, SourceHash};
use crate::settings::PipelineSettings;
use crate::util::{now_utc_string, sha256_file, write_bytes, write_json_pretty};

const RUN_MANIFEST_VERSION: u32 = 1;

/// The injectable capabilities one pipeline run depends on.
pub struct Collaborators {
    pub renderer: Box<dyn PageRenderer>,
    pub classifier: Box<dyn FrontPageClassifier>,
    pub extractor: IdentityExtractor,
    pub pages: Box<dyn PageRangeExtractor>,
    pub name_similarity: Option<Arc<dyn NameSimilarity>>,
}

impl Collaborators {
    pub fn production(settings: &PipelineSettings) -> Result<Self> {
        let extractor = IdentityExtractor::from_settings(&settings.ocr)?;
        let classifier = KeywordClassifier::new(extractor.primary_backend(), &settings.segmenter)?;
        let name_similarity = settings
            .matcher
            .semantic_names
            .then(|| Arc::new(LocalHashNameSimilarity) as Arc<dyn NameSimilarity>);

        Ok(Self {
            renderer: Box::new(PopplerRenderer::new(&settings.render)),
            classifier: Box::new(classifier),
            extractor,
            pages: Box::new(LopdfExtractor::new()),
            name_similarity,
        })
    }
}

pub struct RunContext<'a> {
    pub job_id: &'a str,
    pub document: &'a Path,
    pub roster: &'a Path,
    /// `{root}/{test_id}`; every artifact of the run lands here.
    pub artifact_dir: PathBuf,
    pub settings: &'a PipelineSettings,
}

impl RunContext<'_> {
    pub fn split_dir(&self) -> PathBuf {
        self.artifact_dir.join(SPLIT_DIR_NAME)
    }

    pub fn presence_table_path(&self) -> PathBuf {
        self.artifact_dir.join(PRESENCE_TABLE_NAME)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.artifact_dir.join(BUNDLE_FILE_NAME)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobArtifacts {
    pub presence_table_path: Option<PathBuf>,
    pub bundle_path: Option<PathBuf>,
    pub counts: RunCounts,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(JobArtifacts),
    Cancelled,
}

/// Runs one job end to end. Resource errors (missing inputs, unreadable
/// document, unusable roster) are returned; per-page and per-segment
/// problems are logged and the run continues.
pub fn run_pipeline(
    context: &RunContext<'_>,
    collaborators: &Collaborators,
    control: &mut dyn JobControl,
) -> Result<PipelineOutcome> {
    if !context.document.is_file() {
        bail!("document not found: {}", context.document.display());
    }
    let roster = load_roster(context.roster)?;

    let scratch = tempfile::Builder::new()
        .prefix("scriptsplit-")
        .tempdir()
        .context("failed to create scratch directory")?;

    let pages = collaborators
        .renderer
        .render_pages(context.document, scratch.path())?;
    info!(job_id = context.job_id, pages = pages.len(), "document rendered");

    let mut front_pages = Vec::<bool>::with_capacity(pages.len());
    for page in &pages {
        if control.checkpoint()? == CheckpointOutcome::Cancelled {
            return Ok(PipelineOutcome::Cancelled);
        }
        front_pages.push(is_front_page(page, collaborators.classifier.as_ref()));
    }
    let segments = segments_from_front_pages(&front_pages);
    info!(job_id = context.job_id, segments = segments.len(), "document segmented");

    if let Some(semantic) = collaborators.name_similarity.as_ref() {
        info!(job_id = context.job_id, backend = semantic.label(), "semantic name similarity enabled");
    }
    let matcher = Matcher::new(
        &context.settings.matcher,
        collaborators.name_similarity.clone(),
    );
    let total = segments.len();
    let mut matches = Vec::<MatchResult>::with_capacity(total);
    for (segment_index, segment) in segments.iter().enumerate() {
        if control.checkpoint()? == CheckpointOutcome::Cancelled {
            return Ok(PipelineOutcome::Cancelled);
        }

        let identity = collaborators.extractor.extract(&pages[segment.start_page]);
        let result = matcher.match_identity(*segment, &identity, &roster.entries);
        info!(
            job_id = context.job_id,
            segment = segment_index,
            start_page = segment.start_page,
            end_page = segment.end_page,
            matched = result.is_matched(),
            uncertain = result.uncertain,
            "segment processed"
        );
        matches.push(result);

        control.report_progress(segment_index + 1, total)?;
    }
    if total == 0 {
        control.report_progress(0, 0)?;
    }

    if control.checkpoint()? == CheckpointOutcome::Cancelled {
        return Ok(PipelineOutcome::Cancelled);
    }

    let mut warnings = Vec::<String>::new();

    match collaborators.pages.page_count(context.document) {
        Ok(count) if count != pages.len() => {
            warn!(job_id = context.job_id, rendered = pages.len(), source = count, "page count mismatch");
            warnings.push(format!(
                "rendered {} pages but the source document has {count}",
                pages.len()
            ));
        }
        Ok(_) => {}
        Err(err) => {
            warn!(job_id = context.job_id, error = %err, "could not count source pages");
        }
    }

    let split = match split_segments(
        collaborators.pages.as_ref(),
        context.document,
        &matches,
        &roster.entries,
        &context.split_dir(),
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(job_id = context.job_id, error = %err, "split phase failed; continuing without documents");
            warnings.push(format!("split phase failed: {err:#}"));
            SplitOutcome::default()
        }
    };
    for failure in &split.failures {
        warnings.push(format!(
            "segment {} ({}..={}) not split: {}",
            failure.segment_index, failure.segment.start_page, failure.segment.end_page, failure.error
        ));
    }

    let presence = aggregate_presence(&roster.entries, &matches, &split);
    warnings.extend(presence.warnings.iter().cloned());

    let presence_csv = match presence_csv_bytes(&presence.rows, &roster.extra_columns) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(job_id = context.job_id, error = %err, "presence table could not be rendered");
            warnings.push(format!("presence table not rendered: {err:#}"));
            None
        }
    };

    let presence_table_path = presence_csv.as_ref().and_then(|bytes| {
        let path = context.presence_table_path();
        match write_bytes(&path, bytes) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(job_id = context.job_id, error = %err, "presence table not written");
                warnings.push(format!("presence table not written: {err:#}"));
                None
            }
        }
    });

    let log_entries = segment_log_entries(&matches, &roster.entries, &split);
    let bundle_path = match segment_log_json(&log_entries).and_then(|log| {
        build_review_bundle(
            &context.bundle_path(),
            &split.documents,
            presence_csv.as_deref(),
            &log,
        )
    }) {
        Ok(report) => {
            info!(job_id = context.job_id, documents = report.documents_packed, "documents bundled");
            for skipped in &report.skipped {
                warnings.push(format!("split document {skipped} missing from bundle"));
            }
            Some(report.path)
        }
        Err(err) => {
            error!(job_id = context.job_id, error = %err, "review bundle not built");
            warnings.push(format!("review bundle not built: {err:#}"));
            None
        }
    };

    let matched_count = matches.iter().filter(|result| result.is_matched()).count();
    let uncertain_count = matches.iter().filter(|result| result.uncertain).count();
    let present_count = presence.present_count();
    let counts = RunCounts {
        page_count: pages.len(),
        segment_count: segments.len(),
        matched_count,
        uncertain_count,
        unmatched_count: matches.len() - matched_count,
        documents_written: split.documents.len(),
        split_failures: split.failures.len(),
        present_count,
        absent_count: presence.rows.len() - present_count,
        roster_count: roster.entries.len(),
    };

    info!(
        job_id = context.job_id,
        segments = counts.segment_count,
        matched = counts.matched_count,
        uncertain = counts.uncertain_count,
        present = counts.present_count,
        absent = counts.absent_count,
        "pipeline finished"
    );

    Ok(PipelineOutcome::Completed(JobArtifacts {
        presence_table_path,
        bundle_path,
        counts,
        warnings,
    }))
}

/// Worker entry point: runs an existing RUNNING or PAUSED job and records
/// its terminal state. Returns the state the job ended in.
pub fn run_job(
    service: &JobService,
    job_id: &str,
    collaborators: &Collaborators,
) -> Result<JobState> {
    let mut store = service.open_store()?;
    let job = store.require(job_id)?;
    if job.state.is_terminal() {
        bail!("job {job_id} is already {}", job.state);
    }
    let claimed = store
        .set_worker_pid(job_id, std::process::id())
        .map_err(anyhow::Error::from)
        .and_then(|()| service.open_store());
    let control_store = match claimed {
        Ok(control_store) => control_store,
        Err(err) => {
            let message = format!("worker could not claim job: {err:#}");
            error!(job_id, error = %message, "job failed");
            if let Err(fail_err) = store.fail(job_id, &message) {
                warn!(job_id, error = %fail_err, "could not mark job failed");
            }
            return Err(err);
        }
    };

    let started_at = now_utc_string();
    let settings = service.settings();
    let context = RunContext {
        job_id,
        document: Path::new(&job.document_path),
        roster: Path::new(&job.roster_path),
        artifact_dir: service.root().join(&job.test_id),
        settings,
    };
    info!(job_id, test_id = %job.test_id, document = %job.document_path, "job started");

    let mut control = StoreControl::new(control_store, job_id, settings.control.poll_interval());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_pipeline(&context, collaborators, &mut control)
    }))
    .unwrap_or_else(|payload| Err(anyhow!("pipeline panicked: {}", panic_message(payload.as_ref()))));

    let (state, artifacts) = match outcome {
        Ok(PipelineOutcome::Completed(artifacts)) => {
            let presence = artifacts
                .presence_table_path
                .as_ref()
                .map(|path| path.display().to_string());
            let bundle = artifacts
                .bundle_path
                .as_ref()
                .map(|path| path.display().to_string());
            let state = match store.complete(job_id, presence.as_deref(), bundle.as_deref()) {
                Ok(job) => job.state,
                Err(ControlError::InvalidTransition { state, .. }) => {
                    warn!(job_id, state = %state, "job changed state after its last checkpoint; keeping it");
                    state
                }
                Err(err) => return Err(err.into()),
            };
            (state, artifacts)
        }
        Ok(PipelineOutcome::Cancelled) => {
            info!(job_id, "job stopped after cancellation");
            (JobState::Cancelled, JobArtifacts::default())
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(job_id, error = %message, "job failed");
            let state = match store.fail(job_id, &message) {
                Ok(job) => job.state,
                Err(ControlError::InvalidTransition { state, .. }) => state,
                Err(err) => return Err(err.into()),
            };
            let artifacts = JobArtifacts {
                warnings: vec![message],
                ..JobArtifacts::default()
            };
            (state, artifacts)
        }
    };

    if let Err(err) = write_run_manifest(&context, &job, &started_at, state, &artifacts) {
        warn!(job_id, error = %err, "run manifest not written");
    }

    Ok(state)
}

pub fn run_manifest_path(artifact_dir: &Path, job_id: &str) -> PathBuf {
    artifact_dir.join(format!("run_manifest_{job_id}.json"))
}

fn write_run_manifest(
    context: &RunContext<'_>,
    job: &Job,
    started_at: &str,
    state: JobState,
    artifacts: &JobArtifacts,
) -> Result<()> {
    let mut source_hashes = Vec::<SourceHash>::new();
    for (role, path) in [("document", context.document), ("roster", context.roster)] {
        if path.is_file() {
            source_hashes.push(SourceHash {
                role: role.to_string(),
                path: path.display().to_string(),
                sha256: sha256_file(path)?,
            });
        }
    }

    let manifest = RunManifest {
        manifest_version: RUN_MANIFEST_VERSION,
        job_id: job.job_id.clone(),
        test_id: job.test_id.clone(),
        status: state.as_str().to_string(),
        started_at: started_at.to_string(),
        updated_at: now_utc_string(),
        source_hashes,
        counts: artifacts.counts.clone(),
        paths: RunPaths {
            document_path: job.document_path.clone(),
            roster_path: job.roster_path.clone(),
            split_dir: context.split_dir().display().to_string(),
            presence_table_path: artifacts
                .presence_table_path
                .as_ref()
                .map(|path| path.display().to_string()),
            bundle_path: artifacts
                .bundle_path
                .as_ref()
                .map(|path| path.display().to_string()),
        },
        warnings: artifacts.warnings.clone(),
    };

    let path = run_manifest_path(&context.artifact_dir, &job.job_id);
    write_json_pretty(&path, &manifest)?;
    info!(job_id = %job.job_id, manifest = %path.display(), "run manifest written");
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
