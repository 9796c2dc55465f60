mod state;
mod worker;

pub use state::{InitSegment, InitState, PipelineState, SegmentRef, SegmentState};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{Classifier, FileKind},
    config::PipelineConfig,
    crypt::{self, PublishOutcome},
    error::{ErrorClass, KagiError, KagiResult},
    hls::{ManifestRewriter, ManifestSnapshot},
    key::{IvMode, KeyMaterial},
    util::{self, atomic, Fingerprint},
    watch::WatchEvent,
};
use worker::{EncryptJob, WorkerPool, WorkerReport};

/// What a [`Pipeline::run`] did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Segments encrypted and published at the destination.
    pub encrypted: usize,
    /// Segments found already encrypted at the destination.
    pub confirmed: usize,
    /// Segments that ran out of retries.
    pub failed: usize,
    /// Playlist revisions written to the destination.
    pub manifests_published: usize,
}

/// Mirrors a live fMP4 HLS directory into an encrypted one.
///
/// ```text
/// DirectoryWatcher ──WatchEvent──► Pipeline ──EncryptJob──► WorkerPool
///                                   ▲  │                         │
///                                   │  └─► playlist publish       │
///                                   └────────WorkerReport─────────┘
/// ```
///
/// The pipeline owns all state. A playlist revision is only written once
/// every file it references is at the destination.
pub struct Pipeline {
    config: PipelineConfig,
    key: Arc<KeyMaterial>,
    classifier: Classifier,
    rewriter: ManifestRewriter,

    state: PipelineState,
    summary: RunSummary,
    stopping: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, key: KeyMaterial) -> KagiResult<Self> {
        if !config.source_dir.is_dir() {
            return Err(KagiError::SourceDirMissing(config.source_dir.clone()));
        }
        atomic::probe_writable(&config.dest_dir).map_err(|source| {
            KagiError::DestinationNotWritable {
                path: config.dest_dir.clone(),
                source,
            }
        })?;

        let rewriter = ManifestRewriter::new(&key).with_uri_prefix(config.uri_prefix.clone());
        Ok(Self {
            classifier: config.classifier(),
            rewriter,
            config,
            key: Arc::new(key),
            state: PipelineState::default(),
            summary: RunSummary::default(),
            stopping: false,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Process the source directory until `cancel` fires.
    ///
    /// Segments that are being encrypted when `cancel` fires are finished, and
    /// the newest playlist revision is published if possible.
    pub async fn run(mut self, cancel: CancellationToken) -> KagiResult<RunSummary> {
        let (mut events, watcher) = self.config.watcher().spawn(cancel.clone())?;
        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(self.key.clone(), self.config.workers, report_tx);

        log::info!(
            "Encrypting {} into {} with {} worker(s).",
            self.config.source_dir.display(),
            self.config.dest_dir.display(),
            self.config.workers.get()
        );

        let mut retry = interval(self.config.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(report) = reports.recv() => self.on_report(report, &pool).await,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event, &pool).await,
                    None => {
                        if !cancel.is_cancelled() {
                            log::error!("File watcher stopped unexpectedly.");
                        }
                        break;
                    }
                },
                _ = retry.tick() => self.on_retry_tick(&pool).await,
            }
        }

        self.shutdown(events, watcher, pool, reports).await
    }

    async fn shutdown(
        mut self,
        events: mpsc::Receiver<WatchEvent>,
        watcher: tokio::task::JoinHandle<()>,
        pool: WorkerPool,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    ) -> KagiResult<RunSummary> {
        self.stopping = true;
        log::info!("Stopping, waiting for {} segment(s) in progress.", pool.in_flight());

        drop(events);
        if let Err(e) = watcher.await {
            log::warn!("File watcher task failed: {e}");
        }

        pool.drain().await;
        while let Ok(report) = reports.try_recv() {
            self.on_report(report, &pool).await;
        }

        if self.config.clean_on_exit {
            let dest = self.config.dest_dir.clone();
            match tokio::task::spawn_blocking(move || atomic::clear_dir(&dest)).await {
                Ok(Ok(())) => log::info!("Cleaned {}.", self.config.dest_dir.display()),
                Ok(Err(e)) => log::warn!("Failed to clean {}: {e}", self.config.dest_dir.display()),
                Err(e) => log::warn!("Failed to clean {}: {e}", self.config.dest_dir.display()),
            }
        } else {
            self.publish_all().await;
        }

        let summary = self.summary;
        log::info!(
            "Encrypted {} segment(s), confirmed {}, failed {}, published {} playlist revision(s).",
            summary.encrypted,
            summary.confirmed,
            summary.failed,
            summary.manifests_published
        );
        Ok(summary)
    }

    async fn on_event(&mut self, event: WatchEvent, pool: &WorkerPool) {
        let Some(name) = util::file_name(event.path()).map(str::to_string) else {
            return;
        };

        match (self.classifier.classify(&name), event) {
            (FileKind::Ignored, _) => {}

            (FileKind::MediaSegment(sequence), WatchEvent::Pending(path)) => {
                let dest = self.config.dest_dir.join(&name);
                let segment = self.state.discover_segment(&name, sequence, path, dest);
                // until the new version is encrypted, the destination holds an old one
                segment.stale = true;
            }
            (FileKind::MediaSegment(sequence), WatchEvent::Ready(path)) => {
                self.segment_ready(&name, sequence, path, pool).await
            }
            (FileKind::MediaSegment(_), WatchEvent::Removed(_)) => {
                if let Some(segment) = self.state.segments.get_mut(&name) {
                    log::debug!("{name} was removed from the source.");
                    segment.removed = true;
                }
                self.prune_removed().await;
            }

            (FileKind::InitSegment, WatchEvent::Pending(path)) => {
                let dest = self.config.dest_dir.join(&name);
                self.state.discover_init(&name, path, dest);
            }
            (FileKind::InitSegment, WatchEvent::Ready(path)) => self.publish_init(&name, path).await,
            (FileKind::InitSegment, WatchEvent::Removed(_)) => {
                log::debug!("{name} was removed from the source, keeping the published copy.");
            }

            (FileKind::Manifest, WatchEvent::Ready(path)) => self.manifest_ready(&name, &path).await,
            (FileKind::Manifest, _) => {}
        }
    }

    async fn segment_ready(&mut self, name: &str, sequence: u64, path: PathBuf, pool: &WorkerPool) {
        let fingerprint = match Fingerprint::of(&path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                log::debug!("Failed to stat {}: {e}", path.display());
                return;
            }
        };

        let retries = self.config.retries;
        let dest = self.config.dest_dir.join(name);
        let segment = self.state.discover_segment(name, sequence, path, dest);
        segment.removed = false;
        segment.advance(SegmentState::Quiesced);
        if segment.encrypted == Some(fingerprint) {
            log::debug!("{name} is unchanged, skipping.");
            segment.stale = false;
            return;
        }

        segment.stale = true;
        if !segment.observe(fingerprint, retries) {
            log::debug!("{name} already failed {retries} time(s), waiting for a new version.");
            return;
        }
        if segment.in_flight {
            segment.dirty = true;
            return;
        }

        if segment.encrypted.is_none()
            && crypt::is_current(
                &segment.source_path,
                &segment.dest_path,
                &self.key,
                segment.sequence,
            )
        {
            segment.encrypted = Some(fingerprint);
            segment.stale = false;
            segment.advance(SegmentState::Encrypted);
            self.summary.confirmed += 1;
            log::info!("{name} is already encrypted at the destination.");
            self.publish_all().await;
            return;
        }

        self.dispatch(name, pool).await;
    }

    async fn dispatch(&mut self, name: &str, pool: &WorkerPool) {
        if self.stopping {
            return;
        }
        let Some(segment) = self.state.segments.get_mut(name) else {
            return;
        };

        segment.in_flight = true;
        segment.dirty = false;
        let job = EncryptJob {
            file_name: name.to_string(),
            sequence: segment.sequence,
            source_path: segment.source_path.clone(),
            dest_path: segment.dest_path.clone(),
        };
        pool.dispatch(job).await;
    }

    async fn on_report(&mut self, report: WorkerReport, pool: &WorkerPool) {
        match report {
            WorkerReport::Encrypted {
                file_name,
                fingerprint,
            } => {
                let Some(segment) = self.state.segments.get_mut(&file_name) else {
                    return;
                };
                segment.in_flight = false;
                segment.encrypted = Some(fingerprint);
                segment.attempts = 0;
                segment.advance(SegmentState::Encrypted);
                self.summary.encrypted += 1;
                log::info!("Encrypted {file_name} (sequence {}).", segment.sequence);

                // the encoder touched the file again while we were reading it
                let changed =
                    Fingerprint::of(&segment.source_path).is_ok_and(|f| f != fingerprint);
                segment.stale = changed;
                let again = segment.dirty && changed;
                segment.dirty = false;
                if again {
                    self.dispatch(&file_name, pool).await;
                }

                self.publish_all().await;
                self.prune_removed().await;
            }
            WorkerReport::Failed { file_name, error } => {
                let retries = self.config.retries;
                let Some(segment) = self.state.segments.get_mut(&file_name) else {
                    return;
                };
                segment.in_flight = false;

                if segment.removed {
                    log::debug!("Dropped {file_name}, it was removed from the source. {error}");
                    self.prune_removed().await;
                    return;
                }
                if segment.dirty {
                    log::debug!("{file_name} changed while encrypting, starting over. {error}");
                    self.dispatch(&file_name, pool).await;
                    return;
                }

                segment.attempts += 1;
                if segment.attempts < retries {
                    log::warn!("Processing {file_name} failed, retry later. {error}");
                } else {
                    log::error!(
                        "Processing {file_name} failed, max retries exceed, waiting for a new version. {error}"
                    );
                    self.summary.failed += 1;
                }
            }
        }
    }

    async fn on_retry_tick(&mut self, pool: &WorkerPool) {
        let retries = self.config.retries;
        let mut names: Vec<String> = self
            .state
            .segments
            .iter()
            .filter(|(_, s)| !s.in_flight && !s.removed && s.attempts > 0 && s.attempts < retries)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        for name in names {
            self.dispatch(&name, pool).await;
        }

        let init = self
            .state
            .init
            .as_ref()
            .filter(|i| i.attempts > 0 && i.attempts < retries)
            .map(|i| (i.file_name.clone(), i.source_path.clone()));
        if let Some((name, path)) = init {
            self.publish_init(&name, path).await;
        }

        self.publish_all().await;
    }

    async fn publish_init(&mut self, name: &str, path: PathBuf) {
        let fingerprint = match Fingerprint::of(&path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                log::debug!("Failed to stat {}: {e}", path.display());
                return;
            }
        };

        let dest = self.config.dest_dir.join(name);
        let init = self.state.discover_init(name, path, dest);
        if init.published == Some(fingerprint) {
            return;
        }
        init.advance(InitState::Quiesced);

        let (src, dest) = (init.source_path.clone(), init.dest_path.clone());
        let result = tokio::task::spawn_blocking(move || crypt::copy_init(&src, &dest))
            .await
            .map_err(KagiError::from)
            .and_then(|r| r);

        let retries = self.config.retries;
        let Some(init) = self.state.init.as_mut() else {
            return;
        };
        match result {
            Ok((fingerprint, outcome)) => {
                init.published = Some(fingerprint);
                init.attempts = 0;
                init.advance(InitState::Published);
                match outcome {
                    PublishOutcome::Written => log::info!("Published {name}."),
                    PublishOutcome::Unchanged => {
                        log::info!("{name} is already at the destination.")
                    }
                }
                self.publish_all().await;
            }
            Err(e) => {
                init.attempts += 1;
                if init.attempts < retries {
                    log::warn!("Processing {name} failed, retry later. {e}");
                } else {
                    log::error!(
                        "Processing {name} failed, max retries exceed, waiting for a new version. {e}"
                    );
                }
            }
        }
    }

    async fn manifest_ready(&mut self, name: &str, path: &Path) {
        let snapshot = match tokio::fs::read_to_string(path)
            .await
            .map_err(KagiError::from)
            .and_then(|text| ManifestSnapshot::parse(&text, &self.classifier))
        {
            Ok(snapshot) => snapshot,
            Err(e) if e.class() == ErrorClass::Structural => {
                log::warn!("Skipping this revision of {name}. {e}");
                return;
            }
            Err(e) => {
                log::warn!("Failed to read {name}, waiting for the next revision. {e}");
                return;
            }
        };

        let sequence_derived = self.key.iv_mode() == IvMode::SequenceDerived;
        let slot = self.state.manifests.entry(name.to_string()).or_default();
        if sequence_derived && !slot.warned_sequence_mismatch {
            if let Some(segment) = snapshot.sequence_mismatches().next() {
                log::warn!(
                    "{name}: {} has media sequence {} but file sequence {}. Players will use a different IV, consider setting an explicit IV.",
                    segment.file_name,
                    segment.media_sequence,
                    segment.sequence
                );
                slot.warned_sequence_mismatch = true;
            }
        }

        log::debug!(
            "Read {name}: {} segment(s) from media sequence {}{}.",
            snapshot.segments().len(),
            snapshot.media_sequence(),
            if snapshot.is_end() { ", ended" } else { "" }
        );
        // older deferred revisions are superseded
        slot.pending = Some(snapshot);

        self.try_publish(name).await;
        self.prune_removed().await;
    }

    async fn publish_all(&mut self) {
        let mut names: Vec<String> = self
            .state
            .manifests
            .iter()
            .filter(|(_, slot)| slot.pending.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        for name in names {
            self.try_publish(&name).await;
        }
    }

    async fn try_publish(&mut self, name: &str) {
        let Some(snapshot) = self
            .state
            .manifests
            .get(name)
            .and_then(|slot| slot.pending.as_ref())
        else {
            return;
        };

        let missing = self.state.missing_for(snapshot);
        if !missing.is_empty() {
            let waiting_for = missing.join(", ");
            if let Some(slot) = self.state.manifests.get_mut(name) {
                if slot.waiting_for.as_deref() != Some(waiting_for.as_str()) {
                    log::info!("Deferring {name}, waiting for {waiting_for}.");
                    slot.waiting_for = Some(waiting_for);
                }
            }
            return;
        }

        let text = self.rewriter.rewrite(snapshot);
        let dest = self.config.dest_dir.join(name);
        let result =
            tokio::task::spawn_blocking(move || atomic::write_if_changed(&dest, text.as_bytes()))
                .await
                .map_err(KagiError::from)
                .and_then(|r| r);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Failed to publish {name}, retry later. {e}");
                return;
            }
        };

        let Some(slot) = self.state.manifests.get_mut(name) else {
            return;
        };
        let Some(snapshot) = slot.pending.take() else {
            return;
        };
        slot.waiting_for = None;

        match outcome {
            PublishOutcome::Written => {
                log::info!(
                    "Published {name} with {} segment(s).",
                    snapshot.segments().len()
                );
                self.summary.manifests_published += 1;
            }
            PublishOutcome::Unchanged => log::debug!("{name} is unchanged."),
        }
        for entry in snapshot.segments() {
            if let Some(segment) = self.state.segments.get_mut(&entry.file_name) {
                segment.advance(SegmentState::Published);
            }
        }
        slot.published = Some(snapshot);
    }

    /// Delete destination copies of removed segments that no playlist names anymore.
    async fn prune_removed(&mut self) {
        let mut names: Vec<String> = self
            .state
            .segments
            .iter()
            .filter(|(name, s)| s.removed && !s.in_flight && !self.state.is_referenced(name))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        for name in names {
            let Some(segment) = self.state.segments.get(&name) else {
                continue;
            };
            match tokio::fs::remove_file(&segment.dest_path).await {
                Ok(()) => log::info!("Removed {name} from the destination."),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to remove {name} from the destination, retry later. {e}");
                    continue;
                }
            }
            self.state.segments.remove(&name);
        }
    }
}
