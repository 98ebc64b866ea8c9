// Playlist manager: owns the manifest, the stream pipelines and the refresh task
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use manifest::hls;
use manifest::{
    ContentType, ID, Manifest, ManifestKind, MergeOutcome, ParseError, Period, Tick,
    merge_manifest, merge_representation,
};
use parking_lot::{Mutex, RwLock};
use strum::Display;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::AdaptiveConfig;
use crate::context::Context;
use crate::error::{AdaptiveError, TransportError};
use crate::events::ManagerEvent;
use crate::http::{ChunkType, ConnectionManager};
use crate::logic::{BufferingLogic, SegmentTracker, SharedLogic};
use crate::metrics::PerformanceMetrics;
use crate::plumbing::{DemuxStatus, EsOutput};
use crate::stream::{BufferingStatus, StreamFlavor, StreamPipeline, StreamResources};

/// Wait of the control task when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ManagerState {
    Created,
    Initialized,
    Started,
    Stopped,
}

/// Player side queries answered by [`PlaylistManager::control`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlQuery {
    CanSeek,
    CanPause,
    CanControlPace,
    GetLength,
    GetTime,
    GetPosition,
    SetTime(Tick),
    /// Fraction of the playlist length, 0.0 to 1.0.
    SetPosition(f64),
    SetPauseState(bool),
    GetPtsDelay,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlReply {
    Bool(bool),
    Time(Tick),
    Position(f64),
    Done,
}

/// Values cached for player queries, refreshed from the manifest and the
/// demux position.
#[derive(Debug, Clone, Default)]
struct Controls {
    live: bool,
    playlist_start: Tick,
    playlist_end: Tick,
    playlist_length: Tick,
    time: Option<Tick>,
    first_pcr: Option<Tick>,
    min_ahead: Option<Tick>,
    paused: bool,
    stalled: bool,
    last_update: Option<Instant>,
    next_update: Option<Instant>,
}

/// State shared with the control task.
struct Shared {
    config: Arc<AdaptiveConfig>,
    manifest: RwLock<Manifest>,
    controls: Mutex<Controls>,
    /// Representations currently used by a pipeline.
    wanted: Mutex<BTreeSet<ID>>,
    connections: Arc<ConnectionManager>,
    metrics: Arc<PerformanceMetrics>,
    events: mpsc::Sender<ManagerEvent>,
    wake: Notify,
    token: CancellationToken,
    failed_updates: AtomicU32,
}

/// Next refresh delay: half of the buffered media, bounded by the manifest's
/// minimum update period, never below `floor`.
pub fn next_update_interval(
    min_ahead: Option<Tick>,
    min_update_period: Option<Tick>,
    floor: Duration,
) -> Duration {
    let ticks = match (min_ahead.map(|a| a / 2), min_update_period) {
        (Some(half), Some(period)) => half.min(period),
        (Some(half), None) => half,
        (None, Some(period)) => period,
        (None, None) => 0,
    };
    Duration::from_micros(ticks.max(0) as u64).max(floor)
}

impl Shared {
    fn emit(&self, event: ManagerEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!(error = %e, "Manager event dropped");
        }
    }

    fn refresh_controls(&self) {
        let manifest = self.manifest.read();
        let wanted = self.wanted.lock();
        let mut reps: Vec<_> = manifest
            .representations()
            .filter(|r| r.loaded && !r.segments.is_empty())
            .filter(|r| wanted.is_empty() || wanted.contains(&r.id))
            .collect();
        if reps.is_empty() {
            reps = manifest.representations().filter(|r| r.loaded).collect();
        }
        let start = reps.iter().map(|r| r.start_time()).min().unwrap_or_default();
        let end = reps.iter().map(|r| r.end_time()).max().unwrap_or_default();

        let mut controls = self.controls.lock();
        controls.live = manifest.live;
        controls.playlist_start = start;
        controls.playlist_end = end;
        controls.playlist_length = if manifest.live {
            end - start
        } else if manifest.duration > 0 {
            manifest.duration
        } else {
            end - start
        };
    }

    /// Loads media playlists that a pipeline is waiting for.
    async fn load_pending(&self) {
        let pending: Vec<(ID, String)> = {
            let manifest = self.manifest.read();
            let wanted = self.wanted.lock();
            wanted
                .iter()
                .filter_map(|id| manifest.representation(id))
                .filter(|r| r.needs_loading())
                .filter_map(|r| Some((r.id.clone(), r.playlist_url.clone()?)))
                .collect()
        };
        for (id, url) in pending {
            match self.load_representation(&id, &url).await {
                Ok(_) => self.metrics.record_playlist_update(true),
                Err(e) => {
                    self.metrics.record_playlist_update(false);
                    warn!(
                        representation = %id,
                        url = %url,
                        error = %e,
                        "Media playlist load failed"
                    );
                    self.emit(ManagerEvent::UpdateFailed {
                        attempt: self.failed_updates.fetch_add(1, Ordering::Relaxed) + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.refresh_controls();
    }

    /// Fetches one HLS media playlist and merges it into `id`.
    async fn load_representation(&self, id: &ID, url: &str) -> Result<usize, AdaptiveError> {
        let retrieved = self
            .connections
            .retrieve(ChunkType::Playlist, url)
            .await?;
        let text = std::str::from_utf8(&retrieved.body).map_err(|_| ParseError::Encoding)?;
        let template = self
            .manifest
            .read()
            .representation(id)
            .cloned()
            .ok_or_else(|| AdaptiveError::invalid_state(format!("representation {id} vanished")))?;
        let media = hls::parse_media_playlist(text, &retrieved.url, &template)?;

        let mut manifest = self.manifest.write();
        let Some(rep) = manifest.representation_mut(id) else {
            return Ok(0);
        };
        let first_load = !rep.loaded;
        let outcome = if first_load {
            let added = media.representation.segments.len();
            *rep = media.representation;
            rep.loaded = true;
            MergeOutcome {
                added,
                changed: true,
                anchor_conflict: false,
            }
        } else {
            let (merged, outcome) = merge_representation(rep, &media.representation);
            *rep = merged;
            outcome
        };
        let target_duration = rep.target_duration;

        if media.live {
            manifest.live = true;
            manifest.min_update_period = manifest.min_update_period.or(target_duration);
        } else if first_load {
            manifest.live = false;
        }
        if manifest.presentation_start_offset.is_none() {
            manifest.presentation_start_offset = media.start_offset;
        }
        manifest.refresh_duration();
        drop(manifest);

        debug!(
            representation = %id,
            added = outcome.added,
            live = media.live,
            "Media playlist loaded"
        );
        if media.anchor_conflict || outcome.anchor_conflict {
            warn!(representation = %id, "Conflicting program date-time anchors");
            self.emit(ManagerEvent::AnchorConflict {
                representation: id.clone(),
            });
        }
        Ok(outcome.added)
    }

    /// Re-fetches the whole manifest and merges it.
    async fn reload_manifest(&self) -> Result<usize, AdaptiveError> {
        let (kind, url) = {
            let manifest = self.manifest.read();
            (manifest.kind, manifest.url.clone())
        };
        let retrieved = self
            .connections
            .retrieve(ChunkType::Playlist, &url)
            .await?;
        let update = manifest::parse_as(kind, &retrieved.body, &url)?;
        let mut manifest = self.manifest.write();
        let (merged, outcomes) = merge_manifest(&manifest, &update);
        *manifest = merged;
        drop(manifest);

        let mut added = 0;
        for (id, outcome) in outcomes {
            added += outcome.added;
            if outcome.anchor_conflict {
                self.emit(ManagerEvent::AnchorConflict { representation: id });
            }
        }
        Ok(added)
    }

    async fn refresh(&self) -> Result<usize, AdaptiveError> {
        let kind = self.manifest.read().kind;
        if kind != ManifestKind::Hls {
            return self.reload_manifest().await;
        }
        let targets: Vec<(ID, String)> = {
            let manifest = self.manifest.read();
            let wanted = self.wanted.lock();
            wanted
                .iter()
                .filter_map(|id| manifest.representation(id))
                .filter(|r| r.loaded && (r.live || manifest.live))
                .map(|r| {
                    let url = r.playlist_url.clone().unwrap_or_else(|| manifest.url.clone());
                    (r.id.clone(), url)
                })
                .collect()
        };
        let mut added = 0;
        for (id, url) in targets {
            added += self.load_representation(&id, &url).await?;
        }
        Ok(added)
    }

    /// One control cycle; returns the time until the next one is due.
    async fn cycle(&self) -> Duration {
        self.load_pending().await;

        let (live, stalled, next_update, min_ahead) = {
            let controls = self.controls.lock();
            (controls.live, controls.stalled, controls.next_update, controls.min_ahead)
        };
        if !live || stalled {
            return IDLE_WAIT;
        }
        let now = Instant::now();
        if let Some(due) = next_update.filter(|due| *due > now) {
            return due - now;
        }

        let result = self.refresh().await;
        let wait = match result {
            Ok(added) => {
                self.failed_updates.store(0, Ordering::Relaxed);
                self.metrics.record_playlist_update(true);
                debug!(added, "Live playlist refreshed");
                self.emit(ManagerEvent::PlaylistUpdated { added });
                let min_update_period = self.manifest.read().min_update_period;
                next_update_interval(
                    min_ahead,
                    min_update_period,
                    self.config.playlist.update_floor,
                )
            }
            Err(e) => {
                let attempt = self.failed_updates.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.record_playlist_update(false);
                warn!(attempt, error = %e, "Live playlist refresh failed");
                self.emit(ManagerEvent::UpdateFailed {
                    attempt,
                    reason: e.to_string(),
                });
                if attempt >= self.config.playlist.max_failed_updates {
                    error!(failures = attempt, "Live playlist stalled");
                    self.controls.lock().stalled = true;
                    self.emit(ManagerEvent::ManifestStalled { failures: attempt });
                }
                self.config.playlist.refresh_backoff.delay_for_attempt(attempt)
            }
        };
        self.refresh_controls();
        let mut controls = self.controls.lock();
        controls.last_update = Some(now);
        controls.next_update = Some(Instant::now() + wait);
        wait
    }
}

async fn control_loop(shared: Arc<Shared>) {
    debug!("Control task started");
    loop {
        let wait = shared.cycle().await;
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Control task stopped");
}

/// Top level orchestrator of an adaptive session.
///
/// `bufferize`, `dequeue` and `control` are called from the player thread
/// and never wait on the network; manifest loading and live refreshes run
/// on a control task inside the context's runtime.
pub struct PlaylistManager {
    ctx: Arc<Context>,
    shared: Arc<Shared>,
    logic: Arc<SharedLogic>,
    streams: Mutex<Vec<StreamPipeline>>,
    /// Pipelines left by a seek to another period; their track deletions
    /// still have to reach the output.
    retired: Mutex<Vec<StreamPipeline>>,
    period: Mutex<Option<ID>>,
    state: Mutex<ManagerState>,
    control_task: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::Receiver<ManagerEvent>>>,
    track_ids: Arc<AtomicU64>,
}

impl PlaylistManager {
    /// Fetches `url`, sniffs its protocol and parses it.
    pub fn open(url: &str, ctx: Arc<Context>) -> Result<Self, AdaptiveError> {
        let connections = Self::connections(&ctx);
        let timeout = ctx.config().playlist.initial_fetch_timeout;
        let retrieved = ctx
            .block_on(async {
                tokio::time::timeout(timeout, connections.retrieve(ChunkType::Playlist, url)).await
            })
            .map_err(|_| TransportError::timeout(format!("fetching manifest {url}")))??;

        let text = std::str::from_utf8(&retrieved.body).map_err(|_| ParseError::Encoding)?;
        let kind = ManifestKind::detect(text, retrieved.content_type.as_deref(), url)
            .ok_or_else(|| ParseError::unsupported("unrecognized manifest format"))?;
        let manifest = manifest::parse_as(kind, &retrieved.body, &retrieved.url)?;
        info!(url, kind = %kind, live = manifest.live, "Manifest opened");
        Ok(Self::build(manifest, ctx, connections))
    }

    /// Wraps an already parsed manifest.
    pub fn from_manifest(manifest: Manifest, ctx: Arc<Context>) -> Self {
        let connections = Self::connections(&ctx);
        Self::build(manifest, ctx, connections)
    }

    fn connections(ctx: &Context) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            ctx.config(),
            ctx.factories().to_vec(),
            ctx.metrics().clone(),
            ctx.handle(),
        )
    }

    fn build(manifest: Manifest, ctx: Arc<Context>, connections: Arc<ConnectionManager>) -> Self {
        let config = ctx.config().clone();
        let logic = Arc::new(SharedLogic::from_config(&config.logic));
        connections.set_rate_observer(logic.clone());
        let (tx, rx) = mpsc::channel(config.events_capacity());
        let shared = Arc::new(Shared {
            config,
            manifest: RwLock::new(manifest),
            controls: Mutex::new(Controls::default()),
            wanted: Mutex::new(BTreeSet::new()),
            connections,
            metrics: ctx.metrics().clone(),
            events: tx,
            wake: Notify::new(),
            token: CancellationToken::new(),
            failed_updates: AtomicU32::new(0),
        });
        shared.refresh_controls();
        Self {
            ctx,
            shared,
            logic,
            streams: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            period: Mutex::new(None),
            state: Mutex::new(ManagerState::Created),
            control_task: Mutex::new(None),
            events: Mutex::new(Some(rx)),
            track_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn logic_name(&self) -> &'static str {
        self.logic.name()
    }

    /// Read access to the current manifest.
    pub fn with_manifest<R>(&self, f: impl FnOnce(&Manifest) -> R) -> R {
        f(&self.shared.manifest.read())
    }

    /// Receiver of manager events. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ManagerEvent>> {
        self.events.lock().take()
    }

    /// Builds one pipeline per playable adaptation set and enables one set
    /// per content type.
    pub fn init(&self) -> Result<(), AdaptiveError> {
        let mut state = self.state.lock();
        if *state != ManagerState::Created {
            return Err(AdaptiveError::invalid_state(format!("cannot init in state {state}")));
        }

        let session_keys = self.shared.manifest.read().session_keys.clone();
        if !session_keys.is_empty() {
            self.ctx.block_on(self.ctx.keyring().preload(
                &self.shared.connections,
                &self.shared.metrics,
                &session_keys,
            ));
        }

        let manifest = self.shared.manifest.read();
        let Some(period) = manifest.first_period() else {
            return Err(AdaptiveError::unsupported("manifest has no period"));
        };
        let streams = self.build_streams(&manifest, period);
        let period = period.id.clone();
        drop(manifest);

        if streams.is_empty() {
            return Err(AdaptiveError::unsupported("no playable adaptation set"));
        }
        info!(
            streams = streams.len(),
            period = %period,
            logic = self.logic.name(),
            "Playlist manager initialized"
        );
        *self.streams.lock() = streams;
        *self.period.lock() = Some(period);
        *state = ManagerState::Initialized;
        Ok(())
    }

    fn resources(&self) -> StreamResources {
        let config = &self.shared.config;
        StreamResources {
            connections: self.shared.connections.clone(),
            demuxers: self.ctx.demuxers().clone(),
            keyring: self.ctx.keyring().clone(),
            metrics: self.shared.metrics.clone(),
            track_ids: self.track_ids.clone(),
            block_size: config.fetch.block_size,
            max_not_found: config.fetch.max_not_found,
        }
    }

    /// One pipeline per playable adaptation set of `period`, with one set
    /// enabled per content type.
    fn build_streams(&self, manifest: &Manifest, period: &Period) -> Vec<StreamPipeline> {
        let buffering_config = &self.shared.config.buffering;
        let resources = self.resources();
        let flavor = StreamFlavor::for_kind(manifest.kind);

        let mut streams = Vec::new();
        let mut enabled_types: Vec<ContentType> = Vec::new();
        // default roles first so that they win the per type selection
        let mut sets: Vec<_> = period
            .adaptation_sets
            .iter()
            .filter(|s| s.supported && !s.representations.is_empty())
            .collect();
        sets.sort_by_key(|s| s.role.priority());
        for set in sets {
            let buffering = BufferingLogic::new(buffering_config);
            let tracker = SegmentTracker::new(set.id.clone(), self.logic.clone(), buffering.clone())
                .with_period(period.id.clone());
            let mut stream =
                StreamPipeline::new(set, flavor, tracker, buffering, resources.clone());
            let enable = set.content_type == ContentType::Unknown
                || !enabled_types.contains(&set.content_type);
            if enable {
                enabled_types.push(set.content_type);
                stream.set_enabled(true);
            }
            debug!(
                period = %period.id,
                set = %set.id,
                kind = %set.content_type,
                enabled = enable,
                "Stream created"
            );
            streams.push(stream);
        }
        streams
    }

    /// Replaces finished pipelines with those of the next period that has
    /// playable streams. Returns false when there is none.
    fn advance_period(
        &self,
        streams: &mut Vec<StreamPipeline>,
        output: &mut dyn EsOutput,
    ) -> bool {
        let manifest = self.shared.manifest.read();
        let mut current = self.period.lock();
        let mut candidate = current.as_ref().and_then(|id| manifest.next_period(id));
        while let Some(next) = candidate {
            let built = self.build_streams(&manifest, next);
            if built.is_empty() {
                debug!(period = %next.id, "Skipping period without playable streams");
                candidate = manifest.next_period(&next.id);
                continue;
            }
            for mut stream in streams.drain(..) {
                stream.close(true);
                stream.drain(output);
            }
            info!(
                from = ?current.as_ref(),
                to = %next.id,
                start = next.start,
                "Period changed"
            );
            *streams = built;
            *current = Some(next.id.clone());
            self.shared.emit(ManagerEvent::PeriodChanged {
                period: next.id.clone(),
            });
            return true;
        }
        false
    }

    /// Id of the period being played.
    pub fn current_period(&self) -> Option<ID> {
        self.period.lock().clone()
    }

    /// Launches the control task.
    pub fn start(&self) -> Result<(), AdaptiveError> {
        let mut state = self.state.lock();
        if *state != ManagerState::Initialized {
            return Err(AdaptiveError::invalid_state(format!("cannot start in state {state}")));
        }
        let shared = self.shared.clone();
        *self.control_task.lock() = Some(self.ctx.handle().spawn(control_loop(shared)));
        *state = ManagerState::Started;
        Ok(())
    }

    /// Stops the control task, cancels transfers, then drops the pipelines
    /// and the manifest tree.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ManagerState::Stopped | ManagerState::Created) {
                *state = ManagerState::Stopped;
                return;
            }
            *state = ManagerState::Stopped;
        }
        self.shared.token.cancel();
        self.shared.wake.notify_one();
        if let Some(task) = self.control_task.lock().take() {
            if let Err(e) = self.ctx.block_on(task) {
                warn!(error = %e, "Control task ended abnormally");
            }
        }
        self.ctx.block_on(self.shared.connections.shutdown());
        for mut stream in self.streams.lock().drain(..) {
            stream.shutdown();
        }
        for mut stream in self.retired.lock().drain(..) {
            stream.shutdown();
        }
        {
            let mut manifest = self.shared.manifest.write();
            let (kind, url) = (manifest.kind, std::mem::take(&mut manifest.url));
            *manifest = Manifest::new(kind, url);
        }
        self.shared.metrics.log_summary();
        info!("Playlist manager stopped");
    }

    /// Enables or disables the pipeline of an adaptation set.
    pub fn set_stream_enabled(&self, set: &ID, enabled: bool) -> bool {
        let mut streams = self.streams.lock();
        let Some(stream) = streams.iter_mut().find(|s| s.set_id() == set) else {
            return false;
        };
        stream.set_enabled(enabled);
        true
    }

    pub fn streams(&self) -> Vec<(ID, bool)> {
        self.streams
            .lock()
            .iter()
            .map(|s| (s.set_id().clone(), s.is_enabled()))
            .collect()
    }

    fn ensure_started(&self) -> Result<(), AdaptiveError> {
        match self.state() {
            ManagerState::Started => Ok(()),
            state => Err(AdaptiveError::invalid_state(format!("manager is {state}"))),
        }
    }

    /// Buffers every enabled stream up to `deadline`.
    pub fn bufferize(&self, deadline: Tick) -> Result<BufferingStatus, AdaptiveError> {
        self.ensure_started()?;
        if self.shared.controls.lock().paused {
            return Ok(BufferingStatus::Full);
        }
        let max_steps = self.shared.config.buffering.max_demux_steps;
        let mut streams = self.streams.lock();
        let manifest = self.shared.manifest.read();

        let mut any = false;
        let mut all_end = true;
        let mut all_full = true;
        let mut wanted = BTreeSet::new();
        let mut needs_load = false;
        let mut min_ahead: Option<Tick> = None;
        let mut failure = None;

        for stream in streams.iter_mut().filter(|s| s.is_enabled()) {
            any = true;
            let status = match stream.bufferize(&manifest, deadline, max_steps) {
                Ok(status) => status,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            match status {
                BufferingStatus::End => {}
                BufferingStatus::Full => all_end = false,
                BufferingStatus::Ongoing => {
                    all_end = false;
                    all_full = false;
                }
            }
            if let Some(rep) = stream.current_representation().cloned() {
                needs_load |= manifest.representation(&rep).is_some_and(|r| r.needs_loading());
                wanted.insert(rep);
            }
            if !stream.is_eof() {
                let ahead = stream.min_ahead(&manifest);
                min_ahead = Some(min_ahead.map_or(ahead, |m| m.min(ahead)));
            }
        }
        let events: Vec<_> = streams.iter_mut().flat_map(|s| s.take_events()).collect();
        drop(manifest);
        drop(streams);

        for event in events {
            self.shared.emit(event);
        }
        let changed = {
            let mut current = self.shared.wanted.lock();
            let changed = *current != wanted;
            *current = wanted;
            changed
        };
        self.shared.controls.lock().min_ahead = min_ahead;
        if needs_load || changed {
            self.shared.wake.notify_one();
        }
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(if !any || all_end {
            BufferingStatus::End
        } else if all_full {
            BufferingStatus::Full
        } else {
            BufferingStatus::Ongoing
        })
    }

    /// Delivers every command due at `up_to` to `output`. Once every
    /// enabled stream of a period is consumed, playback moves on to the
    /// next period and `Success` is returned.
    pub fn dequeue(&self, up_to: Tick, output: &mut dyn EsOutput) -> DemuxStatus {
        let mut streams = self.streams.lock();
        for mut stream in self.retired.lock().drain(..) {
            stream.drain(output);
        }
        let mut any = false;
        let mut all_eof = true;
        for stream in streams.iter_mut().filter(|s| s.is_enabled()) {
            any = true;
            match stream.dequeue(up_to, output) {
                DemuxStatus::Error => return DemuxStatus::Error,
                DemuxStatus::Eof => {}
                DemuxStatus::Success => all_eof = false,
            }
            let mut controls = self.shared.controls.lock();
            if controls.first_pcr.is_none() {
                controls.first_pcr = stream.pcr();
            }
        }
        if any && all_eof && self.advance_period(&mut streams, output) {
            return DemuxStatus::Success;
        }
        if !any || all_eof {
            DemuxStatus::Eof
        } else {
            DemuxStatus::Success
        }
    }

    /// Effective time of the earliest command still queued by an enabled
    /// stream; the player should call `dequeue` again at that time.
    pub fn next_demux_time(&self) -> Option<Tick> {
        self.streams
            .lock()
            .iter()
            .filter(|s| s.is_enabled())
            .filter_map(|s| s.next_command_time())
            .min()
    }

    /// Lowest level every enabled, unfinished stream has buffered.
    fn common_level(&self) -> Option<Tick> {
        self.streams
            .lock()
            .iter()
            .filter(|s| s.is_enabled() && !s.is_eof())
            .map(|s| s.buffering_level())
            .try_fold(Tick::MAX, |acc, level| level.map(|l| acc.min(l)))
            .filter(|l| *l != Tick::MAX)
    }

    fn first_dts(&self) -> Option<Tick> {
        self.streams
            .lock()
            .iter()
            .filter(|s| s.is_enabled())
            .filter_map(|s| s.first_dts())
            .min()
    }

    /// Advances playback by `increment`: buffers ahead, then delivers what
    /// every stream has reached.
    pub fn do_demux(
        &self,
        increment: Tick,
        output: &mut dyn EsOutput,
    ) -> Result<DemuxStatus, AdaptiveError> {
        let time = self.shared.controls.lock().time;
        let start = match time.or_else(|| self.first_dts()) {
            Some(start) => start,
            None => {
                // nothing demuxed yet: fetch until a first timestamp exists
                self.bufferize(Tick::MIN)?;
                match self.first_dts() {
                    Some(start) => start,
                    None => return Ok(self.dequeue(Tick::MIN, output)),
                }
            }
        };

        let target = start.saturating_add(increment);
        let ahead = self.with_manifest(|m| {
            BufferingLogic::new(&self.shared.config.buffering).min_buffering(m)
        });
        let status = self.bufferize(target.saturating_add(ahead))?;
        let reachable = if status == BufferingStatus::End {
            target
        } else {
            self.common_level().map_or(start, |level| level.min(target))
        };
        let demux = self.dequeue(reachable, output);
        self.shared.controls.lock().time = Some(reachable.max(start));
        Ok(demux)
    }

    /// Waits for network activity, or `timeout`. Returns false on timeout.
    pub fn wait_activity(&self, timeout: Duration) -> bool {
        let activity = self.shared.connections.activity();
        self.ctx
            .block_on(async { tokio::time::timeout(timeout, activity.notified()).await.is_ok() })
    }

    fn reposition(&self, time: Tick) -> bool {
        let mut streams = self.streams.lock();
        let manifest = self.shared.manifest.read();
        let mut current = self.period.lock();
        if let Some(target) = manifest
            .period_at(time)
            .filter(|p| Some(&p.id) != current.as_ref())
        {
            let built = self.build_streams(&manifest, target);
            if built.is_empty() {
                return false;
            }
            let mut retired = self.retired.lock();
            for mut stream in streams.drain(..) {
                stream.close(false);
                retired.push(stream);
            }
            debug!(period = %target.id, time, "Seeking into another period");
            *streams = built;
            *current = Some(target.id.clone());
        }
        drop(current);
        let mut ok = true;
        for stream in streams.iter_mut().filter(|s| s.is_enabled()) {
            ok &= stream.set_position(&manifest, time);
        }
        drop(manifest);
        drop(streams);
        if ok {
            let mut controls = self.shared.controls.lock();
            controls.time = Some(time);
            controls.first_pcr = None;
        }
        ok
    }

    pub fn control(&self, query: ControlQuery) -> Result<ControlReply, AdaptiveError> {
        let seekable = self.with_manifest(|m| !m.live || m.time_shift_buffer_depth.is_some());
        let controls = self.shared.controls.lock().clone();
        let reply = match query {
            ControlQuery::CanSeek => ControlReply::Bool(seekable),
            ControlQuery::CanPause | ControlQuery::CanControlPace => ControlReply::Bool(true),
            ControlQuery::GetLength => ControlReply::Time(controls.playlist_length),
            ControlQuery::GetTime => {
                ControlReply::Time(controls.time.unwrap_or(controls.playlist_start))
            }
            ControlQuery::GetPosition => {
                let time = controls.time.unwrap_or(controls.playlist_start);
                let position = if controls.playlist_length > 0 {
                    (time - controls.playlist_start) as f64 / controls.playlist_length as f64
                } else {
                    0.0
                };
                ControlReply::Position(position.clamp(0.0, 1.0))
            }
            ControlQuery::SetTime(time) => {
                if !seekable {
                    return Err(AdaptiveError::unsupported("stream is not seekable"));
                }
                ControlReply::Bool(self.reposition(time))
            }
            ControlQuery::SetPosition(position) => {
                if !seekable {
                    return Err(AdaptiveError::unsupported("stream is not seekable"));
                }
                let offset = (controls.playlist_length as f64 * position.clamp(0.0, 1.0)) as Tick;
                ControlReply::Bool(self.reposition(controls.playlist_start + offset))
            }
            ControlQuery::SetPauseState(paused) => {
                self.set_paused(paused, controls.live);
                ControlReply::Done
            }
            ControlQuery::GetPtsDelay => {
                let delay = self.with_manifest(|m| {
                    let buffering = BufferingLogic::new(&self.shared.config.buffering);
                    if m.live {
                        buffering.live_delay(m)
                    } else {
                        buffering.min_buffering(m)
                    }
                });
                ControlReply::Time(delay)
            }
        };
        Ok(reply)
    }

    fn set_paused(&self, paused: bool, live: bool) {
        let was_paused = std::mem::replace(&mut self.shared.controls.lock().paused, paused);
        if was_paused && !paused && live {
            // the window moved on while paused
            for stream in self.streams.lock().iter_mut() {
                stream.restart();
            }
            let mut controls = self.shared.controls.lock();
            controls.time = None;
            controls.first_pcr = None;
            debug!("Live playback resumed from the live start");
        }
    }
}

impl Drop for PlaylistManager {
    fn drop(&mut self) {
        self.shared.token.cancel();
        if let Some(task) = self.control_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::memory::MemoryFactory;
    use manifest::{AdaptationSet, CLOCK_FREQ, Period, Representation, Segment};

    const SIX: u64 = 6 * CLOCK_FREQ as u64;

    fn context(factory: &MemoryFactory) -> Arc<Context> {
        Arc::new(
            Context::builder(AdaptiveConfig::default())
                .factory(Arc::new(factory.clone()))
                .build()
                .unwrap(),
        )
    }

    fn vod(count: u64) -> Manifest {
        let mut rep = Representation::new("v");
        rep.bandwidth = 1_000_000;
        rep.segments = (0..count)
            .map(|i| Segment::new(i, format!("http://h/{i}.ts"), i * SIX, SIX))
            .collect();
        let mut set = AdaptationSet::new("video");
        set.content_type = ContentType::Video;
        set.add_representation(rep);
        let mut period = Period::new("0");
        period.adaptation_sets.push(set);
        let mut manifest = Manifest::new(ManifestKind::Hls, "http://h/index.m3u8");
        manifest.periods.push(period);
        manifest.refresh_duration();
        manifest
    }

    #[test]
    fn update_interval_rules() {
        let floor = Duration::from_secs(5);
        assert_eq!(next_update_interval(None, None, floor), floor);
        assert_eq!(
            next_update_interval(Some(30 * CLOCK_FREQ), Some(6 * CLOCK_FREQ), floor),
            Duration::from_secs(6)
        );
        assert_eq!(
            next_update_interval(Some(16 * CLOCK_FREQ), None, floor),
            Duration::from_secs(8)
        );
        assert_eq!(next_update_interval(Some(CLOCK_FREQ), Some(CLOCK_FREQ), floor), floor);
    }

    #[test]
    fn lifecycle_is_enforced() {
        let factory = MemoryFactory::new();
        let manager = PlaylistManager::from_manifest(vod(2), context(&factory));
        assert_eq!(manager.state(), ManagerState::Created);
        assert!(manager.start().is_err());
        assert!(manager.bufferize(0).is_err());
        manager.init().unwrap();
        assert!(manager.init().is_err());
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Started);
        manager.stop();
        assert_eq!(manager.state(), ManagerState::Stopped);
        manager.stop();
    }

    #[test]
    fn vod_controls() {
        let factory = MemoryFactory::new();
        let manager = PlaylistManager::from_manifest(vod(3), context(&factory));
        manager.init().unwrap();
        manager.start().unwrap();
        assert_eq!(
            manager.control(ControlQuery::CanSeek).unwrap(),
            ControlReply::Bool(true)
        );
        assert_eq!(
            manager.control(ControlQuery::GetLength).unwrap(),
            ControlReply::Time(18 * CLOCK_FREQ)
        );
        assert_eq!(
            manager.control(ControlQuery::SetTime(7 * CLOCK_FREQ)).unwrap(),
            ControlReply::Bool(true)
        );
        assert_eq!(
            manager.control(ControlQuery::GetTime).unwrap(),
            ControlReply::Time(7 * CLOCK_FREQ)
        );
        let ControlReply::Position(position) = manager.control(ControlQuery::GetPosition).unwrap()
        else {
            panic!("expected a position");
        };
        assert!((position - 7.0 / 18.0).abs() < 1e-9);
        assert_eq!(
            manager.control(ControlQuery::GetPtsDelay).unwrap(),
            ControlReply::Time(6 * CLOCK_FREQ)
        );
        manager.stop();
    }

    #[test]
    fn live_streams_cannot_seek_without_timeshift() {
        let factory = MemoryFactory::new();
        let mut manifest = vod(3);
        manifest.live = true;
        let manager = PlaylistManager::from_manifest(manifest, context(&factory));
        assert_eq!(
            manager.control(ControlQuery::CanSeek).unwrap(),
            ControlReply::Bool(false)
        );
        assert!(manager.control(ControlQuery::SetTime(0)).is_err());
    }

    #[test]
    fn paused_manager_does_not_fetch() {
        let factory = MemoryFactory::new();
        let manager = PlaylistManager::from_manifest(vod(3), context(&factory));
        manager.init().unwrap();
        manager.start().unwrap();
        manager.control(ControlQuery::SetPauseState(true)).unwrap();
        assert_eq!(manager.bufferize(20 * CLOCK_FREQ).unwrap(), BufferingStatus::Full);
        assert!(factory.requests().is_empty());
        manager.stop();
    }
}
