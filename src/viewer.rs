//! Per-viewer controller.
//!
//! A [`Viewer`] owns everything one on-screen viewer needs: the selected base
//! and overlay series, slice index, playback, viewport, label configuration and
//! the two canvases. Every asynchronous step takes a [`CancellationToken`] from
//! the source of its axis and checks it before committing, so results of
//! superseded requests are dropped instead of rendered.

use crate::{
    compositor::{LabelLut, OverlayCompositor, OverlayDraw},
    config::ViewerConfig,
    directory::DirectoryClient,
    enums::{Outcome, ViewerEvent, ViewerPhase},
    instance::{InstanceDescriptor, OverlayIndex, SeriesRef, SliceSet},
    labels::{LabelTable, discover_labels},
    playback::{PlaybackClock, PlaybackState},
    prefetch::{PrefetchHandle, PrefetchProgress},
    slice_cache::{DecodeCache, DecodedSlice},
    token::{CancellationToken, TokenSource},
    viewport::{Affine, Canvas, ViewportState},
    voi::{Voi, render_grayscale},
};

use image::RgbaImage;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_CONTAINER: (u32, u32) = (512, 512);

/// Inputs the surrounding application passes to a viewer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerProps {
    pub series: Option<SeriesRef>,
    pub overlay_series: Option<SeriesRef>,
    /// Mirrors the multi-viewer "play all" switch.
    pub playing: bool,
    /// Every change of this counter rewinds to the first slice.
    pub reset_signal: u64,
}

/// Copy of the viewer's visible state.
#[derive(Debug, Clone)]
pub struct ViewerSnapshot {
    pub phase: ViewerPhase,
    pub series: Option<SeriesRef>,
    pub overlay_series: Option<SeriesRef>,
    pub overlay_slice_count: usize,
    pub slice_index: usize,
    pub slice_count: usize,
    pub current_instance: Option<InstanceDescriptor>,
    pub voi: Option<Voi>,
    pub error: Option<String>,
    pub progress: Option<PrefetchProgress>,
    pub labels: LabelTable,
    pub viewport: ViewportState,
    pub playback: PlaybackState,
    pub overlay_draw: Option<OverlayDraw>,
    pub base: Canvas,
    pub overlay: Canvas,
}

struct DisplayedSlice {
    instance: InstanceDescriptor,
    voi: Voi,
    image: RgbaImage,
}

struct ViewerState {
    phase: ViewerPhase,
    props: ViewerProps,
    series: Option<SeriesRef>,
    slices: SliceSet,
    index: usize,
    overlay_series: Option<SeriesRef>,
    overlay_slices: SliceSet,
    overlay_index: OverlayIndex,
    labels: LabelTable,
    viewport: ViewportState,
    playback: PlaybackState,
    container: (u32, u32),
    displayed: Option<DisplayedSlice>,
    base: Canvas,
    overlay: Canvas,
    overlay_draw: Option<OverlayDraw>,
    error: Option<String>,
    prefetch: Option<PrefetchHandle>,
}

impl ViewerState {
    fn new(config: &ViewerConfig) -> Self {
        Self {
            phase: ViewerPhase::Idle,
            props: ViewerProps::default(),
            series: None,
            slices: SliceSet::default(),
            index: 0,
            overlay_series: None,
            overlay_slices: SliceSet::default(),
            overlay_index: OverlayIndex::default(),
            labels: LabelTable::new(),
            viewport: ViewportState::default(),
            playback: PlaybackState::from_config(config),
            container: DEFAULT_CONTAINER,
            displayed: None,
            base: Canvas::new(DEFAULT_CONTAINER.0, DEFAULT_CONTAINER.1),
            overlay: Canvas::new(DEFAULT_CONTAINER.0, DEFAULT_CONTAINER.1),
            overlay_draw: None,
            error: None,
            prefetch: None,
        }
    }

    /// Redraw the base canvas from the displayed slice with the current viewport.
    fn paint_base(&mut self) {
        let (width, height) = self.container;
        self.base.resize(width, height);
        if let Some(displayed) = &self.displayed {
            let transform = self
                .viewport
                .draw_transform(self.container, displayed.image.dimensions());
            self.base.draw_image(&displayed.image, &transform);
        }
    }

    fn ready_phase(&self) -> ViewerPhase {
        if self.playback.is_playing {
            ViewerPhase::Playing
        } else {
            ViewerPhase::Ready
        }
    }
}

#[derive(Default)]
struct Tokens {
    series: TokenSource,
    display: TokenSource,
    overlay_series: TokenSource,
    overlay_draw: TokenSource,
    lifetime: TokenSource,
}

struct ViewerInner {
    cache: Arc<DecodeCache>,
    directory: DirectoryClient,
    config: ViewerConfig,
    tokens: Tokens,
    /// Dies on shutdown.
    lifetime: CancellationToken,
    state: Mutex<ViewerState>,
}

/// Cloneable handle to one viewer instance.
#[derive(Clone)]
pub struct Viewer {
    inner: Arc<ViewerInner>,
}

impl Viewer {
    pub fn new(cache: Arc<DecodeCache>, directory: DirectoryClient, config: ViewerConfig) -> Self {
        let state = Mutex::new(ViewerState::new(&config));
        let tokens = Tokens::default();
        let lifetime = tokens.lifetime.issue();
        Self {
            inner: Arc::new(ViewerInner {
                cache,
                directory,
                config,
                tokens,
                lifetime,
                state,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.inner.cache
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, ViewerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the base series. Cancels playback, prefetch, in-flight slice
    /// displays and overlay draws of the previous series.
    pub async fn select_series(&self, series: Option<SeriesRef>) -> Outcome<()> {
        let tokens = &self.inner.tokens;
        let token = tokens.series.issue();
        tokens.display.cancel();
        tokens.overlay_draw.cancel();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.prefetch = None;
            state.playback.is_playing = false;
            state.phase = if series.is_some() {
                ViewerPhase::Loading
            } else {
                ViewerPhase::Idle
            };
            state.series = series.clone();
            state.slices = SliceSet::default();
            state.index = 0;
            state.displayed = None;
            state.error = None;
            state.overlay_draw = None;
            let (width, height) = state.container;
            state.base.resize(width, height);
            state.overlay.resize(width, height);
        }
        let Some(series) = series else {
            return Outcome::Committed(());
        };

        let listing = self.inner.directory.list_instances(&series.id).await;
        if token.is_cancelled() {
            trace!("listing of series {} superseded", series.id);
            return Outcome::Stale;
        }
        let image_ids = {
            let mut state = self.lock();
            if let Some(err) = listing.error {
                state.error = Some(err.to_string());
                state.phase = ViewerPhase::Idle;
                return Outcome::Committed(());
            }
            if listing.slices.is_empty() {
                debug!("series {} has no instances", series.id);
                state.phase = ViewerPhase::Idle;
                return Outcome::Committed(());
            }
            state.slices = listing.slices;
            state.slices.image_ids(&self.inner.config.decoder_scheme)
        };

        if self.show_slice(0).await.is_stale() {
            trace!("first slice of series {} superseded", series.id);
        }
        if token.is_cancelled() {
            return Outcome::Stale;
        }

        let handle = PrefetchHandle::spawn(
            Arc::clone(&self.inner.cache),
            image_ids,
            1,
            self.inner.config.prefetch_batch_size,
            token,
        );
        let mut state = self.lock();
        if state.phase == ViewerPhase::Loading {
            // The first slice failed to decode; stay interactive for the rest
            state.phase = state.ready_phase();
        }
        state.prefetch = Some(handle);
        Outcome::Committed(())
    }

    /// Display the slice at `index`. Only the latest request commits.
    pub async fn show_slice(&self, index: usize) -> Outcome<()> {
        let token = self.inner.tokens.display.issue();
        let instance = {
            let mut state = self.lock();
            let Some(instance) = state.slices.get(index).cloned() else {
                return Outcome::Committed(());
            };
            state.index = index;
            instance
        };
        let image_id = instance.image_id(&self.inner.config.decoder_scheme);

        let decoded = self.inner.cache.decode(&image_id).await;
        if token.is_cancelled() {
            trace!("display of slice {index} superseded");
            return Outcome::Stale;
        }

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            match decoded {
                Ok(slice) => {
                    let voi = Voi::resolve(&instance, &slice);
                    let image = render_grayscale(&slice, &voi);
                    state
                        .viewport
                        .fit_contain(state.container, image.dimensions());
                    state.displayed = Some(DisplayedSlice {
                        instance,
                        voi,
                        image,
                    });
                    state.error = None;
                    state.paint_base();
                    if state.phase == ViewerPhase::Loading {
                        state.phase = state.ready_phase();
                    }
                }
                Err(err) => {
                    // Keep the previous slice on screen
                    state.error = Some(err.to_string());
                    return Outcome::Committed(());
                }
            }
        }

        self.redraw_overlay().await.map(|_| ())
    }

    pub async fn next_slice(&self) -> Outcome<()> {
        let (index, len) = self.position();
        if len == 0 {
            return Outcome::Committed(());
        }
        self.show_slice((index + 1).min(len - 1)).await
    }

    pub async fn previous_slice(&self) -> Outcome<()> {
        let (index, _) = self.position();
        self.show_slice(index.saturating_sub(1)).await
    }

    fn position(&self) -> (usize, usize) {
        let state = self.lock();
        (state.index, state.slices.len())
    }

    /// Replace the overlay series and rediscover its labels. Re-selecting the
    /// current overlay keeps user edits of the label table.
    pub async fn select_overlay(&self, series: Option<SeriesRef>) -> Outcome<usize> {
        let token = self.inner.tokens.overlay_series.issue();
        {
            let mut state = self.lock();
            if state.overlay_series != series {
                state.labels.clear();
            }
            state.overlay_series = series.clone();
            state.overlay_slices = SliceSet::default();
            state.overlay_index = OverlayIndex::default();
        }
        let Some(series) = series else {
            return self.redraw_overlay().await.map(|_| 0);
        };

        let listing = self.inner.directory.list_instances(&series.id).await;
        if token.is_cancelled() {
            return Outcome::Stale;
        }
        let slices = {
            let mut state = self.lock();
            if let Some(err) = listing.error {
                state.error = Some(err.to_string());
            }
            state.overlay_index = OverlayIndex::build(&listing.slices);
            state.overlay_slices = listing.slices.clone();
            listing.slices
        };
        let _ = self.redraw_overlay().await;

        let Outcome::Committed(values) =
            discover_labels(&self.inner.cache, &slices, &token, &self.inner.config).await
        else {
            return Outcome::Stale;
        };
        let added = {
            let mut state = self.lock();
            if token.is_cancelled() {
                return Outcome::Stale;
            }
            state
                .labels
                .merge_discovered(&values, &self.inner.config)
        };
        debug!("overlay {}: {} labels, {added} new", series.id, values.len());
        self.redraw_overlay().await.map(|_| values.len())
    }

    /// Redraw the overlay canvas for the displayed slice. Called after every
    /// slice, overlay, label or viewport change.
    pub async fn redraw_overlay(&self) -> Outcome<OverlayDraw> {
        let token = self.inner.tokens.overlay_draw.issue();
        let overlay_instance = {
            let state = self.lock();
            state.displayed.as_ref().and_then(|displayed| {
                state
                    .overlay_index
                    .lookup(displayed.instance.instance_number)
                    .cloned()
            })
        };

        let slice: Option<Arc<DecodedSlice>> = match overlay_instance {
            None => None,
            Some(instance) => {
                let image_id = instance.image_id(&self.inner.config.decoder_scheme);
                let decoded = self.inner.cache.decode(&image_id).await;
                if token.is_cancelled() {
                    trace!("overlay draw for {image_id} superseded");
                    return Outcome::Stale;
                }
                decoded
                    .inspect_err(|err| warn!("overlay slice unavailable: {err}"))
                    .ok()
            }
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let lut = LabelLut::from_table(&state.labels);
        let outcome = OverlayCompositor::draw(
            &mut state.overlay,
            state.container,
            slice.as_deref(),
            &lut,
            &state.viewport,
        );
        state.overlay_draw = Some(outcome);
        Outcome::Committed(outcome)
    }

    /// Repaint both layers after a viewport or label change.
    pub async fn redraw(&self) -> Outcome<OverlayDraw> {
        self.lock().paint_base();
        self.redraw_overlay().await
    }

    /// Apply a pan/zoom/rotate/flip interaction and keep the overlay in registration.
    pub async fn update_viewport(&self, interact: impl FnOnce(&mut ViewportState)) -> Outcome<OverlayDraw> {
        interact(&mut self.lock().viewport);
        self.redraw().await
    }

    /// Edit the label table; the overlay is redrawn when anything changed.
    pub async fn update_labels(&self, edit: impl FnOnce(&mut LabelTable) -> bool) -> Outcome<OverlayDraw> {
        let changed = edit(&mut self.lock().labels);
        if !changed {
            let state = self.lock();
            if let Some(draw) = state.overlay_draw {
                return Outcome::Committed(draw);
            }
        }
        self.redraw_overlay().await
    }

    pub async fn set_container_size(&self, width: u32, height: u32) -> Outcome<OverlayDraw> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.container = (width, height);
            if let Some(displayed) = &state.displayed {
                state
                    .viewport
                    .fit_contain(state.container, displayed.image.dimensions());
            }
        }
        self.redraw().await
    }

    pub fn play(&self) {
        let mut state = self.lock();
        state.playback.is_playing = true;
        if state.phase == ViewerPhase::Ready {
            state.phase = ViewerPhase::Playing;
        }
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        state.playback.is_playing = false;
        if state.phase == ViewerPhase::Playing {
            state.phase = ViewerPhase::Ready;
        }
    }

    pub fn toggle_play(&self) {
        let playing = self.lock().playback.is_playing;
        if playing {
            self.stop();
        } else {
            self.play();
        }
    }

    /// One playback step: advance (wrapping when looping) and display.
    pub async fn tick(&self) -> Outcome<()> {
        let next = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.playback.is_playing || state.slices.is_empty() {
                return Outcome::Committed(());
            }
            let next = state.playback.advance(state.index, state.slices.len());
            if !state.playback.is_playing && state.phase == ViewerPhase::Playing {
                state.phase = ViewerPhase::Ready;
            }
            next
        };
        self.show_slice(next).await
    }

    /// Drive playback until [`Viewer::shutdown`]. Spawn this next to the viewer.
    pub async fn run_playback(&self) {
        let lifetime = self.inner.lifetime.clone();
        let mut clock = PlaybackClock::new(self.lock().playback.interval);
        while lifetime.is_live() {
            clock.tick().await;
            if lifetime.is_cancelled() {
                break;
            }
            let _ = self.tick().await;
        }
    }

    /// Sync with the props of the surrounding application.
    pub async fn apply_props(&self, props: ViewerProps) {
        let previous = std::mem::replace(&mut self.lock().props, props.clone());

        let series_changed = previous.series != props.series;
        let overlay_changed = previous.overlay_series != props.overlay_series;
        let (_, _) = futures::join!(
            async {
                if series_changed {
                    self.select_series(props.series.clone()).await
                } else {
                    Outcome::Committed(())
                }
            },
            async {
                if overlay_changed {
                    self.select_overlay(props.overlay_series.clone()).await.map(|_| ())
                } else {
                    Outcome::Committed(())
                }
            }
        );

        if previous.playing != props.playing {
            if props.playing {
                self.play();
            } else {
                self.stop();
            }
        }
        if previous.reset_signal != props.reset_signal {
            let _ = self.show_slice(0).await;
        }
    }

    pub async fn handle(&self, event: ViewerEvent) -> Outcome<()> {
        match event {
            ViewerEvent::SeriesChanged(series) => self.select_series(series).await,
            ViewerEvent::OverlayChanged(series) => self.select_overlay(series).await.map(|_| ()),
            ViewerEvent::SliceChanged(index) => self.show_slice(index).await,
            ViewerEvent::LabelConfigChanged | ViewerEvent::ViewportChanged => {
                self.redraw().await.map(|_| ())
            }
        }
    }

    /// Stop all background work, e.g. when the viewer is unmounted.
    pub fn shutdown(&self) {
        let tokens = &self.inner.tokens;
        tokens.series.cancel();
        tokens.display.cancel();
        tokens.overlay_series.cancel();
        tokens.overlay_draw.cancel();
        tokens.lifetime.cancel();
        let mut state = self.lock();
        state.playback.is_playing = false;
        state.prefetch = None;
    }

    pub fn snapshot(&self) -> ViewerSnapshot {
        let state = self.lock();
        ViewerSnapshot {
            phase: state.phase,
            series: state.series.clone(),
            overlay_series: state.overlay_series.clone(),
            overlay_slice_count: state.overlay_slices.len(),
            slice_index: state.index,
            slice_count: state.slices.len(),
            current_instance: state.displayed.as_ref().map(|d| d.instance.clone()),
            voi: state.displayed.as_ref().map(|d| d.voi),
            error: state.error.clone(),
            progress: state.prefetch.as_ref().map(PrefetchHandle::progress),
            labels: state.labels.clone(),
            viewport: state.viewport,
            playback: state.playback,
            overlay_draw: state.overlay_draw,
            base: state.base.clone(),
            overlay: state.overlay.clone(),
        }
    }

    /// Subscribe to prefetch progress of the current series.
    pub fn prefetch_progress(&self) -> Option<tokio::sync::watch::Receiver<PrefetchProgress>> {
        self.lock().prefetch.as_ref().map(PrefetchHandle::subscribe)
    }

    /// Composite of base and overlay canvases.
    pub fn composite(&self) -> RgbaImage {
        let state = self.lock();
        let mut out = state.base.clone();
        let (width, height) = state.overlay.size();
        if out.size() == (width, height) {
            out.draw_image(state.overlay.image(), &Affine::IDENTITY);
        }
        out.image().clone()
    }
}
