//! Startup and the tick loop driving capture and stylization.
//!
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    sync::{watch, OnceCell, Semaphore},
    time::{interval, timeout, MissedTickBehavior},
};

use crate::{
    capture::{FrameSnapshot, LatestFrame},
    config::PipelineConfig,
    meter::METER,
    nn::StyleModels,
    render::{Placeholder, RenderTarget},
    resources::ResourceLoader,
    selection::{StyleGallery, StyleSelection},
    style::{StyleEncoder, StyleSlot},
    stylize::Stylizer,
};

/// Number of ticks whose stylization time gets logged.
const LOGGED_TICKS: u64 = 10;

/// Lifecycle of the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverState {
    Uninitialized,
    LoadingResources,
    Ready,
    Running,
    Failed(String),
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::LoadingResources => write!(f, "loading_resources"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Failed(_) => write!(f, "failed"),
        }
    }
}

/// When the pipeline counts as focused. Ticks without focus are skipped.
#[derive(Debug)]
pub enum FocusPolicy {
    /// Focused while at least one viewer watches the stream.
    Viewers,
    Always,
    /// Focus is switched with [`AppState::set_focus`].
    Manual(AtomicBool),
}

impl FocusPolicy {
    pub fn manual(focused: bool) -> Self {
        Self::Manual(AtomicBool::new(focused))
    }
}

/// State shared between the driver, the data socket and the HTTP endpoints.
pub struct AppState {
    state: watch::Sender<DriverState>,
    pub frames: LatestFrame,
    pub style: Arc<StyleSlot>,
    pub render: RenderTarget,
    selection: OnceCell<Arc<StyleSelection>>,
    focus: FocusPolicy,
}

impl AppState {
    pub fn new((width, height): (u32, u32), focus: FocusPolicy) -> Self {
        let (state, _) = watch::channel(DriverState::Uninitialized);
        Self {
            state,
            frames: LatestFrame::new(),
            style: Arc::new(StyleSlot::new()),
            render: RenderTarget::new(width, height),
            selection: OnceCell::new(),
            focus,
        }
    }

    pub fn driver_state(&self) -> DriverState {
        self.state.borrow().clone()
    }

    fn set_driver_state(&self, state: DriverState) {
        log::info!("Pipeline is {state}");
        self.state.send_replace(state);
    }

    pub fn has_focus(&self) -> bool {
        match &self.focus {
            FocusPolicy::Viewers => self.render.viewer_count() > 0,
            FocusPolicy::Always => true,
            FocusPolicy::Manual(focused) => focused.load(Ordering::Relaxed),
        }
    }

    /// Switch a manual focus, returns `false` for the other policies.
    pub fn set_focus(&self, focused: bool) -> bool {
        match &self.focus {
            FocusPolicy::Manual(flag) => {
                flag.store(focused, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Style selection, available once the pipeline is ready.
    pub fn selection(&self) -> Option<&Arc<StyleSelection>> {
        self.selection.get()
    }
}

/// Loaded pipeline: stylizes frames with the current style.
#[derive(Clone)]
pub struct Pipeline {
    app: Arc<AppState>,
    stylizer: Stylizer,
}

impl Pipeline {
    pub fn new(app: Arc<AppState>, stylizer: Stylizer) -> Self {
        Self { app, stylizer }
    }

    /// Stylize `frame` with the latest style and render the result.
    ///
    /// Returns `false` without touching the render target if there is no
    /// usable frame or no complete style representation, or if a later tick
    /// rendered first.
    pub async fn stylize_and_render(&self, seq: u64, frame: Option<FrameSnapshot>) -> Result<bool> {
        let Some(style) = self.app.style.current() else {
            log::debug!("Tick {seq}: style is being refreshed");
            return Ok(false);
        };

        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            match pipeline.stylizer.stylize(frame.as_ref(), &style)? {
                Some(image) => pipeline.app.render.present(seq, &image),
                None => Ok(false),
            }
        })
        .await?
    }
}

/// Drives the pipeline from startup through the endless tick loop.
pub struct Driver {
    app: Arc<AppState>,
    config: PipelineConfig,
    loader: ResourceLoader,
    gallery: StyleGallery,
}

impl Driver {
    pub fn new(
        app: Arc<AppState>,
        config: PipelineConfig,
        loader: ResourceLoader,
        gallery: StyleGallery,
    ) -> Self {
        Self {
            app,
            config,
            loader,
            gallery,
        }
    }

    /// Load resources, then tick forever.
    ///
    /// Only returns on a startup failure, which also leaves the pipeline in
    /// [`DriverState::Failed`].
    pub async fn run<F>(self, models: F) -> Result<()>
    where
        F: Future<Output = Result<StyleModels>>,
    {
        if let Err(err) = self.config.validate() {
            return Err(self.fail(err.context("invalid pipeline configuration")));
        }

        self.app.set_driver_state(DriverState::LoadingResources);
        self.app.render.show_placeholder(Placeholder::Loading)?;

        let pipeline = match timeout(self.config.startup_timeout, self.initialize(models)).await {
            Ok(Ok(pipeline)) => pipeline,
            Ok(Err(err)) => return Err(self.fail(err)),
            Err(_) => {
                return Err(self.fail(anyhow!(
                    "resources not loaded within {:?}",
                    self.config.startup_timeout
                )))
            }
        };
        self.app.set_driver_state(DriverState::Ready);

        self.tick_loop(pipeline).await
    }

    async fn initialize<F>(&self, models: F) -> Result<Pipeline>
    where
        F: Future<Output = Result<StyleModels>>,
    {
        let start = Instant::now();
        let models = models.await.context("failed to load models")?;
        log::info!("Models loaded in {:.2} seconds", start.elapsed().as_secs_f32());

        let encoder = StyleEncoder::new(models.prediction, self.config.style_size);
        let selection = Arc::new(StyleSelection::new(
            self.gallery.clone(),
            self.loader.clone(),
            encoder,
            Arc::clone(&self.app.style),
        ));
        selection.activate_initial().await?;
        if self.app.selection.set(selection).is_err() {
            bail!("pipeline was already initialized");
        }

        let stylizer = Stylizer::new(models.transfer, self.config.render_size);
        Ok(Pipeline::new(Arc::clone(&self.app), stylizer))
    }

    fn fail(&self, err: anyhow::Error) -> anyhow::Error {
        log::error!("Startup failed: {err:#}");
        self.app
            .set_driver_state(DriverState::Failed(format!("{err:#}")));
        if let Err(e) = self.app.render.show_placeholder(Placeholder::Failed) {
            log::warn!("Could not draw failure placeholder: {e}");
        }

        err
    }

    async fn tick_loop(&self, pipeline: Pipeline) -> Result<()> {
        let mut ticks = interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let in_flight = self
            .config
            .max_in_flight
            .map(|permits| Arc::new(Semaphore::new(permits.min(Semaphore::MAX_PERMITS))));
        let mut seq = 0;

        self.app.set_driver_state(DriverState::Running);

        loop {
            ticks.tick().await;

            if !self.app.has_focus() {
                METER.tick_skipped();
                continue;
            }
            let Some(frame) = self.app.frames.capture() else {
                log::debug!("No camera frame yet");
                continue;
            };
            let permit = match &in_flight {
                Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        log::debug!("Previous stylization still running, skipping tick");
                        METER.tick_skipped();
                        continue;
                    }
                },
                None => None,
            };

            seq += 1;
            let captured_at = frame.captured_at;
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let start = Instant::now();

                match pipeline.stylize_and_render(seq, Some(frame)).await {
                    Ok(true) => {
                        METER.tick_stylized();
                        if seq <= LOGGED_TICKS {
                            log::info!(
                                "Generated stylized image in {} milliseconds, frame age {} milliseconds",
                                start.elapsed().as_millis(),
                                captured_at.elapsed().as_millis()
                            );
                        }
                    }
                    Ok(false) => log::debug!("Tick {seq} rendered nothing"),
                    Err(e) => log::warn!("Stylization of tick {seq} failed: {e:#}"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use image::{Rgb, RgbImage};
    use tract_onnx::prelude::{tract_ndarray, TVec, Tensor};

    use super::*;
    use crate::{style::StyleRepresentation, utils::encode_jpeg};

    fn pipeline(app: &Arc<AppState>) -> Pipeline {
        let model = Arc::new(|inputs: TVec<Tensor>| -> Result<Tensor> {
            let content = inputs[0].to_array_view::<f32>()?;
            let copy: Tensor = content.to_owned().into();
            Ok(copy)
        });

        Pipeline::new(Arc::clone(app), Stylizer::new(model, (16, 12)))
    }

    fn frame(app: &AppState) -> Option<FrameSnapshot> {
        let image = RgbImage::from_pixel(16, 12, Rgb([90, 90, 90]));
        app.frames.publish(encode_jpeg(&image, 90).ok()?);
        app.frames.capture()
    }

    fn install_style(app: &AppState) {
        let generation = app.style.begin();
        let tensor = tract_ndarray::Array4::<f32>::zeros((1, 1, 1, 100));
        app.style
            .complete(generation, StyleRepresentation::new(tensor.into()));
    }

    #[tokio::test]
    async fn tick_renders_with_a_complete_style() -> Result<()> {
        let app = Arc::new(AppState::new((16, 12), FocusPolicy::Always));
        install_style(&app);

        assert!(pipeline(&app).stylize_and_render(1, frame(&app)).await?);
        assert_eq!(app.render.rendered_count(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn tick_during_style_refresh_renders_nothing() -> Result<()> {
        let app = Arc::new(AppState::new((16, 12), FocusPolicy::Always));
        install_style(&app);
        app.style.begin();

        assert!(!pipeline(&app).stylize_and_render(1, frame(&app)).await?);
        assert_eq!(app.render.rendered_count(), 0);
        assert!(app.render.latest_jpeg().is_none());

        Ok(())
    }

    #[tokio::test]
    async fn tick_without_frame_renders_nothing() -> Result<()> {
        let app = Arc::new(AppState::new((16, 12), FocusPolicy::Always));
        install_style(&app);

        assert!(!pipeline(&app).stylize_and_render(1, None).await?);
        assert_eq!(app.render.rendered_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn invalid_config_fails_before_loading() {
        let app = Arc::new(AppState::new((16, 12), FocusPolicy::Always));
        let config = PipelineConfig {
            max_in_flight: Some(0),
            ..Default::default()
        };
        let gallery = StyleGallery::new(vec!["styles/none.jpg".into()]).unwrap();
        let driver = Driver::new(
            Arc::clone(&app),
            config,
            ResourceLoader::new(std::env::temp_dir()),
            gallery,
        );

        let models = async { Err::<StyleModels, _>(anyhow!("never loaded")) };
        let err = driver.run(models).await.unwrap_err();

        assert!(format!("{err:#}").contains("at least one stylization"));
        assert!(matches!(app.driver_state(), DriverState::Failed(_)));
    }
}
