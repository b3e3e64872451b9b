//! Style server binary.
//!
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use env_logger::TimestampPrecision;
use style_server::{
    config::PipelineConfig,
    data_socket::spawn_data_socket,
    driver::{AppState, Driver, FocusPolicy},
    endpoints::router,
    meter::spawn_meter_logger,
    resources::{ModelSpec, ResourceLoader, ResourceLocation},
    selection::StyleGallery,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FocusArg {
    /// Stylize only while somebody watches the stream
    Viewers,
    /// Stylize all the time
    Always,
}

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Address to receive camera frames on
    #[clap(long, default_value = "127.0.0.1:3001")]
    socket_address: String,

    /// Path or URL of the style prediction graph
    #[clap(long, default_value = "models/style-prediction/model.onnx")]
    prediction_model: String,

    /// Weight files of the style prediction graph
    #[clap(long)]
    prediction_weights: Vec<String>,

    /// Path or URL of the style transfer graph
    #[clap(long, default_value = "models/style-transfer/model.onnx")]
    transfer_model: String,

    /// Weight files of the style transfer graph
    #[clap(long)]
    transfer_weights: Vec<String>,

    /// Style images to cycle through, the first one is active at startup
    #[clap(
        long = "style",
        default_values = ["styles/guernica.jpg", "styles/starry_night.jpg", "styles/chai.jpg"]
    )]
    styles: Vec<String>,

    /// Capture period in milliseconds
    #[clap(long, default_value_t = 400, value_parser = clap::value_parser!(u64).range(1..))]
    tick_ms: u64,

    #[clap(long, default_value_t = 300, value_parser = clap::value_parser!(u32).range(1..))]
    render_width: u32,

    #[clap(long, default_value_t = 225, value_parser = clap::value_parser!(u32).range(1..))]
    render_height: u32,

    /// Side length style images are resized to, 0 keeps their size
    #[clap(long, default_value_t = 256)]
    style_size: u32,

    /// Concurrent stylizations, 0 for no limit
    #[clap(long, default_value_t = 1)]
    max_in_flight: usize,

    #[clap(long, default_value_t = 120)]
    startup_timeout_secs: u64,

    #[clap(long, value_enum, default_value_t = FocusArg::Viewers)]
    focus: FocusArg,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            tick_interval: Duration::from_millis(self.tick_ms),
            render_size: (self.render_width, self.render_height),
            style_size: (self.style_size > 0).then_some((self.style_size, self.style_size)),
            max_in_flight: (self.max_in_flight > 0).then_some(self.max_in_flight),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
        }
    }

    fn model_specs(&self, config: &PipelineConfig) -> (ModelSpec, ModelSpec) {
        let prediction = ModelSpec {
            name: "style-prediction".to_owned(),
            graph: self.prediction_model.as_str().into(),
            weights: locations(&self.prediction_weights),
            input_shape: config
                .style_size
                .map(|(w, h)| vec![1, h as usize, w as usize, 3]),
        };

        let (width, height) = config.render_size;
        let transfer = ModelSpec {
            name: "style-transfer".to_owned(),
            graph: self.transfer_model.as_str().into(),
            weights: locations(&self.transfer_weights),
            input_shape: Some(vec![1, height as usize, width as usize, 3]),
        };

        (prediction, transfer)
    }
}

fn locations(entries: &[String]) -> Vec<ResourceLocation> {
    entries.iter().map(|entry| entry.as_str().into()).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let config = args.pipeline_config();
    let (prediction, transfer) = args.model_specs(&config);
    let gallery = StyleGallery::new(locations(&args.styles))?;
    let focus = match args.focus {
        FocusArg::Viewers => FocusPolicy::Viewers,
        FocusArg::Always => FocusPolicy::Always,
    };

    let app = Arc::new(AppState::new(config.render_size, focus));
    let loader = ResourceLoader::with_default_cache();

    // Create socket to receive image streams via network
    spawn_data_socket(Arc::clone(&app), &args.socket_address).await?;

    spawn_meter_logger();

    {
        let driver = Driver::new(Arc::clone(&app), config, loader.clone(), gallery);
        tokio::spawn(async move {
            let models = async { loader.load_models(&prediction, &transfer).await };
            // Failures are reported through the driver state, HTTP keeps serving
            let _ = driver.run(models).await;
        });
    }

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(router(app).into_make_service())
        .await?;

    Ok(())
}
