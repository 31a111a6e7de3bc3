use anyhow::Result;

use visibility_cam::{cli, engine, engine::telemetry};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = cli::RunOptions::from_args(&args)?;

    let _telemetry_guard = telemetry::enter_runtime();
    telemetry::init_metrics_recorder();

    let config = options.load_config()?;
    if options.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    serve(config)
}

#[cfg(feature = "opencv-backend")]
fn serve(config: engine::config::CameraConfig) -> Result<()> {
    use std::sync::{atomic::Ordering, Arc};

    use anyhow::Context;
    use video_source::{OpenCvSource, VideoSource};

    use visibility_cam::engine::capture::CaptureController;

    let factory: engine::capture::SourceFactory = Arc::new(|uri, options| {
        OpenCvSource::open(uri, options).map(|source| Box::new(source) as Box<dyn VideoSource>)
    });
    let controller = Arc::new(CaptureController::new(config, factory)?);

    let shutdown = controller.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let result = controller.run();
    controller.shutdown();
    result
}

#[cfg(not(feature = "opencv-backend"))]
fn serve(_config: engine::config::CameraConfig) -> Result<()> {
    anyhow::bail!(
        "this build has no video backend; rebuild with `--features opencv-backend` to open streams"
    )
}
