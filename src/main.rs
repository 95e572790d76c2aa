use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use render_graph_core::engine::Engine;
use render_graph_core::timeline::Timeline;

/// Offline video compositing engine: renders a declarative timeline to an H.264 MP4.
#[derive(Debug, Parser)]
#[command(name = "render-graph-core")]
struct Cli {
    /// Timeline JSON file to render. Reads stdin when omitted.
    #[arg(long)]
    input: Option<std::path::PathBuf>,

    /// Forces `isDebug` on regardless of what the timeline JSON carries.
    #[arg(long)]
    debug: bool,

    /// Raises the log level; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn read_timeline_json(cli: &Cli) -> Result<String> {
    match &cli.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading timeline input {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading timeline input from stdin")?;
            Ok(buf)
        }
    }
}

fn init_logging(cli: &Cli, timeline_is_debug: bool) {
    let level = match cli.verbose {
        0 if timeline_is_debug => log::LevelFilter::Debug,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init()
        .ok();
}

/// Creates a headless `wgpu` device/queue: the lowest-power adapter capable of rendering
/// off-screen, since this binary never presents to a window.
fn create_headless_gpu() -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    pollster::block_on(async {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("no wgpu adapter available")?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("render-graph-core headless device"),
                ..Default::default()
            })
            .await
            .context("failed to open wgpu device")?;
        Ok((Arc::new(device), Arc::new(queue)))
    })
}

fn run(cli: &Cli) -> Result<()> {
    let text = read_timeline_json(cli)?;
    let timeline = Timeline::from_str(&text).context("parsing timeline JSON")?;
    init_logging(cli, cli.debug || timeline.is_debug);

    let (device, queue) = create_headless_gpu()?;
    let mut engine = Engine::new(device, queue, timeline.width, timeline.height);
    engine.update_tracks(&timeline);
    engine.play(&timeline)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => {
            println!("{}", serde_json::json!({ "result": "处理成功" }));
        }
        Err(err) => {
            eprintln!(
                "{}",
                serde_json::json!({ "result": "error", "message": format!("{err:#}") })
            );
            std::process::exit(1);
        }
    }
}
