//! Prism interactive viewer.
//!
//! Renders a small demo scene with the raster pipeline on the background
//! frame loop, and path traces a still on demand.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! ## Controls
//!
//! - Right drag: orbit
//! - Wheel: zoom
//! - Left click: select (picks through the selection attachment)
//! - `R`: path trace a still with the configured settings
//! - `Space`: pause / resume the frame loop
//! - `Esc`: quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::{Viewer, ViewerOptions};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    prism_app::init_logging();
    let options = ViewerOptions::from_args(&args)?;
    tracing::info!("Prism viewer starting ({}x{})", options.width, options.height);

    let event_loop = EventLoop::new()?;
    // Frames are produced by the engine's own loop thread
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut viewer = Viewer::new(options);
    event_loop.run_app(&mut viewer)?;
    Ok(())
}

fn print_help() {
    eprintln!(
        "Prism Viewer

USAGE:
    cargo run -p prism-viewer -- [OPTIONS]

VIEWER OPTIONS:
    --environment <PATH>    Equirectangular HDR/EXR/PNG used as skybox and IBL
    --fps <N>               Frame rate cap, 0 for unlimited (default: 60)
    --no-vsync              Prefer mailbox/immediate presentation

PATH TRACING OPTIONS (used by the R key):
    --samples <N>           Samples per pixel (default: 64)
    --max-depth <N>         Maximum bounce count (default: 4)
    --width <N>             Still width (default: 1024)
    --height <N>            Still height (default: 1024)
    -o, --output <PATH>     Output file; .hdr selects Radiance HDR
    --format <png|hdr>      Output encoding

OTHER:
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
