use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use framix::{
    export::{ensure_parent_dir, still::StillFormat},
    export_animation, export_capture, export_still, load_project_assets, Compositor,
    ExportOptions, Project,
};

#[derive(Parser, Debug)]
#[command(name = "framix", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export one timeline position as a PNG or JPEG still.
    Still(StillArgs),
    /// Export one full loop as an animated GIF.
    Gif(GifArgs),
    /// Capture one full loop in real time to MP4/WebM (requires `ffmpeg` on PATH).
    Capture(CaptureArgs),
}

#[derive(Parser, Debug)]
struct StillArgs {
    /// Input project JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Timeline position in milliseconds.
    #[arg(long, default_value_t = 0.0)]
    time_ms: f64,

    /// Output path (.png or .jpg/.jpeg).
    #[arg(long)]
    out: PathBuf,

    /// Override the canvas width.
    #[arg(long)]
    width: Option<u32>,

    /// Override the canvas height.
    #[arg(long)]
    height: Option<u32>,

    /// JPEG quality, 1-100.
    #[arg(long)]
    quality: Option<u8>,

    /// Override background transparency (true keeps alpha, false flattens).
    #[arg(long)]
    transparent: Option<bool>,
}

#[derive(Parser, Debug)]
struct GifArgs {
    /// Input project JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output GIF path.
    #[arg(long)]
    out: PathBuf,

    /// Override the canvas width.
    #[arg(long)]
    width: Option<u32>,

    /// Override the canvas height.
    #[arg(long)]
    height: Option<u32>,

    /// Override the export frame rate.
    #[arg(long)]
    fps: Option<f64>,

    /// Override the loop duration in milliseconds.
    #[arg(long)]
    loop_ms: Option<f64>,

    /// Override background transparency (true keeps alpha, false flattens).
    #[arg(long)]
    transparent: Option<bool>,
}

#[derive(Parser, Debug)]
struct CaptureArgs {
    /// Input project JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output path; the extension follows the container (.mp4 opaque, .webm transparent).
    #[arg(long)]
    out: PathBuf,

    /// Override the canvas width.
    #[arg(long)]
    width: Option<u32>,

    /// Override the canvas height.
    #[arg(long)]
    height: Option<u32>,

    /// Override the capture frame rate.
    #[arg(long)]
    fps: Option<f64>,

    /// Override the loop duration in milliseconds.
    #[arg(long)]
    loop_ms: Option<f64>,

    /// Override background transparency (true targets WebM with alpha).
    #[arg(long)]
    transparent: Option<bool>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Still(args) => cmd_still(args),
        Command::Gif(args) => cmd_gif(args),
        Command::Capture(args) => cmd_capture(args),
    }
}

fn read_project_json(path: &Path) -> anyhow::Result<Project> {
    let f = File::open(path).with_context(|| format!("open project '{}'", path.display()))?;
    let r = BufReader::new(f);
    let project: Project = serde_json::from_reader(r).with_context(|| "parse project JSON")?;
    Ok(project)
}

fn assets_root(in_path: &Path) -> &Path {
    in_path.parent().unwrap_or_else(|| Path::new("."))
}

fn cmd_still(args: StillArgs) -> anyhow::Result<()> {
    let project = read_project_json(&args.in_path)?;
    project.validate()?;

    let assets = load_project_assets(&project, assets_root(&args.in_path))?;
    let mut compositor = Compositor::new();

    let options = ExportOptions {
        width: args.width,
        height: args.height,
        fps: None,
        quality: args.quality,
        transparent: args.transparent,
        loop_duration_ms: None,
    };
    let format = StillFormat::from_path(&args.out)?;
    let bytes = export_still(
        &project,
        &assets,
        &mut compositor,
        args.time_ms,
        format,
        &options,
        None,
    )?;
    ensure_parent_dir(&args.out)?;
    std::fs::write(&args.out, &bytes)
        .with_context(|| format!("write '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

fn cmd_gif(args: GifArgs) -> anyhow::Result<()> {
    let project = read_project_json(&args.in_path)?;
    project.validate()?;

    let assets = load_project_assets(&project, assets_root(&args.in_path))?;
    let mut compositor = Compositor::new();

    let options = ExportOptions {
        width: args.width,
        height: args.height,
        fps: args.fps,
        quality: None,
        transparent: args.transparent,
        loop_duration_ms: args.loop_ms,
    };
    let bytes = export_animation(&project, &assets, &mut compositor, &options, None)?;
    ensure_parent_dir(&args.out)?;
    std::fs::write(&args.out, &bytes)
        .with_context(|| format!("write '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

fn cmd_capture(args: CaptureArgs) -> anyhow::Result<()> {
    let project = read_project_json(&args.in_path)?;
    project.validate()?;

    let assets = load_project_assets(&project, assets_root(&args.in_path))?;
    let mut compositor = Compositor::new();

    let options = ExportOptions {
        width: args.width,
        height: args.height,
        fps: args.fps,
        quality: None,
        transparent: args.transparent,
        loop_duration_ms: args.loop_ms,
    };
    let written = export_capture(
        &project,
        &assets,
        &mut compositor,
        &args.out,
        &options,
        None,
    )?;

    eprintln!("wrote {}", written.display());
    Ok(())
}
