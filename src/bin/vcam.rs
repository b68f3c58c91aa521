//! Feed a video file to a v4l2loopback virtual camera through ffmpeg.
//!
//! Pure process orchestration; shares no state with the filesystem engine.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "vcam", version, about)]
struct Args {
    /// Video file, or a directory to pick from with --index.
    input: PathBuf,

    /// Entry to play when input is a directory (sorted order).
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// v4l2loopback device node.
    #[arg(long, default_value = "/dev/video10")]
    device: String,

    /// Output pixel format.
    #[arg(long, default_value = "yuyv422")]
    pixel_format: String,

    /// List candidate videos in the input directory and exit.
    #[arg(long)]
    list: bool,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "m4v"];

/// Prefer a user-local ffmpeg build, fall back to whatever is on PATH.
fn find_tool(name: &str) -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let local = Path::new(&home).join("ffmpeg/bin").join(name);
        if local.exists() {
            return local.to_string_lossy().into_owned();
        }
    }
    name.to_string()
}

fn tool_works(tool: &str) -> bool {
    Command::new(tool)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn scan_videos(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut videos: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .collect();
    videos.sort();
    Ok(videos)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if !cfg!(target_os = "linux") {
        eprintln!("vcam requires Linux (v4l2loopback)");
        std::process::exit(2);
    }

    let ffmpeg = find_tool("ffmpeg");
    if !tool_works(&ffmpeg) {
        eprintln!("ffmpeg not found; install it or place a build under ~/ffmpeg/bin");
        std::process::exit(2);
    }

    let input = if args.input.is_dir() {
        let videos = match scan_videos(&args.input) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("scan of {} failed: {e}", args.input.display());
                std::process::exit(1);
            }
        };
        if args.list || videos.is_empty() {
            for (i, v) in videos.iter().enumerate() {
                println!("{i:3}  {}", v.display());
            }
            if videos.is_empty() {
                eprintln!("no video files in {}", args.input.display());
                std::process::exit(1);
            }
            return;
        }
        match videos.get(args.index) {
            Some(v) => v.clone(),
            None => {
                eprintln!("--index {} out of range ({} videos)", args.index, videos.len());
                std::process::exit(1);
            }
        }
    } else {
        args.input.clone()
    };

    if !Path::new(&args.device).exists() {
        warn!("{} missing; trying to load v4l2loopback", args.device);
        let status = Command::new("sudo")
            .args(["modprobe", "v4l2loopback", "video_nr=10", "card_label=vcam", "exclusive_caps=1"])
            .status();
        if !status.is_ok_and(|s| s.success()) || !Path::new(&args.device).exists() {
            eprintln!("{} unavailable; load v4l2loopback manually", args.device);
            std::process::exit(1);
        }
    }

    info!("feeding {} to {} (loop, Ctrl+C stops)", input.display(), args.device);
    let status = Command::new(&ffmpeg)
        .args(["-re", "-stream_loop", "-1", "-i"])
        .arg(&input)
        .args(["-f", "v4l2", "-pix_fmt", &args.pixel_format])
        .arg(&args.device)
        .status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            eprintln!("ffmpeg exited with {s}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("failed to run ffmpeg: {e}");
            std::process::exit(1);
        }
    }
}
