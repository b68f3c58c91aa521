use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use mirrorfs::engine::{MirrorConfig, MirrorEngine};
use mirrorfs::fuse::MirrorFs;
use mirrorfs::fuse::mount::mount_unprivileged;
use mirrorfs::pool::CompressionPolicy;
use mirrorfs::prefetch::PrefetchConfig;

/// Mirror a source directory through a read-only FUSE mount with a RAM
/// cache and a virtual overlay sandbox.
#[derive(Parser, Debug)]
#[command(name = "mirrorfs", version, about)]
struct Args {
    /// Physical source directory (never modified).
    source: PathBuf,

    /// Empty directory to mount the mirror on.
    mount_point: PathBuf,

    /// Cache pool capacity in GiB.
    #[arg(long, default_value_t = 4.0)]
    pool_gb: f64,

    /// Store all cache entries raw, skipping the compression probe.
    #[arg(long)]
    no_compress: bool,

    /// Bytes sampled from the head of a file to decide compressibility.
    #[arg(long, default_value_t = 1024 * 1024)]
    sample_bytes: usize,

    /// Compress only when the sampled probe shrinks below this ratio.
    #[arg(long, default_value_t = 0.90)]
    compress_ratio: f64,

    /// Files queued for warming when a directory is first entered (5-15).
    #[arg(long, default_value_t = 5)]
    scan_width: usize,

    /// Background fetch workers.
    #[arg(long, default_value_t = 4)]
    prefetch_workers: usize,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if !args.source.is_dir() {
        error!("source {} is not a directory", args.source.display());
        std::process::exit(2);
    }
    if let Err(e) = std::fs::create_dir_all(&args.mount_point) {
        error!("create mount point failed: {e}");
        std::process::exit(1);
    }

    let mut cfg = MirrorConfig::new(&args.source);
    cfg.capacity = (args.pool_gb * (1u64 << 30) as f64) as u64;
    cfg.compression = CompressionPolicy {
        enabled: !args.no_compress,
        sample_len: args.sample_bytes,
        max_sample_ratio: args.compress_ratio,
    };
    cfg.prefetch = PrefetchConfig {
        scan_width: args.scan_width.clamp(5, 15),
        workers: args.prefetch_workers,
        ..PrefetchConfig::default()
    };

    info!(
        "mounting mirror of {} at {} (pool {:.1} GiB, compression {})",
        args.source.display(),
        args.mount_point.display(),
        args.pool_gb,
        if args.no_compress { "off" } else { "on" }
    );

    let fs = MirrorFs::new(MirrorEngine::new(cfg));
    let handle = match mount_unprivileged(fs, &args.mount_point).await {
        Ok(h) => h,
        Err(e) => {
            error!("mount failed: {e} (is fusermount3 available?)");
            std::process::exit(1);
        }
    };

    info!("mounted; press Ctrl+C to unmount");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal error: {e}");
    }

    info!("unmounting");
    if let Err(e) = handle.unmount().await {
        error!("unmount error: {e}");
    }
}
