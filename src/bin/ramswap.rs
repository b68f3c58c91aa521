//! Provision a sparse loop-device swap file and tear it down on exit.
//!
//! The image is sparse: the kernel sees a huge swap device while physical
//! pages are only committed as they are actually used. Pure process
//! orchestration; shares no state with the filesystem engine.

use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ramswap", version, about)]
struct Args {
    /// Virtual size of the swap image in GiB.
    #[arg(long, default_value_t = 64)]
    size_gb: u64,

    /// Backing image path.
    #[arg(long, default_value = "ramswap.img")]
    image: PathBuf,

    /// Swap priority passed to swapon.
    #[arg(long, default_value_t = 32767)]
    priority: i32,
}

fn run(cmd: &mut Command) -> std::io::Result<String> {
    let out = cmd.stderr(Stdio::inherit()).output()?;
    if !out.status.success() {
        return Err(std::io::Error::other(format!(
            "{cmd:?} exited with {}",
            out.status
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn teardown(image: &PathBuf, loop_dev: Option<&str>) {
    info!("tearing down");
    // Without a recorded device, find it by backing file.
    let dev = match loop_dev {
        Some(d) => Some(d.to_string()),
        None => Command::new("losetup")
            .args(["-j"])
            .arg(image)
            .output()
            .ok()
            .and_then(|o| {
                let text = String::from_utf8_lossy(&o.stdout).into_owned();
                text.split(':').next().map(str::to_string).filter(|s| !s.is_empty())
            }),
    };
    if let Some(dev) = dev {
        if let Err(e) = run(Command::new("sudo").args(["swapoff", &dev])) {
            warn!("swapoff {dev}: {e}");
        }
        if let Err(e) = run(Command::new("sudo").args(["losetup", "-d", &dev])) {
            warn!("losetup -d {dev}: {e}");
        }
    }
    if image.exists() {
        if let Err(e) = std::fs::remove_file(image) {
            warn!("remove {}: {e}", image.display());
        }
    }
}

fn provision(args: &Args) -> std::io::Result<String> {
    let file = std::fs::File::create(&args.image)?;
    file.set_len(args.size_gb * (1 << 30))?;
    std::fs::set_permissions(&args.image, std::fs::Permissions::from_mode(0o600))?;

    let loop_dev = run(Command::new("sudo")
        .args(["losetup", "-f", "--show"])
        .arg(&args.image))?;
    run(Command::new("sudo").args(["mkswap", &loop_dev]))?;
    run(Command::new("sudo").args(["swapon", "-p", &args.priority.to_string(), &loop_dev]))?;
    Ok(loop_dev)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if !cfg!(target_os = "linux") {
        eprintln!("ramswap requires Linux (loop devices and swap)");
        std::process::exit(2);
    }

    info!(
        "provisioning {} GiB sparse swap at {}",
        args.size_gb,
        args.image.display()
    );
    let loop_dev = match provision(&args) {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("provisioning failed: {e}");
            teardown(&args.image, None);
            std::process::exit(1);
        }
    };

    info!("swap active on {loop_dev} (priority {})", args.priority);
    println!("press Enter to deactivate and remove the swap image");
    let _ = std::io::stdin().read(&mut [0u8; 1]);

    teardown(&args.image, Some(&loop_dev));
}
