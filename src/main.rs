use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::{arg, command, ArgAction};
use fork::{fork, Fork};
use log::*;
use nix::sys::signal;

use razorfs::{ErrorKind, MountConfig, RazorFs};

/// Set by the SIGINT/SIGTERM handler; the run loop polls it rather than
/// unmounting directly from signal context.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(request_shutdown),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &action) {
            warn!("failed to install SIGINT handler: {e}");
        }
        if let Err(e) = signal::sigaction(signal::SIGTERM, &action) {
            warn!("failed to install SIGTERM handler: {e}");
        }
    }
}

/// Exit codes per the CLI contract: 0 clean unmount, 1 mount error, 2
/// recovery failed hard, 3 configuration error.
fn exit_code_for(err: &razorfs::FsError) -> i32 {
    match err.kind {
        ErrorKind::NeedsFsck => 2,
        _ => 1,
    }
}

fn run(data_dir: PathBuf, mountpoint: PathBuf, allow_other: bool) -> Result<()> {
    if allow_other {
        debug!("allow-other requested; the in-process adapter has no kernel-facing ACL to apply it to");
    }
    info!("mounting RazorFS at {mountpoint:?}, backed by {data_dir:?}");

    let cfg = MountConfig::new(data_dir);
    let fs = RazorFs::mount(cfg)?;

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        fs.fsync()?;
    }

    info!("shutdown requested; checkpointing and unmounting");
    fs.unmount()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = command!()
        .arg(arg!([mountpoint] "Mountpoint directory").default_value("tests/mnt"))
        .arg(arg!(--foreground "Stay in the foreground instead of forking a daemon").action(ArgAction::SetTrue))
        .arg(arg!(--"allow-other" "Allow other users to access the mount").action(ArgAction::SetTrue))
        .arg(arg!(--"data-dir" <PATH> "Backing data directory for the on-disk image").required(false).default_value("razorfs-data"))
        .get_matches();

    let mountpoint: PathBuf = matches.get_one::<String>("mountpoint").unwrap().into();
    let data_dir: PathBuf = matches.get_one::<String>("data-dir").unwrap().into();
    let foreground = matches.get_flag("foreground");
    let allow_other = matches.get_flag("allow-other");

    if !foreground {
        match fork() {
            Ok(Fork::Parent(child)) => {
                info!("razorfs daemon running at pid {child}");
                return Ok(());
            }
            Ok(Fork::Child) => {}
            Err(e) => {
                error!("fork failed: {e}");
                std::process::exit(3);
            }
        }
    }

    match run(data_dir, mountpoint, allow_other) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e:#}");
            let code = e
                .downcast_ref::<razorfs::FsError>()
                .map(exit_code_for)
                .unwrap_or(3);
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_needs_fsck_to_two() {
        let e = razorfs::FsError::needs_fsck("test");
        assert_eq!(exit_code_for(&e), 2);
    }

    #[test]
    fn exit_code_maps_other_kinds_to_one() {
        let e = razorfs::FsError::no_entry("test");
        assert_eq!(exit_code_for(&e), 1);
    }
}
