//! Spawns the instrumented target against the staged input.
//!
//! The child learns where to find everything through `TAINT_OPTIONS`: the
//! staged input file (or "stdin"), the label-table segment id, the raw fd of
//! the pipe write end, and the debug flag. The write end must survive exec,
//! so its close-on-exec flag is cleared in the child; the read end is closed
//! there so EOF tracks child exit.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use super::EngineOpts;

/// Argv slot substituted with the scratch-input path.
pub const INPUT_PLACEHOLDER: &str = "@@";

pub(crate) struct TargetChild {
    pub child: Child,
    pub pipe: File,
}

pub(crate) fn spawn_target(
    opts: &EngineOpts,
    scratch_path: &Path,
    shm_id: i32,
) -> io::Result<TargetChild> {
    let (pipe_rx, pipe_tx) = rustix::pipe::pipe()?;

    let taint_file = if opts.use_stdin {
        "stdin".to_owned()
    } else {
        scratch_path.display().to_string()
    };
    let taint_options = format!(
        "taint_file={taint_file}:shm_id={shm_id}:pipe_fd={}:debug={}",
        pipe_tx.as_raw_fd(),
        opts.debug as u8,
    );
    log::debug!("TAINT_OPTIONS={taint_options}");

    let mut cmd = Command::new(&opts.target);
    for arg in &opts.target_argv {
        if arg == INPUT_PLACEHOLDER {
            cmd.arg(scratch_path);
        } else {
            cmd.arg(arg);
        }
    }
    cmd.env("TAINT_OPTIONS", taint_options);

    if opts.use_stdin {
        cmd.stdin(File::open(scratch_path)?);
    } else {
        cmd.stdin(Stdio::null());
    }
    if !opts.debug {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
    }

    let rx_fd = pipe_rx.as_raw_fd();
    let tx_fd = pipe_tx.as_raw_fd();
    unsafe {
        // runs between fork and exec: only async-signal-safe calls
        cmd.pre_exec(move || {
            libc::close(rx_fd);
            let flags = libc::fcntl(tx_fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(tx_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(pipe_tx); // ours is the only read end; EOF now means child exit
    Ok(TargetChild {
        child,
        pipe: File::from(pipe_rx),
    })
}
