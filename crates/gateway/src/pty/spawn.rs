// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::ExitStatus;

/// Newtype wrapper around the PTY master fd for use with [`AsyncFd`].
#[derive(Debug)]
struct MasterFd(OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for MasterFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A child process attached to a freshly-allocated pseudo-terminal.
///
/// The child is its own session leader (courtesy of `forkpty`), so group
/// signals reach any helper processes it spawns.
pub struct PtyChild {
    master: AsyncFd<MasterFd>,
    child_pid: Pid,
}

impl PtyChild {
    /// Spawn `command` on a new PTY with the given geometry, working
    /// directory, and extra environment variables.
    ///
    /// `command` must have at least one element (the program to run).
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        command: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
        env: &[(String, String)],
    ) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("empty command");
        }

        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We only touch env/cwd
        // and then exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("COLORTERM", "truecolor");
                std::env::set_var("PADDOCK", "1");
                for (key, value) in env {
                    std::env::set_var(key, value);
                }
                if std::env::set_current_dir(cwd).is_err() {
                    // Missing cwd is survivable; the agent reports its own
                    // working directory errors.
                    let _ = std::env::set_current_dir("/");
                }

                let c_args: Vec<CString> = match command
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                {
                    Ok(args) => args,
                    Err(_) => std::process::exit(126),
                };

                // On exec failure the child must die, not unwind back into
                // the parent's code.
                let _ = execvp(&c_args[0], &c_args);
                std::process::exit(127);
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let master = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master, child_pid: child })
            }
        }
    }

    /// PID of the child process (also its process group id).
    pub fn pid(&self) -> Pid {
        self.child_pid
    }

    /// Drive PTY I/O until the child exits.
    ///
    /// Output chunks are sent to `output_tx`; stdin bytes arrive on
    /// `input_rx`; geometry changes arrive on `resize_rx` and are applied
    /// on this task so the master fd has a single owner.
    pub async fn run(
        self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];
        let mut input_open = true;

        loop {
            tokio::select! {
                result = read_chunk(&self.master, &mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        // EIO on the master means the slave side is gone.
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                input = input_rx.recv(), if input_open => {
                    match input {
                        Some(data) => write_all(&self.master, &data).await?,
                        None => input_open = false,
                    }
                }
                resize = resize_rx.recv() => {
                    if let Some((cols, rows)) = resize {
                        if let Err(e) = self.set_winsize(cols, rows) {
                            tracing::warn!(err = %e, "resize ioctl failed");
                        }
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid stalling the runtime.
        let status = tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")??;
        Ok(status)
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    fn set_winsize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is properly
        // initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Block until the child exits and convert to our [`ExitStatus`].
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            // Already reaped elsewhere (shouldn't happen, but don't spin).
            Err(nix::errno::Errno::ECHILD) => {
                return Ok(ExitStatus { code: None, signal: None });
            }
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

/// Set the given file descriptor to non-blocking mode.
fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

/// Read a chunk of data from the async master fd.
async fn read_chunk(afd: &AsyncFd<MasterFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| nix::unistd::read(inner, buf).map_err(io_err)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Write all data to the async master fd.
async fn write_all(afd: &AsyncFd<MasterFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| nix::unistd::write(inner, &data[offset..]).map_err(io_err)) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
