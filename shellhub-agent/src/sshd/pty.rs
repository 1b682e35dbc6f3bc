//! PTY allocation and process spawning for interactive sessions.

#![cfg(unix)]

use std::os::fd::{AsRawFd as _, OwnedFd};
use std::process::Stdio;

use anyhow::Context as _;

use crate::sshd::osauth::LocalUser;

#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

pub struct PtySession {
    pub child: tokio::process::Child,
    /// Master side, serving both directions of the session.
    pub master: tokio::fs::File,
    /// Kept to answer window-change requests.
    pub master_resize: OwnedFd,
    /// Slave device name ("pts/N"), recorded in utmpx.
    pub slave_name: Option<String>,
}

fn winsize(request: &PtyRequest) -> libc::winsize {
    libc::winsize {
        ws_row: request.row_height.min(u32::from(u16::MAX)) as u16,
        ws_col: request.col_width.min(u32::from(u16::MAX)) as u16,
        ws_xpixel: request.pix_width.min(u32::from(u16::MAX)) as u16,
        ws_ypixel: request.pix_height.min(u32::from(u16::MAX)) as u16,
    }
}

/// Allocates a pty and spawns the user's login shell on its slave side.
///
/// In multi-user mode the slave is chowned to the target account and the
/// child drops to its uid/gid.
pub fn spawn_shell(user: &LocalUser, request: &PtyRequest, change_owner: bool) -> anyhow::Result<PtySession> {
    let size = winsize(request);
    let pty = nix::pty::openpty(Some(&size), None).context("openpty failed")?;

    if change_owner {
        nix::unistd::fchown(
            pty.slave.as_raw_fd(),
            Some(nix::unistd::Uid::from_raw(user.uid)),
            Some(nix::unistd::Gid::from_raw(user.gid)),
        )
        .context("couldn't chown the pty slave")?;
    }

    let shell = login_shell(user);

    let mut command = tokio::process::Command::new(&shell);
    command
        .arg("-l")
        .env_clear()
        .env("TERM", &request.term)
        .env("HOME", &user.home)
        .env("USER", &user.name)
        .env("LOGNAME", &user.name)
        .env("SHELL", &shell)
        .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
        .current_dir(&user.home)
        .stdin(Stdio::from(pty.slave.try_clone().context("dup slave")?))
        .stdout(Stdio::from(pty.slave.try_clone().context("dup slave")?))
        .stderr(Stdio::from(pty.slave));

    if change_owner {
        command.uid(user.uid).gid(user.gid);
    }

    // SAFETY: only async-signal-safe calls are made between fork and exec.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            // Stdin is the pty slave at this point; adopt it as the
            // controlling terminal.
            libc::ioctl(0, libc::TIOCSCTTY as _, 0);
            Ok(())
        });
    }

    let child = command.spawn().context("couldn't spawn the login shell")?;

    let slave_name = slave_name_of(&pty.master);
    let master_resize = pty.master.try_clone().context("dup master")?;
    let master = tokio::fs::File::from_std(std::fs::File::from(pty.master));

    Ok(PtySession {
        child,
        master,
        master_resize,
        slave_name,
    })
}

fn slave_name_of(master: &OwnedFd) -> Option<String> {
    // SAFETY: ptsname is called on an open pty master; the returned static
    // buffer is copied out immediately.
    let name = unsafe {
        let ptr = libc::ptsname(master.as_raw_fd());
        if ptr.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };

    Some(name.strip_prefix("/dev/").unwrap_or(&name).to_owned())
}

pub fn resize(master: &OwnedFd, request: &PtyRequest) {
    let size = winsize(request);

    // SAFETY: TIOCSWINSZ reads a winsize struct from a valid pointer; the
    // fd is owned and open.
    unsafe {
        libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &size);
    }
}

pub fn login_shell(user: &LocalUser) -> std::path::PathBuf {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell.into();
        }
    }

    if user.shell.as_os_str().is_empty() {
        "/bin/sh".into()
    } else {
        user.shell.clone()
    }
}
