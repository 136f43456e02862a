//! Child launcher
//!
//! Allocates a pty, forks, and execs the requested program with the slave
//! as its controlling terminal. Everything the child needs is prepared
//! before `fork` so the child only makes async-signal-safe libc calls.
//!
//! Exec failure is reported back through a close-on-exec pipe: the child
//! writes its `errno` there and exits, while a successful exec closes the
//! pipe and the parent reads end-of-stream.

use crate::daemon::protocol::LaunchRequest;
use crate::error::LaunchError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ttyname, ForkResult, Pid};
use std::ffi::{CString, NulError};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::ptr;

/// Upper bound on descriptors closed in the child
const MAX_CLOSE_FD: RawFd = 65536;

/// Status a child exits with when exec fails
const EXEC_FAILED_STATUS: i32 = 127;

/// Launcher settings that do not come from the client
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// `TERM` value added when the request's environment has none
    pub default_term: Option<String>,
}

/// A freshly started child
#[derive(Debug)]
pub struct LaunchedChild {
    pub pid: Pid,
    pub master: OwnedFd,
    /// Slave device path
    pub tty: String,
}

/// C-string views of a request, built before forking
struct PreparedExec {
    path: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    pwd: Option<CString>,
}

impl PreparedExec {
    fn new(request: &LaunchRequest, options: &LaunchOptions) -> Result<Self, LaunchError> {
        if request.path.is_empty() {
            return Err(LaunchError::InvalidArgument("empty path".to_string()));
        }
        let path = CString::new(request.path.as_str()).map_err(invalid("path"))?;

        let argv = if request.argv.is_empty() {
            vec![path.clone()]
        } else {
            request
                .argv
                .iter()
                .map(|arg| CString::new(arg.as_str()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(invalid("argv"))?
        };

        let envp = environment(&request.envp, options)
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid("envp"))?;

        let pwd = if request.pwd.is_empty() {
            None
        } else {
            Some(CString::new(request.pwd.as_str()).map_err(invalid("pwd"))?)
        };

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            pwd,
        })
    }
}

fn invalid(what: &'static str) -> impl Fn(NulError) -> LaunchError {
    move |_| LaunchError::InvalidArgument(format!("{} contains a NUL byte", what))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// The request's environment, plus `TERM` when it is missing
fn environment(envp: &[String], options: &LaunchOptions) -> Vec<String> {
    let mut env = envp.to_vec();
    if let Some(term) = &options.default_term {
        if !env.iter().any(|entry| entry.starts_with("TERM=")) {
            env.push(format!("TERM={}", term));
        }
    }
    env
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_utf8(slave: &OwnedFd) -> nix::Result<()> {
    use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};

    let mut termios = tcgetattr(slave)?;
    termios.input_flags.insert(InputFlags::IUTF8);
    tcsetattr(slave, SetArg::TCSANOW, &termios)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_utf8(_slave: &OwnedFd) -> nix::Result<()> {
    Ok(())
}

fn max_fd() -> RawFd {
    // SAFETY: sysconf has no memory-safety preconditions
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        MAX_CLOSE_FD
    } else {
        (limit as RawFd).min(MAX_CLOSE_FD)
    }
}

/// Start `request` on a new pty
pub fn launch(request: &LaunchRequest, options: &LaunchOptions) -> Result<LaunchedChild, LaunchError> {
    let exec = PreparedExec::new(request, options)?;

    let winsize = Winsize {
        ws_row: request.rows,
        ws_col: request.columns,
        ws_xpixel: request.pixel_width,
        ws_ypixel: request.pixel_height,
    };
    let pty = openpty(Some(&winsize), None).map_err(LaunchError::Pty)?;
    set_cloexec(pty.master.as_raw_fd()).map_err(LaunchError::Pty)?;
    set_cloexec(pty.slave.as_raw_fd()).map_err(LaunchError::Pty)?;

    if request.is_utf8 {
        if let Err(e) = set_utf8(&pty.slave) {
            tracing::warn!(error = %e, "failed to enable IUTF8 on pty");
        }
    }

    let tty = ttyname(&pty.slave)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (error_read, error_write) = nix::unistd::pipe().map_err(LaunchError::Fork)?;
    set_cloexec(error_read.as_raw_fd()).map_err(LaunchError::Fork)?;
    set_cloexec(error_write.as_raw_fd()).map_err(LaunchError::Fork)?;

    let close_limit = max_fd();

    // SAFETY: the child only calls async-signal-safe functions on data
    // prepared above, then execs or exits
    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            exec_child(&exec, pty.slave.as_raw_fd(), error_write.as_raw_fd(), close_limit)
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            drop(error_write);

            match read_exec_error(error_read) {
                Ok(None) => {
                    tracing::debug!(pid = child.as_raw(), tty = %tty, path = %request.path, "launched child");
                    Ok(LaunchedChild {
                        pid: child,
                        master: pty.master,
                        tty,
                    })
                }
                Ok(Some(errno)) => {
                    let _ = waitpid(child, None);
                    Err(LaunchError::Exec(errno))
                }
                Err(e) => {
                    // Child state is unknown; treat it like an exec failure
                    tracing::warn!(pid = child.as_raw(), error = %e, "lost exec status pipe");
                    let _ = waitpid(child, None);
                    Err(LaunchError::Exec(Errno::EIO))
                }
            }
        }
    }
}

fn read_exec_error(pipe: OwnedFd) -> io::Result<Option<Errno>> {
    let mut file = File::from(pipe);
    let mut buf = [0u8; 4];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(Some(Errno::from_raw(i32::from_ne_bytes(buf)))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn exec_child(exec: &PreparedExec, slave: RawFd, error_fd: RawFd, close_limit: RawFd) -> ! {
    // SAFETY: post-fork child; only async-signal-safe libc calls follow
    unsafe {
        libc::setsid();
        libc::ioctl(slave, libc::TIOCSCTTY as _, 0);
        libc::tcsetpgrp(slave, libc::getpid());

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(slave, target) < 0 {
                child_fail(error_fd);
            }
        }

        for signal in 1..32 {
            if signal != libc::SIGKILL && signal != libc::SIGSTOP {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigprocmask(libc::SIG_SETMASK, &mask, ptr::null_mut());

        if let Some(pwd) = &exec.pwd {
            libc::chdir(pwd.as_ptr());
        }

        for fd in 3..close_limit {
            if fd != error_fd {
                libc::close(fd);
            }
        }

        libc::execve(exec.path.as_ptr(), exec.argv_ptrs.as_ptr(), exec.envp_ptrs.as_ptr());
        child_fail(error_fd)
    }
}

unsafe fn child_fail(error_fd: RawFd) -> ! {
    let errno = Errno::last_raw().to_ne_bytes();
    libc::write(error_fd, errno.as_ptr().cast(), errno.len());
    libc::_exit(EXEC_FAILED_STATUS)
}
