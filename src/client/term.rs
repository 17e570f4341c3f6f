//! Raw-mode control and geometry of the invoking terminal.

use std::os::fd::BorrowedFd;

use nix::sys::termios::{self, SetArg, Termios};

/// Switches stdin to raw mode on creation and restores the saved state on
/// drop, on every exit path including panics.
pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    pub fn enable() -> nix::Result<Self> {
        let fd = stdin_fd();
        let saved = termios::tcgetattr(fd)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw)?;
        Ok(Self { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(stdin_fd(), SetArg::TCSANOW, &self.saved);
    }
}

fn stdin_fd() -> BorrowedFd<'static> {
    // Stdin is open for the lifetime of the process.
    unsafe { BorrowedFd::borrow_raw(nix::libc::STDIN_FILENO) }
}

/// Current terminal geometry as (rows, cols), or `None` when stdout is not
/// a terminal.
pub fn window_size() -> Option<(u16, u16)> {
    let fd = nix::libc::STDOUT_FILENO;
    let mut size: nix::libc::winsize = unsafe { std::mem::zeroed() };

    let result = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut size) };

    if result == 0 && size.ws_row > 0 && size.ws_col > 0 {
        Some((size.ws_row, size.ws_col))
    } else {
        None
    }
}
