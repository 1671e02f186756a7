use std::io::{IsTerminal, stdout};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// On Unix, disables `ECHOCTL` for the terminal while alive.
///
/// `ECHOCTL` makes Ctrl+C print as `^C` in the middle of the progress bar.
/// The cancellation handler prints its own message instead. The original
/// terminal state is restored on drop.
pub struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            Self {
                original_termios: disable_echoctl(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

#[cfg(unix)]
fn disable_echoctl() -> Option<Termios> {
    if !stdout().is_terminal() {
        return None;
    }
    let fd = stdout().as_raw_fd();
    let original = Termios::from_fd(fd).ok()?;
    let mut quiet = original;
    quiet.c_lflag &= !ECHOCTL;
    tcsetattr(fd, TCSANOW, &quiet).ok()?;
    Some(original)
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original).ok();
        }
    }
}

/// Whether progress should be drawn as a bar rather than logged.
pub fn interactive() -> bool {
    stdout().is_terminal()
}
