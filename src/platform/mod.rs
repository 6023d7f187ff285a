//! Platform-specific privilege checks
//!
//! The daemon needs to create a tun device, so it must run elevated. These
//! checks decide whether the launcher has to go through `sudo`.

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

/// Whether the current process already runs with administrative rights
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        unix::is_elevated()
    }

    #[cfg(windows)]
    {
        self::windows::is_elevated()
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
