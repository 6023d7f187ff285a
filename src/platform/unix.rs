//! Unix privilege check

use nix::unistd::geteuid;

pub fn is_elevated() -> bool {
    geteuid().is_root()
}
