//! Windows privilege check

use ::windows::Win32::UI::Shell::IsUserAnAdmin;

pub fn is_elevated() -> bool {
    // SAFETY: IsUserAnAdmin takes no arguments and only inspects the process token
    unsafe { IsUserAnAdmin().as_bool() }
}
