//! Login shell detection.
//!
//! Resolution order: `$SHELL`, the passwd entry for the current uid,
//! then `/bin/sh`. The result is what pane children exec as `[shell, -l]`.

use std::env;
use std::ffi::CStr;

/// Detect the user's shell.
///
/// Never fails; the worst case is `/bin/sh`.
pub fn detect_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }

    if let Some(shell) = passwd_shell() {
        return shell;
    }

    "/bin/sh".to_string()
}

/// Shell field of the passwd entry for the current uid, if readable.
fn passwd_shell() -> Option<String> {
    // SAFETY: getpwuid returns a pointer into static storage (or NULL);
    // we copy the shell string out before returning.
    unsafe {
        let entry = libc::getpwuid(libc::getuid());
        if entry.is_null() {
            return None;
        }
        let shell_ptr = (*entry).pw_shell;
        if shell_ptr.is_null() {
            return None;
        }
        let shell = CStr::from_ptr(shell_ptr).to_str().ok()?;
        if shell.is_empty() {
            None
        } else {
            Some(shell.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_shell_returns_absolute_path() {
        let shell = detect_shell();
        assert!(shell.starts_with('/'), "unexpected shell: {shell}");
    }
}
