//! Hook execution: staging a hook's payload and running it.
//!
//! The install loop does not call into this module — HOOK blocks are
//! skipped during `install`, per the format's own install-loop contract.
//! This is surface for a caller that wants to drive a hook explicitly
//! (e.g. a future install loop extension, or a standalone test harness)
//! without reimplementing the staging/exec/exit-code contract itself.

use efpak_format::{HookExec, HookResult, HookWhen};
use efpak_io::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// A decoded HOOK block, ready to stage and run.
pub struct HookAction<'a> {
    pub when: HookWhen,
    pub exec: HookExec,
    pub path: &'a str,
    /// `None` means `path` already exists on the target and should be run
    /// in place rather than staged from a payload.
    pub payload: Option<&'a [u8]>,
}

/// Stages `action`'s payload (if any) under `staging_dir` at its declared
/// path, marks it executable when [`HookExec::EXECVE`] is set, runs it, and
/// maps the child's exit code through [`HookResult::from_code`].
///
/// A hook with [`HookExec::EXECVE`] unset is staged but not run — it's data
/// the target needs in place, not a program.
pub fn run_hook(action: &HookAction<'_>, staging_dir: &Path) -> Result<HookResult> {
    let target = match action.payload {
        Some(data) => {
            let dest = staging_dir.join(action.path.trim_start_matches('/'));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(Error::Io)?;
            }
            std::fs::write(&dest, data).map_err(Error::Io)?;
            if action.exec.contains(HookExec::EXECVE) {
                set_executable(&dest)?;
            }
            dest
        }
        None => PathBuf::from(action.path),
    };

    if !action.exec.contains(HookExec::EXECVE) {
        return Ok(HookResult::Continue);
    }

    let status = Command::new(&target)
        .status()
        .map_err(|e| Error::Operation(format!("failed to run hook {}: {e}", target.display())))?;
    Ok(HookResult::from_code(status.code().unwrap_or(-1)))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).map_err(Error::Io)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Err(Error::Unsupported("marking a hook executable is only implemented on unix".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_and_runs_executable_hook() {
        let dir = tempfile::tempdir().unwrap();
        let action = HookAction {
            when: HookWhen::POSTX,
            exec: HookExec::EXECVE,
            path: "/hook.sh",
            payload: Some(b"#!/bin/sh\nexit 2\n"),
        };
        let result = run_hook(&action, dir.path()).unwrap();
        assert_eq!(result, HookResult::StopSuccess);
    }

    #[test]
    fn non_executable_hook_is_staged_but_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let action = HookAction {
            when: HookWhen::NOW,
            exec: HookExec::empty(),
            path: "/data.bin",
            payload: Some(b"hello"),
        };
        let result = run_hook(&action, dir.path()).unwrap();
        assert_eq!(result, HookResult::Continue);
        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), b"hello");
    }
}
