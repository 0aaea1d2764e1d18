//! Remote command construction.
//!
//! Two operations in the whole crate are deliberately dual-pathed, and
//! both live here: privileged commands try `sudo -n` once and then run
//! bare once (for hosts where the admin account is root itself), and
//! commands on behalf of the application user try `sudo -u` once and then
//! `su -` once. The variant lists are ordered, the first success wins,
//! and exhausting the list is an action failure for the calling stage.
//! There are no retries of a variant.

use tracing::{debug, warn};

use crate::error::{SessionError, StageError};
use crate::session::{CommandChannel, ExecOutput};

/// Quote a string for a POSIX shell. Single quotes preserve every byte;
/// an embedded single quote becomes `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Ordered variants for a command that needs root.
///
/// Everything goes through `sh -c` so redirects and `&&` sequences keep
/// their privilege.
pub fn privileged(command: &str) -> [String; 2] {
    let quoted = shell_quote(command);
    [
        format!("sudo -n sh -c {quoted}"),
        format!("sh -c {quoted}"),
    ]
}

/// Ordered variants for a command run as another (unprivileged) user.
///
/// `~/.local/bin` is put on PATH explicitly because the `sudo` variant
/// does not run a login shell.
pub fn as_user(user: &str, command: &str) -> [String; 2] {
    let inner = format!("export PATH=\"$HOME/.local/bin:$PATH\"; {command}");
    let quoted = shell_quote(&inner);
    [
        format!("sudo -n -u {user} -H sh -c {quoted}"),
        format!("su - {user} -c {quoted}"),
    ]
}

/// Run each variant in order until one exits zero.
///
/// Returns the first successful output, or the last attempt's output when
/// every variant failed; the caller decides what a non-zero exit means in
/// its phase. Transport errors abort immediately.
pub fn first_success(
    chan: &mut dyn CommandChannel,
    variants: &[String],
) -> Result<ExecOutput, SessionError> {
    let mut last: Option<ExecOutput> = None;
    for variant in variants {
        let out = chan.run(variant)?;
        if out.success() {
            return Ok(out);
        }
        debug!(command = %variant, exit = out.exit_code, "variant failed, trying next");
        last = Some(out);
    }
    Ok(last.unwrap_or_else(|| ExecOutput {
        stdout: String::new(),
        stderr: "no command variants supplied".to_string(),
        exit_code: 127,
    }))
}

/// Classify a non-zero exit as an action failure, naming the unit that
/// failed and quoting whichever stream has the detail.
pub fn ensure_success(output: ExecOutput, what: &str) -> Result<ExecOutput, StageError> {
    if output.success() {
        return Ok(output);
    }
    let stderr = output.stderr.trim();
    let detail = if stderr.is_empty() {
        output.stdout.trim()
    } else {
        stderr
    };
    Err(StageError::action(format!(
        "{what} exited {}: {detail}",
        output.exit_code
    )))
}

/// Upload a multi-line script to `/tmp`, execute it with root variants,
/// and remove it again. The artifact is removed on success and on
/// failure; a failed removal is only logged.
///
/// This is the one place a genuinely multi-line unit of work is allowed;
/// everything else is single structured commands.
pub fn run_script(
    chan: &mut dyn CommandChannel,
    name: &str,
    body: &str,
    args: &[&str],
) -> Result<ExecOutput, SessionError> {
    let path = format!("/tmp/{name}");
    let upload = format!("printf '%s' {} > {path}", shell_quote(body));
    let uploaded = chan.run(&upload)?;
    if !uploaded.success() {
        warn!(path = %path, exit = uploaded.exit_code, "script upload failed");
        remove_scratch(chan, &path);
        return Ok(uploaded);
    }

    let mut invocation = format!("sh {path}");
    for arg in args {
        invocation.push(' ');
        invocation.push_str(&shell_quote(arg));
    }
    let result = first_success(chan, &privileged(&invocation));
    remove_scratch(chan, &path);
    result
}

fn remove_scratch(chan: &mut dyn CommandChannel, path: &str) {
    match chan.run(&format!("rm -f {path}")) {
        Ok(out) if !out.success() => {
            warn!(path = %path, exit = out.exit_code, "could not remove scratch file");
        }
        Err(err) => {
            warn!(path = %path, error = %err, "could not remove scratch file");
        }
        Ok(_) => {}
    }
}
