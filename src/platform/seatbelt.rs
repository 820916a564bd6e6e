//! macOS declarative profile backend
//!
//! A deny-by-default profile is rendered per launch and passed inline to
//! `sandbox-exec`. Nothing is persisted between launches.

use std::path::{Path, PathBuf};
use std::process::Command;

use askama::Template;

use crate::config::{MissingSourceBehavior, SandboxRequest};
use crate::error::{Error, Result};
use crate::keep_alive;
use crate::platform::Child;
use crate::policy::AccessPolicy;

#[derive(Template)]
#[template(path = "seatbelt.sb", escape = "none")]
struct ProfileTemplate<'a> {
    allow_networking: bool,
    readable: &'a [String],
    writable: &'a [String],
}

pub(crate) struct Seatbelt {
    sandbox_exec: PathBuf,
}

impl Seatbelt {
    pub(crate) fn new(sandbox_exec: PathBuf) -> Self {
        Self { sandbox_exec }
    }

    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let policy = AccessPolicy::from_request(request);
        let keep_alive = keep_alive::ensure_all(policy.ensure_exists())?
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();

        let profile = render_profile(request, &policy)?;
        let mut cmd = Command::new(&self.sandbox_exec);
        cmd.arg("-p").arg(&profile).args(request.command());
        request.configure(&mut cmd);

        tracing::info!(id = request.id(), program = request.program(), "sandbox: launching under sandbox-exec");
        let child = cmd
            .spawn()
            .map_err(|e| Error::os_path("spawn", &self.sandbox_exec, e))?;
        Ok(Child::new(child, keep_alive))
    }
}

/// Render the profile text for a request
pub(crate) fn render_profile(request: &SandboxRequest, policy: &AccessPolicy) -> Result<String> {
    let missing = request.options().missing_sources();

    let mut readable = Vec::new();
    for path in policy.readable() {
        if let Some(rule) = path_rule(missing, path)? {
            tracing::debug!(path = %path.display(), "sandbox: allow read");
            readable.push(rule);
        }
    }

    let mut writable = Vec::new();
    for path in policy.all_writable().iter() {
        if let Some(rule) = path_rule(missing, path)? {
            tracing::debug!(path = %path.display(), "sandbox: allow write");
            writable.push(rule);
        }
    }

    if !request.options().allow_networking() {
        tracing::debug!("sandbox: deny network");
    }

    ProfileTemplate {
        allow_networking: request.options().allow_networking(),
        readable: &readable,
        writable: &writable,
    }
    .render()
    .map_err(|e| Error::InvalidProfile(e.to_string()))
}

/// Anchored regex for one grant, already quoted for a profile string
///
/// Directories match themselves and everything below; files match exactly.
fn path_rule(missing: MissingSourceBehavior, path: &Path) -> Result<Option<String>> {
    if !missing.check(path)? {
        return Ok(None);
    }
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    let pattern = if path.is_dir() {
        format!("^{}(/|$)", escape_regex(trimmed))
    } else {
        format!("^{}$", escape_regex(trimmed))
    };
    Ok(Some(escape_string(&pattern)))
}

fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_string(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
