//! Wire format between the jail client and the privileged warden
//!
//! One JSON object terminated by a newline on the warden's stdin. The warden
//! answers only through its exit code.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::MissingSourceBehavior;
use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Longest request line the warden accepts
pub const MAX_REQUEST_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    #[serde(flatten)]
    request: WardenRequest,
}

/// Operations the warden performs on behalf of the invoking user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WardenRequest {
    Launch(LaunchPayload),
    DeleteAllSandboxes,
}

/// Everything the warden needs to provision a jail and run one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPayload {
    pub cmd: Vec<String>,
    pub id: String,
    pub readable_paths: Vec<PathBuf>,
    /// Writable grants, ensure-exists directories included
    pub writable_paths: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub allow_networking: bool,
    #[serde(default)]
    pub missing_sources: MissingSourceBehavior,
    /// Working directory of the caller, applied when it exists
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Serialize a request as one newline-terminated line
pub fn encode(request: &WardenRequest) -> Result<String> {
    let mut line = serde_json::to_string(&Envelope {
        version: PROTOCOL_VERSION,
        request: request.clone(),
    })?;
    line.push('\n');
    Ok(line)
}

/// Parse one request line, rejecting other protocol versions
pub fn decode(line: &str) -> Result<WardenRequest> {
    let envelope: Envelope = serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Protocol(format!("malformed request: {e}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            envelope.version
        )));
    }
    Ok(envelope.request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> LaunchPayload {
        LaunchPayload {
            cmd: vec!["echo".into(), "hi".into()],
            id: "job".into(),
            readable_paths: vec!["/usr/lib".into()],
            writable_paths: vec!["/tmp/job".into()],
            env: BTreeMap::from([("LANG".into(), "C".into())]),
            allow_networking: false,
            missing_sources: MissingSourceBehavior::Skip,
            cwd: Some("/tmp/job".into()),
        }
    }

    #[test]
    fn test_request_is_a_single_line() {
        let line = encode(&WardenRequest::Launch(payload())).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"op\":\"launch\""));
        assert!(line.contains("\"version\":1"));
        assert_eq!(decode(&line).unwrap(), WardenRequest::Launch(payload()));
    }

    #[test]
    fn test_teardown_request_shape() {
        let line = encode(&WardenRequest::DeleteAllSandboxes).unwrap();
        assert_eq!(line, "{\"version\":1,\"op\":\"delete_all_sandboxes\"}\n");
    }

    #[test]
    fn test_cwd_is_optional_on_the_wire() {
        let line = encode(&WardenRequest::Launch(payload())).unwrap();
        assert!(line.contains("\"cwd\":\"/tmp/job\""));

        let without = line.replace(",\"cwd\":\"/tmp/job\"", "");
        assert_ne!(without, line);
        let WardenRequest::Launch(decoded) = decode(&without).unwrap() else {
            panic!("expected launch");
        };
        assert_eq!(decoded.cwd, None);
    }

    #[test]
    fn test_rejects_unknown_version_and_garbage() {
        assert!(matches!(
            decode("{\"version\":99,\"op\":\"delete_all_sandboxes\"}"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(decode("\"delete_all_sandboxes\""), Err(Error::Protocol(_))));
    }
}
