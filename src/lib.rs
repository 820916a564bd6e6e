//! Kennel - run untrusted commands inside OS-enforced sandboxes
//!
//! A command gets exactly the filesystem paths it is granted, and no network
//! unless asked for. Each platform uses the strongest mechanism it offers:
//! - Linux: user namespaces through `bwrap`
//! - macOS: `sandbox-exec` with a generated profile
//! - FreeBSD: jails provisioned by the privileged `kennel-warden` broker
//! - Windows: AppContainers with incrementally maintained ACL grants
//! - anywhere else: a WebAssembly engine (`wasmer` or `wasmtime`)
//!
//! # Example
//!
//! ```rust,ignore
//! use kennel::SandboxRequest;
//!
//! async fn run_sandboxed() -> kennel::Result<()> {
//!     let request = SandboxRequest::builder(["/usr/bin/wc", "-l", "/srv/data/input.txt"], "counter")
//!         .readable("/usr")
//!         .readable("/srv/data")
//!         .writable_ensure_exists("/tmp/counter")
//!         .build()?;
//!
//!     let mut child = kennel::launch(&request).await?;
//!     let output = child.communicate(None).await?;
//!     println!("Output: {}", String::from_utf8_lossy(&output.stdout));
//!     Ok(())
//! }
//! ```
//!
//! # Identity
//!
//! The `id` of a request names the sandbox across invocations. Backends with
//! persisted state (the container registry, jail roots, the Wasm mirror)
//! key their incremental updates on it, so reusing an id is cheap and
//! [`delete_all_sandboxes`] removes everything ever created.
//!
//! # Hardening
//!
//! Workers that run inside a sandbox can lock themselves down further with
//! [`hardening::Hardening`] before running user code.

mod config;
mod error;
pub mod hardening;
mod keep_alive;
mod lock;
mod platform;
mod policy;
#[cfg(feature = "python")]
pub mod python;
mod sandbox;

// Re-export public types
pub use config::{
    LaunchOptions, LaunchOptionsBuilder, MissingSourceBehavior, SandboxRequest,
    SandboxRequestBuilder, StdioConfig,
};
pub use error::{Access, Error, Result};
pub use keep_alive::KeepAlive;
#[cfg(unix)]
pub use platform::jail::warden;
pub use platform::container::{ContainerAcl, container_name, provision as provision_container};
pub use platform::container::registry::{ContainerRecord, Registry};
pub use platform::{
    BackendKind, Child, ChildStderr, ChildStdin, ChildStdout, Probe, Signal, TargetOs,
    invalidate_probe,
};
pub use platform::wasm::WasmEngine;
pub use policy::{AccessPolicy, PathSet};
pub use sandbox::{Sandbox, SandboxBuilder, delete_all_sandboxes, launch};
