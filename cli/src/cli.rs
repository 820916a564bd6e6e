use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kennel")]
#[command(version)]
#[command(about = "Run untrusted commands inside OS-enforced sandboxes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in the sandbox
    Run(RunArgs),

    /// Run a Python interpreter in the sandbox with its runtime made readable
    #[cfg(feature = "python")]
    Python(PythonArgs),

    /// Remove every sandbox created on this host
    DeleteAll,

    /// Harden this process, then exec a command in its place
    Harden(HardenArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Program to run
    pub program: String,

    /// Arguments to pass to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[cfg(feature = "python")]
#[derive(Args)]
pub struct PythonArgs {
    /// Arguments to pass to the interpreter (script and its arguments)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Python interpreter to use
    #[arg(long, default_value = "python3")]
    pub python: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args)]
pub struct HardenArgs {
    /// Safeguard set to apply
    #[arg(long, default_value = "default", value_enum)]
    pub profile: HardenProfile,

    /// Command to exec once hardened
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum HardenProfile {
    /// Clear the environment, drop privileges and install the syscall filter
    #[default]
    Default,
    /// Every safeguard this platform supports
    Exhaustive,
}

/// Common arguments shared across sandboxed subcommands
#[derive(Args)]
pub struct CommonArgs {
    /// Sandbox id, stable across invocations
    #[arg(long, default_value = "kennel")]
    pub id: String,

    // === File Access ===
    /// Path to allow reading (can be repeated)
    #[arg(long = "readable", short = 'r')]
    pub readable_paths: Vec<PathBuf>,

    /// Path to allow writing (can be repeated)
    #[arg(long = "writable", short = 'w')]
    pub writable_paths: Vec<PathBuf>,

    /// Writable directory created if missing and kept for the child's lifetime
    #[arg(long = "ensure-exists")]
    pub ensure_exists: Vec<PathBuf>,

    /// Fail instead of skipping a grant whose path does not exist
    #[arg(long)]
    pub strict_paths: bool,

    // === Network ===
    /// Allow network access
    #[arg(long)]
    pub allow_networking: bool,

    // === WebAssembly ===
    /// Run under a WebAssembly engine even when a native backend exists
    #[arg(long)]
    pub force_wasm: bool,

    /// Copy readable paths into a private mirror for the WebAssembly engine
    #[arg(long = "mirror-readable")]
    pub mirror_readable: bool,

    /// Package the WebAssembly engine should provide (can be repeated)
    #[arg(long = "wasm-package")]
    pub wasm_packages: Vec<String>,

    // === Environment ===
    /// Environment variable to set (KEY=VALUE, can be repeated)
    #[arg(long = "env", short = 'e')]
    pub envs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "kennel", "run", "--id", "job", "-r", "/usr", "-w", "/tmp/out", "--allow-networking",
            "/usr/bin/ls", "-la", "/usr",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.program, "/usr/bin/ls");
        assert_eq!(args.args, ["-la", "/usr"]);
        assert_eq!(args.common.id, "job");
        assert_eq!(args.common.readable_paths, [PathBuf::from("/usr")]);
        assert_eq!(args.common.writable_paths, [PathBuf::from("/tmp/out")]);
        assert!(args.common.allow_networking);
        assert!(!args.common.force_wasm);
    }

    #[test]
    fn test_parse_harden() {
        let cli = Cli::parse_from(["kennel", "-v", "harden", "--profile", "exhaustive", "--", "id", "-u"]);
        assert!(cli.verbose);
        let Commands::Harden(args) = cli.command else {
            panic!("expected harden");
        };
        assert_eq!(args.profile, HardenProfile::Exhaustive);
        assert_eq!(args.command, ["id", "-u"]);
    }

    #[test]
    fn test_harden_requires_command() {
        assert!(Cli::try_parse_from(["kennel", "harden"]).is_err());
    }
}
