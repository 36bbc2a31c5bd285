// ABOUTME: Daemon configuration from CLI flags and CODEXD_* environment variables

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "codexd", version, about = "Local daemon for codex agent runs")]
pub struct Cli {
    /// Address to bind.
    #[arg(long, env = "CODEXD_LISTEN", default_value = "127.0.0.1")]
    pub listen: String,

    /// Port to bind; 0 picks a free port.
    #[arg(long, env = "CODEXD_PORT", default_value_t = 7171)]
    pub port: u16,

    /// State directory; defaults to ~/.codexd.
    #[arg(long = "state-dir", env = "CODEXD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Codex binary used for the app-server and review subprocesses.
    #[arg(long = "codex-binary", env = "CODEXD_CODEX_BINARY", default_value = "codex")]
    pub codex_binary: String,

    /// Run without the codex app-server (runs will fail until re-enabled).
    #[arg(long = "disable-codex-runtime", env = "CODEXD_DISABLE_CODEX_RUNTIME")]
    pub disable_codex_runtime: bool,

    /// Skip the raw events.jsonl log; the rollup is always written.
    #[arg(long = "no-raw-events", env = "CODEXD_NO_RAW_EVENTS")]
    pub no_raw_events: bool,

    /// Disable bearer-token authentication.
    #[arg(long = "no-auth", env = "CODEXD_NO_AUTH")]
    pub no_auth: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub port: u16,
    pub state_dir: PathBuf,
    pub codex_binary: String,
    pub codex_runtime_enabled: bool,
    pub persist_raw_events: bool,
    pub require_auth: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        let state_dir = cli.state_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".codexd"))
                .unwrap_or_else(|| PathBuf::from(".codexd"))
        });
        Config {
            listen: cli.listen,
            port: cli.port,
            state_dir,
            codex_binary: cli.codex_binary,
            codex_runtime_enabled: !cli.disable_codex_runtime,
            persist_raw_events: !cli.no_raw_events,
            require_auth: !cli.no_auth,
        }
    }
}
