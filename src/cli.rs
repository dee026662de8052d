use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::backend::{BackendConfig, BackendKind, local::DEFAULT_QUOTA_BYTES};
use crate::metadata::{PKG_DESCRIPTION, PKG_NAME, PKG_VERSION};

#[derive(Parser, Debug, Clone)]
#[command(name = PKG_NAME)]
#[command(version = PKG_VERSION)]
#[command(about = PKG_DESCRIPTION, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub storage: StorageArguments,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the tool server
    Start(StartArguments),
    /// Show the backend, sync status and a dashboard summary
    Status,
    /// Write a dated export file
    Export {
        /// Directory for project-data-<date>.json
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Replace all data with the contents of an export or backup file
    Import {
        file: PathBuf,
        /// Skip the overwrite confirmation
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
    },
    /// List timestamped backup files, optionally pruning old ones
    Backups {
        /// Keep only the newest N files
        #[arg(long)]
        prune: Option<usize>,
    },
    /// Add the sample records if they are missing
    Seed {
        /// Also add a sample plan with projects and tasks to an empty tracker
        #[arg(long, default_value_t = false)]
        demo: bool,
    },
    /// Print version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct StorageArguments {
    /// Persistence backend
    #[arg(long, global = true, env = "PLAN_TRACKER_BACKEND", value_enum, default_value_t = BackendKind::Local)]
    pub backend: BackendKind,

    /// Directory for local storage (defaults to ~/.plan-tracker)
    #[arg(long, global = true, env = "PLAN_TRACKER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for backup files (defaults to the downloads folder for
    /// `download`, <data-dir>/backups otherwise)
    #[arg(long, global = true, env = "PLAN_TRACKER_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Base URL of the data server
    #[arg(long, global = true, env = "PLAN_TRACKER_SERVER_URL", default_value = "http://localhost:8001")]
    pub server_url: String,

    /// Local storage quota in bytes
    #[arg(long, global = true, env = "PLAN_TRACKER_QUOTA_BYTES", default_value_t = DEFAULT_QUOTA_BYTES)]
    pub quota_bytes: usize,

    /// Remote request timeout in seconds
    #[arg(long, global = true, env = "PLAN_TRACKER_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,
}

impl StorageArguments {
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == BackendKind::Remote {
            let url = self.server_url.trim();
            if url.is_empty() {
                return Err("PLAN_TRACKER_SERVER_URL cannot be empty for the remote backend".to_string());
            }
        }
        if self.quota_bytes == 0 {
            return Err("PLAN_TRACKER_QUOTA_BYTES must be greater than zero".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("PLAN_TRACKER_TIMEOUT_SECS must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Resolve defaults into a backend configuration.
    pub fn backend_config(&self) -> Result<BackendConfig, String> {
        self.validate()?;
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .map(|home| home.join(".plan-tracker"))
                .ok_or_else(|| "couldn't find home dir; set PLAN_TRACKER_DATA_DIR".to_string())?,
        };
        let backup_dir = match (&self.backup_dir, self.backend) {
            (Some(dir), _) => dir.clone(),
            (None, BackendKind::Download) => {
                dirs::download_dir().unwrap_or_else(|| data_dir.join("downloads"))
            }
            (None, _) => data_dir.join("backups"),
        };
        Ok(BackendConfig {
            kind: self.backend,
            data_dir,
            backup_dir,
            server_url: self.server_url.trim().to_string(),
            quota_bytes: self.quota_bytes,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct StartArguments {
    /// Enable stdio transport
    #[arg(long, env = "MCP_ENABLE_STDIO", default_value_t = true, action = ArgAction::Set)]
    pub enable_stdio: bool,

    /// Enable streamable HTTP transport
    #[arg(long, env = "MCP_ENABLE_HTTP", default_value_t = false, action = ArgAction::Set)]
    pub enable_http: bool,

    /// HTTP bind address (streamable HTTP)
    #[arg(long, env = "MCP_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    pub http_addr: String,
}

impl StartArguments {
    /// Validate CLI/environment-derived arguments.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable_stdio && !self.enable_http {
            return Err("Enable at least one transport (stdio or http)".to_string());
        }
        if self.enable_http {
            self.http_addr
                .parse::<SocketAddr>()
                .map_err(|e| format!("Invalid MCP_HTTP_ADDR '{}': {e}", self.http_addr))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("plan-tracker").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_storage_flags_after_subcommand() {
        let cli = parse(&["status", "--backend", "remote", "--data-dir", "/tmp/pt"]);
        assert_eq!(cli.storage.backend, BackendKind::Remote);
        let config = cli.storage.backend_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pt"));
        assert_eq!(config.backup_dir, PathBuf::from("/tmp/pt/backups"));
        assert_eq!(config.server_url, "http://localhost:8001");
    }

    #[test]
    fn test_import_flags() {
        let cli = parse(&["import", "backup.json", "-y"]);
        match cli.command {
            Command::Import { file, yes } => {
                assert_eq!(file, PathBuf::from("backup.json"));
                assert!(yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_start_requires_a_transport() {
        let cli = parse(&["start", "--enable-stdio", "false"]);
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(args.validate().is_err());

        let cli = parse(&["start", "--enable-http", "true", "--http-addr", "not-an-addr"]);
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(args.validate().unwrap_err().contains("MCP_HTTP_ADDR"));
    }

    #[test]
    fn test_seed_demo_flag() {
        let cli = parse(&["seed", "--demo"]);
        assert!(matches!(cli.command, Command::Seed { demo: true }));
        assert!(matches!(parse(&["seed"]).command, Command::Seed { demo: false }));
    }

    #[test]
    fn test_zero_quota_is_rejected() {
        let cli = parse(&["status", "--quota-bytes", "0", "--data-dir", "/tmp/pt"]);
        assert!(cli.storage.backend_config().is_err());
    }
}
