use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use vault_storage_core::LocalConfig;

/// Configuration for the vault-storage-local tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "vault-storage-local")]
#[command(about = "Inspect and maintain a local vault directory")]
pub struct Config {
    /// Vault root directory
    #[arg(long, global = true, env = "VAULT_PATH")]
    pub path: Option<PathBuf>,

    /// Create the root and missing parent directories on demand
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set, env = "VAULT_CREATE_DIRS")]
    pub create_dirs: bool,

    /// Octal mode for created directories
    #[arg(long, global = true, default_value = "0755", env = "VAULT_DIR_PERMS")]
    pub dir_perms: String,

    /// Octal mode for written files
    #[arg(long, global = true, default_value = "0644", env = "VAULT_FILE_PERMS")]
    pub file_perms: String,

    /// Take in-process and advisory file locks around reads and writes
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set, env = "VAULT_ENABLE_LOCKING")]
    pub enable_locking: bool,

    /// Lock acquisition timeout in seconds (0 = default)
    #[arg(long, global = true, default_value = "10", env = "VAULT_LOCK_TIMEOUT")]
    pub lock_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check that the vault root exists and is writable
    Health,
    /// Validate the configuration without touching the filesystem
    Validate,
    /// Print a file to stdout
    Read { path: String },
    /// Atomically replace a file with stdin, or with the contents of --from
    Write {
        path: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Delete a file
    Delete { path: String },
    /// List files under a prefix ("dir/" for a directory, "dir/pre" to filter by name)
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Print file metadata as JSON
    Stat { path: String },
}

impl Config {
    /// Get the effective vault root.
    pub fn effective_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vault")
        })
    }

    /// Build the backend configuration from the command line.
    pub fn local_config(&self) -> LocalConfig {
        LocalConfig {
            path: self.effective_path(),
            create_dirs: self.create_dirs,
            dir_perms: self.dir_perms.clone(),
            file_perms: self.file_perms.clone(),
            enable_locking: self.enable_locking,
            lock_timeout: self.lock_timeout,
            max_file_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["vault-storage-local", "--path", "/tmp/vault", "health"])
            .unwrap();
        let local = config.local_config();
        assert_eq!(local, LocalConfig::new("/tmp/vault"));
        assert!(matches!(config.command, Command::Health));
    }

    #[test]
    fn test_overrides() {
        let config = Config::try_parse_from([
            "vault-storage-local",
            "list",
            "notes/",
            "--path",
            "/tmp/vault",
            "--enable-locking",
            "false",
            "--lock-timeout",
            "3",
            "--file-perms",
            "0600",
        ])
        .unwrap();
        let local = config.local_config();
        assert!(!local.enable_locking);
        assert_eq!(local.lock_timeout, 3);
        assert_eq!(local.file_perms, "0600");
        assert!(matches!(config.command, Command::List { ref prefix } if prefix == "notes/"));
    }
}
