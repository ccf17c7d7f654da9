use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use thiserror::Error;

use crate::cli::Cli;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no Slack token: set TOKEN or provide a readable token file")]
    MissingToken,
    #[error("cannot read {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("an xoxc- token needs a cookie; pass --cookiefile or COOKIE")]
    CookieRequired,
    #[error(
        "{0} is not a loopback address; slackirc speaks plaintext with no \
         authentication, pass --override-local-ip to bind it anyway"
    )]
    NonLocalBind(String),
    #[error("cannot create downloads directory {0}: {1}")]
    DownloadsDirectory(PathBuf, std::io::Error),
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),
}

/// The validated runtime configuration record. Constructed once at
/// startup and injected everywhere; nothing reads flags or environment
/// after this point.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ip: String,
    pub token: String,
    pub cookie: Option<String>,
    pub autojoin: bool,
    pub nouserlist: bool,
    pub no_rejoin_on_mention: bool,
    /// Channel names with their `#`, never joined automatically.
    pub ignored_channels: HashSet<String>,
    pub downloads_directory: PathBuf,
    pub formatted_max_lines: usize,
    pub status_file: Option<PathBuf>,
    /// Nicks and `#channel` names whose yells are muted.
    pub silenced_yellers: HashSet<String>,
    pub control_socket: Option<PathBuf>,
    pub debug: bool,
    pub log_suffix: String,
}

fn read_first_line(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Unreadable(path.to_path_buf(), err))?;
    Ok(content.lines().next().unwrap_or_default().trim().to_string())
}

fn default_tokenfile() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".slackirc")
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let token = match cli.token {
            Some(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => {
                let path = cli.tokenfile.clone().unwrap_or_else(default_tokenfile);
                let token = read_first_line(&path)?;
                if token.is_empty() {
                    return Err(ConfigError::MissingToken);
                }
                token
            }
        };

        let cookie = match cli.cookie {
            Some(cookie) if !cookie.trim().is_empty() => Some(cookie.trim().to_string()),
            _ => match &cli.cookiefile {
                Some(path) => Some(read_first_line(path)?),
                None => None,
            },
        };

        if token.starts_with("xoxc-") && cookie.is_none() {
            return Err(ConfigError::CookieRequired);
        }

        if !cli.ip.starts_with("127") && !cli.override_local_ip {
            return Err(ConfigError::NonLocalBind(cli.ip));
        }

        if cli.downloads_directory.exists() {
            if !cli.downloads_directory.is_dir() {
                return Err(ConfigError::NotADirectory(cli.downloads_directory));
            }
        } else {
            std::fs::create_dir_all(&cli.downloads_directory).map_err(|err| {
                ConfigError::DownloadsDirectory(cli.downloads_directory.clone(), err)
            })?;
        }

        let ignored_channels = split_list(&cli.ignored_channels)
            .map(|name| {
                if name.starts_with('#') {
                    name.to_string()
                } else {
                    format!("#{name}")
                }
            })
            .collect();

        let silenced_yellers = split_list(&cli.silenced_yellers)
            .map(str::to_string)
            .collect();

        Ok(Self {
            port: cli.port,
            ip: cli.ip,
            token,
            cookie,
            autojoin: cli.autojoin,
            nouserlist: cli.nouserlist,
            no_rejoin_on_mention: cli.no_rejoin_on_mention,
            ignored_channels,
            downloads_directory: cli.downloads_directory,
            formatted_max_lines: cli.formatted_max_lines,
            status_file: cli.status_file,
            silenced_yellers,
            control_socket: cli.control_socket,
            debug: cli.debug,
            log_suffix: cli.log_suffix,
        })
    }

    /// The non-secret subset exposed over the control socket.
    pub fn public_summary(&self) -> Value {
        let mut ignored: Vec<&String> = self.ignored_channels.iter().collect();
        ignored.sort();
        json!({
            "port": self.port,
            "autojoin": self.autojoin,
            "ignored_channels": ignored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli(dir: &Path) -> Cli {
        Cli {
            port: 9007,
            ip: "127.0.0.1".to_string(),
            token: Some("xoxb-test".to_string()),
            downloads_directory: dir.join("downloads"),
            ..Default::default()
        }
    }

    #[test]
    fn builds_from_direct_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_cli(base_cli(dir.path())).unwrap();
        assert_eq!(config.token, "xoxb-test");
        assert!(config.downloads_directory.is_dir());
    }

    #[test]
    fn reads_token_from_file_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let tokenfile = dir.path().join("token");
        std::fs::write(&tokenfile, "xoxb-from-file\nsecond line\n").unwrap();
        let mut cli = base_cli(dir.path());
        cli.token = None;
        cli.tokenfile = Some(tokenfile);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.token, "xoxb-from-file");
    }

    #[test]
    fn browser_token_without_cookie_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = base_cli(dir.path());
        cli.token = Some("xoxc-browser".to_string());
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::CookieRequired)
        ));
    }

    #[test]
    fn browser_token_with_cookie_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = base_cli(dir.path());
        cli.token = Some("xoxc-browser".to_string());
        cli.cookie = Some("d=abc".to_string());
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.cookie.as_deref(), Some("d=abc"));
    }

    #[test]
    fn refuses_non_loopback_bind_without_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = base_cli(dir.path());
        cli.ip = "0.0.0.0".to_string();
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::NonLocalBind(_))
        ));
    }

    #[test]
    fn override_allows_non_loopback_bind() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = base_cli(dir.path());
        cli.ip = "10.0.0.5".to_string();
        cli.override_local_ip = true;
        assert!(Config::from_cli(cli).is_ok());
    }

    #[test]
    fn ignored_channels_are_hash_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = base_cli(dir.path());
        cli.ignored_channels = "noise,#ops, spam ".to_string();
        let config = Config::from_cli(cli).unwrap();
        assert!(config.ignored_channels.contains("#noise"));
        assert!(config.ignored_channels.contains("#ops"));
        assert!(config.ignored_channels.contains("#spam"));
    }

    #[test]
    fn public_summary_has_no_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_cli(base_cli(dir.path())).unwrap();
        let summary = serde_json::to_string(&config.public_summary()).unwrap();
        assert!(!summary.contains("xoxb"));
        assert!(summary.contains("\"port\":9007"));
    }
}
