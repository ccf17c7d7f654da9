use std::path::PathBuf;

use clap::Parser;

/// Command line surface. Every flag can also come from the environment;
/// the environment wins, which is what lets a service unit configure
/// the bridge without rewriting argv.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "slackirc")]
#[command(about = "Localhost IRC server that impersonates a Slack workspace", version)]
pub struct Cli {
    #[arg(short, long, env = "PORT", default_value_t = 9007)]
    pub port: u16,

    /// Bind address; anything outside 127.0.0.0/8 needs --override-local-ip.
    #[arg(short, long = "ip", env = "IP_ADDRESS", default_value = "127.0.0.1")]
    pub ip: String,

    /// Allow non-loopback binds. There is no encryption or
    /// authentication on the IRC side.
    #[arg(short, long = "override-local-ip", env = "OVERRIDE_LOCAL_IP")]
    pub override_local_ip: bool,

    /// File containing the Slack token on its first line.
    #[arg(short, long, env = "TOKENFILE")]
    pub tokenfile: Option<PathBuf>,

    #[arg(long, env = "TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File containing the browser cookie, needed for xoxc- tokens.
    #[arg(short, long, env = "COOKIEFILE")]
    pub cookiefile: Option<PathBuf>,

    #[arg(long, env = "COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// Join all channels the Slack account is a member of.
    #[arg(short = 'j', long, env = "AUTOJOIN")]
    pub autojoin: bool,

    /// Skip NAMES user lists on join; cheaper on huge workspaces.
    #[arg(short = 'u', long, env = "NOUSERLIST")]
    pub nouserlist: bool,

    /// Do not rejoin a parted channel when the username is mentioned.
    #[arg(long, env = "NO_REJOIN_ON_MENTION")]
    pub no_rejoin_on_mention: bool,

    /// Comma separated channels to skip when autojoin is enabled.
    #[arg(long, env = "IGNORED_CHANNELS", default_value = "")]
    pub ignored_channels: String,

    /// Where oversized preformatted texts and attachments are written.
    #[arg(long, env = "DOWNLOADS_DIRECTORY", default_value = "/tmp")]
    pub downloads_directory: PathBuf,

    /// Preformatted blocks longer than this go to a file; 0 sends
    /// everything inline.
    #[arg(long, env = "FORMATTED_MAX_LINES", default_value_t = 0)]
    pub formatted_max_lines: usize,

    /// Path for the persisted cursors and rule tables.
    #[arg(short = 'f', long, env = "STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Comma separated nicks and channels whose @here/@channel will not
    /// trigger notifications.
    #[arg(long, env = "SILENCED_YELLERS", default_value = "")]
    pub silenced_yellers: String,

    /// Path for the UNIX control socket, bound while a client is attached.
    #[arg(long, env = "CONTROL_SOCKET")]
    pub control_socket: Option<PathBuf>,

    #[arg(short, long, env = "DEBUG")]
    pub debug: bool,

    /// Suffix appended to the logging identity.
    #[arg(long, env = "LOG_SUFFIX", default_value = "")]
    pub log_suffix: String,
}
