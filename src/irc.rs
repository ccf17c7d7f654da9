//! The IRC-facing half: line codec, registration handshake, command
//! parsing and numeric replies for the single attached client.

use std::collections::HashSet;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Reply {
    Welcome = 1,
    YourHost = 2,
    Created = 3,
    MyInfo = 4,
    ISupport = 5,
    LuserClient = 251,
    Away = 301,
    UserHost = 302,
    UnAway = 305,
    NowAway = 306,
    WhoisUser = 311,
    WhoisServer = 312,
    EndOfWho = 315,
    WhoisIdle = 317,
    EndOfWhois = 318,
    WhoisChannels = 319,
    List = 322,
    ListEnd = 323,
    ChannelModeIs = 324,
    Topic = 332,
    TopicWhoTime = 333,
    WhoReply = 352,
    NamReply = 353,
    EndOfNames = 366,
    NoSuchNick = 401,
    NoSuchChannel = 403,
    UnknownCommand = 421,
    NoMotd = 422,
    ErroneousNickname = 432,
    NeedMoreParams = 461,
}

/// Split one raw IRC line into command and parameters, the trailing
/// parameter folded into the last slot. Tolerates a leading prefix.
pub fn parse_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut rest = line.trim_end_matches(['\r', '\n']).trim_start();
    if rest.is_empty() {
        return None;
    }
    if rest.starts_with(':') {
        rest = rest.split_once(' ')?.1;
    }
    let (command, args) = match rest.split_once(' ') {
        Some((command, args)) => (command, args),
        None => (rest, ""),
    };
    let mut params = Vec::new();
    if let Some(stripped) = args.strip_prefix(':') {
        params.push(stripped.to_string());
    } else if !args.is_empty() {
        match args.split_once(" :") {
            Some((middle, trailing)) => {
                params.extend(middle.split_whitespace().map(str::to_string));
                params.push(trailing.to_string());
            }
            None => params.extend(args.split_whitespace().map(str::to_string)),
        }
    }
    Some((command.to_ascii_uppercase(), params))
}

/// Everything the bridge reacts to after registration. Extension
/// commands arrive either as raw client commands or as `/cmd` text in a
/// PRIVMSG; both parse into the same variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Nick(String),
    Ping(String),
    Pong,
    Join(Vec<String>),
    Part(Vec<String>),
    Privmsg { target: String, text: String },
    Notice { target: String, text: String },
    Topic { target: String, topic: Option<String> },
    List,
    Who(Option<String>),
    Whois(String),
    Names(Option<String>),
    Mode { target: String },
    Away(Option<String>),
    Userhost(Vec<String>),
    Kick { channel: String, user: String },
    Invite { user: String, channel: String },
    Quit,
    SendFile { target: String, path: String },
    Annoy { user: String, minutes: Option<i64> },
    DropAnnoy(String),
    ListAnnoy,
    Autoreact {
        user: String,
        probability: f64,
        reaction: Option<String>,
        minutes: Option<i64>,
    },
    DropAutoreact(String),
    ListAutoreact,
    NeedMoreParams(String),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let (command, params) = parse_line(line)?;
        Some(Self::from_parts(&command, params))
    }

    fn from_parts(command: &str, mut params: Vec<String>) -> Command {
        let need = || Command::NeedMoreParams(command.to_string());
        match command {
            "NICK" => match params.into_iter().next() {
                Some(nick) => Command::Nick(nick),
                None => need(),
            },
            "PING" => Command::Ping(params.into_iter().next().unwrap_or_default()),
            "PONG" => Command::Pong,
            "JOIN" => match params.into_iter().next() {
                Some(channels) => {
                    Command::Join(channels.split(',').map(str::to_string).collect())
                }
                None => need(),
            },
            "PART" => match params.into_iter().next() {
                Some(channels) => {
                    Command::Part(channels.split(',').map(str::to_string).collect())
                }
                None => need(),
            },
            "PRIVMSG" | "NOTICE" => {
                if params.len() < 2 {
                    return need();
                }
                let text = params.pop().unwrap_or_default();
                let target = params.remove(0);
                if command == "PRIVMSG" {
                    Command::Privmsg { target, text }
                } else {
                    Command::Notice { target, text }
                }
            }
            "TOPIC" => {
                if params.is_empty() {
                    return need();
                }
                let target = params.remove(0);
                let topic = params.into_iter().next();
                Command::Topic { target, topic }
            }
            "LIST" => Command::List,
            "WHO" => Command::Who(params.into_iter().next()),
            "WHOIS" => match params.into_iter().last() {
                Some(nick) => Command::Whois(nick),
                None => need(),
            },
            "NAMES" => Command::Names(params.into_iter().next()),
            "MODE" => match params.into_iter().next() {
                Some(target) => Command::Mode { target },
                None => need(),
            },
            "AWAY" => Command::Away(params.into_iter().next().filter(|m| !m.is_empty())),
            "USERHOST" => Command::Userhost(params),
            "KICK" => {
                if params.len() < 2 {
                    return need();
                }
                Command::Kick {
                    channel: params.remove(0),
                    user: params.remove(0),
                }
            }
            "INVITE" => {
                if params.len() < 2 {
                    return need();
                }
                Command::Invite {
                    user: params.remove(0),
                    channel: params.remove(0),
                }
            }
            "QUIT" => Command::Quit,
            "SENDFILE" => {
                if params.len() < 2 {
                    return need();
                }
                Command::SendFile {
                    target: params.remove(0),
                    path: params.join(" "),
                }
            }
            "ANNOY" => {
                if params.is_empty() {
                    return need();
                }
                Command::Annoy {
                    user: params.remove(0),
                    minutes: params.first().and_then(|m| m.parse().ok()),
                }
            }
            "DROPANNOY" => match params.into_iter().next() {
                Some(user) => Command::DropAnnoy(user),
                None => need(),
            },
            "LISTANNOY" => Command::ListAnnoy,
            "AUTOREACT" => {
                if params.len() < 2 {
                    return need();
                }
                let user = params.remove(0);
                let Ok(probability) = params.remove(0).parse::<f64>() else {
                    return need();
                };
                Command::Autoreact {
                    user,
                    probability,
                    reaction: params.first().cloned(),
                    minutes: params.get(1).and_then(|m| m.parse().ok()),
                }
            }
            "DROPAUTOREACT" => match params.into_iter().next() {
                Some(user) => Command::DropAutoreact(user),
                None => need(),
            },
            "LISTAUTOREACT" => Command::ListAutoreact,
            other => Command::Unknown(other.to_string()),
        }
    }

    /// Reinterpret `/cmd args` typed into a conversation as an
    /// extension command, with the conversation as implied target.
    pub fn parse_slash(target: &str, text: &str) -> Option<Command> {
        let body = text.strip_prefix('/')?;
        let (name, args) = match body.split_once(' ') {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };
        let name = name.to_ascii_uppercase();
        match name.as_str() {
            "SENDFILE" | "ANNOY" | "DROPANNOY" | "LISTANNOY" | "AUTOREACT" | "DROPAUTOREACT"
            | "LISTAUTOREACT" | "WHOIS" => {
                let params: Vec<String> = args.split_whitespace().map(str::to_string).collect();
                Some(Self::from_parts(&name, params))
            }
            "TOPIC" => Some(Command::Topic {
                target: target.to_string(),
                topic: Some(args.to_string()),
            }),
            "INVITE" => Some(Command::Invite {
                user: args.to_string(),
                channel: target.to_string(),
            }),
            "KICK" => Some(Command::Kick {
                channel: target.to_string(),
                user: args.to_string(),
            }),
            _ => None,
        }
    }
}

/// Nicknames the RFC grammar accepts, relaxed to the lengths Slack
/// actually hands out.
pub fn valid_nick(nick: &str) -> bool {
    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || "[]\\`_^{|}".contains(c) => {}
        _ => return false,
    }
    nick.len() <= 50
        && chars.all(|c| c.is_ascii_alphanumeric() || "[]\\`_^{|}-.".contains(c))
}

/// Strip an outer CTCP ACTION wrapper, returning the action body.
pub fn strip_action(text: &str) -> Option<&str> {
    text.strip_prefix("\u{1}ACTION ")?.strip_suffix('\u{1}')
}

pub fn wrap_action(text: &str) -> String {
    format!("\u{1}ACTION {text}\u{1}")
}

type Reader = BufReader<Box<dyn AsyncRead + Unpin + Send>>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// The one attached IRC client connection.
pub struct Conn {
    reader: Reader,
    writer: Writer,
    pub server: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
}

impl Conn {
    pub fn new(stream: tokio::net::TcpStream, server: String) -> Self {
        let (read, write) = stream.into_split();
        Self::from_parts(Box::new(read), Box::new(write), server)
    }

    pub fn from_parts(
        read: Box<dyn AsyncRead + Unpin + Send>,
        write: Box<dyn AsyncWrite + Unpin + Send>,
        server: String,
    ) -> Self {
        Self {
            reader: BufReader::new(read),
            writer: write,
            server,
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
        }
    }

    /// Next raw line, `\r\n` or bare `\n` delimited. `None` on EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        debug!("irc <- {line}");
        Ok(Some(line))
    }

    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        debug!("irc -> {line}");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn numeric(&mut self, code: Reply, params: &[&str], trailing: &str) -> Result<()> {
        let nick = if self.nick.is_empty() { "*" } else { &self.nick };
        let mut line = format!(":{} {:03} {}", self.server, code as u16, nick);
        for param in params {
            line.push(' ');
            line.push_str(param);
        }
        line.push_str(" :");
        line.push_str(trailing);
        self.send_raw(&line).await
    }

    /// A server NOTICE to the attached client, used for extension
    /// command feedback.
    pub async fn notice(&mut self, text: &str) -> Result<()> {
        let nick = if self.nick.is_empty() { "*" } else { &self.nick };
        let line = format!(":{} NOTICE {} :{}", self.server.clone(), nick, text);
        self.send_raw(&line).await
    }

    /// A line originating from a (pretend) remote user.
    pub async fn from_user(&mut self, nick: &str, command: &str, rest: &str) -> Result<()> {
        let line = format!(":{nick}!{nick}@slack {command} {rest}");
        self.send_raw(&line).await
    }

    pub async fn privmsg(&mut self, from: &str, target: &str, text: &str) -> Result<()> {
        self.from_user(from, "PRIVMSG", &format!("{target} :{text}"))
            .await
    }

    pub async fn join_line(&mut self, nick: &str, channel: &str) -> Result<()> {
        self.from_user(nick, "JOIN", channel).await
    }

    pub async fn part_line(&mut self, nick: &str, channel: &str) -> Result<()> {
        self.from_user(nick, "PART", channel).await
    }

    /// Drive the registration handshake until NICK and USER are both
    /// in. CAP negotiation and PASS are tolerated and ignored. No
    /// traffic leaves for Slack until the 001 block is on the wire.
    pub async fn register(&mut self) -> Result<()> {
        loop {
            let Some(line) = self.next_line().await? else {
                bail!("client disconnected during registration");
            };
            let Some((command, params)) = parse_line(&line) else {
                continue;
            };
            match command.as_str() {
                "NICK" => match params.into_iter().next() {
                    Some(nick) if valid_nick(&nick) => self.nick = nick,
                    Some(nick) => {
                        self.numeric(Reply::ErroneousNickname, &[&nick], "Erroneous nickname")
                            .await?;
                    }
                    None => {
                        self.numeric(Reply::NeedMoreParams, &["NICK"], "Not enough parameters")
                            .await?;
                    }
                },
                "USER" => {
                    if params.len() < 4 {
                        self.numeric(Reply::NeedMoreParams, &["USER"], "Not enough parameters")
                            .await?;
                        continue;
                    }
                    self.username = params[0].clone();
                    self.realname = params[3].clone();
                }
                "CAP" => {
                    if params.first().map(String::as_str) == Some("LS") {
                        let line = format!(":{} CAP * LS :", self.server);
                        self.send_raw(&line).await?;
                    }
                }
                "PASS" => {}
                "QUIT" => bail!("client quit during registration"),
                other => {
                    self.numeric(Reply::UnknownCommand, &[other], "Register first")
                        .await?;
                }
            }
            if !self.nick.is_empty() && !self.username.is_empty() {
                break;
            }
        }

        let nick = self.nick.clone();
        let server = self.server.clone();
        self.numeric(Reply::Welcome, &[], &format!("Welcome to slackirc, {nick}"))
            .await?;
        self.numeric(
            Reply::YourHost,
            &[],
            &format!("Your host is {server}, running slackirc-{VERSION}"),
        )
        .await?;
        self.numeric(Reply::Created, &[], "This server was created at session start")
            .await?;
        self.numeric(
            Reply::MyInfo,
            &[&server, &format!("slackirc-{VERSION}"), "o", "t"],
            "",
        )
        .await?;
        self.numeric(
            Reply::ISupport,
            &["CHANTYPES=#&", "PREFIX=(o)@", "NETWORK=Slack"],
            "are supported by this server",
        )
        .await?;
        self.numeric(
            Reply::LuserClient,
            &[],
            "There are 1 users and 0 services on 1 server",
        )
        .await?;
        self.numeric(Reply::NoMotd, &[], "MOTD File is missing").await?;
        Ok(())
    }

    /// Rename the attached client from the server side, used to pin the
    /// nick to the Slack account name.
    pub async fn force_nick(&mut self, new_nick: &str) -> Result<()> {
        if self.nick == new_nick {
            return Ok(());
        }
        let line = format!(
            ":{}!{}@slack NICK :{}",
            self.nick, self.username, new_nick
        );
        self.send_raw(&line).await?;
        self.nick = new_nick.to_string();
        Ok(())
    }

    /// JOIN burst for a channel: membership line, topic, names.
    pub async fn send_channel_intro(
        &mut self,
        channel: &str,
        topic: &str,
        nicks: &HashSet<String>,
        admins: &HashSet<String>,
        suppress_names: bool,
    ) -> Result<()> {
        let nick = self.nick.clone();
        self.join_line(&nick, channel).await?;
        self.numeric(Reply::Topic, &[channel], topic).await?;
        self.numeric(Reply::TopicWhoTime, &[channel, &nick, "0"], "")
            .await?;
        let names = if suppress_names {
            String::new()
        } else {
            let mut sorted: Vec<String> = nicks
                .iter()
                .map(|n| {
                    if admins.contains(n) {
                        format!("@{n}")
                    } else {
                        n.clone()
                    }
                })
                .collect();
            sorted.sort();
            sorted.join(" ")
        };
        self.numeric(Reply::NamReply, &["=", channel], &names).await?;
        self.numeric(Reply::EndOfNames, &[channel], "End of NAMES list")
            .await?;
        Ok(())
    }
}

/// Turn away a second client; only one may attach at a time.
pub async fn refuse(mut stream: tokio::net::TcpStream) {
    let _ = stream
        .write_all(b"ERROR :Only one client may be connected at a time\r\n")
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_trailing() {
        let (command, params) = parse_line("PRIVMSG #general :hello there").unwrap();
        assert_eq!(command, "PRIVMSG");
        assert_eq!(params, vec!["#general", "hello there"]);
    }

    #[test]
    fn parses_prefixed_and_lowercase_commands() {
        let (command, params) = parse_line(":me!me@host privmsg bob :hi").unwrap();
        assert_eq!(command, "PRIVMSG");
        assert_eq!(params, vec!["bob", "hi"]);
    }

    #[test]
    fn parses_user_registration_params() {
        let (command, params) = parse_line("USER alice 0 * :Alice Example").unwrap();
        assert_eq!(command, "USER");
        assert_eq!(params, vec!["alice", "0", "*", "Alice Example"]);
    }

    #[test]
    fn empty_line_is_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("\r"), None);
    }

    #[test]
    fn command_join_splits_channels() {
        assert_eq!(
            Command::parse("JOIN #a,#b"),
            Some(Command::Join(vec!["#a".to_string(), "#b".to_string()]))
        );
    }

    #[test]
    fn command_missing_params_is_flagged() {
        assert_eq!(
            Command::parse("PRIVMSG #general"),
            Some(Command::NeedMoreParams("PRIVMSG".to_string()))
        );
        assert_eq!(
            Command::parse("KICK #general"),
            Some(Command::NeedMoreParams("KICK".to_string()))
        );
    }

    #[test]
    fn command_annoy_defaults_duration() {
        assert_eq!(
            Command::parse("ANNOY bob"),
            Some(Command::Annoy {
                user: "bob".to_string(),
                minutes: None
            })
        );
        assert_eq!(
            Command::parse("ANNOY bob 5"),
            Some(Command::Annoy {
                user: "bob".to_string(),
                minutes: Some(5)
            })
        );
    }

    #[test]
    fn command_autoreact_parses_probability() {
        assert_eq!(
            Command::parse("AUTOREACT bob 0.5 fire 30"),
            Some(Command::Autoreact {
                user: "bob".to_string(),
                probability: 0.5,
                reaction: Some("fire".to_string()),
                minutes: Some(30),
            })
        );
        assert_eq!(
            Command::parse("AUTOREACT bob nope"),
            Some(Command::NeedMoreParams("AUTOREACT".to_string()))
        );
    }

    #[test]
    fn slash_commands_reuse_the_conversation_target() {
        assert_eq!(
            Command::parse_slash("#sales", "/topic quarterly numbers"),
            Some(Command::Topic {
                target: "#sales".to_string(),
                topic: Some("quarterly numbers".to_string()),
            })
        );
        assert_eq!(
            Command::parse_slash("#sales", "/kick bob"),
            Some(Command::Kick {
                channel: "#sales".to_string(),
                user: "bob".to_string(),
            })
        );
        assert_eq!(
            Command::parse_slash("#sales", "/annoy bob 5"),
            Some(Command::Annoy {
                user: "bob".to_string(),
                minutes: Some(5)
            })
        );
        assert_eq!(Command::parse_slash("#sales", "plain text"), None);
    }

    #[test]
    fn action_wrapping_roundtrips() {
        assert_eq!(strip_action(&wrap_action("waves")), Some("waves"));
        assert_eq!(strip_action("plain"), None);
    }

    #[test]
    fn nick_validation() {
        assert!(valid_nick("alice"));
        assert!(valid_nick("[bracket]_guy"));
        assert!(!valid_nick("9starts-with-digit"));
        assert!(!valid_nick(""));
    }

    async fn registered_pair() -> (Conn, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let conn = Conn::from_parts(
            Box::new(server_read),
            Box::new(server_write),
            "localhost".to_string(),
        );
        (conn, client)
    }

    #[tokio::test]
    async fn registration_emits_welcome_block() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut conn, mut client) = registered_pair().await;
        client
            .write_all(b"NICK alice\r\nUSER alice 0 * :Alice\r\n")
            .await
            .unwrap();

        conn.register().await.unwrap();
        assert_eq!(conn.nick, "alice");

        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let output = String::from_utf8_lossy(&buf[..n]).to_string();
        let lines: Vec<&str> = output.lines().collect();

        assert!(lines[0].contains(" 001 alice "));
        assert!(lines[0].contains("alice"));
        for (i, code) in ["002", "003", "004", "005"].iter().enumerate() {
            assert!(lines[i + 1].contains(&format!(" {code} ")), "line: {}", lines[i + 1]);
        }
        assert!(output.contains(" 422 "));
    }

    #[tokio::test]
    async fn registration_tolerates_cap_and_bare_newlines() {
        use tokio::io::AsyncWriteExt;

        let (mut conn, mut client) = registered_pair().await;
        client
            .write_all(b"CAP LS 302\nPASS secret\nNICK alice\nUSER alice 0 * :Alice\n")
            .await
            .unwrap();
        conn.register().await.unwrap();
        assert_eq!(conn.nick, "alice");
        assert_eq!(conn.username, "alice");
        assert_eq!(conn.realname, "Alice");
    }

    #[tokio::test]
    async fn force_nick_renames_once() {
        use tokio::io::AsyncReadExt;

        let (mut conn, mut client) = registered_pair().await;
        conn.nick = "alice".to_string();
        conn.username = "alice".to_string();
        conn.force_nick("alice2").await.unwrap();
        conn.force_nick("alice2").await.unwrap();
        assert_eq!(conn.nick, "alice2");

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let output = String::from_utf8_lossy(&buf[..n]).to_string();
        assert_eq!(output.matches("NICK :alice2").count(), 1);
    }

    #[tokio::test]
    async fn privmsg_line_uses_slack_host_mask() {
        use tokio::io::AsyncReadExt;

        let (mut conn, mut client) = registered_pair().await;
        conn.nick = "alice".to_string();
        conn.privmsg("bob", "#general", "hi").await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf[..n]),
            ":bob!bob@slack PRIVMSG #general :hi\r\n"
        );
    }
}
