//! The coordinating loop between the attached IRC client and the Slack
//! session: one select loop, owned background work, and all shared
//! state mutated from here and nowhere else.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{self, ControlMessage, ControlRequest, ControlResponse};
use crate::diff;
use crate::irc::{self, Command, Conn, Reply};
use crate::parser::{self, RenderCtx, Span};
use crate::slack::events::RtmEvent;
use crate::slack::{
    MessageEvent, Room, RoomKind, RtmFrame, SelfInfo, Session, Transport, ts_newer,
};
use crate::state::{self, AutoreactRule, Status};

const RULE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const ANNOY_DEBOUNCE: Duration = Duration::from_secs(3);
const ANNOY_DEFAULT_MINUTES: i64 = 10;
const AUTOREACT_DEFAULT_MINUTES: i64 = 60;
const AUTOREACT_DEFAULT_REACTION: &str = "+1";
const HISTORY_FETCH_CONCURRENCY: usize = 4;
const HISTORY_LIMIT: usize = 1000;
const HISTORY_FALLBACK_SECS: i64 = 24 * 3600;
/// MPIMs quiet for this long are not worth an IRC channel.
const MPIM_HIDE_SECS: i64 = 50 * 24 * 3600;

/// How a bridge session ended; main maps these to exit behavior.
#[derive(Debug)]
pub enum SessionEnd {
    /// IRC client went away; return to dormant and accept again.
    ClientGone,
    /// Slack rejected the credentials.
    FatalAuth(String),
    /// Slack kept failing after every retry.
    SlackGaveUp(String),
    /// Operator asked the process to stop.
    Shutdown,
}

/// Annoy and autoreact tables, factored out so expiry and debounce
/// logic is testable without a live session.
#[derive(Default)]
pub struct RuleTables {
    pub annoy: HashMap<String, i64>,
    pub autoreact: HashMap<String, Vec<AutoreactRule>>,
    annoy_last_echo: HashMap<String, Instant>,
}

impl RuleTables {
    /// Whether the annoy rule for `user` is live. An expired entry is
    /// dropped and reported via the return value.
    pub fn annoy_state(&mut self, user: &str, now: i64) -> AnnoyState {
        let Some(&expiry) = self.annoy.get(user) else {
            return AnnoyState::Absent;
        };
        if now > expiry {
            self.annoy.remove(user);
            AnnoyState::JustExpired
        } else {
            AnnoyState::Active
        }
    }

    /// Debounce the typing echo: at most one per target per window.
    pub fn annoy_may_echo(&mut self, user: &str, now: Instant) -> bool {
        let last = self.annoy_last_echo.get(user).copied();
        match last {
            Some(last) if now.duration_since(last) < ANNOY_DEBOUNCE => false,
            _ => {
                self.annoy_last_echo.insert(user.to_string(), now);
                true
            }
        }
    }

    /// Reactions to roll for a message from `user` in `room`.
    pub fn autoreact_candidates(&self, user: &str, room: &str, now: i64) -> Vec<AutoreactRule> {
        self.autoreact
            .get(user)
            .into_iter()
            .flatten()
            .filter(|rule| now <= rule.expires)
            .filter(|rule| rule.room.as_deref().map_or(true, |scope| scope == room))
            .cloned()
            .collect()
    }

    /// Drop every expired entry; returns the users whose annoy rule
    /// lapsed, so the client can be told.
    pub fn sweep(&mut self, now: i64) -> Vec<String> {
        let lapsed: Vec<String> = self
            .annoy
            .iter()
            .filter(|(_, &expiry)| now > expiry)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &lapsed {
            self.annoy.remove(user);
        }
        for rules in self.autoreact.values_mut() {
            rules.retain(|rule| now <= rule.expires);
        }
        self.autoreact.retain(|_, rules| !rules.is_empty());
        lapsed
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AnnoyState {
    Absent,
    Active,
    JustExpired,
}

/// Stable synthetic channel name for a thread, collision-free within a
/// session thanks to the fallback to the full hash width.
pub fn thread_channel_name(parent: &str, room_id: &str, ts: &str, taken: &HashSet<String>) -> String {
    let hash = fnv1a(format!("{room_id}:{ts}").as_bytes());
    let short = format!("{parent}-0x{:08x}", (hash & 0xffff_ffff) as u32);
    if taken.contains(&short) {
        format!("{parent}-0x{hash:016x}")
    } else {
        short
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Dedup against the per-room cursor: deliver only what is newer.
pub fn past_cursor(cursor: Option<&str>, ts: &str) -> bool {
    match cursor {
        Some(cursor) => ts_newer(ts, cursor),
        None => true,
    }
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

fn fallback_oldest() -> String {
    format!("{}.000000", now_epoch() - HISTORY_FALLBACK_SECS)
}

/// Write an oversized preformatted block under the downloads directory
/// with a stable room+ts name, returning the reference to deliver.
fn store_overflow(downloads: &Path, room: &str, ts: &str, text: &str) -> Option<String> {
    let path = downloads.join(format!("{room}-{ts}.txt"));
    match std::fs::write(&path, text) {
        Ok(()) => Some(format!("file://{}", path.display())),
        Err(err) => {
            warn!("cannot store preformatted text at {}: {err}", path.display());
            None
        }
    }
}

struct ThreadChannel {
    room_id: String,
    thread_ts: String,
}

enum Tick {
    Irc(Option<String>),
    Slack(Option<RtmFrame>),
    Control(Option<ControlMessage>),
    Notice(Option<String>),
    Sweep,
    Extra(std::io::Result<(TcpStream, std::net::SocketAddr)>),
    Interrupted,
}

pub struct Bridge {
    config: Arc<Config>,
    session: Arc<Session>,
    conn: Conn,
    me: SelfInfo,
    rtm_events: mpsc::Receiver<RtmFrame>,
    control_rx: mpsc::Receiver<ControlMessage>,
    notices_tx: mpsc::Sender<String>,
    notices_rx: mpsc::Receiver<String>,
    /// IRC channel names the client currently sees as joined.
    joined: HashSet<String>,
    /// Explicitly parted names, ignored channels included. Covers
    /// synthetic thread channels too.
    parted: HashSet<String>,
    threads: HashMap<String, ThreadChannel>,
    thread_names: HashMap<(String, String), String>,
    /// `&`-style MPIM channel name → room id.
    mpim_rooms: HashMap<String, String>,
    rules: RuleTables,
    last_seen: HashMap<String, String>,
}

/// Accept-side entry point: drive one attached client from
/// registration to disconnect.
pub async fn run_session(
    listener: &TcpListener,
    stream: TcpStream,
    config: Arc<Config>,
) -> SessionEnd {
    let mut conn = Conn::new(stream, "localhost".to_string());
    if let Err(err) = conn.register().await {
        info!("client left before registering: {err}");
        return SessionEnd::ClientGone;
    }

    let transport = match Transport::new(config.token.clone(), config.cookie.clone()) {
        Ok(transport) => Arc::new(transport),
        Err(err) => return SessionEnd::SlackGaveUp(err.to_string()),
    };
    let session = Arc::new(Session::new(transport.clone()));

    let me = match session.login().await {
        Ok(me) => me,
        Err(err) if err.is_auth() => return SessionEnd::FatalAuth(err.to_string()),
        Err(err) => return SessionEnd::SlackGaveUp(err.to_string()),
    };
    info!("logged into slack as {} ({})", me.name, me.user_id);

    let (rtm, rtm_events) = crate::slack::spawn_rtm(transport);
    session.set_rtm_out(rtm.outbound.clone()).await;

    let (control_tx, control_rx) = mpsc::channel(16);
    let _control = match &config.control_socket {
        Some(path) => match control::spawn(path, control_tx) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("control socket unavailable: {err}");
                None
            }
        },
        None => None,
    };

    let status = match &config.status_file {
        Some(path) => state::load(path).await,
        None => Status::new(),
    };

    let (notices_tx, notices_rx) = mpsc::channel(32);
    let mut bridge = Bridge {
        parted: config.ignored_channels.iter().cloned().collect(),
        rules: RuleTables {
            annoy: status.annoy,
            autoreact: status.autoreact,
            annoy_last_echo: HashMap::new(),
        },
        last_seen: status.last_seen,
        joined: HashSet::new(),
        threads: HashMap::new(),
        thread_names: HashMap::new(),
        mpim_rooms: HashMap::new(),
        config,
        session,
        conn,
        me,
        rtm_events,
        control_rx,
        notices_tx,
        notices_rx,
    };

    let end = bridge.run(listener).await;
    bridge.save_status().await;
    rtm.shutdown();
    end
}

impl Bridge {
    async fn run(&mut self, listener: &TcpListener) -> SessionEnd {
        // The registered nick is pinned to the Slack account name.
        let name = self.me.name.clone();
        if self.conn.force_nick(&name).await.is_err() {
            return SessionEnd::ClientGone;
        }

        if let Err(end) = self.sync().await {
            return end;
        }

        let mut sweep = tokio::time::interval(RULE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let tick = tokio::select! {
                line = self.conn.next_line() => Tick::Irc(line.unwrap_or(None)),
                frame = self.rtm_events.recv() => Tick::Slack(frame),
                request = self.control_rx.recv() => Tick::Control(request),
                notice = self.notices_rx.recv() => Tick::Notice(notice),
                _ = sweep.tick() => Tick::Sweep,
                accepted = listener.accept() => Tick::Extra(accepted),
                _ = tokio::signal::ctrl_c() => Tick::Interrupted,
            };

            match tick {
                Tick::Irc(None) => {
                    info!("irc client disconnected");
                    return SessionEnd::ClientGone;
                }
                Tick::Irc(Some(line)) => {
                    let Some(command) = Command::parse(&line) else {
                        continue;
                    };
                    match self.handle_command(command).await {
                        Ok(None) => {}
                        Ok(Some(end)) => return end,
                        Err(err) => {
                            debug!("irc write failed: {err}");
                            return SessionEnd::ClientGone;
                        }
                    }
                }
                Tick::Slack(None) => {
                    return SessionEnd::SlackGaveUp("event socket task ended".to_string())
                }
                Tick::Slack(Some(frame)) => {
                    if let Some(end) = self.handle_frame(frame).await {
                        return end;
                    }
                }
                Tick::Control(None) => {}
                Tick::Control(Some((request, reply))) => {
                    let response = self.handle_control(request).await;
                    let _ = reply.send(response);
                }
                Tick::Notice(Some(notice)) => {
                    let _ = self.conn.notice(&notice).await;
                }
                Tick::Notice(None) => {}
                Tick::Sweep => self.sweep_rules().await,
                Tick::Extra(Ok((stream, addr))) => {
                    info!("refusing second client from {addr}");
                    irc::refuse(stream).await;
                }
                Tick::Extra(Err(err)) => warn!("listener error: {err}"),
                Tick::Interrupted => return SessionEnd::Shutdown,
            }
        }
    }

    // ---- syncing ----------------------------------------------------

    /// Load rosters, join channels, backfill history. Events arriving
    /// meanwhile are buffered and replayed after the backlog, where the
    /// cursor dedups anything the backlog already covered.
    async fn sync(&mut self) -> Result<(), SessionEnd> {
        if let Err(err) = self.session.prefetch_rooms().await {
            if err.is_auth() {
                return Err(SessionEnd::FatalAuth(err.to_string()));
            }
            return Err(SessionEnd::SlackGaveUp(err.to_string()));
        }
        if !self.config.nouserlist || self.config.autojoin {
            if let Err(err) = self.session.prefetch_users().await {
                warn!("user directory prefetch failed: {err}");
            }
        }

        let mut fetch_targets: Vec<Arc<Room>> = Vec::new();
        let mpim_cutoff = now_epoch() - MPIM_HIDE_SECS;
        for room in self.session.rooms_snapshot().await {
            match room.kind() {
                RoomKind::Im => fetch_targets.push(room),
                RoomKind::Mpim | RoomKind::Channel if room.is_member => {
                    if room.kind() == RoomKind::Mpim {
                        let stale = room
                            .last_read
                            .as_deref()
                            .map(|ts| crate::slack::ts_value(ts).0 < mpim_cutoff)
                            .unwrap_or(false);
                        if stale {
                            continue;
                        }
                    }
                    let name = self.irc_name_for(room.as_ref()).await;
                    if self.parted.contains(&name) {
                        debug!("not joining {name}, marked as parted");
                        continue;
                    }
                    if self.config.autojoin {
                        if let Err(err) = self.introduce_channel(&name, room.as_ref()).await {
                            debug!("channel intro failed: {err}");
                        }
                        fetch_targets.push(room);
                    }
                }
                _ => {}
            }
        }

        let buffered = self.backfill(fetch_targets).await;
        for frame in buffered {
            if let Some(end) = Box::pin(self.handle_frame(frame)).await {
                return Err(end);
            }
        }
        Ok(())
    }

    /// Bounded parallel history fetch; delivers each room's backlog in
    /// ts order, then returns the events buffered while fetching.
    async fn backfill(&mut self, targets: Vec<Arc<Room>>) -> Vec<RtmFrame> {
        let session = self.session.clone();
        let cursors: Vec<(Arc<Room>, String)> = targets
            .into_iter()
            .map(|room| {
                let oldest = self
                    .last_seen
                    .get(&room.id)
                    .cloned()
                    .unwrap_or_else(fallback_oldest);
                (room, oldest)
            })
            .collect();

        let fetch = async move {
            futures::stream::iter(cursors.into_iter().map(|(room, oldest)| {
                let session = session.clone();
                async move {
                    let history = session.history(&room.id, &oldest, HISTORY_LIMIT).await;
                    (room, history)
                }
            }))
            .buffer_unordered(HISTORY_FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
        };
        tokio::pin!(fetch);

        let mut buffered = Vec::new();
        let mut events_open = true;
        let fetched = loop {
            tokio::select! {
                fetched = &mut fetch => break fetched,
                frame = self.rtm_events.recv(), if events_open => match frame {
                    Some(frame) => buffered.push(frame),
                    None => events_open = false,
                },
            }
        };

        for (room, history) in fetched {
            let messages = match history {
                Ok(messages) => messages,
                Err(err) => {
                    warn!("history fetch for {} failed: {err}", room.id);
                    continue;
                }
            };
            for message in messages {
                if let Err(err) = self.handle_message(&message, "", true).await {
                    debug!("backlog delivery failed: {err}");
                }
            }
        }
        buffered
    }

    // ---- naming and rendering ---------------------------------------

    /// IRC channel name for a room: `#name` for channels, `&`-joined
    /// sorted nicks for MPIMs.
    async fn irc_name_for(&mut self, room: &Room) -> String {
        match room.kind() {
            RoomKind::Mpim => {
                let (nicks, _) = self.member_nicks(&room.id).await;
                let mut others: Vec<String> = nicks
                    .into_iter()
                    .filter(|nick| *nick != self.me.name)
                    .collect();
                others.sort();
                let name = format!("&{}", others.join(","));
                self.mpim_rooms.insert(name.clone(), room.id.clone());
                name
            }
            _ => format!("#{}", room.display_name()),
        }
    }

    async fn member_nicks(&self, room_id: &str) -> (HashSet<String>, HashSet<String>) {
        let mut nicks = HashSet::new();
        let mut admins = HashSet::new();
        let ids = match self.session.members(room_id).await {
            Ok(ids) => ids,
            Err(err) => {
                debug!("member list for {room_id} unavailable: {err}");
                return (nicks, admins);
            }
        };
        for id in ids.iter() {
            match self.session.get_user(id).await {
                Ok(user) if user.deleted => {}
                Ok(user) => {
                    if user.is_admin {
                        admins.insert(user.name.clone());
                    }
                    nicks.insert(user.name.clone());
                }
                Err(_) => {}
            }
        }
        (nicks, admins)
    }

    /// Resolve every id the spans reference and render them for the
    /// given delivery target. Lookup misses degrade to ids.
    async fn render_spans(
        &self,
        spans: &[Span],
        sender_nick: &str,
        irc_dest: &str,
        room: Option<&Room>,
        ts: &str,
    ) -> String {
        let mut users = HashMap::new();
        let mut rooms = HashMap::new();
        for span in spans {
            match span {
                Span::Mention { id, .. } => {
                    if let Ok(user) = self.session.get_user(id).await {
                        users.insert(id.clone(), user.name.clone());
                    }
                }
                Span::RoomMention { id, .. } => {
                    if let Ok(room) = self.session.get_room(id).await {
                        rooms.insert(id.clone(), room.display_name().to_string());
                    }
                }
                _ => {}
            }
        }

        let members = match room {
            Some(room) if irc_dest.starts_with('#') || irc_dest.starts_with('&') => {
                self.member_nicks(&room.id).await.0
            }
            _ => HashSet::new(),
        };
        let silenced = self.config.silenced_yellers.contains(sender_nick)
            || self.config.silenced_yellers.contains(irc_dest);

        let ctx = RenderCtx {
            users: &users,
            rooms: &rooms,
            channel_members: &members,
            local_nick: &self.me.name,
            yell_silenced: silenced,
            formatted_max_lines: self.config.formatted_max_lines,
        };
        let downloads = self.config.downloads_directory.clone();
        let room_label = room.map(|r| r.display_name().to_string()).unwrap_or_default();
        parser::render_to_irc(spans, &ctx, |pre| {
            store_overflow(&downloads, &room_label, ts, pre)
        })
    }

    async fn render_topic(&self, raw: &str) -> String {
        let spans = parser::tokenize(raw);
        self.render_spans(&spans, "", "", None, "")
            .await
            .replace('\n', " | ")
    }

    /// JOIN burst for a channel-shaped room.
    async fn introduce_channel(&mut self, irc_name: &str, room: &Room) -> Result<()> {
        let (nicks, admins) = self.member_nicks(&room.id).await;
        let topic = self.render_topic(room.real_topic()).await;
        self.conn
            .send_channel_intro(irc_name, &topic, &nicks, &admins, self.config.nouserlist)
            .await?;
        self.joined.insert(irc_name.to_string());
        Ok(())
    }

    async fn introduce_thread(&mut self, irc_name: &str, parent: &Room) -> Result<()> {
        let (nicks, admins) = self.member_nicks(&parent.id).await;
        let topic = format!("Thread in #{}", parent.display_name());
        self.conn
            .send_channel_intro(irc_name, &topic, &nicks, &admins, self.config.nouserlist)
            .await?;
        self.joined.insert(irc_name.to_string());
        Ok(())
    }

    // ---- slack events -----------------------------------------------

    async fn handle_frame(&mut self, frame: RtmFrame) -> Option<SessionEnd> {
        match frame {
            RtmFrame::Fatal(err) => return Some(SessionEnd::FatalAuth(err.to_string())),
            RtmFrame::Reconnected => {
                info!("slack reconnected, resyncing");
                if let Err(end) = self.resync().await {
                    return Some(end);
                }
            }
            RtmFrame::Event(value) => {
                let Some(event) = crate::slack::events::decode(&value) else {
                    return None;
                };
                if let Err(err) = self.handle_event(event).await {
                    debug!("event handling failed: {err}");
                }
            }
        }
        None
    }

    /// After a socket re-establishment: refresh what may have drifted
    /// and close the gap from the cursors.
    async fn resync(&mut self) -> Result<(), SessionEnd> {
        if let Err(err) = self.session.prefetch_rooms().await {
            if err.is_auth() {
                return Err(SessionEnd::FatalAuth(err.to_string()));
            }
            warn!("room refresh after reconnect failed: {err}");
        }

        let mut targets = Vec::new();
        for room in self.session.rooms_snapshot().await {
            let wanted = match room.kind() {
                RoomKind::Im => true,
                _ => {
                    let name = self.irc_name_for(room.as_ref()).await;
                    self.joined.contains(&name)
                }
            };
            if wanted {
                targets.push(room);
            }
        }
        let buffered = self.backfill(targets).await;
        for frame in buffered {
            if let Some(end) = Box::pin(self.handle_frame(frame)).await {
                return Err(end);
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: RtmEvent) -> Result<()> {
        match event {
            RtmEvent::Hello => {}
            RtmEvent::Message(message) => {
                self.handle_message(&message, "", true).await?;
                self.roll_autoreact(&message).await;
            }
            RtmEvent::MessageChanged {
                channel,
                previous,
                current,
            } => {
                let Some(previous) = previous else {
                    return Ok(());
                };
                if previous.text == current.text {
                    return Ok(());
                }
                let Some(window) = diff::word_diff(&previous.text, &current.text) else {
                    return Ok(());
                };
                let mut edit = current;
                edit.channel = channel;
                edit.text = window.render();
                self.handle_message(&edit, "[edit] ", false).await?;
            }
            RtmEvent::MessageDeleted {
                channel,
                deleted_ts,
                previous,
            } => {
                let Some(mut tombstone) = previous else {
                    return Ok(());
                };
                tombstone.channel = channel;
                tombstone.ts = deleted_ts;
                self.handle_message(&tombstone, "[deleted] ", false).await?;
            }
            RtmEvent::BotMessage {
                channel,
                ts,
                username,
                text,
            } => {
                let message = MessageEvent {
                    channel,
                    user: None,
                    text,
                    ts,
                    thread_ts: None,
                    files: Vec::new(),
                    action: false,
                };
                let prefix = format!("[{username}] ");
                self.handle_message(&message, &prefix, true).await?;
            }
            RtmEvent::TopicChange { channel, topic } => {
                if let Ok(room) = self.session.get_room(&channel).await {
                    self.session.evict_room(&channel).await;
                    let name = format!("#{}", room.display_name());
                    if self.joined.contains(&name) {
                        let rendered = self.render_topic(&topic).await;
                        self.conn.numeric(Reply::Topic, &[&name], &rendered).await?;
                    }
                }
            }
            RtmEvent::UserTyping { channel, user } => {
                self.handle_typing(&channel, &user).await;
            }
            RtmEvent::UserChange { user } => self.session.upsert_user(user).await,
            RtmEvent::TeamJoin { user } => self.session.upsert_user(user).await,
            RtmEvent::ChannelJoined { room } => {
                // Joined from the Slack side; mirror it on IRC as if
                // the client had typed /join.
                let id = room.id.clone();
                self.session.evict_room(&id).await;
                let room = match self.session.get_room(&id).await {
                    Ok(room) => room,
                    Err(_) => Arc::new(room),
                };
                let name = self.irc_name_for(room.as_ref()).await;
                self.parted.remove(&name);
                if !self.joined.contains(&name) {
                    self.introduce_channel(&name, room.as_ref()).await?;
                }
            }
            RtmEvent::ChannelLeft { channel } => {
                if let Ok(room) = self.session.get_room(&channel).await {
                    let name = self.irc_name_for(room.as_ref()).await;
                    if self.joined.remove(&name) {
                        let nick = self.conn.nick.clone();
                        self.conn.part_line(&nick, &name).await?;
                    }
                }
                self.session.evict_room(&channel).await;
            }
            RtmEvent::RoomChanged { channel } => self.session.evict_room(&channel).await,
            RtmEvent::MemberJoined { channel, user } => {
                self.session.evict_members(&channel).await;
                self.emit_membership(&channel, &user, true).await?;
            }
            RtmEvent::MemberLeft { channel, user } => {
                self.session.evict_members(&channel).await;
                self.emit_membership(&channel, &user, false).await?;
            }
            RtmEvent::ReactionAdded {
                user,
                reaction,
                channel,
                ts,
            } => {
                debug!("reaction {reaction} from {user} on {channel}/{ts}");
            }
            RtmEvent::PresenceChange { user, presence } => {
                let presence = match presence.as_str() {
                    "active" => crate::slack::Presence::Active,
                    "away" => crate::slack::Presence::Away,
                    _ => crate::slack::Presence::Unknown,
                };
                self.session.set_presence(&user, presence).await;
            }
        }
        Ok(())
    }

    async fn emit_membership(&mut self, channel: &str, user_id: &str, joined: bool) -> Result<()> {
        let Ok(user) = self.session.get_user(user_id).await else {
            return Ok(());
        };
        if user.deleted {
            return Ok(());
        }
        let Ok(room) = self.session.get_room(channel).await else {
            return Ok(());
        };
        let name = format!("#{}", room.display_name());
        if !self.joined.contains(&name) || self.parted.contains(&name) {
            return Ok(());
        }
        if joined {
            self.conn.join_line(&user.name, &name).await
        } else {
            self.conn.part_line(&user.name, &name).await
        }
    }

    async fn handle_typing(&mut self, channel: &str, user: &str) {
        match self.rules.annoy_state(user, now_epoch()) {
            AnnoyState::Absent => {}
            AnnoyState::JustExpired => {
                let nick = self.session.nick_of(user).await;
                let _ = self
                    .conn
                    .notice(&format!("No longer annoying {nick}"))
                    .await;
                self.save_status().await;
            }
            AnnoyState::Active => {
                if self.rules.annoy_may_echo(user, Instant::now()) {
                    self.session.typing(channel).await;
                }
            }
        }
    }

    async fn roll_autoreact(&mut self, message: &MessageEvent) {
        let Some(user) = message.user.as_deref() else {
            return;
        };
        for rule in self
            .rules
            .autoreact_candidates(user, &message.channel, now_epoch())
        {
            if rand::random::<f64>() < rule.probability {
                if let Err(err) = self
                    .session
                    .react(&message.channel, &message.ts, &rule.reaction)
                    .await
                {
                    debug!("autoreact failed: {err}");
                }
            }
        }
    }

    /// The one delivery path for room messages, live or backlog.
    /// `dedup` gates both the cursor check and the cursor advance;
    /// edits and deletions replay with it off.
    async fn handle_message(
        &mut self,
        message: &MessageEvent,
        prefix: &str,
        dedup: bool,
    ) -> Result<()> {
        if message.user.as_deref() == Some(self.me.user_id.as_str()) {
            // Own messages echo back on the socket; the client already
            // saw what it typed.
            if dedup {
                self.advance_cursor(&message.channel, &message.ts);
            }
            return Ok(());
        }
        if dedup && !past_cursor(self.last_seen.get(&message.channel).map(String::as_str), &message.ts)
        {
            return Ok(());
        }

        let room = match self.session.get_room(&message.channel).await {
            Ok(room) => room,
            Err(err) => {
                warn!("message for unresolvable room {}: {err}", message.channel);
                return Ok(());
            }
        };

        let sender = match message.user.as_deref() {
            Some(id) => self.session.nick_of(id).await,
            None => "bot".to_string(),
        };

        let mention_token = format!("<@{}>", self.me.user_id);
        let mentioned = !self.config.no_rejoin_on_mention && message.text.contains(&mention_token);

        let dest;
        if room.kind() == RoomKind::Im {
            dest = self.conn.nick.clone();
        } else {
            let channel_name = self.irc_name_for(room.as_ref()).await;
            if let Some(thread_ts) = message
                .thread_ts
                .as_deref()
                .filter(|thread| *thread != message.ts)
            {
                let parent_parted = self.parted.contains(&channel_name);
                match self
                    .thread_destination(room.as_ref(), thread_ts, parent_parted, mentioned)
                    .await?
                {
                    Some(name) => dest = name,
                    None => {
                        if dedup {
                            self.advance_cursor(&message.channel, &message.ts);
                        }
                        return Ok(());
                    }
                }
            } else if self.parted.contains(&channel_name) {
                if mentioned {
                    self.parted.remove(&channel_name);
                    self.introduce_channel(&channel_name, room.as_ref()).await?;
                    dest = channel_name;
                } else {
                    if dedup {
                        self.advance_cursor(&message.channel, &message.ts);
                    }
                    return Ok(());
                }
            } else if !self.joined.contains(&channel_name) {
                if self.config.autojoin || mentioned {
                    self.introduce_channel(&channel_name, room.as_ref()).await?;
                    dest = channel_name;
                } else {
                    // Held back until the client joins; the cursor stays
                    // put so the join-time backfill picks this up.
                    return Ok(());
                }
            } else {
                dest = channel_name;
            }
        }

        let mut text = format!("{prefix}{}", message.text);
        text.push_str(&crate::slack::file_trailer(&message.files));

        let spans = parser::tokenize(&text);
        let rendered = self
            .render_spans(&spans, &sender, &dest, Some(room.as_ref()), &message.ts)
            .await;

        for line in rendered.split('\n').filter(|line| !line.is_empty()) {
            let line = if message.action {
                irc::wrap_action(line)
            } else {
                line.to_string()
            };
            self.conn.privmsg(&sender, &dest, &line).await?;
        }

        if !message.files.is_empty() {
            self.spawn_attachment_downloads(&message.files);
        }

        if dedup {
            self.advance_cursor(&message.channel, &message.ts);
            self.session.mark(&message.channel, &message.ts).await;
        }
        Ok(())
    }

    /// Received attachments are saved under the downloads directory
    /// with their original names; fetches run detached.
    fn spawn_attachment_downloads(&self, files: &[crate::slack::events::FileInfo]) {
        for file in files {
            let (Some(url), Some(name)) = (file.url_private.clone(), file.name.clone()) else {
                continue;
            };
            let filename = Path::new(&name)
                .file_name()
                .map(|base| base.to_string_lossy().to_string())
                .unwrap_or(name);
            let session = self.session.clone();
            let target = self.config.downloads_directory.join(filename);
            tokio::spawn(async move {
                match session.download_file(&url).await {
                    Ok(bytes) => {
                        if let Err(err) = tokio::fs::write(&target, bytes).await {
                            warn!("cannot save attachment to {}: {err}", target.display());
                        }
                    }
                    Err(err) => debug!("attachment download failed: {err}"),
                }
            });
        }
    }

    fn advance_cursor(&mut self, room: &str, ts: &str) {
        let stale = self
            .last_seen
            .get(room)
            .map_or(false, |cursor| !ts_newer(ts, cursor));
        if !stale {
            self.last_seen.insert(room.to_string(), ts.to_string());
        }
    }

    /// Synthetic channel for a thread reply. Returns the IRC channel to
    /// deliver into, or `None` when the thread is being ignored.
    async fn thread_destination(
        &mut self,
        room: &Room,
        thread_ts: &str,
        parent_parted: bool,
        mentioned: bool,
    ) -> Result<Option<String>> {
        let parent_name = format!("#{}", room.display_name());
        let key = (room.id.clone(), thread_ts.to_string());
        let name = match self.thread_names.get(&key) {
            Some(name) => name.clone(),
            None => {
                let taken: HashSet<String> = self.thread_names.values().cloned().collect();
                let name = thread_channel_name(&parent_name, &room.id, thread_ts, &taken);
                self.thread_names.insert(key, name.clone());
                name
            }
        };

        if self.parted.contains(&name) {
            if !mentioned {
                return Ok(None);
            }
            self.parted.remove(&name);
        }

        if !self.threads.contains_key(&name) {
            if parent_parted && !mentioned {
                // New threads from a parted channel stay ignored; known
                // ones continue to flow.
                return Ok(None);
            }
            self.introduce_thread(&name, room).await?;
            self.threads.insert(
                name.clone(),
                ThreadChannel {
                    room_id: room.id.clone(),
                    thread_ts: thread_ts.to_string(),
                },
            );
        }
        Ok(Some(name))
    }

    // ---- irc commands -----------------------------------------------

    async fn handle_command(&mut self, command: Command) -> Result<Option<SessionEnd>> {
        match command {
            Command::Quit => return Ok(Some(SessionEnd::ClientGone)),
            Command::Nick(nick) => {
                if nick != self.me.name {
                    self.conn
                        .numeric(
                            Reply::ErroneousNickname,
                            &[&nick],
                            &format!("Incorrect nickname, use {}", self.me.name),
                        )
                        .await?;
                }
            }
            Command::Ping(label) => {
                let server = self.conn.server.clone();
                self.conn
                    .send_raw(&format!(":{server} PONG {server} :{label}"))
                    .await?;
            }
            Command::Pong => {}
            Command::Join(channels) => {
                for channel in channels {
                    self.join_channel(&channel).await?;
                }
            }
            Command::Part(channels) => {
                for channel in channels {
                    self.parted.insert(channel.clone());
                    self.joined.remove(&channel);
                    self.threads.remove(&channel);
                }
            }
            Command::Privmsg { target, text } | Command::Notice { target, text } => {
                if let Some(slash) = Command::parse_slash(&target, &text) {
                    return Box::pin(self.handle_command(slash)).await;
                }
                if let Some(action) = text.strip_prefix("/me ") {
                    let wire = irc::wrap_action(action);
                    self.send_to_target(&target, &wire).await?;
                } else {
                    self.send_to_target(&target, &text).await?;
                }
            }
            Command::Topic { target, topic } => self.handle_topic(&target, topic).await?,
            Command::List => self.handle_list().await?,
            Command::Who(target) => self.handle_who(target.as_deref()).await?,
            Command::Whois(nick) => self.handle_whois(&nick).await?,
            Command::Names(target) => self.handle_names(target.as_deref()).await?,
            Command::Mode { target } => {
                if target.starts_with('#') || target.starts_with('&') {
                    self.conn
                        .numeric(Reply::ChannelModeIs, &[&target, "+t"], "")
                        .await?;
                }
            }
            Command::Away(message) => {
                let away = message.is_some();
                match self.session.away(away).await {
                    Ok(()) => {
                        let reply = if away { Reply::NowAway } else { Reply::UnAway };
                        self.conn.numeric(reply, &[], "Away status changed").await?;
                    }
                    Err(err) => self.conn.notice(&format!("Away failed: {err}")).await?,
                }
            }
            Command::Userhost(nicks) => {
                let reply = nicks
                    .iter()
                    .map(|nick| format!("{nick}=+{nick}@slack"))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.conn.numeric(Reply::UserHost, &[], &reply).await?;
            }
            Command::Kick { channel, user } => {
                let Some(room) = self.resolve_channel(&channel).await? else {
                    return Ok(None);
                };
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                if let Err(err) = self.session.kick(&room.id, &target.id).await {
                    self.conn.notice(&format!("Kick failed: {err}")).await?;
                }
            }
            Command::Invite { user, channel } => {
                let Some(room) = self.resolve_channel(&channel).await? else {
                    return Ok(None);
                };
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                if let Err(err) = self.session.invite(&room.id, &target.id).await {
                    self.conn.notice(&format!("Invite failed: {err}")).await?;
                }
            }
            Command::SendFile { target, path } => self.handle_sendfile(&target, &path).await?,
            Command::Annoy { user, minutes } => {
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                let minutes = minutes.unwrap_or(ANNOY_DEFAULT_MINUTES).abs();
                self.rules
                    .annoy
                    .insert(target.id.clone(), now_epoch() + minutes * 60);
                self.conn
                    .notice(&format!("Will annoy {user} for {minutes} minutes"))
                    .await?;
                self.save_status().await;
            }
            Command::DropAnnoy(user) => {
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                self.rules.annoy.remove(&target.id);
                self.conn.notice(&format!("No longer annoying {user}")).await?;
                self.save_status().await;
            }
            Command::ListAnnoy => {
                if self.rules.annoy.is_empty() {
                    self.conn.notice("Not annoying anyone").await?;
                }
                let entries: Vec<(String, i64)> = self
                    .rules
                    .annoy
                    .iter()
                    .map(|(id, expiry)| (id.clone(), *expiry))
                    .collect();
                for (id, expiry) in entries {
                    let nick = self.session.nick_of(&id).await;
                    let left = (expiry - now_epoch()).max(0) / 60;
                    self.conn
                        .notice(&format!("Annoying {nick} for another {left} minutes"))
                        .await?;
                }
            }
            Command::Autoreact {
                user,
                probability,
                reaction,
                minutes,
            } => {
                if !(0.0..=1.0).contains(&probability) {
                    self.conn
                        .notice("Probability must be between 0 and 1")
                        .await?;
                    return Ok(None);
                }
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                let reaction = reaction
                    .unwrap_or_else(|| AUTOREACT_DEFAULT_REACTION.to_string())
                    .trim_matches(':')
                    .to_string();
                let minutes = minutes.unwrap_or(AUTOREACT_DEFAULT_MINUTES).abs();
                self.rules
                    .autoreact
                    .entry(target.id.clone())
                    .or_default()
                    .push(AutoreactRule {
                        room: None,
                        probability,
                        reaction: reaction.clone(),
                        expires: now_epoch() + minutes * 60,
                    });
                self.conn
                    .notice(&format!(
                        "Will react with :{reaction}: to {user} (p={probability}) for {minutes} minutes"
                    ))
                    .await?;
                self.save_status().await;
            }
            Command::DropAutoreact(user) => {
                let Some(target) = self.resolve_user(&user).await? else {
                    return Ok(None);
                };
                self.rules.autoreact.remove(&target.id);
                self.conn
                    .notice(&format!("No longer reacting to {user}"))
                    .await?;
                self.save_status().await;
            }
            Command::ListAutoreact => {
                if self.rules.autoreact.is_empty() {
                    self.conn.notice("No autoreact rules").await?;
                }
                let entries: Vec<(String, Vec<AutoreactRule>)> = self
                    .rules
                    .autoreact
                    .iter()
                    .map(|(id, rules)| (id.clone(), rules.clone()))
                    .collect();
                for (id, rules) in entries {
                    let nick = self.session.nick_of(&id).await;
                    for rule in rules {
                        let left = (rule.expires - now_epoch()).max(0) / 60;
                        self.conn
                            .notice(&format!(
                                "Reacting with :{}: to {nick} (p={}) for another {left} minutes",
                                rule.reaction, rule.probability
                            ))
                            .await?;
                    }
                }
            }
            Command::NeedMoreParams(command) => {
                self.conn
                    .numeric(Reply::NeedMoreParams, &[&command], "Not enough parameters")
                    .await?;
            }
            Command::Unknown(command) => {
                self.conn
                    .numeric(Reply::UnknownCommand, &[&command], "Unknown command")
                    .await?;
            }
        }
        Ok(None)
    }

    async fn join_channel(&mut self, channel: &str) -> Result<()> {
        self.parted.remove(channel);
        if let Some(room_id) = self.mpim_rooms.get(channel).cloned() {
            if let Ok(room) = self.session.get_room(&room_id).await {
                self.introduce_channel(channel, room.as_ref()).await?;
                let backlog = self.collect_room_backlog(room.as_ref()).await;
                for message in backlog {
                    self.handle_message(&message, "", true).await?;
                }
            }
            return Ok(());
        }
        let Some(name) = channel.strip_prefix('#') else {
            self.conn
                .numeric(Reply::NoSuchChannel, &[channel], "No such channel")
                .await?;
            return Ok(());
        };
        let Some(room) = self.session.get_room_by_name(name).await else {
            self.conn
                .numeric(
                    Reply::NoSuchChannel,
                    &[channel],
                    &format!("Unable to find channel: {name}"),
                )
                .await?;
            return Ok(());
        };
        if !room.is_member {
            if let Err(err) = self.session.join(&room.id).await {
                self.conn
                    .numeric(
                        Reply::NoSuchChannel,
                        &[channel],
                        &format!("Unable to join channel: {err}"),
                    )
                    .await?;
                return Ok(());
            }
        }
        self.introduce_channel(channel, room.as_ref()).await?;
        let backlog = self.collect_room_backlog(room.as_ref()).await;
        for message in backlog {
            self.handle_message(&message, "", true).await?;
        }
        Ok(())
    }

    /// History since the cursor for a single room, used on join so a
    /// channel that was queueing messages catches up.
    async fn collect_room_backlog(&mut self, room: &Room) -> Vec<MessageEvent> {
        let oldest = self
            .last_seen
            .get(&room.id)
            .cloned()
            .unwrap_or_else(fallback_oldest);
        match self.session.history(&room.id, &oldest, HISTORY_LIMIT).await {
            Ok(messages) => messages,
            Err(err) => {
                debug!("join-time backfill for {} failed: {err}", room.id);
                Vec::new()
            }
        }
    }

    async fn send_to_target(&mut self, target: &str, text: &str) -> Result<()> {
        let (room_id, thread_ts) = if let Some(thread) = self.threads.get(target) {
            (thread.room_id.clone(), Some(thread.thread_ts.clone()))
        } else if let Some(room_id) = self.mpim_rooms.get(target) {
            (room_id.clone(), None)
        } else if let Some(name) = target.strip_prefix('#') {
            match self.session.get_room_by_name(name).await {
                Some(room) => (room.id.clone(), None),
                None => {
                    self.conn
                        .numeric(
                            Reply::NoSuchChannel,
                            &[target],
                            &format!("Unknown channel {target}"),
                        )
                        .await?;
                    return Ok(());
                }
            }
        } else if target.starts_with('&') {
            self.conn
                .numeric(Reply::NoSuchChannel, &[target], "Unknown conversation")
                .await?;
            return Ok(());
        } else {
            let Some(user) = self.session.get_user_by_name(target).await else {
                self.conn
                    .numeric(
                        Reply::NoSuchNick,
                        &[target],
                        &format!("Unknown user {target}"),
                    )
                    .await?;
                return Ok(());
            };
            match self.session.im_with(&user.id).await {
                Ok(room) => (room.id.clone(), None),
                Err(err) => {
                    self.conn
                        .notice(&format!("Cannot open a conversation with {target}: {err}"))
                        .await?;
                    return Ok(());
                }
            }
        };

        let (text, action) = match irc::strip_action(text) {
            Some(body) => (body.to_string(), true),
            None => (text.to_string(), false),
        };

        let wire = self.outgoing_text(&room_id, &text).await;
        let wire = if action {
            format!("_{wire}_")
        } else {
            wire
        };

        match self.session.post(&room_id, &wire, thread_ts.as_deref()).await {
            Ok(ts) => self.advance_cursor(&room_id, &ts),
            Err(err) => {
                self.conn
                    .notice(&format!("Message not delivered: {err}"))
                    .await?
            }
        }
        Ok(())
    }

    /// Reverse translation for an outgoing message: member nicks and
    /// channel names become Slack ids.
    async fn outgoing_text(&self, room_id: &str, text: &str) -> String {
        let mut members = HashMap::new();
        if let Ok(ids) = self.session.members(room_id).await {
            for id in ids.iter() {
                if let Ok(user) = self.session.get_user(id).await {
                    members.insert(user.name.clone(), user.id.clone());
                }
            }
        }
        let mut channels = HashMap::new();
        for room in self.session.rooms_snapshot().await {
            if room.kind() == RoomKind::Channel {
                channels.insert(room.display_name().to_string(), room.id.clone());
            }
        }
        parser::irc_to_slack(text, &members, &channels)
    }

    async fn handle_topic(&mut self, target: &str, topic: Option<String>) -> Result<()> {
        let Some(room) = self.resolve_channel(target).await? else {
            return Ok(());
        };
        match topic {
            Some(topic) => {
                if let Err(err) = self.session.set_topic(&room.id, &topic).await {
                    self.conn
                        .notice(&format!("Unable to set topic: {err}"))
                        .await?;
                }
            }
            None => {
                let rendered = self.render_topic(room.real_topic()).await;
                self.conn.numeric(Reply::Topic, &[target], &rendered).await?;
            }
        }
        Ok(())
    }

    async fn handle_list(&mut self) -> Result<()> {
        let _ = self.session.prefetch_rooms().await;
        let mut rooms = self.session.rooms_snapshot().await;
        rooms.sort_by(|a, b| a.display_name().cmp(b.display_name()));
        for room in rooms {
            if room.kind() != RoomKind::Channel {
                continue;
            }
            let name = format!("#{}", room.display_name());
            let topic = self.render_topic(room.real_topic()).await;
            self.conn
                .numeric(Reply::List, &[&name, &room.num_members.to_string()], &topic)
                .await?;
        }
        self.conn.numeric(Reply::ListEnd, &[], "End of LIST").await?;
        Ok(())
    }

    async fn handle_who(&mut self, target: Option<&str>) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        let server = self.conn.server.clone();
        if let Some(name) = target.strip_prefix('#') {
            if let Some(room) = self.session.get_room_by_name(name).await {
                if let Ok(ids) = self.session.members(&room.id).await {
                    for id in ids.iter() {
                        let Ok(user) = self.session.get_user(id).await else {
                            continue;
                        };
                        if user.deleted {
                            continue;
                        }
                        self.conn
                            .numeric(
                                Reply::WhoReply,
                                &[target, &user.name, "127.0.0.1", &server, &user.name, "H"],
                                &format!("0 {}", user.real_name()),
                            )
                            .await?;
                    }
                }
            }
        } else if let Some(user) = self.session.get_user_by_name(target).await {
            self.conn
                .numeric(
                    Reply::WhoReply,
                    &[target, &user.name, "127.0.0.1", &server, &user.name, "H"],
                    &format!("0 {}", user.real_name()),
                )
                .await?;
        }
        self.conn
            .numeric(Reply::EndOfWho, &[target], "End of WHO list")
            .await?;
        Ok(())
    }

    async fn handle_whois(&mut self, nick: &str) -> Result<()> {
        if nick.contains('*') {
            self.conn
                .numeric(Reply::UnknownCommand, &["WHOIS"], "Wildcards are not supported")
                .await?;
            return Ok(());
        }
        let Some(user) = self.session.get_user_by_name(nick).await else {
            self.conn
                .numeric(Reply::NoSuchNick, &[nick], &format!("Unknown user {nick}"))
                .await?;
            return Ok(());
        };
        let server = self.conn.server.clone();
        self.conn
            .numeric(
                Reply::WhoisUser,
                &[nick, &user.name, "slack", "*"],
                user.real_name(),
            )
            .await?;
        if let Some(email) = &user.profile.email {
            self.conn
                .numeric(
                    Reply::WhoisUser,
                    &[nick, &user.name, "slack", "*"],
                    &format!("email: {email}"),
                )
                .await?;
        }
        self.conn
            .numeric(Reply::WhoisServer, &[nick, &server], "slackirc")
            .await?;
        self.conn
            .numeric(Reply::WhoisIdle, &[nick, "0"], "seconds idle")
            .await?;
        if self.session.presence_of(&user.id).await == crate::slack::Presence::Away {
            self.conn.numeric(Reply::Away, &[nick], "away").await?;
        }
        let mut shared: Vec<String> = Vec::new();
        for room in self.session.rooms_snapshot().await {
            if room.kind() != RoomKind::Channel {
                continue;
            }
            let name = format!("#{}", room.display_name());
            if self.joined.contains(&name) {
                shared.push(name);
            }
        }
        if !shared.is_empty() {
            shared.sort();
            self.conn
                .numeric(Reply::WhoisChannels, &[nick], &shared.join(" "))
                .await?;
        }
        self.conn
            .numeric(Reply::EndOfWhois, &[nick], "End of WHOIS list")
            .await?;
        Ok(())
    }

    async fn handle_names(&mut self, target: Option<&str>) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        let room = if let Some(room_id) = self.mpim_rooms.get(target).cloned() {
            self.session.get_room(&room_id).await.ok()
        } else {
            match target.strip_prefix('#') {
                Some(name) => self.session.get_room_by_name(name).await,
                None => None,
            }
        };
        let Some(room) = room else {
            self.conn
                .numeric(Reply::NoSuchChannel, &[target], "No such channel")
                .await?;
            return Ok(());
        };
        let (nicks, admins) = self.member_nicks(&room.id).await;
        let mut names: Vec<String> = nicks
            .iter()
            .map(|nick| {
                if admins.contains(nick) {
                    format!("@{nick}")
                } else {
                    nick.clone()
                }
            })
            .collect();
        names.sort();
        self.conn
            .numeric(Reply::NamReply, &["=", target], &names.join(" "))
            .await?;
        self.conn
            .numeric(Reply::EndOfNames, &[target], "End of NAMES list")
            .await?;
        Ok(())
    }

    /// The upload runs detached so a multi-MB file cannot stall the
    /// loop; completion comes back as a NOTICE.
    async fn handle_sendfile(&mut self, target: &str, path: &str) -> Result<()> {
        let (room_id, thread_ts) = if let Some(thread) = self.threads.get(target) {
            (thread.room_id.clone(), Some(thread.thread_ts.clone()))
        } else if let Some(room_id) = self.mpim_rooms.get(target) {
            (room_id.clone(), None)
        } else if let Some(name) = target.strip_prefix('#') {
            match self.session.get_room_by_name(name).await {
                Some(room) => (room.id.clone(), None),
                None => {
                    self.conn
                        .notice(&format!("Unable to find destination: {target}"))
                        .await?;
                    return Ok(());
                }
            }
        } else {
            match self.session.get_user_by_name(target).await {
                Some(user) => match self.session.im_with(&user.id).await {
                    Ok(room) => (room.id.clone(), None),
                    Err(err) => {
                        self.conn
                            .notice(&format!("Unable to find destination: {err}"))
                            .await?;
                        return Ok(());
                    }
                },
                None => {
                    self.conn
                        .notice(&format!("Unable to find destination: {target}"))
                        .await?;
                    return Ok(());
                }
            }
        };

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(err) => {
                self.conn
                    .notice(&format!("Unable to read {path}: {err}"))
                    .await?;
                return Ok(());
            }
        };
        let filename = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());

        let session = self.session.clone();
        let notices = self.notices_tx.clone();
        tokio::spawn(async move {
            let result = session
                .upload(&room_id, &filename, content, thread_ts.as_deref())
                .await;
            let notice = match result {
                Ok(()) => "Upload completed".to_string(),
                Err(err) => format!("Unable to send file: {err}"),
            };
            let _ = notices.send(notice).await;
        });
        Ok(())
    }

    async fn resolve_channel(&mut self, target: &str) -> Result<Option<Arc<Room>>> {
        if let Some(room_id) = self.mpim_rooms.get(target).cloned() {
            if let Ok(room) = self.session.get_room(&room_id).await {
                return Ok(Some(room));
            }
        }
        let name = target.strip_prefix('#').unwrap_or(target);
        match self.session.get_room_by_name(name).await {
            Some(room) => Ok(Some(room)),
            None => {
                self.conn
                    .numeric(
                        Reply::NoSuchChannel,
                        &[target],
                        &format!("Unknown channel: {target}"),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    async fn resolve_user(&mut self, nick: &str) -> Result<Option<Arc<crate::slack::User>>> {
        match self.session.get_user_by_name(nick).await {
            Some(user) => Ok(Some(user)),
            None => {
                self.conn
                    .numeric(Reply::NoSuchNick, &[nick], &format!("Unknown user: {nick}"))
                    .await?;
                Ok(None)
            }
        }
    }

    // ---- control socket and housekeeping ----------------------------

    async fn handle_control(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::SendMessage { target, text } => {
                match self.send_to_target(&target, &text).await {
                    Ok(()) => ControlResponse::success(),
                    Err(err) => ControlResponse::failure(err.to_string()),
                }
            }
            ControlRequest::SendFile { target, path } => {
                match self.handle_sendfile(&target, &path).await {
                    Ok(()) => ControlResponse::success(),
                    Err(err) => ControlResponse::failure(err.to_string()),
                }
            }
            ControlRequest::GetConfig => ControlResponse::with_config(self.config.public_summary()),
        }
    }

    async fn sweep_rules(&mut self) {
        let lapsed = self.rules.sweep(now_epoch());
        for user in &lapsed {
            let nick = self.session.nick_of(user).await;
            let _ = self
                .conn
                .notice(&format!("No longer annoying {nick}"))
                .await;
        }
        if !lapsed.is_empty() {
            self.save_status().await;
        }
    }

    async fn save_status(&self) {
        let Some(path) = &self.config.status_file else {
            return;
        };
        let mut yellers: Vec<String> = self.config.silenced_yellers.iter().cloned().collect();
        yellers.sort();
        let status = Status {
            version: state::SCHEMA_VERSION,
            last_seen: self.last_seen.clone(),
            annoy: self.rules.annoy.clone(),
            autoreact: self.rules.autoreact.clone(),
            silenced_yellers: yellers,
        };
        state::save(path, &status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_dedups_older_and_equal_ts() {
        assert!(past_cursor(None, "1.0"));
        assert!(past_cursor(Some("1.0"), "1.000001"));
        assert!(!past_cursor(Some("1.000001"), "1.000001"));
        assert!(!past_cursor(Some("2.0"), "1.999999"));
    }

    #[test]
    fn thread_names_are_stable_and_collision_free() {
        let taken = HashSet::new();
        let a = thread_channel_name("#general", "C01", "1700000000.000100", &taken);
        let b = thread_channel_name("#general", "C01", "1700000000.000100", &taken);
        assert_eq!(a, b);
        assert!(a.starts_with("#general-0x"));

        let other = thread_channel_name("#general", "C01", "1700000000.000200", &taken);
        assert_ne!(a, other);

        let mut taken = HashSet::new();
        taken.insert(a.clone());
        let widened = thread_channel_name("#general", "C01", "1700000000.000100", &taken);
        assert_ne!(widened, a);
        assert!(widened.len() > a.len());
    }

    #[test]
    fn annoy_rule_expires_exactly_once() {
        let mut rules = RuleTables::default();
        rules.annoy.insert("U07".to_string(), 1000);
        assert_eq!(rules.annoy_state("U07", 999), AnnoyState::Active);
        assert_eq!(rules.annoy_state("U07", 1000), AnnoyState::Active);
        assert_eq!(rules.annoy_state("U07", 1001), AnnoyState::JustExpired);
        assert_eq!(rules.annoy_state("U07", 1002), AnnoyState::Absent);
    }

    #[test]
    fn annoy_echo_is_debounced() {
        let mut rules = RuleTables::default();
        let start = Instant::now();
        assert!(rules.annoy_may_echo("U07", start));
        assert!(!rules.annoy_may_echo("U07", start + Duration::from_secs(1)));
        assert!(rules.annoy_may_echo("U07", start + Duration::from_secs(4)));
    }

    #[test]
    fn autoreact_scoping_and_expiry() {
        let mut rules = RuleTables::default();
        rules.autoreact.insert(
            "U08".to_string(),
            vec![
                AutoreactRule {
                    room: None,
                    probability: 1.0,
                    reaction: "+1".to_string(),
                    expires: 2000,
                },
                AutoreactRule {
                    room: Some("C05".to_string()),
                    probability: 1.0,
                    reaction: "fire".to_string(),
                    expires: 2000,
                },
            ],
        );

        let anywhere = rules.autoreact_candidates("U08", "C01", 1500);
        assert_eq!(anywhere.len(), 1);
        assert_eq!(anywhere[0].reaction, "+1");

        let scoped = rules.autoreact_candidates("U08", "C05", 1500);
        assert_eq!(scoped.len(), 2);

        assert!(rules.autoreact_candidates("U08", "C05", 2001).is_empty());
        assert!(rules.autoreact_candidates("U09", "C05", 1500).is_empty());
    }

    #[test]
    fn sweep_reports_lapsed_annoy_targets() {
        let mut rules = RuleTables::default();
        rules.annoy.insert("U07".to_string(), 1000);
        rules.annoy.insert("U08".to_string(), 3000);
        rules.autoreact.insert(
            "U09".to_string(),
            vec![AutoreactRule {
                room: None,
                probability: 0.5,
                reaction: "+1".to_string(),
                expires: 1000,
            }],
        );

        let lapsed = rules.sweep(2000);
        assert_eq!(lapsed, vec!["U07".to_string()]);
        assert!(rules.annoy.contains_key("U08"));
        assert!(rules.autoreact.is_empty());
    }

    #[test]
    fn fallback_oldest_is_a_day_back() {
        let oldest = fallback_oldest();
        let (secs, _) = crate::slack::ts_value(&oldest);
        let now = now_epoch();
        assert!(now - secs >= HISTORY_FALLBACK_SECS - 2);
        assert!(now - secs <= HISTORY_FALLBACK_SECS + 2);
    }

    #[test]
    fn overflow_files_use_room_and_ts() {
        let dir = tempfile::tempdir().unwrap();
        let reference =
            store_overflow(dir.path(), "general", "1700000000.000100", "big text").unwrap();
        assert!(reference.starts_with("file://"));
        assert!(reference.ends_with("general-1700000000.000100.txt"));
        let stored =
            std::fs::read_to_string(dir.path().join("general-1700000000.000100.txt")).unwrap();
        assert_eq!(stored, "big text");
    }
}
