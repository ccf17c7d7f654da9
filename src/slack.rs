//! The Slack side of the bridge: a typed session over the Web API and
//! the RTM socket, with id-keyed caches for users and rooms, O(1) name
//! indexes, and singleflight refresh on lookup misses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

pub mod events;
pub mod transport;

pub use events::{MessageEvent, RtmEvent};
pub use transport::{RtmFrame, RtmHandle, SlackError, Transport, spawn_rtm};

use events::FileInfo;

const PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Profile {
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    /// Login name; stable within a session and used as the IRC nick.
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub tz_offset: i64,
    #[serde(default)]
    pub profile: Profile,
}

impl User {
    pub fn real_name(&self) -> &str {
        if !self.profile.real_name.is_empty() {
            &self.profile.real_name
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Active,
    Away,
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Topic {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Channel,
    Mpim,
    Im,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub name_normalized: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub num_members: u32,
    /// IM peer.
    pub user: Option<String>,
    #[serde(default)]
    pub topic: Topic,
    #[serde(default)]
    pub purpose: Topic,
    pub last_read: Option<String>,
}

impl Room {
    pub fn kind(&self) -> RoomKind {
        if self.is_im {
            RoomKind::Im
        } else if self.is_mpim {
            RoomKind::Mpim
        } else {
            RoomKind::Channel
        }
    }

    pub fn display_name(&self) -> &str {
        if !self.name_normalized.is_empty() {
            &self.name_normalized
        } else {
            &self.name
        }
    }

    /// The topic, falling back to the purpose when the topic is unset.
    pub fn real_topic(&self) -> &str {
        if !self.topic.value.is_empty() {
            &self.topic.value
        } else {
            &self.purpose.value
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub user_id: String,
    pub name: String,
    pub team: String,
}

/// Parse a `sec.micro` Slack timestamp for ordering. Unparseable input
/// sorts first so a bad cursor never suppresses delivery.
pub fn ts_value(ts: &str) -> (i64, u32) {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
    (
        secs.parse().unwrap_or(0),
        micros.parse().unwrap_or(0),
    )
}

pub fn ts_newer(a: &str, b: &str) -> bool {
    ts_value(a) > ts_value(b)
}

pub struct Session {
    transport: Arc<Transport>,
    users: RwLock<HashMap<String, Arc<User>>>,
    user_names: RwLock<HashMap<String, String>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    room_names: RwLock<HashMap<String, String>>,
    members: RwLock<HashMap<String, Arc<HashSet<String>>>>,
    presence: RwLock<HashMap<String, Presence>>,
    /// Per-key guards so a burst of misses issues one REST call.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    login: RwLock<Option<SelfInfo>>,
    rtm_out: RwLock<Option<mpsc::Sender<Value>>>,
}

impl Session {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            users: RwLock::new(HashMap::new()),
            user_names: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            room_names: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            login: RwLock::new(None),
            rtm_out: RwLock::new(None),
        }
    }

    pub async fn set_rtm_out(&self, tx: mpsc::Sender<Value>) {
        *self.rtm_out.write().await = Some(tx);
    }

    pub async fn login(&self) -> Result<SelfInfo, SlackError> {
        let value = self.transport.call("auth.test", &[]).await?;
        let info = SelfInfo {
            user_id: value
                .get("user_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: value
                .get("user")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            team: value
                .get("team")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        if info.user_id.is_empty() {
            return Err(SlackError::Transport("auth.test returned no user_id".into()));
        }
        *self.login.write().await = Some(info.clone());
        Ok(info)
    }

    pub async fn self_info(&self) -> Option<SelfInfo> {
        self.login.read().await.clone()
    }

    async fn singleflight(&self, key: String) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn insert_user(&self, user: User) -> Arc<User> {
        let user = Arc::new(user);
        self.user_names
            .write()
            .await
            .insert(user.name.clone(), user.id.clone());
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        user
    }

    async fn insert_room(&self, room: Room) -> Arc<Room> {
        let room = Arc::new(room);
        if !room.display_name().is_empty() {
            self.room_names
                .write()
                .await
                .insert(room.display_name().to_string(), room.id.clone());
        }
        self.rooms
            .write()
            .await
            .insert(room.id.clone(), room.clone());
        room
    }

    /// Batch-load the full user directory rather than requesting each
    /// profile on its own.
    pub async fn prefetch_users(&self) -> Result<(), SlackError> {
        let _guard = self.singleflight("users.list".to_string()).await;
        let mut cursor = String::new();
        loop {
            let mut form = vec![("limit", PAGE_SIZE.to_string())];
            if !cursor.is_empty() {
                form.push(("cursor", cursor.clone()));
            }
            let value = self.transport.call("users.list", &form).await?;
            for member in value
                .get("members")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                match serde_json::from_value::<User>(member.clone()) {
                    Ok(user) => {
                        self.insert_user(user).await;
                    }
                    Err(err) => debug!("skipping undecodable user record: {err}"),
                }
            }
            cursor = next_cursor(&value);
            if cursor.is_empty() {
                return Ok(());
            }
        }
    }

    pub async fn prefetch_rooms(&self) -> Result<(), SlackError> {
        let _guard = self.singleflight("conversations.list".to_string()).await;
        let mut cursor = String::new();
        loop {
            let mut form = vec![
                (
                    "types",
                    "public_channel,private_channel,mpim,im".to_string(),
                ),
                ("exclude_archived", "true".to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if !cursor.is_empty() {
                form.push(("cursor", cursor.clone()));
            }
            let value = self.transport.call("conversations.list", &form).await?;
            for channel in value
                .get("channels")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                match serde_json::from_value::<Room>(channel.clone()) {
                    Ok(room) => {
                        self.insert_room(room).await;
                    }
                    Err(err) => debug!("skipping undecodable room record: {err}"),
                }
            }
            cursor = next_cursor(&value);
            if cursor.is_empty() {
                return Ok(());
            }
        }
    }

    pub async fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn get_user(&self, id: &str) -> Result<Arc<User>, SlackError> {
        if let Some(user) = self.users.read().await.get(id) {
            return Ok(user.clone());
        }
        let _guard = self.singleflight(format!("user:{id}")).await;
        if let Some(user) = self.users.read().await.get(id) {
            return Ok(user.clone());
        }
        debug!("cache miss for user {id}, refreshing");
        let value = self
            .transport
            .call("users.info", &[("user", id.to_string())])
            .await?;
        let user: User = serde_json::from_value(value.get("user").cloned().unwrap_or_default())
            .map_err(|err| SlackError::Transport(format!("users.info undecodable: {err}")))?;
        Ok(self.insert_user(user).await)
    }

    /// Nick of a user id, best effort: falls back to the id itself so
    /// rendering never blocks on a failed lookup.
    pub async fn nick_of(&self, id: &str) -> String {
        match self.get_user(id).await {
            Ok(user) => user.name.clone(),
            Err(err) => {
                warn!("no nick for {id}: {err}");
                id.to_string()
            }
        }
    }

    pub async fn get_user_by_name(&self, name: &str) -> Option<Arc<User>> {
        let id = self.user_names.read().await.get(name).cloned();
        if let Some(id) = id {
            return self.users.read().await.get(&id).cloned();
        }
        // The directory may be stale; refresh once.
        if self.prefetch_users().await.is_err() {
            return None;
        }
        let id = self.user_names.read().await.get(name).cloned()?;
        self.users.read().await.get(&id).cloned()
    }

    pub async fn get_room(&self, id: &str) -> Result<Arc<Room>, SlackError> {
        if let Some(room) = self.rooms.read().await.get(id) {
            return Ok(room.clone());
        }
        let _guard = self.singleflight(format!("room:{id}")).await;
        if let Some(room) = self.rooms.read().await.get(id) {
            return Ok(room.clone());
        }
        debug!("cache miss for room {id}, refreshing");
        let value = self
            .transport
            .call("conversations.info", &[("channel", id.to_string())])
            .await?;
        let room: Room = serde_json::from_value(value.get("channel").cloned().unwrap_or_default())
            .map_err(|err| SlackError::Transport(format!("conversations.info undecodable: {err}")))?;
        Ok(self.insert_room(room).await)
    }

    pub async fn get_room_by_name(&self, name: &str) -> Option<Arc<Room>> {
        let id = self.room_names.read().await.get(name).cloned();
        if let Some(id) = id {
            return self.rooms.read().await.get(&id).cloned();
        }
        if self.prefetch_rooms().await.is_err() {
            return None;
        }
        let id = self.room_names.read().await.get(name).cloned()?;
        self.rooms.read().await.get(&id).cloned()
    }

    /// The IM room for a user, opening one if none exists yet.
    pub async fn im_with(&self, user_id: &str) -> Result<Arc<Room>, SlackError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms
                .values()
                .find(|r| r.is_im && r.user.as_deref() == Some(user_id))
            {
                return Ok(room.clone());
            }
        }
        let value = self
            .transport
            .call("conversations.open", &[("users", user_id.to_string())])
            .await?;
        let room: Room = serde_json::from_value(value.get("channel").cloned().unwrap_or_default())
            .map_err(|err| SlackError::Transport(format!("conversations.open undecodable: {err}")))?;
        Ok(self.insert_room(room).await)
    }

    pub async fn members(&self, room_id: &str) -> Result<Arc<HashSet<String>>, SlackError> {
        if let Some(members) = self.members.read().await.get(room_id) {
            return Ok(members.clone());
        }
        let _guard = self.singleflight(format!("members:{room_id}")).await;
        if let Some(members) = self.members.read().await.get(room_id) {
            return Ok(members.clone());
        }
        let mut collected = HashSet::new();
        let mut cursor = String::new();
        loop {
            let mut form = vec![
                ("channel", room_id.to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if !cursor.is_empty() {
                form.push(("cursor", cursor.clone()));
            }
            let value = self.transport.call("conversations.members", &form).await?;
            for id in value
                .get("members")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                collected.insert(id.to_string());
            }
            cursor = next_cursor(&value);
            if cursor.is_empty() {
                break;
            }
        }
        let members = Arc::new(collected);
        self.members
            .write()
            .await
            .insert(room_id.to_string(), members.clone());
        Ok(members)
    }

    pub async fn evict_user(&self, id: &str) {
        if let Some(user) = self.users.write().await.remove(id) {
            self.user_names.write().await.remove(&user.name);
        }
    }

    pub async fn upsert_user(&self, user: User) {
        self.evict_user(&user.id).await;
        self.insert_user(user).await;
    }

    pub async fn evict_room(&self, id: &str) {
        if let Some(room) = self.rooms.write().await.remove(id) {
            self.room_names.write().await.remove(room.display_name());
        }
        self.members.write().await.remove(id);
    }

    pub async fn evict_members(&self, room_id: &str) {
        self.members.write().await.remove(room_id);
    }

    pub async fn set_presence(&self, user_id: &str, presence: Presence) {
        self.presence
            .write()
            .await
            .insert(user_id.to_string(), presence);
    }

    pub async fn presence_of(&self, user_id: &str) -> Presence {
        self.presence
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(Presence::Unknown)
    }

    /// Join a room on Slack; succeeding when already joined.
    pub async fn join(&self, room_id: &str) -> Result<(), SlackError> {
        match self
            .transport
            .call("conversations.join", &[("channel", room_id.to_string())])
            .await
        {
            Ok(_) => {
                self.evict_room(room_id).await;
                Ok(())
            }
            Err(err) if err.code() == "already_in_channel" => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Leave a room on Slack; succeeding when already out.
    pub async fn leave(&self, room_id: &str) -> Result<(), SlackError> {
        match self
            .transport
            .call("conversations.leave", &[("channel", room_id.to_string())])
            .await
        {
            Ok(_) => {
                self.evict_room(room_id).await;
                Ok(())
            }
            Err(err) if err.code() == "not_in_channel" => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Post a message, returning the ts Slack assigned to it.
    pub async fn post(
        &self,
        room_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, SlackError> {
        let mut form = vec![
            ("channel", room_id.to_string()),
            ("text", text.to_string()),
            ("as_user", "true".to_string()),
        ];
        if let Some(ts) = thread_ts {
            form.push(("thread_ts", ts.to_string()));
        }
        let value = self.transport.call("chat.postMessage", &form).await?;
        value
            .get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SlackError::Transport("chat.postMessage returned no ts".into()))
    }

    pub async fn upload(
        &self,
        room_id: &str,
        filename: &str,
        content: Vec<u8>,
        thread_ts: Option<&str>,
    ) -> Result<(), SlackError> {
        let mut form = vec![
            ("channels", room_id.to_string()),
            ("filename", filename.to_string()),
        ];
        if let Some(ts) = thread_ts {
            form.push(("thread_ts", ts.to_string()));
        }
        self.transport
            .call_multipart("files.upload", &form, filename.to_string(), content)
            .await?;
        Ok(())
    }

    /// Paged history fetch, oldest first, bounded by `limit`. A failure
    /// after the first page yields what was fetched plus a warning.
    pub async fn history(
        &self,
        room_id: &str,
        oldest: &str,
        limit: usize,
    ) -> Result<Vec<MessageEvent>, SlackError> {
        let mut collected: Vec<MessageEvent> = Vec::new();
        let mut cursor = String::new();
        let mut first_page = true;

        while collected.len() < limit {
            let mut form = vec![
                ("channel", room_id.to_string()),
                ("oldest", oldest.to_string()),
                ("limit", PAGE_SIZE.min(limit - collected.len()).to_string()),
            ];
            if !cursor.is_empty() {
                form.push(("cursor", cursor.clone()));
            }
            let value = match self.transport.call("conversations.history", &form).await {
                Ok(value) => value,
                Err(err) if first_page => return Err(err),
                Err(err) => {
                    warn!("partial history for {room_id}: {err}");
                    break;
                }
            };
            first_page = false;

            for raw in value
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if !matches!(
                    raw.get("subtype").and_then(Value::as_str),
                    None | Some("file_share") | Some("me_message") | Some("thread_broadcast")
                ) {
                    continue;
                }
                let Some(mut message) =
                    serde_json::from_value::<MessageEvent>(raw.clone()).ok()
                else {
                    continue;
                };
                message.channel = room_id.to_string();
                message.action =
                    raw.get("subtype").and_then(Value::as_str) == Some("me_message");
                let Some(user) = message.user.as_deref() else {
                    continue;
                };
                if let Ok(user) = self.get_user(user).await {
                    if user.deleted {
                        continue;
                    }
                }
                collected.push(message);
                if collected.len() >= limit {
                    break;
                }
            }

            if !value.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
                break;
            }
            cursor = next_cursor(&value);
            if cursor.is_empty() {
                break;
            }
        }

        collected.sort_by(|a, b| ts_value(&a.ts).cmp(&ts_value(&b.ts)));
        Ok(collected)
    }

    pub async fn download_file(&self, url: &str) -> Result<Vec<u8>, SlackError> {
        self.transport.fetch(url).await
    }

    /// Best-effort read marker; network errors are logged and dropped.
    pub async fn mark(&self, room_id: &str, ts: &str) {
        if let Err(err) = self
            .transport
            .call(
                "conversations.mark",
                &[("channel", room_id.to_string()), ("ts", ts.to_string())],
            )
            .await
        {
            debug!("mark failed for {room_id}: {err}");
        }
    }

    /// Fire-and-forget typing indicator over the RTM socket.
    pub async fn typing(&self, room_id: &str) {
        let out = self.rtm_out.read().await.clone();
        if let Some(out) = out {
            let _ = out
                .send(serde_json::json!({"type": "typing", "channel": room_id}))
                .await;
        }
    }

    /// Add a reaction; repeats are idempotent per Slack semantics. Any
    /// error code that smells like a duplicate is swallowed, since the
    /// exact spelling has changed over the years.
    pub async fn react(&self, room_id: &str, ts: &str, name: &str) -> Result<(), SlackError> {
        match self
            .transport
            .call(
                "reactions.add",
                &[
                    ("channel", room_id.to_string()),
                    ("timestamp", ts.to_string()),
                    ("name", name.to_string()),
                ],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err.code().contains("already_reacted") || err.code().contains("duplicate") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn set_topic(&self, room_id: &str, topic: &str) -> Result<(), SlackError> {
        self.transport
            .call(
                "conversations.setTopic",
                &[
                    ("channel", room_id.to_string()),
                    ("topic", topic.to_string()),
                ],
            )
            .await?;
        self.evict_room(room_id).await;
        Ok(())
    }

    pub async fn away(&self, away: bool) -> Result<(), SlackError> {
        let presence = if away { "away" } else { "auto" };
        self.transport
            .call("users.setPresence", &[("presence", presence.to_string())])
            .await?;
        Ok(())
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<(), SlackError> {
        self.transport
            .call(
                "conversations.invite",
                &[
                    ("channel", room_id.to_string()),
                    ("users", user_id.to_string()),
                ],
            )
            .await?;
        self.evict_members(room_id).await;
        Ok(())
    }

    pub async fn kick(&self, room_id: &str, user_id: &str) -> Result<(), SlackError> {
        self.transport
            .call(
                "conversations.kick",
                &[
                    ("channel", room_id.to_string()),
                    ("user", user_id.to_string()),
                ],
            )
            .await?;
        self.evict_members(room_id).await;
        Ok(())
    }
}

fn next_cursor(value: &Value) -> String {
    value
        .pointer("/response_metadata/next_cursor")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Render the `[file upload]` trailer lines for a message's attachments.
pub fn file_trailer(files: &[FileInfo]) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str(&format!(
            "\n[file upload] {}\n{} {} bytes\n{}",
            file.name.as_deref().unwrap_or("unnamed"),
            file.mimetype.as_deref().unwrap_or("unknown"),
            file.size,
            file.url_private.as_deref().unwrap_or(""),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ts_ordering_is_numeric_not_lexicographic() {
        assert!(ts_newer("1700000000.000200", "1700000000.000100"));
        assert!(ts_newer("1700000001.000000", "1700000000.999999"));
        assert!(!ts_newer("99.5", "100.1"));
        assert!(!ts_newer("1.1", "1.1"));
    }

    #[test]
    fn unparseable_ts_sorts_first() {
        assert!(ts_newer("1.0", "garbage"));
    }

    #[test]
    fn room_kind_discrimination() {
        let decode = |v: Value| serde_json::from_value::<Room>(v).unwrap();
        let channel = decode(json!({"id": "C01", "name": "general", "is_member": true}));
        assert_eq!(channel.kind(), RoomKind::Channel);
        let mpim = decode(json!({"id": "G05", "name": "mpdm-a--b-1", "is_mpim": true}));
        assert_eq!(mpim.kind(), RoomKind::Mpim);
        let im = decode(json!({"id": "D07", "is_im": true, "user": "U02"}));
        assert_eq!(im.kind(), RoomKind::Im);
    }

    #[test]
    fn real_topic_falls_back_to_purpose() {
        let room: Room = serde_json::from_value(json!({
            "id": "C01",
            "name": "general",
            "topic": {"value": ""},
            "purpose": {"value": "the purpose"}
        }))
        .unwrap();
        assert_eq!(room.real_topic(), "the purpose");
    }

    #[test]
    fn user_decodes_with_missing_optionals() {
        let user: User = serde_json::from_value(json!({"id": "U01", "name": "bob"})).unwrap();
        assert!(!user.deleted);
        assert_eq!(user.real_name(), "bob");
    }

    #[test]
    fn file_trailer_lists_every_attachment() {
        let files: Vec<FileInfo> = serde_json::from_value(json!([
            {"name": "a.txt", "mimetype": "text/plain", "size": 5, "url_private": "https://a"},
            {"name": "b.png", "mimetype": "image/png", "size": 9, "url_private": "https://b"}
        ]))
        .unwrap();
        let trailer = file_trailer(&files);
        assert!(trailer.contains("[file upload] a.txt"));
        assert!(trailer.contains("image/png 9 bytes"));
        assert!(trailer.contains("https://b"));
    }

    #[tokio::test]
    async fn cache_insert_and_name_index_agree() {
        let session = Session::new(Arc::new(
            Transport::new("xoxb-test".to_string(), None).unwrap(),
        ));
        session
            .insert_user(
                serde_json::from_value(json!({"id": "U01", "name": "bob"})).unwrap(),
            )
            .await;
        assert_eq!(session.users.read().await.get("U01").unwrap().name, "bob");
        assert_eq!(
            session.user_names.read().await.get("bob").map(String::as_str),
            Some("U01")
        );
        session.evict_user("U01").await;
        assert!(session.users.read().await.get("U01").is_none());
        assert!(session.user_names.read().await.get("bob").is_none());
    }

    #[tokio::test]
    async fn presence_defaults_to_unknown() {
        let session = Session::new(Arc::new(
            Transport::new("xoxb-test".to_string(), None).unwrap(),
        ));
        assert_eq!(session.presence_of("U09").await, Presence::Unknown);
        session.set_presence("U09", Presence::Away).await;
        assert_eq!(session.presence_of("U09").await, Presence::Away);
    }
}
