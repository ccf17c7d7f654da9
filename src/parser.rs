//! Slack message markup: tokenizing `<...>` items and backtick fences
//! into typed spans, rendering spans to IRC-safe text, and the reverse
//! rewrite for outgoing IRC messages.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::emoji;

/// Order matters: `&amp;` must be restored last on the way out and
/// first on the way in, or already-escaped text gets double-mangled.
const ENTITY_SUBSTITUTIONS: [(&str, &str); 3] =
    [("&amp;", "&"), ("&gt;", ">"), ("&lt;", "<")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Text(String),
    /// A triple-backtick fenced block, fences removed.
    Pre(String),
    Mention { id: String, label: Option<String> },
    RoomMention { id: String, label: Option<String> },
    Special { key: String, label: Option<String> },
    Link { url: String, label: Option<String> },
}

fn unescape(text: &str) -> String {
    let mut out = text.to_string();
    for (entity, plain) in ENTITY_SUBSTITUTIONS {
        out = out.replace(entity, plain);
    }
    out
}

/// Split a message on ``` fences. Yields (block, is_preformatted) with
/// the fences removed; blocks alternate starting with normal text.
fn fence_blocks(msg: &str) -> Vec<(String, bool)> {
    let mut blocks = Vec::new();
    let mut rest = msg;
    let mut pre = false;
    while let Some(p) = rest.find("```") {
        blocks.push((rest[..p].to_string(), pre));
        pre = !pre;
        rest = &rest[p + 3..];
    }
    blocks.push((rest.to_string(), pre));
    blocks
}

/// Parse the inside of one `<...>` item (angle brackets removed).
fn parse_item(body: &str) -> Span {
    let (kind, payload) = match body.chars().next() {
        Some('!') => ('!', &body[1..]),
        Some('@') => ('@', &body[1..]),
        Some('#') => ('#', &body[1..]),
        _ => (' ', body),
    };
    let (value, label) = match payload.find('|') {
        Some(sep) => (
            payload[..sep].to_string(),
            Some(payload[sep + 1..].to_string()),
        ),
        None => (payload.to_string(), None),
    };
    match kind {
        '!' => Span::Special { key: value, label },
        '@' => Span::Mention { id: value, label },
        '#' => Span::RoomMention { id: value, label },
        _ => Span::Link { url: value, label },
    }
}

/// Scan a normal-text block for `<...>` items, yielding plain text and
/// parsed items interleaved. An unterminated `<` is treated as text.
fn scan_items(block: &str, out: &mut Vec<Span>) {
    let mut rest = block;
    loop {
        match rest.find('<') {
            None => break,
            Some(begin) => {
                if begin > 0 {
                    push_text(&rest[..begin], out);
                    rest = &rest[begin..];
                    continue;
                }
                match rest.find('>') {
                    None => break,
                    Some(end) => {
                        out.push(parse_item(&rest[1..end]));
                        rest = &rest[end + 1..];
                    }
                }
            }
        }
    }
    if !rest.is_empty() {
        push_text(rest, out);
    }
}

fn push_text(raw: &str, out: &mut Vec<Span>) {
    out.push(Span::Text(unescape(&emoji::emojize(raw))));
}

/// A preformatted block may carry `<url>` / `<url|label>` items (Slack
/// linkifies bare hostnames even inside fences) but no mentions; emoji
/// shortcodes are left alone there.
fn flatten_pre(block: &str) -> String {
    let mut out = String::new();
    let mut rest = block;
    loop {
        match rest.find('<') {
            None => break,
            Some(begin) => {
                if begin > 0 {
                    out.push_str(&rest[..begin]);
                    rest = &rest[begin..];
                    continue;
                }
                match rest.find('>') {
                    None => break,
                    Some(end) => {
                        match parse_item(&rest[1..end]) {
                            Span::Link { url, label } => out.push_str(&label.unwrap_or(url)),
                            // Anything else inside a fence is kept verbatim.
                            _ => out.push_str(&rest[..end + 1]),
                        }
                        rest = &rest[end + 1..];
                    }
                }
            }
        }
    }
    out.push_str(rest);
    unescape(&out)
}

/// Tokenize a raw Slack message into a flat span list.
pub fn tokenize(msg: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    for (block, pre) in fence_blocks(msg) {
        if pre {
            spans.push(Span::Pre(flatten_pre(&block)));
        } else {
            scan_items(&block, &mut spans);
        }
    }
    spans
}

/// Everything the renderer needs to know about the delivery target,
/// resolved ahead of time so rendering itself stays pure.
pub struct RenderCtx<'a> {
    /// Slack user id → nick, for every mention appearing in the spans.
    pub users: &'a HashMap<String, String>,
    /// Slack room id → channel name (without the `#`).
    pub rooms: &'a HashMap<String, String>,
    /// Nicks present in the IRC channel the message is delivered to.
    pub channel_members: &'a HashSet<String>,
    pub local_nick: &'a str,
    /// Sender or delivering room is in the silenced-yellers set.
    pub yell_silenced: bool,
    /// Fenced blocks above this many lines go to a file; 0 disables.
    pub formatted_max_lines: usize,
}

/// True when the link label is just the URL over again, possibly with a
/// single trailing slash on either side. Kept as a literal string
/// comparison; Slack labels URLs with near-copies of themselves.
fn label_is_url(label: &str, url: &str) -> bool {
    label == url
        || label.strip_suffix('/').map_or(false, |l| l == url)
        || url.strip_suffix('/').map_or(false, |u| u == label)
}

fn render_link(url: &str, label: Option<&str>) -> String {
    match label {
        None => url.to_string(),
        Some(l) if label_is_url(l, url) => url.to_string(),
        Some(l) if l.contains("://") => format!("LINK ({url})"),
        Some(l) => format!("{l} ({url})"),
    }
}

fn render_yell(key: &str, label: Option<&str>, ctx: &RenderCtx) -> String {
    match key {
        "here" | "channel" | "everyone" => {
            if ctx.yell_silenced {
                format!("yelling {key}")
            } else {
                format!("@{key} [{}]", ctx.local_nick)
            }
        }
        _ => match label {
            Some(l) => l.to_string(),
            None => format!("@{key}"),
        },
    }
}

/// Render spans to IRC text. `overflow` is called with an oversized
/// preformatted block and returns the reference to deliver instead, or
/// `None` to deliver it inline after all.
pub fn render_to_irc(
    spans: &[Span],
    ctx: &RenderCtx,
    mut overflow: impl FnMut(&str) -> Option<String>,
) -> String {
    let mut out = String::new();
    for span in spans {
        match span {
            Span::Text(t) => out.push_str(t),
            Span::Pre(t) => {
                let lines = t.matches('\n').count();
                let stored = if ctx.formatted_max_lines > 0 && lines > ctx.formatted_max_lines {
                    overflow(t)
                } else {
                    None
                };
                match stored {
                    Some(reference) => {
                        out.push_str(&format!("\n=== preformatted text at {reference}\n"))
                    }
                    None => out.push_str(&format!("```{t}```")),
                }
            }
            Span::Mention { id, label } => match ctx.users.get(id) {
                Some(nick) if ctx.channel_members.contains(nick) => {
                    out.push('@');
                    out.push_str(nick);
                }
                Some(nick) => out.push_str(nick),
                None => out.push_str(label.as_deref().unwrap_or(id)),
            },
            Span::RoomMention { id, .. } => {
                out.push('#');
                out.push_str(ctx.rooms.get(id).map(String::as_str).unwrap_or(id));
            }
            Span::Special { key, label } => {
                out.push_str(&render_yell(key, label.as_deref(), ctx))
            }
            Span::Link { url, label } => out.push_str(&render_link(url, label.as_deref())),
        }
    }
    out
}

static OUTGOING_NICK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s)@([A-Za-z0-9][A-Za-z0-9_.-]*)").expect("valid nick regex"));
static OUTGOING_LEADING_NICK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][A-Za-z0-9_.-]*):").expect("valid leading nick regex"));
static OUTGOING_CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s)#([a-z0-9][a-z0-9_-]*)").expect("valid channel regex"));

/// Rewrite an outgoing IRC message into Slack's wire syntax: entity
/// escapes, `<!here>`-style yells, `<@id>` mentions for in-room nicks
/// and `<#id|name>` for known channels. Anything unrecognized passes
/// through verbatim; Slack linkifies URLs on its own.
pub fn irc_to_slack(
    text: &str,
    members: &HashMap<String, String>,
    channels: &HashMap<String, String>,
) -> String {
    let mut msg = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    msg = msg.replace("@here", "<!here>");
    msg = msg.replace("@channel", "<!channel>");
    msg = msg.replace("@everyone", "<!everyone>");

    msg = OUTGOING_LEADING_NICK_RE
        .replace(&msg, |caps: &regex::Captures| match members.get(&caps[1]) {
            Some(id) => format!("<@{id}>:"),
            None => caps[0].to_string(),
        })
        .to_string();

    msg = OUTGOING_NICK_RE
        .replace_all(&msg, |caps: &regex::Captures| match members.get(&caps[2]) {
            Some(id) => format!("{}<@{id}>", &caps[1]),
            None => caps[0].to_string(),
        })
        .to_string();

    msg = OUTGOING_CHANNEL_RE
        .replace_all(&msg, |caps: &regex::Captures| match channels.get(&caps[2]) {
            Some(id) => format!("{}<#{id}|{}>", &caps[1], &caps[2]),
            None => caps[0].to_string(),
        })
        .to_string();

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with<'a>(
        users: &'a HashMap<String, String>,
        rooms: &'a HashMap<String, String>,
        members: &'a HashSet<String>,
    ) -> RenderCtx<'a> {
        RenderCtx {
            users,
            rooms,
            channel_members: members,
            local_nick: "alice",
            yell_silenced: false,
            formatted_max_lines: 0,
        }
    }

    fn render(spans: &[Span], ctx: &RenderCtx) -> String {
        render_to_irc(spans, ctx, |_| None)
    }

    #[test]
    fn tokenizes_plain_text() {
        assert_eq!(
            tokenize("just words"),
            vec![Span::Text("just words".to_string())]
        );
    }

    #[test]
    fn tokenizes_mention_with_label() {
        let spans = tokenize("hey <@U02|carol>!");
        assert_eq!(
            spans,
            vec![
                Span::Text("hey ".to_string()),
                Span::Mention {
                    id: "U02".to_string(),
                    label: Some("carol".to_string())
                },
                Span::Text("!".to_string()),
            ]
        );
    }

    #[test]
    fn tokenizes_room_mention_special_and_link() {
        let spans = tokenize("<#C01|general> <!here> <https://x.y|docs>");
        assert!(matches!(&spans[0], Span::RoomMention { id, .. } if id == "C01"));
        assert!(matches!(&spans[2], Span::Special { key, .. } if key == "here"));
        assert!(
            matches!(&spans[4], Span::Link { url, label } if url == "https://x.y" && label.as_deref() == Some("docs"))
        );
    }

    #[test]
    fn unescapes_entities_in_text() {
        assert_eq!(
            tokenize("a &lt; b &amp;&amp; c &gt; d"),
            vec![Span::Text("a < b && c > d".to_string())]
        );
    }

    #[test]
    fn substitutes_emoji_in_text_only() {
        let spans = tokenize("ok :+1: ```code :+1:```");
        assert_eq!(spans[0], Span::Text("ok 👍 ".to_string()));
        assert_eq!(spans[1], Span::Pre("code :+1:".to_string()));
    }

    #[test]
    fn splits_fenced_blocks() {
        let spans = tokenize("before ```let x = 1;\nlet y = 2;``` after");
        assert_eq!(
            spans,
            vec![
                Span::Text("before ".to_string()),
                Span::Pre("let x = 1;\nlet y = 2;".to_string()),
                Span::Text(" after".to_string()),
            ]
        );
    }

    #[test]
    fn collapses_links_inside_fences() {
        let spans = tokenize("```see <https://x.y|x.y> here```");
        assert_eq!(spans, vec![Span::Pre("see x.y here".to_string())]);
    }

    #[test]
    fn unterminated_item_is_kept_as_text() {
        let spans = tokenize("dangling <@U02");
        assert_eq!(
            spans,
            vec![
                Span::Text("dangling ".to_string()),
                Span::Text("<@U02".to_string()),
            ]
        );
    }

    #[test]
    fn mention_of_channel_member_gets_highlight_prefix() {
        let users = HashMap::from([("U02".to_string(), "carol".to_string())]);
        let rooms = HashMap::new();
        let members = HashSet::from(["carol".to_string()]);
        let ctx = ctx_with(&users, &rooms, &members);
        let out = render(&tokenize("<@U02> see <https://x.y|docs>"), &ctx);
        assert_eq!(out, "@carol see docs (https://x.y)");
    }

    #[test]
    fn mention_of_outsider_stays_bare() {
        let users = HashMap::from([("U02".to_string(), "carol".to_string())]);
        let rooms = HashMap::new();
        let members = HashSet::new();
        let ctx = ctx_with(&users, &rooms, &members);
        let out = render(&tokenize("<@U02> see <https://x.y|docs>"), &ctx);
        assert_eq!(out, "carol see docs (https://x.y)");
    }

    #[test]
    fn unknown_mention_falls_back_to_label_then_id() {
        let users = HashMap::new();
        let rooms = HashMap::new();
        let members = HashSet::new();
        let ctx = ctx_with(&users, &rooms, &members);
        assert_eq!(render(&tokenize("<@U99|dave>"), &ctx), "dave");
        assert_eq!(render(&tokenize("<@U99>"), &ctx), "U99");
    }

    #[test]
    fn room_mention_renders_name_or_id() {
        let users = HashMap::new();
        let rooms = HashMap::from([("C01".to_string(), "general".to_string())]);
        let members = HashSet::new();
        let ctx = ctx_with(&users, &rooms, &members);
        assert_eq!(render(&tokenize("<#C01|general>"), &ctx), "#general");
        assert_eq!(render(&tokenize("<#C99>"), &ctx), "#C99");
    }

    #[test]
    fn yell_injects_local_nick_when_not_silenced() {
        let users = HashMap::new();
        let rooms = HashMap::new();
        let members = HashSet::new();
        let ctx = ctx_with(&users, &rooms, &members);
        assert_eq!(render(&tokenize("<!here> lunch?"), &ctx), "@here [alice] lunch?");
    }

    #[test]
    fn silenced_yell_is_rewritten_without_nick() {
        let users = HashMap::new();
        let rooms = HashMap::new();
        let members = HashSet::new();
        let mut ctx = ctx_with(&users, &rooms, &members);
        ctx.yell_silenced = true;
        let out = render(&tokenize("<!here> lunch?"), &ctx);
        assert_eq!(out, "yelling here lunch?");
        assert!(!out.contains("alice"));
    }

    #[test]
    fn link_label_matching_url_collapses() {
        assert_eq!(
            render_link("https://x.y", Some("https://x.y")),
            "https://x.y"
        );
        assert_eq!(
            render_link("https://x.y", Some("https://x.y/")),
            "https://x.y"
        );
        assert_eq!(
            render_link("https://x.y/", Some("https://x.y")),
            "https://x.y/"
        );
    }

    #[test]
    fn link_labelled_with_other_url_becomes_link_marker() {
        assert_eq!(
            render_link("https://short.io/abc", Some("https://tracking.example/xyz")),
            "LINK (https://short.io/abc)"
        );
    }

    #[test]
    fn oversized_pre_block_is_stored() {
        let users = HashMap::new();
        let rooms = HashMap::new();
        let members = HashSet::new();
        let mut ctx = ctx_with(&users, &rooms, &members);
        ctx.formatted_max_lines = 2;
        let spans = tokenize("```a\nb\nc\nd```");
        let out = render_to_irc(&spans, &ctx, |_| Some("file:///tmp/x.txt".to_string()));
        assert!(out.contains("preformatted text at file:///tmp/x.txt"));
        assert!(!out.contains("a\nb\nc\nd"));
    }

    #[test]
    fn outgoing_mentions_and_channels_are_rewritten() {
        let members = HashMap::from([("carol".to_string(), "U02".to_string())]);
        let channels = HashMap::from([("general".to_string(), "C01".to_string())]);
        assert_eq!(
            irc_to_slack("@carol look at #general", &members, &channels),
            "<@U02> look at <#C01|general>"
        );
        assert_eq!(
            irc_to_slack("carol: ping", &members, &channels),
            "<@U02>: ping"
        );
    }

    #[test]
    fn outgoing_unknown_nick_passes_through() {
        let members = HashMap::new();
        let channels = HashMap::new();
        assert_eq!(irc_to_slack("@nobody hi", &members, &channels), "@nobody hi");
    }

    #[test]
    fn outgoing_escapes_and_yells() {
        let members = HashMap::new();
        let channels = HashMap::new();
        assert_eq!(
            irc_to_slack("a < b && @here", &members, &channels),
            "a &lt; b &amp;&amp; <!here>"
        );
    }

    #[test]
    fn roundtrip_of_substituted_ids_yields_same_spans() {
        let members = HashMap::from([("carol".to_string(), "U02".to_string())]);
        let channels = HashMap::from([("general".to_string(), "C01".to_string())]);
        let wire = irc_to_slack("@carol meet in #general", &members, &channels);
        assert_eq!(
            tokenize(&wire),
            tokenize("<@U02> meet in <#C01|general>")
        );
    }
}
