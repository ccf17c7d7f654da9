use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Shortcodes Slack commonly emits. Anything not in here is passed
/// through as `:name:` so the client still sees what was meant.
static SHORTCODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("+1", "👍");
    m.insert("thumbsup", "👍");
    m.insert("-1", "👎");
    m.insert("thumbsdown", "👎");
    m.insert("smile", "😄");
    m.insert("simple_smile", "🙂");
    m.insert("slightly_smiling_face", "🙂");
    m.insert("smiley", "😃");
    m.insert("grin", "😁");
    m.insert("grinning", "😀");
    m.insert("laughing", "😆");
    m.insert("joy", "😂");
    m.insert("rofl", "🤣");
    m.insert("sweat_smile", "😅");
    m.insert("wink", "😉");
    m.insert("blush", "😊");
    m.insert("innocent", "😇");
    m.insert("heart_eyes", "😍");
    m.insert("kissing_heart", "😘");
    m.insert("thinking_face", "🤔");
    m.insert("thinking", "🤔");
    m.insert("neutral_face", "😐");
    m.insert("expressionless", "😑");
    m.insert("unamused", "😒");
    m.insert("roll_eyes", "🙄");
    m.insert("face_with_rolling_eyes", "🙄");
    m.insert("smirk", "😏");
    m.insert("grimacing", "😬");
    m.insert("relieved", "😌");
    m.insert("pensive", "😔");
    m.insert("confused", "😕");
    m.insert("worried", "😟");
    m.insert("frowning", "😦");
    m.insert("cry", "😢");
    m.insert("sob", "😭");
    m.insert("scream", "😱");
    m.insert("fearful", "😨");
    m.insert("angry", "😠");
    m.insert("rage", "😡");
    m.insert("tired_face", "😫");
    m.insert("weary", "😩");
    m.insert("sleeping", "😴");
    m.insert("sunglasses", "😎");
    m.insert("nerd_face", "🤓");
    m.insert("zany_face", "🤪");
    m.insert("exploding_head", "🤯");
    m.insert("facepalm", "🤦");
    m.insert("shrug", "🤷");
    m.insert("man-shrugging", "🤷‍♂️");
    m.insert("woman-shrugging", "🤷‍♀️");
    m.insert("wave", "👋");
    m.insert("clap", "👏");
    m.insert("raised_hands", "🙌");
    m.insert("pray", "🙏");
    m.insert("ok_hand", "👌");
    m.insert("point_up", "☝️");
    m.insert("point_right", "👉");
    m.insert("muscle", "💪");
    m.insert("crossed_fingers", "🤞");
    m.insert("handshake", "🤝");
    m.insert("eyes", "👀");
    m.insert("heart", "❤️");
    m.insert("broken_heart", "💔");
    m.insert("sparkles", "✨");
    m.insert("star", "⭐");
    m.insert("star2", "🌟");
    m.insert("fire", "🔥");
    m.insert("boom", "💥");
    m.insert("tada", "🎉");
    m.insert("confetti_ball", "🎊");
    m.insert("rocket", "🚀");
    m.insert("100", "💯");
    m.insert("zap", "⚡");
    m.insert("bulb", "💡");
    m.insert("warning", "⚠️");
    m.insert("question", "❓");
    m.insert("exclamation", "❗");
    m.insert("heavy_check_mark", "✔️");
    m.insert("white_check_mark", "✅");
    m.insert("x", "❌");
    m.insert("no_entry", "⛔");
    m.insert("no_entry_sign", "🚫");
    m.insert("red_circle", "🔴");
    m.insert("large_green_circle", "🟢");
    m.insert("hourglass", "⌛");
    m.insert("clock1", "🕐");
    m.insert("calendar", "📅");
    m.insert("memo", "📝");
    m.insert("pencil2", "✏️");
    m.insert("book", "📖");
    m.insert("bookmark", "🔖");
    m.insert("link", "🔗");
    m.insert("paperclip", "📎");
    m.insert("mag", "🔍");
    m.insert("lock", "🔒");
    m.insert("unlock", "🔓");
    m.insert("key", "🔑");
    m.insert("hammer", "🔨");
    m.insert("wrench", "🔧");
    m.insert("gear", "⚙️");
    m.insert("bug", "🐛");
    m.insert("beetle", "🐞");
    m.insert("snake", "🐍");
    m.insert("crab", "🦀");
    m.insert("turtle", "🐢");
    m.insert("dog", "🐶");
    m.insert("cat", "🐱");
    m.insert("panda_face", "🐼");
    m.insert("coffee", "☕");
    m.insert("tea", "🍵");
    m.insert("beer", "🍺");
    m.insert("beers", "🍻");
    m.insert("pizza", "🍕");
    m.insert("hamburger", "🍔");
    m.insert("cake", "🍰");
    m.insert("birthday", "🎂");
    m.insert("apple", "🍎");
    m.insert("banana", "🍌");
    m.insert("sun_with_face", "🌞");
    m.insert("sunny", "☀️");
    m.insert("cloud", "☁️");
    m.insert("rain_cloud", "🌧️");
    m.insert("snowflake", "❄️");
    m.insert("umbrella", "☂️");
    m.insert("rainbow", "🌈");
    m.insert("earth_africa", "🌍");
    m.insert("moon", "🌔");
    m.insert("skin-tone-2", "\u{1F3FB}");
    m.insert("skin-tone-3", "\u{1F3FC}");
    m.insert("skin-tone-4", "\u{1F3FD}");
    m.insert("skin-tone-5", "\u{1F3FE}");
    m.insert("skin-tone-6", "\u{1F3FF}");
    m
});

static SHORTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([a-zA-Z0-9_+'-]+):").expect("valid shortcode regex"));

pub fn lookup(name: &str) -> Option<&'static str> {
    SHORTCODES.get(name).copied()
}

/// Replace every known `:shortcode:` in `text` with its unicode form.
/// Unknown shortcodes are left intact.
pub fn emojize(text: &str) -> String {
    if !text.contains(':') {
        return text.to_string();
    }
    SHORTCODE_RE
        .replace_all(text, |caps: &regex::Captures| match lookup(&caps[1]) {
            Some(glyph) => glyph.to_string(),
            None => caps[0].to_string(),
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_known_shortcode() {
        assert_eq!(emojize("nice :+1:"), "nice 👍");
    }

    #[test]
    fn keeps_unknown_shortcode() {
        assert_eq!(emojize("hello :blobfish:"), "hello :blobfish:");
    }

    #[test]
    fn replaces_skin_tone_modifier_sequence() {
        assert_eq!(emojize(":+1::skin-tone-3:"), "👍\u{1F3FC}");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(emojize("10:30 meeting"), "10:30 meeting");
    }
}
