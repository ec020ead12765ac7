//! Twitch IRC（IRCv3タグ付き）の行パーサー
//!
//! ```text
//! @badges=moderator/1;id=abc;mod=1;subscriber=0 :nick!nick@nick.tmi.twitch.tv PRIVMSG #channel :hello
//! ```

use std::collections::{BTreeSet, HashMap};

/// パース済みのサーバー行
#[derive(Debug, Clone, PartialEq)]
pub enum ServerLine {
    /// PING（PONGで応答する）
    Ping(String),
    /// 001 Welcome（ログイン成功）
    Welcome,
    /// ログイン失敗のNOTICE
    AuthFailed(String),
    /// サーバーからの再接続要求
    Reconnect,
    /// チャットメッセージ
    PrivMsg(PrivMsg),
    /// 上記以外
    Other(String),
}

/// PRIVMSGの内容
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrivMsg {
    pub channel: String,
    pub username: String,
    pub text: String,
    pub id: Option<String>,
    pub is_moderator: bool,
    pub is_subscriber: bool,
    pub badges: BTreeSet<String>,
}

/// 認証失敗を示すNOTICE本文
const AUTH_FAILURE_NOTICES: &[&str] = &[
    "Login authentication failed",
    "Improperly formatted auth",
    "Invalid NICK",
];

/// 1行をパースする
pub fn parse_line(line: &str) -> Option<ServerLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }

    let (tags, rest) = match line.strip_prefix('@') {
        Some(tagged) => {
            let (raw_tags, rest) = tagged.split_once(' ')?;
            (parse_tags(raw_tags), rest)
        }
        None => (HashMap::new(), line),
    };

    let (prefix, rest) = match rest.strip_prefix(':') {
        Some(prefixed) => {
            let (prefix, rest) = prefixed.split_once(' ')?;
            (Some(prefix), rest)
        }
        None => (None, rest),
    };

    let (head, trailing) = match rest.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => (rest, None),
    };
    let mut params = head.split_whitespace();
    let command = params.next()?;

    let parsed = match command {
        "PING" => ServerLine::Ping(trailing.unwrap_or("tmi.twitch.tv").to_string()),
        "001" => ServerLine::Welcome,
        "RECONNECT" => ServerLine::Reconnect,
        "NOTICE" => {
            let text = trailing.unwrap_or_default();
            if AUTH_FAILURE_NOTICES
                .iter()
                .any(|notice| text.contains(notice))
            {
                ServerLine::AuthFailed(text.to_string())
            } else {
                ServerLine::Other(line.to_string())
            }
        }
        "PRIVMSG" => {
            let channel = params.next()?.trim_start_matches('#').to_string();
            let username = prefix
                .and_then(|p| p.split('!').next())
                .unwrap_or_default()
                .to_string();
            ServerLine::PrivMsg(build_privmsg(channel, username, trailing, &tags))
        }
        _ => ServerLine::Other(line.to_string()),
    };

    Some(parsed)
}

fn build_privmsg(
    channel: String,
    username: String,
    trailing: Option<&str>,
    tags: &HashMap<String, String>,
) -> PrivMsg {
    let badges: BTreeSet<String> = tags
        .get("badges")
        .map(|raw| {
            raw.split(',')
                .filter_map(|badge| badge.split('/').next())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let flag = |key: &str| tags.get(key).is_some_and(|value| value == "1");

    PrivMsg {
        channel,
        // display-nameではなくloginを使う（タイムアウトAPIはlogin基準）
        username: username.to_lowercase(),
        text: strip_action(trailing.unwrap_or_default()).to_string(),
        id: tags.get("id").filter(|id| !id.is_empty()).cloned(),
        is_moderator: flag("mod") || badges.contains("moderator"),
        is_subscriber: flag("subscriber") || badges.contains("subscriber"),
        badges,
    }
}

/// `/me` 形式（CTCP ACTION）の本文を取り出す
fn strip_action(text: &str) -> &str {
    text.strip_prefix("\u{1}ACTION ")
        .map(|inner| inner.trim_end_matches('\u{1}'))
        .unwrap_or(text)
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (!key.is_empty()).then(|| (key.to_string(), unescape_tag_value(value)))
        })
        .collect()
}

/// IRCv3タグ値のエスケープを戻す
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// ログイン時に送るコマンド列
pub fn login_commands(bot_login: &str, access_token: &str, channel: &str) -> Vec<String> {
    vec![
        "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
        format!("PASS oauth:{access_token}"),
        format!("NICK {bot_login}"),
        format!("JOIN #{channel}"),
    ]
}
