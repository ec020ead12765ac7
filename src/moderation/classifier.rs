//! メッセージ分類パイプライン
//!
//! メッセージ本文と送信者情報から `ModerationVerdict` を決定する。
//! I/Oを持たない純粋関数として実装し、ルールベース実装と外部モデルを差し替えられるようにする。

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use super::models::{ChatMessage, ModerationVerdict, SpamSignal};

/// 大文字比率のしきい値
pub const CAPS_RATIO_THRESHOLD: f64 = 0.70;
/// 大文字判定の対象となる最小文字数（これを超える長さが対象）
pub const CAPS_MIN_LENGTH: usize = 10;
/// 繰り返し判定の対象となる最小トークン数（これを超える数が対象）
pub const REPETITION_MIN_TOKENS: usize = 5;
/// 繰り返し判定のユニーク率しきい値
pub const REPETITION_UNIQUE_RATIO: f64 = 0.30;

/// 禁止語リスト
pub const DEFAULT_LEXICON: &[&str] = &[
    "anal", "anus", "arse", "ass", "asshole", "bastard", "bitch", "bloody", "blowjob",
    "bollocks", "boner", "boob", "bugger", "bullshit", "clit", "clitoris", "cock", "crap",
    "cunt", "damn", "dick", "dildo", "dyke", "fag", "faggot", "fanny", "fellate", "fellatio",
    "felch", "fuck", "gangbang", "goddamn", "handjob", "hell", "horny", "jerk", "jizz", "kike",
    "kys", "lust", "milf", "motherfucker", "nazi", "nude", "nigger", "orgy", "penis", "piss",
    "porn", "prick", "pussy", "queer", "retard", "scrotum", "sex", "sexy", "shit", "slut",
    "smegma", "spic", "suicide", "testicle", "tit", "turd", "vagina", "viagra", "vulva",
    "wank", "whore", "xxx",
];

/// 分類器の抽象インタフェース
///
/// 実装は副作用を持たず、同じ入力に対して常に同じ結果を返すこと。
pub trait Classifier: Send + Sync {
    fn classify(&self, message: &ChatMessage) -> ModerationVerdict;
}

/// モデレーション対象外とする送信者のポリシー
///
/// モデレーターは常に対象外。それ以外の信頼済みロールは設定で指定する。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExemptionPolicy {
    /// サブスクライバーを対象外にする
    pub exempt_subscribers: bool,
    /// このバッジを持つユーザーを対象外にする
    pub exempt_badges: BTreeSet<String>,
}

impl ExemptionPolicy {
    pub fn is_exempt(&self, message: &ChatMessage) -> bool {
        if message.sender.is_moderator {
            return true;
        }
        if self.exempt_subscribers && message.sender.is_subscriber {
            return true;
        }
        message
            .badges
            .iter()
            .any(|badge| self.exempt_badges.contains(badge))
    }
}

/// ルールベースの分類器
#[derive(Debug, Clone)]
pub struct RuleBasedClassifier {
    lexicon: Regex,
    exemptions: ExemptionPolicy,
}

fn default_lexicon_regex() -> &'static Regex {
    static DEFAULT: OnceLock<Regex> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        compile_lexicon(DEFAULT_LEXICON.iter().copied())
            .expect("built-in lexicon is a valid pattern")
    })
}

/// 単語境界つきの大文字小文字無視パターンを組み立てる
fn compile_lexicon<'a>(terms: impl IntoIterator<Item = &'a str>) -> Result<Regex, regex::Error> {
    let alternatives: Vec<String> = terms
        .into_iter()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(regex::escape)
        .collect();

    let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        Self::new(ExemptionPolicy::default())
    }
}

impl RuleBasedClassifier {
    /// 組み込みの禁止語リストで分類器を作成
    pub fn new(exemptions: ExemptionPolicy) -> Self {
        Self {
            lexicon: default_lexicon_regex().clone(),
            exemptions,
        }
    }

    /// 組み込みリストに追加の禁止語を加えた分類器を作成
    pub fn with_extra_terms<S: AsRef<str>>(
        exemptions: ExemptionPolicy,
        extra_terms: &[S],
    ) -> Result<Self, regex::Error> {
        if extra_terms.is_empty() {
            return Ok(Self::new(exemptions));
        }

        let terms = DEFAULT_LEXICON
            .iter()
            .copied()
            .chain(extra_terms.iter().map(|term| term.as_ref()));
        Ok(Self {
            lexicon: compile_lexicon(terms)?,
            exemptions,
        })
    }

    pub fn exemptions(&self) -> &ExemptionPolicy {
        &self.exemptions
    }

    /// 禁止語にマッチした語を返す
    pub fn find_banned_term(&self, text: &str) -> Option<String> {
        self.lexicon
            .find(text)
            .map(|m| m.as_str().to_lowercase())
    }
}

impl Classifier for RuleBasedClassifier {
    fn classify(&self, message: &ChatMessage) -> ModerationVerdict {
        if self.exemptions.is_exempt(message) {
            return ModerationVerdict::Clean;
        }

        // 必須項目が欠けたメッセージはモデレーションせずに通す
        if message.username.trim().is_empty() || message.text.trim().is_empty() {
            tracing::debug!(id = %message.id, "Skipping malformed message");
            return ModerationVerdict::Clean;
        }

        if let Some(term) = self.find_banned_term(&message.text) {
            return ModerationVerdict::BannedContent { term };
        }

        match detect_spam(&message.text) {
            Some(signal) => ModerationVerdict::Spam { signal },
            None => ModerationVerdict::Clean,
        }
    }
}

/// スパムシグナルを検出する
pub fn detect_spam(text: &str) -> Option<SpamSignal> {
    if has_excessive_caps(text) {
        return Some(SpamSignal::ExcessiveCaps);
    }
    if has_excessive_repetition(text) {
        return Some(SpamSignal::ExcessiveRepetition);
    }
    None
}

/// 英字に占める大文字の比率が0.70を超え、かつ10文字を超えるか
pub fn has_excessive_caps(text: &str) -> bool {
    if text.chars().count() <= CAPS_MIN_LENGTH {
        return false;
    }

    let (letters, uppercase) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(letters, upper), c| {
            (letters + 1, upper + usize::from(c.is_uppercase()))
        });

    letters > 0 && (uppercase as f64 / letters as f64) > CAPS_RATIO_THRESHOLD
}

/// トークン数が5を超え、ユニーク率が0.30未満か
///
/// トークンは大文字小文字を区別して比較する。
pub fn has_excessive_repetition(text: &str) -> bool {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= REPETITION_MIN_TOKENS {
        return false;
    }

    let distinct: HashSet<&str> = tokens.iter().copied().collect();
    (distinct.len() as f64 / tokens.len() as f64) < REPETITION_UNIQUE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::models::{ChannelName, SenderFlags, VerdictCategory};
    use chrono::Utc;

    fn message_from(text: &str, sender: SenderFlags) -> ChatMessage {
        ChatMessage {
            id: "msg-1".to_string(),
            platform_id: true,
            channel: ChannelName::new("streamer"),
            username: "viewer".to_string(),
            text: text.to_string(),
            received_at: Utc::now(),
            sender,
            badges: BTreeSet::new(),
        }
    }

    fn regular(text: &str) -> ChatMessage {
        message_from(text, SenderFlags::default())
    }

    #[test]
    fn test_moderators_are_always_clean() {
        let classifier = RuleBasedClassifier::default();
        let sender = SenderFlags {
            is_moderator: true,
            is_subscriber: false,
        };
        for text in ["you are such a fuck", "AAAAAAAAAAAAAAAAA", "a a a a a a a a"] {
            assert_eq!(
                classifier.classify(&message_from(text, sender)),
                ModerationVerdict::Clean
            );
        }
    }

    #[test]
    fn test_banned_word_scenario() {
        let classifier = RuleBasedClassifier::default();
        let verdict = classifier.classify(&regular("you are such a fuck"));
        assert_eq!(
            verdict,
            ModerationVerdict::BannedContent {
                term: "fuck".to_string()
            }
        );
        assert_eq!(verdict.timeout_seconds(), Some(600));
    }

    #[test]
    fn test_banned_word_is_case_insensitive() {
        let classifier = RuleBasedClassifier::default();
        let verdict = classifier.classify(&regular("What The Hell"));
        assert_eq!(verdict.category(), VerdictCategory::BannedContent);
    }

    #[test]
    fn test_banned_word_requires_whole_word() {
        let classifier = RuleBasedClassifier::default();
        for text in ["hello there", "classic assignment", "shell scripting", "titanic"] {
            assert_eq!(
                classifier.classify(&regular(text)),
                ModerationVerdict::Clean,
                "{text} should not match"
            );
        }
    }

    #[test]
    fn test_banned_content_wins_over_spam() {
        let classifier = RuleBasedClassifier::default();
        // 大文字比率・繰り返しの両方を満たすが禁止語を含む
        let verdict = classifier.classify(&regular("SHIT SHIT SHIT SHIT SHIT SHIT SHIT"));
        assert_eq!(verdict.category(), VerdictCategory::BannedContent);
    }

    #[test]
    fn test_caps_spam_scenario() {
        let classifier = RuleBasedClassifier::default();
        let verdict = classifier.classify(&regular("AAAAAAAAAAAAAAAAA"));
        assert_eq!(
            verdict,
            ModerationVerdict::Spam {
                signal: SpamSignal::ExcessiveCaps
            }
        );
        assert_eq!(verdict.timeout_seconds(), Some(300));
    }

    #[test]
    fn test_caps_requires_length_over_ten() {
        assert!(!has_excessive_caps("HELLO WORL"));
        assert!(has_excessive_caps("HELLO WORLD"));
        // 数字や記号は比率計算に含めない
        assert!(has_excessive_caps("OMG!!! 1234567"));
        assert!(!has_excessive_caps("1234567890123"));
    }

    #[test]
    fn test_caps_ratio_boundary() {
        // 7/10 = 0.70 はしきい値を超えない
        assert!(!has_excessive_caps("ABCDEFG hij"));
        assert!(has_excessive_caps("ABCDEFGH ij"));
    }

    #[test]
    fn test_repetition_spam() {
        let classifier = RuleBasedClassifier::default();
        let verdict = classifier.classify(&regular("spam spam spam spam spam spam spam"));
        assert_eq!(
            verdict,
            ModerationVerdict::Spam {
                signal: SpamSignal::ExcessiveRepetition
            }
        );
    }

    #[test]
    fn test_repetition_boundaries() {
        // トークン数5以下は対象外
        assert!(!has_excessive_repetition("go go go go go"));
        // 2/6 = 0.33 は0.30未満ではない
        assert!(!has_excessive_repetition("go go go go team team"));
        // 2/7 = 0.28
        assert!(has_excessive_repetition("go go go go go team team"));
        // 表記が違えば別トークン: 4/6
        assert!(!has_excessive_repetition("Go go GO gO Go go"));
    }

    #[test]
    fn test_regular_chat_is_clean() {
        let classifier = RuleBasedClassifier::default();
        for text in [
            "hi chat!",
            "that play was amazing",
            "GG",
            "what's the song name?",
            "Go go GO gO Go go",
        ] {
            assert_eq!(classifier.classify(&regular(text)), ModerationVerdict::Clean);
        }
    }

    #[test]
    fn test_malformed_message_is_clean() {
        let classifier = RuleBasedClassifier::default();
        let mut message = regular("you are such a fuck");
        message.username = String::new();
        assert_eq!(classifier.classify(&message), ModerationVerdict::Clean);

        let empty = regular("   ");
        assert_eq!(classifier.classify(&empty), ModerationVerdict::Clean);
    }

    #[test]
    fn test_exemption_policy() {
        let policy = ExemptionPolicy {
            exempt_subscribers: true,
            exempt_badges: BTreeSet::from(["vip".to_string()]),
        };
        let classifier = RuleBasedClassifier::new(policy);

        let subscriber = message_from(
            "AAAAAAAAAAAAAAAAA",
            SenderFlags {
                is_moderator: false,
                is_subscriber: true,
            },
        );
        assert_eq!(classifier.classify(&subscriber), ModerationVerdict::Clean);

        let mut vip = regular("AAAAAAAAAAAAAAAAA");
        vip.badges.insert("vip".to_string());
        assert_eq!(classifier.classify(&vip), ModerationVerdict::Clean);

        // デフォルトではサブスクライバーも対象
        let default_classifier = RuleBasedClassifier::default();
        assert_eq!(
            default_classifier.classify(&subscriber).category(),
            VerdictCategory::Spam
        );
    }

    #[test]
    fn test_default_policy_exempts_only_moderators() {
        let policy = ExemptionPolicy::default();
        assert!(policy.exempt_badges.is_empty());

        let moderator = message_from(
            "fuck this lag",
            SenderFlags {
                is_moderator: true,
                is_subscriber: false,
            },
        );
        assert!(policy.is_exempt(&moderator));

        let mut streamer = regular("shit happens");
        streamer.badges.insert("broadcaster".to_string());
        assert!(!policy.is_exempt(&streamer));

        let classifier = RuleBasedClassifier::default();
        assert_eq!(classifier.classify(&moderator), ModerationVerdict::Clean);
        assert_eq!(
            classifier.classify(&streamer).category(),
            VerdictCategory::BannedContent
        );
    }

    #[test]
    fn test_extra_terms() {
        let classifier =
            RuleBasedClassifier::with_extra_terms(ExemptionPolicy::default(), &["noob"]).unwrap();
        assert_eq!(
            classifier.find_banned_term("what a NOOB"),
            Some("noob".to_string())
        );
        // 組み込みの語も維持される
        assert!(classifier.find_banned_term("oh crap").is_some());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = RuleBasedClassifier::default();
        let message = regular("buy buy buy buy buy buy buy now");
        let first = classifier.classify(&message);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&message), first);
        }
    }
}
