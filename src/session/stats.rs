//! セッション統計

use serde::{Deserialize, Serialize};

use crate::moderation::{ActionKind, ActionRecord, ModerationVerdict};

/// 違反1件あたりの有害度スコア増分（カテゴリによらず一定）
pub const TOXICITY_INCREMENT: f64 = 0.1;
/// Clean判定1件あたりの有害度スコア減衰
pub const TOXICITY_DECAY: f64 = 0.001;

/// チャンネルごとの集計値
///
/// 書き込むのはそのチャンネルのメッセージ処理ループだけ。読み手にはコピーを渡す。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub messages_analyzed: u64,
    pub timeouts_issued: u64,
    pub bans_issued: u64,
    pub messages_deleted: u64,
    pub spam_blocked: u64,
    /// 0.0〜1.0
    pub toxicity_score: f64,
}

impl SessionStats {
    /// 受信したメッセージを数える（一時停止中も数える）
    pub fn record_observed(&mut self) {
        self.messages_analyzed += 1;
    }

    /// 判定結果をスコアとスパム数に反映
    pub fn record_verdict(&mut self, verdict: &ModerationVerdict) {
        match verdict {
            ModerationVerdict::Clean => self.decay_toxicity(),
            ModerationVerdict::BannedContent { .. } => self.raise_toxicity(),
            ModerationVerdict::Spam { .. } => {
                self.spam_blocked += 1;
                self.raise_toxicity();
            }
        }
    }

    /// 適用に成功したアクションだけを数える
    pub fn record_action(&mut self, record: &ActionRecord) {
        if !record.outcome.is_applied() {
            return;
        }
        match record.action.kind {
            ActionKind::Delete => self.messages_deleted += 1,
            ActionKind::Timeout => self.timeouts_issued += 1,
            ActionKind::Ban => self.bans_issued += 1,
        }
    }

    fn raise_toxicity(&mut self) {
        self.toxicity_score = (self.toxicity_score + TOXICITY_INCREMENT).clamp(0.0, 1.0);
    }

    fn decay_toxicity(&mut self) {
        self.toxicity_score = (self.toxicity_score - TOXICITY_DECAY).clamp(0.0, 1.0);
    }
}
