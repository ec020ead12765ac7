//! チャットモデレーションのコア
//!
//! 分類パイプラインとアクション実行器

pub mod classifier;
pub mod executor;
pub mod models;

pub use classifier::{Classifier, ExemptionPolicy, RuleBasedClassifier};
pub use executor::{plan_actions, ActionExecutor, ModerationApi};
pub use models::*;
