//! Alert evaluation
//!
//! PUSH rules are judged against a per-series window kept in memory as
//! points arrive; PULL rules run a PromQL query on a timer. Both feed the
//! event state store, which decides what is emitted downstream.

pub mod cache;
pub mod events;
pub mod filter;
pub mod func;
pub mod index;
pub mod pull;
pub mod push;

#[cfg(test)]
mod tests;

pub use cache::{PointCache, SeriesWindow};
pub use events::{EventStateStore, Outcome, DEFAULT_EVENT_CAPACITY};
pub use filter::CompiledFilter;
pub use func::{describe, Evaluation, JudgeFunc};
pub use index::{validate_rule, CompiledRule, IndexStats, RuleIndex};
pub use pull::{rule_key, PullConfig, PullEvaluator, PullRuleManager, SyncReport};
pub use push::{JudgeCore, PushJudge, PushJudgeConfig};
