//! Reward functions scoring sampled completions.
//!
//! Every function is pure and deterministic: malformed completions score zero
//! instead of failing. The trainer sums the per-function scores.

use crate::dataset::{Message, Role};
use crate::xml::{count_xml, extract_xml_answer};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CORRECTNESS_REWARD: f64 = 2.0;
pub const INT_REWARD: f64 = 0.5;
pub const FORMAT_REWARD: f64 = 0.5;

static STRICT_FORMAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<reasoning>\n.*?\n</reasoning>\n<answer>\n.*?\n</answer>\n$")
        .expect("strict format regex should be valid")
});

static SOFT_FORMAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*<reasoning>.*?</reasoning>\s*<answer>.*?</answer>")
        .expect("soft format regex should be valid")
});

/// One sampled completion together with the prompt it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    pub prompt: Vec<Message>,
    pub completion: String,
    pub answer: Option<String>,
}

impl Rollout {
    fn question(&self) -> &str {
        self.prompt
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }
}

/// A scorer over a batch of rollouts, returning one reward per rollout.
pub trait RewardFunction: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64>;
}

/// Exact string match of the extracted answer against the reference. A missing
/// reference never matches.
pub fn correctness_reward(completion: &str, answer: Option<&str>) -> f64 {
    match answer {
        Some(answer) if extract_xml_answer(completion) == answer => CORRECTNESS_REWARD,
        _ => 0.0,
    }
}

pub fn int_reward(completion: &str) -> f64 {
    let extracted = extract_xml_answer(completion);
    // Any Unicode numeric character counts, so "٤٢" is an integer answer too.
    if !extracted.is_empty() && extracted.chars().all(char::is_numeric) {
        INT_REWARD
    } else {
        0.0
    }
}

pub fn strict_format_reward(completion: &str) -> f64 {
    if STRICT_FORMAT_REGEX.is_match(completion) { FORMAT_REWARD } else { 0.0 }
}

pub fn soft_format_reward(completion: &str) -> f64 {
    if SOFT_FORMAT_REGEX.is_match(completion) { FORMAT_REWARD } else { 0.0 }
}

/// Exact match between the extracted answer and the reference answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrectnessReward;

impl RewardFunction for CorrectnessReward {
    fn name(&self) -> &'static str {
        "correctness"
    }

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64> {
        if let Some(first) = rollouts.first() {
            debug!(
                question = first.question(),
                answer = ?first.answer,
                response = %first.completion,
                extracted = %extract_xml_answer(&first.completion),
                "correctness sample"
            );
        }
        let rewards: Vec<f64> = rollouts
            .iter()
            .map(|r| correctness_reward(&r.completion, r.answer.as_deref()))
            .collect();
        debug!(reward = self.name(), ?rewards, "rewards");
        rewards
    }
}

/// Extracted answer is a bare integer.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerAnswerReward;

impl RewardFunction for IntegerAnswerReward {
    fn name(&self) -> &'static str {
        "int"
    }

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64> {
        let rewards: Vec<f64> = rollouts.iter().map(|r| int_reward(&r.completion)).collect();
        debug!(reward = self.name(), ?rewards, "rewards");
        rewards
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StrictFormatReward;

impl RewardFunction for StrictFormatReward {
    fn name(&self) -> &'static str {
        "strict_format"
    }

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64> {
        let rewards: Vec<f64> = rollouts.iter().map(|r| strict_format_reward(&r.completion)).collect();
        debug!(reward = self.name(), ?rewards, "rewards");
        rewards
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SoftFormatReward;

impl RewardFunction for SoftFormatReward {
    fn name(&self) -> &'static str {
        "soft_format"
    }

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64> {
        let rewards: Vec<f64> = rollouts.iter().map(|r| soft_format_reward(&r.completion)).collect();
        debug!(reward = self.name(), ?rewards, "rewards");
        rewards
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XmlCountReward;

impl RewardFunction for XmlCountReward {
    fn name(&self) -> &'static str {
        "xmlcount"
    }

    fn score(&self, rollouts: &[Rollout]) -> Vec<f64> {
        let rewards: Vec<f64> = rollouts.iter().map(|r| count_xml(&r.completion)).collect();
        debug!(reward = self.name(), ?rewards, "rewards");
        rewards
    }
}

/// The reward set used for GSM8K training, in scoring order.
pub fn default_reward_functions() -> Vec<Box<dyn RewardFunction>> {
    vec![
        Box::new(XmlCountReward),
        Box::new(SoftFormatReward),
        Box::new(StrictFormatReward),
        Box::new(IntegerAnswerReward),
        Box::new(CorrectnessReward),
    ]
}
