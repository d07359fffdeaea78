use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tally_ir::EntityClass;

use crate::errors::{EvalError, RuntimeError};

/// Safety bounds applied to every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalLimits {
    #[serde(serialize_with = "ser_secs", deserialize_with = "de_secs")]
    pub max_time: Duration,
    pub max_exponent: f64,
    pub max_shift: i64,
    pub max_str_len: usize,
    pub max_len: usize,
    pub max_call_depth: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_time: Duration::from_secs(30 * 60),
            max_exponent: 10_000.0,
            max_shift: 10,
            max_str_len: 20_000,
            max_len: 1_000,
            max_call_depth: 100,
        }
    }
}

impl EvalLimits {
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// These limits with `max_time` cut down to what is left before `deadline`.
    pub fn until(&self, deadline: Option<Instant>) -> Result<Self, EvalError> {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.max_time,
        };
        if remaining.is_zero() {
            return Err(EvalError::TimeLimitExceeded);
        }
        Ok(self.clone().with_max_time(remaining))
    }
}

fn ser_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn de_secs<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(d)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: EvalLimits,
    /// Roll the whole run back when any action fails.
    pub strict: bool,
    pub record_execution_log: bool,
    pub enable_print: bool,
    pub recalculate_iterations: u32,
    /// Commit attempts for `append_number` before giving up.
    pub append_number_attempts: u32,
    /// Default user code per class for relation fields left unresolved.
    pub ecosystem_defaults: BTreeMap<EntityClass, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: EvalLimits::default(),
            strict: true,
            record_execution_log: true,
            enable_print: false,
            recalculate_iterations: 5,
            append_number_attempts: 10,
            ecosystem_defaults: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }
}
