//! Scheduler configuration.
//!
//! Defaults can be overridden from the environment
//! (`ORDSCHED_THREAD_NAME`, `ORDSCHED_SHUTDOWN_POLICY`) or from a JSON
//! document.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THREAD_NAME: &str = "ordsched-consumer";

const THREAD_NAME_ENV: &str = "ORDSCHED_THREAD_NAME";
const SHUTDOWN_POLICY_ENV: &str = "ORDSCHED_SHUTDOWN_POLICY";

/// What `shutdown()` does with tasks still waiting in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    /// Keep running queued tasks, in order, until the queue is empty.
    #[default]
    Drain,
    /// Cancel every queued task; their handles report cancelled.
    DiscardPending,
}

impl ShutdownPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drain" | "run" | "execute" => Some(Self::Drain),
            "discard" | "discard-pending" | "cancel" | "drop" => Some(Self::DiscardPending),
            _ => None,
        }
    }
}

impl std::str::FromStr for ShutdownPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
            .ok_or_else(|| Error::config(format!("unknown shutdown policy: {value:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Name given to the consumer thread.
    pub thread_name: String,
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with environment overrides. Unparseable values are
    /// ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(Error::config("threadName must not be empty"));
        }
        if self.thread_name.contains('\0') {
            return Err(Error::config("threadName must not contain NUL bytes"));
        }
        Ok(())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = lookup(THREAD_NAME_ENV) {
            let name = name.trim();
            if name.is_empty() || name.contains('\0') {
                tracing::warn!(
                    event = "scheduler.config.invalid",
                    key = THREAD_NAME_ENV,
                    "Ignoring invalid thread name override"
                );
            } else {
                self.thread_name = name.to_string();
            }
        }

        if let Some(raw) = lookup(SHUTDOWN_POLICY_ENV) {
            match ShutdownPolicy::parse(&raw) {
                Some(policy) => self.shutdown_policy = policy,
                None => tracing::warn!(
                    event = "scheduler.config.invalid",
                    key = SHUTDOWN_POLICY_ENV,
                    value = %raw,
                    "Ignoring unknown shutdown policy"
                ),
            }
        }
        self
    }
}
