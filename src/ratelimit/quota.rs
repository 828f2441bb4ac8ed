//! Throttled endpoints and their quota policies.
//!
//! The registry is an immutable value built once at startup (defaults merged
//! with configuration overrides) and handed to the rate limiter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TollgateError};

/// A throttled logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// AI chat turns
    Chat,
    /// AI quiz generation
    QuizGeneration,
}

impl Endpoint {
    /// Every endpoint, in a stable order.
    pub const ALL: [Endpoint; 2] = [Endpoint::Chat, Endpoint::QuizGeneration];

    /// The identifier stored alongside counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::QuizGeneration => "quiz_generation",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| TollgateError::UnknownEndpoint(s.to_string()))
    }
}

/// Maximum requests allowed per window for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Requests allowed per window
    pub limit: u64,
    /// Window size in minutes
    pub window_minutes: u32,
}

impl QuotaPolicy {
    pub const fn new(limit: u64, window_minutes: u32) -> Self {
        Self {
            limit,
            window_minutes,
        }
    }

    fn validate(&self, endpoint: Endpoint) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::Config(format!(
                "quota for {} must have a positive limit",
                endpoint
            )));
        }
        if self.window_minutes == 0 {
            return Err(TollgateError::Config(format!(
                "quota for {} must have a positive window",
                endpoint
            )));
        }
        Ok(())
    }
}

/// Default chat quota: 50 turns per UTC day.
pub const DEFAULT_CHAT_POLICY: QuotaPolicy = QuotaPolicy::new(50, 1440);
/// Default quiz generation quota: 10 quizzes per UTC day.
pub const DEFAULT_QUIZ_GENERATION_POLICY: QuotaPolicy = QuotaPolicy::new(10, 1440);

/// Immutable endpoint -> policy lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRegistry {
    policies: HashMap<Endpoint, QuotaPolicy>,
}

impl QuotaRegistry {
    /// Build a registry from explicit policies, rejecting non-positive values.
    pub fn new(policies: HashMap<Endpoint, QuotaPolicy>) -> Result<Self> {
        for (endpoint, policy) in &policies {
            policy.validate(*endpoint)?;
        }
        Ok(Self { policies })
    }

    /// The default policies with `overrides` applied on top.
    pub fn with_overrides(overrides: &HashMap<Endpoint, QuotaPolicy>) -> Result<Self> {
        let mut policies = Self::default().policies;
        policies.extend(overrides.iter().map(|(e, p)| (*e, *p)));
        Self::new(policies)
    }

    /// Look up the policy for an endpoint.
    pub fn policy_for(&self, endpoint: Endpoint) -> Result<QuotaPolicy> {
        self.policies
            .get(&endpoint)
            .copied()
            .ok_or_else(|| TollgateError::UnknownEndpoint(endpoint.to_string()))
    }

    /// Registered endpoints, in `Endpoint::ALL` order.
    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        Endpoint::ALL
            .into_iter()
            .filter(|e| self.policies.contains_key(e))
    }
}

impl Default for QuotaRegistry {
    fn default() -> Self {
        let policies = HashMap::from([
            (Endpoint::Chat, DEFAULT_CHAT_POLICY),
            (Endpoint::QuizGeneration, DEFAULT_QUIZ_GENERATION_POLICY),
        ]);
        Self { policies }
    }
}
