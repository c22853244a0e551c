//! Message and target model shared by the queue, dispatcher and senders

use crate::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

/// Message priority, ordinal 0 (low) through 3 (urgent)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" | "0" => Ok(Priority::Low),
            "normal" | "1" => Ok(Priority::Normal),
            "high" | "2" => Ok(Priority::High),
            "urgent" | "3" => Ok(Priority::Urgent),
            other => Err(DispatchError::validation(
                "priority",
                format!("unknown priority '{}'", other),
            )),
        }
    }
}

/// Body format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

/// One recipient on one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Validate)]
pub struct Target {
    /// Recipient kind understood by the platform, e.g. "user", "group", "email"
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "target type must not be empty"))]
    pub target_type: String,

    #[validate(length(min = 1, message = "target value must not be empty"))]
    pub value: String,

    #[validate(length(min = 1, message = "target platform must not be empty"))]
    pub platform: String,
}

impl Target {
    pub fn new<T, V, P>(target_type: T, value: V, platform: P) -> Self
    where
        T: Into<String>,
        V: Into<String>,
        P: Into<String>,
    {
        Self {
            target_type: target_type.into(),
            value: value.into(),
            platform: platform.into(),
        }
    }
}

/// Notification message handed to the dispatcher or the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Message {
    #[validate(length(min = 1, message = "message id must not be empty"))]
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// Opaque per-platform side-channel data keyed by platform name
    #[serde(default)]
    pub platform_data: HashMap<String, serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[validate(length(min = 1, message = "message must have at least one target"))]
    pub targets: Vec<Target>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new<T: Into<String>, B: Into<String>>(title: T, body: B) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            format: MessageFormat::default(),
            priority: Priority::default(),
            metadata: HashMap::new(),
            variables: HashMap::new(),
            platform_data: HashMap::new(),
            scheduled_at: None,
            targets: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Validate the message and every target before it is dispatched
    pub fn validate_for_dispatch(&self) -> Result<()> {
        self.validate()?;
        for target in &self.targets {
            target.validate()?;
        }
        Ok(())
    }

    /// Group targets by platform, keeping platforms in first-seen order
    pub fn targets_by_platform(&self) -> Vec<(String, Vec<Target>)> {
        let mut groups: Vec<(String, Vec<Target>)> = Vec::new();
        for target in &self.targets {
            match groups.iter_mut().find(|(p, _)| *p == target.platform) {
                Some((_, targets)) => targets.push(target.clone()),
                None => groups.push((target.platform.clone(), vec![target.clone()])),
            }
        }
        groups
    }

    pub fn platforms(&self) -> Vec<String> {
        self.targets_by_platform()
            .into_iter()
            .map(|(platform, _)| platform)
            .collect()
    }
}

/// Per-target outcome produced by a sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub target: Target,
    pub success: bool,
    /// Platform-assigned message id
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub response: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SendResult {
    pub fn success(target: Target, message_id: Option<String>) -> Self {
        Self {
            target,
            success: true,
            message_id,
            error: None,
            response: None,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn failure<E: Into<String>>(target: Target, error: E) -> Self {
        Self {
            target,
            success: false,
            message_id: None,
            error: Some(error.into()),
            response: None,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_response<S: Into<String>>(mut self, response: S) -> Self {
        self.response = Some(response.into());
        self
    }
}

/// What a sender supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub name: String,
    pub supported_target_types: Vec<String>,
    pub supported_formats: Vec<MessageFormat>,
    pub max_message_size: usize,
    pub supports_scheduling: bool,
    pub supports_attachments: bool,
    pub supports_rich_content: bool,
}

impl Capabilities {
    pub fn supports_target_type(&self, target_type: &str) -> bool {
        self.supported_target_types.iter().any(|t| t == target_type)
    }

    pub fn supports_format(&self, format: MessageFormat) -> bool {
        self.supported_formats.contains(&format)
    }
}
