use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionType {
    PeakHourShift,
    SequentialScheduling,
    SystemCapacity,
}

impl SuggestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionType::PeakHourShift => "Peak Hour Shift",
            SuggestionType::SequentialScheduling => "Sequential Scheduling",
            SuggestionType::SystemCapacity => "System Capacity",
        }
    }
}

impl std::fmt::Display for SuggestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Priority::Low => "→",
            Priority::Medium => "⚠",
            Priority::High => "!",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub label: String,
    pub value: String,
}

impl DataPoint {
    pub fn new(label: &str, value: impl std::fmt::Display) -> Self {
        Self {
            label: label.to_string(),
            value: value.to_string(),
        }
    }
}

/// A schedule change recommendation. Never applied automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub site_id: String,
    pub suggestion_type: SuggestionType,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub estimated_impact_minutes: f64,
    pub data_points: Vec<DataPoint>,
    pub suggested_action: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    pub fn new(
        site_id: impl Into<String>,
        suggestion_type: SuggestionType,
        priority: Priority,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            suggestion_type,
            priority,
            title: title.into(),
            description: description.into(),
            estimated_impact_minutes: 0.0,
            data_points: Vec::new(),
            suggested_action: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_impact_minutes(mut self, minutes: f64) -> Self {
        self.estimated_impact_minutes = minutes;
        self
    }

    pub fn with_data_point(mut self, label: &str, value: impl std::fmt::Display) -> Self {
        self.data_points.push(DataPoint::new(label, value));
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }
}
