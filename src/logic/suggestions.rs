use crate::error::Result;
use crate::logic::AdmissionQueue;
use crate::models::{Priority, QueueStatistics, Suggestion, SuggestionType};
use crate::repository::IrrigationSettingsRepository;
use chrono::{Duration, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Trailing window of queue history the heuristics look at.
pub const LOOKBACK_DAYS: i64 = 7;
pub const MAX_SUGGESTIONS: usize = 5;

const OPERATIONAL_START_HOUR: u32 = 5;
const OPERATIONAL_END_HOUR: u32 = 20;
const PEAK_HOURS_CONSIDERED: usize = 2;
/// Nearest earlier slots first, then later ones.
const SHIFT_OFFSETS: [i32; 6] = [-1, -2, -3, 1, 2, 3];

const SEQUENTIAL_AVG_DELAY_MINUTES: f64 = 5.0;
const CAPACITY_MAX_DELAY_MINUTES: f64 = 30.0;
const CAPACITY_TOTAL_QUEUED: usize = 20;

/// Mines queue history for schedule changes. Read-only.
pub struct SuggestionAnalyzer {
    queue: Arc<AdmissionQueue>,
    settings: Arc<dyn IrrigationSettingsRepository>,
}

impl SuggestionAnalyzer {
    pub fn new(queue: Arc<AdmissionQueue>, settings: Arc<dyn IrrigationSettingsRepository>) -> Self {
        Self { queue, settings }
    }

    pub async fn generate(&self, site_id: &str) -> Result<Vec<Suggestion>> {
        let stats = self.recent_statistics(site_id).await?;
        let suggestions = analyze(site_id, &stats);
        debug!(site_id, count = suggestions.len(), "Suggestions generated");
        Ok(suggestions)
    }

    /// Smart suggestions are on for the site and enough runs were queued
    /// recently to make them meaningful.
    pub async fn should_show(&self, site_id: &str) -> Result<bool> {
        let Some(settings) = self.settings.get_by_site_id(site_id).await? else {
            return Ok(false);
        };
        if !settings.enable_smart_suggestions {
            return Ok(false);
        }
        let stats = self.recent_statistics(site_id).await?;
        Ok(stats.total_queued >= settings.suggestion_threshold_count as usize)
    }

    async fn recent_statistics(&self, site_id: &str) -> Result<QueueStatistics> {
        let to = Utc::now();
        let from = to - Duration::days(LOOKBACK_DAYS);
        self.queue.statistics(site_id, from, to).await
    }
}

/// Runs every heuristic over `stats` and ranks the results.
pub fn analyze(site_id: &str, stats: &QueueStatistics) -> Vec<Suggestion> {
    if stats.total_queued == 0 {
        return Vec::new();
    }

    let heuristics: [fn(&str, &QueueStatistics) -> Option<Suggestion>; 3] =
        [peak_hour_shift, sequential_scheduling, system_capacity];

    let mut suggestions: Vec<Suggestion> = heuristics
        .iter()
        .filter_map(|heuristic| heuristic(site_id, stats))
        .collect();

    suggestions.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            b.estimated_impact_minutes
                .partial_cmp(&a.estimated_impact_minutes)
                .unwrap_or(Ordering::Equal)
        })
    });
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

fn peak_hour_shift(site_id: &str, stats: &QueueStatistics) -> Option<Suggestion> {
    for peak in stats.peak_queue_hours.iter().take(PEAK_HOURS_CONSIDERED) {
        if peak.count < 2 {
            continue;
        }
        let slot = SHIFT_OFFSETS.iter().find_map(|offset| {
            let hour = peak.hour as i32 + offset;
            if hour < OPERATIONAL_START_HOUR as i32 || hour > OPERATIONAL_END_HOUR as i32 {
                return None;
            }
            let hour = hour as u32;
            let count = stats.count_at_hour(hour);
            (count < peak.count).then_some((hour, count))
        });

        if let Some((hour, count)) = slot {
            let moved = (peak.count - count) as f64;
            return Some(
                Suggestion::new(
                    site_id,
                    SuggestionType::PeakHourShift,
                    Priority::Medium,
                    format!("Move runs out of the {:02}:00 peak", peak.hour),
                    format!(
                        "{} runs queued at {:02}:00 over the last {} days, only {} at {:02}:00",
                        peak.count, peak.hour, LOOKBACK_DAYS, count, hour
                    ),
                )
                .with_impact_minutes(moved * stats.average_delay_minutes)
                .with_data_point("Peak hour", format!("{:02}:00", peak.hour))
                .with_data_point("Queued at peak", peak.count)
                .with_data_point("Suggested hour", format!("{:02}:00", hour))
                .with_data_point("Queued at suggested hour", count)
                .with_action(format!(
                    "Reschedule some {:02}:00 programs to start at {:02}:00",
                    peak.hour, hour
                )),
            );
        }
    }
    None
}

fn sequential_scheduling(site_id: &str, stats: &QueueStatistics) -> Option<Suggestion> {
    if stats.average_delay_minutes <= SEQUENTIAL_AVG_DELAY_MINUTES {
        return None;
    }
    let priority = if stats.average_delay_minutes > 3.0 * SEQUENTIAL_AVG_DELAY_MINUTES {
        Priority::Medium
    } else {
        Priority::Low
    };

    Some(
        Suggestion::new(
            site_id,
            SuggestionType::SequentialScheduling,
            priority,
            "Stagger zone start times",
            format!(
                "Queued runs waited {:.1} minutes on average for flow capacity",
                stats.average_delay_minutes
            ),
        )
        .with_impact_minutes(stats.average_delay_minutes)
        .with_data_point("Average delay (min)", format!("{:.1}", stats.average_delay_minutes))
        .with_data_point("Runs queued", stats.total_queued)
        .with_action("Offset program start times so zones run one after another instead of together"),
    )
}

fn system_capacity(site_id: &str, stats: &QueueStatistics) -> Option<Suggestion> {
    if stats.max_delay_minutes <= CAPACITY_MAX_DELAY_MINUTES
        && stats.total_queued <= CAPACITY_TOTAL_QUEUED
    {
        return None;
    }

    Some(
        Suggestion::new(
            site_id,
            SuggestionType::SystemCapacity,
            Priority::High,
            "Review system flow capacity",
            format!(
                "{} runs queued in {} days, longest wait {:.0} minutes",
                stats.total_queued, LOOKBACK_DAYS, stats.max_delay_minutes
            ),
        )
        .with_impact_minutes(stats.max_delay_minutes)
        .with_data_point("Runs queued", stats.total_queued)
        .with_data_point("Max delay (min)", format!("{:.0}", stats.max_delay_minutes))
        .with_action(
            "Raise the site's maximum system flow rate if the supply allows, or upgrade pump and mainline capacity",
        ),
    )
}
