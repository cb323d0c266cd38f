//! Pure slot assignment. No I/O: the caller supplies everything and persists
//! the result.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc, Weekday};
use serde::Serialize;
use uuid::Uuid;

use super::tiers::{Tier, DAILY_SAFETY_CEILING};
use crate::models::directory::AutomationPreferences;

/// How far ahead a slot may be searched for.
const SEARCH_DAYS: u32 = 14;

#[derive(Debug, Clone)]
pub struct PlanItem {
    pub application_id: Uuid,
    pub score: f64,
    pub prepared_at: DateTime<Utc>,
    pub company: String,
    pub location: Option<String>,
    pub salary_max: Option<i64>,
}

/// A slot already held by another of the candidate's applications.
#[derive(Debug, Clone, Copy)]
pub struct BookedSlot {
    pub tier: Tier,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledSlot {
    pub application_id: Uuid,
    pub tier: Tier,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AutomationDisabled,
    ExcludedCompany,
    LocationMismatch,
    BelowMinSalary,
    DailyCapReached,
    NoSlotAvailable,
    /// Not pending, not tracked, or awaiting confirmation of an earlier submit.
    NotPending,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub application_id: Uuid,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulePlan {
    pub slots: Vec<ScheduledSlot>,
    pub skipped: Vec<SkippedItem>,
}

fn filter(item: &PlanItem, prefs: &AutomationPreferences) -> Option<SkipReason> {
    let company = item.company.trim().to_lowercase();
    if prefs
        .excluded_companies
        .iter()
        .any(|c| c.trim().to_lowercase() == company)
    {
        return Some(SkipReason::ExcludedCompany);
    }
    if let (false, Some(location)) = (prefs.locations.is_empty(), item.location.as_deref()) {
        let location = location.to_lowercase();
        if !prefs
            .locations
            .iter()
            .any(|l| location.contains(&l.trim().to_lowercase()))
        {
            return Some(SkipReason::LocationMismatch);
        }
    }
    if let (Some(min), Some(max)) = (prefs.min_salary, item.salary_max) {
        if max < min {
            return Some(SkipReason::BelowMinSalary);
        }
    }
    None
}

/// Preferred hours collapse into contiguous `[start, end)` windows.
fn preferred_windows(hours: &[u32]) -> Vec<(u32, u32)> {
    let mut hours: Vec<u32> = hours.iter().copied().filter(|h| *h < 24).collect();
    hours.sort_unstable();
    hours.dedup();
    let mut windows: Vec<(u32, u32)> = Vec::new();
    for h in hours {
        match windows.last_mut() {
            Some((_, end)) if *end == h => *end = h + 1,
            _ => windows.push((h, h + 1)),
        }
    }
    windows
}

fn window_bounds(day: NaiveDate, (start, end): (u32, u32)) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let open = day.and_hms_opt(start, 0, 0)?;
    let close = if end >= 24 {
        day.succ_opt()?.and_hms_opt(0, 0, 0)?
    } else {
        day.and_hms_opt(end, 0, 0)?
    };
    Some((open, close))
}

/// Earliest weekday instant `>= from` that falls inside one of `windows`.
pub fn next_slot(from: NaiveDateTime, windows: &[(u32, u32)]) -> Option<NaiveDateTime> {
    let mut day = from.date();
    for _ in 0..SEARCH_DAYS {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            for &window in windows {
                let Some((open, close)) = window_bounds(day, window) else {
                    continue;
                };
                let candidate = from.max(open);
                if candidate < close {
                    return Some(candidate);
                }
            }
        }
        day = day.succ_opt()?;
    }
    None
}

fn round_up_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    let trimmed = t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t);
    if trimmed < t {
        trimmed + Duration::minutes(1)
    } else {
        trimmed
    }
}

/// Assigns slots tier by tier (high, medium, low), best score first.
pub fn plan(
    now: DateTime<Utc>,
    prefs: &AutomationPreferences,
    items: Vec<PlanItem>,
    booked: &[BookedSlot],
) -> SchedulePlan {
    let mut plan = SchedulePlan::default();
    if !prefs.enabled {
        plan.skipped = items
            .into_iter()
            .map(|i| SkippedItem {
                application_id: i.application_id,
                reason: SkipReason::AutomationDisabled,
            })
            .collect();
        return plan;
    }

    let offset = Duration::minutes(prefs.utc_offset_minutes as i64);
    let to_local = |t: DateTime<Utc>| t.naive_utc() + offset;
    let to_utc = |t: NaiveDateTime| Utc.from_utc_datetime(&(t - offset));
    let now_local = round_up_to_minute(to_local(now));
    let ceiling = prefs.daily_cap.min(DAILY_SAFETY_CEILING);

    let mut per_day: HashMap<NaiveDate, u32> = HashMap::new();
    let mut per_tier_day: HashMap<(Tier, NaiveDate), u32> = HashMap::new();
    let mut cursor: HashMap<Tier, NaiveDateTime> = HashMap::new();
    for slot in booked {
        let local = to_local(slot.at);
        *per_day.entry(local.date()).or_default() += 1;
        *per_tier_day.entry((slot.tier, local.date())).or_default() += 1;
        let last = cursor.entry(slot.tier).or_insert(local);
        *last = (*last).max(local);
    }

    let mut by_tier: HashMap<Tier, Vec<PlanItem>> = HashMap::new();
    for item in items {
        match filter(&item, prefs) {
            Some(reason) => plan.skipped.push(SkippedItem {
                application_id: item.application_id,
                reason,
            }),
            None => by_tier.entry(Tier::for_score(item.score)).or_default().push(item),
        }
    }

    let custom_windows = prefs
        .preferred_hours
        .as_deref()
        .map(preferred_windows)
        .filter(|w| !w.is_empty());

    for tier in Tier::ORDER {
        let Some(mut queue) = by_tier.remove(&tier) else {
            continue;
        };
        queue.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.prepared_at.cmp(&b.prepared_at))
        });

        let policy = tier.policy();
        let cap = policy.daily_cap.min(ceiling);
        let windows = custom_windows.clone().unwrap_or_else(|| policy.windows.to_vec());
        let window_minutes: i64 = windows.iter().map(|(s, e)| (e.min(&24) - s) as i64 * 60).sum();
        let booked_today = per_tier_day
            .get(&(tier, now_local.date()))
            .copied()
            .unwrap_or(0);
        let needed = (queue.len() as u32).saturating_add(booked_today).min(cap).max(1);
        // Tighter than the tier delay only when the day's slots cannot fit at full delay.
        let spacing = Duration::minutes(policy.delay_minutes.min(window_minutes / needed as i64).max(1));

        for item in queue {
            let reason = if cap == 0 {
                Some(SkipReason::DailyCapReached)
            } else {
                let earliest = match cursor.get(&tier) {
                    Some(last) => now_local.max(*last + spacing),
                    None => now_local,
                };
                match next_slot(earliest, &windows) {
                    None => Some(SkipReason::NoSlotAvailable),
                    Some(slot) => {
                        let day = slot.date();
                        let tier_count = per_tier_day.get(&(tier, day)).copied().unwrap_or(0);
                        let day_count = per_day.get(&day).copied().unwrap_or(0);
                        if tier_count >= cap || day_count >= ceiling {
                            Some(SkipReason::DailyCapReached)
                        } else {
                            *per_tier_day.entry((tier, day)).or_default() += 1;
                            *per_day.entry(day).or_default() += 1;
                            cursor.insert(tier, slot);
                            plan.slots.push(ScheduledSlot {
                                application_id: item.application_id,
                                tier,
                                at: to_utc(slot),
                            });
                            None
                        }
                    }
                }
            };
            if let Some(reason) = reason {
                plan.skipped.push(SkippedItem {
                    application_id: item.application_id,
                    reason,
                });
            }
        }
    }
    plan
}
