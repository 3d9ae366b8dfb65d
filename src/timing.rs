//! Hourly activity histograms, peak hours, and posting-time scoring.

use anyhow::Result;
use serde::Serialize;

use crate::event::now_unix;
use crate::store::Store;

/// Histogram kinds persisted in `network_activity`.
pub const KIND_FOLLOWER_POST: &str = "follower_post";
pub const KIND_FOLLOWING_POST: &str = "following_post";
pub const KIND_ENGAGEMENT: &str = "engagement";

/// Author roles recorded in `post_activity`.
pub const ROLE_FOLLOWER: &str = "follower";
pub const ROLE_FOLLOWING: &str = "following";
pub const ROLE_SELF: &str = "self";

/// The contiguous GMT window with the densest activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub start_hour: u8,
    pub width: u8,
    pub sum: u64,
    pub percentage_of_total: f64,
}

/// Roll post activity and events into today's 24-bucket histograms.
pub fn run_aggregation(store: &Store, tenant_id: i64, window_days: u32) -> Result<()> {
    let since = now_unix().saturating_sub(window_days as u64 * 86_400);
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let sources = [
        (
            KIND_FOLLOWER_POST,
            store.activity_hourly(tenant_id, ROLE_FOLLOWER, since)?,
        ),
        (
            KIND_FOLLOWING_POST,
            store.activity_hourly(tenant_id, ROLE_FOLLOWING, since)?,
        ),
        (KIND_ENGAGEMENT, store.engagement_hourly(tenant_id, since)?),
    ];
    for (kind, counts) in sources {
        for (hour, count) in counts.iter().enumerate() {
            store.upsert_network_activity(tenant_id, kind, hour as u8, *count, &today)?;
        }
    }
    Ok(())
}

/// Zone of maximum participation: the 3-6 hour circular window with the
/// highest per-hour activity density. Ties prefer the narrower window, then
/// the earlier start. `None` when there is no activity at all.
pub fn zone_of_participation(counts: &[u64; 24]) -> Option<Zone> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    let mut best: Option<(f64, u64, u8, u8)> = None;
    for width in 3u8..=6 {
        for start in 0u8..24 {
            let sum: u64 = (0..width)
                .map(|i| counts[((start + i) % 24) as usize])
                .sum();
            let density = sum as f64 / width as f64;
            if best.map_or(true, |(d, ..)| density > d) {
                best = Some((density, sum, width, start));
            }
        }
    }
    let (_, sum, width, start_hour) = best?;
    Some(Zone {
        start_hour,
        width,
        sum,
        percentage_of_total: sum as f64 / total as f64 * 100.0,
    })
}

/// The up-to-three busiest hours, descending, ties to the lower hour.
/// Hours without activity never qualify.
pub fn peak_hours(counts: &[u64; 24]) -> Vec<u8> {
    let mut hours: Vec<u8> = (0u8..24).filter(|&h| counts[h as usize] > 0).collect();
    hours.sort_by(|a, b| {
        counts[*b as usize]
            .cmp(&counts[*a as usize])
            .then(a.cmp(b))
    });
    hours.truncate(3);
    hours
}

/// One recommended posting hour.
#[derive(Debug, Clone, Serialize)]
pub struct PostingTime {
    pub hour: u8,
    /// 0-100, relative to the best hour.
    pub score: u8,
    pub reason: String,
    pub reach: &'static str,
}

/// Scored recommendations plus a confidence grade.
#[derive(Debug, Clone, Serialize)]
pub struct BestTimes {
    pub times: Vec<PostingTime>,
    pub confidence: &'static str,
}

/// Combine follower-post and engagement histograms into the top five
/// recommended posting hours.
pub fn best_posting_times(follower: &[u64; 24], engagement: &[u64; 24]) -> BestTimes {
    let raw: Vec<f64> = (0..24)
        .map(|h| 0.6 * follower[h] as f64 + 0.4 * engagement[h] as f64)
        .collect();
    let top = raw.iter().cloned().fold(0.0f64, f64::max);
    let mut hours: Vec<u8> = (0u8..24).filter(|&h| raw[h as usize] > 0.0).collect();
    hours.sort_by(|a, b| {
        raw[*b as usize]
            .partial_cmp(&raw[*a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });
    hours.truncate(5);
    let times = hours
        .into_iter()
        .map(|hour| {
            let h = hour as usize;
            let score = (raw[h] / top * 100.0).round() as u8;
            let reason = if 0.6 * follower[h] as f64 >= 0.4 * engagement[h] as f64 {
                format!("{} of your followers post around this hour", follower[h])
            } else {
                format!("your posts drew {} engagements around this hour", engagement[h])
            };
            PostingTime {
                hour,
                score,
                reason,
                reach: reach_band(score),
            }
        })
        .collect();
    let points: u64 = follower.iter().sum::<u64>() + engagement.iter().sum::<u64>();
    BestTimes {
        times,
        confidence: confidence(points),
    }
}

fn reach_band(score: u8) -> &'static str {
    match score {
        80..=100 => "high",
        60..=79 => "medium-high",
        40..=59 => "medium",
        _ => "low",
    }
}

fn confidence(points: u64) -> &'static str {
    match points {
        0..=499 => "low",
        500..=999 => "medium",
        _ => "high",
    }
}
