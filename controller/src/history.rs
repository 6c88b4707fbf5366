//! History recording & daily maintenance (§4.11). Bucketing, reset-tolerant
//! delta accumulation, and the idempotent daily aggregation/deletion pass.

use crate::repository::HistoryRepository;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use komari_forward_core::model::{ForwardTrafficHistory, NodeId, RuleId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryPeriod {
	TenMin,
	ThirtyMin,
	OneHour,
	OneDay,
}

impl Default for HistoryPeriod {
	fn default() -> Self {
		HistoryPeriod::OneHour
	}
}

pub fn bucket_timestamp(period: HistoryPeriod, ts: DateTime<Utc>) -> DateTime<Utc> {
	match period {
		HistoryPeriod::TenMin => truncate_minutes(ts, 10),
		HistoryPeriod::ThirtyMin => truncate_minutes(ts, 30),
		HistoryPeriod::OneHour => ts.date_naive().and_hms_opt(ts.hour(), 0, 0).expect("valid hour").and_utc(),
		HistoryPeriod::OneDay => ts.date_naive().and_hms_opt(0, 0, 0).expect("midnight always valid").and_utc(),
	}
}

fn truncate_minutes(ts: DateTime<Utc>, step: u32) -> DateTime<Utc> {
	let minute = (ts.minute() / step) * step;
	ts.date_naive().and_hms_opt(ts.hour(), minute, 0).expect("valid minute").and_utc()
}

/// Records one tick's delta into its bucket. Reset-tolerant: if the counter
/// went backwards (daemon restart), the raw new value is used in place of a
/// negative delta rather than underflowing.
pub fn record_tick(
	repo: &dyn HistoryRepository,
	period: HistoryPeriod,
	rule_id: RuleId,
	node_id: &str,
	now: DateTime<Utc>,
	bytes_in: u64,
	bytes_out: u64,
	prev_bytes_in: u64,
	prev_bytes_out: u64,
	connections: u64,
	avg_latency_ms: f64,
) {
	let delta_in = if bytes_in >= prev_bytes_in { bytes_in - prev_bytes_in } else { bytes_in };
	let delta_out = if bytes_out >= prev_bytes_out { bytes_out - prev_bytes_out } else { bytes_out };
	let bucket = bucket_timestamp(period, now);
	repo.accumulate(rule_id, node_id, bucket, delta_in, delta_out, connections, avg_latency_ms);
}

/// Average `bytes_in + bytes_out` over the last `n` buckets, excluding the
/// newest one (§4.12 traffic-spike baseline). `rows` must already be
/// ascending by timestamp (as `HistoryRepository::rows_for_node` returns).
pub fn recent_average_bytes(rows: &[ForwardTrafficHistory], n: usize) -> Option<f64> {
	if rows.len() < 2 {
		return None;
	}
	let without_newest = &rows[..rows.len() - 1];
	let window = &without_newest[without_newest.len().saturating_sub(n)..];
	if window.is_empty() {
		return None;
	}
	let total: u64 = window.iter().map(|r| r.bytes_in + r.bytes_out).sum();
	Some(total as f64 / window.len() as f64)
}

/// The explicit, single-fire-per-UTC-date concurrency guard (§9 "global
/// mutable state → explicit service object") that daily maintenance is
/// gated behind.
#[derive(Default)]
pub struct MaintenanceGuard {
	last_run_date: Mutex<Option<NaiveDate>>,
}

impl MaintenanceGuard {
	pub fn new() -> Self {
		Self::default()
	}

	/// Claims today's run. Returns `false` (without side effects) if
	/// maintenance already ran for this UTC date.
	fn try_begin(&self, today: NaiveDate) -> bool {
		let mut guard = self.last_run_date.lock();
		if *guard == Some(today) {
			return false;
		}
		*guard = Some(today);
		true
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum MaintenanceOutcome {
	Ran,
	Skipped,
}

/// Daily maintenance (§4.11): rolls 30-day-to-1-year-old rows up to hour
/// buckets (catching up at most 30 days of backlog per run), rolls
/// 1-to-3-year-old rows up to day buckets, and deletes anything older than
/// 3 years. Idempotent per UTC date via `guard`.
pub fn run_daily_maintenance(repo: &dyn HistoryRepository, guard: &MaintenanceGuard, now: DateTime<Utc>) -> MaintenanceOutcome {
	if !guard.try_begin(now.date_naive()) {
		return MaintenanceOutcome::Skipped;
	}

	let hour_bucket_upper = now - Duration::days(30);
	let hour_bucket_floor = now - Duration::days(365);
	let hour_bucket_lower = hour_bucket_floor.max(hour_bucket_upper - Duration::days(30));
	aggregate_window(repo, hour_bucket_lower, hour_bucket_upper, HistoryPeriod::OneHour);

	let day_bucket_upper = now - Duration::days(365);
	let day_bucket_lower = now - Duration::days(365 * 3);
	aggregate_window(repo, day_bucket_lower, day_bucket_upper, HistoryPeriod::OneDay);

	repo.delete_older_than(now - Duration::days(365 * 3));
	MaintenanceOutcome::Ran
}

fn aggregate_window(repo: &dyn HistoryRepository, lower: DateTime<Utc>, upper: DateTime<Utc>, granularity: HistoryPeriod) {
	let mut groups: BTreeMap<(RuleId, NodeId, DateTime<Utc>), Vec<ForwardTrafficHistory>> = BTreeMap::new();
	for row in repo.rows_older_than(upper).into_iter().filter(|r| r.timestamp_bucket >= lower) {
		let bucket = bucket_timestamp(granularity, row.timestamp_bucket);
		groups.entry((row.rule_id, row.node_id.clone(), bucket)).or_default().push(row);
	}

	for ((rule_id, node_id, bucket_start), rows) in groups {
		if rows.len() <= 1 && rows.first().is_some_and(|r| r.timestamp_bucket == bucket_start) {
			continue; // already a singleton bucket-start row, nothing to merge
		}
		let bytes_in: u64 = rows.iter().map(|r| r.bytes_in).sum();
		let bytes_out: u64 = rows.iter().map(|r| r.bytes_out).sum();
		let avg_connections = rows.iter().map(|r| r.connections as f64).sum::<f64>() / rows.len() as f64;
		let avg_latency = rows.iter().map(|r| r.avg_latency_ms).sum::<f64>() / rows.len() as f64;
		let old_timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp_bucket).collect();
		repo.replace_with_bucket(
			rule_id,
			&node_id,
			&old_timestamps,
			ForwardTrafficHistory {
				rule_id,
				node_id,
				timestamp_bucket: bucket_start,
				bytes_in,
				bytes_out,
				connections: avg_connections.round() as u64,
				avg_latency_ms: avg_latency,
			},
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::InMemoryHistoryRepository;
	use chrono::TimeZone;

	#[test]
	fn hour_bucket_truncates_to_the_hour() {
		let ts = Utc.with_ymd_and_hms(2026, 7, 28, 14, 37, 9).unwrap();
		let bucket = bucket_timestamp(HistoryPeriod::OneHour, ts);
		assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 7, 28, 14, 0, 0).unwrap());
	}

	#[test]
	fn day_bucket_is_midnight_utc() {
		let ts = Utc.with_ymd_and_hms(2026, 7, 28, 23, 59, 0).unwrap();
		let bucket = bucket_timestamp(HistoryPeriod::OneDay, ts);
		assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap());
	}

	#[test]
	fn negative_delta_falls_back_to_raw_value() {
		let repo = InMemoryHistoryRepository::default();
		let now = Utc::now();
		record_tick(&repo, HistoryPeriod::OneHour, 1, "A", now, 100, 50, 900, 400, 3, 5.0);
		let rows = repo.rows_for_node(1, "A");
		assert_eq!(rows[0].bytes_in, 100);
		assert_eq!(rows[0].bytes_out, 50);
	}

	#[test]
	fn positive_delta_accumulates() {
		let repo = InMemoryHistoryRepository::default();
		let now = Utc::now();
		record_tick(&repo, HistoryPeriod::OneHour, 1, "A", now, 1000, 500, 900, 400, 3, 5.0);
		let rows = repo.rows_for_node(1, "A");
		assert_eq!(rows[0].bytes_in, 100);
		assert_eq!(rows[0].bytes_out, 100);
	}

	#[test]
	fn maintenance_is_idempotent_within_a_utc_date() {
		let repo = InMemoryHistoryRepository::default();
		let guard = MaintenanceGuard::new();
		let now = Utc::now();
		assert_eq!(run_daily_maintenance(&repo, &guard, now), MaintenanceOutcome::Ran);
		assert_eq!(run_daily_maintenance(&repo, &guard, now + Duration::hours(2)), MaintenanceOutcome::Skipped);
	}

	// §8 scenario 5: a per-minute backlog 31 days old collapses to one row
	// per hour per (rule, node), bytes summed.
	#[test]
	fn daily_maintenance_aggregates_old_rows_into_hour_buckets() {
		let repo = InMemoryHistoryRepository::default();
		let guard = MaintenanceGuard::new();
		let now = Utc::now();
		let day_minus_31 = now - Duration::days(31);
		for minute in 0..5 {
			repo.accumulate(3, "A", day_minus_31 + Duration::minutes(minute), 10, 20, 1, 1.0);
		}
		run_daily_maintenance(&repo, &guard, now);
		let rows = repo.rows_for_node(3, "A");
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].bytes_in, 50);
		assert_eq!(rows[0].bytes_out, 100);
		assert_eq!(rows[0].timestamp_bucket, bucket_timestamp(HistoryPeriod::OneHour, day_minus_31));
	}

	#[test]
	fn recent_average_excludes_newest_bucket() {
		let rows: Vec<ForwardTrafficHistory> = (0..13)
			.map(|i| ForwardTrafficHistory {
				rule_id: 1,
				node_id: "A".into(),
				timestamp_bucket: Utc::now() + Duration::hours(i),
				bytes_in: 100,
				bytes_out: 0,
				connections: 1,
				avg_latency_ms: 1.0,
			})
			.collect();
		let avg = recent_average_bytes(&rows, 12).unwrap();
		assert_eq!(avg, 100.0);
	}
}
