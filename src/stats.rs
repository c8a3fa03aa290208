//! Chart datasets from daily creative statistics.
//!
//! Stats are bucketed per label (a creative or one of its ancestors, named
//! through the service tree) and per UTC day. Labels are ranked by their
//! metric over the requested range and paged with `offset`/`limit`.

use crate::model::EntityKind;
use crate::tree::ServiceTree;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use thiserror::Error;

const UNKNOWN_LABEL: &str = "unknown";
const DEFAULT_LIMIT: usize = 5;
const DEFAULT_RANGE_DAYS: u64 = 30;
/// Longest range a chart may span, in days.
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("date range spans {days} days, at most {max} allowed")]
    RangeTooLong { days: i64, max: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeStat {
    pub creative_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub impression_count: u64,
    #[serde(default)]
    pub click_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub impression_count: u64,
    pub click_count: u64,
}

impl AddAssign<&CreativeStat> for Counts {
    fn add_assign(&mut self, stat: &CreativeStat) {
        self.impression_count += stat.impression_count;
        self.click_count += stat.click_count;
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, other: Counts) {
        self.impression_count += other.impression_count;
        self.click_count += other.click_count;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    ImpressionCount,
    ClickCount,
    Ctr,
}

impl Metric {
    pub fn value(&self, counts: &Counts) -> f64 {
        match self {
            Self::ImpressionCount => counts.impression_count as f64,
            Self::ClickCount => counts.click_count as f64,
            Self::Ctr if counts.impression_count == 0 => 0.0,
            Self::Ctr => counts.click_count as f64 / counts.impression_count as f64,
        }
    }
}

/// Level of the ad hierarchy that stats are grouped under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupBy {
    Creative,
    AdGroup,
    Campaign,
    Placement,
}

impl GroupBy {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Creative => EntityKind::Creative,
            Self::AdGroup => EntityKind::AdGroup,
            Self::Campaign => EntityKind::Campaign,
            Self::Placement => EntityKind::Placement,
        }
    }
}

pub type LabelDayCounts = BTreeMap<String, BTreeMap<NaiveDate, Counts>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRequest {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub stats: Vec<CreativeStat>,
    pub group_by: GroupBy,
    pub metric: Metric,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    /// One entry per day of the range.
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
    /// Number of distinct labels before paging.
    pub num_of_labels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDataset {
    pub label: String,
    pub data: Vec<f64>,
    pub border_width: u32,
    pub border_color: String,
    pub background_color: String,
}

/// `[today - 30 days, today]`.
pub fn default_date_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today
        .checked_sub_days(Days::new(DEFAULT_RANGE_DAYS))
        .unwrap_or(NaiveDate::MIN);
    (start, today)
}

/// Every day from `start` to `end`, inclusive.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|day| *day <= end).collect()
}

/// Name of the creative's ancestor at the `group_by` level.
pub fn resolve_label(tree: &ServiceTree, group_by: GroupBy, creative_id: &str) -> String {
    tree.ancestor(EntityKind::Creative, creative_id, group_by.kind())
        .and_then(|node| node.name().or(node.id()))
        .unwrap_or(UNKNOWN_LABEL)
        .to_string()
}

pub fn aggregate_label_day_counts<'a, I>(stats: I) -> LabelDayCounts
where
    I: IntoIterator<Item = (String, &'a CreativeStat)>,
{
    let mut aggregated = LabelDayCounts::new();
    for (label, stat) in stats {
        *aggregated
            .entry(label)
            .or_default()
            .entry(stat.time.date_naive())
            .or_default() += stat;
    }
    aggregated
}

/// Labels ordered by `metric` over their total counts, highest first.
pub fn rank_labels(aggregated: &LabelDayCounts, metric: Metric) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = aggregated
        .iter()
        .map(|(label, days)| {
            let mut total = Counts::default();
            for counts in days.values() {
                total += *counts;
            }
            (label.clone(), metric.value(&total))
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Split ranked labels into the requested page and everything else.
pub fn split_top(
    aggregated: &LabelDayCounts,
    metric: Metric,
    offset: usize,
    limit: usize,
) -> (Vec<String>, Vec<String>) {
    let mut include = Vec::new();
    let mut others = Vec::new();
    for (rank, (label, _)) in rank_labels(aggregated, metric).into_iter().enumerate() {
        if rank >= offset && rank < offset.saturating_add(limit) {
            include.push(label);
        } else {
            others.push(label);
        }
    }
    (include, others)
}

/// Deterministic color for a label, stable across runs and clients.
pub fn label_color(label: &str) -> [u8; 3] {
    let mut hash: i32 = 0;
    for unit in label.encode_utf16() {
        hash = i32::from(unit).wrapping_add((hash << 5).wrapping_sub(hash));
    }
    [0, 1, 2].map(|i| ((hash >> (i * 8)) & 0xff) as u8)
}

pub fn build_datasets(
    tree: &ServiceTree,
    request: &DatasetRequest,
) -> Result<ChartData, StatsError> {
    let (Some(start), Some(end)) = (request.start_date, request.end_date) else {
        return Ok(ChartData::default());
    };
    let span = (end - start).num_days() + 1;
    if span > MAX_RANGE_DAYS {
        return Err(StatsError::RangeTooLong {
            days: span,
            max: MAX_RANGE_DAYS,
        });
    }
    let days = days_between(start, end);

    let aggregated = aggregate_label_day_counts(
        request
            .stats
            .iter()
            .filter(|stat| {
                let day = stat.time.date_naive();
                day >= start && day <= end
            })
            .map(|stat| (resolve_label(tree, request.group_by, &stat.creative_id), stat)),
    );

    let (top, _) = split_top(
        &aggregated,
        request.metric,
        request.offset.unwrap_or(0),
        request.limit.unwrap_or(DEFAULT_LIMIT),
    );

    let datasets = top
        .into_iter()
        .map(|label| {
            let series = aggregated.get(&label);
            let data = days
                .iter()
                .map(|day| {
                    series
                        .and_then(|s| s.get(day))
                        .map(|counts| request.metric.value(counts))
                        .unwrap_or(0.0)
                })
                .collect();
            let [r, g, b] = label_color(&label);
            ChartDataset {
                label,
                data,
                border_width: 1,
                border_color: format!("rgb({}, {}, {})", r, g, b),
                background_color: format!("rgba({}, {}, {}, 0.5)", r, g, b),
            }
        })
        .collect();

    Ok(ChartData {
        labels: days.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect(),
        datasets,
        num_of_labels: aggregated.len(),
    })
}
