//! Calculations behind the agency reports. Queries live in the route module;
//! everything here is pure so the figures can be checked without a database.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;

use crate::models::{ClientType, LineOfBusiness};

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;
const ESTIMATED_COMMISSION_RATE: f64 = 0.10;
const RENEWAL_SHARE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Overview,
    Expirations,
    Commissions,
    Production,
}

impl ReportType {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.unwrap_or("overview") {
            "overview" => Some(ReportType::Overview),
            "expirations" => Some(ReportType::Expirations),
            "commissions" => Some(ReportType::Commissions),
            "production" => Some(ReportType::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeRange {
    /// Unknown or missing ranges mean a month.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("week") => TimeRange::Week,
            Some("quarter") => TimeRange::Quarter,
            Some("year") => TimeRange::Year,
            _ => TimeRange::Month,
        }
    }

    pub fn days(self) -> i64 {
        match self {
            TimeRange::Week => 7,
            TimeRange::Month => 30,
            TimeRange::Quarter => 90,
            TimeRange::Year => 365,
        }
    }

    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.days())
    }
}

/// Rounds half up to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor + 0.5).floor() / factor
}

pub fn commission_rate(line: LineOfBusiness) -> f64 {
    match line {
        LineOfBusiness::Health => 10.0,
        LineOfBusiness::Life => 50.0,
        LineOfBusiness::PersonalAuto => 12.0,
        LineOfBusiness::Homeowners => 15.0,
        LineOfBusiness::Commercial => 12.0,
        LineOfBusiness::Other => 10.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Paid,
    Processing,
    Pending,
}

/// Payment status estimated from policy age: paid after 30 full days (dated
/// 30 days after creation), processing after 14.
pub fn commission_status(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (CommissionStatus, Option<NaiveDate>) {
    let age_days = (now - created_at).num_days();
    if age_days > 30 {
        let paid = (created_at + Duration::days(30)).date_naive();
        (CommissionStatus::Paid, Some(paid))
    } else if age_days > 14 {
        (CommissionStatus::Processing, None)
    } else {
        (CommissionStatus::Pending, None)
    }
}

pub fn client_display_name(
    client_type: Option<ClientType>,
    first_name: Option<&str>,
    last_name: Option<&str>,
    business_name: Option<&str>,
) -> Option<String> {
    if client_type == Some(ClientType::Business) {
        return business_name.map(str::to_string);
    }
    Some(
        format!("{} {}", first_name.unwrap_or(""), last_name.unwrap_or(""))
            .trim()
            .to_string(),
    )
}

/// Whole days until midnight UTC of `date`, rounded up.
pub fn days_until(date: NaiveDate, now: DateTime<Utc>) -> i64 {
    let days_ahead = date.signed_duration_since(now.date_naive()).num_days() as f64;
    let elapsed_today =
        f64::from(now.num_seconds_from_midnight()) * 1000.0 + f64::from(now.timestamp_subsec_millis());
    ((days_ahead * DAY_MS - elapsed_today) / DAY_MS).ceil() as i64
}

pub fn monthly_commissions(total_active_premium: f64) -> f64 {
    round_to(total_active_premium * ESTIMATED_COMMISSION_RATE / 12.0, 2)
}

/// Percentage change of the active policy count against the policies that
/// existed before the range started; 0 without a baseline.
pub fn policies_change(active_policies: i64, previous_policies: i64) -> f64 {
    if previous_policies <= 0 {
        return 0.0;
    }
    let change = (active_policies - previous_policies) as f64 / previous_policies as f64 * 100.0;
    round_to(change, 1)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionSummary {
    pub total_earned: f64,
    pub pending_payment: f64,
    pub avg_rate: f64,
    pub total_policies: usize,
}

/// `(rate, commission, status)` per policy in the report.
pub fn summarize_commissions(lines: &[(f64, f64, CommissionStatus)]) -> CommissionSummary {
    let (mut earned, mut pending, mut rates) = (0.0, 0.0, 0.0);
    for (rate, commission, status) in lines {
        if *status == CommissionStatus::Paid {
            earned += commission;
        } else {
            pending += commission;
        }
        rates += rate;
    }
    let avg_rate = if lines.is_empty() {
        0.0
    } else {
        rates / lines.len() as f64
    };
    CommissionSummary {
        total_earned: round_to(earned, 2),
        pending_payment: round_to(pending, 2),
        avg_rate: round_to(avg_rate, 1),
        total_policies: lines.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionFigure {
    pub count: i64,
    pub premium: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionByType {
    #[serde(rename = "type")]
    pub line_of_business: LineOfBusiness,
    pub count: i64,
    pub premium: f64,
    pub percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Production {
    pub new_business: ProductionFigure,
    pub renewals: ProductionFigure,
    pub lapsed: ProductionFigure,
    pub retention_rate: f64,
    pub production_by_type: Vec<ProductionByType>,
}

/// Splits policies written in the range into renewals and new business and
/// breaks their premium down by line, in order of first appearance.
pub fn production(
    written: &[(LineOfBusiness, f64)],
    active_policies: i64,
    lapsed_policies: i64,
) -> Production {
    let written_count = written.len() as i64;
    let written_premium: f64 = written.iter().map(|(_, premium)| premium).sum();
    let renewal_count = round_to(written_count as f64 * RENEWAL_SHARE, 0) as i64;
    let renewal_premium = round_to(written_premium * RENEWAL_SHARE, 0);

    let mut by_type: Vec<ProductionByType> = Vec::new();
    for (line, premium) in written {
        match by_type.iter_mut().find(|entry| entry.line_of_business == *line) {
            Some(entry) => {
                entry.count += 1;
                entry.premium += premium;
            }
            None => by_type.push(ProductionByType {
                line_of_business: *line,
                count: 1,
                premium: *premium,
                percentage: 0,
            }),
        }
    }
    let total: f64 = by_type.iter().map(|entry| entry.premium).sum();
    if total > 0.0 {
        for entry in &mut by_type {
            entry.percentage = round_to(entry.premium / total * 100.0, 0) as i64;
        }
    }

    let retained = active_policies + lapsed_policies;
    let retention_rate = if retained > 0 {
        active_policies as f64 / retained as f64 * 100.0
    } else {
        100.0
    };

    Production {
        new_business: ProductionFigure {
            count: written_count - renewal_count,
            premium: written_premium - renewal_premium,
        },
        renewals: ProductionFigure {
            count: renewal_count,
            premium: renewal_premium,
        },
        lapsed: ProductionFigure {
            count: lapsed_policies,
            premium: 0.0,
        },
        retention_rate: round_to(retention_rate, 1),
        production_by_type: by_type,
    }
}
