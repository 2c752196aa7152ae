use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::{
    auth::{internal_error, AuthenticatedUser},
    models::{ClientType, LineOfBusiness, PolicyStatus},
    services::reports::{
        client_display_name, commission_rate, commission_status, days_until, monthly_commissions,
        policies_change, production, round_to, summarize_commissions, CommissionStatus,
        CommissionSummary, Production, ReportType, TimeRange,
    },
    state::AppState,
};

const EXPIRATION_WINDOW_DAYS: i64 = 60;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQuery {
    #[serde(rename = "type")]
    pub report_type: Option<String>,
    pub time_range: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub total_policies: i64,
    pub policies_change: f64,
    pub active_clients: i64,
    pub monthly_commissions: f64,
    pub expiring_this_month: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringPolicyLine {
    pub id: Uuid,
    pub policy_number: String,
    pub client_name: Option<String>,
    #[serde(rename = "type")]
    pub line_of_business: LineOfBusiness,
    pub carrier: String,
    pub expiration_date: Option<NaiveDate>,
    pub premium: f64,
    pub days_until_expiry: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionLine {
    pub id: Uuid,
    pub policy_number: String,
    pub client_name: Option<String>,
    pub carrier: String,
    #[serde(rename = "type")]
    pub line_of_business: LineOfBusiness,
    pub premium: f64,
    pub commission_rate: f64,
    pub commission: f64,
    pub status: CommissionStatus,
    pub paid_date: Option<NaiveDate>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum ReportResponse {
    Overview {
        overview: Overview,
    },
    Expirations {
        #[serde(rename = "expiringPolicies")]
        expiring_policies: Vec<ExpiringPolicyLine>,
    },
    Commissions {
        commissions: Vec<CommissionLine>,
        summary: CommissionSummary,
    },
    Production {
        production: Production,
    },
}

/// Policy joined with the client and carrier fields the report lines need.
#[derive(FromRow)]
struct PolicyLineRow {
    id: Uuid,
    policy_number: String,
    line_of_business: LineOfBusiness,
    premium: Option<f64>,
    expiration_date: Option<NaiveDate>,
    created_at: DateTime<Utc>,
    client_type: Option<ClientType>,
    first_name: Option<String>,
    last_name: Option<String>,
    business_name: Option<String>,
    carrier_name: Option<String>,
}

impl PolicyLineRow {
    fn client_name(&self) -> Option<String> {
        client_display_name(
            self.client_type,
            self.first_name.as_deref(),
            self.last_name.as_deref(),
            self.business_name.as_deref(),
        )
    }

    fn carrier(&self) -> String {
        self.carrier_name.clone().unwrap_or_else(|| "Unknown".into())
    }
}

const POLICY_LINES: &str = r#"
    SELECT p.id, p.policy_number, p.line_of_business, p.premium, p.expiration_date, p.created_at,
           c.type AS client_type, c.first_name, c.last_name, c.business_name,
           ca.name AS carrier_name
    FROM policies p
    LEFT JOIN clients c ON c.id = p.client_id
    LEFT JOIN carriers ca ON ca.id = p.carrier_id
"#;

pub async fn get_report(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ReportQuery>,
) -> Result<Json<ReportResponse>, (StatusCode, String)> {
    let report_type = ReportType::parse(params.report_type.as_deref())
        .ok_or((StatusCode::BAD_REQUEST, "Invalid report type".to_string()))?;
    let now = Utc::now();
    let start = TimeRange::parse(params.time_range.as_deref()).start(now);

    let response = match report_type {
        ReportType::Overview => overview_report(&state, user.agency_id, start, now).await?,
        ReportType::Expirations => expirations_report(&state, user.agency_id, now).await?,
        ReportType::Commissions => commissions_report(&state, user.agency_id, start, now).await?,
        ReportType::Production => production_report(&state, user.agency_id, start).await?,
    };
    Ok(Json(response))
}

async fn overview_report(
    state: &AppState,
    agency_id: Uuid,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ReportResponse, (StatusCode, String)> {
    let today = now.date_naive();
    let month_end = today
        .checked_add_months(Months::new(1))
        .unwrap_or(today + Duration::days(30));

    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM policies WHERE agency_id = $1 AND status = 'active') AS total_policies,
            (SELECT COUNT(*) FROM clients WHERE agency_id = $1) AS active_clients,
            (SELECT COUNT(*) FROM policies
                WHERE agency_id = $1 AND status = 'active'
                  AND expiration_date BETWEEN $2 AND $3) AS expiring_this_month,
            (SELECT COALESCE(SUM(premium), 0) FROM policies
                WHERE agency_id = $1 AND status = 'active') AS total_premium,
            (SELECT COUNT(*) FROM policies
                WHERE agency_id = $1 AND created_at <= $4) AS previous_policies
        "#,
    )
    .bind(agency_id)
    .bind(today)
    .bind(month_end)
    .bind(start)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let total_policies: i64 = row.try_get("total_policies").map_err(internal_error)?;
    let previous_policies: i64 = row.try_get("previous_policies").map_err(internal_error)?;
    let total_premium: f64 = row.try_get("total_premium").map_err(internal_error)?;

    Ok(ReportResponse::Overview {
        overview: Overview {
            total_policies,
            policies_change: policies_change(total_policies, previous_policies),
            active_clients: row.try_get("active_clients").map_err(internal_error)?,
            monthly_commissions: monthly_commissions(total_premium),
            expiring_this_month: row.try_get("expiring_this_month").map_err(internal_error)?,
        },
    })
}

async fn expirations_report(
    state: &AppState,
    agency_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ReportResponse, (StatusCode, String)> {
    let today = now.date_naive();
    let rows = sqlx::query_as::<_, PolicyLineRow>(&format!(
        r#"{POLICY_LINES}
        WHERE p.agency_id = $1
          AND p.status = $2
          AND p.expiration_date BETWEEN $3 AND $4
        ORDER BY p.expiration_date ASC
        "#
    ))
    .bind(agency_id)
    .bind(PolicyStatus::Active)
    .bind(today)
    .bind(today + Duration::days(EXPIRATION_WINDOW_DAYS))
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let expiring_policies = rows
        .into_iter()
        .map(|row| ExpiringPolicyLine {
            client_name: row.client_name(),
            carrier: row.carrier(),
            days_until_expiry: row.expiration_date.map(|date| days_until(date, now)),
            id: row.id,
            policy_number: row.policy_number,
            line_of_business: row.line_of_business,
            expiration_date: row.expiration_date,
            premium: row.premium.unwrap_or(0.0),
        })
        .collect();

    Ok(ReportResponse::Expirations { expiring_policies })
}

async fn commissions_report(
    state: &AppState,
    agency_id: Uuid,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ReportResponse, (StatusCode, String)> {
    let rows = sqlx::query_as::<_, PolicyLineRow>(&format!(
        r#"{POLICY_LINES}
        WHERE p.agency_id = $1
          AND p.created_at >= $2
        ORDER BY p.created_at DESC
        "#
    ))
    .bind(agency_id)
    .bind(start)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let commissions: Vec<CommissionLine> = rows
        .into_iter()
        .map(|row| {
            let premium = row.premium.unwrap_or(0.0);
            let rate = commission_rate(row.line_of_business);
            let (status, paid_date) = commission_status(row.created_at, now);
            CommissionLine {
                client_name: row.client_name(),
                carrier: row.carrier(),
                id: row.id,
                policy_number: row.policy_number,
                line_of_business: row.line_of_business,
                premium,
                commission_rate: rate,
                commission: round_to(premium * rate / 100.0, 2),
                status,
                paid_date,
            }
        })
        .collect();

    let summary = summarize_commissions(
        &commissions
            .iter()
            .map(|line| (line.commission_rate, line.commission, line.status))
            .collect::<Vec<_>>(),
    );

    Ok(ReportResponse::Commissions {
        commissions,
        summary,
    })
}

async fn production_report(
    state: &AppState,
    agency_id: Uuid,
    start: DateTime<Utc>,
) -> Result<ReportResponse, (StatusCode, String)> {
    let written = sqlx::query(
        r#"
        SELECT line_of_business, premium
        FROM policies
        WHERE agency_id = $1
          AND created_at >= $2
          AND status IN ('active', 'pending')
        "#,
    )
    .bind(agency_id)
    .bind(start)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?
    .into_iter()
    .map(|row| {
        let line: LineOfBusiness = row.try_get("line_of_business")?;
        let premium: Option<f64> = row.try_get("premium")?;
        Ok((line, premium.unwrap_or(0.0)))
    })
    .collect::<Result<Vec<_>, sqlx::Error>>()
    .map_err(internal_error)?;

    let counts = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM policies WHERE agency_id = $1 AND status = 'active') AS active,
            (SELECT COUNT(*) FROM policies
                WHERE agency_id = $1
                  AND status IN ('cancelled', 'non_renewed')
                  AND updated_at >= $2) AS lapsed
        "#,
    )
    .bind(agency_id)
    .bind(start)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let active: i64 = counts.try_get("active").map_err(internal_error)?;
    let lapsed: i64 = counts.try_get("lapsed").map_err(internal_error)?;

    Ok(ReportResponse::Production {
        production: production(&written, active, lapsed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_keep_their_envelope_keys() {
        let overview = serde_json::to_value(ReportResponse::Overview {
            overview: Overview {
                total_policies: 4,
                policies_change: 33.3,
                active_clients: 3,
                monthly_commissions: 12.5,
                expiring_this_month: 1,
            },
        })
        .unwrap();
        assert_eq!(
            overview,
            json!({
                "overview": {
                    "totalPolicies": 4,
                    "policiesChange": 33.3,
                    "activeClients": 3,
                    "monthlyCommissions": 12.5,
                    "expiringThisMonth": 1
                }
            })
        );

        let expirations = serde_json::to_value(ReportResponse::Expirations {
            expiring_policies: Vec::new(),
        })
        .unwrap();
        assert_eq!(expirations, json!({ "expiringPolicies": [] }));
    }

    #[test]
    fn commission_lines_use_wire_names() {
        let line = CommissionLine {
            id: Uuid::nil(),
            policy_number: "HL-1".into(),
            client_name: Some("Ann Lee".into()),
            carrier: "Unknown".into(),
            line_of_business: LineOfBusiness::Life,
            premium: 1000.0,
            commission_rate: 50.0,
            commission: 500.0,
            status: CommissionStatus::Processing,
            paid_date: None,
        };
        let value = serde_json::to_value(line).unwrap();
        assert_eq!(value["type"], "life");
        assert_eq!(value["commissionRate"], 50.0);
        assert_eq!(value["status"], "processing");
        assert!(value["paidDate"].is_null());
    }
}
