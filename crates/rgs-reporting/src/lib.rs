//! Regulatory reporting (component J): `GenerateReport` over the DTD /
//! MTD / YTD / LTD intervals, rendered as CSV or JSON and persisted so a
//! repeat call with the same parameters on the same day replays the
//! original run rather than regenerating it (§4.J).

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rgs_audit::{AuditChain, AuditFilter};
use rgs_core::ledger::AccountType;
use rgs_core::{RgsError, RgsResult, Clock};
use rgs_ledger::LedgerService;
use rgs_storage::{composite_key, decode, encode, Backend, KvTree};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    SignificantEvents,
    CashlessLiabilitySummary,
    AccountTransactionStatement,
}

impl ReportType {
    fn as_str(&self) -> &'static str {
        match self {
            ReportType::SignificantEvents => "significant_events",
            ReportType::CashlessLiabilitySummary => "cashless_liability_summary",
            ReportType::AccountTransactionStatement => "account_transaction_statement",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportInterval {
    Dtd,
    Mtd,
    Ytd,
    Ltd,
}

impl ReportInterval {
    fn as_str(&self) -> &'static str {
        match self {
            ReportInterval::Dtd => "dtd",
            ReportInterval::Mtd => "mtd",
            ReportInterval::Ytd => "ytd",
            ReportInterval::Ltd => "ltd",
        }
    }

    /// `(start, end)` derived from the clock's current UTC day (§4.J).
    fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        let start_date = match self {
            ReportInterval::Dtd => today,
            ReportInterval::Mtd => NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("valid month start"),
            ReportInterval::Ytd => NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("valid year start"),
            ReportInterval::Ltd => return (DateTime::<Utc>::MIN_UTC, now),
        };
        (start_date.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc(), now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Csv,
    Json,
}

impl ReportFormat {
    fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "text/csv",
            ReportFormat::Json => "application/json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenerateReportRequest {
    pub report_type: ReportType,
    pub interval: ReportInterval,
    pub format: ReportFormat,
    pub operator_id: String,
    /// Required by `account_transaction_statement`; ignored otherwise.
    pub account_id: Option<String>,
}

/// A persisted report run, retrievable after generation (§4.J).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportRun {
    pub run_id: String,
    pub report_type: ReportType,
    pub interval: ReportInterval,
    pub format: ReportFormat,
    pub operator_id: String,
    pub account_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub no_activity: bool,
}

pub struct ReportingService {
    runs: Arc<dyn KvTree>,
    idempotency: Arc<dyn KvTree>,
    audit: Arc<AuditChain>,
    ledger: Arc<LedgerService>,
    clock: Arc<dyn Clock>,
}

fn write_csv(header: &[&str], rows: &[Vec<String>]) -> RgsResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(header).map_err(|e| RgsError::Internal(e.to_string()))?;
    for row in rows {
        writer.write_record(row).map_err(|e| RgsError::Internal(e.to_string()))?;
    }
    writer.into_inner().map_err(|e| RgsError::Internal(e.to_string()))
}

impl ReportingService {
    pub fn new(backend: &Backend, audit: Arc<AuditChain>, ledger: Arc<LedgerService>, clock: Arc<dyn Clock>) -> RgsResult<Self> {
        Ok(Self {
            runs: backend.open_tree("reporting_runs")?,
            idempotency: backend.open_tree("reporting_idempotency")?,
            audit,
            ledger,
            clock,
        })
    }

    fn idempotency_key(req: &GenerateReportRequest, generated_day: NaiveDate) -> Vec<u8> {
        composite_key(&[
            req.report_type.as_str().as_bytes(),
            req.interval.as_str().as_bytes(),
            format!("{:?}", req.format).as_bytes(),
            req.operator_id.as_bytes(),
            req.account_id.as_deref().unwrap_or("").as_bytes(),
            generated_day.to_string().as_bytes(),
        ])
    }

    /// `GenerateReport(type, interval, format, operator_id)` (§4.J):
    /// idempotent by generated-at (the current UTC day) plus parameters —
    /// a repeat call with the same parameters on the same day replays
    /// the original run.
    pub async fn generate_report(&self, req: GenerateReportRequest) -> RgsResult<ReportRun> {
        let now = self.clock.now();
        let generated_day = now.date_naive();
        let key = Self::idempotency_key(&req, generated_day);
        if let Some(bytes) = self.idempotency.get(&key)? {
            let run_id = String::from_utf8_lossy(&bytes).to_string();
            return self.get_run(&run_id);
        }

        let (start, end) = req.interval.bounds(now);
        let (header, rows) = self.collect_rows(&req, start, end)?;
        let no_activity = rows.is_empty();

        let bytes = match req.format {
            ReportFormat::Csv => write_csv(&header, &rows)?,
            ReportFormat::Json => {
                let objects: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        serde_json::Value::Object(
                            header
                                .iter()
                                .zip(row.iter())
                                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                serde_json::to_vec(&objects).map_err(|e| RgsError::Internal(e.to_string()))?
            }
        };

        let run = ReportRun {
            run_id: rgs_core::new_id(),
            report_type: req.report_type,
            interval: req.interval,
            format: req.format,
            operator_id: req.operator_id.clone(),
            account_id: req.account_id.clone(),
            generated_at: now,
            interval_start: start,
            interval_end: end,
            content_type: req.format.content_type().to_string(),
            bytes,
            no_activity,
        };

        self.runs.insert(run.run_id.as_bytes(), encode(&run)?)?;
        self.idempotency.insert(&key, run.run_id.as_bytes().to_vec())?;
        info!(run_id = %run.run_id, report_type = req.report_type.as_str(), no_activity = run.no_activity, "report generated");
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> RgsResult<ReportRun> {
        match self.runs.get(run_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(RgsError::Invalid("report run not found".to_string())),
        }
    }

    fn collect_rows(&self, req: &GenerateReportRequest, start: DateTime<Utc>, end: DateTime<Utc>) -> RgsResult<(Vec<&'static str>, Vec<Vec<String>>)> {
        match req.report_type {
            ReportType::SignificantEvents => self.significant_events_rows(start, end),
            ReportType::CashlessLiabilitySummary => self.cashless_liability_rows(),
            ReportType::AccountTransactionStatement => self.account_statement_rows(req, start, end),
        }
    }

    fn significant_events_rows(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> RgsResult<(Vec<&'static str>, Vec<Vec<String>>)> {
        let header = vec!["audit_id", "occurred_at", "actor_id", "actor_type", "object_type", "object_id", "action", "result", "reason"];
        let mut rows = Vec::new();
        let mut day = start.date_naive();
        let last_day = end.date_naive();
        while day <= last_day {
            let events = self.audit.list(&AuditFilter { partition_day: Some(day), ..Default::default() })?;
            for e in events {
                if e.occurred_at < start || e.occurred_at > end {
                    continue;
                }
                rows.push(vec![
                    e.audit_id,
                    e.occurred_at.to_rfc3339(),
                    e.actor.id,
                    e.actor.actor_type.as_str().to_string(),
                    e.object_type,
                    e.object_id,
                    e.action,
                    format!("{:?}", e.result),
                    e.reason.unwrap_or_default(),
                ]);
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        Ok((header, rows))
    }

    fn cashless_liability_rows(&self) -> RgsResult<(Vec<&'static str>, Vec<Vec<String>>)> {
        let header = vec!["currency", "account_count", "total_available_minor"];
        let accounts = self.ledger.list_accounts(Some(AccountType::PlayerCashless))?;
        let mut totals: std::collections::BTreeMap<String, (u64, i64)> = std::collections::BTreeMap::new();
        for account in accounts {
            let entry = totals.entry(account.currency.0.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += account.available_minor.0;
        }
        let rows = totals
            .into_iter()
            .map(|(currency, (count, total))| vec![currency, count.to_string(), total.to_string()])
            .collect();
        Ok((header, rows))
    }

    fn account_statement_rows(&self, req: &GenerateReportRequest, start: DateTime<Utc>, end: DateTime<Utc>) -> RgsResult<(Vec<&'static str>, Vec<Vec<String>>)> {
        let header = vec!["transaction_id", "transaction_type", "status", "amount_minor", "currency", "occurred_at"];
        let account_id = req
            .account_id
            .as_deref()
            .ok_or_else(|| RgsError::Invalid("account_id is required for account_transaction_statement".to_string()))?;
        let transactions = self.ledger.list_transactions(account_id)?;
        let rows = transactions
            .into_iter()
            .filter(|t| t.occurred_at >= start && t.occurred_at <= end)
            .map(|t| {
                vec![
                    t.transaction_id,
                    format!("{:?}", t.transaction_type),
                    format!("{:?}", t.status),
                    t.amount_minor.0.to_string(),
                    t.currency.0,
                    t.occurred_at.to_rfc3339(),
                ]
            })
            .collect();
        Ok((header, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgs_core::{Actor, ActorType, Currency, FakeClock};
    use rgs_ledger::{LedgerConfig, SimpleLedgerRequest};

    async fn new_service() -> (ReportingService, Arc<LedgerService>, Arc<FakeClock>) {
        let backend = Backend::in_memory();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let audit = Arc::new(AuditChain::new(&backend, clock.clone()).unwrap());
        let ledger = Arc::new(LedgerService::new(&backend, audit.clone(), clock.clone(), LedgerConfig::default(), false).unwrap());
        let reporting = ReportingService::new(&backend, audit, ledger.clone(), clock.clone()).unwrap();
        (reporting, ledger, clock)
    }

    #[tokio::test]
    async fn cashless_liability_summary_sums_player_balances() {
        let (reporting, ledger, _clock) = new_service().await;
        let account = ledger.open_account(Some("player-1".to_string()), AccountType::PlayerCashless, Currency::new("USD")).unwrap();
        ledger
            .deposit(SimpleLedgerRequest {
                idempotency_key: "dep-1".to_string(),
                request_fingerprint: "fp-1".to_string(),
                account_id: account.account_id.clone(),
                amount_minor: rgs_core::MinorAmount(10_000),
                currency: Currency::new("USD"),
                authorization_id: None,
                actor: Actor::new("operator-1", ActorType::Operator),
            })
            .await
            .unwrap();

        let run = reporting
            .generate_report(GenerateReportRequest {
                report_type: ReportType::CashlessLiabilitySummary,
                interval: ReportInterval::Dtd,
                format: ReportFormat::Json,
                operator_id: "operator-1".to_string(),
                account_id: None,
            })
            .await
            .unwrap();
        assert!(!run.no_activity);
        let parsed: serde_json::Value = serde_json::from_slice(&run.bytes).unwrap();
        assert_eq!(parsed[0]["total_available_minor"], "10000");
    }

    #[tokio::test]
    async fn repeat_call_same_day_replays_original_run() {
        let (reporting, _ledger, _clock) = new_service().await;
        let req = || GenerateReportRequest {
            report_type: ReportType::SignificantEvents,
            interval: ReportInterval::Dtd,
            format: ReportFormat::Csv,
            operator_id: "operator-1".to_string(),
            account_id: None,
        };
        let first = reporting.generate_report(req()).await.unwrap();
        let second = reporting.generate_report(req()).await.unwrap();
        assert_eq!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn empty_interval_sets_no_activity_flag() {
        let (reporting, _ledger, _clock) = new_service().await;
        let run = reporting
            .generate_report(GenerateReportRequest {
                report_type: ReportType::SignificantEvents,
                interval: ReportInterval::Dtd,
                format: ReportFormat::Csv,
                operator_id: "operator-1".to_string(),
                account_id: None,
            })
            .await
            .unwrap();
        assert!(run.no_activity);
    }

    #[tokio::test]
    async fn account_statement_requires_account_id() {
        let (reporting, _ledger, _clock) = new_service().await;
        let err = reporting
            .generate_report(GenerateReportRequest {
                report_type: ReportType::AccountTransactionStatement,
                interval: ReportInterval::Dtd,
                format: ReportFormat::Csv,
                operator_id: "operator-1".to_string(),
                account_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RgsError::Invalid(_)));
    }
}
