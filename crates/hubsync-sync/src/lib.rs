//! Sync pipeline: extract a page of CRM records, normalize them, upsert into
//! the document store and recompute the rollup summaries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use hubsync_core::{
    parse_amount, parse_timestamp, ContactDraft, DealCloseSummary, DealRecord, DealStageSummary,
    LeadRecord, LeadStatusSummary, StatusMapping, UpsertOutcome,
};
use hubsync_crm::{
    CrmClient, CrmObject, HubSpotClient, HubSpotConfig, CONTACT_LIST_PROPERTIES,
    DEAL_LIST_PROPERTIES,
};
use hubsync_store::bson::{self, doc, Bson, Document};
use hubsync_store::{DocumentStore, MongoStore, StoreError, UpsertOp};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hubsync-sync";

pub const LEADS_COLLECTION: &str = "leads";
pub const DEALS_COLLECTION: &str = "deals";
pub const LEAD_STATUS_COLLECTION: &str = "lead_status";
pub const LEAD_STATUS_SUMMARY_COLLECTION: &str = "resume_lead_status";
pub const DEAL_STAGE_SUMMARY_COLLECTION: &str = "total_deals";
pub const DEAL_CLOSE_SUMMARY_COLLECTION: &str = "resume_close_deals";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub hubspot_token: String,
    pub hubspot_base_url: String,
    pub mongo_uri: String,
    pub mongo_db: String,
    pub page_limit: u32,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            hubspot_token: std::env::var("HUBSPOT_TOKEN")
                .or_else(|_| std::env::var("HUBSPOT_KEY"))
                .unwrap_or_default(),
            hubspot_base_url: std::env::var("HUBSYNC_HUBSPOT_BASE_URL")
                .unwrap_or_else(|_| "https://api.hubapi.com".to_string()),
            mongo_uri: std::env::var("MONGO_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017/".to_string()),
            mongo_db: std::env::var("MONGO_DB_NAME").unwrap_or_else(|_| "hubspot_data".to_string()),
            page_limit: std::env::var("HUBSYNC_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            http_timeout_secs: std::env::var("HUBSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncKind {
    Leads,
    Deals,
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncKind::Leads => f.write_str("leads"),
            SyncKind::Deals => f.write_str("deals"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted: usize,
    pub upsert: UpsertOutcome,
    pub status_rows: usize,
    pub stage_rows: usize,
    pub close_rows: usize,
}

// ---------------------------------------------------------------------------
// Field normalizer
// ---------------------------------------------------------------------------

/// Read one wire property, folding the missing-value sentinels (absent key,
/// explicit null, blank string) into `None`. Non-blank values pass through
/// unmodified, padding included.
fn property(object: &CrmObject, key: &str) -> Option<String> {
    object
        .property(key)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

/// Rename contact wire fields into the canonical scheme.
pub fn normalize_contact(object: &CrmObject) -> ContactDraft {
    ContactDraft {
        id: object.id.clone(),
        email: property(object, "email"),
        first_name: property(object, "firstname"),
        last_name: property(object, "lastname"),
        lead_status: property(object, "hs_lead_status"),
    }
}

/// Rename deal wire fields and coerce `amount` and the date properties.
/// A value that fails coercion degrades to `None`; it never fails the record.
pub fn normalize_deal(object: &CrmObject) -> DealRecord {
    let amount = property(object, "amount").and_then(|raw| match parse_amount(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(id = %object.id, %err, "amount failed coercion, storing null");
            None
        }
    });
    let parse_date = |key: &str| {
        property(object, key).and_then(|raw| match parse_timestamp(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(id = %object.id, key, %err, "date failed coercion, storing null");
                None
            }
        })
    };

    DealRecord {
        id: object.id.clone(),
        deal_name: property(object, "dealname"),
        amount,
        deal_stage: property(object, "dealstage"),
        pipeline: property(object, "pipeline"),
        deal_type: property(object, "dealtype"),
        description: property(object, "description"),
        close_date: parse_date("closedate"),
        create_date: parse_date("createdate"),
    }
}

// ---------------------------------------------------------------------------
// Status mapper
// ---------------------------------------------------------------------------

/// Resolve the numeric status id and derive `full_name` for a contact draft.
pub fn resolve_lead(draft: ContactDraft, mapping: &StatusMapping) -> LeadRecord {
    let full_name = format!(
        "{} {}",
        draft.first_name.as_deref().unwrap_or(""),
        draft.last_name.as_deref().unwrap_or("")
    )
    .trim()
    .to_string();
    let lead_status_id = mapping.resolve(draft.lead_status.as_deref());

    LeadRecord {
        id: draft.id,
        email: draft.email,
        first_name: draft.first_name,
        last_name: draft.last_name,
        full_name,
        lead_status: draft.lead_status,
        lead_status_id,
    }
}

/// Load the label-to-id reference table from the `lead_status` collection.
pub async fn load_status_mapping(store: &dyn DocumentStore) -> Result<StatusMapping, StoreError> {
    let docs = store.fetch_all(LEAD_STATUS_COLLECTION).await?;
    let mut labels = BTreeMap::new();
    for doc in docs {
        let label = doc.get_str("lead_status").ok();
        let id = match doc.get("id") {
            Some(Bson::Int32(v)) => Some(i64::from(*v)),
            Some(Bson::Int64(v)) => Some(*v),
            Some(Bson::Double(v)) => Some(*v as i64),
            _ => None,
        };
        if let (Some(label), Some(id)) = (label, id) {
            labels.insert(label.to_string(), id);
        }
    }
    debug!(entries = labels.len(), "loaded lead status mapping");
    Ok(StatusMapping::new(labels))
}

// ---------------------------------------------------------------------------
// Idempotent upserter
// ---------------------------------------------------------------------------

fn bson_value<T: Serialize>(value: &T) -> Bson {
    bson::to_bson(value).unwrap_or(Bson::Null)
}

fn build_ops<T, F>(records: &[T], filter_for: F) -> Vec<UpsertOp>
where
    T: Serialize,
    F: Fn(&T) -> Document,
{
    records
        .iter()
        .filter_map(|record| match bson::to_document(record) {
            Ok(set) => Some(UpsertOp {
                filter: filter_for(record),
                set,
            }),
            Err(err) => {
                warn!(%err, "skipping record that failed document encoding");
                None
            }
        })
        .collect()
}

pub fn lead_ops(records: &[LeadRecord]) -> Vec<UpsertOp> {
    build_ops(records, |record| doc! { "id": record.id.clone() })
}

pub fn deal_ops(records: &[DealRecord]) -> Vec<UpsertOp> {
    build_ops(records, |record| doc! { "id": record.id.clone() })
}

/// Submit one batch of upserts, best effort.
///
/// An empty batch performs no store I/O at all. An unreachable store or a
/// mid-batch failure is logged and collapses to the tallies of whatever did
/// succeed; the error never propagates past this function so sibling entity
/// kinds keep running.
pub async fn upsert_batch(
    store: &dyn DocumentStore,
    collection: &str,
    ops: Vec<UpsertOp>,
) -> UpsertOutcome {
    if ops.is_empty() {
        info!(collection, "no records to upsert");
        return UpsertOutcome::default();
    }

    match store.bulk_upsert(collection, ops).await {
        Ok(outcome) => {
            info!(
                collection,
                matched = outcome.matched,
                modified = outcome.modified,
                upserted = outcome.upserted,
                "upsert complete"
            );
            outcome
        }
        Err(err) => {
            let partial = err.partial_outcome();
            warn!(collection, %err, "upsert failed, keeping partial tallies");
            partial
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

fn decode_all<T: serde::de::DeserializeOwned>(docs: Vec<Document>, collection: &str) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match bson::from_document(doc) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(collection, %err, "skipping undecodable document");
                None
            }
        })
        .collect()
}

/// Group leads by `lead_status_id`, keeping the first-seen label per group.
pub fn group_lead_status(records: &[LeadRecord]) -> Vec<LeadStatusSummary> {
    let mut groups: BTreeMap<i64, (i64, Option<String>)> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(record.lead_status_id).or_insert((0, None));
        entry.0 += 1;
        if entry.1.is_none() {
            entry.1 = record.lead_status.clone();
        }
    }
    groups
        .into_iter()
        .map(|(id, (total, status))| LeadStatusSummary { id, total, status })
        .collect()
}

/// Group deals by stage; null amounts are excluded from the sum, so a group
/// with only null amounts sums to 0.
pub fn group_deal_stages(records: &[DealRecord]) -> Vec<DealStageSummary> {
    let mut groups: BTreeMap<Option<String>, (i64, f64)> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(record.deal_stage.clone()).or_insert((0, 0.0));
        entry.0 += 1;
        if let Some(amount) = record.amount {
            entry.1 += amount;
        }
    }
    groups
        .into_iter()
        .map(|(id, (total, amount))| DealStageSummary { id, total, amount })
        .collect()
}

/// Group deals by `(year, month, stage)` of the close date, ascending.
/// Deals without a close date land in a null year/month group.
pub fn group_deal_closes(records: &[DealRecord]) -> Vec<DealCloseSummary> {
    let mut groups: BTreeMap<(Option<i32>, Option<u32>, Option<String>), (i64, f64)> =
        BTreeMap::new();
    for record in records {
        let (year, month) = match record.close_date {
            Some(closed) => (Some(closed.year()), Some(closed.month())),
            None => (None, None),
        };
        let key = (year, month, record.deal_stage.clone());
        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        if let Some(amount) = record.amount {
            entry.1 += amount;
        }
    }
    groups
        .into_iter()
        .map(
            |((year, month, deal_stage), (count, amount))| DealCloseSummary {
                year,
                month,
                deal_stage,
                count,
                amount,
            },
        )
        .collect()
}

/// Recompute the lead status rollup from the persisted leads and upsert it.
pub async fn summarize_lead_status(
    store: &dyn DocumentStore,
) -> Result<Vec<LeadStatusSummary>, StoreError> {
    let leads: Vec<LeadRecord> =
        decode_all(store.fetch_all(LEADS_COLLECTION).await?, LEADS_COLLECTION);
    let rows = group_lead_status(&leads);
    if rows.is_empty() {
        info!("no leads found for summary aggregation");
        return Ok(rows);
    }

    let ops = build_ops(&rows, |row| doc! { "id": row.id });
    store
        .bulk_upsert(LEAD_STATUS_SUMMARY_COLLECTION, ops)
        .await?;
    for row in &rows {
        info!(
            status = row.status.as_deref().unwrap_or("<none>"),
            id = row.id,
            total = row.total,
            "lead status summary row"
        );
    }
    Ok(rows)
}

/// Recompute the per-stage deals rollup and upsert it.
pub async fn summarize_deal_stages(
    store: &dyn DocumentStore,
) -> Result<Vec<DealStageSummary>, StoreError> {
    let deals: Vec<DealRecord> =
        decode_all(store.fetch_all(DEALS_COLLECTION).await?, DEALS_COLLECTION);
    let rows = group_deal_stages(&deals);
    if rows.is_empty() {
        info!("no deals found for summary aggregation");
        return Ok(rows);
    }

    let ops = build_ops(&rows, |row| doc! { "id": bson_value(&row.id) });
    store
        .bulk_upsert(DEAL_STAGE_SUMMARY_COLLECTION, ops)
        .await?;
    Ok(rows)
}

/// Recompute the close-date rollup and upsert it, keyed by the composite
/// `(year, month, deal_stage)`.
pub async fn summarize_deal_closes(
    store: &dyn DocumentStore,
) -> Result<Vec<DealCloseSummary>, StoreError> {
    let deals: Vec<DealRecord> =
        decode_all(store.fetch_all(DEALS_COLLECTION).await?, DEALS_COLLECTION);
    let rows = group_deal_closes(&deals);
    if rows.is_empty() {
        info!("no deals found for close summary aggregation");
        return Ok(rows);
    }

    let ops = build_ops(&rows, |row| {
        doc! {
            "year": bson_value(&row.year),
            "month": bson_value(&row.month),
            "deal_stage": bson_value(&row.deal_stage),
        }
    });
    store
        .bulk_upsert(DEAL_CLOSE_SUMMARY_COLLECTION, ops)
        .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    config: SyncConfig,
    crm: Arc<dyn CrmClient>,
    store: Arc<dyn DocumentStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, crm: Arc<dyn CrmClient>, store: Arc<dyn DocumentStore>) -> Self {
        Self { config, crm, store }
    }

    /// Build the production pipeline: HubSpot over HTTP, MongoDB underneath.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        ensure!(
            !config.hubspot_token.is_empty(),
            "HUBSPOT_TOKEN is not set in the environment"
        );
        let crm = HubSpotClient::new(HubSpotConfig {
            base_url: config.hubspot_base_url.clone(),
            token: config.hubspot_token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })
        .context("building hubspot client")?;
        let store = MongoStore::new(&config.mongo_uri, &config.mongo_db);
        Ok(Self::new(config, Arc::new(crm), Arc::new(store)))
    }

    pub async fn run_once(&self, kind: SyncKind) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %kind, "starting sync run");

        let summary = match kind {
            SyncKind::Leads => self.run_leads(run_id, started_at).await?,
            SyncKind::Deals => self.run_deals(run_id, started_at).await?,
        };

        info!(
            %run_id,
            extracted = summary.extracted,
            upserted = summary.upsert.upserted,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_leads(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let page = match self
            .crm
            .list_contacts(self.config.page_limit, &CONTACT_LIST_PROPERTIES)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, "contact extraction failed, continuing with empty page");
                Vec::new()
            }
        };
        let extracted = page.len();

        let mapping = load_status_mapping(self.store.as_ref())
            .await
            .context("loading lead status mapping")?;
        let records: Vec<LeadRecord> = page
            .iter()
            .map(normalize_contact)
            .map(|draft| resolve_lead(draft, &mapping))
            .collect();

        let upsert = upsert_batch(self.store.as_ref(), LEADS_COLLECTION, lead_ops(&records)).await;

        let status_rows = match summarize_lead_status(self.store.as_ref()).await {
            Ok(rows) => rows.len(),
            Err(err) => {
                warn!(%err, "lead status summary failed, previous rows left untouched");
                0
            }
        };

        Ok(SyncRunSummary {
            run_id,
            kind: SyncKind::Leads,
            started_at,
            finished_at: Utc::now(),
            extracted,
            upsert,
            status_rows,
            stage_rows: 0,
            close_rows: 0,
        })
    }

    async fn run_deals(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let page = match self
            .crm
            .list_deals(self.config.page_limit, &DEAL_LIST_PROPERTIES)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, "deal extraction failed, continuing with empty page");
                Vec::new()
            }
        };
        let extracted = page.len();

        let records: Vec<DealRecord> = page.iter().map(normalize_deal).collect();
        let upsert = upsert_batch(self.store.as_ref(), DEALS_COLLECTION, deal_ops(&records)).await;

        let stage_rows = match summarize_deal_stages(self.store.as_ref()).await {
            Ok(rows) => rows.len(),
            Err(err) => {
                warn!(%err, "deal stage summary failed, previous rows left untouched");
                0
            }
        };
        let close_rows = match summarize_deal_closes(self.store.as_ref()).await {
            Ok(rows) => rows.len(),
            Err(err) => {
                warn!(%err, "deal close summary failed, previous rows left untouched");
                0
            }
        };

        Ok(SyncRunSummary {
            run_id,
            kind: SyncKind::Deals,
            started_at,
            finished_at: Utc::now(),
            extracted,
            upsert,
            status_rows: 0,
            stage_rows,
            close_rows,
        })
    }
}
