//! CRM collaborator seam: the `CrmClient` contract plus the HubSpot REST
//! implementation used in production.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hubsync-crm";

/// Properties requested when listing contacts for the sync direction.
pub const CONTACT_LIST_PROPERTIES: [&str; 4] = ["email", "firstname", "lastname", "hs_lead_status"];

/// Properties requested when listing deals for the sync direction.
pub const DEAL_LIST_PROPERTIES: [&str; 8] = [
    "dealname",
    "amount",
    "dealstage",
    "pipeline",
    "closedate",
    "dealtype",
    "description",
    "createdate",
];

pub const COMPANY_LIST_PROPERTIES: [&str; 2] = ["name", "domain"];

/// One CRM object as it comes off the wire: external id plus a flat property
/// map whose values may be null.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CrmObject {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Option<String>>,
}

impl CrmObject {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .and_then(|value| value.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactProperties {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub company: String,
    pub job_title: String,
    pub is_lead: bool,
    pub lead_status: String,
}

impl ContactProperties {
    fn to_wire(&self) -> JsonMap<String, JsonValue> {
        let mut properties = JsonMap::new();
        for (key, value) in [
            ("email", &self.email),
            ("firstname", &self.first_name),
            ("lastname", &self.last_name),
            ("phone", &self.phone),
            ("company", &self.company),
            ("jobtitle", &self.job_title),
        ] {
            if !value.is_empty() {
                properties.insert(key.to_string(), JsonValue::String(value.clone()));
            }
        }
        if self.is_lead {
            properties.insert("lifecyclestage".to_string(), json!("lead"));
            let status = if self.lead_status.is_empty() {
                "NEW"
            } else {
                &self.lead_status
            };
            properties.insert("hs_lead_status".to_string(), json!(status));
        }
        properties
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompanyProperties {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub industry: Option<String>,
}

impl CompanyProperties {
    fn to_wire(&self) -> JsonMap<String, JsonValue> {
        let mut properties = JsonMap::new();
        for (key, value) in [
            ("name", &self.name),
            ("domain", &self.domain),
            ("phone", &self.phone),
            ("city", &self.city),
            ("country", &self.country),
            ("industry", &self.industry),
        ] {
            if let Some(value) = value {
                if !value.is_empty() {
                    properties.insert(key.to_string(), JsonValue::String(value.clone()));
                }
            }
        }
        properties
    }
}

#[derive(Debug, Clone, Default)]
pub struct DealProperties {
    pub deal_name: Option<String>,
    pub amount: Option<f64>,
    pub stage: String,
    pub pipeline: Option<String>,
    pub close_date: Option<String>,
    pub deal_type: Option<String>,
    pub description: Option<String>,
}

impl DealProperties {
    fn to_wire(&self) -> JsonMap<String, JsonValue> {
        let mut properties = JsonMap::new();
        if let Some(name) = &self.deal_name {
            properties.insert("dealname".to_string(), json!(name));
        }
        properties.insert("dealstage".to_string(), json!(self.stage));
        if let Some(amount) = self.amount {
            // HubSpot expects monetary amounts as strings.
            properties.insert("amount".to_string(), json!(amount.to_string()));
        }
        for (key, value) in [
            ("pipeline", &self.pipeline),
            ("closedate", &self.close_date),
            ("dealtype", &self.deal_type),
            ("description", &self.description),
        ] {
            if let Some(value) = value {
                properties.insert(key.to_string(), JsonValue::String(value.clone()));
            }
        }
        properties
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("crm api status {status}: {message}")]
    Api { status: u16, message: String },
}

impl CrmError {
    /// Authorization-class failures flip the seed loader into contacts-only
    /// mode instead of aborting the run.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            CrmError::Api { status, message } => {
                if *status == 403 {
                    return true;
                }
                let lowered = message.to_ascii_lowercase();
                ["403", "forbidden", "permission", "scope"]
                    .iter()
                    .any(|needle| lowered.contains(needle))
            }
            CrmError::Http(_) => false,
        }
    }
}

/// Everything the pipeline and the seed loader need from the CRM.
///
/// List calls return a single page of at most `limit` records; there is no
/// multi-page traversal in this system.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn create_contact(&self, props: &ContactProperties) -> Result<String, CrmError>;
    async fn create_company(&self, props: &CompanyProperties) -> Result<CrmObject, CrmError>;
    async fn create_deal(&self, props: &DealProperties) -> Result<CrmObject, CrmError>;

    async fn associate_contact_to_company(
        &self,
        contact_id: &str,
        company_id: &str,
    ) -> Result<(), CrmError>;
    async fn associate_deal_with_contact(
        &self,
        deal_id: &str,
        contact_id: &str,
    ) -> Result<(), CrmError>;
    async fn associate_deal_with_company(
        &self,
        deal_id: &str,
        company_id: &str,
    ) -> Result<(), CrmError>;

    async fn list_contacts(
        &self,
        limit: u32,
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError>;
    async fn list_deals(&self, limit: u32, properties: &[&str])
        -> Result<Vec<CrmObject>, CrmError>;
    async fn list_companies(&self, limit: u32) -> Result<Vec<CrmObject>, CrmError>;

    async fn archive_contact(&self, id: &str) -> Result<(), CrmError>;
    async fn archive_company(&self, id: &str) -> Result<(), CrmError>;
    async fn archive_deal(&self, id: &str) -> Result<(), CrmError>;
}

#[derive(Debug, Clone)]
pub struct HubSpotConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hubapi.com".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSpotClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    results: Vec<CrmObject>,
}

impl HubSpotClient {
    pub fn new(config: HubSpotConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CrmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CrmError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn create_object(
        &self,
        object_type: &str,
        properties: JsonMap<String, JsonValue>,
    ) -> Result<CrmObject, CrmError> {
        let response = self
            .http
            .post(self.url(&format!("/crm/v3/objects/{object_type}")))
            .bearer_auth(&self.token)
            .json(&json!({ "properties": properties }))
            .send()
            .await?;
        let created: CrmObject = Self::check(response).await?.json().await?;
        debug!(object_type, id = %created.id, "created crm object");
        Ok(created)
    }

    async fn list_objects(
        &self,
        object_type: &str,
        limit: u32,
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError> {
        let mut request = self
            .http
            .get(self.url(&format!("/crm/v3/objects/{object_type}")))
            .bearer_auth(&self.token)
            .query(&[("limit", limit.to_string())]);
        if !properties.is_empty() {
            request = request.query(&[("properties", properties.join(","))]);
        }
        let response = request.send().await?;
        let page: PageResponse = Self::check(response).await?.json().await?;
        debug!(object_type, count = page.results.len(), "listed crm objects");
        Ok(page.results)
    }

    async fn archive_object(&self, object_type: &str, id: &str) -> Result<(), CrmError> {
        let response = self
            .http
            .delete(self.url(&format!("/crm/v3/objects/{object_type}/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn associate(
        &self,
        from_type: &str,
        from_id: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<(), CrmError> {
        let response = self
            .http
            .put(self.url(&format!(
                "/crm/v4/objects/{from_type}/{from_id}/associations/default/{to_type}/{to_id}"
            )))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CrmClient for HubSpotClient {
    async fn create_contact(&self, props: &ContactProperties) -> Result<String, CrmError> {
        let created = self.create_object("contacts", props.to_wire()).await?;
        Ok(created.id)
    }

    async fn create_company(&self, props: &CompanyProperties) -> Result<CrmObject, CrmError> {
        self.create_object("companies", props.to_wire()).await
    }

    async fn create_deal(&self, props: &DealProperties) -> Result<CrmObject, CrmError> {
        self.create_object("deals", props.to_wire()).await
    }

    async fn associate_contact_to_company(
        &self,
        contact_id: &str,
        company_id: &str,
    ) -> Result<(), CrmError> {
        self.associate("contact", contact_id, "company", company_id)
            .await
    }

    async fn associate_deal_with_contact(
        &self,
        deal_id: &str,
        contact_id: &str,
    ) -> Result<(), CrmError> {
        self.associate("deal", deal_id, "contact", contact_id).await
    }

    async fn associate_deal_with_company(
        &self,
        deal_id: &str,
        company_id: &str,
    ) -> Result<(), CrmError> {
        self.associate("deal", deal_id, "company", company_id).await
    }

    async fn list_contacts(
        &self,
        limit: u32,
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError> {
        self.list_objects("contacts", limit, properties).await
    }

    async fn list_deals(
        &self,
        limit: u32,
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError> {
        self.list_objects("deals", limit, properties).await
    }

    async fn list_companies(&self, limit: u32) -> Result<Vec<CrmObject>, CrmError> {
        self.list_objects("companies", limit, &COMPANY_LIST_PROPERTIES)
            .await
    }

    async fn archive_contact(&self, id: &str) -> Result<(), CrmError> {
        self.archive_object("contacts", id).await
    }

    async fn archive_company(&self, id: &str) -> Result<(), CrmError> {
        self.archive_object("companies", id).await
    }

    async fn archive_deal(&self, id: &str) -> Result<(), CrmError> {
        self.archive_object("deals", id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_wire_properties_skip_empty_fields_and_flag_leads() {
        let props = ContactProperties {
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            is_lead: true,
            lead_status: "OPEN".to_string(),
            ..Default::default()
        };
        let wire = props.to_wire();

        assert_eq!(wire.get("email"), Some(&json!("ada@example.com")));
        assert_eq!(wire.get("firstname"), Some(&json!("Ada")));
        assert!(!wire.contains_key("lastname"));
        assert_eq!(wire.get("lifecyclestage"), Some(&json!("lead")));
        assert_eq!(wire.get("hs_lead_status"), Some(&json!("OPEN")));
    }

    #[test]
    fn plain_contact_carries_no_lifecycle_properties() {
        let props = ContactProperties {
            email: "carl@example.com".to_string(),
            ..Default::default()
        };
        let wire = props.to_wire();
        assert!(!wire.contains_key("lifecyclestage"));
        assert!(!wire.contains_key("hs_lead_status"));
    }

    #[test]
    fn deal_wire_amount_is_stringified() {
        let props = DealProperties {
            deal_name: Some("Big deal".to_string()),
            amount: Some(1500.5),
            stage: "contractsent".to_string(),
            ..Default::default()
        };
        let wire = props.to_wire();
        assert_eq!(wire.get("amount"), Some(&json!("1500.5")));
        assert_eq!(wire.get("dealstage"), Some(&json!("contractsent")));
    }

    #[test]
    fn permission_errors_are_detected_by_status_and_text() {
        let by_status = CrmError::Api {
            status: 403,
            message: String::new(),
        };
        assert!(by_status.is_permission_denied());

        let by_text = CrmError::Api {
            status: 400,
            message: "This app hasn't been granted the required SCOPE".to_string(),
        };
        assert!(by_text.is_permission_denied());

        let unrelated = CrmError::Api {
            status: 500,
            message: "internal error".to_string(),
        };
        assert!(!unrelated.is_permission_denied());
    }

    #[test]
    fn page_response_tolerates_null_properties() {
        let raw = r#"{"results":[{"id":"1","properties":{"email":null,"firstname":"Ada"}}]}"#;
        let page: PageResponse = serde_json::from_str(raw).expect("page parses");
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].property("firstname"), Some("Ada"));
        assert_eq!(page.results[0].property("email"), None);
    }
}
