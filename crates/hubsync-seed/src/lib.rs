//! Load direction: bulk-create seed records in the CRM with synthetic
//! relationship assignment, plus the archive-everything cleanup flows.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hubsync_core::{DEAL_STAGES, DEFAULT_DEAL_STAGE, LEAD_STATUSES};
use hubsync_crm::{
    CompanyProperties, ContactProperties, CrmClient, CrmObject, DealProperties,
    CONTACT_LIST_PROPERTIES,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hubsync-seed";

/// Page size used when fetching association candidates and wipe targets.
/// Single page only; anything past it is out of reach by design.
const LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactSeed {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub jobtitle: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanySeed {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub industry: Option<String>,
}

/// One lead seed entry: a contact and the company it belongs to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadSeed {
    #[serde(default)]
    pub contact: ContactSeed,
    #[serde(default)]
    pub company: CompanySeed,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealSeed {
    pub dealname: Option<String>,
    pub amount: Option<f64>,
    pub dealstage: Option<String>,
    pub pipeline: Option<String>,
    pub closedate: Option<String>,
    pub dealtype: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedLead {
    pub contact_id: String,
    pub company_id: Option<String>,
    pub association_success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub contacts_loaded: usize,
    pub leads_loaded: usize,
    pub deals_loaded: usize,
}

impl LoadSummary {
    pub fn total(&self) -> usize {
        self.contacts_loaded + self.leads_loaded + self.deals_loaded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WipeSummary {
    pub deals_deleted: usize,
    pub contacts_deleted: usize,
    pub companies_deleted: usize,
}

impl WipeSummary {
    pub fn total(&self) -> usize {
        self.deals_deleted + self.contacts_deleted + self.companies_deleted
    }
}

// ---------------------------------------------------------------------------
// Relationship assignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadStatusAssignment {
    pub is_lead: bool,
    pub status: &'static str,
}

/// With lead assignment enabled, 80% of records become leads with a uniform
/// random status; everything else is a plain contact labelled `NEW`.
pub fn assign_lead_status<R: Rng>(rng: &mut R, add_lead_status: bool) -> LeadStatusAssignment {
    let is_lead = add_lead_status && rng.random::<f64>() < 0.8;
    let status = if is_lead {
        LEAD_STATUSES[rng.random_range(0..LEAD_STATUSES.len())]
    } else {
        "NEW"
    };
    LeadStatusAssignment { is_lead, status }
}

/// Pick the deal stage: uniform random when randomization is requested,
/// otherwise the stage supplied in the seed entry (default: first stage).
pub fn assign_deal_stage<R: Rng>(
    rng: &mut R,
    randomize: bool,
    input_stage: Option<&str>,
) -> String {
    if randomize {
        DEAL_STAGES[rng.random_range(0..DEAL_STAGES.len())].to_string()
    } else {
        input_stage.unwrap_or(DEFAULT_DEAL_STAGE).to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationPick {
    pub contact_id: Option<String>,
    pub company_id: Option<String>,
}

/// Independently link to one random existing contact (70%) and one random
/// existing company (60%). Empty candidate lists mean no linkage attempt.
pub fn pick_associations<R: Rng>(
    rng: &mut R,
    contacts: &[CrmObject],
    companies: &[CrmObject],
) -> AssociationPick {
    let mut pick = AssociationPick::default();
    if !contacts.is_empty() && rng.random::<f64>() < 0.7 {
        pick.contact_id = Some(contacts[rng.random_range(0..contacts.len())].id.clone());
    }
    if !companies.is_empty() && rng.random::<f64>() < 0.6 {
        pick.company_id = Some(companies[rng.random_range(0..companies.len())].id.clone());
    }
    pick
}

// ---------------------------------------------------------------------------
// Seed loader
// ---------------------------------------------------------------------------

/// Reads a JSON seed file; a missing file is a non-fatal "nothing to load".
fn read_seed_file<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>> {
    if !path.exists() {
        warn!(path = %path.display(), "seed file not found, nothing to load");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let entries: Vec<T> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed file {}", path.display()))?;
    Ok(Some(entries))
}

pub struct SeedLoader {
    crm: Arc<dyn CrmClient>,
    rng: StdRng,
}

impl SeedLoader {
    pub fn new(crm: Arc<dyn CrmClient>, rng: StdRng) -> Self {
        Self { crm, rng }
    }

    pub fn from_os_rng(crm: Arc<dyn CrmClient>) -> Self {
        Self::new(crm, StdRng::from_os_rng())
    }

    /// Create plain contacts (optionally promoted to leads at random).
    /// Per-record creation failures are logged and skipped.
    pub async fn load_contacts_from_json(
        &mut self,
        path: &Path,
        add_lead_status: bool,
    ) -> Result<Vec<String>> {
        let Some(seeds) = read_seed_file::<ContactSeed>(path)? else {
            return Ok(Vec::new());
        };
        info!(count = seeds.len(), path = %path.display(), "loading contacts");

        let mut created = Vec::new();
        for (index, seed) in seeds.iter().enumerate() {
            let assignment = assign_lead_status(&mut self.rng, add_lead_status);
            let props = ContactProperties {
                email: seed.email.clone(),
                first_name: seed.firstname.clone(),
                last_name: seed.lastname.clone(),
                phone: seed.phone.clone(),
                company: seed.company.clone(),
                job_title: seed.jobtitle.clone(),
                is_lead: assignment.is_lead,
                lead_status: assignment.status.to_string(),
            };

            match self.crm.create_contact(&props).await {
                Ok(id) => {
                    info!(
                        n = index + 1,
                        id,
                        is_lead = assignment.is_lead,
                        status = assignment.status,
                        "contact created"
                    );
                    created.push(id);
                }
                Err(err) => warn!(n = index + 1, %err, "error creating contact, skipping"),
            }
        }

        info!(
            created = created.len(),
            total = seeds.len(),
            "contact load completed"
        );
        Ok(created)
    }

    /// Create company-and-contact pairs with an association between them.
    ///
    /// On the first authorization-class failure of a company creation the
    /// rest of the run permanently switches to contacts-only mode, starting
    /// with the record that tripped the error. Any other failure skips just
    /// that record.
    pub async fn load_leads_from_json(&mut self, path: &Path) -> Result<Vec<CreatedLead>> {
        let Some(seeds) = read_seed_file::<LeadSeed>(path)? else {
            return Ok(Vec::new());
        };
        info!(count = seeds.len(), path = %path.display(), "loading leads");

        let mut created = Vec::new();
        let mut contacts_only = false;
        let mut index = 0;
        while index < seeds.len() {
            let seed = &seeds[index];

            if contacts_only {
                match self.crm.create_contact(&contact_props_for_lead(seed)).await {
                    Ok(contact_id) => created.push(CreatedLead {
                        contact_id,
                        company_id: None,
                        association_success: false,
                    }),
                    Err(err) => warn!(n = index + 1, %err, "error creating contact, skipping"),
                }
                index += 1;
                continue;
            }

            let company = match self.crm.create_company(&company_props(seed)).await {
                Ok(company) => company,
                Err(err) if err.is_permission_denied() => {
                    warn!(
                        %err,
                        "permission error creating companies, switching to contacts-only mode"
                    );
                    contacts_only = true;
                    // Reprocess this record under the new mode.
                    continue;
                }
                Err(err) => {
                    error!(n = index + 1, %err, "error processing lead, skipping");
                    index += 1;
                    continue;
                }
            };

            let contact_id = match self.crm.create_contact(&contact_props_for_lead(seed)).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(n = index + 1, %err, "error creating contact for lead, skipping");
                    index += 1;
                    continue;
                }
            };

            let association_success = match self
                .crm
                .associate_contact_to_company(&contact_id, &company.id)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(contact_id, company_id = %company.id, %err, "association failed");
                    false
                }
            };

            created.push(CreatedLead {
                contact_id,
                company_id: Some(company.id),
                association_success,
            });
            index += 1;
        }

        info!(
            created = created.len(),
            total = seeds.len(),
            contacts_only,
            "lead load completed"
        );
        Ok(created)
    }

    /// Create deals, optionally with randomized stages and random links to
    /// existing contacts/companies.
    pub async fn load_deals_from_json(
        &mut self,
        path: &Path,
        randomize_stages: bool,
        associate_with_existing: bool,
    ) -> Result<Vec<String>> {
        let Some(seeds) = read_seed_file::<DealSeed>(path)? else {
            return Ok(Vec::new());
        };

        let (existing_contacts, existing_companies) = if associate_with_existing {
            let contacts = match self
                .crm
                .list_contacts(LIST_LIMIT, &CONTACT_LIST_PROPERTIES)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "could not list contacts for associations");
                    Vec::new()
                }
            };
            let companies = match self.crm.list_companies(LIST_LIMIT).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "could not list companies for associations");
                    Vec::new()
                }
            };
            (contacts, companies)
        } else {
            (Vec::new(), Vec::new())
        };

        info!(
            count = seeds.len(),
            randomize_stages,
            contacts = existing_contacts.len(),
            companies = existing_companies.len(),
            "loading deals"
        );

        let mut created = Vec::new();
        for (index, seed) in seeds.iter().enumerate() {
            let stage = assign_deal_stage(&mut self.rng, randomize_stages, seed.dealstage.as_deref());
            let pick = if associate_with_existing {
                pick_associations(&mut self.rng, &existing_contacts, &existing_companies)
            } else {
                AssociationPick::default()
            };

            let props = DealProperties {
                deal_name: seed.dealname.clone(),
                amount: seed.amount,
                stage,
                pipeline: seed.pipeline.clone(),
                close_date: seed.closedate.clone(),
                deal_type: seed.dealtype.clone(),
                description: seed.description.clone(),
            };

            let deal = match self.crm.create_deal(&props).await {
                Ok(deal) => deal,
                Err(err) => {
                    error!(n = index + 1, %err, "error creating deal, skipping");
                    continue;
                }
            };

            if let Some(contact_id) = &pick.contact_id {
                if let Err(err) = self
                    .crm
                    .associate_deal_with_contact(&deal.id, contact_id)
                    .await
                {
                    warn!(deal_id = %deal.id, contact_id, %err, "deal-contact association failed");
                }
            }
            if let Some(company_id) = &pick.company_id {
                if let Err(err) = self
                    .crm
                    .associate_deal_with_company(&deal.id, company_id)
                    .await
                {
                    warn!(deal_id = %deal.id, company_id, %err, "deal-company association failed");
                }
            }

            info!(n = index + 1, id = %deal.id, stage = %props.stage, "deal created");
            created.push(deal.id);
        }

        info!(
            created = created.len(),
            total = seeds.len(),
            "deal load completed"
        );
        Ok(created)
    }

    /// Contacts, then leads, then deals. A failed kind is logged and counts
    /// as zero; the remaining kinds still load.
    pub async fn bulk_load(
        &mut self,
        contacts_file: &Path,
        leads_file: &Path,
        deals_file: &Path,
    ) -> LoadSummary {
        info!("starting complete data load with relationship assignment");

        let contacts_loaded = match self.load_contacts_from_json(contacts_file, true).await {
            Ok(created) => created.len(),
            Err(err) => {
                error!(%err, "contact load failed");
                0
            }
        };
        let leads_loaded = match self.load_leads_from_json(leads_file).await {
            Ok(created) => created.len(),
            Err(err) => {
                error!(%err, "lead load failed");
                0
            }
        };
        let deals_loaded = match self.load_deals_from_json(deals_file, true, true).await {
            Ok(created) => created.len(),
            Err(err) => {
                error!(%err, "deal load failed");
                0
            }
        };

        let summary = LoadSummary {
            contacts_loaded,
            leads_loaded,
            deals_loaded,
        };
        info!(
            contacts = summary.contacts_loaded,
            leads = summary.leads_loaded,
            deals = summary.deals_loaded,
            total = summary.total(),
            "complete data load finished"
        );
        summary
    }

    /// Archive everything: deals first, then contacts, then companies.
    /// Individual archive failures are logged and skipped.
    pub async fn wipe_all(&self) -> WipeSummary {
        info!("starting complete deletion of crm data");

        let deals_deleted = self.wipe_deals().await;
        let contacts_deleted = self.wipe_contacts().await;
        let companies_deleted = self.wipe_companies().await;

        let summary = WipeSummary {
            deals_deleted,
            contacts_deleted,
            companies_deleted,
        };
        info!(
            deals = summary.deals_deleted,
            contacts = summary.contacts_deleted,
            companies = summary.companies_deleted,
            total = summary.total(),
            "complete deletion finished"
        );
        summary
    }

    async fn wipe_deals(&self) -> usize {
        let targets = match self.crm.list_deals(LIST_LIMIT, &[]).await {
            Ok(targets) => targets,
            Err(err) => {
                error!(%err, "could not list deals for deletion");
                return 0;
            }
        };
        if targets.is_empty() {
            info!("no deals found to delete");
            return 0;
        }

        let mut deleted = 0;
        for target in &targets {
            match self.crm.archive_deal(&target.id).await {
                Ok(()) => deleted += 1,
                Err(err) => error!(id = %target.id, %err, "error archiving deal"),
            }
        }
        info!(deleted, total = targets.len(), "deal deletion completed");
        deleted
    }

    async fn wipe_contacts(&self) -> usize {
        let targets = match self
            .crm
            .list_contacts(LIST_LIMIT, &CONTACT_LIST_PROPERTIES)
            .await
        {
            Ok(targets) => targets,
            Err(err) => {
                error!(%err, "could not list contacts for deletion");
                return 0;
            }
        };
        if targets.is_empty() {
            info!("no contacts found to delete");
            return 0;
        }

        let mut deleted = 0;
        for target in &targets {
            match self.crm.archive_contact(&target.id).await {
                Ok(()) => deleted += 1,
                Err(err) => error!(id = %target.id, %err, "error archiving contact"),
            }
        }
        info!(deleted, total = targets.len(), "contact deletion completed");
        deleted
    }

    async fn wipe_companies(&self) -> usize {
        let targets = match self.crm.list_companies(LIST_LIMIT).await {
            Ok(targets) => targets,
            Err(err) => {
                error!(%err, "could not list companies for deletion");
                return 0;
            }
        };
        if targets.is_empty() {
            info!("no companies found to delete");
            return 0;
        }

        let mut deleted = 0;
        for target in &targets {
            match self.crm.archive_company(&target.id).await {
                Ok(()) => deleted += 1,
                Err(err) => error!(id = %target.id, %err, "error archiving company"),
            }
        }
        info!(deleted, total = targets.len(), "company deletion completed");
        deleted
    }
}

fn contact_props_for_lead(seed: &LeadSeed) -> ContactProperties {
    ContactProperties {
        email: seed.contact.email.clone(),
        first_name: seed.contact.firstname.clone(),
        last_name: seed.contact.lastname.clone(),
        phone: seed.contact.phone.clone(),
        company: seed.company.name.clone().unwrap_or_default(),
        job_title: seed.contact.jobtitle.clone(),
        is_lead: true,
        lead_status: "NEW".to_string(),
    }
}

fn company_props(seed: &LeadSeed) -> CompanyProperties {
    CompanyProperties {
        name: seed.company.name.clone(),
        domain: seed.company.domain.clone(),
        phone: seed.company.phone.clone(),
        city: seed.company.city.clone(),
        country: seed.company.country.clone(),
        industry: seed.company.industry.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hubsync_crm::CrmError;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingState {
        contacts_created: Vec<ContactProperties>,
        companies_created: usize,
        deals_created: Vec<DealProperties>,
        associations: Vec<(String, String)>,
        archived: Vec<String>,
        list_calls: usize,
    }

    #[derive(Default)]
    struct RecordingCrm {
        state: Mutex<RecordingState>,
        existing_contacts: Vec<CrmObject>,
        existing_companies: Vec<CrmObject>,
        existing_deals: Vec<CrmObject>,
        company_creation_fails_with_403: bool,
    }

    impl RecordingCrm {
        fn state(&self) -> std::sync::MutexGuard<'_, RecordingState> {
            self.state.lock().expect("crm state lock")
        }
    }

    fn object(id: &str) -> CrmObject {
        CrmObject {
            id: id.to_string(),
            properties: BTreeMap::new(),
        }
    }

    #[async_trait]
    impl CrmClient for RecordingCrm {
        async fn create_contact(&self, props: &ContactProperties) -> Result<String, CrmError> {
            let mut state = self.state();
            state.contacts_created.push(props.clone());
            Ok(format!("contact-{}", state.contacts_created.len()))
        }

        async fn create_company(&self, _: &CompanyProperties) -> Result<CrmObject, CrmError> {
            let mut state = self.state();
            state.companies_created += 1;
            if self.company_creation_fails_with_403 {
                return Err(CrmError::Api {
                    status: 403,
                    message: "This app does not have the required scope".to_string(),
                });
            }
            Ok(object(&format!("company-{}", state.companies_created)))
        }

        async fn create_deal(&self, props: &DealProperties) -> Result<CrmObject, CrmError> {
            let mut state = self.state();
            state.deals_created.push(props.clone());
            Ok(object(&format!("deal-{}", state.deals_created.len())))
        }

        async fn associate_contact_to_company(
            &self,
            contact_id: &str,
            company_id: &str,
        ) -> Result<(), CrmError> {
            self.state()
                .associations
                .push((contact_id.to_string(), company_id.to_string()));
            Ok(())
        }

        async fn associate_deal_with_contact(
            &self,
            deal_id: &str,
            contact_id: &str,
        ) -> Result<(), CrmError> {
            self.state()
                .associations
                .push((deal_id.to_string(), contact_id.to_string()));
            Ok(())
        }

        async fn associate_deal_with_company(
            &self,
            deal_id: &str,
            company_id: &str,
        ) -> Result<(), CrmError> {
            self.state()
                .associations
                .push((deal_id.to_string(), company_id.to_string()));
            Ok(())
        }

        async fn list_contacts(&self, _: u32, _: &[&str]) -> Result<Vec<CrmObject>, CrmError> {
            self.state().list_calls += 1;
            Ok(self.existing_contacts.clone())
        }

        async fn list_deals(&self, _: u32, _: &[&str]) -> Result<Vec<CrmObject>, CrmError> {
            self.state().list_calls += 1;
            Ok(self.existing_deals.clone())
        }

        async fn list_companies(&self, _: u32) -> Result<Vec<CrmObject>, CrmError> {
            self.state().list_calls += 1;
            Ok(self.existing_companies.clone())
        }

        async fn archive_contact(&self, id: &str) -> Result<(), CrmError> {
            self.state().archived.push(id.to_string());
            Ok(())
        }

        async fn archive_company(&self, id: &str) -> Result<(), CrmError> {
            self.state().archived.push(id.to_string());
            Ok(())
        }

        async fn archive_deal(&self, id: &str) -> Result<(), CrmError> {
            self.state().archived.push(id.to_string());
            Ok(())
        }
    }

    fn seed_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp seed file");
        file.write_all(contents.as_bytes()).expect("write seed");
        file
    }

    fn loader(crm: Arc<RecordingCrm>) -> SeedLoader {
        SeedLoader::new(crm, StdRng::seed_from_u64(7))
    }

    #[test]
    fn disabled_lead_assignment_always_yields_plain_new_contacts() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let assignment = assign_lead_status(&mut rng, false);
            assert!(!assignment.is_lead);
            assert_eq!(assignment.status, "NEW");
        }
    }

    #[test]
    fn enabled_lead_assignment_draws_from_the_fixed_vocabulary() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut saw_lead = false;
        let mut saw_plain = false;
        for _ in 0..200 {
            let assignment = assign_lead_status(&mut rng, true);
            assert!(LEAD_STATUSES.contains(&assignment.status));
            saw_lead |= assignment.is_lead;
            saw_plain |= !assignment.is_lead;
        }
        assert!(saw_lead && saw_plain);
    }

    #[test]
    fn stage_assignment_defaults_to_first_stage_without_randomization() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            assign_deal_stage(&mut rng, false, None),
            DEFAULT_DEAL_STAGE
        );
        assert_eq!(
            assign_deal_stage(&mut rng, false, Some("closedwon")),
            "closedwon"
        );
        assert!(DEAL_STAGES.contains(&assign_deal_stage(&mut rng, true, None).as_str()));
    }

    #[test]
    fn empty_candidate_lists_mean_no_linkage_attempt() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..50 {
            let pick = pick_associations(&mut rng, &[], &[]);
            assert_eq!(pick, AssociationPick::default());
        }
    }

    #[tokio::test]
    async fn three_plain_contacts_load_as_regular_new_contacts() {
        let file = seed_file(r#"[{"firstname":"A"},{"firstname":"B"},{"firstname":"C"}]"#);
        let crm = Arc::new(RecordingCrm::default());
        let mut loader = loader(crm.clone());

        let created = loader
            .load_contacts_from_json(file.path(), false)
            .await
            .expect("load contacts");

        assert_eq!(created.len(), 3);
        let state = crm.state();
        assert_eq!(state.contacts_created.len(), 3);
        for props in &state.contacts_created {
            assert!(!props.is_lead);
            assert_eq!(props.lead_status, "NEW");
        }
    }

    #[tokio::test]
    async fn missing_seed_file_is_a_non_fatal_noop() {
        let crm = Arc::new(RecordingCrm::default());
        let mut loader = loader(crm.clone());

        let created = loader
            .load_contacts_from_json(Path::new("/definitely/not/here.json"), true)
            .await
            .expect("missing file load");

        assert!(created.is_empty());
        assert!(crm.state().contacts_created.is_empty());
    }

    #[tokio::test]
    async fn permission_failure_switches_the_rest_of_the_run_to_contacts_only() {
        let file = seed_file(
            r#"[
                {"contact":{"firstname":"A"},"company":{"name":"Acme"}},
                {"contact":{"firstname":"B"},"company":{"name":"Bolt"}},
                {"contact":{"firstname":"C"},"company":{"name":"Crux"}}
            ]"#,
        );
        let crm = Arc::new(RecordingCrm {
            company_creation_fails_with_403: true,
            ..Default::default()
        });
        let mut loader = loader(crm.clone());

        let created = loader
            .load_leads_from_json(file.path())
            .await
            .expect("lead load");

        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|lead| lead.company_id.is_none()));

        let state = crm.state();
        // Exactly one company attempt: the one that tripped the fallback.
        assert_eq!(state.companies_created, 1);
        assert_eq!(state.contacts_created.len(), 3);
        assert!(state.associations.is_empty());
    }

    #[tokio::test]
    async fn leads_load_pairs_company_contact_and_association() {
        let file = seed_file(
            r#"[{"contact":{"firstname":"A","email":"a@x.com"},"company":{"name":"Acme"}}]"#,
        );
        let crm = Arc::new(RecordingCrm::default());
        let mut loader = loader(crm.clone());

        let created = loader
            .load_leads_from_json(file.path())
            .await
            .expect("lead load");

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].company_id.as_deref(), Some("company-1"));
        assert!(created[0].association_success);

        let state = crm.state();
        assert!(state.contacts_created[0].is_lead);
        assert_eq!(
            state.associations,
            vec![("contact-1".to_string(), "company-1".to_string())]
        );
    }

    #[tokio::test]
    async fn deal_load_without_associations_never_lists_candidates() {
        let file = seed_file(r#"[{"dealname":"One","amount":10.0},{"dealname":"Two"}]"#);
        let crm = Arc::new(RecordingCrm::default());
        let mut loader = loader(crm.clone());

        let created = loader
            .load_deals_from_json(file.path(), false, false)
            .await
            .expect("deal load");

        assert_eq!(created.len(), 2);
        let state = crm.state();
        assert_eq!(state.list_calls, 0);
        assert!(state.associations.is_empty());
        assert!(state
            .deals_created
            .iter()
            .all(|deal| deal.stage == DEFAULT_DEAL_STAGE));
    }

    #[tokio::test]
    async fn randomized_deal_load_stays_inside_the_stage_vocabulary() {
        let file = seed_file(
            r#"[{"dealname":"One"},{"dealname":"Two"},{"dealname":"Three"},{"dealname":"Four"}]"#,
        );
        let crm = Arc::new(RecordingCrm {
            existing_contacts: vec![object("c1"), object("c2")],
            existing_companies: vec![object("k1")],
            ..Default::default()
        });
        let mut loader = loader(crm.clone());

        let created = loader
            .load_deals_from_json(file.path(), true, true)
            .await
            .expect("deal load");

        assert_eq!(created.len(), 4);
        let state = crm.state();
        for deal in &state.deals_created {
            assert!(DEAL_STAGES.contains(&deal.stage.as_str()));
        }
        for (_, target) in &state.associations {
            assert!(["c1", "c2", "k1"].contains(&target.as_str()));
        }
    }

    #[tokio::test]
    async fn wipe_archives_deals_then_contacts_then_companies() {
        let crm = Arc::new(RecordingCrm {
            existing_contacts: vec![object("c1")],
            existing_companies: vec![object("k1"), object("k2")],
            existing_deals: vec![object("d1"), object("d2"), object("d3")],
            ..Default::default()
        });
        let loader = loader(crm.clone());

        let summary = loader.wipe_all().await;

        assert_eq!(summary.deals_deleted, 3);
        assert_eq!(summary.contacts_deleted, 1);
        assert_eq!(summary.companies_deleted, 2);
        assert_eq!(summary.total(), 6);
        assert_eq!(
            crm.state().archived,
            vec!["d1", "d2", "d3", "c1", "k1", "k2"]
        );
    }
}
