//! Association Resolver
//!
//! Resolves, for one page of records, the related objects a descriptor needs:
//! the first company of each contact, or the email of the first contact of
//! each meeting. One batch call per page (two for meetings).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::crm::{CrmApi, CrmError, ObjectType};
use crate::sync::entities::AssociationKind;

/// Associations resolved for one page of records, keyed by source id.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResolvedAssociations {
    #[default]
    None,
    /// contact id → company id
    Companies(HashMap<String, String>),
    /// meeting id → contact properties; `None` when the contact read returned nothing
    MeetingContacts(HashMap<String, Option<Map<String, Value>>>),
}

impl ResolvedAssociations {
    pub fn company_for(&self, contact_id: &str) -> Option<&str> {
        match self {
            ResolvedAssociations::Companies(map) => map.get(contact_id).map(String::as_str),
            _ => None,
        }
    }

    pub fn contact_email_for(&self, meeting_id: &str) -> Option<Value> {
        match self {
            ResolvedAssociations::MeetingContacts(map) => map
                .get(meeting_id)?
                .as_ref()?
                .get("email")
                .filter(|email| !email.is_null())
                .cloned(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResolvedAssociations::None => 0,
            ResolvedAssociations::Companies(map) => map.len(),
            ResolvedAssociations::MeetingContacts(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AssociationResolver {
    crm: Arc<dyn CrmApi>,
}

impl AssociationResolver {
    pub fn new(crm: Arc<dyn CrmApi>) -> Self {
        Self { crm }
    }

    /// Resolve `kind` associations for `ids`. Makes no request for an empty page.
    pub async fn resolve(
        &self,
        kind: AssociationKind,
        access_token: &str,
        ids: &[String],
    ) -> Result<ResolvedAssociations, CrmError> {
        if ids.is_empty() {
            return Ok(ResolvedAssociations::None);
        }

        match kind {
            AssociationKind::ContactCompany => self.contact_companies(access_token, ids).await,
            AssociationKind::MeetingContact => self.meeting_contacts(access_token, ids).await,
        }
    }

    async fn contact_companies(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<ResolvedAssociations, CrmError> {
        let results = self
            .crm
            .batch_read_associations(access_token, ObjectType::Contacts, ObjectType::Companies, ids)
            .await?;

        let companies: HashMap<String, String> = results
            .into_iter()
            .filter_map(|result| {
                let from = result.from?;
                let company = result.to.into_iter().next()?;
                Some((from.id, company.id))
            })
            .collect();

        debug!(contacts = ids.len(), resolved = companies.len(), "resolved contact companies");
        Ok(ResolvedAssociations::Companies(companies))
    }

    async fn meeting_contacts(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<ResolvedAssociations, CrmError> {
        let results = self
            .crm
            .batch_read_associations(access_token, ObjectType::Meetings, ObjectType::Contacts, ids)
            .await?;

        let links: Vec<(String, Option<String>)> = results
            .into_iter()
            .filter_map(|result| {
                let from = result.from?;
                let contact = result.to.into_iter().next().map(|to| to.id);
                Some((from.id, contact))
            })
            .collect();

        let mut seen = HashSet::new();
        let contact_ids: Vec<String> = links
            .iter()
            .filter_map(|(_, contact)| contact.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut contacts: HashMap<String, Map<String, Value>> = HashMap::new();
        if !contact_ids.is_empty() {
            let objects = self
                .crm
                .batch_read(access_token, ObjectType::Contacts, &contact_ids, &["email"])
                .await?;
            contacts.extend(objects.into_iter().map(|object| (object.id, object.properties)));
        }

        let projected: HashMap<String, Option<Map<String, Value>>> = links
            .into_iter()
            .map(|(meeting_id, contact_id)| {
                let fields = contact_id.and_then(|id| contacts.get(&id).cloned());
                (meeting_id, fields)
            })
            .collect();

        debug!(
            meetings = ids.len(),
            contacts = contact_ids.len(),
            "resolved meeting contacts"
        );
        Ok(ResolvedAssociations::MeetingContacts(projected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{
        AssociatedId, AssociationResult, CrmObject, SearchPage, SearchRequest, TokenGrant,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubCrm {
        associations: Vec<AssociationResult>,
        objects: Vec<CrmObject>,
        association_calls: Mutex<Vec<(ObjectType, ObjectType, Vec<String>)>>,
        read_calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl CrmApi for StubCrm {
        async fn search(
            &self,
            _access_token: &str,
            _object: ObjectType,
            _request: &SearchRequest,
        ) -> Result<SearchPage, CrmError> {
            Ok(SearchPage::default())
        }

        async fn batch_read_associations(
            &self,
            _access_token: &str,
            from: ObjectType,
            to: ObjectType,
            ids: &[String],
        ) -> Result<Vec<AssociationResult>, CrmError> {
            self.association_calls
                .lock()
                .unwrap()
                .push((from, to, ids.to_vec()));
            if self.fail {
                return Err(CrmError::Api {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(self.associations.clone())
        }

        async fn batch_read(
            &self,
            _access_token: &str,
            _object: ObjectType,
            ids: &[String],
            _properties: &[&str],
        ) -> Result<Vec<CrmObject>, CrmError> {
            self.read_calls.lock().unwrap().push(ids.to_vec());
            Ok(self
                .objects
                .iter()
                .filter(|object| ids.contains(&object.id))
                .cloned()
                .collect())
        }

        async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenGrant, CrmError> {
            unreachable!("refresh is not used by association tests")
        }
    }

    fn link(from: Option<&str>, to: &[&str]) -> AssociationResult {
        AssociationResult {
            from: from.map(|id| AssociatedId { id: id.to_string() }),
            to: to
                .iter()
                .map(|id| AssociatedId { id: id.to_string() })
                .collect(),
        }
    }

    fn contact(id: &str, email: &str) -> CrmObject {
        CrmObject {
            id: id.to_string(),
            properties: json!({"email": email}).as_object().cloned().unwrap(),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_page_makes_no_request() {
        let crm = Arc::new(StubCrm::default());
        let resolver = AssociationResolver::new(crm.clone());

        let resolved = resolver
            .resolve(AssociationKind::ContactCompany, "token", &[])
            .await
            .unwrap();

        assert_eq!(resolved, ResolvedAssociations::None);
        assert!(crm.association_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn contact_takes_first_company_and_skips_unresolved_rows() {
        let crm = Arc::new(StubCrm {
            associations: vec![
                link(Some("c1"), &["co-1", "co-2"]),
                link(Some("c2"), &[]),
                link(None, &["co-9"]),
            ],
            ..Default::default()
        });
        let resolver = AssociationResolver::new(crm.clone());

        let resolved = resolver
            .resolve(AssociationKind::ContactCompany, "token", &ids(&["c1", "c2", "c3"]))
            .await
            .unwrap();

        assert_eq!(resolved.company_for("c1"), Some("co-1"));
        assert_eq!(resolved.company_for("c2"), None);
        assert_eq!(resolved.company_for("c3"), None);
        assert_eq!(resolved.len(), 1);

        let calls = crm.association_calls.lock().unwrap();
        assert_eq!(calls[0].0, ObjectType::Contacts);
        assert_eq!(calls[0].1, ObjectType::Companies);
    }

    #[tokio::test]
    async fn meetings_resolve_contact_email_with_deduplicated_read() {
        let crm = Arc::new(StubCrm {
            associations: vec![
                link(Some("m1"), &["p1"]),
                link(Some("m2"), &["p1", "p2"]),
                link(Some("m3"), &["p3"]),
                link(Some("m4"), &[]),
            ],
            objects: vec![contact("p1", "ada@example.com")],
            ..Default::default()
        });
        let resolver = AssociationResolver::new(crm.clone());

        let resolved = resolver
            .resolve(
                AssociationKind::MeetingContact,
                "token",
                &ids(&["m1", "m2", "m3", "m4"]),
            )
            .await
            .unwrap();

        assert_eq!(resolved.contact_email_for("m1"), Some(json!("ada@example.com")));
        assert_eq!(resolved.contact_email_for("m2"), Some(json!("ada@example.com")));
        assert_eq!(resolved.contact_email_for("m3"), None);
        assert_eq!(resolved.contact_email_for("m4"), None);
        assert_eq!(resolved.len(), 4);

        let reads = crm.read_calls.lock().unwrap();
        assert_eq!(reads.as_slice(), [ids(&["p1", "p3"])]);
    }

    #[tokio::test]
    async fn meetings_without_contacts_skip_batch_read() {
        let crm = Arc::new(StubCrm {
            associations: vec![link(Some("m1"), &[])],
            ..Default::default()
        });
        let resolver = AssociationResolver::new(crm.clone());

        let resolved = resolver
            .resolve(AssociationKind::MeetingContact, "token", &ids(&["m1"]))
            .await
            .unwrap();

        assert_eq!(resolved.contact_email_for("m1"), None);
        assert!(crm.read_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_propagate() {
        let crm = Arc::new(StubCrm {
            fail: true,
            ..Default::default()
        });
        let resolver = AssociationResolver::new(crm);

        let err = resolver
            .resolve(AssociationKind::ContactCompany, "token", &ids(&["c1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Api { status: 500, .. }));
    }
}
