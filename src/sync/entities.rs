//! Entity descriptors
//!
//! Each synced entity kind is described by data rather than code: which CRM
//! object it reads, which properties it requests, which field must be present
//! for a record to produce an event, which association it needs, and how a
//! record maps onto an [`OutputEvent`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crm::{ObjectType, RawRecord};
use crate::sync::associations::ResolvedAssociations;
use crate::sync::event::{OutputEvent, PropertyScope};

/// Search property every entity kind is filtered and sorted on.
pub const LAST_MODIFIED_PROPERTY: &str = "hs_lastmodifieddate";

/// Entity kinds synced per account, in sync order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Companies,
    Contacts,
    Meetings,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Companies => "companies",
            EntityKind::Contacts => "contacts",
            EntityKind::Meetings => "meetings",
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            EntityKind::Companies => ObjectType::Companies,
            EntityKind::Contacts => ObjectType::Contacts,
            EntityKind::Meetings => ObjectType::Meetings,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field whose absence suppresses a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    /// The property map itself must be present.
    Properties,
    /// The named property must be present, non-null and non-empty.
    Property(&'static str),
}

/// Association a kind resolves per batch before transforming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// contact → first associated company id
    ContactCompany,
    /// meeting → first associated contact → contact email
    MeetingContact,
}

/// Maps one record onto an event. `is_created` selects the Created/Updated variant.
pub type BuildFn = fn(&RawRecord, bool, &ResolvedAssociations) -> OutputEvent;

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    pub watermark_key: &'static str,
    pub modified_property: &'static str,
    pub properties: &'static [&'static str],
    pub required: RequiredField,
    pub associations: Option<AssociationKind>,
    pub build: BuildFn,
}

impl EntityDescriptor {
    pub fn object_type(&self) -> ObjectType {
        self.kind.object_type()
    }
}

/// Descriptors in account sync order: companies, contacts, meetings.
pub fn default_descriptors() -> Vec<EntityDescriptor> {
    vec![companies(), contacts(), meetings()]
}

pub fn companies() -> EntityDescriptor {
    EntityDescriptor {
        kind: EntityKind::Companies,
        watermark_key: "companies",
        modified_property: LAST_MODIFIED_PROPERTY,
        properties: &[
            "name",
            "domain",
            "country",
            "industry",
            "description",
            "annualrevenue",
            "numberofemployees",
            "hs_lead_status",
        ],
        required: RequiredField::Properties,
        associations: None,
        build: build_company,
    }
}

pub fn contacts() -> EntityDescriptor {
    EntityDescriptor {
        kind: EntityKind::Contacts,
        watermark_key: "contacts",
        modified_property: LAST_MODIFIED_PROPERTY,
        properties: &[
            "firstname",
            "lastname",
            "jobtitle",
            "email",
            "hubspotscore",
            "hs_lead_status",
            "hs_analytics_source",
            "hs_latest_source",
        ],
        required: RequiredField::Property("email"),
        associations: Some(AssociationKind::ContactCompany),
        build: build_contact,
    }
}

pub fn meetings() -> EntityDescriptor {
    EntityDescriptor {
        kind: EntityKind::Meetings,
        watermark_key: "meetings",
        modified_property: LAST_MODIFIED_PROPERTY,
        properties: &[
            "hs_meeting_title",
            "hs_meeting_start_time",
            "hs_meeting_end_time",
            "hs_meeting_created_at",
        ],
        required: RequiredField::Property("hs_meeting_title"),
        associations: Some(AssociationKind::MeetingContact),
        build: build_meeting,
    }
}

fn event_name(entity: &str, is_created: bool) -> String {
    if is_created {
        format!("{entity} Created")
    } else {
        format!("{entity} Updated")
    }
}

fn build_company(record: &RawRecord, is_created: bool, _: &ResolvedAssociations) -> OutputEvent {
    let base = if is_created {
        record.created_at
    } else {
        record.updated_at
    };

    OutputEvent::new(
        event_name("Company", is_created),
        base - Duration::seconds(2),
        PropertyScope::Company,
    )
    .with_include_in_analytics(false)
    .with_property("company_id", Some(record.id.as_str()))
    .with_property("company_domain", record.property_value("domain").cloned())
    .with_property("company_industry", record.property_value("industry").cloned())
}

fn build_contact(
    record: &RawRecord,
    is_created: bool,
    associations: &ResolvedAssociations,
) -> OutputEvent {
    let timestamp = if is_created {
        record.created_at
    } else {
        record.updated_at
    };
    let name = format!(
        "{} {}",
        record.property("firstname").unwrap_or_default(),
        record.property("lastname").unwrap_or_default()
    );

    let mut event = OutputEvent::new(event_name("Contact", is_created), timestamp, PropertyScope::User)
        .with_include_in_analytics(false)
        .with_property("company_id", associations.company_for(&record.id))
        .with_property("contact_name", Some(name.trim()))
        .with_property("contact_title", record.property_value("jobtitle").cloned())
        .with_property("contact_source", record.property_value("hs_analytics_source").cloned())
        .with_property("contact_status", record.property_value("hs_lead_status").cloned())
        .with_property("contact_score", Some(contact_score(record)));

    if let Some(email) = record.property("email") {
        event = event.with_identity(email);
    }
    event
}

fn build_meeting(
    record: &RawRecord,
    is_created: bool,
    associations: &ResolvedAssociations,
) -> OutputEvent {
    let timestamp = if is_created {
        record
            .property("hs_meeting_created_at")
            .and_then(parse_instant)
            .unwrap_or(record.created_at)
    } else {
        record.updated_at
    };

    OutputEvent::new(event_name("Meeting", is_created), timestamp, PropertyScope::Meeting)
        .with_property("meeting_id", Some(record.id.as_str()))
        .with_property("meeting_title", record.property_value("hs_meeting_title").cloned())
        .with_property("start_time", record.property_value("hs_meeting_start_time").cloned())
        .with_property("end_time", record.property_value("hs_meeting_end_time").cloned())
        .with_property("contact_email", associations.contact_email_for(&record.id))
}

/// Leading integer of `hubspotscore` (optional sign, then digits), 0 when
/// missing or when no digit leads.
fn contact_score(record: &RawRecord) -> i64 {
    record
        .property("hubspotscore")
        .and_then(leading_integer)
        .unwrap_or(0)
}

fn leading_integer(raw: &str) -> Option<i64> {
    let raw = raw.trim_start();
    let unsigned = raw.trim_start_matches(['+', '-']);
    let sign_len = raw.len() - unsigned.len();
    if sign_len > 1 {
        return None;
    }
    let digits = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    if digits == 0 {
        return None;
    }
    raw[..sign_len + digits].parse().ok()
}

/// CRM datetime properties arrive either as RFC 3339 or as epoch millis.
fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}
