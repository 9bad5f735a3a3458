//! Entity Transformer
//!
//! Turns one raw record into zero or one [`OutputEvent`] using its
//! [`EntityDescriptor`]. Suppression is decided before the Created/Updated
//! classification so it never depends on the watermark.

use chrono::{DateTime, Utc};

use crate::crm::RawRecord;
use crate::sync::associations::ResolvedAssociations;
use crate::sync::entities::{EntityDescriptor, RequiredField};
use crate::sync::event::OutputEvent;

/// A record is new when the kind was never synced or it was created after the watermark.
pub fn is_created(record: &RawRecord, watermark: Option<DateTime<Utc>>) -> bool {
    watermark.is_none_or(|watermark| record.created_at > watermark)
}

/// Missing, null or empty required field.
pub fn is_suppressed(required: RequiredField, record: &RawRecord) -> bool {
    match required {
        RequiredField::Properties => record.properties.is_none(),
        RequiredField::Property(name) => record.property(name).is_none(),
    }
}

pub fn transform(
    descriptor: &EntityDescriptor,
    record: &RawRecord,
    watermark: Option<DateTime<Utc>>,
    associations: &ResolvedAssociations,
) -> Option<OutputEvent> {
    if is_suppressed(descriptor.required, record) {
        return None;
    }
    Some((descriptor.build)(
        record,
        is_created(record, watermark),
        associations,
    ))
}
