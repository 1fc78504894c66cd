//! Entity-specific derivation rules applied after coercion and FK resolution.
//!
//! Rules either adjust fields in place or reject the row with a
//! [`QuarantineReason`]. They mirror constraints of the target schemas, so a
//! rejection here is cheaper than the constraint violation it prevents.

use crate::extract::{FieldValue, Record};
use crate::report::QuarantineReason;
use crate::schema::TableSpec;

const BUILDING_OWNER_FIELDS: [&str; 5] = [
    "owner_tax_code",
    "owner_last_name",
    "owner_first_name",
    "owner_business_name",
    "owner_vat_number",
];

pub fn apply(spec: &TableSpec, record: &mut Record) -> std::result::Result<(), QuarantineReason> {
    match spec.name.as_str() {
        "companies" => {
            // Display name falls back to the registered business name.
            if record.get("name").is_null() {
                let business = record.get("business_name").clone();
                if !business.is_null() {
                    record.set("name", business);
                }
            }
        }
        "buildings" => {
            // Owner details only make sense for leased premises.
            if record.get("is_own_property") == &FieldValue::Bool(true) {
                for field in BUILDING_OWNER_FIELDS {
                    record.set(field, FieldValue::Null);
                }
            }
        }
        "udo_specialties" => {
            // The target schema enforces at most one linkage kind per row.
            if !record.get("clinical_operational_unit_id").is_null()
                && !record.get("clinical_organigram_node_id").is_null()
            {
                return Err(QuarantineReason::MutuallyExclusiveFieldViolation {
                    first: "clinical_operational_unit_id".to_string(),
                    second: "clinical_organigram_node_id".to_string(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}
