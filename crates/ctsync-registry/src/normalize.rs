//! Raw registry study → [`CanonicalRecord`].
//!
//! Every section of the registry payload is optional. Missing sections decode to
//! defaults, blank strings collapse to `None`, and only a missing identifier or
//! a structurally wrong payload is an error.

use ctsync_core::{CanonicalRecord, Contact, Intervention, Location, PrimaryOutcome};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::RawRecord;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("study has no NCT identifier")]
    MissingIdentifier,
    #[error("malformed study payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawStudy {
    #[serde(deserialize_with = "null_as_default")]
    protocol_section: ProtocolSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ProtocolSection {
    #[serde(deserialize_with = "null_as_default")]
    identification_module: IdentificationModule,
    #[serde(deserialize_with = "null_as_default")]
    status_module: StatusModule,
    #[serde(deserialize_with = "null_as_default")]
    design_module: DesignModule,
    #[serde(deserialize_with = "null_as_default")]
    eligibility_module: EligibilityModule,
    #[serde(deserialize_with = "null_as_default")]
    description_module: DescriptionModule,
    #[serde(deserialize_with = "null_as_default")]
    sponsor_collaborators_module: SponsorModule,
    #[serde(deserialize_with = "null_as_default")]
    contacts_locations_module: ContactsLocationsModule,
    #[serde(deserialize_with = "null_as_default")]
    arms_interventions_module: ArmsInterventionsModule,
    #[serde(deserialize_with = "null_as_default")]
    outcomes_module: OutcomesModule,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct IdentificationModule {
    nct_id: Option<String>,
    brief_title: Option<String>,
    official_title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StatusModule {
    overall_status: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    start_date_struct: DateStruct,
    #[serde(deserialize_with = "null_as_default")]
    completion_date_struct: DateStruct,
    last_update_submit_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DateStruct {
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DesignModule {
    #[serde(deserialize_with = "null_as_default")]
    phases: Vec<String>,
    study_type: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    enrollment_info: EnrollmentInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnrollmentInfo {
    #[serde(deserialize_with = "lenient_count")]
    count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EligibilityModule {
    eligibility_criteria: Option<String>,
    minimum_age: Option<String>,
    maximum_age: Option<String>,
    sex: Option<String>,
    healthy_volunteers: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DescriptionModule {
    brief_summary: Option<String>,
    detailed_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SponsorModule {
    #[serde(deserialize_with = "null_as_default")]
    lead_sponsor: Named,
    #[serde(deserialize_with = "null_as_default")]
    collaborators: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContactsLocationsModule {
    #[serde(deserialize_with = "null_as_default")]
    locations: Vec<RawLocation>,
    #[serde(deserialize_with = "null_as_default")]
    central_contacts: Vec<RawContact>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLocation {
    facility: Option<String>,
    city: Option<String>,
    state: Option<String>,
    country: Option<String>,
    zip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawContact {
    name: Option<String>,
    role: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArmsInterventionsModule {
    #[serde(deserialize_with = "null_as_default")]
    interventions: Vec<RawIntervention>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIntervention {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OutcomesModule {
    #[serde(deserialize_with = "null_as_default")]
    primary_outcomes: Vec<RawOutcome>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawOutcome {
    measure: Option<String>,
    time_frame: Option<String>,
}

/// Registry payloads use `null` for absent sections and lists as often as
/// they omit the key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Whole non-negative numbers only, whether encoded as `12` or `12.0`.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_u64().or_else(|| {
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        })
    }))
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Normalize one study. `study_page_base` is the registry's public study URL
/// prefix; the record's `source_url` is `{study_page_base}/{nct_id}`.
pub fn normalize(raw: &RawRecord, study_page_base: &str) -> Result<CanonicalRecord, RecordError> {
    let study: RawStudy = if raw.0.is_null() {
        RawStudy::default()
    } else {
        serde_json::from_value(raw.0.clone())?
    };
    let p = study.protocol_section;

    let nct_id = clean(p.identification_module.nct_id).ok_or(RecordError::MissingIdentifier)?;

    let phases: Vec<String> = p
        .design_module
        .phases
        .into_iter()
        .filter_map(|phase| clean(Some(phase)))
        .collect();
    let phase = (!phases.is_empty()).then(|| phases.join(", "));

    let source_url = format!("{}/{}", study_page_base.trim_end_matches('/'), nct_id);

    Ok(CanonicalRecord {
        title: clean(p.identification_module.brief_title),
        official_title: clean(p.identification_module.official_title),

        status: clean(p.status_module.overall_status),
        start_date: clean(p.status_module.start_date_struct.date),
        completion_date: clean(p.status_module.completion_date_struct.date),
        last_updated: clean(p.status_module.last_update_submit_date),

        phase,
        study_type: clean(p.design_module.study_type),
        enrollment: p.design_module.enrollment_info.count,

        eligibility_criteria: clean(p.eligibility_module.eligibility_criteria),
        minimum_age: clean(p.eligibility_module.minimum_age),
        maximum_age: clean(p.eligibility_module.maximum_age),
        sex: clean(p.eligibility_module.sex),
        healthy_volunteers: p.eligibility_module.healthy_volunteers,

        brief_summary: clean(p.description_module.brief_summary),
        detailed_description: clean(p.description_module.detailed_description),

        sponsor: clean(p.sponsor_collaborators_module.lead_sponsor.name),
        collaborators: p
            .sponsor_collaborators_module
            .collaborators
            .into_iter()
            .filter_map(|c| clean(c.name))
            .collect(),

        locations: p
            .contacts_locations_module
            .locations
            .into_iter()
            .map(|loc| Location {
                facility: clean(loc.facility),
                city: clean(loc.city),
                state: clean(loc.state),
                country: clean(loc.country),
                postal_code: clean(loc.zip),
            })
            .collect(),
        central_contacts: p
            .contacts_locations_module
            .central_contacts
            .into_iter()
            .map(|c| Contact {
                name: clean(c.name),
                role: clean(c.role),
                email: clean(c.email),
                phone: clean(c.phone),
            })
            .collect(),
        interventions: p
            .arms_interventions_module
            .interventions
            .into_iter()
            .map(|i| Intervention {
                kind: clean(i.kind),
                name: clean(i.name),
                description: clean(i.description),
            })
            .collect(),
        primary_outcomes: p
            .outcomes_module
            .primary_outcomes
            .into_iter()
            .map(|o| PrimaryOutcome {
                measure: clean(o.measure),
                time_frame: clean(o.time_frame),
            })
            .collect(),

        nct_id,
        source_url,
    })
}
