//! Markdown rendering of a canonical record.

use std::fmt::Write as _;

use ctsync_core::{CanonicalRecord, Contact, Intervention, Location, PrimaryOutcome};

/// Stand-in for any absent scalar.
pub const PLACEHOLDER: &str = "N/A";

pub const NO_DESCRIPTION: &str = "No description available.";
pub const NO_CRITERIA: &str = "No eligibility criteria specified.";
pub const NO_INTERVENTIONS: &str = "- No interventions listed";
pub const NO_OUTCOMES: &str = "- No primary outcomes listed";
pub const NO_LOCATIONS: &str = "- No locations listed";
pub const NO_CONTACTS: &str = "- No central contacts listed";

fn or_na(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(PLACEHOLDER)
}

fn list_or<T>(items: &[T], empty: &str, line: impl Fn(&T) -> String) -> String {
    if items.is_empty() {
        empty.to_string()
    } else {
        items.iter().map(line).collect::<Vec<_>>().join("\n")
    }
}

fn intervention_line(i: &Intervention) -> String {
    let mut line = format!("- **{}:** {}", or_na(&i.kind), or_na(&i.name));
    if let Some(description) = &i.description {
        let _ = write!(line, " - {description}");
    }
    line
}

fn outcome_line(o: &PrimaryOutcome) -> String {
    format!("- {} (time frame: {})", or_na(&o.measure), or_na(&o.time_frame))
}

fn location_line(loc: &Location) -> String {
    let place = [&loc.city, &loc.state, &loc.postal_code, &loc.country]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .collect::<Vec<_>>()
        .join(", ");
    let place = if place.is_empty() { PLACEHOLDER } else { place.as_str() };
    format!("- {} ({})", or_na(&loc.facility), place)
}

fn contact_line(c: &Contact) -> String {
    format!(
        "- {} ({}): {}, {}",
        or_na(&c.name),
        or_na(&c.role),
        or_na(&c.email),
        or_na(&c.phone)
    )
}

/// Render the fixed-section document for `record`. Pure and deterministic.
pub fn render(record: &CanonicalRecord) -> String {
    let enrollment = record
        .enrollment
        .map(|n| format!("{n} participants"))
        .unwrap_or_else(|| PLACEHOLDER.to_string());
    let collaborators = if record.collaborators.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        record.collaborators.join(", ")
    };
    let healthy_volunteers = match record.healthy_volunteers {
        Some(true) => "Yes",
        Some(false) => "No",
        None => PLACEHOLDER,
    };

    format!(
        "# Trial: {nct_id}

## Basic Info
- **Title:** {title}
- **Official Title:** {official_title}
- **Phase:** {phase}
- **Status:** {status}
- **Study Type:** {study_type}
- **Sponsor:** {sponsor}
- **Collaborators:** {collaborators}
- **Enrollment:** {enrollment}

## Description
{description}

## Interventions
{interventions}

## Primary Outcomes
{outcomes}

## Eligibility Criteria

{criteria}

### Key Requirements
- **Minimum Age:** {minimum_age}
- **Maximum Age:** {maximum_age}
- **Sex:** {sex}
- **Healthy Volunteers:** {healthy_volunteers}

## Locations
{locations}

## Contacts
{contacts}

## Dates
- **Start Date:** {start_date}
- **Completion Date:** {completion_date}
- **Last Updated:** {last_updated}

## Source
- **ClinicalTrials.gov:** {source_url}
- **NCT ID:** {nct_id}
",
        nct_id = record.nct_id,
        title = or_na(&record.title),
        official_title = or_na(&record.official_title),
        phase = or_na(&record.phase),
        status = or_na(&record.status),
        study_type = or_na(&record.study_type),
        sponsor = or_na(&record.sponsor),
        description = record.brief_summary.as_deref().unwrap_or(NO_DESCRIPTION),
        interventions = list_or(&record.interventions, NO_INTERVENTIONS, intervention_line),
        outcomes = list_or(&record.primary_outcomes, NO_OUTCOMES, outcome_line),
        criteria = record.eligibility_criteria.as_deref().unwrap_or(NO_CRITERIA),
        minimum_age = or_na(&record.minimum_age),
        maximum_age = or_na(&record.maximum_age),
        sex = or_na(&record.sex),
        locations = list_or(&record.locations, NO_LOCATIONS, location_line),
        contacts = list_or(&record.central_contacts, NO_CONTACTS, contact_line),
        start_date = or_na(&record.start_date),
        completion_date = or_na(&record.completion_date),
        last_updated = or_na(&record.last_updated),
        source_url = record.source_url,
    )
}
