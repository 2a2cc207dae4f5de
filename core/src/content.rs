//! Deterministic CRM field content from curated lists.
//!
//! Same (simulation, record, phase/activity) always yields the same values,
//! so a replayed or retried job writes identical properties.

use serde_json::json;

use crate::{
    activity::{ActivityType, LifecyclePhase},
    clock::format_ms,
    crm::Properties,
    rng::{RecordRng, RngSlot},
    types::{RecordIndex, TimestampMs},
};

/// What the generator may look at.
#[derive(Debug, Clone, Copy)]
pub struct ContentContext<'a> {
    pub simulation_id: &'a str,
    pub record_index:  RecordIndex,
    pub scenario_id:   &'a str,
    pub occurred_at:   TimestampMs,
}

pub trait ContentGenerator: Send + Sync {
    fn contact(&self, ctx: &ContentContext<'_>) -> Properties;

    fn deal(&self, ctx: &ContentContext<'_>, phase: LifecyclePhase) -> Properties;

    fn engagement(&self, ctx: &ContentContext<'_>, activity: ActivityType, ordinal: u32) -> Properties;
}

pub struct TemplateContentGenerator;

fn pick<'a>(rng: &mut RecordRng, items: &'a [&'a str]) -> &'a str {
    items[rng.next_u64_below(items.len() as u64) as usize]
}

fn into_properties(value: serde_json::Value) -> Properties {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Properties::new(),
    }
}

impl TemplateContentGenerator {
    fn person(rng: &mut RecordRng) -> (&'static str, &'static str) {
        (pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES))
    }

    fn company(rng: &mut RecordRng) -> String {
        format!("{} {} {}", pick(rng, COMPANY_STEMS), pick(rng, INDUSTRIES), pick(rng, COMPANY_SUFFIXES))
    }
}

impl ContentGenerator for TemplateContentGenerator {
    fn contact(&self, ctx: &ContentContext<'_>) -> Properties {
        let mut rng = RecordRng::new(ctx.simulation_id, ctx.record_index, RngSlot::Content);
        let (first, last) = Self::person(&mut rng);
        let company = Self::company(&mut rng);
        let domain: String = company
            .split_whitespace()
            .next()
            .unwrap_or("example")
            .to_lowercase();
        into_properties(json!({
            "firstname": first,
            "lastname": last,
            "email": format!("{}.{}{}@{}.example", first.to_lowercase(), last.to_lowercase(), ctx.record_index, domain),
            "company": company,
            "jobtitle": pick(&mut rng, JOB_TITLES),
            "lifecyclestage": LifecyclePhase::ContactCreated.lifecycle_stage(),
            "createdate": format_ms(ctx.occurred_at),
            "sim_scenario": ctx.scenario_id,
        }))
    }

    fn deal(&self, ctx: &ContentContext<'_>, phase: LifecyclePhase) -> Properties {
        let mut rng = RecordRng::for_phase(ctx.simulation_id, ctx.record_index, RngSlot::Content, phase.salt());
        let amount = 1_000 + rng.next_u64_below(49) * 500;
        let stage = if phase == LifecyclePhase::DealWon { "closedwon" } else { "closedlost" };
        into_properties(json!({
            "dealname": format!("{} - {}", Self::company(&mut rng), pick(&mut rng, DEAL_KINDS)),
            "amount": amount,
            "dealstage": stage,
            "closedate": format_ms(ctx.occurred_at),
        }))
    }

    fn engagement(&self, ctx: &ContentContext<'_>, activity: ActivityType, ordinal: u32) -> Properties {
        let salt = ((activity as u64) << 32) | ordinal as u64;
        let mut rng = RecordRng::for_phase(ctx.simulation_id, ctx.record_index, RngSlot::Content, salt);
        let timestamp = format_ms(ctx.occurred_at);
        let value = match activity {
            ActivityType::Note => json!({
                "hs_note_body": pick(&mut rng, NOTE_BODIES),
                "hs_timestamp": timestamp,
            }),
            ActivityType::Call => json!({
                "hs_call_title": pick(&mut rng, CALL_TITLES),
                "hs_call_duration": (2 + rng.next_u64_below(28)) * 60_000,
                "hs_call_disposition": pick(&mut rng, CALL_OUTCOMES),
                "hs_timestamp": timestamp,
            }),
            ActivityType::Task => json!({
                "hs_task_subject": pick(&mut rng, TASK_SUBJECTS),
                "hs_task_status": "NOT_STARTED",
                "hs_timestamp": timestamp,
            }),
            ActivityType::Ticket => json!({
                "subject": pick(&mut rng, TICKET_SUBJECTS),
                "hs_ticket_priority": pick(&mut rng, &["LOW", "MEDIUM", "HIGH"]),
                "hs_pipeline_stage": "1",
            }),
        };
        into_properties(value)
    }
}

const FIRST_NAMES: &[&str] = &[
    "Avery", "Blake", "Camila", "Dev", "Elena", "Farah", "Gus", "Hana", "Ike", "Jun",
    "Kofi", "Lena", "Mateo", "Nia", "Omar", "Priya", "Quinn", "Rosa", "Sven", "Tariq",
    "Uma", "Vik", "Wren", "Ximena", "Yusuf", "Zoe",
];

const LAST_NAMES: &[&str] = &[
    "Abbott", "Bauer", "Chen", "Diaz", "Eriksen", "Fofana", "Garcia", "Haddad", "Ito",
    "Jensen", "Kowalski", "Lopez", "Mensah", "Nakamura", "Okafor", "Patel", "Reyes",
    "Schmidt", "Tanaka", "Usman", "Varga", "Walsh", "Yilmaz", "Zhou",
];

const COMPANY_STEMS: &[&str] = &[
    "Northwind", "Bluepeak", "Ironleaf", "Brightline", "Cedar", "Harbor", "Summit",
    "Keystone", "Lumen", "Orbit", "Redwood", "Silverton",
];

const INDUSTRIES: &[&str] = &[
    "Analytics", "Logistics", "Health", "Robotics", "Software", "Foods", "Energy", "Media",
];

const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "Labs", "Co"];

const JOB_TITLES: &[&str] = &[
    "Head of Operations", "VP Marketing", "IT Manager", "Procurement Lead",
    "Founder", "Sales Director", "Product Manager",
];

const DEAL_KINDS: &[&str] = &["Annual plan", "Pilot", "Expansion", "Renewal"];

const NOTE_BODIES: &[&str] = &[
    "Downloaded the pricing guide; interested in team tier.",
    "Asked about SSO and audit logging.",
    "Evaluating two other vendors, decision next quarter.",
    "Champion is supportive, budget owner not yet engaged.",
    "Requested a case study from a similar industry.",
];

const CALL_TITLES: &[&str] = &["Discovery call", "Intro call", "Follow-up call", "Demo recap"];

const CALL_OUTCOMES: &[&str] = &["connected", "left_voicemail", "no_answer", "busy"];

const TASK_SUBJECTS: &[&str] = &[
    "Send proposal", "Schedule demo", "Share security questionnaire", "Confirm budget",
];

const TICKET_SUBJECTS: &[&str] = &[
    "Onboarding kickoff", "Data import help", "Account setup", "Integration question",
];
