//! Interpretation stage: fill zygosity, inheritance, ethnicity, and outcome
//! columns from the clinical interpretation service.
//!
//! One lookup is issued per unique case identifier; inside the case payload
//! the matching variant is located by a `"{chromosome}_{position}"` key built
//! from the locus fields filled by the annotation stage.

use futures::StreamExt;
use indexmap::IndexMap;
use itertools::Itertools;

use crate::clients::{InterpretationClient, InterpretedVariant, Pedigree, VariantCall};
use crate::common::strip_chr_prefix;
use crate::dataset::record::{RecordId, RecordIndex, RecordStore, VariantRecord, Zygosity};

/// Producer name of the primary tiering service.
const PRIMARY_TIERING_SERVICE: &str = "genomics_england_tiering";
/// Pedigree relation annotation for the mother.
const RELATION_MOTHER: &str = "Mother";
/// Pedigree relation annotation for the father.
const RELATION_FATHER: &str = "Father";

/// Stage filling interpretation-derived columns.
#[derive(derive_new::new)]
pub struct InterpretationStage<'a> {
    /// Interpretation service client.
    client: &'a dyn InterpretationClient,
    /// Bound on concurrent lookups.
    concurrency: usize,
}

/// Answers taken from the latest report's exit questionnaire.
#[derive(Debug, Clone)]
struct ExitAnswers {
    case_solved_family: Option<String>,
    phenotypes_solved: Option<String>,
    actionability: Option<String>,
}

/// Everything extracted from one case's interpretation payload that is
/// needed to enrich its records.
#[derive(Debug)]
struct CaseEnrichment {
    /// Variants of the tiering interpreted genome keyed by position.
    lookup: IndexMap<String, Vec<InterpretedVariant>>,
    /// Participant id of the proband.
    proband_id: String,
    /// Participant id of the mother, if in the pedigree.
    mother_id: Option<String>,
    /// Participant id of the father, if in the pedigree.
    father_id: Option<String>,
    /// Ethnic origin of the mother, from the proband's ancestries.
    mother_ethnic_origin: Option<String>,
    /// Ethnic origin of the father, from the proband's ancestries.
    father_ethnic_origin: Option<String>,
    /// Exit questionnaire answers, if a questionnaire with a non-empty
    /// variant-group question list exists.
    exit_answers: Option<ExitAnswers>,
}

impl InterpretationStage<'_> {
    /// Enrich all records in `store`.
    ///
    /// A case without a proband or without a qualifying tiering interpreted
    /// genome is a fatal error; such errors are collected while the pool
    /// drains and surfaced as one stage error.
    pub async fn run(&self, store: &mut RecordStore) -> Result<(), anyhow::Error> {
        let index = RecordIndex::build(store, |record| Some(record.case_id.clone()));
        let keys = index.keys().cloned().collect::<Vec<_>>();
        tracing::info!("enriching {} unique cases ...", keys.len());

        let mut fetches = futures::stream::iter(keys.into_iter().map(|case_id| async move {
            let result = self.fetch_case(&case_id).await;
            (case_id, result)
        }))
        .buffer_unordered(self.concurrency);

        let mut failures = Vec::new();
        while let Some((case_id, result)) = fetches.next().await {
            match result {
                Ok(enrichment) => {
                    if let Some(ids) = index.get(&case_id) {
                        apply_case(store, ids, &enrichment);
                    }
                }
                Err(e) => failures.push(format!("{}: {}", &case_id, e)),
            }
        }

        if failures.is_empty() {
            tracing::info!("... interpretation stage done");
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "interpretation failed for {} case(s): {}",
                failures.len(),
                failures.iter().join("; ")
            ))
        }
    }

    /// Fetch and digest the interpretation payload of one case.
    async fn fetch_case(&self, case_id: &str) -> Result<CaseEnrichment, anyhow::Error> {
        let (case, version) = split_case_id(case_id)?;
        let request = self
            .client
            .get_case(case, version)
            .await
            .map_err(|e| anyhow::anyhow!("fetching interpretation failed: {}", e))?;

        let latest_report = request
            .clinical_reports
            .iter()
            .max_by_key(|report| report.created_at)
            .ok_or_else(|| anyhow::anyhow!("no clinical report"))?;
        let (proband_id, mother_id, father_id, ancestries) = family_ids(&request.pedigree)?;
        let genome = request
            .interpreted_genomes
            .iter()
            .filter(|genome| genome.interpretation_service == PRIMARY_TIERING_SERVICE)
            .max_by_key(|genome| genome.created_at)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no interpreted genome produced by {}",
                    PRIMARY_TIERING_SERVICE
                )
            })?;

        let exit_answers = latest_report.exit_questionnaire.as_ref().and_then(|q| {
            q.variant_group_level_questions.last().map(|group| ExitAnswers {
                case_solved_family: q.family_level_questions.case_solved_family.clone(),
                phenotypes_solved: group.phenotypes_solved.clone(),
                actionability: group.actionability.clone(),
            })
        });

        Ok(CaseEnrichment {
            lookup: position_lookup(&genome.variants),
            proband_id,
            mother_id,
            father_id,
            mother_ethnic_origin: ancestries
                .as_ref()
                .and_then(|a| a.mothers_ethnic_origin.clone()),
            father_ethnic_origin: ancestries
                .as_ref()
                .and_then(|a| a.fathers_ethnic_origin.clone()),
            exit_answers,
        })
    }
}

/// Write one case's enrichment through to all of its records.
fn apply_case(store: &mut RecordStore, ids: &[RecordId], enrichment: &CaseEnrichment) {
    for &record_id in ids {
        let record = store.get_mut(record_id).expect("index ids point into the store");
        let Some(key) = record_position_key(record) else {
            continue; // locus never filled, cannot be matched
        };
        // ties are not disambiguated further, the first entry wins
        let Some(variant) = enrichment.lookup.get(&key).and_then(|v| v.first()) else {
            continue;
        };

        record.zygosity_proband =
            zygosity_for(Some(enrichment.proband_id.as_str()), &variant.variant_calls);
        record.zygosity_mother =
            zygosity_for(enrichment.mother_id.as_deref(), &variant.variant_calls);
        record.zygosity_father =
            zygosity_for(enrichment.father_id.as_deref(), &variant.variant_calls);

        if let Some(event) = variant.report_events.first() {
            record.mode_of_inheritance = event.mode_of_inheritance.clone();
            record.segregation_pattern = event.segregation_pattern.clone();
            record.penetrance = event.penetrance.clone();
        }

        record.mother_ethnic_origin = enrichment.mother_ethnic_origin.clone();
        record.father_ethnic_origin = enrichment.father_ethnic_origin.clone();

        if let Some(answers) = &enrichment.exit_answers {
            record.case_solved_family = answers.case_solved_family.clone();
            record.phenotypes_solved = answers.phenotypes_solved.clone();
            record.actionability = answers.actionability.clone();
        }
    }
}

/// Split a `"{case}-{version}"` identifier into its lookup parameters.
fn split_case_id(case_id: &str) -> Result<(&str, u32), anyhow::Error> {
    let (case, version) = case_id
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("malformed case id {:?}", case_id))?;
    let version = version
        .parse::<u32>()
        .map_err(|e| anyhow::anyhow!("malformed case version in {:?}: {}", case_id, e))?;
    Ok((case, version))
}

/// Position key of a record, `"{chromosome-sans-chr}_{start}"`.
fn record_position_key(record: &VariantRecord) -> Option<String> {
    let chromosome = record.chromosome.as_deref()?;
    let start = record.start?;
    Some(format!("{}_{}", strip_chr_prefix(chromosome), start))
}

/// Group the interpreted genome's variants by position key.
fn position_lookup(
    variants: &[InterpretedVariant],
) -> IndexMap<String, Vec<InterpretedVariant>> {
    let mut lookup: IndexMap<String, Vec<InterpretedVariant>> = IndexMap::new();
    for variant in variants {
        let key = format!(
            "{}_{}",
            strip_chr_prefix(&variant.coordinates.chromosome),
            variant.coordinates.position
        );
        lookup.entry(key).or_default().push(variant.clone());
    }
    lookup
}

/// Participant ids of proband, mother, and father, plus the proband's
/// ancestry information.
///
/// A pedigree without a proband is an error.
#[allow(clippy::type_complexity)]
fn family_ids(
    pedigree: &Pedigree,
) -> Result<
    (
        String,
        Option<String>,
        Option<String>,
        Option<crate::clients::Ancestries>,
    ),
    anyhow::Error,
> {
    let mut proband = None;
    let mut mother_id = None;
    let mut father_id = None;
    for member in &pedigree.members {
        if member.is_proband {
            proband = Some(member);
        } else if member.relation_to_proband.as_deref() == Some(RELATION_MOTHER) {
            mother_id = Some(member.participant_id.clone());
        } else if member.relation_to_proband.as_deref() == Some(RELATION_FATHER) {
            father_id = Some(member.participant_id.clone());
        }
    }
    let proband = proband.ok_or_else(|| anyhow::anyhow!("pedigree has no proband"))?;
    Ok((
        proband.participant_id.clone(),
        mother_id,
        father_id,
        proband.ancestries.clone(),
    ))
}

/// Zygosity of the call belonging to the given participant, if any.
fn zygosity_for(participant_id: Option<&str>, calls: &[VariantCall]) -> Option<Zygosity> {
    let participant_id = participant_id?;
    calls
        .iter()
        .find(|call| call.participant_id == participant_id)
        .and_then(|call| call.zygosity.as_deref())
        .and_then(|zygosity| zygosity.parse().ok())
}
