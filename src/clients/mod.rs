//! Client interfaces for the upstream clinical-genomics services.
//!
//! The enrichment pipeline only depends on the traits defined here; the
//! concrete HTTP implementations live in the `http` submodule and tests use
//! in-memory fakes.

pub mod http;
pub mod retry;

use async_trait::async_trait;
use indexmap::IndexMap;
use strum_macros::Display;

use crate::common::GenomeRelease;

/// Error type for the client boundary.
///
/// The retry wrapper classifies errors based on this enum, see
/// [`retry::call_with_renewal`].
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// Authorization failure, the access token may have expired.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// Transient connectivity problem.
    #[error("connection failed: {0}")]
    Connect(#[source] anyhow::Error),
    /// Unexpected HTTP status from the service.
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    /// Response body could not be decoded.
    #[error("could not decode response: {0}")]
    Decode(#[source] anyhow::Error),
}

/// Case status filter understood by the case archive.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Display, serde::Serialize)]
#[clap(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    /// Case was archived with a positive (solved) result.
    #[strum(serialize = "ARCHIVED_POSITIVE")]
    ArchivedPositive,
    /// Case was archived with a negative result.
    #[strum(serialize = "ARCHIVED_NEGATIVE")]
    ArchivedNegative,
}

/// One archived case as returned by the case archive service.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedCase {
    /// Case identifier.
    pub identifier: String,
    /// Case version.
    pub version: u32,
    /// Assembly the case was analysed against, e.g. "GRCh38".
    #[serde(default)]
    pub assembly: Option<String>,
    /// Program the case belongs to, e.g. "rare_disease".
    #[serde(default)]
    pub program: Option<String>,
    /// Sex of the proband, e.g. "MALE".
    #[serde(default)]
    pub proband_sex: Option<String>,
    /// Estimated proband age at analysis.
    #[serde(default)]
    pub proband_estimated_age_at_analysis: Option<i32>,
    /// Free-text interpretation message.
    #[serde(default)]
    pub interpretation: Option<String>,
    /// Identifiers of the variants reported by the clinician.
    #[serde(default)]
    pub reported_variants: Vec<String>,
    /// Identifiers of all variants considered for the case.
    #[serde(default)]
    pub all_variants: Vec<String>,
    /// Mapping from tier name to the variant identifiers in that tier.
    #[serde(default)]
    pub tiered_variants: IndexMap<String, Vec<String>>,
    /// Mapping from ACMG classification to the variant identifiers so classified.
    #[serde(default)]
    pub classified_variants: IndexMap<String, Vec<String>>,
}

/// Client for the case/variant archive service.
#[async_trait]
pub trait CaseArchiveClient: Send + Sync {
    /// Fetch all cases matching the given program, assembly, and statuses.
    async fn get_cases(
        &self,
        program: &str,
        assembly: GenomeRelease,
        statuses: &[CaseStatus],
    ) -> Result<Vec<ArchivedCase>, ClientError>;
}

/// Wrapper around the per-assembly variants known for one variant identifier.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantWrapper {
    /// The queried variant identifier.
    pub id: String,
    /// One entry per assembly the variant is known on.
    #[serde(default)]
    pub variants: Vec<AssemblyVariant>,
}

/// A variant as represented on one assembly.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyVariant {
    /// Assembly name, e.g. "GRCh38".
    #[serde(default)]
    pub assembly: Option<String>,
    /// Narrow variant type, e.g. "SNV".
    #[serde(default)]
    pub small_variant_type: Option<String>,
    /// Broader variant type; takes precedence when set.
    #[serde(default)]
    pub variant_type: Option<String>,
    /// Annotation body; may be absent for unannotated variants.
    #[serde(default)]
    pub annotation: Option<VariantAnnotation>,
}

/// Annotation body of a variant.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantAnnotation {
    /// Chromosome name without `chr` prefix.
    pub chromosome: String,
    /// 1-based start position.
    pub start: i64,
    /// Reference allele.
    pub reference: String,
    /// Alternate allele.
    pub alternate: String,
    /// Cross-reference identifier (dbSNP rs id), if any.
    #[serde(default)]
    pub id: Option<String>,
    /// Consequence type entries.
    #[serde(default)]
    pub consequence_types: Vec<ConsequenceType>,
    /// Population frequency entries.
    #[serde(default)]
    pub population_frequencies: Vec<PopulationFrequency>,
    /// Conservation score entries.
    #[serde(default)]
    pub conservation: Vec<SourcedScore>,
}

/// One consequence type entry of an annotation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ConsequenceType {
    /// Transcript biotype, e.g. "protein_coding".
    #[serde(default)]
    pub biotype: Option<String>,
    /// Sequence ontology terms of the consequence.
    #[serde(default)]
    pub sequence_ontology_terms: Vec<SequenceOntologyTerm>,
}

/// A sequence ontology term.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct SequenceOntologyTerm {
    /// Term name, e.g. "missense_variant".
    #[serde(default)]
    pub name: Option<String>,
}

/// One population frequency entry of an annotation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct PopulationFrequency {
    /// Study the frequency comes from, e.g. "GNOMAD_GENOMES".
    pub study: String,
    /// Population within the study, e.g. "ALL" or "MALE".
    pub population: String,
    /// Alternate allele frequency.
    #[serde(default)]
    pub alt_allele_freq: Option<f64>,
}

/// A score attributed to a named source, used for conservation and
/// functional scores alike.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct SourcedScore {
    /// Source name, e.g. "phastCons" or "cadd_scaled".
    pub source: String,
    /// The score value.
    pub score: f64,
}

/// Client for per-identifier variant lookups.
#[async_trait]
pub trait VariantClient: Send + Sync {
    /// Fetch the variant wrapper for one variant identifier.
    ///
    /// Returns `Ok(None)` if the service does not know the identifier.
    async fn get_variant_by_id(&self, id: &str) -> Result<Option<VariantWrapper>, ClientError>;
}

/// Full interpretation request payload for one case.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationRequest {
    /// Pedigree of the case family.
    pub pedigree: Pedigree,
    /// Interpreted genome payloads, possibly from several producers.
    #[serde(default)]
    pub interpreted_genomes: Vec<InterpretedGenome>,
    /// Clinical reports written for the case.
    #[serde(default)]
    pub clinical_reports: Vec<ClinicalReport>,
}

/// Pedigree of a case family.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct Pedigree {
    /// The family members.
    #[serde(default)]
    pub members: Vec<PedigreeMember>,
}

/// One member of a pedigree.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct PedigreeMember {
    /// Participant identifier used in variant calls.
    pub participant_id: String,
    /// Whether this member is the proband.
    #[serde(default)]
    pub is_proband: bool,
    /// Relation to the proband, e.g. "Mother" or "Father".
    #[serde(default)]
    pub relation_to_proband: Option<String>,
    /// Ancestry information; filled for the proband.
    #[serde(default)]
    pub ancestries: Option<Ancestries>,
}

/// Ancestry information of a pedigree member.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct Ancestries {
    /// Ethnic origin of the mother.
    #[serde(default)]
    pub mothers_ethnic_origin: Option<String>,
    /// Ethnic origin of the father.
    #[serde(default)]
    pub fathers_ethnic_origin: Option<String>,
}

/// One interpreted genome payload of a case.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedGenome {
    /// Name of the producing interpretation service.
    pub interpretation_service: String,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Variant-level findings.
    #[serde(default)]
    pub variants: Vec<InterpretedVariant>,
}

/// One variant inside an interpreted genome.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedVariant {
    /// Genomic coordinates of the variant.
    pub coordinates: VariantCoordinates,
    /// Per-participant genotype calls.
    #[serde(default)]
    pub variant_calls: Vec<VariantCall>,
    /// Report events attached to the variant.
    #[serde(default)]
    pub report_events: Vec<ReportEvent>,
}

/// Coordinates of an interpreted variant.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantCoordinates {
    /// Chromosome name without `chr` prefix.
    pub chromosome: String,
    /// 1-based position.
    pub position: i64,
}

/// One per-participant genotype call.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantCall {
    /// Participant identifier, matches the pedigree.
    pub participant_id: String,
    /// Zygosity of the call, e.g. "heterozygous".
    #[serde(default)]
    pub zygosity: Option<String>,
}

/// One report event of an interpreted variant.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    /// Mode of inheritance, e.g. "monoallelic".
    #[serde(default)]
    pub mode_of_inheritance: Option<String>,
    /// Segregation pattern.
    #[serde(default)]
    pub segregation_pattern: Option<String>,
    /// Penetrance, e.g. "complete".
    #[serde(default)]
    pub penetrance: Option<String>,
}

/// One clinical report of a case.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalReport {
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Exit questionnaire, if one was filed.
    #[serde(default)]
    pub exit_questionnaire: Option<ExitQuestionnaire>,
}

/// Exit questionnaire of a clinical report.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ExitQuestionnaire {
    /// Family-level questions.
    pub family_level_questions: FamilyLevelQuestions,
    /// Per-variant-group questions.
    #[serde(default)]
    pub variant_group_level_questions: Vec<VariantGroupLevelQuestions>,
}

/// Family-level questions of an exit questionnaire.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct FamilyLevelQuestions {
    /// Whether the case was solved for the family.
    #[serde(default)]
    pub case_solved_family: Option<String>,
}

/// Per-variant-group questions of an exit questionnaire.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantGroupLevelQuestions {
    /// Which phenotypes were solved by the variant group.
    #[serde(default)]
    pub phenotypes_solved: Option<String>,
    /// Actionability of the variant group.
    #[serde(default)]
    pub actionability: Option<String>,
}

/// Client for the clinical interpretation service.
#[async_trait]
pub trait InterpretationClient: Send + Sync {
    /// Fetch the full interpretation request payload for one case.
    async fn get_case(
        &self,
        case_id: &str,
        case_version: u32,
    ) -> Result<InterpretationRequest, ClientError>;
}

/// Per-key result of a batch annotation search.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnnotationResult {
    /// Functional scores, e.g. scaled CADD.
    #[serde(default)]
    pub functional_score: Vec<SourcedScore>,
    /// Conservation scores on build 37.
    #[serde(default)]
    pub conservation: Vec<SourcedScore>,
    /// Variant-trait association records.
    #[serde(default)]
    pub variant_trait_association: Option<VariantTraitAssociation>,
}

/// Variant-trait association records of a batch annotation result.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct VariantTraitAssociation {
    /// ClinVar records; aggregate records carry all-numeric accessions.
    #[serde(default)]
    pub clinvar: Vec<ClinvarRecord>,
}

/// One ClinVar record of a variant-trait association.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, derive_new::new)]
#[serde(rename_all = "camelCase")]
pub struct ClinvarRecord {
    /// ClinVar accession; all-numeric for aggregate records.
    pub accession: String,
    /// Clinical significance, e.g. "Pathogenic".
    #[serde(default)]
    pub clinical_significance: Option<String>,
}

/// Client for batched variant annotation searches.
#[async_trait]
pub trait BatchAnnotationClient: Send + Sync {
    /// Search annotation for the given keys.
    ///
    /// The returned list must be aligned 1:1 with `ids`; `None` entries mean
    /// the service has no annotation for the corresponding key.
    async fn search(
        &self,
        ids: &[String],
        include: &[&str],
    ) -> Result<Vec<Option<BatchAnnotationResult>>, ClientError>;
}
