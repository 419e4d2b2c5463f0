//! Record model for the variant dataset.
//!
//! Records live in a [`RecordStore`] arena and are addressed by [`RecordId`].
//! Secondary indices ([`RecordIndex`]) are derived views mapping a key to the
//! ids of the records sharing that key; all mutation goes through the arena so
//! that every index over the same store observes updates.

use indexmap::IndexMap;
use strum_macros::{Display, EnumString};

use crate::common::{strip_chr_prefix, GenomeRelease};

/// Outcome tag of a record, fixed at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize,
)]
pub enum ReportedOutcome {
    /// The variant was reported by the clinician.
    #[strum(serialize = "reported")]
    Reported,
    /// The variant was considered but not reported.
    #[strum(serialize = "not_reported")]
    NotReported,
}

/// Sex of the proband as used by the archive and the frequency studies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize,
)]
pub enum Sex {
    #[strum(serialize = "MALE")]
    Male,
    #[strum(serialize = "FEMALE")]
    Female,
}

/// Zygosity of a genotype call.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize)]
pub enum Zygosity {
    #[strum(serialize = "reference_homozygous")]
    ReferenceHomozygous,
    #[strum(serialize = "heterozygous")]
    Heterozygous,
    #[strum(serialize = "alternate_homozygous")]
    AlternateHomozygous,
    #[strum(serialize = "alternate_hemizygous")]
    AlternateHemizygous,
    #[strum(serialize = "missing")]
    Missing,
    /// Any value not covered by the named variants.
    #[strum(default)]
    Other(String),
}

/// One row of the final dataset, covering one (case, variant) pairing.
///
/// Fields not yet resolved by a stage are `None`; later stages fill them in
/// place through the arena.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VariantRecord {
    /// Archive variant identifier (the queryable id).
    pub id: String,
    /// Chromosome name, `chr`-prefixed once filled.
    pub chromosome: Option<String>,
    /// 1-based start position.
    pub start: Option<i64>,
    /// End position (start + reference length).
    pub end: Option<i64>,
    /// Reference allele.
    pub reference: Option<String>,
    /// Alternate allele.
    pub alternate: Option<String>,
    /// Assembly the case was analysed against.
    pub assembly: Option<GenomeRelease>,
    /// Case identifier in `"{case}-{version}"` format.
    pub case_id: String,
    /// dbSNP rs identifier, if any.
    pub rs_id: Option<String>,
    /// Proband age at analysis.
    pub age: Option<i32>,
    /// Proband sex.
    pub sex: Option<Sex>,
    /// Tier assigned by the tiering service.
    pub tier: Option<String>,
    /// Zygosity of the proband.
    pub zygosity_proband: Option<Zygosity>,
    /// Zygosity of the mother.
    pub zygosity_mother: Option<Zygosity>,
    /// Zygosity of the father.
    pub zygosity_father: Option<Zygosity>,
    /// Mode of inheritance from the report events.
    pub mode_of_inheritance: Option<String>,
    /// Segregation pattern from the report events.
    pub segregation_pattern: Option<String>,
    /// Penetrance from the report events.
    pub penetrance: Option<String>,
    /// Comma-joined sequence ontology term names.
    pub consequence_types: Option<String>,
    /// Comma-joined transcript biotypes.
    pub biotypes: Option<String>,
    /// Population allele frequency.
    pub population_frequency: Option<f64>,
    /// Variant type, e.g. "SNV".
    pub variant_type: Option<String>,
    /// Scaled CADD score.
    pub cadd_score: Option<f64>,
    /// ClinVar clinical significance.
    pub clinvar: Option<String>,
    /// PhastCons conservation score.
    pub phast_cons: Option<f64>,
    /// PhyloP conservation score.
    pub phylop: Option<f64>,
    /// GERP conservation score.
    pub gerp: Option<f64>,
    /// Program the case belongs to.
    pub program: Option<String>,
    /// Ethnic origin of the mother.
    pub mother_ethnic_origin: Option<String>,
    /// Ethnic origin of the father.
    pub father_ethnic_origin: Option<String>,
    /// ACMG classification assigned within the case.
    pub acmg_classification: Option<String>,
    /// Whether the case was solved for the family.
    pub case_solved_family: Option<String>,
    /// Which phenotypes were solved.
    pub phenotypes_solved: Option<String>,
    /// Actionability of the finding.
    pub actionability: Option<String>,
    /// Free-text interpretation message from the archive.
    pub interpretation_message: Option<String>,
    /// Whether the variant was reported, fixed at creation.
    pub reported_outcome: ReportedOutcome,
}

impl Default for ReportedOutcome {
    fn default() -> Self {
        ReportedOutcome::NotReported
    }
}

impl VariantRecord {
    /// Fixed, ordered column list of the exported dataset.
    pub const COLUMNS: [&'static str; 36] = [
        "id",
        "chromosome",
        "start",
        "end",
        "ref",
        "alt",
        "assembly",
        "case_id",
        "rs_id",
        "age",
        "sex",
        "tier",
        "zygosity_proband",
        "zygosity_mother",
        "zygosity_father",
        "mode_of_inheritance",
        "segregation_pattern",
        "penetrance",
        "consequence_types",
        "biotypes",
        "population_frequency",
        "variant_type",
        "cadd_score",
        "clinvar",
        "phast_cons",
        "phylop",
        "gerp",
        "program",
        "mother_ethnic_origin",
        "father_ethnic_origin",
        "acmg_classification",
        "case_solved_family",
        "phenotypes_solved",
        "actionability",
        "interpretation_message",
        "reported_outcome",
    ];

    /// Render the record as one CSV row in [`Self::COLUMNS`] order, with
    /// `None` rendered as the empty string.
    pub fn csv_row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            fmt_opt(&self.chromosome),
            fmt_opt(&self.start),
            fmt_opt(&self.end),
            fmt_opt(&self.reference),
            fmt_opt(&self.alternate),
            self.assembly.map(|a| a.name()).unwrap_or_default(),
            self.case_id.clone(),
            fmt_opt(&self.rs_id),
            fmt_opt(&self.age),
            fmt_opt(&self.sex),
            fmt_opt(&self.tier),
            fmt_opt(&self.zygosity_proband),
            fmt_opt(&self.zygosity_mother),
            fmt_opt(&self.zygosity_father),
            fmt_opt(&self.mode_of_inheritance),
            fmt_opt(&self.segregation_pattern),
            fmt_opt(&self.penetrance),
            fmt_opt(&self.consequence_types),
            fmt_opt(&self.biotypes),
            fmt_opt(&self.population_frequency),
            fmt_opt(&self.variant_type),
            fmt_opt(&self.cadd_score),
            fmt_opt(&self.clinvar),
            fmt_opt(&self.phast_cons),
            fmt_opt(&self.phylop),
            fmt_opt(&self.gerp),
            fmt_opt(&self.program),
            fmt_opt(&self.mother_ethnic_origin),
            fmt_opt(&self.father_ethnic_origin),
            fmt_opt(&self.acmg_classification),
            fmt_opt(&self.case_solved_family),
            fmt_opt(&self.phenotypes_solved),
            fmt_opt(&self.actionability),
            fmt_opt(&self.interpretation_message),
            self.reported_outcome.to_string(),
        ]
    }

    /// Cross-reference key used by the conservation lookup.
    ///
    /// The rs id takes precedence; without one a `chrom:pos:ref:alt` key is
    /// synthesized from the locus fields (chromosome without `chr` prefix).
    /// Records with a CNV placeholder allele (angle brackets) or incomplete
    /// locus information yield no key and are excluded from the lookup.
    pub fn conservation_key(&self) -> Option<String> {
        if let Some(rs_id) = self.rs_id.as_deref() {
            if !rs_id.is_empty() {
                return Some(rs_id.to_string());
            }
        }
        let chromosome = self.chromosome.as_deref()?;
        let start = self.start?;
        let reference = self.reference.as_deref()?;
        let alternate = self.alternate.as_deref()?;
        if reference.contains('<') || alternate.contains('<') {
            return None;
        }
        Some(format!(
            "{}:{}:{}:{}",
            strip_chr_prefix(chromosome),
            start,
            reference,
            alternate
        ))
    }
}

/// Format an optional displayable value, rendering `None` as empty string.
fn fmt_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Stable identifier of a record within its [`RecordStore`].
pub type RecordId = usize;

/// Arena holding all records of the dataset.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<VariantRecord>,
}

impl RecordStore {
    /// Append a record and return its id.
    pub fn push(&mut self, record: VariantRecord) -> RecordId {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Access a record by id.
    pub fn get(&self, id: RecordId) -> Option<&VariantRecord> {
        self.records.get(id)
    }

    /// Mutable access to a record by id.
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut VariantRecord> {
        self.records.get_mut(id)
    }

    /// Iterate over all records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &VariantRecord> {
        self.records.iter()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Derived view mapping a key to the ids of the records sharing it.
///
/// Rebuilding is explicit; a stage must re-derive the index after the keying
/// attribute changed.  Records whose selector yields `None` are excluded but
/// remain in the store.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    buckets: IndexMap<String, Vec<RecordId>>,
}

impl RecordIndex {
    /// Build the index over `store` using the given key selector.
    pub fn build<F>(store: &RecordStore, selector: F) -> Self
    where
        F: Fn(&VariantRecord) -> Option<String>,
    {
        let mut buckets: IndexMap<String, Vec<RecordId>> = IndexMap::new();
        for (id, record) in store.iter().enumerate() {
            if let Some(key) = selector(record) {
                buckets.entry(key).or_default().push(id);
            }
        }
        Self { buckets }
    }

    /// Iterate over the unique keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.buckets.keys()
    }

    /// Record ids sharing the given key.
    pub fn get(&self, key: &str) -> Option<&[RecordId]> {
        self.buckets.get(key).map(|ids| ids.as_slice())
    }

    /// Number of unique keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the index has no keys.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
