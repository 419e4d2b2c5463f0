//! Annotation stage: fill locus, consequence, frequency, and conservation
//! columns from per-identifier variant lookups.
//!
//! One lookup is issued per unique variant identifier, never per record;
//! every record sharing the identifier receives the same filled values.

use futures::StreamExt;

use crate::clients::{ConsequenceType, PopulationFrequency, SourcedScore, VariantClient, VariantWrapper};
use crate::common::{add_chr_prefix, GenomeRelease};
use crate::dataset::record::{RecordIndex, RecordStore, Sex};

/// Frequency study used for the population frequency column.
const GNOMAD_GENOMES: &str = "GNOMAD_GENOMES";
/// Combined-sex population within a study.
const POPULATION_ALL: &str = "ALL";
/// Conservation source name for PhastCons.
const PHAST_CONS: &str = "phastCons";
/// Conservation source name for PhyloP.
const PHYLOP: &str = "phylop";

/// Stage filling annotation-derived columns.
#[derive(derive_new::new)]
pub struct AnnotationStage<'a> {
    /// Variant lookup client.
    client: &'a dyn VariantClient,
    /// Target assembly; other assemblies' entries are skipped.
    assembly: GenomeRelease,
    /// Bound on concurrent lookups.
    concurrency: usize,
}

impl AnnotationStage<'_> {
    /// Annotate all records in `store`.
    ///
    /// Individual lookup failures leave the matching records unfilled and do
    /// not abort the stage.
    pub async fn run(&self, store: &mut RecordStore) -> Result<(), anyhow::Error> {
        let index = RecordIndex::build(store, |record| Some(record.id.clone()));
        let keys = index.keys().cloned().collect::<Vec<_>>();
        tracing::info!(
            "annotating {} unique variant identifiers ({} records) ...",
            keys.len(),
            store.len()
        );

        let mut fetches = futures::stream::iter(keys.into_iter().map(|id| async move {
            let result = self.client.get_variant_by_id(&id).await;
            (id, result)
        }))
        .buffer_unordered(self.concurrency);

        let mut filled = 0usize;
        let mut missed = 0usize;
        while let Some((id, result)) = fetches.next().await {
            match result {
                Ok(Some(wrapper)) => {
                    filled += self.apply(store, &index, &wrapper);
                }
                Ok(None) => {
                    tracing::debug!("variant {} not known to annotation service", &id);
                    missed += 1;
                }
                Err(e) => {
                    tracing::warn!("lookup for variant {} failed, leaving unfilled: {}", &id, e);
                    missed += 1;
                }
            }
        }
        tracing::info!(
            "... annotation stage filled {} records, {} identifiers unresolved",
            filled,
            missed
        );
        Ok(())
    }

    /// Write the annotation of one wrapper through to every matching record.
    fn apply(&self, store: &mut RecordStore, index: &RecordIndex, wrapper: &VariantWrapper) -> usize {
        let Some(ids) = index.get(&wrapper.id) else {
            return 0;
        };
        let assembly_name = self.assembly.name();
        let mut count = 0;
        for variant in &wrapper.variants {
            if variant.assembly.as_deref() != Some(assembly_name.as_str()) {
                continue;
            }
            let Some(annotation) = variant.annotation.as_ref() else {
                continue;
            };
            // The broader type field takes precedence when set.
            let variant_type = variant
                .variant_type
                .clone()
                .or_else(|| variant.small_variant_type.clone());
            let consequence_types = join_sequence_ontology_terms(&annotation.consequence_types);
            let biotypes = join_biotypes(&annotation.consequence_types);
            let phast_cons = sourced_score(PHAST_CONS, &annotation.conservation);
            let phylop = sourced_score(PHYLOP, &annotation.conservation);

            for &record_id in ids {
                let record = store.get_mut(record_id).expect("index ids point into the store");
                record.chromosome = Some(add_chr_prefix(&annotation.chromosome));
                record.start = Some(annotation.start);
                record.end = Some(annotation.start + annotation.reference.len() as i64);
                record.reference = Some(annotation.reference.clone());
                record.alternate = Some(annotation.alternate.clone());
                record.rs_id = annotation.id.clone();
                record.consequence_types = consequence_types.clone();
                record.biotypes = biotypes.clone();
                record.population_frequency =
                    population_frequency(record.sex, &annotation.population_frequencies);
                record.variant_type = variant_type.clone();
                record.phast_cons = phast_cons;
                record.phylop = phylop;
                count += 1;
            }
        }
        count
    }
}

/// Flatten all sequence ontology term names across the consequence entries,
/// comma-joined; `None` if there are no names.
fn join_sequence_ontology_terms(consequence_types: &[ConsequenceType]) -> Option<String> {
    let names = consequence_types
        .iter()
        .flat_map(|ct| ct.sequence_ontology_terms.iter())
        .filter_map(|term| term.name.as_deref())
        .collect::<Vec<_>>();
    if names.is_empty() {
        None
    } else {
        Some(names.join(","))
    }
}

/// Comma-joined biotypes across the consequence entries; `None` if empty.
fn join_biotypes(consequence_types: &[ConsequenceType]) -> Option<String> {
    let biotypes = consequence_types
        .iter()
        .filter_map(|ct| ct.biotype.as_deref())
        .collect::<Vec<_>>();
    if biotypes.is_empty() {
        None
    } else {
        Some(biotypes.join(","))
    }
}

/// Resolve the population frequency for the given sex.
///
/// Within the reference study, a sex-specific entry wins over the
/// combined-sex (`ALL`) entry; without either the result is `None`.
fn population_frequency(
    sex: Option<Sex>,
    population_frequencies: &[PopulationFrequency],
) -> Option<f64> {
    let sex_population = sex.map(|s| s.to_string());
    let mut all_frequency = None;
    let mut sex_frequency = None;
    for frequency in population_frequencies {
        if frequency.study != GNOMAD_GENOMES {
            continue;
        }
        if Some(frequency.population.as_str()) == sex_population.as_deref() {
            sex_frequency = frequency.alt_allele_freq;
        }
        if frequency.population == POPULATION_ALL {
            all_frequency = frequency.alt_allele_freq;
        }
    }
    sex_frequency.or(all_frequency)
}

/// Return the score of the entry with the given source name.
fn sourced_score(source: &str, scores: &[SourcedScore]) -> Option<f64> {
    scores
        .iter()
        .find(|score| score.source == source)
        .map(|score| score.score)
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::clients::{
        AssemblyVariant, ClientError, SequenceOntologyTerm, VariantAnnotation,
    };
    use crate::dataset::record::VariantRecord;

    use super::*;

    fn frequency(study: &str, population: &str, freq: f64) -> PopulationFrequency {
        PopulationFrequency::new(study.to_string(), population.to_string(), Some(freq))
    }

    #[test]
    fn population_frequency_falls_back_to_combined_sex() {
        let frequencies = vec![frequency(GNOMAD_GENOMES, "ALL", 0.1)];
        assert_eq!(
            population_frequency(Some(Sex::Male), &frequencies),
            Some(0.1)
        );
    }

    #[test]
    fn population_frequency_prefers_sex_specific_entry() {
        let frequencies = vec![
            frequency(GNOMAD_GENOMES, "ALL", 0.1),
            frequency(GNOMAD_GENOMES, "MALE", 0.05),
        ];
        assert_eq!(
            population_frequency(Some(Sex::Male), &frequencies),
            Some(0.05)
        );
    }

    #[rstest]
    #[case::other_study(vec![frequency("UK10K", "ALL", 0.2)], None)]
    #[case::no_entries(vec![], None)]
    fn population_frequency_ignores_other_studies(
        #[case] frequencies: Vec<PopulationFrequency>,
        #[case] expected: Option<f64>,
    ) {
        assert_eq!(population_frequency(Some(Sex::Female), &frequencies), expected);
    }

    #[test]
    fn sequence_ontology_terms_flattened_across_consequences() {
        let consequence_types = vec![
            ConsequenceType::new(
                Some(String::from("protein_coding")),
                vec![
                    SequenceOntologyTerm::new(Some(String::from("missense_variant"))),
                    SequenceOntologyTerm::new(None),
                ],
            ),
            ConsequenceType::new(
                None,
                vec![SequenceOntologyTerm::new(Some(String::from(
                    "intron_variant",
                )))],
            ),
        ];
        assert_eq!(
            join_sequence_ontology_terms(&consequence_types).as_deref(),
            Some("missense_variant,intron_variant")
        );
        assert_eq!(
            join_biotypes(&consequence_types).as_deref(),
            Some("protein_coding")
        );
        assert_eq!(join_sequence_ontology_terms(&[]), None);
    }

    struct FakeVariants {
        wrappers: Vec<VariantWrapper>,
    }

    #[async_trait]
    impl VariantClient for FakeVariants {
        async fn get_variant_by_id(
            &self,
            id: &str,
        ) -> Result<Option<VariantWrapper>, ClientError> {
            if id == "v-broken" {
                return Err(ClientError::Status {
                    status: 500,
                    message: String::from("boom"),
                });
            }
            Ok(self.wrappers.iter().find(|w| w.id == id).cloned())
        }
    }

    fn example_wrapper() -> VariantWrapper {
        VariantWrapper::new(
            String::from("v1"),
            vec![
                // entry on the wrong assembly must be skipped
                AssemblyVariant::new(Some(String::from("GRCh37")), None, None, None),
                AssemblyVariant::new(
                    Some(String::from("GRCh38")),
                    Some(String::from("SNV")),
                    None,
                    Some(VariantAnnotation::new(
                        String::from("7"),
                        100,
                        String::from("AT"),
                        String::from("A"),
                        Some(String::from("rs42")),
                        vec![ConsequenceType::new(
                            Some(String::from("protein_coding")),
                            vec![SequenceOntologyTerm::new(Some(String::from(
                                "missense_variant",
                            )))],
                        )],
                        vec![frequency(GNOMAD_GENOMES, "ALL", 0.1)],
                        vec![
                            SourcedScore::new(String::from("phastCons"), 0.9),
                            SourcedScore::new(String::from("phylop"), 1.5),
                        ],
                    )),
                ),
            ],
        )
    }

    fn store_with_ids(ids: &[&str]) -> RecordStore {
        let mut store = RecordStore::default();
        for id in ids {
            store.push(VariantRecord {
                id: id.to_string(),
                case_id: String::from("case-1"),
                ..Default::default()
            });
        }
        store
    }

    #[tokio::test]
    async fn fills_all_records_sharing_an_identifier() -> Result<(), anyhow::Error> {
        let client = FakeVariants {
            wrappers: vec![example_wrapper()],
        };
        // two records share v1 (different cases), one record has a failing id
        let mut store = store_with_ids(&["v1", "v-broken", "v1"]);
        let stage = AnnotationStage::new(&client, GenomeRelease::Grch38, 2);
        stage.run(&mut store).await?;

        for record_id in [0usize, 2] {
            let record = store.get(record_id).unwrap();
            assert_eq!(record.chromosome.as_deref(), Some("chr7"));
            assert_eq!(record.start, Some(100));
            assert_eq!(record.end, Some(102));
            assert_eq!(record.reference.as_deref(), Some("AT"));
            assert_eq!(record.alternate.as_deref(), Some("A"));
            assert_eq!(record.rs_id.as_deref(), Some("rs42"));
            assert_eq!(record.consequence_types.as_deref(), Some("missense_variant"));
            assert_eq!(record.biotypes.as_deref(), Some("protein_coding"));
            assert_eq!(record.population_frequency, Some(0.1));
            assert_eq!(record.variant_type.as_deref(), Some("SNV"));
            assert_eq!(record.phast_cons, Some(0.9));
            assert_eq!(record.phylop, Some(1.5));
        }
        // the failed lookup leaves the record unfilled
        let unfilled = store.get(1).unwrap();
        assert_eq!(unfilled.chromosome, None);
        assert_eq!(unfilled.start, None);
        Ok(())
    }

    #[tokio::test]
    async fn broader_variant_type_takes_precedence() -> Result<(), anyhow::Error> {
        let mut wrapper = example_wrapper();
        wrapper.variants[1].variant_type = Some(String::from("INDEL"));
        let client = FakeVariants {
            wrappers: vec![wrapper],
        };
        let mut store = store_with_ids(&["v1"]);
        let stage = AnnotationStage::new(&client, GenomeRelease::Grch38, 1);
        stage.run(&mut store).await?;

        assert_eq!(store.get(0).unwrap().variant_type.as_deref(), Some("INDEL"));
        Ok(())
    }
}
