//! Archive stage: build the initial record set from the case archive.
//!
//! For every archived case matching the status filter, one record is emitted
//! per reported variant and per non-reported variant, where the non-reported
//! set is the multiset difference of all variants and the reported variants.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::clients::{ArchivedCase, CaseArchiveClient, CaseStatus};
use crate::common::GenomeRelease;
use crate::dataset::record::{RecordStore, ReportedOutcome, Sex, VariantRecord};

/// Stage producing the initial record set.
#[derive(derive_new::new)]
pub struct ArchiveStage<'a> {
    /// Case archive client.
    client: &'a dyn CaseArchiveClient,
    /// Program to filter cases by.
    program: String,
    /// Target assembly.
    assembly: GenomeRelease,
    /// Case statuses to include.
    statuses: Vec<CaseStatus>,
}

impl ArchiveStage<'_> {
    /// Query the archive and emit one record per (case, variant) pairing.
    ///
    /// An unreachable archive or a malformed case payload aborts the stage.
    pub async fn run(&self) -> Result<RecordStore, anyhow::Error> {
        tracing::info!(
            "querying case archive (program = {}, assembly = {}) ...",
            &self.program,
            self.assembly.name()
        );
        let cases = self
            .client
            .get_cases(&self.program, self.assembly, &self.statuses)
            .await
            .map_err(|e| anyhow::anyhow!("querying case archive failed: {}", e))?;
        tracing::info!("... received {} archived cases", cases.len());

        let mut store = RecordStore::default();
        for case in &cases {
            self.add_case_records(&mut store, case)?;
        }
        tracing::info!("archive stage produced {} records", store.len());
        Ok(store)
    }

    /// Emit the reported and non-reported records of one case.
    fn add_case_records(
        &self,
        store: &mut RecordStore,
        case: &ArchivedCase,
    ) -> Result<(), anyhow::Error> {
        let case_id = format!("{}-{}", &case.identifier, case.version);
        let assembly = case
            .assembly
            .as_deref()
            .map(str::parse::<GenomeRelease>)
            .transpose()
            .map_err(|e| anyhow::anyhow!("malformed payload for case {}: {}", &case_id, e))?;
        // Values shared by every record of the case.
        let base = VariantRecord {
            case_id,
            assembly,
            sex: case
                .proband_sex
                .as_deref()
                .and_then(|s| s.parse::<Sex>().ok()),
            age: case.proband_estimated_age_at_analysis,
            program: case.program.clone(),
            ..Default::default()
        };

        for variant in &case.reported_variants {
            store.push(VariantRecord {
                id: variant.clone(),
                tier: bucket_info(variant, &case.tiered_variants),
                acmg_classification: bucket_info(variant, &case.classified_variants),
                reported_outcome: ReportedOutcome::Reported,
                ..base.clone()
            });
        }
        for variant in multiset_difference(&case.all_variants, &case.reported_variants) {
            store.push(VariantRecord {
                id: variant.clone(),
                tier: bucket_info(&variant, &case.tiered_variants),
                interpretation_message: case.interpretation.clone(),
                reported_outcome: ReportedOutcome::NotReported,
                ..base.clone()
            });
        }
        Ok(())
    }
}

/// Multiset difference `all - reported`, preserving the order of `all`.
///
/// An element survives as often as its multiplicity in `all` exceeds its
/// multiplicity in `reported`.
fn multiset_difference(all: &[String], reported: &[String]) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for variant in reported {
        *remaining.entry(variant.as_str()).or_default() += 1;
    }
    let mut result = Vec::new();
    for variant in all {
        match remaining.get_mut(variant.as_str()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => result.push(variant.clone()),
        }
    }
    result
}

/// Return the key of the last bucket containing `variant`, in the bucket
/// map's insertion order.
fn bucket_info(variant: &str, buckets: &IndexMap<String, Vec<String>>) -> Option<String> {
    let mut info = None;
    for (key, members) in buckets {
        if members.iter().any(|member| member == variant) {
            info = Some(key.clone());
        }
    }
    info
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use crate::clients::{ArchivedCase, CaseArchiveClient, CaseStatus, ClientError};
    use crate::common::GenomeRelease;
    use crate::dataset::record::ReportedOutcome;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn multiset_difference_respects_multiplicity() {
        let all = strings(&["a", "a", "a", "b", "c"]);
        let reported = strings(&["a", "a", "b"]);
        // one `a` survives (3 - 2 = 1), `c` was never reported
        assert_eq!(multiset_difference(&all, &reported), strings(&["a", "c"]));
    }

    #[test]
    fn multiset_difference_of_equal_lists_is_empty() {
        let all = strings(&["a", "b"]);
        assert_eq!(multiset_difference(&all, &all), Vec::<String>::new());
    }

    #[test]
    fn bucket_info_last_match_wins() {
        let mut buckets: IndexMap<String, Vec<String>> = IndexMap::new();
        buckets.insert(String::from("TIER1"), strings(&["v1", "v2"]));
        buckets.insert(String::from("TIER2"), strings(&["v1"]));

        assert_eq!(bucket_info("v1", &buckets).as_deref(), Some("TIER2"));
        assert_eq!(bucket_info("v2", &buckets).as_deref(), Some("TIER1"));
        assert_eq!(bucket_info("v3", &buckets), None);
    }

    struct FakeArchive {
        cases: Vec<ArchivedCase>,
    }

    #[async_trait]
    impl CaseArchiveClient for FakeArchive {
        async fn get_cases(
            &self,
            _program: &str,
            _assembly: GenomeRelease,
            _statuses: &[CaseStatus],
        ) -> Result<Vec<ArchivedCase>, ClientError> {
            Ok(self.cases.clone())
        }
    }

    fn example_case() -> ArchivedCase {
        let mut tiered: IndexMap<String, Vec<String>> = IndexMap::new();
        tiered.insert(String::from("TIER1"), strings(&["v1"]));
        tiered.insert(String::from("TIER3"), strings(&["v3"]));
        let mut classified: IndexMap<String, Vec<String>> = IndexMap::new();
        classified.insert(String::from("pathogenic_variant"), strings(&["v1"]));
        ArchivedCase {
            identifier: String::from("C100"),
            version: 2,
            assembly: Some(String::from("GRCh38")),
            program: Some(String::from("rare_disease")),
            proband_sex: Some(String::from("MALE")),
            proband_estimated_age_at_analysis: Some(42),
            interpretation: Some(String::from("no pathogenic variant identified")),
            reported_variants: strings(&["v1", "v2"]),
            all_variants: strings(&["v1", "v2", "v3"]),
            tiered_variants: tiered,
            classified_variants: classified,
        }
    }

    #[tokio::test]
    async fn stage_emits_reported_and_non_reported_records() -> Result<(), anyhow::Error> {
        let archive = FakeArchive {
            cases: vec![example_case()],
        };
        let stage = ArchiveStage::new(
            &archive,
            String::from("rare_disease"),
            GenomeRelease::Grch38,
            vec![CaseStatus::ArchivedPositive, CaseStatus::ArchivedNegative],
        );
        let store = stage.run().await?;

        assert_eq!(store.len(), 3);
        let records = store.iter().collect::<Vec<_>>();

        assert_eq!(records[0].id, "v1");
        assert_eq!(records[0].reported_outcome, ReportedOutcome::Reported);
        assert_eq!(records[0].case_id, "C100-2");
        assert_eq!(records[0].tier.as_deref(), Some("TIER1"));
        assert_eq!(
            records[0].acmg_classification.as_deref(),
            Some("pathogenic_variant")
        );
        assert_eq!(records[0].interpretation_message, None);

        assert_eq!(records[1].id, "v2");
        assert_eq!(records[1].reported_outcome, ReportedOutcome::Reported);
        assert_eq!(records[1].tier, None);

        assert_eq!(records[2].id, "v3");
        assert_eq!(records[2].reported_outcome, ReportedOutcome::NotReported);
        assert_eq!(records[2].tier.as_deref(), Some("TIER3"));
        assert_eq!(
            records[2].interpretation_message.as_deref(),
            Some("no pathogenic variant identified")
        );
        Ok(())
    }

    #[tokio::test]
    async fn stage_fails_on_malformed_assembly() {
        let mut case = example_case();
        case.assembly = Some(String::from("T2T-CHM13"));
        let archive = FakeArchive { cases: vec![case] };
        let stage = ArchiveStage::new(
            &archive,
            String::from("rare_disease"),
            GenomeRelease::Grch38,
            vec![CaseStatus::ArchivedPositive],
        );

        let result = stage.run().await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("malformed payload for case C100-2"));
    }
}
