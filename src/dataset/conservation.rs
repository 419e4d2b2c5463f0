//! Conservation stage: fill CADD, GERP, and ClinVar columns from batched
//! annotation searches.
//!
//! Records are re-indexed by their cross-reference key (rs id, or a
//! synthesized coordinate key; CNV placeholder alleles are excluded), the
//! unique keys are chunked into batches, and each batch response must align
//! 1:1 with the requested keys.

use futures::StreamExt;
use itertools::Itertools;

use crate::clients::{BatchAnnotationClient, BatchAnnotationResult, SourcedScore, VariantTraitAssociation};
use crate::dataset::record::{RecordIndex, RecordStore};

/// Functional score source name for scaled CADD.
const CADD_SCALED: &str = "cadd_scaled";
/// Conservation source name for GERP.
const GERP: &str = "gerp";
/// Conservation source name for PhastCons.
const PHAST_CONS: &str = "phastCons";
/// Conservation source name for PhyloP.
const PHYLOP: &str = "phylop";

/// Fields requested from the batch annotation service.
const INCLUDE_FIELDS: &[&str] = &["variantTraitAssociation", "conservation", "functionalScore"];

/// Stage filling the remaining scored columns.
#[derive(derive_new::new)]
pub struct ConservationStage<'a> {
    /// Batch annotation client.
    client: &'a dyn BatchAnnotationClient,
    /// Number of keys per batch request.
    batch_size: usize,
    /// Bound on concurrent batch requests.
    concurrency: usize,
}

impl ConservationStage<'_> {
    /// Fill conservation-derived columns for all records in `store`.
    ///
    /// Batch failures are collected while the pool drains and surfaced as one
    /// stage error; successfully fetched batches keep their filled values.
    pub async fn run(&self, store: &mut RecordStore) -> Result<(), anyhow::Error> {
        let index = RecordIndex::build(store, |record| record.conservation_key());
        let keys = index.keys().cloned().collect::<Vec<_>>();
        let batches = keys
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect::<Vec<_>>();
        tracing::info!(
            "fetching conservation scores for {} keys in {} batches ...",
            keys.len(),
            batches.len()
        );

        let mut fetches = futures::stream::iter(batches.into_iter().map(|batch| async move {
            let result = self.fetch_batch(&batch).await;
            (batch, result)
        }))
        .buffer_unordered(self.concurrency);

        let mut failures = Vec::new();
        while let Some((batch, result)) = fetches.next().await {
            match result {
                Ok(results) => apply_batch(store, &index, &batch, &results),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            tracing::info!("... conservation stage done");
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "conservation stage failed for {} batch(es): {}",
                failures.len(),
                failures.iter().join("; ")
            ))
        }
    }

    /// Fetch one batch, enforcing 1:1 response alignment.
    async fn fetch_batch(
        &self,
        batch: &[String],
    ) -> Result<Vec<Option<BatchAnnotationResult>>, anyhow::Error> {
        let results = self
            .client
            .search(batch, INCLUDE_FIELDS)
            .await
            .map_err(|e| anyhow::anyhow!("batch annotation search failed: {}", e))?;
        if results.len() != batch.len() {
            // positional matching would be unsafe, do not attempt it
            return Err(anyhow::anyhow!(
                "requested {} keys but received {} results",
                batch.len(),
                results.len()
            ));
        }
        Ok(results)
    }
}

/// Write one batch's results through to all records sharing each key.
fn apply_batch(
    store: &mut RecordStore,
    index: &RecordIndex,
    batch: &[String],
    results: &[Option<BatchAnnotationResult>],
) {
    for (key, result) in batch.iter().zip(results.iter()) {
        let Some(result) = result else {
            continue; // no annotation for this key, records keep prior values
        };
        let Some(ids) = index.get(key) else {
            continue;
        };
        let cadd_score = sourced_score(CADD_SCALED, &result.functional_score);
        let gerp = sourced_score(GERP, &result.conservation);
        let phast_cons = sourced_score(PHAST_CONS, &result.conservation);
        let phylop = sourced_score(PHYLOP, &result.conservation);
        let clinvar = clinvar_classification(result.variant_trait_association.as_ref());

        for &record_id in ids {
            let record = store.get_mut(record_id).expect("index ids point into the store");
            record.cadd_score = cadd_score;
            record.gerp = gerp;
            record.clinvar = clinvar.clone();
            // PhastCons/PhyloP may already be filled by the annotation stage;
            // only gaps are filled here.
            if record.phast_cons.is_none() {
                record.phast_cons = phast_cons;
            }
            if record.phylop.is_none() {
                record.phylop = phylop;
            }
        }
    }
}

/// Return the score of the entry with the given source name.
fn sourced_score(source: &str, scores: &[SourcedScore]) -> Option<f64> {
    scores
        .iter()
        .find(|score| score.source == source)
        .map(|score| score.score)
}

/// ClinVar classification from the first aggregate record.
///
/// Aggregate records carry all-numeric accessions, as opposed to individual
/// submission records.
fn clinvar_classification(association: Option<&VariantTraitAssociation>) -> Option<String> {
    association?
        .clinvar
        .iter()
        .find(|record| {
            !record.accession.is_empty()
                && record.accession.chars().all(|c| c.is_ascii_digit())
        })
        .and_then(|record| record.clinical_significance.clone())
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::clients::{ClientError, ClinvarRecord};
    use crate::dataset::record::VariantRecord;

    use super::*;

    #[test]
    fn clinvar_classification_uses_numeric_accession_records() {
        let association = VariantTraitAssociation::new(vec![
            ClinvarRecord::new(
                String::from("RCV000123"),
                Some(String::from("Benign")),
            ),
            ClinvarRecord::new(String::from("12345"), Some(String::from("Pathogenic"))),
        ]);
        assert_eq!(
            clinvar_classification(Some(&association)).as_deref(),
            Some("Pathogenic")
        );
        assert_eq!(clinvar_classification(None), None);
    }

    /// Fake client recording the batch sizes it was called with.
    struct FakeBatchClient {
        batch_sizes: Mutex<Vec<usize>>,
        result_for_key: fn(&str) -> Option<BatchAnnotationResult>,
        truncate_response: bool,
    }

    impl FakeBatchClient {
        fn with_results(result_for_key: fn(&str) -> Option<BatchAnnotationResult>) -> Self {
            Self {
                batch_sizes: Mutex::new(Vec::new()),
                result_for_key,
                truncate_response: false,
            }
        }
    }

    #[async_trait]
    impl BatchAnnotationClient for FakeBatchClient {
        async fn search(
            &self,
            ids: &[String],
            _include: &[&str],
        ) -> Result<Vec<Option<BatchAnnotationResult>>, ClientError> {
            self.batch_sizes.lock().unwrap().push(ids.len());
            let mut results = ids
                .iter()
                .map(|id| (self.result_for_key)(id))
                .collect::<Vec<_>>();
            if self.truncate_response {
                results.pop();
            }
            Ok(results)
        }
    }

    fn scored_result(_key: &str) -> Option<BatchAnnotationResult> {
        Some(BatchAnnotationResult::new(
            vec![SourcedScore::new(String::from("cadd_scaled"), 23.5)],
            vec![
                SourcedScore::new(String::from("gerp"), 4.1),
                SourcedScore::new(String::from("phastCons"), 0.8),
                SourcedScore::new(String::from("phylop"), 1.1),
            ],
            Some(VariantTraitAssociation::new(vec![ClinvarRecord::new(
                String::from("12345"),
                Some(String::from("Pathogenic")),
            )])),
        ))
    }

    fn record_with_key(id: &str, rs_id: Option<&str>) -> VariantRecord {
        VariantRecord {
            id: id.to_string(),
            case_id: String::from("case-1"),
            chromosome: Some(String::from("chr1")),
            start: Some(100),
            reference: Some(String::from("A")),
            alternate: Some(String::from("T")),
            rs_id: rs_id.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chunks_unique_keys_into_fixed_size_batches() -> Result<(), anyhow::Error> {
        let client = FakeBatchClient::with_results(|_| None);
        let mut store = RecordStore::default();
        for i in 0..450 {
            store.push(record_with_key(&format!("v{}", i), Some(&format!("rs{}", i))));
        }
        let stage = ConservationStage::new(&client, 200, 1);
        stage.run(&mut store).await?;

        assert_eq!(*client.batch_sizes.lock().unwrap(), vec![200, 200, 50]);
        Ok(())
    }

    #[tokio::test]
    async fn fills_scores_through_to_all_records_sharing_a_key() -> Result<(), anyhow::Error> {
        let client = FakeBatchClient::with_results(scored_result);
        let mut store = RecordStore::default();
        store.push(record_with_key("v1", Some("rs42")));
        store.push(record_with_key("v1", Some("rs42")));
        // pre-filled PhyloP must not be overwritten
        store.get_mut(1).unwrap().phylop = Some(9.9);

        let stage = ConservationStage::new(&client, 10, 1);
        stage.run(&mut store).await?;

        let first = store.get(0).unwrap();
        assert_eq!(first.cadd_score, Some(23.5));
        assert_eq!(first.gerp, Some(4.1));
        assert_eq!(first.phast_cons, Some(0.8));
        assert_eq!(first.phylop, Some(1.1));
        assert_eq!(first.clinvar.as_deref(), Some("Pathogenic"));

        let second = store.get(1).unwrap();
        assert_eq!(second.cadd_score, Some(23.5));
        assert_eq!(second.phylop, Some(9.9));
        Ok(())
    }

    #[tokio::test]
    async fn cnv_records_are_excluded_from_lookup() -> Result<(), anyhow::Error> {
        let client = FakeBatchClient::with_results(scored_result);
        let mut store = RecordStore::default();
        let mut cnv = record_with_key("v1", None);
        cnv.alternate = Some(String::from("<DEL>"));
        store.push(cnv);

        let stage = ConservationStage::new(&client, 10, 1);
        stage.run(&mut store).await?;

        // no key, hence no batch was dispatched and the record stays unfilled
        assert!(client.batch_sizes.lock().unwrap().is_empty());
        assert_eq!(store.get(0).unwrap().cadd_score, None);
        Ok(())
    }

    #[tokio::test]
    async fn misaligned_batch_response_is_a_stage_error() {
        let client = FakeBatchClient {
            batch_sizes: Mutex::new(Vec::new()),
            result_for_key: scored_result,
            truncate_response: true,
        };
        let mut store = RecordStore::default();
        store.push(record_with_key("v1", Some("rs1")));
        store.push(record_with_key("v2", Some("rs2")));

        let stage = ConservationStage::new(&client, 10, 1);
        let result = stage.run(&mut store).await;
        let message = result.unwrap_err().to_string();
        assert!(message.contains("requested 2 keys but received 1 results"));
    }
}
