//! CSV export of the final record set.

use std::path::Path;

use crate::dataset::record::{RecordStore, VariantRecord};

/// Write the dataset to `path` as UTF-8, comma-separated CSV.
///
/// The header row is the fixed column list; `None` fields are rendered as
/// empty strings.
pub fn write_dataset<P: AsRef<Path>>(store: &RecordStore, path: P) -> Result<(), anyhow::Error> {
    let path = path.as_ref();
    tracing::info!("writing {} records to {:?} ...", store.len(), path);
    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .map_err(|e| anyhow::anyhow!("cannot open {:?} for writing: {}", path, e))?;
    writer.write_record(VariantRecord::COLUMNS)?;
    for record in store.iter() {
        writer.write_record(record.csv_row())?;
    }
    writer.flush()?;
    tracing::info!("... done writing dataset");
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::dataset::record::{ReportedOutcome, VariantRecord};

    use super::*;

    #[test]
    fn writes_header_and_one_row_per_record() -> Result<(), anyhow::Error> {
        let mut store = RecordStore::default();
        store.push(VariantRecord {
            id: String::from("v1"),
            case_id: String::from("C100-2"),
            chromosome: Some(String::from("chr7")),
            start: Some(100),
            tier: Some(String::from("TIER1")),
            reported_outcome: ReportedOutcome::Reported,
            ..Default::default()
        });
        store.push(VariantRecord {
            id: String::from("v2"),
            case_id: String::from("C100-2"),
            reported_outcome: ReportedOutcome::NotReported,
            ..Default::default()
        });

        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("dataset.csv");
        write_dataset(&store, &path)?;

        let contents = std::fs::read_to_string(&path)?;
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], VariantRecord::COLUMNS.join(","));
        assert!(lines[1].starts_with("v1,chr7,100,,,"));
        assert!(lines[1].ends_with(",reported"));
        assert!(lines[2].starts_with("v2,,,,,"));
        assert!(lines[2].ends_with(",not_reported"));
        Ok(())
    }
}
