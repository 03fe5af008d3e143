use std::path::Path;

use playdex_source::load_csv;

#[test]
fn workspace_sample_dataset_reads_every_row() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let dataset = load_csv(&root.join("fixtures/playstore-sample.csv")).expect("sample csv");

    assert_eq!(dataset.len(), 8);
    assert!(dataset.missing_columns().is_empty());
    assert_eq!(dataset.records[0], dataset.records[1]);
    assert_eq!(dataset.records[2].app_id, None);
    assert_eq!(dataset.records[3].category.as_deref(), Some(" tools "));
    assert_eq!(dataset.records[3].price.as_deref(), Some("$1.99"));
}
