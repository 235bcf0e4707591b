mod common;

use std::sync::Arc;

use common::{image, FakeProvider};
use imprint::{DatasetBuilder, DatasetError, SampleStore};

#[test]
fn test_empty_classes_get_no_label() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SampleStore::with_class_names(Arc::new(FakeProvider::new(6)), ["A", "B", "C"])?;
    let ids: Vec<_> = store.active_classes().iter().map(|c| c.id()).collect();
    for i in 0..3 {
        store.add_sample(ids[0], image(0, i))?;
    }
    for i in 0..2 {
        store.add_sample(ids[2], image(2, i))?;
    }

    let set = DatasetBuilder::build(&store)?;
    assert_eq!(set.class_names(), ["A", "C"]);
    assert_eq!(set.len(), 5);
    assert_eq!(set.features().nrows(), 5);
    assert_eq!(set.labels(), &[0, 0, 0, 1, 1]);
    assert_eq!(set.input_dim(), 6);
    assert_eq!(set.skipped(), 0);

    let targets = set.one_hot();
    assert_eq!(targets.dim(), (5, 2));
    assert_eq!(targets[[4, 1]], 1.0);
    Ok(())
}

#[test]
fn test_fewer_than_two_non_empty_classes() {
    let mut store = SampleStore::new(Arc::new(FakeProvider::new(6)));
    assert_eq!(
        DatasetBuilder::build(&store).unwrap_err(),
        DatasetError::InsufficientClasses { found: 0 }
    );

    let a = store.active_classes()[0].id();
    store.add_sample(a, image(0, 0)).unwrap();
    store.add_sample(a, image(0, 1)).unwrap();
    assert_eq!(
        DatasetBuilder::build(&store).unwrap_err(),
        DatasetError::InsufficientClasses { found: 1 }
    );
}

#[test]
fn test_mismatched_embedding_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SampleStore::with_class_names(Arc::new(FakeProvider::new(8)), ["A", "B", "C"])?;
    let ids: Vec<_> = store.active_classes().iter().map(|c| c.id()).collect();
    for i in 0..3 {
        store.add_sample(ids[0], image(0, i))?;
    }

    // A warm reload with a differently sized extractor
    store.set_provider(Arc::new(FakeProvider::new(4)));
    store.add_sample(ids[0], image(0, 9))?;
    store.set_provider(Arc::new(FakeProvider::new(8)));
    for i in 0..2 {
        store.add_sample(ids[2], image(2, i))?;
    }

    let set = DatasetBuilder::build(&store)?;
    assert_eq!(set.len(), 5);
    assert_eq!(set.skipped(), 1);
    assert_eq!(set.input_dim(), 8);
    assert_eq!(set.class_counts(), vec![3, 2]);
    Ok(())
}

#[test]
fn test_labels_recomputed_per_build() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SampleStore::with_class_names(Arc::new(FakeProvider::new(6)), ["A", "B", "C"])?;
    let ids: Vec<_> = store.active_classes().iter().map(|c| c.id()).collect();
    store.add_sample(ids[0], image(0, 0))?;
    store.add_sample(ids[2], image(2, 0))?;
    assert_eq!(DatasetBuilder::build(&store)?.class_names(), ["A", "C"]);

    store.add_sample(ids[1], image(1, 0))?;
    let set = DatasetBuilder::build(&store)?;
    assert_eq!(set.class_names(), ["A", "B", "C"]);
    assert_eq!(set.labels(), &[0, 1, 2]);
    Ok(())
}
