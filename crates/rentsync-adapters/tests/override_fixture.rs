// Decodes a captured override page and checks canonicalization outcomes per record.

use rentsync_adapters::{Canonicalizer, OverrideAdapter, SkipReason, SourceAdapter, Vocabulary};
use rentsync_core::Category;
use rentsync_storage::RecordPage;

fn fixture_page() -> RecordPage {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/overrides_page.json");
    let text = std::fs::read_to_string(&path).expect("fixture readable");
    serde_json::from_str(&text).expect("fixture parses as a store page")
}

#[test]
fn override_fixture_page_canonicalizes_as_expected() {
    let page = fixture_page();
    assert_eq!(page.offset.as_deref(), Some("itrNext/recOv005"));

    let canonicalizer = Canonicalizer::new(Vocabulary::default(), ["Panama City", "Boquete"]);
    let outcomes: Vec<_> = page
        .records
        .iter()
        .map(|rec| OverrideAdapter.decode(rec).canonicalize(&canonicalizer))
        .collect();

    let first = outcomes[0].as_ref().expect("alias resolves");
    assert_eq!((first.entity.as_str(), first.category, first.amount), ("Panama City", Category::Utilities, 85.0));

    let second = outcomes[1].as_ref().expect("link field resolves");
    assert_eq!((second.entity.as_str(), second.category, second.amount), ("Boquete", Category::Dining, 1200.0));

    assert_eq!(outcomes[2], Err(SkipReason::EntityIsRecordId));
    assert_eq!(outcomes[3], Err(SkipReason::UnresolvedEntity));
    assert_eq!(outcomes[4], Err(SkipReason::Inactive));
}
