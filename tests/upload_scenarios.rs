//! End-to-end upload scenarios against the in-memory store
//!
//! Run: cargo test --test upload_scenarios

mod helpers;

use std::sync::Arc;

use helpers::*;
use row_upload::error::{ScopeError, UploadError};
use row_upload::result::{ConflictReason, RowFailure};
use row_upload::upload::{sibling_order, WriteAction};
use row_upload::{
    ClearedRelationshipPolicy, FieldValue, IdentityNode, IdentityPack, InMemoryStore,
    MemoryAuditSink, RecordId, RecordOutcome, UploadConfig, UploadMode, Uploader,
};

fn pack(root: IdentityNode) -> IdentityPack {
    IdentityPack { root }
}

fn delete_policy() -> UploadConfig {
    UploadConfig {
        cleared_relationship_policy: ClearedRelationshipPolicy::Delete,
        ..UploadConfig::default()
    }
}

fn specimen_row(catalog: &str, first: &str, last: &str) -> row_upload::Row {
    row(&[
        ("Catalog", catalog),
        ("Remarks", "skull"),
        ("Cataloger First", first),
        ("Cataloger Last", last),
        ("Locality", "Downe"),
        ("Kingdom", "Animalia"),
        ("Phylum", "Chordata"),
        ("Class", ""),
        ("Prep 1", "skin"),
        ("Prep 2", "skeleton"),
    ])
}

/// Specimen C-1 linked to locality Downe
async fn seed_linked_specimen(store: &InMemoryStore) -> (RecordId, RecordId) {
    let locality = store
        .seed("locality", values(&[("name", text("Downe"))]))
        .await
        .unwrap();
    let specimen = store
        .seed(
            "specimen",
            values(&[
                ("catalog_number", text("C-1")),
                ("locality_id", FieldValue::Ref(locality)),
            ]),
        )
        .await
        .unwrap();
    (specimen, locality)
}

fn cleared_locality_pack(specimen: RecordId, locality: RecordId) -> IdentityPack {
    let mut root = IdentityNode::with_id(specimen, Some(1));
    root.to_one
        .insert("locality".into(), IdentityNode::with_id(locality, None));
    pack(root)
}

// =============================================================================
// CREATE AND MATCH
// =============================================================================

#[tokio::test]
async fn simple_create_then_match() {
    let plan = r#"
version: 1
root:
  record:
    table: locality
    fields: {name: A, country: B}
"#;
    let (store, uploader) = setup(plan, UploadConfig::default());
    let rows = vec![row(&[("A", "x"), ("B", "y")])];

    let first = uploader.run(&rows, None).await.unwrap();
    let RecordOutcome::Uploaded { id } = first.rows[0].result.outcome else {
        panic!("expected uploaded, got {:?}", first.rows[0].result.outcome);
    };
    assert!(first.rows[0].committed);
    assert_eq!(store.count("locality").await, 1);

    let second = uploader.run(&rows, None).await.unwrap();
    assert_eq!(second.rows[0].result.outcome, RecordOutcome::Matched { id });
    assert_eq!(store.count("locality").await, 1);
}

#[tokio::test]
async fn second_run_of_same_rows_creates_nothing() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let rows = vec![specimen_row("C-1", "Charles", "Darwin")];

    let first = uploader.run(&rows, None).await.unwrap();
    assert_eq!(first.committed_rows, 1);
    assert_eq!(first.count("uploaded"), 7);
    assert_eq!(first.count("null_record"), 1);

    let second = uploader.run(&rows, None).await.unwrap();
    assert_eq!(second.committed_rows, 1);
    assert_eq!(second.count("uploaded"), 0);
    assert_eq!(second.count("matched"), 7);

    assert_eq!(store.count("specimen").await, 1);
    assert_eq!(store.count("agent").await, 1);
    assert_eq!(store.count("locality").await, 1);
    assert_eq!(store.count("taxon").await, 2);
    assert_eq!(store.count("preparation").await, 2);
}

#[tokio::test]
async fn identical_siblings_stay_separate_records() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let rows = vec![row(&[("Catalog", "C-9"), ("Prep 1", "skin"), ("Prep 2", "skin")])];

    let first = uploader.run(&rows, None).await.unwrap();
    assert!(first.rows[0].committed);
    let slots = &first.rows[0].result.to_many["preparations"];
    assert!(matches!(slots[0].outcome, RecordOutcome::Uploaded { .. }));
    assert!(matches!(slots[1].outcome, RecordOutcome::Uploaded { .. }));
    assert_ne!(slots[0].record_id(), slots[1].record_id());
    assert_eq!(store.count("preparation").await, 2);

    let stored = store.records("preparation").await;
    let position = |id: RecordId| {
        stored.iter().find(|p| p.id == id).unwrap().values["position"].clone()
    };
    assert_eq!(position(slots[0].record_id().unwrap()), FieldValue::Integer(1));
    assert_eq!(position(slots[1].record_id().unwrap()), FieldValue::Integer(2));

    let second = uploader.run(&rows, None).await.unwrap();
    let again = &second.rows[0].result.to_many["preparations"];
    assert_eq!(again[0].outcome, RecordOutcome::Matched { id: slots[0].record_id().unwrap() });
    assert_eq!(again[1].outcome, RecordOutcome::Matched { id: slots[1].record_id().unwrap() });
    assert_eq!(store.count("preparation").await, 2);
}

#[tokio::test]
async fn child_keys_are_written_to_the_parent() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let report = uploader
        .run(&[specimen_row("C-1", "Charles", "Darwin")], None)
        .await
        .unwrap();

    let result = &report.rows[0].result;
    let specimen = store
        .record("specimen", result.record_id().unwrap())
        .await
        .unwrap();
    let cataloger = result.to_one["cataloger"].record_id().unwrap();
    let phylum = result.to_one["taxon"].record_id().unwrap();
    assert_eq!(specimen.values["cataloger_id"], FieldValue::Ref(cataloger));
    assert_eq!(specimen.values["taxon_id"], FieldValue::Ref(phylum));

    let preparations = store.records("preparation").await;
    assert!(preparations
        .iter()
        .all(|p| p.values["specimen_id"] == FieldValue::Ref(specimen.id)));
    let kinds: Vec<FieldValue> = sibling_order(&preparations, "position")
        .into_iter()
        .map(|id| preparations.iter().find(|p| p.id == id).unwrap().values["kind"].clone())
        .collect();
    assert_eq!(kinds, vec![text("skin"), text("skeleton")]);
}

#[tokio::test]
async fn single_match_is_updated_only_when_asked() {
    let plan = r#"
version: 1
root:
  record:
    table: agent
    on_match: update
    fields:
      first_name: First
      last_name: Last
      title: Title
"#;
    let (store, uploader) = setup(plan, UploadConfig::default());
    let id = seed_agent(&store, "Charles", "Darwin", "Mr").await;

    let report = uploader
        .run(&[row(&[("First", "Charles"), ("Last", "Darwin"), ("Title", "Dr")])], None)
        .await
        .unwrap();
    let RecordOutcome::MatchedAndChanged { id: matched, changes } = &report.rows[0].result.outcome
    else {
        panic!("expected matched_and_changed");
    };
    assert_eq!(*matched, id);
    assert_eq!(changes[0].field, "title");
    assert_eq!(store.record("agent", id).await.unwrap().values["title"], text("Dr"));

    // The default leaves the stored record alone
    let (store, uploader) = setup(AGENT_PLAN, UploadConfig::default());
    let id = seed_agent(&store, "Charles", "Darwin", "Mr").await;
    let report = uploader
        .run(&[row(&[("First", "Charles"), ("Last", "Darwin"), ("Title", "Dr")])], None)
        .await
        .unwrap();
    assert_eq!(report.rows[0].result.outcome, RecordOutcome::Matched { id });
    assert_eq!(store.record("agent", id).await.unwrap().values["title"], text("Mr"));
}

#[tokio::test]
async fn scope_is_written_and_matched() {
    let schema = schema();
    let store = InMemoryStore::new(&schema);
    let institution = store
        .seed("institution", values(&[("name", text("NHM"))]))
        .await
        .unwrap();
    let mut config = UploadConfig::default();
    config
        .scope
        .insert("institution".into(), institution.to_string());
    let uploader = Uploader::new(
        schema.clone(),
        plan(&schema, COLLECTOR_PLAN),
        Arc::new(store.clone()),
        config,
    );

    let report = uploader
        .run(&[row(&[("Collector", "Wallace")])], None)
        .await
        .unwrap();
    let id = report.rows[0].result.record_id().unwrap();
    let record = store.record("collector", id).await.unwrap();
    assert_eq!(record.values["institution_id"], FieldValue::Ref(institution));

    let again = uploader
        .run(&[row(&[("Collector", "Wallace")])], None)
        .await
        .unwrap();
    assert_eq!(again.rows[0].result.outcome, RecordOutcome::Matched { id });
}

#[tokio::test]
async fn row_scope_separates_equal_identities() {
    let (store, uploader) = setup(LOAN_PLAN, UploadConfig::default());
    let nhm = store
        .seed("institution", values(&[("name", text("NHM"))]))
        .await
        .unwrap();
    let kew = store
        .seed("institution", values(&[("name", text("Kew"))]))
        .await
        .unwrap();
    let (nhm_text, kew_text) = (nhm.to_string(), kew.to_string());
    let rows = vec![
        row(&[("Loan", "L-1"), ("Institution", nhm_text.as_str())]),
        row(&[("Loan", "L-1"), ("Institution", kew_text.as_str())]),
    ];

    let first = uploader.run(&rows, None).await.unwrap();
    assert_eq!(first.count("uploaded"), 2);
    assert_eq!(store.count("loan").await, 2);
    let ids: Vec<RecordId> = first
        .rows
        .iter()
        .map(|row| row.result.record_id().unwrap())
        .collect();
    assert_ne!(ids[0], ids[1]);
    assert_eq!(
        store.record("loan", ids[1]).await.unwrap().values["institution_id"],
        FieldValue::Ref(kew)
    );

    let second = uploader.run(&rows, None).await.unwrap();
    assert_eq!(second.rows[0].result.outcome, RecordOutcome::Matched { id: ids[0] });
    assert_eq!(second.rows[1].result.outcome, RecordOutcome::Matched { id: ids[1] });
    assert_eq!(store.count("loan").await, 2);
}

#[tokio::test]
async fn missing_scope_aborts_the_batch() {
    let (_store, uploader) = setup(COLLECTOR_PLAN, UploadConfig::default());
    let err = uploader
        .run(&[row(&[("Collector", "Wallace")])], None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Scope(ScopeError::Unresolved { .. })));

    let mut config = UploadConfig::default();
    config
        .scope
        .insert("institution".into(), RecordId::new().to_string());
    let (_store, uploader) = setup(COLLECTOR_PLAN, config);
    let err = uploader
        .run(&[row(&[("Collector", "Wallace")])], None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Scope(ScopeError::NotFound { .. })));
}

// =============================================================================
// TREES
// =============================================================================

#[tokio::test]
async fn tree_chain_stops_at_first_blank_rank() {
    let (store, uploader) = setup(TAXON_PLAN, UploadConfig::default());
    let rows = vec![
        row(&[("Kingdom", "Animalia"), ("Phylum", ""), ("Class", "")]),
        row(&[("Kingdom", "Animalia"), ("Phylum", "Chordata"), ("Class", "Mammalia")]),
        row(&[("Kingdom", ""), ("Phylum", "Chordata"), ("Class", "")]),
    ];
    let report = uploader.run(&rows, None).await.unwrap();

    let first = &report.rows[0].result;
    let RecordOutcome::Uploaded { id: kingdom } = first.ranks[0].outcome else {
        panic!("expected uploaded kingdom, got {:?}", first.ranks[0].outcome);
    };
    assert_eq!(first.ranks[1].outcome, RecordOutcome::NullRecord);
    assert_eq!(first.ranks[2].outcome, RecordOutcome::NullRecord);
    assert_eq!(first.outcome, RecordOutcome::Uploaded { id: kingdom });
    let stored = store.record("taxon", kingdom).await.unwrap();
    assert_eq!(stored.values["rank"], text("Kingdom"));
    assert!(!stored.values.contains_key("parent_id"));

    let second = &report.rows[1].result;
    assert_eq!(second.ranks[0].outcome, RecordOutcome::Matched { id: kingdom });
    let phylum = second.ranks[1].outcome.record_id().unwrap();
    let class = second.ranks[2].outcome.record_id().unwrap();
    assert_eq!(
        store.record("taxon", phylum).await.unwrap().values["parent_id"],
        FieldValue::Ref(kingdom)
    );
    assert_eq!(
        store.record("taxon", class).await.unwrap().values["parent_id"],
        FieldValue::Ref(phylum)
    );

    let third = &report.rows[2].result;
    assert_eq!(third.outcome, RecordOutcome::NullRecord);
    assert!(third
        .ranks
        .iter()
        .all(|rank| rank.outcome == RecordOutcome::NullRecord));
    assert_eq!(store.count("taxon").await, 3);
}

// =============================================================================
// FAILURES
// =============================================================================

#[tokio::test]
async fn ambiguous_child_fails_the_whole_row() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let a = seed_agent(&store, "Charles", "Darwin", "Mr").await;
    let b = seed_agent(&store, "Charles", "Darwin", "Mr").await;

    let report = uploader
        .run(&[specimen_row("C-1", "Charles", "Darwin")], None)
        .await
        .unwrap();
    let row = &report.rows[0];
    assert!(!row.committed);
    assert_eq!(report.failed_rows, 1);
    assert_eq!(row.result.outcome, RecordOutcome::PropagatedFailure);

    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(
        row.result.to_one["cataloger"].outcome,
        RecordOutcome::MatchedMultiple {
            candidates: expected
        }
    );
    assert!(row.result.to_many["preparations"]
        .iter()
        .all(|slot| slot.outcome == RecordOutcome::PropagatedFailure));

    assert_eq!(store.count("specimen").await, 0);
    assert_eq!(store.count("locality").await, 0);
    assert_eq!(store.count("taxon").await, 0);
    assert_eq!(store.count("preparation").await, 0);
}

#[tokio::test]
async fn repeated_runs_see_the_same_candidates() {
    let validate = UploadConfig {
        mode: UploadMode::Validate,
        ..UploadConfig::default()
    };
    let (store, uploader) = setup(SPECIMEN_PLAN, validate);
    seed_agent(&store, "Charles", "Darwin", "Mr").await;
    seed_agent(&store, "Charles", "Darwin", "Dr").await;

    let rows = [specimen_row("C-1", "Charles", "Darwin")];
    let first = uploader.run(&rows, None).await.unwrap();
    let second = uploader.run(&rows, None).await.unwrap();

    assert_eq!(
        first.rows[0].result.to_one["cataloger"],
        second.rows[0].result.to_one["cataloger"]
    );
    assert_eq!(first.counts, second.counts);
}

#[tokio::test]
async fn vetoed_write_rolls_back_its_row_only() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let uploader = uploader.with_rules(Arc::new(Veto {
        table: "preparation",
        action: WriteAction::Create,
    }));

    let rows = vec![
        specimen_row("C-1", "Charles", "Darwin"),
        row(&[("Catalog", "C-2")]),
    ];
    let report = uploader.run(&rows, None).await.unwrap();

    let failed = &report.rows[0];
    assert!(!failed.committed);
    assert_eq!(failed.result.outcome, RecordOutcome::PropagatedFailure);
    let slots = &failed.result.to_many["preparations"];
    assert!(matches!(
        &slots[0].outcome,
        RecordOutcome::FailedBusinessRule { rule, .. } if rule == "no-preparation"
    ));
    assert_eq!(slots[1].outcome, RecordOutcome::PropagatedFailure);

    assert!(report.rows[1].committed);
    assert_eq!(report.committed_rows, 1);
    assert_eq!(store.count("specimen").await, 1);
    assert_eq!(store.count("agent").await, 0);
    assert_eq!(store.count("preparation").await, 0);
}

#[tokio::test]
async fn missing_required_value_is_a_parse_failure() {
    let (store, uploader) = setup(SPECIMEN_PLAN, UploadConfig::default());
    let report = uploader
        .run(&[row(&[("Catalog", ""), ("Prep 1", "skin")])], None)
        .await
        .unwrap();

    let RecordOutcome::ParseFailures { failures } = &report.rows[0].result.outcome else {
        panic!("expected parse failures");
    };
    assert_eq!(failures[0].field, "catalog_number");
    assert_eq!(failures[0].column, "Catalog");
    assert_eq!(
        report.rows[0].result.to_many["preparations"][0].outcome,
        RecordOutcome::PropagatedFailure
    );
    assert_eq!(store.count("preparation").await, 0);
}

#[tokio::test]
async fn late_uniqueness_violation_is_a_conflict() {
    let (store, uploader) = setup(LOCALITY_PLAN, UploadConfig::default());
    seed_linked_specimen(&store).await;

    let report = uploader
        .run(&[row(&[("Catalog", "C-1"), ("Locality", "Kent")])], None)
        .await
        .unwrap();
    let row = &report.rows[0];
    assert!(!row.committed);
    assert_eq!(
        row.result.outcome,
        RecordOutcome::Conflict {
            id: None,
            reason: ConflictReason::Uniqueness {
                constraint: "specimen_catalog_number_key".into()
            }
        }
    );
    assert_eq!(store.count("locality").await, 1);
}

#[tokio::test]
async fn storage_error_fails_the_row() {
    let schema = schema();
    let inner = InMemoryStore::new(&schema);
    let store = FailingStore {
        inner: inner.clone(),
        fail_on: "agent".into(),
    };
    let uploader = Uploader::new(
        schema.clone(),
        plan(&schema, AGENT_PLAN),
        Arc::new(store),
        UploadConfig::default(),
    );

    let report = uploader
        .run(&[row(&[("First", "Alfred"), ("Last", "Wallace")])], None)
        .await
        .unwrap();
    let row = &report.rows[0];
    assert!(!row.committed);
    assert!(matches!(
        &row.failure,
        Some(RowFailure::Storage(message)) if message.contains("connection reset")
    ));
    assert_eq!(row.result.outcome, RecordOutcome::PropagatedFailure);
    assert_eq!(report.failed_rows, 1);
    assert_eq!(inner.count("agent").await, 0);
}

// =============================================================================
// IDENTITY PACKS
// =============================================================================

#[tokio::test]
async fn identity_pack_resolves_ambiguous_match() {
    let sink = Arc::new(MemoryAuditSink::new());
    let config = UploadConfig {
        agent: "curator".into(),
        ..UploadConfig::default()
    };
    let (store, uploader) = setup(AGENT_PLAN, config);
    let uploader = uploader.with_audit_sink(sink.clone());
    let _a = seed_agent(&store, "Charles", "Darwin", "Mr").await;
    let b = seed_agent(&store, "Charles", "Darwin", "Mr").await;

    let rows = vec![row(&[("First", "Charles"), ("Last", "Darwin"), ("Title", "Dr")])];
    let unresolved = uploader.run(&rows, None).await.unwrap();
    assert!(matches!(
        unresolved.rows[0].result.outcome,
        RecordOutcome::MatchedMultiple { .. }
    ));
    assert!(sink.entries().is_empty());

    let packs = vec![pack(IdentityNode::with_id(b, Some(1)))];
    let resolved = uploader.run(&rows, Some(&packs)).await.unwrap();
    let RecordOutcome::Updated { id, changes } = &resolved.rows[0].result.outcome else {
        panic!("expected updated");
    };
    assert_eq!(*id, b);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].before, text("Mr"));
    assert_eq!(changes[0].after, text("Dr"));

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record_id, b);
    assert_eq!(entries[0].agent, "curator");
    assert_eq!(entries[0].changed_fields(), vec!["title"]);

    // Same values again: nothing to write
    let packs = vec![pack(IdentityNode::with_id(b, Some(2)))];
    let repeat = uploader.run(&rows, Some(&packs)).await.unwrap();
    assert_eq!(repeat.rows[0].result.outcome, RecordOutcome::NoChange { id: b });
    assert_eq!(store.count("agent").await, 2);
}

#[tokio::test]
async fn stale_or_missing_pack_records_conflict() {
    let (store, uploader) = setup(LOCALITY_PLAN, UploadConfig::default());
    let (specimen, locality) = seed_linked_specimen(&store).await;
    let rows = vec![row(&[("Catalog", "C-1"), ("Locality", "Downe")])];

    let mut stale = IdentityNode::with_id(specimen, Some(4));
    stale
        .to_one
        .insert("locality".into(), IdentityNode::with_id(locality, None));
    let report = uploader.run(&rows, Some(&[pack(stale)])).await.unwrap();
    assert_eq!(
        report.rows[0].result.outcome,
        RecordOutcome::Conflict {
            id: Some(specimen),
            reason: ConflictReason::Version {
                expected: 4,
                found: 1
            }
        }
    );

    let ghost = RecordId::new();
    let report = uploader
        .run(&rows, Some(&[pack(IdentityNode::with_id(ghost, None))]))
        .await
        .unwrap();
    assert_eq!(
        report.rows[0].result.outcome,
        RecordOutcome::Conflict {
            id: Some(ghost),
            reason: ConflictReason::Missing
        }
    );

    let mut marked = IdentityNode::with_id(specimen, Some(1));
    marked.empty.insert("locality".into());
    let report = uploader
        .run(
            &[row(&[("Catalog", "C-1"), ("Locality", "")])],
            Some(&[pack(marked)]),
        )
        .await
        .unwrap();
    assert_eq!(
        report.rows[0].result.outcome,
        RecordOutcome::Conflict {
            id: Some(specimen),
            reason: ConflictReason::StaleRelationship {
                relationship: "locality".into()
            }
        }
    );
    assert_eq!(report.committed_rows, 0);
}

#[tokio::test]
async fn cleared_relationship_is_held() {
    let (store, uploader) = setup(LOCALITY_PLAN, UploadConfig::default());
    let (specimen, locality) = seed_linked_specimen(&store).await;

    let report = uploader
        .run(
            &[row(&[("Catalog", "C-1"), ("Locality", "")])],
            Some(&[cleared_locality_pack(specimen, locality)]),
        )
        .await
        .unwrap();
    let result = &report.rows[0].result;
    assert_eq!(result.to_one["locality"].outcome, RecordOutcome::NullRecord);
    assert!(matches!(result.outcome, RecordOutcome::Updated { .. }));
    assert!(report.rows[0].committed);

    assert_eq!(store.count("locality").await, 1);
    let stored = store.record("specimen", specimen).await.unwrap();
    assert!(!stored.values.contains_key("locality_id"));
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn cleared_relationship_is_deleted_when_unreferenced() {
    let (store, uploader) = setup(LOCALITY_PLAN, delete_policy());
    let (specimen, locality) = seed_linked_specimen(&store).await;

    let report = uploader
        .run(
            &[row(&[("Catalog", "C-1"), ("Locality", "")])],
            Some(&[cleared_locality_pack(specimen, locality)]),
        )
        .await
        .unwrap();
    let result = &report.rows[0].result;
    assert_eq!(
        result.to_one["locality"].outcome,
        RecordOutcome::Deleted { id: locality }
    );
    assert!(matches!(result.outcome, RecordOutcome::Updated { .. }));
    assert_eq!(store.count("locality").await, 0);
    assert_eq!(report.count("deleted"), 1);
}

#[tokio::test]
async fn cleared_relationship_still_referenced_is_kept() {
    let (store, uploader) = setup(LOCALITY_PLAN, delete_policy());
    let (specimen, locality) = seed_linked_specimen(&store).await;
    store
        .seed(
            "specimen",
            values(&[
                ("catalog_number", text("C-2")),
                ("locality_id", FieldValue::Ref(locality)),
            ]),
        )
        .await
        .unwrap();

    let report = uploader
        .run(
            &[row(&[("Catalog", "C-1"), ("Locality", "")])],
            Some(&[cleared_locality_pack(specimen, locality)]),
        )
        .await
        .unwrap();
    let result = &report.rows[0].result;
    assert_eq!(result.to_one["locality"].outcome, RecordOutcome::NullRecord);
    assert!(matches!(result.outcome, RecordOutcome::Updated { .. }));
    assert!(report.rows[0].committed);
    assert_eq!(store.count("locality").await, 1);
}

// =============================================================================
// TO-MANY SIBLINGS
// =============================================================================

async fn seed_preparations(
    store: &InMemoryStore,
    specimen: RecordId,
    preps: &[(&str, i64)],
) -> Vec<RecordId> {
    let mut ids = Vec::new();
    for (kind, position) in preps {
        let id = store
            .seed(
                "preparation",
                values(&[
                    ("kind", text(kind)),
                    ("position", FieldValue::Integer(*position)),
                    ("specimen_id", FieldValue::Ref(specimen)),
                ]),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

fn preparation_pack(specimen: RecordId, preps: &[RecordId]) -> IdentityPack {
    let mut root = IdentityNode::with_id(specimen, Some(1));
    root.to_many.insert(
        "preparations".into(),
        preps
            .iter()
            .map(|id| IdentityNode::with_id(*id, None))
            .collect(),
    );
    pack(root)
}

#[tokio::test]
async fn unspecified_positions_follow_explicit_ones() {
    let (store, uploader) = setup(PREPARATION_PLAN, UploadConfig::default());
    let specimen = store
        .seed("specimen", values(&[("catalog_number", text("C-1"))]))
        .await
        .unwrap();
    let preps = seed_preparations(
        &store,
        specimen,
        &[("skin", 10), ("skeleton", 1), ("tissue", 1)],
    )
    .await;

    let rows = vec![row(&[
        ("Catalog", "C-1"),
        ("Prep 1", "skin"),
        ("Prep 1 Position", ""),
        ("Prep 2", "skeleton"),
        ("Prep 2 Position", ""),
        ("Prep 3", "tissue"),
        ("Prep 3 Position", "1"),
    ])];
    let report = uploader
        .run(&rows, Some(&[preparation_pack(specimen, &preps)]))
        .await
        .unwrap();
    assert!(report.rows[0].committed);

    let slots = &report.rows[0].result.to_many["preparations"];
    assert!(matches!(slots[0].outcome, RecordOutcome::Updated { .. }));
    assert!(matches!(slots[1].outcome, RecordOutcome::Updated { .. }));
    assert_eq!(slots[2].outcome, RecordOutcome::NoChange { id: preps[2] });

    let stored = store.records("preparation").await;
    assert_eq!(
        sibling_order(&stored, "position"),
        vec![preps[2], preps[0], preps[1]]
    );
    let position = |id: RecordId| {
        stored.iter().find(|p| p.id == id).unwrap().values["position"].clone()
    };
    assert_eq!(position(preps[0]), FieldValue::Integer(2));
    assert_eq!(position(preps[1]), FieldValue::Integer(3));
}

#[tokio::test]
async fn dropped_sibling_follows_policy() {
    let rows = vec![row(&[
        ("Catalog", "C-1"),
        ("Prep 1", "skin"),
        ("Prep 1 Position", "1"),
    ])];

    for (config, expected_left) in [(UploadConfig::default(), 2), (delete_policy(), 1)] {
        let deleting = config.cleared_relationship_policy == ClearedRelationshipPolicy::Delete;
        let (store, uploader) = setup(PREPARATION_PLAN, config);
        let specimen = store
            .seed("specimen", values(&[("catalog_number", text("C-1"))]))
            .await
            .unwrap();
        let preps = seed_preparations(&store, specimen, &[("skin", 1), ("skeleton", 2)]).await;

        let report = uploader
            .run(&rows, Some(&[preparation_pack(specimen, &preps[..1])]))
            .await
            .unwrap();
        assert!(report.rows[0].committed);

        let slots = &report.rows[0].result.to_many["preparations"];
        assert_eq!(slots[0].outcome, RecordOutcome::NoChange { id: preps[0] });
        assert_eq!(slots[1].outcome, RecordOutcome::NullRecord);
        if deleting {
            assert_eq!(slots.len(), 4);
            assert_eq!(slots[3].outcome, RecordOutcome::Deleted { id: preps[1] });
        } else {
            assert_eq!(slots.len(), 3);
        }
        assert_eq!(store.count("preparation").await, expected_left);
    }
}

// =============================================================================
// BATCH CONTROL
// =============================================================================

#[tokio::test]
async fn validate_mode_writes_nothing() {
    let config = UploadConfig {
        mode: UploadMode::Validate,
        ..UploadConfig::default()
    };
    let (store, uploader) = setup(AGENT_PLAN, config);
    let report = uploader
        .run(&[row(&[("First", "Alfred"), ("Last", "Wallace")])], None)
        .await
        .unwrap();

    assert!(matches!(
        report.rows[0].result.outcome,
        RecordOutcome::Uploaded { .. }
    ));
    assert!(!report.rows[0].committed);
    assert!(!report.has_failures());
    assert_eq!(store.count("agent").await, 0);
}

#[tokio::test]
async fn stop_on_failed_row_skips_the_rest() {
    let config = UploadConfig {
        stop_on_failed_row: true,
        ..UploadConfig::default()
    };
    let (store, uploader) = setup(AGENT_PLAN, config);
    seed_agent(&store, "Charles", "Darwin", "Mr").await;
    seed_agent(&store, "Charles", "Darwin", "Mr").await;

    let rows = vec![
        row(&[("First", "Charles"), ("Last", "Darwin")]),
        row(&[("First", "Alfred"), ("Last", "Wallace")]),
    ];
    let report = uploader.run(&rows, None).await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert!(report.cancelled);
    assert_eq!(store.count("agent").await, 2);
}

#[tokio::test]
async fn cancelled_batch_processes_no_rows() {
    let (store, uploader) = setup(AGENT_PLAN, UploadConfig::default());
    uploader.cancel_handle().cancel();

    let report = uploader
        .run(&[row(&[("First", "Alfred"), ("Last", "Wallace")])], None)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert!(report.rows.is_empty());
    assert_eq!(store.count("agent").await, 0);
}

#[tokio::test]
async fn pack_count_must_match_rows() {
    let (_store, uploader) = setup(AGENT_PLAN, UploadConfig::default());
    let rows = vec![
        row(&[("First", "Alfred"), ("Last", "Wallace")]),
        row(&[("First", "Henry"), ("Last", "Bates")]),
    ];
    let packs = vec![pack(IdentityNode::default())];

    let err = uploader.run(&rows, Some(&packs)).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::IdentityPackCount { rows: 2, packs: 1 }
    ));
}
