use std::sync::{Arc, Mutex};

use firestore_sync_core::firestore::core::LimitType;
use firestore_sync_core::firestore::local::{
    Bundle, BundleMetadata, BundledDocument, BundledDocumentMetadata, BundledQuery, NamedQuery,
};
use firestore_sync_core::firestore::model::{DatabaseId, SnapshotVersion};
use firestore_sync_core::firestore::test_support::{doc, key, map, query, RecordingTransport};
use firestore_sync_core::firestore::value::FirestoreValue;
use firestore_sync_core::firestore::{FirestoreClient, ListenOptions, SyncEngineSettings};

fn rooms_bundle(bundle_id: &str) -> Bundle {
    let read_time = SnapshotVersion::from_micros(1_000);
    Bundle {
        metadata: BundleMetadata {
            bundle_id: bundle_id.to_string(),
            schema_version: 1,
            create_time: read_time,
            total_documents: 2,
            total_bytes: 512,
        },
        named_queries: vec![NamedQuery {
            name: "all-rooms".to_string(),
            bundled_query: BundledQuery {
                target: query("rooms").to_target(),
                limit_type: LimitType::LimitToFirst,
            },
            read_time,
        }],
        documents: vec![
            BundledDocument {
                metadata: BundledDocumentMetadata {
                    key: key("rooms/eros"),
                    read_time,
                    exists: true,
                    queries: vec!["all-rooms".to_string()],
                },
                document: Some(doc("rooms/eros", 900, map(&[("topic", FirestoreValue::from_string("love"))]))),
            },
            BundledDocument {
                metadata: BundledDocumentMetadata {
                    key: key("rooms/gone"),
                    read_time,
                    exists: false,
                    queries: vec![],
                },
                document: None,
            },
        ],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bundled_documents_and_named_queries_are_served_from_cache() {
    let client = FirestoreClient::new(
        SyncEngineSettings::default(),
        DatabaseId::default("bundle-tests"),
        Arc::new(RecordingTransport::default()),
    );

    let progress = client.load_bundle(rooms_bundle("rooms-v1")).await.unwrap();
    assert_eq!(progress.documents_loaded, 2);
    assert_eq!(progress.total_bytes, 512);

    let named = client
        .get_named_query("all-rooms")
        .await
        .unwrap()
        .expect("named query saved");
    assert_eq!(named.to_query().canonical_id(), query("rooms").canonical_id());
    assert!(client.get_named_query("missing").await.unwrap().is_none());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _listener = client
        .listen(
            named.to_query(),
            ListenOptions::from_cache(),
            Arc::new(move |event| {
                let snapshot = event.expect("snapshot");
                let keys: Vec<String> = snapshot
                    .documents
                    .iter()
                    .map(|document| document.key().to_string())
                    .collect();
                sink.lock().unwrap().push((keys, snapshot.is_from_cache));
            }),
        )
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(vec!["rooms/eros".to_string()], true)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reloading_a_bundle_is_a_no_op() {
    let client = FirestoreClient::new(
        SyncEngineSettings::default(),
        DatabaseId::default("bundle-tests"),
        Arc::new(RecordingTransport::default()),
    );
    client.load_bundle(rooms_bundle("rooms-v1")).await.unwrap();
    let again = client.load_bundle(rooms_bundle("rooms-v1")).await.unwrap();
    assert_eq!(again.documents_loaded, again.total_documents);
}
