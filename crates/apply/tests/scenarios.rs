#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{clients, config, configmap, deployment, RecordingSleeper, VecSource};
use kfold_apply::{codec, Apply, ApplyError, Catalog, Clients, DefaultUpserter, Phase, Upserter};
use kfold_core::annotations::{GC_STRATEGY, GC_TAG, LABEL_DEPLOY_MANAGER};
use kfold_core::{DeletePropagation, RawObj, ServerVersion, StoreError};
use kfold_store::{Call, MemStore};
use serde_json::{json, Value as Json};

fn annotated(name: &str, annotations: Json) -> Json {
    let mut v = configmap(name, json!({ "k": name }));
    v["metadata"]["annotations"] = annotations;
    v
}

fn creates(store: &MemStore) -> Vec<String> {
    store
        .writes()
        .into_iter()
        .filter_map(|c| match c {
            Call::Create { kind, name, .. } => Some(format!("{kind}/{name}")),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn creates_missing_objects_and_keeps_them_through_gc() {
    let store = MemStore::new();
    let source = VecSource(vec![
        deployment("web", json!([{ "name": "web", "image": "nginx:1" }])),
        configmap("cfg", json!({ "k": "v" })),
    ]);
    let sleeper = Arc::new(RecordingSleeper::default());
    let report = Apply::new(config("rel-7"), Arc::new(source), clients(&store), sleeper.clone()).run().await.unwrap();

    assert_eq!(creates(&store), ["ConfigMap/cfg", "Deployment/web"]);
    assert_eq!(store.writes().len(), 2);
    let gc = report.gc.unwrap();
    assert_eq!(gc.considered, 2);
    assert!(gc.deleted.is_empty());
    assert_eq!(sleeper.count(), 0);

    let cm = store.object("ConfigMap", Some("default"), "cfg").unwrap();
    assert_eq!(cm.annotation(GC_TAG), Some("rel-7"));
    assert_eq!(cm.label(LABEL_DEPLOY_MANAGER), Some("kfold"));
    assert_eq!(codec::rebuild_object(&cm).unwrap(), RawObj::from_value(configmap("cfg", json!({ "k": "v" }))).unwrap());
    assert_eq!(report.applied[0].uid, cm.uid().unwrap());
}

#[tokio::test]
async fn service_without_namespace_is_created_in_the_environment_namespace_and_survives_gc() {
    let store = MemStore::new();
    let clients = Clients { namespace: "ns".into(), ..clients(&store) };
    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "s1" },
        "spec": { "ports": [ { "port": 80 } ] }
    });
    let report = Apply::new(config("rel-7"), Arc::new(VecSource(vec![service])), clients, Arc::new(RecordingSleeper::default()))
        .run()
        .await
        .unwrap();

    let live = store.object("Service", Some("ns"), "s1").unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].uid, live.uid().unwrap());
    let gc = report.gc.unwrap();
    assert_eq!(gc.considered, 1);
    assert!(gc.deleted.is_empty());
    assert_eq!(creates(&store), ["Service/s1"]);
}

#[tokio::test]
async fn identical_object_is_not_written() {
    let store = MemStore::new();
    let desired = configmap("cfg", json!({ "k": "v" }));
    let mut live = RawObj::from_value(desired.clone()).unwrap();
    codec::tag_managed(&mut live).unwrap();
    live.set_annotation(GC_TAG, "rel-7");
    let seeded = store.seed(live.into_value()).unwrap();

    let report = Apply::new(config("rel-7"), Arc::new(VecSource(vec![desired])), clients(&store), Arc::new(RecordingSleeper::default()))
        .run()
        .await
        .unwrap();

    assert!(store.writes().is_empty(), "unexpected writes: {:?}", store.writes());
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].uid, seeded.uid().unwrap());
    assert!(report.gc.unwrap().deleted.is_empty());
}

fn upserter(store: &MemStore, sleeper: Arc<RecordingSleeper>) -> DefaultUpserter {
    let catalog = Arc::new(Catalog::new(Arc::new(store.clone())));
    DefaultUpserter::new(catalog, Arc::new(store.clone()), sleeper)
}

fn patch_calls(store: &MemStore) -> usize {
    store.journal().iter().filter(|c| matches!(c, Call::Patch { .. })).count()
}

#[tokio::test]
async fn conflicts_are_retried_until_the_fifth_attempt() {
    let store = MemStore::new();
    let seeded = store.seed(configmap("cfg", json!({ "k": "v1" }))).unwrap();
    store.inject_conflicts("ConfigMap", "cfg", 4);
    let sleeper = Arc::new(RecordingSleeper::default());

    let mut obj = RawObj::from_value(configmap("cfg", json!({ "k": "v2" }))).unwrap();
    obj.set_resource_version(seeded.resource_version());
    let uid = upserter(&store, sleeper.clone()).upsert(&obj).await.unwrap();

    assert_eq!(uid, seeded.uid().unwrap());
    assert_eq!(patch_calls(&store), 5);
    assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![Duration::from_secs(1); 4]);
    assert_eq!(store.object("ConfigMap", Some("default"), "cfg").unwrap().as_value()["data"]["k"], "v2");
}

#[tokio::test]
async fn conflict_retry_is_bounded() {
    let store = MemStore::new();
    store.seed(configmap("cfg", json!({ "k": "v1" }))).unwrap();
    store.inject_conflicts("ConfigMap", "cfg", 10);
    let sleeper = Arc::new(RecordingSleeper::default());

    let obj = RawObj::from_value(configmap("cfg", json!({ "k": "v2" }))).unwrap();
    let err = upserter(&store, sleeper.clone()).upsert(&obj).await.unwrap_err();

    assert!(matches!(err, ApplyError::ApplyConflict { attempts: 5, .. }), "got {err}");
    assert_eq!(patch_calls(&store), 5);
    assert_eq!(sleeper.count(), 4);
}

async fn gc_run(store: &MemStore) -> kfold_apply::ApplyReport {
    for (name, annotations) in [
        ("a", json!({ GC_TAG: "rel-7" })),
        ("b", json!({ GC_TAG: "rel-7", GC_STRATEGY: "ignore" })),
        ("c", json!({ GC_TAG: "rel-6" })),
        ("e", json!({})),
    ] {
        store.seed(annotated(name, annotations)).unwrap();
    }
    let mut owned = annotated("d", json!({ GC_TAG: "rel-7" }));
    owned["metadata"]["ownerReferences"] = json!([{ "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs", "uid": "rs-1", "controller": true }]);
    store.seed(owned).unwrap();

    let source = VecSource(vec![configmap("f", json!({ "k": "f" }))]);
    Apply::new(config("rel-7"), Arc::new(source), clients(store), Arc::new(RecordingSleeper::default())).run().await.unwrap()
}

#[tokio::test]
async fn gc_deletes_only_unseen_auto_objects_with_the_run_tag() {
    let store = MemStore::new();
    let report = gc_run(&store).await;
    let gc = report.gc.unwrap();
    assert_eq!(gc.deleted, ["ConfigMap default/a"]);
    assert_eq!(gc.considered, 6);

    assert!(store.object("ConfigMap", Some("default"), "a").is_none());
    for kept in ["b", "c", "d", "e", "f"] {
        assert!(store.object("ConfigMap", Some("default"), kept).is_some(), "{kept} was collected");
    }
    let deletes: Vec<Call> = store.writes().into_iter().filter(|c| matches!(c, Call::Delete { .. })).collect();
    assert_eq!(deletes.len(), 1);
    let Call::Delete { opts, .. } = &deletes[0] else { unreachable!() };
    assert_eq!(opts.propagation, DeletePropagation::Foreground);
    assert!(opts.precondition_uid.is_some());
}

#[tokio::test]
async fn gc_on_old_servers_uses_legacy_propagation() {
    let store = MemStore::new().with_version(ServerVersion::new(1, 5));
    gc_run(&store).await;
    let opts: Vec<_> = store
        .writes()
        .into_iter()
        .filter_map(|c| match c {
            Call::Delete { opts, .. } => Some(opts.propagation),
            _ => None,
        })
        .collect();
    assert_eq!(opts, [DeletePropagation::LegacyNoOrphan]);
}

#[tokio::test]
async fn gc_treats_vanished_or_replaced_objects_as_collected() {
    let store = MemStore::new();
    store.seed(annotated("gone", json!({ GC_TAG: "rel-7" }))).unwrap();
    store.seed(annotated("replaced", json!({ GC_TAG: "rel-7" }))).unwrap();
    store.seed(annotated("stale", json!({ GC_TAG: "rel-7" }))).unwrap();
    store.fail_delete("ConfigMap", "gone", StoreError::NotFound("ConfigMap default/gone".into()));
    store.fail_delete("ConfigMap", "replaced", StoreError::Conflict("ConfigMap default/replaced: uid precondition failed".into()));

    let source = VecSource(vec![configmap("f", json!({ "k": "f" }))]);
    let report = Apply::new(config("rel-7"), Arc::new(source), clients(&store), Arc::new(RecordingSleeper::default())).run().await.unwrap();

    assert_eq!(report.gc.unwrap().deleted, ["ConfigMap default/stale"]);
    assert!(store.object("ConfigMap", Some("default"), "stale").is_none());
}

#[tokio::test]
async fn gc_aborts_on_other_delete_errors() {
    let store = MemStore::new();
    store.seed(annotated("locked", json!({ GC_TAG: "rel-7" }))).unwrap();
    store.fail_delete("ConfigMap", "locked", StoreError::Api { code: 403, message: "forbidden".into() });

    let source = VecSource(vec![configmap("f", json!({ "k": "f" }))]);
    let err = Apply::new(config("rel-7"), Arc::new(source), clients(&store), Arc::new(RecordingSleeper::default())).run().await.unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Gc));
    assert!(
        matches!(err.root(), ApplyError::GcDelete { object, source: StoreError::Api { code: 403, .. } } if object == "ConfigMap default/locked"),
        "got {err}"
    );
    assert!(store.object("ConfigMap", Some("default"), "locked").is_some());
}
