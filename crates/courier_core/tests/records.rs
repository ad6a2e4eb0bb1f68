use courier_core::{
    fingerprint_stage, ArtifactRecord, StageRunRecord, StageStatus,
};
use serde_json::json;

#[test]
fn record_lifecycle_success() {
    let fp = fingerprint_stage("fetch", &json!({}), &[]);
    let record = StageRunRecord::running("fetch", "demo", fp.clone());
    assert_eq!(record.status, StageStatus::Running);
    assert!(record.finished_at.is_none());

    let record = record.finish_success(vec![ArtifactRecord {
        path: "raw/article.html".into(),
        hash: "ab".into(),
        size: 42,
    }]);
    assert_eq!(record.status, StageStatus::Succeeded);
    assert!(record.finished_at.is_some());
    assert!(record.is_valid_for(&fp));
}

#[test]
fn failed_record_is_never_skippable() {
    let fp = fingerprint_stage("translate", &json!({}), &[]);
    let record =
        StageRunRecord::running("translate", "demo", fp.clone()).finish_failure("quota exceeded");
    assert_eq!(record.status, StageStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("quota exceeded"));
    assert!(!record.is_valid_for(&fp));
}

#[test]
fn stale_fingerprint_is_not_valid() {
    let old = fingerprint_stage("translate", &json!({"model": "small"}), &[]);
    let new = fingerprint_stage("translate", &json!({"model": "large"}), &[]);
    let record = StageRunRecord::running("translate", "demo", old).finish_success(Vec::new());
    assert!(!record.is_valid_for(&new));
}

#[test]
fn record_round_trips_through_json() {
    let fp = fingerprint_stage("publish", &json!({"dry_run": false}), &[]);
    let record = StageRunRecord::running("publish", "demo", fp).finish_success(vec![
        ArtifactRecord {
            path: "receipts/draft.json".into(),
            hash: "cd".into(),
            size: 7,
        },
    ]);
    let encoded = serde_json::to_string(&record).unwrap();
    assert!(encoded.contains("\"status\":\"succeeded\""));
    let decoded: StageRunRecord = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, record);
}
