//! Status patch construction.

use serde_json::json;

use entando_k8s_operator::k8s::merge_diff;

#[test]
fn test_merge_diff_nulls_removed_keys() {
    let old = json!({ "podPhases": { "old-pod": "Running" }, "serviceName": "svc" });
    let new = json!({ "podPhases": { "new-pod": "Pending" }, "serviceName": "svc" });
    assert_eq!(
        merge_diff(&old, &new),
        json!({ "podPhases": { "old-pod": null, "new-pod": "Pending" }, "serviceName": "svc" })
    );
}

#[test]
fn test_merge_diff_clears_a_recovered_failure() {
    let old = json!({ "qualifier": "server", "entandoControllerFailure": { "message": "boom" } });
    let new = json!({ "qualifier": "server" });
    assert_eq!(
        merge_diff(&old, &new),
        json!({ "qualifier": "server", "entandoControllerFailure": null })
    );
}

#[test]
fn test_merge_diff_replaces_scalars_and_arrays() {
    assert_eq!(merge_diff(&json!([1, 2]), &json!([3])), json!([3]));
    assert_eq!(merge_diff(&json!({ "a": 1 }), &json!(2)), json!(2));
}
