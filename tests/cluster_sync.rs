mod common;

use std::time::Duration;

use data_connector::{DatasourceId, DatasourceRegistry, DatasourceRow};
use dse::{datasource::DatasourceRequest, DseError};
use serde_json::json;

use common::{eventually, test_config, Cluster, AB_DRIVER_ID};

const CONVERGE: Duration = Duration::from_secs(2);

fn ab_row(name: &str) -> DatasourceRow {
    DatasourceRow {
        id: DatasourceId::generate(),
        name: name.to_string(),
        driver: AB_DRIVER_ID.to_string(),
        description: None,
        enabled: true,
        config: Some(r#"{"a": "1"}"#.to_string()),
    }
}

#[tokio::test]
async fn peers_follow_create_and_delete() {
    let mut cluster = Cluster::new();
    let manager = cluster.launch_node("n1").await.ds_manager.clone();
    let n1 = cluster.nodes[0].node.clone();
    let n2 = cluster.launch_node("n2").await.node.clone();

    let record = manager
        .add_datasource(
            &DatasourceRequest::new("x", AB_DRIVER_ID).with_config([("a", "1")]),
            true,
        )
        .await
        .unwrap();
    assert!(n1.service_object("x").is_some());
    assert!(eventually(CONVERGE, || n2.service_object("x").is_some()).await);

    manager
        .delete_datasource(&DatasourceId::from(record.id.as_str()), true)
        .await
        .unwrap();
    assert!(n1.service_object("x").is_none());
    assert!(eventually(CONVERGE, || n2.service_object("x").is_none()).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn late_node_picks_up_existing_records() {
    let mut cluster = Cluster::new();
    cluster.registry.add_datasource(ab_row("early")).await.unwrap();
    let mut disabled = ab_row("dormant");
    disabled.enabled = false;
    cluster.registry.add_datasource(disabled).await.unwrap();

    let node = cluster.launch_node("n1").await.node.clone();
    assert!(node.service_object("early").is_some());
    assert!(node.service_object("dormant").is_none());

    let status = node
        .invoke_node_rpc("n1", "get_status", json!({}))
        .await
        .unwrap();
    let services: Vec<String> = serde_json::from_value(status["services"].clone()).unwrap();
    assert!(services.iter().any(|s| s == "early"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn node_rpc_triggers_reconciliation() {
    let mut cluster = Cluster::new();
    let n1 = cluster.launch_node("n1").await.node.clone();
    let n2 = cluster.launch_node("n2").await.node.clone();

    let row = ab_row("direct");
    let ds_id = row.id.clone();
    cluster.registry.add_datasource(row).await.unwrap();
    assert!(n2.service_object("direct").is_none());

    n1.invoke_node_rpc("n2", "synchronize_datasources", json!({}))
        .await
        .unwrap();
    assert!(n2.service_object("direct").is_some());
    assert!(n1.service_object("direct").is_none());

    // Same name, new id: the running service is replaced.
    cluster.registry.delete_datasource(&ds_id).await.unwrap();
    let replacement = ab_row("direct");
    let new_id = replacement.id.clone();
    cluster.registry.add_datasource(replacement).await.unwrap();
    n2.synchronize_datasources().await.unwrap();

    let status = n2
        .invoke_service_rpc("direct", "get_status", json!({}))
        .await
        .unwrap();
    assert_eq!(status["ds_id"], new_id.0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn stopped_peer_does_not_block_creation() {
    let mut cluster = Cluster::new();
    let manager = cluster.launch_node("n1").await.ds_manager.clone();
    let n2 = cluster.launch_node("n2").await.node.clone();
    n2.stop().await.unwrap();
    n2.wait().await;

    manager
        .add_datasource(
            &DatasourceRequest::new("x", AB_DRIVER_ID).with_config([("a", "1")]),
            true,
        )
        .await
        .unwrap();
    assert!(cluster.nodes[0].node.service_object("x").is_some());

    cluster.nodes[0].shutdown().await.unwrap();
}

#[tokio::test]
async fn periodic_resync_heals_without_a_trigger() {
    let mut cluster = Cluster::new();
    let mut config = test_config("n1");
    config.datasources.resync_interval_secs = 1;
    let node = cluster.launch(config).await.node.clone();

    // Written behind the manager's back: no broadcast announces it.
    cluster.registry.add_datasource(ab_row("quiet")).await.unwrap();
    assert!(node.service_object("quiet").is_none());
    assert!(eventually(Duration::from_secs(3), || node.service_object("quiet").is_some()).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_creates_of_one_name_pick_a_single_winner() {
    let mut cluster = Cluster::new();
    let m1 = cluster.launch_node("n1").await.ds_manager.clone();
    let m2 = cluster.launch_node("n2").await.ds_manager.clone();

    let request = DatasourceRequest::new("shared", AB_DRIVER_ID).with_config([("a", "1")]);
    let (r1, r2) = tokio::join!(
        m1.add_datasource(&request, true),
        m2.add_datasource(&request, true)
    );

    let (winner, loser) = match (r1, r2) {
        (Ok(record), Err(e)) | (Err(e), Ok(record)) => (record, e),
        (a, b) => panic!("expected exactly one success, got {a:?} and {b:?}"),
    };
    assert!(matches!(loser, DseError::DatasourceNameInUse(ref name) if name == "shared"));

    let rows = cluster.registry.get_datasources().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id.0, winner.id);

    let n1 = cluster.nodes[0].node.clone();
    let n2 = cluster.nodes[1].node.clone();
    assert!(eventually(CONVERGE, || {
        n1.service_object("shared").is_some() && n2.service_object("shared").is_some()
    })
    .await);

    cluster.shutdown().await;
}
