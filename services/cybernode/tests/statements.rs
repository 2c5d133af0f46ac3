//! Placement history recorded by a running node.

use std::path::Path;
use std::sync::Arc;

use cybernode::capacity::NodeCapacity;
use cybernode::model::{RecordType, ServiceElement};
use cybernode::runtime::MockRuntime;
use cybernode::statement::statement_file_name;
use cybernode::{Config, Cybernode, InstantiationOutcome, InstantiationRequest};

async fn durable_node(dir: &Path, config: Config) -> Arc<Cybernode> {
    let config = Config {
        record_dir: Some(dir.to_path_buf()),
        ..config
    };
    Cybernode::with_static_capacity(config, NodeCapacity::default(), Arc::new(MockRuntime::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_durable_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let node_id = config.node_id;
    let element = ServiceElement::new("shop", "cart", 2);

    let node = durable_node(dir.path(), config.clone()).await;
    let InstantiationOutcome::Deployed(deployed) = node
        .instantiate(InstantiationRequest::new(element.clone()))
        .await
        .unwrap()
    else {
        panic!("expected a deployed service");
    };
    assert!(dir
        .path()
        .join(statement_file_name("shop", "cart"))
        .exists());

    let statement = node.statements().get(&element).await.unwrap();
    let active = statement.service_records_for(node_id, Some(RecordType::Active));
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].instance.id, deployed.instance.id);

    assert!(node.terminate_instance(deployed.instance.id).await);
    let statement = node.statements().get(&element).await.unwrap();
    let records = statement.service_records_for(node_id, None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type, RecordType::Inactive);
    assert!(records[0].discarded_at.is_some());
    node.shutdown().await;

    let restarted = durable_node(dir.path(), config).await;
    let all = restarted.statements().get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].element, element);
    assert_eq!(all[0].service_records().len(), 1);
}

#[tokio::test]
async fn test_transient_history_tracks_only_live_elements() {
    let node = Cybernode::with_static_capacity(
        Config::default(),
        NodeCapacity::default(),
        Arc::new(MockRuntime::new()),
    )
    .await
    .unwrap();
    let cart = ServiceElement::new("shop", "cart", 1);
    let search = ServiceElement::new("shop", "search", 1);

    node.instantiate(InstantiationRequest::new(cart.clone()))
        .await
        .unwrap();
    let InstantiationOutcome::Deployed(deployed) = node
        .instantiate(InstantiationRequest::new(search.clone()))
        .await
        .unwrap()
    else {
        panic!("expected a deployed service");
    };
    assert_eq!(node.statements().get_all().await.len(), 2);

    node.terminate_instance(deployed.instance.id).await;

    assert!(node.statements().get(&search).await.is_none());
    assert!(node.statements().get(&cart).await.is_some());
}
