//! Admission control through the node front door.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cybernode::capacity::NodeCapacity;
use cybernode::consumer::{MockProvisionManager, ProvisionManager};
use cybernode::model::ServiceElement;
use cybernode::runtime::MockRuntime;
use cybernode::{
    Config, Cybernode, InstantiationOutcome, InstantiationRequest, ProvisionError,
    ProvisionEventKind,
};

async fn node_with(config: Config, runtime: Arc<MockRuntime>) -> Arc<Cybernode> {
    Cybernode::with_static_capacity(config, NodeCapacity::default(), runtime)
        .await
        .unwrap()
}

async fn instantiate_concurrently(
    node: &Arc<Cybernode>,
    element: &ServiceElement,
    count: usize,
) -> Vec<Result<InstantiationOutcome, ProvisionError>> {
    let tasks: Vec<_> = (0..count)
        .map(|_| {
            let node = Arc::clone(node);
            let element = element.clone();
            tokio::spawn(async move { node.instantiate(InstantiationRequest::new(element)).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}

#[tokio::test(start_paused = true)]
async fn test_planned_two_with_three_concurrent_requests() {
    let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_millis(200)));
    let node = node_with(Config::default(), runtime).await;
    let element = ServiceElement::new("shop", "cart", 2).with_max_per_machine(2);

    let results = instantiate_concurrently(&node, &element, 3).await;

    let mut instance_ids = BTreeSet::new();
    let mut not_needed = 0;
    for result in results {
        match result.unwrap() {
            InstantiationOutcome::Deployed(deployed) => {
                instance_ids.insert(deployed.instance.instance_id);
            }
            InstantiationOutcome::NotNeeded => not_needed += 1,
        }
    }
    assert_eq!(instance_ids, BTreeSet::from([0, 1]));
    assert_eq!(not_needed, 1);
    assert_eq!(node.in_process_count(&element), 0);
    assert_eq!(node.deployed_services().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_max_per_machine_bounds_concurrent_admissions() {
    let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_millis(200)));
    let node = node_with(Config::default(), runtime.clone()).await;
    let element = ServiceElement::new("shop", "search", 10).with_max_per_machine(3);

    let results = instantiate_concurrently(&node, &element, 8).await;

    let deployed = results
        .iter()
        .filter(|r| matches!(r, Ok(InstantiationOutcome::Deployed(_))))
        .count();
    let rejected = results
        .iter()
        .filter(|r| {
            matches!(r, Err(ProvisionError::MaxPerMachineReached { max: 3, .. }))
        })
        .count();
    assert_eq!(deployed, 3);
    assert_eq!(rejected, 5);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(ProvisionError::is_retryable));
    assert_eq!(runtime.start_count(), 3);
    assert_eq!(node.in_process_count(&element), 0);
}

#[tokio::test]
async fn test_satisfied_element_is_a_no_op() {
    let runtime = Arc::new(MockRuntime::new());
    let node = node_with(Config::default(), runtime.clone()).await;
    let element = ServiceElement::new("shop", "cart", 1);

    let first = node
        .instantiate(InstantiationRequest::new(element.clone()))
        .await
        .unwrap();
    assert!(matches!(first, InstantiationOutcome::Deployed(_)));

    for _ in 0..3 {
        let outcome = node
            .instantiate(InstantiationRequest::new(element.clone()))
            .await
            .unwrap();
        assert!(matches!(outcome, InstantiationOutcome::NotNeeded));
    }
    assert_eq!(runtime.start_count(), 1);
    assert_eq!(node.in_process_count(&element), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_process_count_never_leaks_on_failure() {
    let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_millis(50)));
    runtime.set_failing(Some(false));
    let node = node_with(Config::default(), runtime.clone()).await;
    let element = ServiceElement::new("shop", "flaky", 4);

    let results = instantiate_concurrently(&node, &element, 4).await;
    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, ProvisionError::Instantiation(e) if !e.fatal));
        assert!(err.is_retryable());
    }
    assert_eq!(node.in_process_count(&element), 0);
    assert_eq!(node.container().service_counter(), 0);

    runtime.set_failing(None);
    let results = instantiate_concurrently(&node, &element, 2).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(node.in_process_count(&element), 0);
    assert_eq!(node.deployed_services().len(), 2);
}

#[tokio::test]
async fn test_fatal_load_failure_is_not_retryable() {
    let runtime = Arc::new(MockRuntime::failing(true));
    let node = node_with(Config::default(), runtime).await;

    let err = node
        .instantiate(InstantiationRequest::new(ServiceElement::new("shop", "broken", 1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "instantiation_failed_fatal");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_node_wide_service_limit() {
    let config = Config {
        service_limit: 2,
        ..Config::default()
    };
    let node = node_with(config, Arc::new(MockRuntime::new())).await;
    let cart = ServiceElement::new("shop", "cart", 5);
    let search = ServiceElement::new("shop", "search", 5);

    node.instantiate(InstantiationRequest::new(cart.clone()))
        .await
        .unwrap();
    node.instantiate(InstantiationRequest::new(search.clone()))
        .await
        .unwrap();

    let err = node
        .instantiate(InstantiationRequest::new(cart.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::ServiceLimitReached { total: 3, limit: 2 }
    ));
    assert!(err.is_retryable());
    assert_eq!(node.in_process_count(&cart), 0);
}

#[tokio::test]
async fn test_unknown_event_kind_rejected() {
    let node = node_with(Config::default(), Arc::new(MockRuntime::new())).await;
    let mut request = InstantiationRequest::new(ServiceElement::new("shop", "cart", 1));
    request.event_kind = ProvisionEventKind::Redeploy;

    let err = node.instantiate(request).await.unwrap_err();
    assert!(matches!(err, ProvisionError::UnknownEvent(ref kind) if kind == "redeploy"));
    assert_eq!(node.deployed_services().len(), 0);
}

#[tokio::test]
async fn test_shutdown_refuses_new_requests() {
    let runtime = Arc::new(MockRuntime::new());
    let node = node_with(Config::default(), runtime.clone()).await;
    let element = ServiceElement::new("shop", "cart", 3);
    node.instantiate(InstantiationRequest::new(element.clone()))
        .await
        .unwrap();

    node.shutdown().await;

    let err = node
        .instantiate(InstantiationRequest::new(element))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ShuttingDown));
    assert!(!err.is_retryable());
    assert_eq!(runtime.running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_activation_leaves_nothing_running() {
    let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_secs(5)));
    let node = node_with(Config::default(), runtime.clone()).await;
    let element = ServiceElement::new("shop", "cart", 1);

    let pending = tokio::spawn({
        let node = Arc::clone(&node);
        let element = element.clone();
        async move { node.instantiate(InstantiationRequest::new(element)).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    node.shutdown().await;

    assert!(pending.await.unwrap().is_err());
    assert_eq!(runtime.running_count(), 0);
    assert_eq!(node.container().service_counter(), 0);
    assert_eq!(node.in_process_count(&element), 0);
}

#[tokio::test]
async fn test_monitor_proxy_kept_only_for_successful_activation() {
    let runtime = Arc::new(MockRuntime::failing(false));
    let node = node_with(Config::default(), runtime.clone()).await;
    let manager: Arc<dyn ProvisionManager> = Arc::new(MockProvisionManager::new());
    let element = ServiceElement::new("shop", "cart", 1);

    let request = InstantiationRequest::new(element.clone()).from_orchestrator(Arc::clone(&manager));
    assert!(node.instantiate(request).await.is_err());
    assert_eq!(node.monitor_count(), 0);

    runtime.set_failing(None);
    let request = InstantiationRequest::new(element).from_orchestrator(manager);
    assert!(node.instantiate(request).await.is_ok());
    assert_eq!(node.monitor_count(), 1);
}

#[tokio::test]
async fn test_health_failure_reported_to_orchestrator() {
    let runtime = Arc::new(MockRuntime::new());
    let node = node_with(Config::default(), runtime.clone()).await;
    let manager = Arc::new(MockProvisionManager::new());
    let element = ServiceElement::new("shop", "cart", 1);

    let request = InstantiationRequest::new(element).from_orchestrator(manager.clone());
    let InstantiationOutcome::Deployed(deployed) = node.instantiate(request).await.unwrap() else {
        panic!("expected a deployed service");
    };

    runtime.set_healthy(deployed.instance.id, false);
    assert_eq!(node.container().check_health().await, 1);

    let failures = manager.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].instance.id, deployed.instance.id);
    assert_eq!(failures[0].node_id, node.context().node_id());
    assert!(node.deployed_services().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_health_interval_still_checks() {
    let runtime = Arc::new(MockRuntime::new());
    let config = Config {
        health_check_interval: Duration::ZERO,
        capacity_interval: Duration::ZERO,
        ..Config::default()
    };
    let node = node_with(config, runtime.clone()).await;
    assert_eq!(
        node.context().config().health_check_interval,
        cybernode::config::MIN_JOB_INTERVAL
    );
    node.start().await.unwrap();

    let InstantiationOutcome::Deployed(deployed) = node
        .instantiate(InstantiationRequest::new(ServiceElement::new("shop", "cart", 1)))
        .await
        .unwrap()
    else {
        panic!("expected a deployed service");
    };
    runtime.set_healthy(deployed.instance.id, false);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(node.deployed_services().is_empty());
    node.shutdown().await;
}
