mod common;

use common::within;
use ra_mutex::{Error, Node, NodeConfig, Phase};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn tcp_config(address: &str, group: &[String]) -> NodeConfig {
    let mut config = NodeConfig::new(address, group.to_vec());
    config.call_timeout_ms = 500;
    config.connect_timeout_ms = 200;
    config.connect_backoff_ms = 20;
    config.health_interval_ms = 100;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_take_turns_over_tcp() {
    let group: Vec<String> = (0..3).map(|_| free_address()).collect();

    let mut nodes = Vec::new();
    for address in &group {
        nodes.push(Node::start(tcp_config(address, &group)).await.unwrap());
    }
    for node in &nodes {
        within(node.wait_for_peers(2)).await;
    }

    let inside = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = nodes
        .iter()
        .map(|node| {
            let coordinator = Arc::clone(node.coordinator());
            let inside = inside.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    let section = coordinator.lock().await.unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    section.release().await.unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        within(worker).await.unwrap();
    }
    for node in &nodes {
        assert_eq!(node.coordinator().phase().await, Phase::Idle);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_node_is_treated_as_replied() {
    let group: Vec<String> = (0..2).map(|_| free_address()).collect();

    let a = Node::start(tcp_config(&group[0], &group)).await.unwrap();
    let mut b = Node::start(tcp_config(&group[1], &group)).await.unwrap();
    within(a.wait_for_peers(1)).await;

    b.shutdown();
    drop(b);

    within(a.coordinator().request_access()).await.unwrap();
    a.coordinator().exit_cs().await.unwrap();
}

#[tokio::test]
async fn taken_address_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let result = Node::start(tcp_config(&address, &[address.clone(), free_address()])).await;
    assert!(matches!(result, Err(Error::Bind { .. })));
}
