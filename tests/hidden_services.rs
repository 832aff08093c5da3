//! Hidden service integration tests

mod common;

use fog_onion::{
    HiddenServiceDescriptor, OnionAddress, OnionError, OnionRouter, RouterConfig,
    RENDEZVOUS_PURPOSE,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn web_ports() -> BTreeMap<u16, u16> {
    BTreeMap::from([(80, 8080), (443, 8443)])
}

#[tokio::test]
async fn create_and_connect() {
    let router = common::ready_router().await;

    let service = router.create_hidden_service(web_ports()).await.expect("service");
    let address = service.address();
    assert!(address.ends_with(".fog"));
    assert_eq!(service.introduction_points.len(), 3);
    assert_eq!(service.ports.len(), 2);
    assert!(!service.public_key.is_empty());
    assert_eq!(router.hidden_service_count().await, 1);

    let handle = router
        .connect_to_hidden_service(&address)
        .await
        .expect("rendezvous circuit");
    {
        let circuit = handle.lock().await;
        assert_eq!(circuit.purpose, RENDEZVOUS_PURPOSE);
        assert!(circuit.is_hidden_service);
        assert_eq!(circuit.rendezvous_cookie.map(|c| c.len()), Some(20));
        assert_eq!(circuit.hop_count(), router.config().circuit.default_path_length);
    }
    assert!(router.send_data(handle.id(), b"GET / HTTP/1.1").await);

    // Addresses are case insensitive
    let again = router
        .connect_to_hidden_service(&address.to_uppercase())
        .await
        .expect("second circuit");
    assert_ne!(again.id(), handle.id());

    let first = handle.lock().await.rendezvous_cookie;
    let second = again.lock().await.rendezvous_cookie;
    assert_ne!(first, second);
}

#[tokio::test]
async fn unknown_or_malformed_addresses() {
    let router = common::ready_router().await;
    router.create_hidden_service(web_ports()).await.unwrap();

    let unknown = OnionAddress::from_public_key([42u8; 32]).to_string();
    let err = router.try_connect_to_hidden_service(&unknown).await.unwrap_err();
    assert!(matches!(err, OnionError::UnknownService(_)));

    assert!(router.connect_to_hidden_service("not-an-address").await.is_none());
    assert!(router.connect_to_hidden_service("example.onion").await.is_none());
    assert!(router.circuit_ids().await.is_empty());
}

#[tokio::test]
async fn creation_requires_ports_and_relays() {
    common::init_logging();
    let source = Arc::new(common::SwappableDirectory::new(common::network(2, 2, 2)));
    let router = OnionRouter::new(RouterConfig::default(), source).unwrap();

    // No directory yet
    let err = router.try_create_hidden_service(web_ports()).await.unwrap_err();
    assert!(err.is_topology_failure());

    assert!(router.fetch_consensus().await);
    assert!(router.create_hidden_service(BTreeMap::new()).await.is_none());
    assert_eq!(router.hidden_service_count().await, 0);
}

#[tokio::test]
async fn vanished_intro_points_block_connection() {
    common::init_logging();
    let source = Arc::new(common::SwappableDirectory::new(common::network(2, 2, 2)));
    let router = OnionRouter::new(RouterConfig::default(), source.clone()).unwrap();
    assert!(router.fetch_consensus().await);

    let service = router.create_hidden_service(web_ports()).await.unwrap();

    // A fresh directory with entirely new relays (same shapes, new names)
    let replacement = vec![
        common::relay("g-new", "Guard", true),
        common::relay("m-new", "Middle", true),
        common::relay("m-new-2", "Middle", true),
        common::relay("e-new", "Exit", true),
    ];
    source.replace(replacement).await;
    assert!(router.fetch_consensus().await);

    let err = router
        .try_connect_to_hidden_service(&service.address())
        .await
        .unwrap_err();
    assert!(matches!(err, OnionError::NoIntroductionPoints(_)));
    assert!(router.circuit_ids().await.is_empty());
}

#[tokio::test]
async fn remove_and_lookup() {
    let router = common::ready_router().await;
    let service = router.create_hidden_service(web_ports()).await.unwrap();

    let found = router.hidden_service(&service.service_id).await.unwrap();
    assert_eq!(found.address(), service.address());

    assert!(router.remove_hidden_service(&service.service_id).await);
    assert!(!router.remove_hidden_service(&service.service_id).await);
    assert!(router.connect_to_hidden_service(&service.address()).await.is_none());
    assert_eq!(router.get_stats().await.hidden_services, 0);
}

#[tokio::test]
async fn descriptor_is_signed_by_service_key() {
    let router = common::ready_router().await;
    let service = router.create_hidden_service(web_ports()).await.unwrap();

    let json = service.descriptor().unwrap().to_json().unwrap();
    let descriptor = HiddenServiceDescriptor::from_json(&json).unwrap();
    descriptor.verify().unwrap();
    assert_eq!(descriptor.virtual_ports, vec![80, 443]);
    assert_eq!(descriptor.introduction_points.len(), 3);

    // Never leaks the private key
    assert!(!json.contains("private"));
}
