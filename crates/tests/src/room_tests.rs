use confab_services::RoomManager;

use crate::fixtures::test_settings;

#[tokio::test]
async fn concurrent_get_or_create_yields_one_room() {
    let manager = RoomManager::new(test_settings()).await.unwrap();

    let (a, b) = tokio::join!(
        manager.get_or_create_room("shared".to_string(), 0, false),
        manager.get_or_create_room("shared".to_string(), 0, false),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(a.same(&b), "both callers must observe the same room instance");
    assert_eq!(manager.room_count(), 1);
}

#[tokio::test]
async fn sequential_get_or_create_reuses_the_room() {
    let manager = RoomManager::new(test_settings()).await.unwrap();

    let first = manager
        .get_or_create_room("r1".to_string(), 0, false)
        .await
        .unwrap();
    let second = manager
        .get_or_create_room("r1".to_string(), 0, false)
        .await
        .unwrap();
    assert!(first.same(&second));

    let other = manager
        .get_or_create_room("r2".to_string(), 0, false)
        .await
        .unwrap();
    assert!(!first.same(&other));
    assert_eq!(manager.room_count(), 2);
}

#[tokio::test]
async fn pipe_mode_with_one_worker_is_invalid_state() {
    let manager = RoomManager::new(test_settings()).await.unwrap();
    assert_eq!(manager.worker_count(), 1);

    let err = manager
        .get_or_create_room("piped".to_string(), 0, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    assert_eq!(manager.room_count(), 0);
}

#[tokio::test]
async fn pipe_mode_with_two_workers_uses_distinct_routers() {
    let mut settings = test_settings();
    settings.mediasoup.num_workers = 2;
    let manager = RoomManager::new(settings).await.unwrap();

    let room = manager
        .get_or_create_room("piped".to_string(), 0, true)
        .await
        .unwrap();
    assert!(room.pipe_mode());
    assert_ne!(room.producer_router_id(), room.consumer_router_id());

    let plain = manager
        .get_or_create_room("flat".to_string(), 0, false)
        .await
        .unwrap();
    assert_eq!(plain.producer_router_id(), plain.consumer_router_id());
}

#[tokio::test]
async fn capabilities_come_from_the_consumer_router() {
    let manager = RoomManager::new(test_settings()).await.unwrap();
    let room = manager
        .get_or_create_room("caps".to_string(), 0, false)
        .await
        .unwrap();

    let caps = room.router_rtp_capabilities();
    let codecs = caps["codecs"].as_array().expect("codec list");
    assert!(
        codecs
            .iter()
            .any(|codec| codec["mimeType"] == "audio/opus"),
        "router must offer opus"
    );
    assert!(
        codecs
            .iter()
            .any(|codec| codec["mimeType"] == "video/VP8"),
        "router must offer VP8"
    );
}
