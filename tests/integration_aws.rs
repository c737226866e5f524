//! AWS Secrets Manager integration tests using LocalStack.
//!
//! These tests require LocalStack to be running on localhost:4566.
//!
//! Run with:
//!   docker run -d -p 4566:4566 localstack/localstack
//!   cargo test --test integration_aws --features aws -- --ignored
//!
//! Or run in CI where LocalStack is configured as a service.

#![cfg(feature = "aws")]

use aws_sdk_secretsmanager::Client;
use slotmux::secrets::{aws::AwsSecretStore, SecretStore};
use slotmux::{AdminCredential, Config, DbCredential, RotationError, Slot, SlotSecret};

fn endpoint() -> String {
    std::env::var("LOCALSTACK_ENDPOINT").unwrap_or_else(|_| "http://localhost:4566".to_string())
}

fn set_test_credentials() {
    std::env::set_var("AWS_ACCESS_KEY_ID", "test");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");
    std::env::set_var("AWS_REGION", "us-east-1");
}

async fn raw_client() -> Client {
    set_test_credentials();
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new("us-east-1"))
        .endpoint_url(endpoint())
        .load()
        .await;
    Client::new(&sdk_config)
}

async fn create_secret(client: &Client, name: &str, value: &str) {
    client
        .create_secret()
        .name(name)
        .secret_string(value)
        .send()
        .await
        .expect("Failed to create secret");
}

async fn delete_secret(client: &Client, name: &str) {
    client
        .delete_secret()
        .secret_id(name)
        .force_delete_without_recovery(true)
        .send()
        .await
        .ok();
}

async fn setup_store(slot_id: &str, admin_id: &str) -> AwsSecretStore {
    set_test_credentials();
    let config = Config::new(slot_id, admin_id)
        .with_region("us-east-1")
        .with_secrets_endpoint(endpoint());

    let mut store = AwsSecretStore::new(&config);
    store.init().await.expect("Failed to initialize store");
    store
}

#[tokio::test]
#[ignore] // Run only when LocalStack is available
async fn test_aws_slot_secret_read_modify_write() {
    let client = raw_client().await;
    let (slot_id, admin_id) = ("test-slots-rmw", "test-admin-rmw");
    create_secret(
        &client,
        slot_id,
        r#"{"active_slot":"A","A":{"username":"openemr_a","password":"p1","host":"db","port":3306,"dbname":"openemr"},"B":{"username":"openemr_b","password":"p2","host":"db","port":"3306","dbname":"openemr"},"owner":"platform"}"#,
    )
    .await;

    let store = setup_store(slot_id, admin_id).await;
    let mut secret = store.read_slot_secret().await.expect("Failed to read slot secret");
    assert_eq!(secret.active_slot, Slot::A);
    assert_eq!(secret.b.port, 3306);

    secret.active_slot = Slot::B;
    secret.stale_slot = Some(Slot::A);
    store
        .write_slot_secret(&secret)
        .await
        .expect("Failed to write slot secret");

    let reread = store.read_slot_secret().await.expect("Failed to re-read slot secret");
    assert_eq!(reread, secret);
    assert_eq!(reread.extra["owner"], "platform");

    delete_secret(&client, slot_id).await;
}

#[tokio::test]
#[ignore]
async fn test_aws_admin_secret_round_trip() {
    let client = raw_client().await;
    let (slot_id, admin_id) = ("test-slots-admin", "test-admin-admin");
    create_secret(
        &client,
        admin_id,
        r#"{"username":"admin","password":"root-pw","engine":"mysql"}"#,
    )
    .await;

    let store = setup_store(slot_id, admin_id).await;
    let admin = store.read_admin_secret().await.expect("Failed to read admin secret");
    assert_eq!(admin.username, "admin");
    assert_eq!(admin.host, "");

    let rotated = admin.with_password("n3w-pw");
    store
        .write_admin_secret(&rotated)
        .await
        .expect("Failed to write admin secret");

    let reread: AdminCredential = store.read_admin_secret().await.unwrap();
    assert_eq!(reread.password, "n3w-pw");
    assert_eq!(reread.extra["engine"], "mysql");

    delete_secret(&client, admin_id).await;
}

#[tokio::test]
#[ignore]
async fn test_aws_missing_secret_is_not_retryable() {
    let store = setup_store("test-slots-missing", "test-admin-missing").await;

    let err = store.read_slot_secret().await.unwrap_err();
    assert!(matches!(err, RotationError::SecretUnavailable { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
#[ignore]
async fn test_aws_write_then_read_new_secret() {
    let client = raw_client().await;
    let (slot_id, admin_id) = ("test-slots-new", "test-admin-new");
    create_secret(&client, slot_id, "{}").await;

    let store = setup_store(slot_id, admin_id).await;
    let secret = SlotSecret::new(
        Slot::A,
        DbCredential::new("openemr_a", "p1", "db", 3306, "openemr"),
        DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"),
    );
    store.write_slot_secret(&secret).await.unwrap();

    assert_eq!(store.read_slot_secret().await.unwrap(), secret);

    delete_secret(&client, slot_id).await;
}
