#![allow(clippy::unwrap_used)]

use std::time::Duration;

use base64::Engine as _;
use shellhub_registry::{
    AcceptabilityMode, Billing, DeviceAuthInput, DeviceInfo, DeviceListQuery, DeviceStatus, Member, MemberStatus,
    MemoryStore, Namespace, NamespaceSettings, PublicKeyFilter, PublicKeyInput, RegistryError, Role, SessionInput,
    SessionType, Store, TagTarget, User,
};
use time::OffsetDateTime;

const TENANT: &str = "00000000-0000-4000-0000-000000000000";

fn member(user_id: &str, role: Role) -> Member {
    Member {
        user_id: user_id.to_owned(),
        role,
        status: MemberStatus::Accepted,
        added_at: OffsetDateTime::now_utc(),
        expires_at: None,
    }
}

fn namespace(max_devices: i64) -> Namespace {
    Namespace {
        tenant_id: TENANT.to_owned(),
        name: "testspace".to_owned(),
        owner: "user-owner".to_owned(),
        members: vec![member("user-owner", Role::Owner)],
        settings: NamespaceSettings::default(),
        max_devices,
        billing: None,
    }
}

fn auth_input(uid: &str, mac: &str, hostname: &str) -> DeviceAuthInput {
    DeviceAuthInput {
        uid: uid.to_owned(),
        tenant_id: TENANT.to_owned(),
        mac: mac.to_owned(),
        hostname: hostname.to_owned(),
        public_key_pem: "-----BEGIN PUBLIC KEY-----".to_owned(),
        info: DeviceInfo::default(),
    }
}

fn authorized_key(unique: &str) -> Vec<u8> {
    let blob = base64::engine::general_purpose::STANDARD.encode(format!("fake-wire-{unique}"));
    format!("ssh-rsa {blob} ci@example").into_bytes()
}

async fn store_with_namespace(max_devices: i64) -> MemoryStore {
    let store = MemoryStore::new();
    store.namespace_create(namespace(max_devices)).await.unwrap();
    store
}

#[tokio::test]
async fn register_then_accept() {
    let store = store_with_namespace(-1).await;

    let device = store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Pending);
    assert_eq!(device.name, "dev01");

    let accepted = store
        .device_set_status(TENANT, "uid-1", DeviceStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(accepted.status, DeviceStatus::Accepted);

    // Idempotent in uid: the same identity comes back with the same row.
    let again = store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    assert_eq!(again.uid, "uid-1");
    assert_eq!(again.status, DeviceStatus::Accepted);
}

#[tokio::test]
async fn duplicate_name_on_accept_is_refused() {
    let store = store_with_namespace(-1).await;

    store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    store
        .device_set_status(TENANT, "uid-1", DeviceStatus::Accepted)
        .await
        .unwrap();

    store
        .device_upsert_by_identity(auth_input("uid-2", "02:42:ac:11:00:03", "dev01"))
        .await
        .unwrap();

    let error = store
        .device_set_status(TENANT, "uid-2", DeviceStatus::Accepted)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::duplicated(["name"]));
}

#[tokio::test]
async fn accepting_a_same_mac_device_merges() {
    let store = store_with_namespace(-1).await;

    // Two pending rows with the same MAC: the device re-registered under a
    // fresh uid (key rotation changes the identity tuple).
    store
        .device_upsert_by_identity(auth_input("uid-old", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    store
        .device_upsert_by_identity(auth_input("uid-new", "02:42:ac:11:00:02", "dev01-rotated"))
        .await
        .unwrap();

    store
        .device_set_status(TENANT, "uid-old", DeviceStatus::Accepted)
        .await
        .unwrap();

    store
        .session_create(SessionInput {
            uid: "sess-1".to_owned(),
            device_uid: "uid-old".to_owned(),
            tenant_id: TENANT.to_owned(),
            username: "root".to_owned(),
            ip_address: "10.0.0.1".to_owned(),
            ty: SessionType::Shell,
        })
        .await
        .unwrap();

    // Accepting the rotated row merges: sessions transfer, the old name is
    // kept, the old row disappears.
    let merged = store
        .device_set_status(TENANT, "uid-new", DeviceStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(merged.name, "dev01");
    assert_eq!(merged.status, DeviceStatus::Accepted);

    assert!(store.device_get(TENANT, "uid-old").await.is_err());

    let session = store.session_get("sess-1").await.unwrap();
    assert_eq!(session.device_uid, "uid-new");
}

#[tokio::test]
async fn quota_limits_and_tombstones() {
    let store = store_with_namespace(1).await;

    store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    store
        .device_set_status(TENANT, "uid-1", DeviceStatus::Accepted)
        .await
        .unwrap();

    store
        .device_upsert_by_identity(auth_input("uid-2", "02:42:ac:11:00:03", "dev02"))
        .await
        .unwrap();

    let error = store
        .device_set_status(TENANT, "uid-2", DeviceStatus::Accepted)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::Limit { limit: 1 });

    // Deleting the accepted device leaves a tombstone and frees the slot.
    store.device_delete(TENANT, "uid-1").await.unwrap();
    store
        .device_set_status(TENANT, "uid-2", DeviceStatus::Accepted)
        .await
        .unwrap();

    // The quota is full again, but the tombstone's MAC re-registering may
    // consume the tombstone slot.
    store
        .device_upsert_by_identity(auth_input("uid-3", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();
    let accepted = store
        .device_set_status(TENANT, "uid-3", DeviceStatus::Accepted)
        .await
        .unwrap();
    assert_eq!(accepted.status, DeviceStatus::Accepted);

    // A MAC without a tombstone still hits the limit.
    store
        .device_upsert_by_identity(auth_input("uid-4", "02:42:ac:11:00:04", "dev04"))
        .await
        .unwrap();
    let error = store
        .device_set_status(TENANT, "uid-4", DeviceStatus::Accepted)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::Limit { limit: 1 });
}

#[tokio::test]
async fn metered_namespaces_ask_for_payment() {
    let store = MemoryStore::new();
    let mut ns = namespace(0);
    ns.billing = Some(Billing { active: true });
    store.namespace_create(ns).await.unwrap();

    store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();

    let error = store
        .device_set_status(TENANT, "uid-1", DeviceStatus::Accepted)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::Payment);
}

#[tokio::test]
async fn acceptability_modes() {
    let store = store_with_namespace(-1).await;

    store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();

    let (devices, _) = store
        .device_list(TENANT, DeviceListQuery::default(), AcceptabilityMode::IfNotAccepted)
        .await
        .unwrap();
    assert!(devices[0].acceptable);

    let (devices, _) = store
        .device_list(TENANT, DeviceListQuery::default(), AcceptabilityMode::AsFalse)
        .await
        .unwrap();
    assert!(!devices[0].acceptable);

    // FromRemoved: only acceptable once a matching tombstone exists.
    let (devices, _) = store
        .device_list(TENANT, DeviceListQuery::default(), AcceptabilityMode::FromRemoved)
        .await
        .unwrap();
    assert!(!devices[0].acceptable);

    store
        .device_upsert_by_identity(auth_input("uid-2", "02:42:ac:11:00:02", "dev01b"))
        .await
        .unwrap();
    store
        .device_set_status(TENANT, "uid-2", DeviceStatus::Accepted)
        .await
        .unwrap();
    store.device_delete(TENANT, "uid-2").await.unwrap();

    let (devices, _) = store
        .device_list(
            TENANT,
            DeviceListQuery {
                status: Some(DeviceStatus::Pending),
                ..DeviceListQuery::default()
            },
            AcceptabilityMode::FromRemoved,
        )
        .await
        .unwrap();
    assert!(devices[0].acceptable);
}

#[tokio::test]
async fn role_authority_is_enforced() {
    let store = store_with_namespace(-1).await;

    // An operator may not add an administrator.
    let error = store
        .namespace_add_member(TENANT, member("user-2", Role::Administrator), Role::Operator)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::RoleInvalid);

    // Nor a peer operator.
    let error = store
        .namespace_add_member(TENANT, member("user-2", Role::Operator), Role::Operator)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::RoleInvalid);

    // The owner may.
    store
        .namespace_add_member(TENANT, member("user-2", Role::Administrator), Role::Owner)
        .await
        .unwrap();

    // Duplicates are refused.
    let error = store
        .namespace_add_member(TENANT, member("user-2", Role::Observer), Role::Owner)
        .await
        .unwrap_err();
    assert!(matches!(error, RegistryError::Duplicated { .. }));

    // An administrator cannot touch the owner.
    let error = store
        .namespace_remove_member(TENANT, "user-owner", Role::Administrator)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::RoleInvalid);

    // Role updates need authority over both the current and target role.
    let error = store
        .namespace_update_member_role(TENANT, "user-2", Role::Observer, Role::Administrator)
        .await
        .unwrap_err();
    assert_eq!(error, RegistryError::RoleInvalid);

    store
        .namespace_update_member_role(TENANT, "user-2", Role::Observer, Role::Owner)
        .await
        .unwrap();
}

#[tokio::test]
async fn tag_lifecycle_and_broadcast_delete() {
    let store = store_with_namespace(-1).await;

    store
        .device_upsert_by_identity(auth_input("uid-1", "02:42:ac:11:00:02", "dev01"))
        .await
        .unwrap();

    store.tag_create(TENANT, "production").await.unwrap();

    // Pushing an unknown tag fails.
    let error = store
        .tag_push(TENANT, "staging", TagTarget::Device, "uid-1")
        .await
        .unwrap_err();
    assert!(matches!(error, RegistryError::NotFound { .. }));

    store
        .tag_push(TENANT, "production", TagTarget::Device, "uid-1")
        .await
        .unwrap();

    let device = store.device_get(TENANT, "uid-1").await.unwrap();
    assert_eq!(device.tag_ids.len(), 1);

    // A public key filtered on the tag resolves the name to the id.
    let key = store
        .public_key_create(
            TENANT,
            PublicKeyInput {
                data: authorized_key("key-1"),
                name: "ci".to_owned(),
                username: ".*".to_owned(),
                filter: PublicKeyFilter::Tags {
                    tags: vec!["production".to_owned()],
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(key.filter, PublicKeyFilter::Tags { tags: device.tag_ids.clone() });

    assert!(store
        .public_key_evaluate(TENANT, &key.fingerprint, "root", "uid-1")
        .await
        .unwrap());

    // Deleting the tag pulls it from devices and keys atomically.
    store.tag_delete(TENANT, "production").await.unwrap();

    let device = store.device_get(TENANT, "uid-1").await.unwrap();
    assert!(device.tag_ids.is_empty());

    assert!(!store
        .public_key_evaluate(TENANT, &key.fingerprint, "root", "uid-1")
        .await
        .unwrap());

    assert!(store.tag_list(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn public_keys_provision_companions() {
    let store = store_with_namespace(-1).await;

    let key = store
        .public_key_create(
            TENANT,
            PublicKeyInput {
                data: authorized_key("key-1"),
                name: "ci".to_owned(),
                username: ".*".to_owned(),
                filter: PublicKeyFilter::Hostname {
                    hostname: ".*".to_owned(),
                },
            },
        )
        .await
        .unwrap();

    let companion = store
        .companion_key_for_user_key(TENANT, &key.fingerprint)
        .await
        .unwrap();
    assert_eq!(companion.user_fingerprint, key.fingerprint);
    assert_ne!(companion.fingerprint, key.fingerprint);
    assert!(companion.private_pem.contains("PRIVATE KEY"));

    // And it resolves by its own fingerprint too.
    let by_own = store
        .companion_key_get(TENANT, &companion.fingerprint)
        .await
        .unwrap();
    assert_eq!(by_own.user_fingerprint, key.fingerprint);

    // Deleting the key drops the companion.
    store.public_key_delete(TENANT, &key.fingerprint).await.unwrap();
    assert!(store
        .companion_key_for_user_key(TENANT, &key.fingerprint)
        .await
        .is_err());
}

#[tokio::test]
async fn session_lifecycle_and_sweep() {
    let store = store_with_namespace(-1).await;

    let session = store
        .session_create(SessionInput {
            uid: "sess-1".to_owned(),
            device_uid: "uid-1".to_owned(),
            tenant_id: TENANT.to_owned(),
            username: "root".to_owned(),
            ip_address: "10.0.0.1".to_owned(),
            ty: SessionType::Shell,
        })
        .await
        .unwrap();
    assert!(!session.authenticated);
    assert!(session.closed_at.is_none());

    store.session_set_authenticated("sess-1", true).await.unwrap();
    store.session_keepalive("sess-1").await.unwrap();

    // Not stale yet.
    let swept = store.session_sweep_stale(Duration::from_secs(60)).await.unwrap();
    assert!(swept.is_empty());

    // With a zero idle threshold the session is immediately stale.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let swept = store.session_sweep_stale(Duration::from_millis(1)).await.unwrap();
    assert_eq!(swept, vec!["sess-1".to_owned()]);

    // Closed sessions are never resurrected.
    assert!(store.session_keepalive("sess-1").await.is_err());

    let session = store.session_get("sess-1").await.unwrap();
    assert!(session.closed_at.is_some());
}

#[tokio::test]
async fn users_and_primary_namespace() {
    let store = store_with_namespace(-1).await;

    store
        .user_create(User {
            id: "user-owner".to_owned(),
            username: "gustavo".to_owned(),
            email: "gustavo@example.com".to_owned(),
            password_hash: pwhash_fixture(),
        })
        .await
        .unwrap();

    let by_name = store.user_get_by_identifier("gustavo").await.unwrap();
    let by_email = store.user_get_by_identifier("gustavo@example.com").await.unwrap();
    assert_eq!(by_name.id, by_email.id);

    let primary = store.user_primary_namespace("user-owner").await.unwrap();
    assert_eq!(primary.tenant_id, TENANT);
    assert_eq!(primary.role, Role::Owner);
    assert_eq!(primary.name, "testspace");
}

fn pwhash_fixture() -> String {
    "$6$fixture$xyz".to_owned()
}
