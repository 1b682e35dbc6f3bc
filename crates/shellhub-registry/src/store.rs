use std::time::Duration;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::model::{
    CompanionKey, Device, DeviceStatus, Member, Namespace, PrimaryNamespace, PublicKeyFilter, Role, Session,
    SessionType, SshPublicKey, Tag, TagTarget, User,
};

/// How the derived `acceptable` flag is computed when listing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptabilityMode {
    /// True for pending/rejected devices iff a matching tombstone exists.
    FromRemoved,
    /// Always false.
    AsFalse,
    /// True iff the status is not accepted.
    IfNotAccepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSortBy {
    Name,
    LastSeen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct DeviceListQuery {
    pub status: Option<DeviceStatus>,
    /// Substring match on the device name.
    pub name_contains: Option<String>,
    pub sort_by: DeviceSortBy,
    pub order: SortOrder,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
}

impl Default for DeviceListQuery {
    fn default() -> Self {
        Self {
            status: None,
            name_contains: None,
            sort_by: DeviceSortBy::Name,
            order: SortOrder::Asc,
            page: 1,
            per_page: 100,
        }
    }
}

/// Fields of a device row established during authentication.
#[derive(Debug, Clone)]
pub struct DeviceAuthInput {
    pub uid: String,
    pub tenant_id: String,
    pub mac: String,
    pub hostname: String,
    pub public_key_pem: String,
    pub info: crate::model::DeviceInfo,
}

/// New session fields owned by the gateway at creation time.
#[derive(Debug, Clone)]
pub struct SessionInput {
    pub uid: String,
    pub device_uid: String,
    pub tenant_id: String,
    pub username: String,
    pub ip_address: String,
    pub ty: SessionType,
}

/// New public key registration.
#[derive(Debug, Clone)]
pub struct PublicKeyInput {
    pub data: Vec<u8>,
    pub name: String,
    pub username: String,
    /// Tag filters carry tag *names*; they are resolved to ids atomically
    /// at creation time.
    pub filter: PublicKeyFilter,
}

/// Repository contract over the registry collections.
///
/// The accept-merge and the tag-delete broadcast pull are atomic within an
/// implementation.
#[async_trait]
pub trait Store: Send + Sync {
    // ----- devices ----- //

    /// Reuses the accepted row for the same `(tenant, mac)` when present,
    /// otherwise inserts the device as pending. Idempotent in uid.
    async fn device_upsert_by_identity(&self, input: DeviceAuthInput) -> Result<Device, RegistryError>;

    async fn device_get(&self, tenant_id: &str, uid: &str) -> Result<Device, RegistryError>;

    /// Tenant-agnostic lookup used by the internal surface.
    async fn device_get_by_uid(&self, uid: &str) -> Result<Device, RegistryError>;

    /// Resolves `namespace.device` to a device row.
    async fn device_lookup(&self, namespace_name: &str, device_name: &str) -> Result<Device, RegistryError>;

    async fn device_list(
        &self,
        tenant_id: &str,
        query: DeviceListQuery,
        acceptability: AcceptabilityMode,
    ) -> Result<(Vec<Device>, usize), RegistryError>;

    /// Drives the device status state machine, including the accept
    /// precondition and the MAC-merge transaction.
    async fn device_set_status(&self, tenant_id: &str, uid: &str, status: DeviceStatus) -> Result<Device, RegistryError>;

    async fn device_rename(&self, tenant_id: &str, uid: &str, name: &str) -> Result<Device, RegistryError>;

    /// Accepted devices leave a `removed` tombstone; pending and rejected
    /// rows are dropped outright.
    async fn device_delete(&self, tenant_id: &str, uid: &str) -> Result<(), RegistryError>;

    async fn device_set_online(&self, uid: &str, online: bool) -> Result<(), RegistryError>;

    /// Refreshes `last_seen`.
    async fn device_heartbeat(&self, uid: &str) -> Result<(), RegistryError>;

    // ----- namespaces ----- //

    async fn namespace_create(&self, namespace: Namespace) -> Result<Namespace, RegistryError>;

    async fn namespace_get(&self, tenant_id: &str) -> Result<Namespace, RegistryError>;

    async fn namespace_get_by_name(&self, name: &str) -> Result<Namespace, RegistryError>;

    /// Fails `RoleInvalid` unless `inviter_role` strictly dominates the new
    /// member's role; `Duplicated` if already a member.
    async fn namespace_add_member(
        &self,
        tenant_id: &str,
        member: Member,
        inviter_role: Role,
    ) -> Result<Namespace, RegistryError>;

    async fn namespace_update_member_role(
        &self,
        tenant_id: &str,
        user_id: &str,
        role: Role,
        actor_role: Role,
    ) -> Result<Namespace, RegistryError>;

    async fn namespace_remove_member(
        &self,
        tenant_id: &str,
        user_id: &str,
        actor_role: Role,
    ) -> Result<Namespace, RegistryError>;

    // ----- tags ----- //

    async fn tag_create(&self, tenant_id: &str, name: &str) -> Result<Tag, RegistryError>;

    async fn tag_list(&self, tenant_id: &str) -> Result<Vec<Tag>, RegistryError>;

    /// Attaches a tag to a target; the tag must exist.
    async fn tag_push(
        &self,
        tenant_id: &str,
        tag_name: &str,
        target: TagTarget,
        target_id: &str,
    ) -> Result<(), RegistryError>;

    /// Detaches a tag. `target_id = None` is a broadcast pull from every
    /// target of that kind.
    async fn tag_pull(
        &self,
        tenant_id: &str,
        tag_name: &str,
        target: TagTarget,
        target_id: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Pulls the tag from every target kind, then deletes the tag row, in
    /// one transaction.
    async fn tag_delete(&self, tenant_id: &str, name: &str) -> Result<(), RegistryError>;

    // ----- public keys ----- //

    /// Validates the filter, resolves tag names and provisions the
    /// companion keypair, atomically.
    async fn public_key_create(&self, tenant_id: &str, input: PublicKeyInput) -> Result<SshPublicKey, RegistryError>;

    async fn public_key_get(&self, tenant_id: &str, fingerprint: &str) -> Result<SshPublicKey, RegistryError>;

    async fn public_key_list(&self, tenant_id: &str) -> Result<Vec<SshPublicKey>, RegistryError>;

    async fn public_key_update(&self, tenant_id: &str, fingerprint: &str, input: PublicKeyInput)
        -> Result<SshPublicKey, RegistryError>;

    async fn public_key_delete(&self, tenant_id: &str, fingerprint: &str) -> Result<(), RegistryError>;

    /// Policy check for an offered key: filter and username must both match.
    async fn public_key_evaluate(
        &self,
        tenant_id: &str,
        fingerprint: &str,
        username: &str,
        device_uid: &str,
    ) -> Result<bool, RegistryError>;

    /// Companion lookup by the *companion* key's own fingerprint.
    async fn companion_key_get(&self, tenant_id: &str, fingerprint: &str) -> Result<CompanionKey, RegistryError>;

    /// Companion lookup by the registered user key's fingerprint.
    async fn companion_key_for_user_key(
        &self,
        tenant_id: &str,
        user_fingerprint: &str,
    ) -> Result<CompanionKey, RegistryError>;

    // ----- sessions ----- //

    /// Creating an already-known uid is a no-op returning the stored row.
    async fn session_create(&self, input: SessionInput) -> Result<Session, RegistryError>;

    async fn session_get(&self, uid: &str) -> Result<Session, RegistryError>;

    async fn session_list(&self, tenant_id: &str) -> Result<Vec<Session>, RegistryError>;

    async fn session_set_authenticated(&self, uid: &str, authenticated: bool) -> Result<(), RegistryError>;

    /// The session type is only known once the first channel request comes
    /// in (shell, exec, sftp…).
    async fn session_set_type(&self, uid: &str, ty: SessionType) -> Result<(), RegistryError>;

    async fn session_keepalive(&self, uid: &str) -> Result<(), RegistryError>;

    async fn session_close(&self, uid: &str) -> Result<(), RegistryError>;

    /// Closes sessions whose keepalive stopped for longer than `idle`,
    /// returning the swept uids.
    async fn session_sweep_stale(&self, idle: Duration) -> Result<Vec<String>, RegistryError>;

    // ----- users ----- //

    async fn user_create(&self, user: User) -> Result<User, RegistryError>;

    /// Matches either username or email.
    async fn user_get_by_identifier(&self, identifier: &str) -> Result<User, RegistryError>;

    /// The namespace embedded in a freshly issued user token.
    async fn user_primary_namespace(&self, user_id: &str) -> Result<PrimaryNamespace, RegistryError>;
}
