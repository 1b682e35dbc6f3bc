//! In-memory reference implementation of the [`Store`] contract.
//!
//! Every operation runs under one lock, which is what makes the merge and
//! broadcast operations transactional here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::model::{
    validate_device_name, CompanionKey, Device, DeviceIdentity, DeviceStatus, Member, MemberStatus, Namespace,
    PrimaryNamespace, PublicKeyFilter, Role, Session, SshPublicKey, Tag, TagTarget, User,
};
use crate::store::{
    AcceptabilityMode, DeviceAuthInput, DeviceListQuery, DeviceSortBy, PublicKeyInput, SessionInput, SortOrder, Store,
};

#[derive(Default)]
struct Collections {
    devices: HashMap<String, Device>,
    namespaces: HashMap<String, Namespace>,
    tags: HashMap<String, Tag>,
    public_keys: HashMap<(String, String), SshPublicKey>,
    companion_keys: HashMap<(String, String), CompanionKey>,
    sessions: HashMap<String, Session>,
    users: HashMap<String, User>,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collections {
    fn namespace(&self, tenant_id: &str) -> Result<&Namespace, RegistryError> {
        self.namespaces
            .get(tenant_id)
            .ok_or_else(|| RegistryError::not_found(tenant_id))
    }

    fn device(&self, tenant_id: &str, uid: &str) -> Result<&Device, RegistryError> {
        self.devices
            .get(uid)
            .filter(|device| device.tenant_id == tenant_id)
            .ok_or_else(|| RegistryError::not_found(uid))
    }

    fn accepted_count(&self, tenant_id: &str) -> usize {
        self.devices
            .values()
            .filter(|device| device.tenant_id == tenant_id && device.status == DeviceStatus::Accepted)
            .count()
    }

    fn tombstone_for(&self, tenant_id: &str, mac: &str) -> Option<String> {
        self.devices
            .values()
            .find(|device| {
                device.tenant_id == tenant_id && device.status == DeviceStatus::Removed && device.identity.mac == mac
            })
            .map(|device| device.uid.clone())
    }

    fn has_tombstone(&self, tenant_id: &str, mac: &str) -> bool {
        self.tombstone_for(tenant_id, mac).is_some()
    }

    fn tag_by_name(&self, tenant_id: &str, name: &str) -> Option<&Tag> {
        self.tags
            .values()
            .find(|tag| tag.tenant_id == tenant_id && tag.name == name)
    }

    /// Validates a filter and resolves tag names to ids.
    fn resolve_filter(&self, tenant_id: &str, filter: &PublicKeyFilter) -> Result<PublicKeyFilter, RegistryError> {
        match filter {
            PublicKeyFilter::Hostname { hostname } => {
                regex::Regex::new(hostname).map_err(|_| RegistryError::invalid("filter.hostname", hostname))?;
                Ok(PublicKeyFilter::Hostname {
                    hostname: hostname.clone(),
                })
            }
            PublicKeyFilter::Tags { tags } => {
                if tags.is_empty() {
                    return Err(RegistryError::invalid("filter.tags", "empty tag set"));
                }

                let mut ids = Vec::with_capacity(tags.len());
                for name in tags {
                    let tag = self
                        .tag_by_name(tenant_id, name)
                        .ok_or_else(|| RegistryError::not_found(name.clone()))?;
                    ids.push(tag.id.clone());
                }

                Ok(PublicKeyFilter::Tags { tags: ids })
            }
        }
    }
}

fn acceptable_for(collections: &Collections, device: &Device, mode: AcceptabilityMode) -> bool {
    if device.status == DeviceStatus::Accepted || device.status == DeviceStatus::Removed {
        return false;
    }

    match mode {
        AcceptabilityMode::AsFalse => false,
        AcceptabilityMode::IfNotAccepted => true,
        AcceptabilityMode::FromRemoved => collections.has_tombstone(&device.tenant_id, &device.identity.mac),
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ----- devices ----- //

    async fn device_upsert_by_identity(&self, input: DeviceAuthInput) -> Result<Device, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        collections.namespace(&input.tenant_id)?;

        // An accepted row for the same (tenant, mac) keeps its uid and name.
        let accepted = collections
            .devices
            .values()
            .find(|device| {
                device.tenant_id == input.tenant_id
                    && device.identity.mac == input.mac
                    && device.status == DeviceStatus::Accepted
            })
            .map(|device| device.uid.clone());

        if let Some(uid) = accepted {
            let device = collections
                .devices
                .get_mut(&uid)
                .ok_or_else(|| RegistryError::not_found(&uid))?;
            device.last_seen = now;
            device.info = input.info;
            return Ok(device.clone());
        }

        if let Some(device) = collections.devices.get_mut(&input.uid) {
            device.last_seen = now;
            device.info = input.info;
            return Ok(device.clone());
        }

        let name = input.hostname.to_lowercase();
        validate_device_name(&name)?;

        let device = Device {
            uid: input.uid.clone(),
            tenant_id: input.tenant_id,
            name,
            identity: DeviceIdentity { mac: input.mac },
            info: input.info,
            public_key: input.public_key_pem,
            status: DeviceStatus::Pending,
            status_updated_at: now,
            connected_at: None,
            disconnected_at: None,
            last_seen: now,
            online: false,
            tag_ids: Vec::new(),
            position: None,
            public_url: false,
            public_url_address: None,
            acceptable: false,
        };

        collections.devices.insert(input.uid, device.clone());

        Ok(device)
    }

    async fn device_get(&self, tenant_id: &str, uid: &str) -> Result<Device, RegistryError> {
        let collections = self.collections.read().await;
        collections.device(tenant_id, uid).cloned()
    }

    async fn device_get_by_uid(&self, uid: &str) -> Result<Device, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .devices
            .get(uid)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(uid))
    }

    async fn device_lookup(&self, namespace_name: &str, device_name: &str) -> Result<Device, RegistryError> {
        let collections = self.collections.read().await;

        let namespace = collections
            .namespaces
            .values()
            .find(|namespace| namespace.name == namespace_name)
            .ok_or_else(|| RegistryError::not_found(namespace_name))?;

        collections
            .devices
            .values()
            .find(|device| {
                device.tenant_id == namespace.tenant_id
                    && device.name == device_name
                    && device.status == DeviceStatus::Accepted
            })
            .cloned()
            .ok_or_else(|| RegistryError::not_found(device_name))
    }

    async fn device_list(
        &self,
        tenant_id: &str,
        query: DeviceListQuery,
        acceptability: AcceptabilityMode,
    ) -> Result<(Vec<Device>, usize), RegistryError> {
        let collections = self.collections.read().await;

        let mut devices: Vec<Device> = collections
            .devices
            .values()
            .filter(|device| device.tenant_id == tenant_id)
            .filter(|device| match query.status {
                Some(status) => device.status == status,
                // Tombstones only show up when asked for explicitly.
                None => device.status != DeviceStatus::Removed,
            })
            .filter(|device| match &query.name_contains {
                Some(needle) => device.name.contains(needle),
                None => true,
            })
            .cloned()
            .collect();

        for device in &mut devices {
            device.acceptable = acceptable_for(&collections, device, acceptability);
        }

        devices.sort_by(|a, b| {
            let ordering = match query.sort_by {
                DeviceSortBy::Name => a.name.cmp(&b.name),
                DeviceSortBy::LastSeen => a.last_seen.cmp(&b.last_seen),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = devices.len();
        let page = query.page.max(1);
        let start = (page - 1) * query.per_page;
        let devices = devices.into_iter().skip(start).take(query.per_page).collect();

        Ok((devices, total))
    }

    async fn device_set_status(
        &self,
        tenant_id: &str,
        uid: &str,
        status: DeviceStatus,
    ) -> Result<Device, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        let current = collections.device(tenant_id, uid)?.clone();

        if current.status == status {
            return Ok(current);
        }

        match (current.status, status) {
            (DeviceStatus::Pending, DeviceStatus::Rejected) => {
                let device = collections
                    .devices
                    .get_mut(uid)
                    .ok_or_else(|| RegistryError::not_found(uid))?;
                device.status = DeviceStatus::Rejected;
                device.status_updated_at = now;
                Ok(device.clone())
            }
            (DeviceStatus::Pending | DeviceStatus::Rejected, DeviceStatus::Accepted) => {
                // Precondition P, clause 1: a same-MAC accepted device is
                // merged away; the new device takes over its name and
                // sessions, and its supplied name is discarded.
                let merge_source = collections
                    .devices
                    .values()
                    .find(|device| {
                        device.tenant_id == tenant_id
                            && device.uid != uid
                            && device.identity.mac == current.identity.mac
                            && device.status == DeviceStatus::Accepted
                    })
                    .map(|device| (device.uid.clone(), device.name.clone()));

                if let Some((old_uid, old_name)) = merge_source {
                    for session in collections.sessions.values_mut() {
                        if session.device_uid == old_uid {
                            session.device_uid = uid.to_owned();
                        }
                    }

                    collections.devices.remove(&old_uid);

                    let device = collections
                        .devices
                        .get_mut(uid)
                        .ok_or_else(|| RegistryError::not_found(uid))?;
                    device.name = old_name;
                    device.status = DeviceStatus::Accepted;
                    device.status_updated_at = now;
                    return Ok(device.clone());
                }

                // Clause 2: an accepted namesake with a different MAC wins.
                let name_conflict = collections.devices.values().any(|device| {
                    device.tenant_id == tenant_id
                        && device.uid != uid
                        && device.name == current.name
                        && device.identity.mac != current.identity.mac
                        && device.status == DeviceStatus::Accepted
                });

                if name_conflict {
                    return Err(RegistryError::duplicated(["name"]));
                }

                // Clause 3: quota.
                let namespace = collections.namespace(tenant_id)?.clone();
                let accepted = collections.accepted_count(tenant_id);

                if namespace.max_devices >= 0 && accepted as i64 >= namespace.max_devices {
                    if let Some(tombstone_uid) = collections.tombstone_for(tenant_id, &current.identity.mac) {
                        collections.devices.remove(&tombstone_uid);
                    } else if namespace.billing.is_some() {
                        return Err(RegistryError::Payment);
                    } else {
                        return Err(RegistryError::Limit {
                            limit: namespace.max_devices,
                        });
                    }
                }

                let device = collections
                    .devices
                    .get_mut(uid)
                    .ok_or_else(|| RegistryError::not_found(uid))?;
                device.status = DeviceStatus::Accepted;
                device.status_updated_at = now;
                Ok(device.clone())
            }
            (from, to) => Err(RegistryError::invalid("status", format!("{from} -> {to}"))),
        }
    }

    async fn device_rename(&self, tenant_id: &str, uid: &str, name: &str) -> Result<Device, RegistryError> {
        let mut collections = self.collections.write().await;

        let name = name.to_lowercase();
        validate_device_name(&name)?;

        collections.device(tenant_id, uid)?;

        let taken = collections.devices.values().any(|device| {
            device.tenant_id == tenant_id
                && device.uid != uid
                && device.name == name
                && device.status == DeviceStatus::Accepted
        });

        if taken {
            return Err(RegistryError::duplicated(["name"]));
        }

        let device = collections
            .devices
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;
        device.name = name;
        Ok(device.clone())
    }

    async fn device_delete(&self, tenant_id: &str, uid: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        let status = collections.device(tenant_id, uid)?.status;

        match status {
            DeviceStatus::Accepted => {
                let device = collections
                    .devices
                    .get_mut(uid)
                    .ok_or_else(|| RegistryError::not_found(uid))?;
                device.status = DeviceStatus::Removed;
                device.status_updated_at = now;
                device.online = false;
            }
            _ => {
                collections.devices.remove(uid);
            }
        }

        Ok(())
    }

    async fn device_set_online(&self, uid: &str, online: bool) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        let device = collections
            .devices
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;

        device.online = online;
        device.last_seen = now;
        if online {
            device.connected_at = Some(now);
        } else {
            device.disconnected_at = Some(now);
        }

        Ok(())
    }

    async fn device_heartbeat(&self, uid: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;

        let device = collections
            .devices
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;
        device.last_seen = OffsetDateTime::now_utc();

        Ok(())
    }

    // ----- namespaces ----- //

    async fn namespace_create(&self, namespace: Namespace) -> Result<Namespace, RegistryError> {
        let mut collections = self.collections.write().await;

        if collections.namespaces.contains_key(&namespace.tenant_id) {
            return Err(RegistryError::duplicated(["tenant_id"]));
        }

        if collections.namespaces.values().any(|ns| ns.name == namespace.name) {
            return Err(RegistryError::duplicated(["name"]));
        }

        let owners = namespace
            .members
            .iter()
            .filter(|member| member.role == Role::Owner)
            .count();
        if owners != 1 {
            return Err(RegistryError::invalid("members", "exactly one owner required"));
        }

        collections
            .namespaces
            .insert(namespace.tenant_id.clone(), namespace.clone());

        Ok(namespace)
    }

    async fn namespace_get(&self, tenant_id: &str) -> Result<Namespace, RegistryError> {
        let collections = self.collections.read().await;
        collections.namespace(tenant_id).cloned()
    }

    async fn namespace_get_by_name(&self, name: &str) -> Result<Namespace, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .namespaces
            .values()
            .find(|namespace| namespace.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(name))
    }

    async fn namespace_add_member(
        &self,
        tenant_id: &str,
        member: Member,
        inviter_role: Role,
    ) -> Result<Namespace, RegistryError> {
        let mut collections = self.collections.write().await;

        if !inviter_role.dominates(member.role) {
            return Err(RegistryError::RoleInvalid);
        }

        let namespace = collections
            .namespaces
            .get_mut(tenant_id)
            .ok_or_else(|| RegistryError::not_found(tenant_id))?;

        if namespace.member(&member.user_id).is_some() {
            return Err(RegistryError::duplicated(["user_id"]));
        }

        namespace.members.push(member);

        Ok(namespace.clone())
    }

    async fn namespace_update_member_role(
        &self,
        tenant_id: &str,
        user_id: &str,
        role: Role,
        actor_role: Role,
    ) -> Result<Namespace, RegistryError> {
        let mut collections = self.collections.write().await;

        let namespace = collections
            .namespaces
            .get_mut(tenant_id)
            .ok_or_else(|| RegistryError::not_found(tenant_id))?;

        let member = namespace
            .members
            .iter_mut()
            .find(|member| member.user_id == user_id)
            .ok_or_else(|| RegistryError::not_found(user_id))?;

        // Both the current and target roles must be strictly below the actor.
        if !actor_role.dominates(member.role) || !actor_role.dominates(role) {
            return Err(RegistryError::RoleInvalid);
        }

        member.role = role;

        Ok(namespace.clone())
    }

    async fn namespace_remove_member(
        &self,
        tenant_id: &str,
        user_id: &str,
        actor_role: Role,
    ) -> Result<Namespace, RegistryError> {
        let mut collections = self.collections.write().await;

        let namespace = collections
            .namespaces
            .get_mut(tenant_id)
            .ok_or_else(|| RegistryError::not_found(tenant_id))?;

        let member = namespace
            .member(user_id)
            .ok_or_else(|| RegistryError::not_found(user_id))?;

        if !actor_role.dominates(member.role) {
            return Err(RegistryError::RoleInvalid);
        }

        namespace.members.retain(|member| member.user_id != user_id);

        Ok(namespace.clone())
    }

    // ----- tags ----- //

    async fn tag_create(&self, tenant_id: &str, name: &str) -> Result<Tag, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        collections.namespace(tenant_id)?;

        if collections.tag_by_name(tenant_id, name).is_some() {
            return Err(RegistryError::duplicated(["name"]));
        }

        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_owned(),
            name: name.to_owned(),
            created_at: now,
            updated_at: now,
        };

        collections.tags.insert(tag.id.clone(), tag.clone());

        Ok(tag)
    }

    async fn tag_list(&self, tenant_id: &str) -> Result<Vec<Tag>, RegistryError> {
        let collections = self.collections.read().await;
        let mut tags: Vec<Tag> = collections
            .tags
            .values()
            .filter(|tag| tag.tenant_id == tenant_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn tag_push(
        &self,
        tenant_id: &str,
        tag_name: &str,
        target: TagTarget,
        target_id: &str,
    ) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;

        let tag_id = collections
            .tag_by_name(tenant_id, tag_name)
            .map(|tag| tag.id.clone())
            .ok_or_else(|| RegistryError::not_found(tag_name))?;

        match target {
            TagTarget::Device => {
                let device = collections
                    .devices
                    .get_mut(target_id)
                    .filter(|device| device.tenant_id == tenant_id)
                    .ok_or_else(|| RegistryError::not_found(target_id))?;

                if !device.tag_ids.contains(&tag_id) {
                    device.tag_ids.push(tag_id);
                }
            }
            TagTarget::PublicKey => {
                let key = collections
                    .public_keys
                    .get_mut(&(tenant_id.to_owned(), target_id.to_owned()))
                    .ok_or_else(|| RegistryError::not_found(target_id))?;

                match &mut key.filter {
                    PublicKeyFilter::Tags { tags } => {
                        if !tags.contains(&tag_id) {
                            tags.push(tag_id);
                        }
                    }
                    PublicKeyFilter::Hostname { .. } => {
                        return Err(RegistryError::invalid("filter", "key uses a hostname filter"));
                    }
                }
            }
            TagTarget::FirewallRule => {
                // Firewall rules live in a collaborator service.
                return Err(RegistryError::invalid("target", "firewall-rule"));
            }
        }

        Ok(())
    }

    async fn tag_pull(
        &self,
        tenant_id: &str,
        tag_name: &str,
        target: TagTarget,
        target_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;

        let tag_id = collections
            .tag_by_name(tenant_id, tag_name)
            .map(|tag| tag.id.clone())
            .ok_or_else(|| RegistryError::not_found(tag_name))?;

        pull_tag(&mut collections, tenant_id, &tag_id, target, target_id);

        Ok(())
    }

    async fn tag_delete(&self, tenant_id: &str, name: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;

        let tag_id = collections
            .tag_by_name(tenant_id, name)
            .map(|tag| tag.id.clone())
            .ok_or_else(|| RegistryError::not_found(name))?;

        // Broadcast pull from every target kind, then drop the row.
        for target in TagTarget::ALL {
            pull_tag(&mut collections, tenant_id, &tag_id, target, None);
        }

        collections.tags.remove(&tag_id);

        Ok(())
    }

    // ----- public keys ----- //

    async fn public_key_create(&self, tenant_id: &str, input: PublicKeyInput) -> Result<SshPublicKey, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        collections.namespace(tenant_id)?;

        let fingerprint = fingerprint_of_authorized_key(&input.data)?;

        if collections
            .public_keys
            .contains_key(&(tenant_id.to_owned(), fingerprint.clone()))
        {
            return Err(RegistryError::duplicated(["fingerprint"]));
        }

        regex::Regex::new(&input.username).map_err(|_| RegistryError::invalid("username", &input.username))?;

        let filter = collections.resolve_filter(tenant_id, &input.filter)?;

        let key = SshPublicKey {
            fingerprint: fingerprint.clone(),
            tenant_id: tenant_id.to_owned(),
            data: input.data,
            name: input.name,
            username: input.username,
            filter,
            created_at: now,
        };

        let companion = CompanionKey::generate(tenant_id, &fingerprint)?;
        collections
            .companion_keys
            .insert((tenant_id.to_owned(), companion.fingerprint.clone()), companion);

        collections
            .public_keys
            .insert((tenant_id.to_owned(), fingerprint), key.clone());

        Ok(key)
    }

    async fn public_key_get(&self, tenant_id: &str, fingerprint: &str) -> Result<SshPublicKey, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .public_keys
            .get(&(tenant_id.to_owned(), fingerprint.to_owned()))
            .cloned()
            .ok_or_else(|| RegistryError::not_found(fingerprint))
    }

    async fn public_key_list(&self, tenant_id: &str) -> Result<Vec<SshPublicKey>, RegistryError> {
        let collections = self.collections.read().await;
        let mut keys: Vec<SshPublicKey> = collections
            .public_keys
            .values()
            .filter(|key| key.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(keys)
    }

    async fn public_key_update(
        &self,
        tenant_id: &str,
        fingerprint: &str,
        input: PublicKeyInput,
    ) -> Result<SshPublicKey, RegistryError> {
        let mut collections = self.collections.write().await;

        let filter = collections.resolve_filter(tenant_id, &input.filter)?;

        regex::Regex::new(&input.username).map_err(|_| RegistryError::invalid("username", &input.username))?;

        let key = collections
            .public_keys
            .get_mut(&(tenant_id.to_owned(), fingerprint.to_owned()))
            .ok_or_else(|| RegistryError::not_found(fingerprint))?;

        key.name = input.name;
        key.username = input.username;
        key.filter = filter;

        Ok(key.clone())
    }

    async fn public_key_delete(&self, tenant_id: &str, fingerprint: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;

        collections
            .public_keys
            .remove(&(tenant_id.to_owned(), fingerprint.to_owned()))
            .ok_or_else(|| RegistryError::not_found(fingerprint))?;

        collections
            .companion_keys
            .retain(|_, companion| companion.user_fingerprint != fingerprint || companion.tenant_id != tenant_id);

        Ok(())
    }

    async fn public_key_evaluate(
        &self,
        tenant_id: &str,
        fingerprint: &str,
        username: &str,
        device_uid: &str,
    ) -> Result<bool, RegistryError> {
        let collections = self.collections.read().await;

        let key = collections
            .public_keys
            .get(&(tenant_id.to_owned(), fingerprint.to_owned()))
            .ok_or_else(|| RegistryError::not_found(fingerprint))?;

        let device = collections.device(tenant_id, device_uid)?;

        Ok(key.evaluate(username, device))
    }

    async fn companion_key_get(&self, tenant_id: &str, fingerprint: &str) -> Result<CompanionKey, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .companion_keys
            .get(&(tenant_id.to_owned(), fingerprint.to_owned()))
            .cloned()
            .ok_or_else(|| RegistryError::not_found(fingerprint))
    }

    async fn companion_key_for_user_key(
        &self,
        tenant_id: &str,
        user_fingerprint: &str,
    ) -> Result<CompanionKey, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .companion_keys
            .values()
            .find(|companion| companion.tenant_id == tenant_id && companion.user_fingerprint == user_fingerprint)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(user_fingerprint))
    }

    // ----- sessions ----- //

    async fn session_create(&self, input: SessionInput) -> Result<Session, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        // Sessions are deduplicated on uid.
        if let Some(existing) = collections.sessions.get(&input.uid) {
            return Ok(existing.clone());
        }

        let session = Session {
            uid: input.uid.clone(),
            device_uid: input.device_uid,
            tenant_id: input.tenant_id,
            username: input.username,
            ip_address: input.ip_address,
            ty: input.ty,
            authenticated: false,
            recorded: false,
            started_at: now,
            last_seen_at: now,
            closed_at: None,
        };

        collections.sessions.insert(input.uid, session.clone());

        Ok(session)
    }

    async fn session_get(&self, uid: &str) -> Result<Session, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .sessions
            .get(uid)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(uid))
    }

    async fn session_list(&self, tenant_id: &str) -> Result<Vec<Session>, RegistryError> {
        let collections = self.collections.read().await;
        let mut sessions: Vec<Session> = collections
            .sessions
            .values()
            .filter(|session| session.tenant_id == tenant_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    async fn session_set_authenticated(&self, uid: &str, authenticated: bool) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let session = collections
            .sessions
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;
        session.authenticated = authenticated;
        Ok(())
    }

    async fn session_set_type(&self, uid: &str, ty: crate::model::SessionType) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let session = collections
            .sessions
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;
        session.ty = ty;
        Ok(())
    }

    async fn session_keepalive(&self, uid: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let session = collections
            .sessions
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;

        if session.closed_at.is_some() {
            // Sessions are never resurrected.
            return Err(RegistryError::invalid("session", "already closed"));
        }

        session.last_seen_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn session_close(&self, uid: &str) -> Result<(), RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        let session = collections
            .sessions
            .get_mut(uid)
            .ok_or_else(|| RegistryError::not_found(uid))?;

        if session.closed_at.is_none() {
            session.closed_at = Some(now);
            session.last_seen_at = now;
        }

        Ok(())
    }

    async fn session_sweep_stale(&self, idle: Duration) -> Result<Vec<String>, RegistryError> {
        let mut collections = self.collections.write().await;
        let now = OffsetDateTime::now_utc();

        let mut swept = Vec::new();

        for session in collections.sessions.values_mut() {
            if session.closed_at.is_none() && session.last_seen_at + idle < now {
                // Finalize at the moment the session was last alive.
                session.closed_at = Some(session.last_seen_at);
                swept.push(session.uid.clone());
            }
        }

        Ok(swept)
    }

    // ----- users ----- //

    async fn user_create(&self, user: User) -> Result<User, RegistryError> {
        let mut collections = self.collections.write().await;

        if collections.users.contains_key(&user.id) {
            return Err(RegistryError::duplicated(["id"]));
        }

        if collections
            .users
            .values()
            .any(|existing| existing.username == user.username || existing.email == user.email)
        {
            return Err(RegistryError::duplicated(["username", "email"]));
        }

        collections.users.insert(user.id.clone(), user.clone());

        Ok(user)
    }

    async fn user_get_by_identifier(&self, identifier: &str) -> Result<User, RegistryError> {
        let collections = self.collections.read().await;
        collections
            .users
            .values()
            .find(|user| user.username == identifier || user.email == identifier)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(identifier))
    }

    async fn user_primary_namespace(&self, user_id: &str) -> Result<PrimaryNamespace, RegistryError> {
        let collections = self.collections.read().await;

        let mut namespaces: Vec<&Namespace> = collections.namespaces.values().collect();
        namespaces.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        namespaces
            .iter()
            .find_map(|namespace| {
                namespace
                    .member(user_id)
                    .filter(|member| member.status == MemberStatus::Accepted)
                    .map(|member| PrimaryNamespace {
                        tenant_id: namespace.tenant_id.clone(),
                        name: namespace.name.clone(),
                        role: member.role,
                    })
            })
            .ok_or_else(|| RegistryError::not_found(user_id))
    }
}

fn pull_tag(
    collections: &mut Collections,
    tenant_id: &str,
    tag_id: &str,
    target: TagTarget,
    target_id: Option<&str>,
) {
    match target {
        TagTarget::Device => {
            for device in collections.devices.values_mut() {
                if device.tenant_id == tenant_id && target_id.map_or(true, |id| device.uid == id) {
                    device.tag_ids.retain(|id| id != tag_id);
                }
            }
        }
        TagTarget::PublicKey => {
            for key in collections.public_keys.values_mut() {
                if key.tenant_id == tenant_id && target_id.map_or(true, |id| key.fingerprint == id) {
                    if let PublicKeyFilter::Tags { tags } = &mut key.filter {
                        tags.retain(|id| id != tag_id);
                    }
                }
            }
        }
        TagTarget::FirewallRule => {
            // Collaborator-owned; the broadcast pull has nothing to do here.
        }
    }
}

/// Legacy fingerprint of an OpenSSH authorized_keys entry.
fn fingerprint_of_authorized_key(data: &[u8]) -> Result<String, RegistryError> {
    let text = core::str::from_utf8(data).map_err(|_| RegistryError::invalid("data", "not utf-8"))?;

    let blob_b64 = text
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| RegistryError::invalid("data", "not an authorized_keys entry"))?;

    let wire = base64::engine::general_purpose::STANDARD
        .decode(blob_b64)
        .map_err(|_| RegistryError::invalid("data", "invalid key blob"))?;

    Ok(shellhub_identity::fingerprint::legacy(&wire))
}
