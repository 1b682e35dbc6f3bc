use russh_keys::PublicKeyBase64 as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::RegistryError;

// ----- devices ----- //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Accepted,
    Rejected,
    /// Tombstone left by deleting an accepted device; counts against the
    /// namespace quota in metered plans.
    Removed,
}

impl core::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceStatus::Pending => write!(f, "pending"),
            DeviceStatus::Accepted => write!(f, "accepted"),
            DeviceStatus::Rejected => write!(f, "rejected"),
            DeviceStatus::Removed => write!(f, "removed"),
        }
    }
}

impl core::str::FromStr for DeviceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "accepted" => Ok(DeviceStatus::Accepted),
            "rejected" => Ok(DeviceStatus::Rejected),
            "removed" => Ok(DeviceStatus::Removed),
            other => Err(RegistryError::invalid("status", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os_id: String,
    pub os_name: String,
    pub arch: String,
    pub platform: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub uid: String,
    pub tenant_id: String,
    pub name: String,
    pub identity: DeviceIdentity,
    pub info: DeviceInfo,
    /// PEM encoding of the device public key.
    pub public_key: String,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub status_updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub connected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub disconnected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub online: bool,
    pub tag_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub public_url: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url_address: Option<String>,
    /// Derived when listing: whether this pending/rejected device could
    /// still be accepted under the namespace quota.
    #[serde(default)]
    pub acceptable: bool,
}

/// Device names follow DNS-label syntax: lowercase alphanumerics and
/// hyphens, no leading/trailing hyphen, at most 63 characters.
pub fn validate_device_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(RegistryError::invalid("name", name))
    }
}

// ----- namespaces ----- //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Administrator,
    Operator,
    Observer,
}

impl Role {
    /// Total order: owner > administrator > operator > observer.
    pub const fn authority(self) -> u8 {
        match self {
            Role::Owner => 4,
            Role::Administrator => 3,
            Role::Operator => 2,
            Role::Observer => 1,
        }
    }

    /// A role can only act on members with strictly lower authority.
    pub fn dominates(self, other: Role) -> bool {
        self.authority() > other.authority()
    }
}

impl core::str::FromStr for Role {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "administrator" => Ok(Role::Administrator),
            "operator" => Ok(Role::Operator),
            "observer" => Ok(Role::Observer),
            other => Err(RegistryError::invalid("role", other)),
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Administrator => write!(f, "administrator"),
            Role::Operator => write!(f, "operator"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Pending,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub role: Role,
    pub status: MemberStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSettings {
    pub session_record: bool,
    #[serde(default)]
    pub connection_announcement: String,
}

/// Opaque billing document; its presence marks a metered namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Billing {
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub tenant_id: String,
    pub name: String,
    pub owner: String,
    pub members: Vec<Member>,
    pub settings: NamespaceSettings,
    /// -1 means unlimited.
    pub max_devices: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<Billing>,
}

impl Namespace {
    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.user_id == user_id)
    }
}

// ----- tags ----- //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Polymorphic tag target discriminator. Firewall rules are handled by a
/// collaborator but the discriminator stays open for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagTarget {
    Device,
    PublicKey,
    FirewallRule,
}

impl TagTarget {
    pub const ALL: [TagTarget; 3] = [TagTarget::Device, TagTarget::PublicKey, TagTarget::FirewallRule];
}

// ----- public keys ----- //

/// Exactly one of a hostname regex or a tag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublicKeyFilter {
    Hostname { hostname: String },
    Tags { tags: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshPublicKey {
    /// MD5-legacy fingerprint of the key's SSH wire form; primary key.
    pub fingerprint: String,
    pub tenant_id: String,
    /// OpenSSH authorized_keys bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub name: String,
    /// Regexp applied to the remote login name.
    pub username: String,
    pub filter: PublicKeyFilter,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SshPublicKey {
    /// Whether this key may authenticate `login` against `device`.
    ///
    /// Stored tag filters carry tag ids (resolved from names at creation
    /// time), so the intersection is taken against `device.tag_ids`.
    pub fn evaluate(&self, login: &str, device: &Device) -> bool {
        let username_ok = match regex::Regex::new(&self.username) {
            Ok(re) => self.username.is_empty() || re.is_match(login),
            Err(_) => false,
        };

        if !username_ok {
            return false;
        }

        match &self.filter {
            PublicKeyFilter::Hostname { hostname } => match regex::Regex::new(hostname) {
                Ok(re) => re.is_match(&device.name),
                Err(_) => false,
            },
            PublicKeyFilter::Tags { tags } => tags.iter().any(|tag| device.tag_ids.contains(tag)),
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&data_encoding(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode_data(&encoded).map_err(serde::de::Error::custom)
    }

    fn data_encoding(bytes: &[u8]) -> String {
        use base64_impl::Engine as _;
        base64_impl::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn decode_data(encoded: &str) -> Result<Vec<u8>, base64_impl::DecodeError> {
        use base64_impl::Engine as _;
        base64_impl::engine::general_purpose::STANDARD.decode(encoded)
    }

    use base64 as base64_impl;
}

/// Server-side RSA keypair provisioned alongside a registered public key.
///
/// The gateway authenticates to agents with it and co-signs challenges; it
/// is indexed by its own wire-form fingerprint and linked back to the
/// registered key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionKey {
    pub fingerprint: String,
    pub user_fingerprint: String,
    pub tenant_id: String,
    /// PKCS#8 PEM of the companion private key.
    pub private_pem: String,
}

impl CompanionKey {
    /// Generates a fresh companion keypair for a registered key.
    pub fn generate(tenant_id: &str, user_fingerprint: &str) -> Result<Self, RegistryError> {
        let private = shellhub_identity::keys::generate_rsa_keypair()
            .map_err(|error| RegistryError::unknown(format!("companion key generation: {error}")))?;
        let private_pem = shellhub_identity::keys::to_pem(&private)
            .map_err(|error| RegistryError::unknown(format!("companion key encoding: {error}")))?;

        let keypair = russh_keys::decode_secret_key(&private_pem, None)
            .map_err(|error| RegistryError::unknown(format!("companion key decoding: {error}")))?;
        let fingerprint = shellhub_identity::fingerprint::legacy(&keypair.public_key_bytes());

        Ok(Self {
            fingerprint,
            user_fingerprint: user_fingerprint.to_owned(),
            tenant_id: tenant_id.to_owned(),
            private_pem,
        })
    }
}

// ----- sessions ----- //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Shell,
    Exec,
    Sftp,
    Heredoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Assigned by the gateway.
    pub uid: String,
    pub device_uid: String,
    pub tenant_id: String,
    pub username: String,
    pub ip_address: String,
    #[serde(rename = "type")]
    pub ty: SessionType,
    pub authenticated: bool,
    pub recorded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
}

// ----- users ----- //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    /// Modular crypt format, verified by the identity crate.
    pub password_hash: String,
}

/// Resolved membership of a user, used when issuing user tokens.
#[derive(Debug, Clone)]
pub struct PrimaryNamespace {
    pub tenant_id: String,
    pub name: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn device(name: &str, tags: &[&str]) -> Device {
        Device {
            uid: "uid".to_owned(),
            tenant_id: "tenant".to_owned(),
            name: name.to_owned(),
            identity: DeviceIdentity::default(),
            info: DeviceInfo::default(),
            public_key: String::new(),
            status: DeviceStatus::Accepted,
            status_updated_at: OffsetDateTime::UNIX_EPOCH,
            connected_at: None,
            disconnected_at: None,
            last_seen: OffsetDateTime::UNIX_EPOCH,
            online: false,
            tag_ids: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            position: None,
            public_url: false,
            public_url_address: None,
            acceptable: false,
        }
    }

    #[test]
    fn role_authority_is_total() {
        assert!(Role::Owner.dominates(Role::Administrator));
        assert!(Role::Administrator.dominates(Role::Operator));
        assert!(Role::Operator.dominates(Role::Observer));
        assert!(!Role::Observer.dominates(Role::Observer));
        assert!(!Role::Operator.dominates(Role::Administrator));
        assert!(!Role::Owner.dominates(Role::Owner));
    }

    #[test]
    fn device_name_syntax() {
        assert!(validate_device_name("dev01").is_ok());
        assert!(validate_device_name("a-b-c").is_ok());
        assert!(validate_device_name("Dev01").is_err());
        assert!(validate_device_name("-dev").is_err());
        assert!(validate_device_name("dev-").is_err());
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("under_score").is_err());
    }

    #[test]
    fn filter_serde_is_one_of() {
        let hostname: PublicKeyFilter = serde_json::from_str(r#"{"hostname":"^dev"}"#).unwrap();
        assert_eq!(
            hostname,
            PublicKeyFilter::Hostname {
                hostname: "^dev".to_owned()
            }
        );

        let tags: PublicKeyFilter = serde_json::from_str(r#"{"tags":["production"]}"#).unwrap();
        assert_eq!(
            tags,
            PublicKeyFilter::Tags {
                tags: vec!["production".to_owned()]
            }
        );

        assert_eq!(
            serde_json::to_string(&PublicKeyFilter::Hostname {
                hostname: ".*".to_owned()
            })
            .unwrap(),
            r#"{"hostname":".*"}"#
        );
    }

    #[test]
    fn public_key_evaluation() {
        let key = SshPublicKey {
            fingerprint: "fp".to_owned(),
            tenant_id: "tenant".to_owned(),
            data: vec![],
            name: "ci key".to_owned(),
            username: ".*".to_owned(),
            filter: PublicKeyFilter::Tags {
                tags: vec!["tag-production".to_owned()],
            },
            created_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert!(key.evaluate("root", &device("dev01", &["tag-production"])));
        assert!(!key.evaluate("root", &device("dev01", &["tag-staging"])));

        let hostname_key = SshPublicKey {
            filter: PublicKeyFilter::Hostname {
                hostname: "^dev".to_owned(),
            },
            ..key
        };

        assert!(hostname_key.evaluate("root", &device("dev01", &[])));
        assert!(!hostname_key.evaluate("root", &device("prod01", &[])));
    }

    #[test]
    fn restrictive_username_regex_is_applied() {
        let key = SshPublicKey {
            fingerprint: "fp".to_owned(),
            tenant_id: "tenant".to_owned(),
            data: vec![],
            name: "ops".to_owned(),
            username: "^(root|admin)$".to_owned(),
            filter: PublicKeyFilter::Hostname {
                hostname: ".*".to_owned(),
            },
            created_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert!(key.evaluate("root", &device("dev01", &[])));
        assert!(!key.evaluate("nobody", &device("dev01", &[])));
    }
}
