//! The SSHID username grammar: `local_user@namespace_name.device_name[:group]`.

use core::fmt;
use core::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sshid {
    pub username: String,
    pub namespace: String,
    pub device: String,
    pub group: Option<String>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SshidError {
    #[error("missing '@' separator")]
    MissingAt,
    #[error("missing '.' between namespace and device")]
    MissingDot,
    #[error("empty component")]
    EmptyComponent,
}

impl FromStr for Sshid {
    type Err = SshidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The local user may itself contain '@' (email-style logins), so
        // split at the last occurrence.
        let (username, target) = s.rsplit_once('@').ok_or(SshidError::MissingAt)?;

        let (target, group) = match target.split_once(':') {
            Some((target, group)) => (target, Some(group)),
            None => (target, None),
        };

        let (namespace, device) = target.split_once('.').ok_or(SshidError::MissingDot)?;

        if username.is_empty() || namespace.is_empty() || device.is_empty() || group == Some("") {
            return Err(SshidError::EmptyComponent);
        }

        Ok(Sshid {
            username: username.to_owned(),
            namespace: namespace.to_owned(),
            device: device.to_owned(),
            group: group.map(str::to_owned),
        })
    }
}

impl fmt::Display for Sshid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}.{}", self.username, self.namespace, self.device)?;
        if let Some(group) = &self.group {
            write!(f, ":{group}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("root@testspace.dev01", "root", "testspace", "dev01", None)]
    #[case("admin@prod.web-1:wheel", "admin", "prod", "web-1", Some("wheel"))]
    #[case("user@example.com@ns.dev", "user@example.com", "ns", "dev", None)]
    fn valid_sshids(
        #[case] input: &str,
        #[case] username: &str,
        #[case] namespace: &str,
        #[case] device: &str,
        #[case] group: Option<&str>,
    ) {
        let sshid: Sshid = input.parse().unwrap();
        assert_eq!(sshid.username, username);
        assert_eq!(sshid.namespace, namespace);
        assert_eq!(sshid.device, device);
        assert_eq!(sshid.group.as_deref(), group);
        assert_eq!(sshid.to_string(), input);
    }

    #[rstest]
    #[case("no-at-sign", SshidError::MissingAt)]
    #[case("root@nodot", SshidError::MissingDot)]
    #[case("@ns.dev", SshidError::EmptyComponent)]
    #[case("root@.dev", SshidError::EmptyComponent)]
    #[case("root@ns.", SshidError::EmptyComponent)]
    #[case("root@ns.dev:", SshidError::EmptyComponent)]
    fn invalid_sshids(#[case] input: &str, #[case] expected: SshidError) {
        assert_eq!(input.parse::<Sshid>().unwrap_err(), expected);
    }
}
