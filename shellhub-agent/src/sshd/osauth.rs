//! Local Unix authentication: account lookup plus shadow(5) verification.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LocalUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

#[cfg(unix)]
pub fn lookup(username: &str) -> Option<LocalUser> {
    use uzers::os::unix::UserExt as _;

    let user = uzers::get_user_by_name(username)?;

    Some(LocalUser {
        name: user.name().to_string_lossy().into_owned(),
        uid: user.uid(),
        gid: user.primary_group_id(),
        home: user.home_dir().to_path_buf(),
        shell: user.shell().to_path_buf(),
    })
}

/// The account the agent itself runs under (single-user mode).
#[cfg(unix)]
pub fn current() -> Option<LocalUser> {
    use uzers::os::unix::UserExt as _;

    let user = uzers::get_user_by_uid(uzers::get_current_uid())?;

    Some(LocalUser {
        name: user.name().to_string_lossy().into_owned(),
        uid: user.uid(),
        gid: user.primary_group_id(),
        home: user.home_dir().to_path_buf(),
        shell: user.shell().to_path_buf(),
    })
}

/// Verifies a password against the system shadow database.
#[cfg(unix)]
pub fn authenticate(username: &str, password: &str) -> bool {
    let Some(hash) = shadow_hash("/etc/shadow", username) else {
        return false;
    };

    verify_shadow_hash(&hash, password)
}

fn verify_shadow_hash(hash: &str, password: &str) -> bool {
    // Locked or passwordless accounts never authenticate over SSH.
    if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
        return false;
    }

    shellhub_identity::crypt::verify(hash, password)
}

fn shadow_hash(shadow_path: &str, username: &str) -> Option<String> {
    let content = std::fs::read_to_string(shadow_path).ok()?;
    find_shadow_hash(&content, username)
}

fn find_shadow_hash(content: &str, username: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let hash = fields.next()?;

        (name == username).then(|| hash.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_lines_are_parsed() {
        let content = "root:$6$salt$hash:19000:0:99999:7:::\nlocked:!:19000:0:99999:7:::\ndaemon:*:19000::::::\n";

        assert_eq!(find_shadow_hash(content, "root").as_deref(), Some("$6$salt$hash"));
        assert_eq!(find_shadow_hash(content, "locked").as_deref(), Some("!"));
        assert!(find_shadow_hash(content, "nobody").is_none());
    }

    #[test]
    fn locked_accounts_never_verify() {
        assert!(!verify_shadow_hash("!", "password"));
        assert!(!verify_shadow_hash("*", "password"));
        assert!(!verify_shadow_hash("", "password"));
    }

    #[test]
    fn crypt_hashes_verify() {
        let hash = shellhub_identity::crypt::hash_sha512("password").expect("hashing works");
        assert!(verify_shadow_hash(&hash, "password"));
        assert!(!verify_shadow_hash(&hash, "wrong"));
    }
}
