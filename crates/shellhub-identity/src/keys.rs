//! Device and companion RSA keypairs.

use std::io;
use std::path::Path;

use picky::key::{PrivateKey, PublicKey};

pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key generation failed")]
    Generation { source: picky::key::KeyError },
    #[error("invalid key material")]
    Invalid { source: picky::key::KeyError },
    #[error("key file access failed")]
    Io {
        #[from]
        source: io::Error,
    },
}

pub fn generate_rsa_keypair() -> Result<PrivateKey, KeyError> {
    PrivateKey::generate_rsa(RSA_KEY_BITS).map_err(|source| KeyError::Generation { source })
}

pub fn public_key_of(private_key: &PrivateKey) -> Result<PublicKey, KeyError> {
    private_key
        .to_public_key()
        .map_err(|source| KeyError::Invalid { source })
}

pub fn to_pem(key: &PrivateKey) -> Result<String, KeyError> {
    let pem = key.to_pem_str().map_err(|source| KeyError::Invalid { source })?;
    Ok(pem)
}

pub fn from_pem(pem: &str) -> Result<PrivateKey, KeyError> {
    PrivateKey::from_pem_str(pem).map_err(|source| KeyError::Invalid { source })
}

/// Persists a private key, refusing to clobber an existing file.
///
/// The file is created with mode 0600 on unix.
pub fn write_key_file(path: &Path, key: &PrivateKey) -> Result<(), KeyError> {
    let pem = to_pem(key)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    io::Write::write_all(&mut file, pem.as_bytes())?;

    Ok(())
}

pub fn load_key_file(path: &Path) -> Result<PrivateKey, KeyError> {
    let pem = std::fs::read_to_string(path)?;
    from_pem(&pem)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");

        let key = generate_rsa_keypair().unwrap();
        write_key_file(&path, &key).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = load_key_file(&path).unwrap();
        assert_eq!(to_pem(&loaded).unwrap(), to_pem(&key).unwrap());

        // A second write must not clobber the existing key.
        assert!(write_key_file(&path, &key).is_err());
    }
}
