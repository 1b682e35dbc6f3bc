//! The `sftp` helper: a filesystem-backed SFTP server over stdio.
//!
//! The embedded SSH server re-executes the agent binary with this
//! subcommand under the session's uid/gid and splices the channel to it.

use std::collections::HashMap;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

pub async fn serve_stdio() -> anyhow::Result<()> {
    let stream = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());

    russh_sftp::server::run(stream, SftpSession::default()).await;

    Ok(())
}

#[derive(Default)]
struct SftpSession {
    version: Option<u32>,
    next_handle: u64,
    files: HashMap<String, tokio::fs::File>,
    dirs: HashMap<String, Vec<(String, FileAttributes)>>,
}

impl SftpSession {
    fn allocate_handle(&mut self) -> String {
        self.next_handle += 1;
        format!("h{}", self.next_handle)
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_owned(),
            language_tag: "en-US".to_owned(),
        }
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, version: u32, _extensions: HashMap<String, String>) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            return Err(StatusCode::ConnectionLost);
        }

        self.version = Some(version);
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved.to_string_lossy().into_owned(),
            Err(_) if path.is_empty() || path == "." => std::env::current_dir()
                .map_err(|_| StatusCode::Failure)?
                .to_string_lossy()
                .into_owned(),
            Err(_) => path,
        };

        Ok(Name {
            id,
            files: vec![File::dummy(resolved)],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .append(pflags.contains(OpenFlags::APPEND));

        let file = options.open(&filename).await.map_err(io_status)?;

        let handle = self.allocate_handle();
        self.files.insert(handle.clone(), file);

        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.files.remove(&handle);
        self.dirs.remove(&handle);
        Ok(Self::ok(id))
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;

        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_status)?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;

        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(io_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Err(StatusCode::Eof);
        }

        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;

        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_status)?;
        file.write_all(&data).await.map_err(io_status)?;

        Ok(Self::ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let mut read_dir = tokio::fs::read_dir(&path).await.map_err(io_status)?;

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            entries.push((name, attrs));
        }

        let handle = self.allocate_handle();
        self.dirs.insert(handle.clone(), entries);

        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;

        if entries.is_empty() {
            return Err(StatusCode::Eof);
        }

        // Hand the entries out in chunks, OpenSSH-style.
        let chunk: Vec<(String, FileAttributes)> = entries.drain(..entries.len().min(64)).collect();
        let files = chunk
            .into_iter()
            .map(|(name, attrs)| File::new(name, attrs))
            .collect();

        Ok(Name { id, files })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(&path).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(&path).await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let metadata = file.metadata().await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(&filename).await.map_err(io_status)?;
        Ok(Self::ok(id))
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(&path).await.map_err(io_status)?;
        Ok(Self::ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(&path).await.map_err(io_status)?;
        Ok(Self::ok(id))
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status, Self::Error> {
        tokio::fs::rename(&oldpath, &newpath).await.map_err(io_status)?;
        Ok(Self::ok(id))
    }
}

fn io_status(error: std::io::Error) -> StatusCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}
