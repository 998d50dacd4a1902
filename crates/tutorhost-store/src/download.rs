use std::path::Path;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use tutorhost_domain::{DownloadProgress, RuntimeError};
use url::Url;

const BUFFER_SIZE: usize = 64 * 1024;

/// Streamed artifact sitting in a temp file. Dropping it removes the file.
#[derive(Debug)]
pub struct DownloadedArtifact {
    pub path: TempPath,
    pub sha256: String,
    pub bytes: u64,
}

/// Hashing sink shared by the HTTP and `file://` paths.
struct Sink<'a> {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
    total: Option<u64>,
    on_progress: &'a mut (dyn FnMut(DownloadProgress) + Send),
}

impl Sink<'_> {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), RuntimeError> {
        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| RuntimeError::io("writing download", &err))?;
        self.written += chunk.len() as u64;
        (self.on_progress)(DownloadProgress::new(self.written, self.total));
        Ok(())
    }

    async fn finish(mut self) -> Result<(String, u64), RuntimeError> {
        self.file
            .flush()
            .await
            .map_err(|err| RuntimeError::io("flushing download", &err))?;
        self.file
            .sync_all()
            .await
            .map_err(|err| RuntimeError::io("syncing download", &err))?;
        Ok((hex::encode(self.hasher.finalize()), self.written))
    }
}

/// Stream `url` into a temp file under `tmp_dir`, hashing as it goes.
///
/// `http(s)://` goes through `client` (with `bearer` when given); `file://`
/// is read straight from disk.
///
/// # Errors
/// [`RuntimeError::Network`] for transport failures and non-success statuses,
/// [`RuntimeError::Io`] when the temp file cannot be written.
pub async fn download_to_temp(
    client: &Client,
    url: &str,
    bearer: Option<&str>,
    tmp_dir: &Path,
    on_progress: &mut (dyn FnMut(DownloadProgress) + Send),
) -> Result<DownloadedArtifact, RuntimeError> {
    let parsed = Url::parse(url)
        .map_err(|err| RuntimeError::Validation(format!("invalid artifact url {url}: {err}")))?;
    tokio::fs::create_dir_all(tmp_dir)
        .await
        .map_err(|err| RuntimeError::io(format!("creating {}", tmp_dir.display()), &err))?;
    let tmp = NamedTempFile::new_in(tmp_dir)
        .map_err(|err| RuntimeError::io("creating temporary download file", &err))?;
    let (file, path) = tmp.into_parts();
    let file = tokio::fs::File::from_std(file);

    let (sha256, bytes) = match parsed.scheme() {
        "file" => copy_local(&parsed, file, on_progress).await?,
        "http" | "https" => fetch_remote(client, url, bearer, file, on_progress).await?,
        other => {
            return Err(RuntimeError::Validation(format!(
                "unsupported artifact url scheme `{other}`"
            )))
        }
    };
    debug!(%url, bytes, "downloaded artifact");
    Ok(DownloadedArtifact {
        path,
        sha256,
        bytes,
    })
}

async fn fetch_remote(
    client: &Client,
    url: &str,
    bearer: Option<&str>,
    file: tokio::fs::File,
    on_progress: &mut (dyn FnMut(DownloadProgress) + Send),
) -> Result<(String, u64), RuntimeError> {
    let mut request = client.get(url);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let mut response = request
        .send()
        .await
        .map_err(|err| RuntimeError::network(format!("failed to fetch {url}: {err}"), None))?;
    let status = response.status();
    if !status.is_success() {
        return Err(RuntimeError::network(
            format!("unexpected response {status} for {url}"),
            Some(status.as_u16()),
        ));
    }
    let mut sink = Sink {
        file,
        hasher: Sha256::new(),
        written: 0,
        total: response.content_length(),
        on_progress,
    };
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|err| RuntimeError::network(format!("stream error for {url}: {err}"), None))?;
        let Some(chunk) = chunk else {
            break;
        };
        sink.write(&chunk).await?;
    }
    sink.finish().await
}

async fn copy_local(
    url: &Url,
    file: tokio::fs::File,
    on_progress: &mut (dyn FnMut(DownloadProgress) + Send),
) -> Result<(String, u64), RuntimeError> {
    let source = url
        .to_file_path()
        .map_err(|()| RuntimeError::Validation(format!("invalid file url {url}")))?;
    let mut reader = tokio::fs::File::open(&source)
        .await
        .map_err(|err| RuntimeError::network(format!("failed to open {}: {err}", source.display()), None))?;
    let total = reader.metadata().await.ok().map(|meta| meta.len());
    let mut sink = Sink {
        file,
        hasher: Sha256::new(),
        written: 0,
        total,
        on_progress,
    };
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|err| RuntimeError::io(format!("reading {}", source.display()), &err))?;
        if read == 0 {
            break;
        }
        sink.write(&buffer[..read]).await?;
    }
    sink.finish().await
}

/// Hex sha256 of a file already on disk.
///
/// # Errors
/// [`RuntimeError::Io`] when the file cannot be opened or read.
pub async fn sha256_file(path: &Path) -> Result<String, RuntimeError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| RuntimeError::io(format!("opening {}", path.display()), &err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| RuntimeError::io(format!("reading {}", path.display()), &err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use std::fs;

    fn client() -> Client {
        crate::http_client(std::time::Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn streams_http_body_and_reports_progress() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/artifact.bin"))
                .respond_with(status_code(200).body("hello bundle")),
        );
        let temp = tempfile::tempdir().unwrap();
        let mut last = None;
        let artifact = download_to_temp(
            &client(),
            &server.url("/artifact.bin").to_string(),
            None,
            temp.path(),
            &mut |progress| last = Some(progress),
        )
        .await
        .unwrap();

        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "hello bundle");
        assert_eq!(artifact.bytes, 12);
        assert_eq!(artifact.sha256, hex::encode(Sha256::digest(b"hello bundle")));
        let last = last.expect("progress reported");
        assert_eq!(last.bytes_downloaded, 12);
        assert_eq!(last.percent, 100);
    }

    #[tokio::test]
    async fn sends_bearer_token_when_given() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/signed"),
                request::headers(contains(("authorization", "Bearer secret-token"))),
            ])
            .respond_with(status_code(200).body("ok")),
        );
        let temp = tempfile::tempdir().unwrap();
        download_to_temp(
            &client(),
            &server.url("/signed").to_string(),
            Some("secret-token"),
            temp.path(),
            &mut |_| {},
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn error_status_maps_to_network_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/missing"))
                .respond_with(status_code(404)),
        );
        let temp = tempfile::tempdir().unwrap();
        let err = download_to_temp(
            &client(),
            &server.url("/missing").to_string(),
            None,
            temp.path(),
            &mut |_| {},
        )
        .await
        .unwrap_err();
        match err {
            RuntimeError::Network { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn copies_file_urls() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source.bin");
        fs::write(&source, b"local bytes").unwrap();
        let url = Url::from_file_path(&source).unwrap();
        let artifact = download_to_temp(
            &client(),
            url.as_str(),
            None,
            &temp.path().join(".tmp"),
            &mut |_| {},
        )
        .await
        .unwrap();
        assert_eq!(fs::read(&artifact.path).unwrap(), b"local bytes");
    }

    #[tokio::test]
    async fn hashes_files_on_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("installer.sh");
        fs::write(&path, b"hello bundle").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            hex::encode(Sha256::digest(b"hello bundle"))
        );
        let err = sha256_file(&temp.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Io { .. }), "{err:?}");
    }
}
