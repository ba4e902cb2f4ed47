// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use tokio::{fs, io::AsyncWriteExt};
use url::Url;

use crate::error::CollectError;

#[async_trait]
pub trait ResponseExt: Sized {
    /// Alternative to `Response::error_for_status()` which includes the text of
    /// the response body.
    async fn error_for_status_with_body(self) -> Result<Self>;
}

#[async_trait]
impl ResponseExt for Response {
    async fn error_for_status_with_body(self) -> Result<Self> {
        let status = self.status();
        let is_err = status.is_client_error() || status.is_server_error();

        if is_err {
            let text = self.text().await;

            if let Ok(text) = text {
                bail!("{}: {}", status, text);
            } else {
                // Couldn't decode HTTP response body.
                bail!("{}: <could not decode response body>", status);
            }
        }

        Ok(self)
    }
}

/// Copies an artifact from its location into a local file.
#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    async fn fetch(&self, location: &Url, dst: &Path) -> Result<()>;
}

/// Fetches `http(s)://` locations with `reqwest` and copies `file://` ones.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransport {
    async fn fetch(&self, location: &Url, dst: &Path) -> Result<()> {
        if location.scheme().eq_ignore_ascii_case("file") {
            let src = location
                .to_file_path()
                .map_err(|_| anyhow!("invalid file url: {}", location))?;
            fs::copy(&src, dst)
                .await
                .with_context(|| format!("unable to copy {}", src.display()))?;
            return Ok(());
        }

        let mut resp = self
            .client
            .get(location.clone())
            .send()
            .await
            .context("fetch")?
            .error_for_status_with_body()
            .await
            .context("fetch status body")?;

        let file = fs::File::create(dst)
            .await
            .with_context(|| format!("unable to create {}", dst.display()))?;
        let mut writer = tokio::io::BufWriter::new(file);

        while let Some(chunk) = resp.chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fetched {
    Cached,
    Downloaded,
}

/// Fetch `location` into `dst` unless `dst` already exists.
///
/// The download is staged under `<dst>.part`, so an interrupted fetch never
/// satisfies the existence check of a later run.
pub async fn fetch_once(
    transport: &dyn ArtifactTransport,
    location: &Url,
    dst: &Path,
) -> Result<Fetched> {
    if crate::fs::exists(dst).await? {
        debug!("using cached {}", dst.display());
        return Ok(Fetched::Cached);
    }

    let mut part = dst.as_os_str().to_owned();
    part.push(".part");
    let part = std::path::PathBuf::from(part);

    let result = transport.fetch(location, &part).await;
    if let Err(source) = result {
        let _ = fs::remove_file(&part).await;
        return Err(CollectError::TransportFailure {
            location: location.to_string(),
            source,
        }
        .into());
    }

    fs::rename(&part, dst)
        .await
        .with_context(|| format!("unable to move download into place: {}", dst.display()))?;

    Ok(Fetched::Downloaded)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_fetch_http() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifacts/code-coverage-gcda.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir()?;
        let dst = dir.path().join("xpcshell-code-coverage-gcda.zip");
        let location = Url::parse(&format!("{}/artifacts/code-coverage-gcda.zip", server.uri()))?;
        let transport = HttpTransport::default();

        assert_eq!(fetch_once(&transport, &location, &dst).await?, Fetched::Downloaded);
        assert_eq!(fs::read(&dst).await?, b"PK\x03\x04");

        // The second fetch is served from disk; the mock expects one request.
        assert_eq!(fetch_once(&transport, &location, &dst).await?, Fetched::Cached);

        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_http_error_leaves_nothing_behind() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let dir = tempdir()?;
        let dst = dir.path().join("gcno.zip");
        let location = Url::parse(&format!("{}/gcno.zip", server.uri()))?;

        let err = fetch_once(&HttpTransport::default(), &location, &dst)
            .await
            .unwrap_err();
        assert!(matches!(
            CollectError::find(&err),
            Some(CollectError::TransportFailure { .. })
        ));
        assert!(format!("{:?}", err).contains("gone"));
        assert!(!crate::fs::exists(&dst).await?);
        assert!(!crate::fs::exists(dir.path().join("gcno.zip.part")).await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_file_url() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("source.zip");
        fs::write(&src, "data").await?;
        let dst = dir.path().join("copy.zip");

        let location = Url::from_file_path(&src).map_err(|_| anyhow!("bad path"))?;
        fetch_once(&HttpTransport::default(), &location, &dst).await?;

        assert_eq!(fs::read_to_string(&dst).await?, "data");
        Ok(())
    }
}
