//! Utility functions
//!
use std::{fs::File, io::Cursor, path::Path};

use reqwest::Client;

use crate::{config::ExtractorConfig, Error, Result};

/// Make sure the extractor artifact exists locally, downloading it from the configured URL if
/// it is missing. Returns whether a download happened.
pub async fn fetch_extractor(client: &Client, config: &ExtractorConfig) -> Result<bool> {
    if config.path.exists() {
        return Ok(false);
    }

    match &config.url {
        Some(url) => {
            log::info!("Downloading feature extractor from {url}");
            download_file(client, url, &config.path).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let failed = |e: reqwest::Error| Error::ExtractorLoad {
        path: filepath.to_path_buf(),
        reason: format!("download from {url} failed: {e}"),
    };

    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(failed)?;
    let mut content = Cursor::new(resp.bytes().await.map_err(failed)?);

    if let Some(parent) = filepath.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(filepath)?;
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn present_artifact_is_not_downloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"weights")?;
        let config = ExtractorConfig {
            path,
            url: Some("http://127.0.0.1:9/model.onnx".into()),
            ..Default::default()
        };

        assert!(!fetch_extractor(&Client::new(), &config).await?);

        Ok(())
    }

    #[tokio::test]
    async fn missing_artifact_without_url_is_left_to_the_loader() -> Result<()> {
        let config = ExtractorConfig {
            path: "nowhere/model.onnx".into(),
            url: None,
            ..Default::default()
        };

        assert!(!fetch_extractor(&Client::new(), &config).await?);

        Ok(())
    }

    #[tokio::test]
    async fn unreachable_url_is_a_load_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let result = download_file(
            &Client::new(),
            "http://127.0.0.1:9/model.onnx",
            dir.path().join("model.onnx"),
        )
        .await;

        assert!(matches!(result, Err(Error::ExtractorLoad { .. })));
        assert!(!dir.path().join("model.onnx").exists());

        Ok(())
    }
}
