//! Startup-only checks that are fatal if they fail: decoder binary
//! missing or unsupported version, origin unreachable. Per spec.md §7
//! these are the only failures allowed to abort the run instead of being
//! counted and continued past.

use tracing::info;

use crate::config::Config;
use crate::errors::{CoreError, CoreResult};

/// Runs `binary --version`, returning its first output line. A launch
/// failure (binary missing, not executable) is reported as
/// `CoreError::DecoderMissing`, never a generic IO error.
async fn detect_decoder_version(binary_path: &str) -> CoreResult<String> {
    let output = tokio::process::Command::new(binary_path)
        .arg("--version")
        .output()
        .await
        .map_err(|_| CoreError::DecoderMissing(binary_path.to_string()))?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

fn check_supported_version(version: &str, supported: &[String]) -> CoreResult<()> {
    if supported.is_empty() {
        return Ok(());
    }
    if supported.iter().any(|s| version.contains(s.as_str())) {
        Ok(())
    } else {
        Err(CoreError::UnsupportedDecoderVersion {
            found: version.to_string(),
            supported: supported.to_vec(),
        })
    }
}

async fn check_origin_reachable(config: &Config) -> CoreResult<()> {
    let url = &config.file().origin.manifest_url;
    config
        .http_client()
        .head(url)
        .send()
        .await
        .map_err(|e| CoreError::OriginUnreachable(e.to_string()))?;
    Ok(())
}

/// Runs every preflight check, in spec.md §4.8's declared order. Returns
/// on the first failure; the orchestrator maps this straight to a
/// non-zero exit.
pub async fn run(config: &Config) -> CoreResult<()> {
    let decoder_config = &config.file().decoder_invocation;
    let version = detect_decoder_version(&decoder_config.binary_path).await?;
    check_supported_version(&version, &decoder_config.supported_versions)?;
    info!(version, "decoder preflight passed");

    check_origin_reachable(config).await?;
    info!(url = %config.file().origin.manifest_url, "origin preflight passed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_supported_set_accepts_any_version() {
        assert!(check_supported_version("ffmpeg version 6.0", &[]).is_ok());
    }

    #[test]
    fn version_must_contain_a_supported_substring() {
        let supported = vec!["6.0".to_string(), "6.1".to_string()];
        assert!(check_supported_version("ffmpeg version 6.1-static", &supported).is_ok());
        assert!(check_supported_version("ffmpeg version 4.2", &supported).is_err());
    }

    #[tokio::test]
    async fn missing_binary_reports_decoder_missing() {
        let err = detect_decoder_version("/definitely/not/a/real/binary")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DecoderMissing(_)));
    }
}
