use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ProvisionError;

const USER_AGENT: &str = concat!("pregen-bench/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct Artifact<'a> {
    pub label: &'a str,
    pub url: &'a str,
    pub dest: &'a Path,
    pub sha256: Option<&'a str>,
}

/// Anything that can make an artifact present on disk.
pub trait ArtifactFetcher {
    /// Returns `true` when the artifact had to be fetched.
    fn ensure(&self, artifact: &Artifact<'_>) -> Result<bool>;
}

/// Fetches binary dependencies once and leaves existing files alone.
#[derive(Debug, Clone)]
pub struct Provisioner {
    client: Client,
}

impl Provisioner {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl ArtifactFetcher for Provisioner {
    /// Makes sure `artifact.dest` exists, downloading it when missing.
    ///
    /// Returns `true` when a download happened. Only an HTTP 200 response is
    /// accepted, and nothing is written at `dest` unless the full body was
    /// received and matched the expected digest.
    fn ensure(&self, artifact: &Artifact<'_>) -> Result<bool> {
        if artifact.dest.exists() {
            info!(
                label = artifact.label,
                path = %artifact.dest.display(),
                "already present, skipping download"
            );
            return Ok(false);
        }
        if let Some(parent) = artifact.dest.parent() {
            if !parent.as_os_str().is_empty() {
                pregen_core::ensure_dir(parent)?;
            }
        }

        info!(label = artifact.label, url = artifact.url, "downloading");
        let response = self
            .client
            .get(artifact.url)
            .send()
            .with_context(|| format!("request for {} failed", artifact.label))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProvisionError::HttpStatus {
                label: artifact.label.to_string(),
                url: artifact.url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        let body = response
            .bytes()
            .with_context(|| format!("failed to read body of {}", artifact.label))?;

        if let Some(expected) = artifact.sha256 {
            let expected = pregen_core::normalize_sha256(expected)?;
            let actual = pregen_core::sha256_bytes(&body);
            if actual != expected {
                return Err(ProvisionError::ChecksumMismatch {
                    label: artifact.label.to_string(),
                    url: artifact.url.to_string(),
                    expected,
                    actual,
                }
                .into());
            }
        }

        pregen_core::atomic_write_bytes(artifact.dest, &body)?;
        info!(
            label = artifact.label,
            bytes = body.len(),
            path = %artifact.dest.display(),
            "downloaded"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const JAR_BYTES: &[u8] = b"PK\x03\x04not-really-a-jar";

    struct Fixture {
        base_url: String,
        hits: Arc<AtomicUsize>,
    }

    /// Serves `JAR_BYTES` at `/ok.jar` and 404 everywhere else.
    fn serve() -> Fixture {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fixture server");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for request in server.incoming_requests() {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = if request.url() == "/ok.jar" {
                    tiny_http::Response::from_data(JAR_BYTES.to_vec())
                } else {
                    tiny_http::Response::from_data(b"missing".to_vec()).with_status_code(404)
                };
                let _ = request.respond(response);
            }
        });
        Fixture {
            base_url: format!("http://{}", addr),
            hits,
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "pregen_provision_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn ensure_downloads_once_then_skips() {
        let fixture = serve();
        let root = temp_root("once");
        let dest = root.join("server").join("fabric-server.jar");
        let url = format!("{}/ok.jar", fixture.base_url);
        let artifact = Artifact {
            label: "fabric",
            url: &url,
            dest: &dest,
            sha256: None,
        };
        let provisioner = Provisioner::new().expect("client");

        assert!(provisioner.ensure(&artifact).expect("first ensure"));
        assert!(!provisioner.ensure(&artifact).expect("second ensure"));
        assert_eq!(fixture.hits.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&dest).expect("read"), JAR_BYTES);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_200_leaves_no_file() {
        let fixture = serve();
        let root = temp_root("404");
        let dest = root.join("mods").join("distant-horizons.jar");
        let url = format!("{}/gone.jar", fixture.base_url);
        let artifact = Artifact {
            label: "distant horizons",
            url: &url,
            dest: &dest,
            sha256: None,
        };
        let err = Provisioner::new()
            .expect("client")
            .ensure(&artifact)
            .expect_err("404 must fail");
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::HttpStatus { status, .. }) => assert_eq!(*status, 404),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dest.exists());
        assert!(dest.parent().expect("parent").is_dir());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn checksum_mismatch_leaves_no_file() {
        let fixture = serve();
        let root = temp_root("sha");
        let dest = root.join("fabric-server.jar");
        let url = format!("{}/ok.jar", fixture.base_url);
        let wrong = "0".repeat(64);
        let artifact = Artifact {
            label: "fabric",
            url: &url,
            dest: &dest,
            sha256: Some(&wrong),
        };
        let err = Provisioner::new()
            .expect("client")
            .ensure(&artifact)
            .expect_err("mismatch must fail");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::ChecksumMismatch { .. })
        ));
        assert!(!dest.exists());

        let right = pregen_core::sha256_bytes(JAR_BYTES);
        let artifact = Artifact {
            sha256: Some(&right),
            ..artifact
        };
        assert!(Provisioner::new().expect("client").ensure(&artifact).expect("match"));
        let _ = fs::remove_dir_all(root);
    }
}
