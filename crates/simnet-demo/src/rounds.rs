//! Example rounds.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use simnet::io::ExecOptions;
use simnet::{NodeInfo, Round, SimIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Key of the `/etc/hostname` file mapper.
pub const HOSTNAME_KEY: &str = "hostname";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const MARKER_PATH: &str = "/tmp/simnet-marker";

// ── nginx ───────────────────────────────────────────────────────────

/// Fetches the index page of every node, one node per second.
#[derive(Debug, Default)]
pub struct NginxRound {
    pub pages: BTreeMap<String, usize>,
}

#[async_trait]
impl Round for NginxRound {
    async fn execute(&mut self, io: &dyn SimIo, nodes: &[NodeInfo]) -> anyhow::Result<()> {
        for node in nodes {
            io.tag(&node.name);

            let response = tokio::time::timeout(HTTP_TIMEOUT, fetch_index(&node.address))
                .await
                .with_context(|| format!("{node} did not answer in time"))??;
            match parse_status(&response) {
                Some(200) => {}
                Some(status) => bail!("{node} answered with status {status}"),
                None => bail!("{node} sent a malformed response"),
            }

            tracing::info!(node = %node.name, bytes = response.len(), "page fetched");
            self.pages.insert(node.name.clone(), response.len());
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }
}

async fn fetch_index(address: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = TcpStream::connect((address, 80))
        .await
        .with_context(|| format!("connecting to {address}:80"))?;
    let request = format!("GET / HTTP/1.0\r\nHost: {address}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

/// Status code of an HTTP/1.x response.
fn parse_status(response: &[u8]) -> Option<u16> {
    let line = response.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

// ── hostname ────────────────────────────────────────────────────────

/// Checks every node's identity through the three I/O paths: exec reports
/// the hostname, write stores a marker and read fetches it back.
#[derive(Debug, Default)]
pub struct HostnameRound {
    pub hostnames: BTreeMap<String, String>,
}

#[async_trait]
impl Round for HostnameRound {
    async fn before(&mut self, io: &dyn SimIo, nodes: &[NodeInfo]) -> anyhow::Result<()> {
        for node in nodes {
            let (mut writer, done) = io.write(
                &node.name,
                None,
                &["sh".to_string(), "-c".to_string(), format!("cat > {MARKER_PATH}")],
            )?;
            writer.write_all(node.name.as_bytes()).await?;
            writer.shutdown().await?;
            done.await.with_context(|| format!("writing marker on {node}"))?;
        }
        Ok(())
    }

    async fn execute(&mut self, io: &dyn SimIo, nodes: &[NodeInfo]) -> anyhow::Result<()> {
        for node in nodes {
            io.tag(&node.name);

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let status = io
                .exec(
                    &node.name,
                    &["hostname".to_string()],
                    ExecOptions {
                        stdout: Some(&mut stdout),
                        stderr: Some(&mut stderr),
                    },
                )
                .await;
            status.with_context(|| format!("hostname on {node}: {}", String::from_utf8_lossy(&stderr)))?;
            let hostname = String::from_utf8_lossy(&stdout).trim().to_string();

            let mut marker = String::new();
            io.read(&node.name, MARKER_PATH)?
                .read_to_string(&mut marker)
                .await
                .with_context(|| format!("reading marker on {node}"))?;
            if marker != node.name {
                bail!("{node} holds marker {marker:?}");
            }

            tracing::info!(node = %node.name, hostname = %hostname, "identity checked");
            self.hostnames.insert(node.name.clone(), hostname);
        }
        Ok(())
    }

    async fn after(&mut self, io: &dyn SimIo, nodes: &[NodeInfo]) -> anyhow::Result<()> {
        let rm = ["rm".to_string(), "-f".to_string(), MARKER_PATH.to_string()];
        for node in nodes {
            io.exec(&node.name, &rm, ExecOptions::default()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\nServer: nginx\r\n\r\n"), Some(200));
        assert_eq!(parse_status(b"HTTP/1.0 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status(b"SSH-2.0-OpenSSH\r\n"), None);
        assert_eq!(parse_status(b""), None);
    }
}
