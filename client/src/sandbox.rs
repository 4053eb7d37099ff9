//! Vercel Sandbox REST binding for `ProvisioningService`.

use async_trait::async_trait;
use burrow_shared::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

use crate::credentials::Credentials;
use crate::provision::{
    CommandHandle, CommandSpec, ContextInfo, ContextSpec, ContextStatus, FileEntry, LogLine,
    ProvisioningService,
};

pub struct SandboxApi {
    base_url: String,
    credentials: Credentials,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SandboxEnvelope {
    sandbox: SandboxBody,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct SandboxBody {
    id: String,
    status: ContextStatus,
}

#[derive(Debug, Deserialize)]
struct Route {
    port: u16,
    url: String,
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    command: CommandBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody {
    id: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
struct RunCommandRequest<'a> {
    command: &'a str,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
}

impl SandboxApi {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("burrow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Provisioning(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.credentials.token)
            .query(&[("teamId", self.credentials.team_id.as_str())])
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<Response> {
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("{} failed: {}", what, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provisioning(format!("{} failed with {}: {}", what, status, body.trim())));
        }
        debug!("{} -> {}", what, status);
        Ok(resp)
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, what: &str, builder: RequestBuilder) -> Result<T> {
        self.send(what, builder)
            .await?
            .json()
            .await
            .map_err(|e| Error::Provisioning(format!("{} returned an unexpected body: {}", what, e)))
    }

    async fn sandbox(&self, context_id: &str) -> Result<SandboxEnvelope> {
        self.json(
            "Fetch sandbox",
            self.request(Method::GET, &format!("/v1/sandboxes/{}", context_id)),
        )
        .await
    }
}

#[async_trait]
impl ProvisioningService for SandboxApi {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextInfo> {
        let body = json!({
            "projectId": self.credentials.project_id,
            "runtime": spec.runtime,
            "ports": spec.ports,
            "resources": { "vcpus": spec.vcpus },
            "timeout": spec.timeout.as_millis() as u64,
        });
        let created: SandboxEnvelope = self
            .json(
                "Create sandbox",
                self.request(Method::POST, "/v1/sandboxes").json(&body),
            )
            .await?;
        Ok(ContextInfo {
            id: created.sandbox.id,
            status: created.sandbox.status,
        })
    }

    async fn get(&self, context_id: &str) -> Result<ContextInfo> {
        let found = self.sandbox(context_id).await?;
        Ok(ContextInfo {
            id: found.sandbox.id,
            status: found.sandbox.status,
        })
    }

    async fn stop(&self, context_id: &str) -> Result<()> {
        self.send(
            "Stop sandbox",
            self.request(Method::POST, &format!("/v1/sandboxes/{}/stop", context_id)),
        )
        .await?;
        Ok(())
    }

    async fn write_files(&self, context_id: &str, files: &[FileEntry]) -> Result<()> {
        let archive = pack_files(files)?;
        self.send(
            "Write files",
            self.request(Method::POST, &format!("/v1/sandboxes/{}/fs/write", context_id))
                .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                .body(archive),
        )
        .await?;
        Ok(())
    }

    async fn run_command(&self, context_id: &str, spec: &CommandSpec) -> Result<CommandHandle> {
        let started: CommandEnvelope = self
            .json(
                "Run command",
                self.request(Method::POST, &format!("/v1/sandboxes/{}/cmd", context_id))
                    .json(&RunCommandRequest {
                        command: &spec.cmd,
                        args: &spec.args,
                        env: &spec.env,
                    }),
            )
            .await?;

        if spec.detached {
            return Ok(CommandHandle {
                id: started.command.id,
                exit_code: None,
            });
        }

        let finished: CommandEnvelope = self
            .json(
                "Wait for command",
                self.request(
                    Method::GET,
                    &format!("/v1/sandboxes/{}/cmd/{}", context_id, started.command.id),
                )
                .query(&[("wait", "true")]),
            )
            .await?;
        Ok(CommandHandle {
            id: finished.command.id,
            exit_code: finished.command.exit_code,
        })
    }

    async fn command_logs(&self, context_id: &str, command: &CommandHandle) -> Result<Vec<LogLine>> {
        let text = self
            .send(
                "Read command logs",
                self.request(
                    Method::GET,
                    &format!("/v1/sandboxes/{}/cmd/{}/logs", context_id, command.id),
                ),
            )
            .await?
            .text()
            .await
            .map_err(|e| Error::Provisioning(format!("Read command logs failed: {}", e)))?;
        Ok(parse_logs(&text))
    }

    async fn exposed_address(&self, context_id: &str, port: u16) -> Result<String> {
        self.sandbox(context_id)
            .await?
            .routes
            .into_iter()
            .find(|r| r.port == port)
            .map(|r| r.url)
            .ok_or_else(|| Error::Provisioning(format!("Port {} is not exposed by sandbox {}", port, context_id)))
    }
}

/// Pack files into the gzipped tarball the write endpoint expects
fn pack_files(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(file.mode);
        header.set_cksum();
        builder.append_data(&mut header, &file.path, file.content.as_slice())?;
    }
    Ok(builder.into_inner()?.finish()?)
}

/// Log endpoint returns one JSON object per line; unparseable lines are skipped
fn parse_logs(text: &str) -> Vec<LogLine> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}
