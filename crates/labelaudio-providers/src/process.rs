use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use labelaudio_core::adapter::{
    CapabilityRequest, CapabilityResponse, CapabilityTransport, TransportFailure,
};
use labelaudio_core::capability::{CapabilityDescriptor, Endpoint, TransportHandle};

use crate::preview_body;

/// Wire protocol tag written on every request line.
pub const PROCESS_PROTOCOL: &str = "labelaudio.capability.v1";

/// Provider run as a child process, one process per exchange.
///
/// The request is written to stdin as a single JSON line; the last
/// non-empty stdout line is the answer. Dropping an in-flight call kills
/// the child.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    name: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Envelope<'a> {
    Discover {
        protocol: &'static str,
    },
    Invoke {
        protocol: &'static str,
        request: &'a CapabilityRequest,
    },
}

#[derive(Deserialize)]
struct DiscoverReply {
    capabilities: Vec<CapabilityDescriptor>,
}

impl ProcessTransport {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn exchange(&self, envelope: &Envelope<'_>) -> Result<String, TransportFailure> {
        let line = serde_json::to_string(envelope)
            .map_err(|e| TransportFailure::Protocol(e.to_string()))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(cwd) = &self.working_dir {
            cmd.current_dir(cwd);
        }
        if !self.env.is_empty() {
            cmd.envs(self.env.clone());
        }
        cmd.kill_on_drop(true);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            TransportFailure::Connection(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                return Err(TransportFailure::Connection(format!(
                    "write request to '{}' failed: {}",
                    self.command, e
                )));
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            TransportFailure::Connection(format!("wait for '{}' failed: {}", self.command, e))
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportFailure::Unavailable {
                status: output.status.code().unwrap_or(-1).clamp(0, u16::MAX as i32) as u16,
                message: format!(
                    "'{}' exited with {}: {}",
                    self.command,
                    output.status,
                    preview_body(&stderr)
                ),
            });
        }

        stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .ok_or_else(|| TransportFailure::Protocol(format!("'{}' wrote no reply", self.command)))
    }

    fn stamp(&self, mut descriptor: CapabilityDescriptor) -> CapabilityDescriptor {
        descriptor.transport = TransportHandle::new(
            self.name.clone(),
            Endpoint::Process {
                command: self.command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            },
        );
        descriptor
    }
}

#[async_trait]
impl CapabilityTransport for ProcessTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, TransportFailure> {
        let reply = self
            .exchange(&Envelope::Discover {
                protocol: PROCESS_PROTOCOL,
            })
            .await?;
        let parsed: DiscoverReply = serde_json::from_str(&reply).map_err(|e| {
            TransportFailure::Protocol(format!("invalid discover reply ({}): {}", e, preview_body(&reply)))
        })?;
        let descriptors: Vec<CapabilityDescriptor> =
            parsed.capabilities.into_iter().map(|d| self.stamp(d)).collect();
        tracing::info!(
            provider = %self.name,
            command = %self.command,
            capabilities = descriptors.len(),
            "process provider discovered"
        );
        Ok(descriptors)
    }

    async fn call(
        &self,
        descriptor: &CapabilityDescriptor,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, TransportFailure> {
        tracing::debug!(provider = %self.name, capability = %descriptor.name, "spawning provider process");
        let reply = self
            .exchange(&Envelope::Invoke {
                protocol: PROCESS_PROTOCOL,
                request: &request,
            })
            .await?;
        serde_json::from_str::<CapabilityResponse>(&reply).map_err(|e| {
            TransportFailure::Protocol(format!(
                "invalid capability response ({}): {}",
                e,
                preview_body(&reply)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelaudio_core::adapter::CallContext;
    use serde_json::json;

    fn sh(script: &str) -> ProcessTransport {
        ProcessTransport::new("proc", "sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    fn request() -> CapabilityRequest {
        CapabilityRequest {
            capability_name: "detect_audio_events".to_string(),
            arguments: json!({"audio_url": "https://a.test/x.wav"}),
            context: CallContext::new("run-1").with_task("t1", 1),
        }
    }

    #[test]
    fn test_invoke_reads_last_stdout_line() {
        tokio_test::block_on(async {
            let transport = sh(
                "cat >/dev/null; echo 'loading model'; printf '{\"success\":true,\"result\":{\"events\":[]}}\\n'",
            );
            let descriptor = CapabilityDescriptor::new("detect_audio_events", TransportHandle::local("proc"));
            let response = transport.call(&descriptor, request()).await.expect("call");
            assert!(response.success);
            assert_eq!(response.result, Some(json!({"events": []})));
        });
    }

    #[test]
    fn test_request_line_carries_protocol_and_context() {
        tokio_test::block_on(async {
            // Echo the request back as the result.
            let transport = sh(r#"read line; printf '{"success":true,"result":%s}\n' "$line""#);
            let descriptor = CapabilityDescriptor::new("detect_audio_events", TransportHandle::local("proc"));
            let response = transport.call(&descriptor, request()).await.expect("call");
            let echoed = response.result.expect("result");
            assert_eq!(echoed["op"], "invoke");
            assert_eq!(echoed["protocol"], PROCESS_PROTOCOL);
            assert_eq!(echoed["request"]["context"]["task_id"], "t1");
            assert_eq!(echoed["request"]["capability_name"], "detect_audio_events");
        });
    }

    #[test]
    fn test_discover_stamps_process_endpoint() {
        tokio_test::block_on(async {
            let transport = sh(
                r#"cat >/dev/null; printf '{"capabilities":[{"name":"detect_audio_events","produces":"audio_events"}]}'"#,
            );
            let descriptors = transport.discover().await.expect("discover");
            assert_eq!(descriptors.len(), 1);
            assert_eq!(descriptors[0].transport.provider, "proc");
            assert!(matches!(
                descriptors[0].transport.endpoint,
                Endpoint::Process { ref command, .. } if command == "sh"
            ));
        });
    }

    #[test]
    fn test_failures_are_classified() {
        tokio_test::block_on(async {
            let descriptor = CapabilityDescriptor::new("x", TransportHandle::local("proc"));

            let crashed = sh("cat >/dev/null; echo boom >&2; exit 3");
            let err = crashed.call(&descriptor, request()).await.unwrap_err();
            assert!(matches!(err, TransportFailure::Unavailable { status: 3, .. }));

            let garbage = sh("cat >/dev/null; echo not-json");
            let err = garbage.call(&descriptor, request()).await.unwrap_err();
            assert!(matches!(err, TransportFailure::Protocol(_)));

            let missing = ProcessTransport::new("proc", "/nonexistent/labelaudio-provider");
            let err = missing.call(&descriptor, request()).await.unwrap_err();
            assert!(matches!(err, TransportFailure::Connection(_)));
        });
    }
}
