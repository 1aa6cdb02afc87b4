//! Docker CLI provider implementation.
//!
//! Shells out to a Docker-compatible binary with JSON `--format` output.
//! `SANDBOX_ENDPOINT` is exported as `DOCKER_HOST` on every invocation so a
//! remote daemon works without touching the caller's environment.

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::error::{ProviderError, ProviderErrorCode, ProviderResult};
use super::{
    validate_image_name, validate_runtime_ref, ContainerInspect, ContainerSpec, ProviderEvent,
    SandboxProvider,
};

/// Hard cap on a single provider call.
const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Buffer for the event stream channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Docker CLI client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    endpoint: Option<String>,
}

impl DockerCli {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            endpoint,
        }
    }

    #[allow(dead_code)]
    pub fn with_binary(binary: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            endpoint,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref endpoint) = self.endpoint {
            cmd.env("DOCKER_HOST", endpoint);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// Run a provider command and return trimmed stdout.
    async fn run(&self, label: &str, args: &[String]) -> ProviderResult<String> {
        let mut cmd = self.command();
        cmd.args(args);

        debug!("provider command: {} {:?}", label, args);

        let output = tokio::time::timeout(CALL_DEADLINE, cmd.output())
            .await
            .map_err(|_| ProviderError::timeout(label))?
            .map_err(|e| ProviderError::command_failed(label, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = if is_not_found_message(&stderr) {
                ProviderErrorCode::NotFound
            } else {
                ProviderErrorCode::CommandFailed
            };
            return Err(ProviderError::new(
                code,
                format!("{label}: {}", stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a command where "not found" counts as success (idempotent removals).
    async fn run_tolerating_missing(&self, label: &str, args: &[String]) -> ProviderResult<()> {
        match self.run(label, args).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("no such volume")
        || lower.contains("not found")
}

#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
}

#[derive(Debug, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Parse the inspect `Ports` map (`"3000/tcp" -> [{HostPort: "41820"}]`)
/// into container-port keyed host mappings.
fn parse_port_map(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
) -> HashMap<u16, Option<u16>> {
    let mut parsed = HashMap::new();
    for (key, bindings) in ports {
        let Some(container_port) = key
            .split('/')
            .next()
            .and_then(|raw| raw.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .as_ref()
            .and_then(|list| list.first())
            .and_then(|binding| binding.host_port.parse::<u16>().ok());
        parsed.insert(container_port, host_port);
    }
    parsed
}

#[async_trait]
impl SandboxProvider for DockerCli {
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String> {
        validate_image_name(&spec.image)?;
        validate_runtime_ref(&spec.name)?;

        let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];

        if let Some(ref hostname) = spec.hostname {
            validate_runtime_ref(hostname)?;
            args.push("--hostname".into());
            args.push(hostname.clone());
        }
        if let Some(ref network) = spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (source, target) in &spec.binds {
            args.push("-v".into());
            args.push(format!("{source}:{target}"));
        }
        if let Some(ref workdir) = spec.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        if spec.restart_max_retries > 0 {
            args.push("--restart".into());
            args.push(format!("on-failure:{}", spec.restart_max_retries));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        self.run("create", &args).await
    }

    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()> {
        validate_runtime_ref(runtime_id)?;
        self.run("start", &["start".into(), runtime_id.into()])
            .await?;
        Ok(())
    }

    async fn stop_container(&self, runtime_id: &str) -> ProviderResult<()> {
        validate_runtime_ref(runtime_id)?;
        self.run_tolerating_missing("stop", &["stop".into(), runtime_id.into()])
            .await
    }

    async fn remove_container(&self, runtime_id: &str, force: bool) -> ProviderResult<()> {
        validate_runtime_ref(runtime_id)?;
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("-f".into());
        }
        args.push(runtime_id.into());
        self.run_tolerating_missing("rm", &args).await
    }

    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>> {
        validate_runtime_ref(runtime_id)?;
        let output = match self
            .run(
                "inspect",
                &[
                    "inspect".into(),
                    "--format".into(),
                    "{{json .}}".into(),
                    runtime_id.into(),
                ],
            )
            .await
        {
            Ok(output) => output,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let parsed: InspectOutput =
            serde_json::from_str(&output).map_err(ProviderError::parse)?;

        Ok(Some(ContainerInspect {
            state: parsed.state.status,
            ports: parse_port_map(&parsed.network_settings.ports),
        }))
    }

    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool> {
        Ok(self.inspect(runtime_id).await?.is_some())
    }

    async fn create_network(&self, name: &str) -> ProviderResult<()> {
        validate_runtime_ref(name)?;
        match self
            .run("network create", &["network".into(), "create".into(), name.into()])
            .await
        {
            Ok(_) => Ok(()),
            // Already existing networks make creation idempotent.
            Err(err) if err.message.contains("already exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn remove_network(&self, name: &str) -> ProviderResult<()> {
        validate_runtime_ref(name)?;
        self.run_tolerating_missing("network rm", &["network".into(), "rm".into(), name.into()])
            .await
    }

    async fn connect(
        &self,
        runtime_id: &str,
        network: &str,
        aliases: &[String],
    ) -> ProviderResult<()> {
        validate_runtime_ref(runtime_id)?;
        validate_runtime_ref(network)?;
        let mut args: Vec<String> = vec!["network".into(), "connect".into()];
        for alias in aliases {
            validate_runtime_ref(alias)?;
            args.push("--alias".into());
            args.push(alias.clone());
        }
        args.push(network.into());
        args.push(runtime_id.into());
        self.run("network connect", &args).await?;
        Ok(())
    }

    async fn disconnect(&self, runtime_id: &str, network: &str) -> ProviderResult<()> {
        validate_runtime_ref(runtime_id)?;
        validate_runtime_ref(network)?;
        self.run_tolerating_missing(
            "network disconnect",
            &[
                "network".into(),
                "disconnect".into(),
                network.into(),
                runtime_id.into(),
            ],
        )
        .await
    }

    async fn is_connected(&self, runtime_id: &str, network: &str) -> ProviderResult<bool> {
        validate_runtime_ref(runtime_id)?;
        let output = match self
            .run(
                "inspect",
                &[
                    "inspect".into(),
                    "--format".into(),
                    "{{json .NetworkSettings.Networks}}".into(),
                    runtime_id.into(),
                ],
            )
            .await
        {
            Ok(output) => output,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };

        let networks: HashMap<String, serde_json::Value> =
            serde_json::from_str(&output).map_err(ProviderError::parse)?;
        Ok(networks.contains_key(network))
    }

    async fn create_volume(&self, name: &str) -> ProviderResult<()> {
        validate_runtime_ref(name)?;
        self.run("volume create", &["volume".into(), "create".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ProviderResult<()> {
        validate_runtime_ref(name)?;
        self.run_tolerating_missing("volume rm", &["volume".into(), "rm".into(), name.into()])
            .await
    }

    async fn stream_events(
        &self,
        label_filter: &str,
    ) -> ProviderResult<mpsc::Receiver<ProviderEvent>> {
        let mut cmd = self.command();
        cmd.args([
            "events",
            "--format",
            "{{json .}}",
            "--filter",
            &format!("label={label_filter}"),
        ]);
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::command_failed("events", e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::command_failed("events", "event stream has no stdout")
        })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let raw: RawEvent = match serde_json::from_str(&line) {
                            Ok(raw) => raw,
                            Err(err) => {
                                warn!("skipping unparseable provider event: {err}");
                                continue;
                            }
                        };
                        let event = ProviderEvent {
                            action: raw.action,
                            runtime_id: raw.actor.id,
                            attributes: raw.actor.attributes,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("provider event stream read error: {err}");
                        break;
                    }
                }
            }
            // Child is killed on drop; reap it so it does not linger.
            let _ = child.kill().await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> ProviderResult<String> {
        let output = self
            .run(
                "version",
                &["version".into(), "--format".into(), "{{json .}}".into()],
            )
            .await
            .map_err(|err| ProviderError::new(ProviderErrorCode::Unavailable, err.message))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inspect_port_map() {
        let raw = r#"{"3000/tcp": [{"HostPort": "41820"}], "9229/tcp": null}"#;
        let ports: HashMap<String, Option<Vec<PortBinding>>> =
            serde_json::from_str(raw).unwrap();
        let parsed = parse_port_map(&ports);
        assert_eq!(parsed.get(&3000), Some(&Some(41820)));
        assert_eq!(parsed.get(&9229), Some(&None));
    }

    #[test]
    fn parses_event_line() {
        let raw = r#"{"Action":"die","Actor":{"ID":"abc123","Attributes":{"lab.session":"s1","exitCode":"137"}}}"#;
        let event: RawEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.action, "die");
        assert_eq!(event.actor.id, "abc123");
        assert_eq!(event.actor.attributes["lab.session"], "s1");
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found_message("Error: No such container: abc"));
        assert!(is_not_found_message("Error: No such network: lab-x"));
        assert!(!is_not_found_message("permission denied"));
    }
}
