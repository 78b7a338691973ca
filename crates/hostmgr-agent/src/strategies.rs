//! Configuration strategies: fetched from the control plane per slot and
//! rendered into the slot's volume directories before container creation.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use hostmgr_proto::control_v1::{
    self, GetRenderedStrategiesRequest,
    config_strategy_service_client::ConfigStrategyServiceClient,
};
use hostmgr_session::{ServerId, SlotId};
use tokio::io::AsyncWriteExt;
use tonic::transport::{Channel, Endpoint};

use crate::volumes::{ResolvedVolume, normalize_rel_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyFormat {
    Raw,
    Properties,
    Json,
    Yaml,
    Toml,
}

impl StrategyFormat {
    fn from_proto(raw: i32) -> Option<Self> {
        match control_v1::StrategyFormat::try_from(raw).ok()? {
            control_v1::StrategyFormat::Unspecified => None,
            control_v1::StrategyFormat::Raw => Some(StrategyFormat::Raw),
            control_v1::StrategyFormat::Properties => Some(StrategyFormat::Properties),
            control_v1::StrategyFormat::Json => Some(StrategyFormat::Json),
            control_v1::StrategyFormat::Yaml => Some(StrategyFormat::Yaml),
            control_v1::StrategyFormat::Toml => Some(StrategyFormat::Toml),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub name: String,
    pub volume_name: String,
    pub target_path: String,
    pub format: StrategyFormat,
    pub content: String,
    pub values: BTreeMap<String, String>,
    pub merge: bool,
}

impl TryFrom<control_v1::RenderedStrategy> for Strategy {
    type Error = anyhow::Error;

    fn try_from(value: control_v1::RenderedStrategy) -> Result<Self, Self::Error> {
        let format = StrategyFormat::from_proto(value.format)
            .ok_or_else(|| anyhow::anyhow!("strategy {}: unknown format {}", value.name, value.format))?;
        Ok(Self {
            name: value.name,
            volume_name: value.volume_name,
            target_path: value.target_path,
            format,
            content: value.content,
            values: value.values.into_iter().collect(),
            merge: value.merge,
        })
    }
}

#[async_trait::async_trait]
pub trait StrategySource: Send + Sync {
    async fn fetch(&self, server: ServerId, slot: SlotId) -> anyhow::Result<Vec<Strategy>>;
}

/// Used when no control-plane endpoint is configured.
#[derive(Debug, Default)]
pub struct NoStrategies;

#[async_trait::async_trait]
impl StrategySource for NoStrategies {
    async fn fetch(&self, _server: ServerId, _slot: SlotId) -> anyhow::Result<Vec<Strategy>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneStrategies {
    channel: Channel,
    token: Option<String>,
}

impl ControlPlaneStrategies {
    /// The channel connects lazily, so an unreachable control plane only
    /// fails individual fetches.
    pub fn new(url: &str, timeout: Duration, token: Option<String>) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(url.to_string())
            .with_context(|| format!("invalid control-plane url: {url}"))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Self { channel, token })
    }
}

#[async_trait::async_trait]
impl StrategySource for ControlPlaneStrategies {
    async fn fetch(&self, server: ServerId, slot: SlotId) -> anyhow::Result<Vec<Strategy>> {
        let mut client = ConfigStrategyServiceClient::new(self.channel.clone());
        let mut req = tonic::Request::new(GetRenderedStrategiesRequest {
            server_id: server.0,
            slot_id: slot.0,
        });
        if let Some(token) = &self.token {
            let value = format!("Bearer {token}")
                .parse()
                .context("node token is not a valid header value")?;
            req.metadata_mut().insert("authorization", value);
        }
        let resp = client
            .get_rendered_strategies(req)
            .await
            .context("fetch rendered strategies")?
            .into_inner();

        let mut out = Vec::with_capacity(resp.strategies.len());
        for raw in resp.strategies {
            match Strategy::try_from(raw) {
                Ok(s) => out.push(s),
                Err(e) => tracing::warn!(slot_id = %slot, error = %e, "skipping strategy"),
            }
        }
        Ok(out)
    }
}

fn json_scalar(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

fn yaml_scalar(raw: &str) -> serde_yaml::Value {
    match serde_yaml::from_str::<serde_yaml::Value>(raw) {
        Ok(v @ (serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_))) => v,
        _ => serde_yaml::Value::String(raw.to_string()),
    }
}

fn toml_scalar(raw: &str) -> toml::Value {
    let parsed = toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"));
    match parsed {
        Some(v @ (toml::Value::Boolean(_) | toml::Value::Integer(_) | toml::Value::Float(_))) => v,
        _ => toml::Value::String(raw.to_string()),
    }
}

fn render_properties(values: &BTreeMap<String, String>, existing: Option<&str>) -> String {
    let mut pending: BTreeMap<&str, &str> =
        values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let mut out = String::new();
    for line in existing.unwrap_or_default().lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#')
            && !trimmed.starts_with('!')
            && let Some((k, _)) = trimmed.split_once('=')
            && let Some(v) = pending.remove(k.trim())
        {
            out.push_str(&format!("{}={v}\n", k.trim()));
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for (k, v) in pending {
        out.push_str(&format!("{k}={v}\n"));
    }
    out
}

fn render_json(values: &BTreeMap<String, String>, existing: Option<&str>) -> anyhow::Result<String> {
    let mut doc = match existing {
        Some(raw) if !raw.trim().is_empty() => {
            match serde_json::from_str::<serde_json::Value>(raw).context("parse existing json")? {
                serde_json::Value::Object(map) => map,
                _ => anyhow::bail!("existing json is not an object"),
            }
        }
        _ => serde_json::Map::new(),
    };
    for (k, v) in values {
        doc.insert(k.clone(), json_scalar(v));
    }
    let mut out = serde_json::to_string_pretty(&serde_json::Value::Object(doc))?;
    out.push('\n');
    Ok(out)
}

fn render_yaml(values: &BTreeMap<String, String>, existing: Option<&str>) -> anyhow::Result<String> {
    let mut doc = match existing {
        Some(raw) if !raw.trim().is_empty() => {
            match serde_yaml::from_str::<serde_yaml::Value>(raw).context("parse existing yaml")? {
                serde_yaml::Value::Mapping(map) => map,
                serde_yaml::Value::Null => serde_yaml::Mapping::new(),
                _ => anyhow::bail!("existing yaml is not a mapping"),
            }
        }
        _ => serde_yaml::Mapping::new(),
    };
    for (k, v) in values {
        doc.insert(serde_yaml::Value::String(k.clone()), yaml_scalar(v));
    }
    Ok(serde_yaml::to_string(&serde_yaml::Value::Mapping(doc))?)
}

fn render_toml(values: &BTreeMap<String, String>, existing: Option<&str>) -> anyhow::Result<String> {
    let mut doc = match existing {
        Some(raw) if !raw.trim().is_empty() => {
            toml::from_str::<toml::Table>(raw).context("parse existing toml")?
        }
        _ => toml::Table::new(),
    };
    for (k, v) in values {
        doc.insert(k.clone(), toml_scalar(v));
    }
    Ok(toml::to_string(&doc)?)
}

/// `existing` is only consulted when the strategy asks for a merge.
pub fn render(strategy: &Strategy, existing: Option<&str>) -> anyhow::Result<String> {
    let existing = if strategy.merge { existing } else { None };
    match strategy.format {
        StrategyFormat::Raw => Ok(strategy.content.clone()),
        StrategyFormat::Properties => Ok(render_properties(&strategy.values, existing)),
        StrategyFormat::Json => render_json(&strategy.values, existing),
        StrategyFormat::Yaml => render_yaml(&strategy.values, existing),
        StrategyFormat::Toml => render_toml(&strategy.values, existing),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    if let Ok(meta) = tokio::fs::symlink_metadata(path).await {
        if meta.file_type().is_symlink() {
            anyhow::bail!("refusing to write through symlink {}", path.display());
        }
        if meta.is_dir() {
            anyhow::bail!("{} is a directory", path.display());
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

async fn apply_one(strategy: &Strategy, volumes: &[ResolvedVolume]) -> anyhow::Result<()> {
    let volume = volumes
        .iter()
        .find(|v| v.name == strategy.volume_name)
        .ok_or_else(|| anyhow::anyhow!("no volume named {:?}", strategy.volume_name))?;
    let rel = normalize_rel_path(&strategy.target_path)?;
    if rel.as_os_str().is_empty() {
        anyhow::bail!("target path is empty");
    }
    let path = volume.host_path.join(rel);

    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let rendered = render(strategy, existing.as_deref())?;
    write_atomic(&path, rendered.as_bytes()).await
}

/// Best-effort: a strategy that cannot be applied is logged and skipped.
/// Returns the number of files written.
pub async fn apply(strategies: &[Strategy], volumes: &[ResolvedVolume]) -> usize {
    let mut written = 0;
    for s in strategies {
        match apply_one(s, volumes).await {
            Ok(()) => {
                tracing::debug!(strategy = %s.name, volume = %s.volume_name, target = %s.target_path, "strategy rendered");
                written += 1;
            }
            Err(e) => {
                tracing::warn!(strategy = %s.name, volume = %s.volume_name, error = %format!("{e:#}"), "strategy skipped");
            }
        }
    }
    written
}
