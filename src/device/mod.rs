use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::color::{Palette, Rgb};
use crate::config::HueConfig;
use crate::store::{keys, ConfigStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LampTarget {
    Lamp(String),
    All,
}

impl std::fmt::Display for LampTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lamp(id) => write!(f, "{id}"),
            Self::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device transport error: {0}")]
    Transport(String),
    #[error("device request timed out")]
    Timeout,
    #[error("lamp '{0}' not found")]
    NotFound(String),
    #[error("device api error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("device not configured: {0}")]
    Unconfigured(&'static str),
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait DeviceCommandPort: Send + Sync {
    async fn set_color(&self, lamp: &str, color: Rgb) -> Result<(), DeviceError>;

    async fn run_effect(
        &self,
        target: &LampTarget,
        palette: &Palette,
        duration: Duration,
    ) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LightState {
    pub on: bool,
    pub xy: [f64; 2],
    pub bri: u8,
}

impl LightState {
    pub fn for_color(color: Rgb, bri: u8) -> Self {
        let (x, y) = color.to_xy();
        Self {
            on: true,
            xy: [x, y],
            bri,
        }
    }
}

pub struct HueBridgePort {
    http: Client,
    store: Arc<ConfigStore>,
    lamps: BTreeMap<String, String>,
    brightness: u8,
}

impl HueBridgePort {
    pub fn new(store: Arc<ConfigStore>, config: &HueConfig) -> Result<Self, DeviceError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| DeviceError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            store,
            lamps: config.lamps.clone(),
            brightness: config.brightness,
        })
    }

    async fn bridge(&self) -> Result<(String, String), DeviceError> {
        let ip = self
            .store
            .get_non_empty(keys::BRIDGE_IP)
            .await
            .ok_or(DeviceError::Unconfigured("bridgeIp is not set in the store"))?;
        let app_key = self
            .store
            .get_non_empty(keys::APP_KEY)
            .await
            .ok_or(DeviceError::Unconfigured("AppKey is not set in the store"))?;
        Ok((ip, app_key))
    }

    fn light_id(&self, lamp: &str) -> Result<&str, DeviceError> {
        self.lamps
            .get(lamp)
            .map(String::as_str)
            .ok_or_else(|| DeviceError::NotFound(lamp.to_string()))
    }

    fn targets(&self, target: &LampTarget) -> Result<Vec<&str>, DeviceError> {
        match target {
            LampTarget::Lamp(lamp) => Ok(vec![self.light_id(lamp)?]),
            LampTarget::All => Ok(self.lamps.values().map(String::as_str).collect()),
        }
    }

    async fn put_state(
        &self,
        bridge: &(String, String),
        light_id: &str,
        color: Rgb,
    ) -> Result<(), DeviceError> {
        let state = LightState::for_color(color, self.brightness);
        let req = build_state_request(&self.http, &bridge.0, &bridge.1, light_id, &state)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_state_response(status, &body)
    }
}

#[async_trait]
impl DeviceCommandPort for HueBridgePort {
    async fn set_color(&self, lamp: &str, color: Rgb) -> Result<(), DeviceError> {
        let light_id = self.light_id(lamp)?.to_string();
        let bridge = self.bridge().await?;
        self.put_state(&bridge, &light_id, color).await?;
        tracing::debug!(lamp, light_id = %light_id, color = %color, "lamp color set");
        Ok(())
    }

    async fn run_effect(
        &self,
        target: &LampTarget,
        palette: &Palette,
        duration: Duration,
    ) -> Result<(), DeviceError> {
        if palette.colors.is_empty() {
            return Ok(());
        }
        let lights: Vec<String> = self.targets(target)?.into_iter().map(str::to_string).collect();
        let bridge = self.bridge().await?;
        let step = duration / palette.colors.len() as u32;

        for color in &palette.colors {
            for light_id in &lights {
                self.put_state(&bridge, light_id, *color).await?;
            }
            tokio::time::sleep(step).await;
        }
        tracing::debug!(target = %target, palette = %palette.name, "effect finished");
        Ok(())
    }
}

pub fn build_state_request(
    http: &Client,
    bridge_ip: &str,
    app_key: &str,
    light_id: &str,
    state: &LightState,
) -> Result<Request, DeviceError> {
    let url = Url::parse(&format!(
        "http://{}/api/{}/lights/{}/state",
        bridge_ip.trim(),
        app_key.trim(),
        light_id
    ))
    .map_err(|err| DeviceError::Transport(format!("invalid bridge url: {err}")))?;
    let body = serde_json::to_vec(state).map_err(|err| DeviceError::Transport(err.to_string()))?;
    http.request(Method::PUT, url)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(body)
        .build()
        .map_err(DeviceError::from)
}

// Hue v1 answers 200 even on failure and reports errors inside the body:
// `[{"error": {"type": 3, "description": "..."}}]`.
pub fn parse_state_response(status: StatusCode, body: &str) -> Result<(), DeviceError> {
    if !status.is_success() {
        return Err(DeviceError::Api {
            status,
            body: body.to_string(),
        });
    }
    let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(body) else {
        return Ok(());
    };
    if let Some(error) = items.iter().find_map(|item| item.get("error")) {
        let description = error
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("unknown error");
        return Err(DeviceError::Api {
            status,
            body: description.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct DryRunPort;

#[async_trait]
impl DeviceCommandPort for DryRunPort {
    async fn set_color(&self, lamp: &str, color: Rgb) -> Result<(), DeviceError> {
        let (x, y) = color.to_xy();
        tracing::info!(lamp, color = %color, x, y, "dry-run: set color");
        Ok(())
    }

    async fn run_effect(
        &self,
        target: &LampTarget,
        palette: &Palette,
        duration: Duration,
    ) -> Result<(), DeviceError> {
        tracing::info!(
            target = %target,
            palette = %palette.name,
            colors = palette.colors.len(),
            duration_ms = duration.as_millis() as u64,
            "dry-run: run effect"
        );
        Ok(())
    }
}
