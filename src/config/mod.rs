use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color::{ColorTable, PaletteBook};
use crate::model::EventKind;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "HUEBRIDGE_";
const APP_DIR: &str = "HueEventSub";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub eventsub: EventSubConfig,
    pub helix: HelixConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub hue: HueConfig,
    pub chat: ChatConfig,
    pub effects: EffectsConfig,
    // Channel-points reward title -> lamp id.
    pub rewards: BTreeMap<String, String>,
    // Color name -> six digit hex code.
    pub colors: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eventsub: EventSubConfig::default(),
            helix: HelixConfig::default(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            hue: HueConfig::default(),
            chat: ChatConfig::default(),
            effects: EffectsConfig::default(),
            rewards: default_rewards(),
            colors: default_colors(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventSubConfig {
    pub url: String,
    pub dev_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_message_bytes: usize,
    pub subscriptions: Vec<EventKind>,
}

impl Default for EventSubConfig {
    fn default() -> Self {
        Self {
            url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
            dev_url: "ws://127.0.0.1:8080/ws".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2500,
            max_message_bytes: 1024 * 1024,
            subscriptions: vec![
                EventKind::ChannelPointsRedemption,
                EventKind::Subscribe,
                EventKind::SubscriptionGift,
                EventKind::SubscriptionMessage,
                EventKind::Cheer,
                EventKind::StreamOnline,
                EventKind::StreamOffline,
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HelixConfig {
    pub api_base: String,
    pub auth_base: String,
    pub dev_api_base: String,
    pub dev_auth_base: String,
    pub timeout_ms: u64,
}

impl Default for HelixConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twitch.tv/helix/".to_string(),
            auth_base: "https://id.twitch.tv/oauth2/".to_string(),
            dev_api_base: "http://127.0.0.1:8080/".to_string(),
            dev_auth_base: "http://127.0.0.1:8080/oauth2/".to_string(),
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub dev_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "appsettings.json".to_string(),
            dev_path: "devmodesettings.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub command_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            command_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HueConfig {
    pub dry_run: bool,
    pub brightness: u8,
    pub timeout_ms: u64,
    // Lamp id used in commands -> Hue light id on the bridge.
    pub lamps: BTreeMap<String, String>,
}

impl Default for HueConfig {
    fn default() -> Self {
        let lamps = [("left", "1"), ("right", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            dry_run: false,
            brightness: 254,
            timeout_ms: 5_000,
            lamps,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    pub lamp: String,
    pub max_command_chars: usize,
    pub invalid_color_reply: String,
    pub invalid_effect_reply: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            lamp: "left".to_string(),
            max_command_chars: 30,
            invalid_color_reply: "@{user} Unfortunately it appears that '{input}' is not currently supported, or an invalid hex code was provided. A random color was chosen instead.".to_string(),
            invalid_effect_reply: "@{user} Unfortunately it appears that '{input}' is not currently supported. The default effect was played instead.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub duration_ms: u64,
    pub default_palette: String,
    // Event category -> palette name.
    pub events: BTreeMap<String, String>,
    // Palette name -> hex colors played in order.
    pub palettes: BTreeMap<String, Vec<String>>,
}

pub mod categories {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIPTION_GIFT: &str = "subscription_gift";
    pub const SUBSCRIPTION_MESSAGE: &str = "subscription_message";
    pub const CHEER: &str = "cheer";
}

impl Default for EffectsConfig {
    fn default() -> Self {
        let events = [
            (categories::SUBSCRIBE, "subscription"),
            (categories::SUBSCRIPTION_GIFT, "gifted_subscription"),
            (categories::SUBSCRIPTION_MESSAGE, "resubscription"),
            (categories::CHEER, "cheer"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let palettes = [
            ("default", &["FFFFFF", "FFB347", "FFFFFF"][..]),
            ("subscription", &["9146FF", "FFFFFF", "9146FF", "FFFFFF"][..]),
            ("gifted_subscription", &["FFD700", "FF69B4", "FFD700", "FF69B4"][..]),
            ("resubscription", &["00BFFF", "9146FF", "00BFFF"][..]),
            ("cheer", &["FF0000", "FF7F00", "FFFF00", "00FF00", "0000FF", "8B00FF"][..]),
            ("alternate", &["FF0000", "0000FF", "FF0000", "0000FF"][..]),
        ]
        .into_iter()
        .map(|(name, colors)| {
            (
                name.to_string(),
                colors.iter().map(|c| c.to_string()).collect(),
            )
        })
        .collect();

        Self {
            duration_ms: 5_000,
            default_palette: "default".to_string(),
            events,
            palettes,
        }
    }
}

fn default_rewards() -> BTreeMap<String, String> {
    [
        ("Change left lamp color", "left"),
        ("Change right lamp color", "right"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_colors() -> BTreeMap<String, String> {
    [
        ("red", "FF0000"),
        ("green", "00FF00"),
        ("blue", "0000FF"),
        ("white", "FFFFFF"),
        ("yellow", "FFFF00"),
        ("orange", "FFA500"),
        ("purple", "800080"),
        ("pink", "FFC0CB"),
        ("hotpink", "FF69B4"),
        ("cyan", "00FFFF"),
        ("magenta", "FF00FF"),
        ("teal", "008080"),
        ("gold", "FFD700"),
        ("lime", "32CD32"),
        ("indigo", "4B0082"),
        ("violet", "EE82EE"),
        ("twitch", "9146FF"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw).map_err(|err| {
                format!("invalid config at {}: {err}", config_path.display())
            })?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| env::var(format!("{ENV_PREFIX}{name}")).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("EVENTSUB_URL") {
            self.eventsub.url = val;
        }
        if let Some(val) = lookup("EVENTSUB_DEV_URL") {
            self.eventsub.dev_url = val;
        }
        if let Some(val) = lookup("RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.eventsub.max_reconnect_attempts = n;
            }
        }
        if let Some(val) = lookup("RECONNECT_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                self.eventsub.reconnect_delay_ms = ms;
            }
        }

        if let Some(val) = lookup("HELIX_API_BASE") {
            self.helix.api_base = val;
        }
        if let Some(val) = lookup("AUTH_BASE") {
            self.helix.auth_base = val;
        }

        if let Some(val) = lookup("STORE_PATH") {
            self.store.path = val;
        }
        if let Some(val) = lookup("DEV_STORE_PATH") {
            self.store.dev_path = val;
        }

        if let Some(val) = lookup("QUEUE_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.queue.capacity = n;
            }
        }
        if let Some(val) = lookup("COMMAND_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.queue.command_timeout_ms = ms;
            }
        }

        if let Some(val) = lookup("HUE_DRY_RUN") {
            self.hue.dry_run = val.parse().unwrap_or(false);
        }
        if let Some(val) = lookup("EFFECT_DURATION_MS") {
            if let Ok(ms) = val.parse() {
                self.effects.duration_ms = ms;
            }
        }
        if let Some(val) = lookup("CHAT_LAMP") {
            self.chat.lamp = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        for (name, url) in [
            ("eventsub.url", &self.eventsub.url),
            ("eventsub.dev_url", &self.eventsub.dev_url),
            ("helix.api_base", &self.helix.api_base),
            ("helix.auth_base", &self.helix.auth_base),
            ("helix.dev_api_base", &self.helix.dev_api_base),
            ("helix.dev_auth_base", &self.helix.dev_auth_base),
        ] {
            Url::parse(url.trim()).map_err(|err| format!("{name} is not a valid url: {err}"))?;
        }
        if self.eventsub.max_reconnect_attempts == 0 {
            return Err("eventsub.max_reconnect_attempts must be >= 1".into());
        }
        if self.eventsub.max_message_bytes < 1024 {
            return Err("eventsub.max_message_bytes must be >= 1024".into());
        }
        if self.queue.capacity == 0 {
            return Err("queue.capacity must be non-zero".into());
        }
        if self.queue.command_timeout_ms == 0 {
            return Err("queue.command_timeout_ms must be non-zero".into());
        }
        if self.store.path.trim().is_empty() || self.store.dev_path.trim().is_empty() {
            return Err("store.path and store.dev_path must be set".into());
        }
        if self.hue.lamps.is_empty() {
            return Err("hue.lamps must map at least one lamp".into());
        }
        if !self.hue.lamps.contains_key(&self.chat.lamp) {
            return Err(format!("chat.lamp '{}' is not listed in hue.lamps", self.chat.lamp).into());
        }
        for (title, lamp) in &self.rewards {
            if !self.hue.lamps.contains_key(lamp) {
                return Err(format!("reward '{title}' targets unknown lamp '{lamp}'").into());
            }
        }

        ColorTable::new(&self.colors).map_err(|err| format!("colors: {err}"))?;
        if self.effects.duration_ms == 0 {
            return Err("effects.duration_ms must be non-zero".into());
        }
        let palettes =
            PaletteBook::from_config(&self.effects).map_err(|err| format!("effects: {err}"))?;
        for (category, palette) in &self.effects.events {
            if palettes.get(palette).is_none() {
                return Err(format!(
                    "effects.events.{category} references unknown palette '{palette}'"
                )
                .into());
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    pub fn eventsub_url(&self, dev: bool) -> &str {
        if dev {
            &self.eventsub.dev_url
        } else {
            &self.eventsub.url
        }
    }

    pub fn api_base(&self, dev: bool) -> &str {
        if dev {
            &self.helix.dev_api_base
        } else {
            &self.helix.api_base
        }
    }

    pub fn auth_base(&self, dev: bool) -> &str {
        if dev {
            &self.helix.dev_auth_base
        } else {
            &self.helix.auth_base
        }
    }

    pub fn store_path(&self, dev: bool) -> PathBuf {
        if dev {
            PathBuf::from(&self.store.dev_path)
        } else {
            PathBuf::from(&self.store.path)
        }
    }

    pub fn subscriptions(&self, dev: bool) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .eventsub
            .subscriptions
            .iter()
            .copied()
            .filter(|k| dev || *k != EventKind::ChatMessage)
            .collect();
        if dev && !kinds.contains(&EventKind::ChatMessage) {
            kinds.push(EventKind::ChatMessage);
        }
        kinds
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
