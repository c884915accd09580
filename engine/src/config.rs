use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;

// --- Configuration ------------------------------------------------------------
//
// Settings come from a JSON file (WATCHPARTY_CONFIG, default ./config.json).
// A missing file is not an error: every field has a default so a fresh
// checkout starts with `cargo run`.
//
// A handful of deployment knobs can be overridden from the environment, the
// same way the bind address and tool paths always have been:
//   WATCHPARTY_BIND           127.0.0.1:3000
//   WATCHPARTY_FFMPEG         ffmpeg
//   WATCHPARTY_FFPROBE        ffprobe
//   WATCHPARTY_COUNTER_PATH   streamCount.txt
//   WATCHPARTY_REST_INTERVAL  15m

/// Fallback encode settings, used whenever the probe cannot tell us better.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamOpts {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub hardware_acceleration: bool,
    pub video_codec: String,
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            fps: 30.0,
            width: 1280,
            height: 720,
            bitrate_kbps: 1000,
            max_bitrate_kbps: 2500,
            hardware_acceleration: false,
            video_codec: "H264".into(),
        }
    }
}

/// One entry of the voice presence directory consumed by `StaticPlatform`.
#[derive(Clone, Debug, Deserialize)]
pub struct MemberPresence {
    pub guild_id: String,
    pub user_id: String,
    /// Voice channel the member currently sits in; absent = not in voice.
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub stage: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub stream: StreamOpts,
    /// Where the encoded MPEG-TS is pushed, one UDP datagram per 7 TS packets.
    pub relay_addr: SocketAddr,
    pub counter_path: PathBuf,
    #[serde(with = "duration_serde")]
    pub rest_interval: Duration,
    #[serde(with = "duration_serde")]
    pub collaborator_timeout: Duration,
    pub log_channel_id: Option<String>,
    pub notify_channel_id: Option<String>,
    pub directory: Vec<MemberPresence>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            stream: StreamOpts::default(),
            relay_addr: SocketAddr::from(([127, 0, 0, 1], 5004)),
            counter_path: PathBuf::from("streamCount.txt"),
            rest_interval: Duration::from_secs(15 * 60),
            collaborator_timeout: Duration::from_secs(30),
            log_channel_id: None,
            notify_channel_id: None,
            directory: Vec::new(),
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var("WATCHPARTY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"))
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_json(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("config {} not found, using defaults", path.display());
                Config::default()
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read config {}: {e}", path.display())),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Environment overrides win over the file.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(bind) = var("WATCHPARTY_BIND") {
            self.bind = bind
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid WATCHPARTY_BIND={bind}: {e}"))?;
        }
        if let Some(ffmpeg) = var("WATCHPARTY_FFMPEG") {
            self.ffmpeg = ffmpeg;
        }
        if let Some(ffprobe) = var("WATCHPARTY_FFPROBE") {
            self.ffprobe = ffprobe;
        }
        if let Some(path) = var("WATCHPARTY_COUNTER_PATH") {
            self.counter_path = PathBuf::from(path);
        }
        if let Some(rest) = var("WATCHPARTY_REST_INTERVAL") {
            self.rest_interval = humantime::parse_duration(&rest)
                .map_err(|e| anyhow::anyhow!("invalid WATCHPARTY_REST_INTERVAL={rest}: {e}"))?;
        }
        Ok(())
    }
}

/// Durations as either seconds (number) or a humantime string ("15m", "1h30m").
pub mod duration_serde {
    use std::{fmt, time::Duration};

    use serde::de::{self, Deserializer, Visitor};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration as seconds or a human-readable string (e.g. '15m')")
            }

            fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(secs))
            }

            fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
                u64::try_from(secs)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(format!("negative duration: {secs}")))
            }

            fn visit_f64<E: de::Error>(self, secs: f64) -> Result<Duration, E> {
                Duration::try_from_secs_f64(secs).map_err(|e| E::custom(format!("invalid duration {secs}: {e}")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                if let Ok(secs) = value.trim().parse::<f64>() {
                    return self.visit_f64(secs);
                }
                humantime::parse_duration(value)
                    .map_err(|e| E::custom(format!("invalid duration '{value}': {e}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    /// Same formats, for optional request fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(deserialize_with = "super::deserialize")] Duration);

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
        }
    }
}
