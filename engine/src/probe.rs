use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::resolution::ProbedMedia;

/// Reads frame rate, size and duration from a media file.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> anyhow::Result<ProbedMedia>;
}

/// `ffprobe` as an external subprocess.
pub struct Ffprobe {
    binary: String,
}

impl Ffprobe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl MediaProbe for Ffprobe {
    async fn probe(&self, path: &Path) -> anyhow::Result<ProbedMedia> {
        let out = Command::new(&self.binary)
            .arg("-v").arg("error")
            .arg("-select_streams").arg("v:0")
            .arg("-show_entries").arg("stream=r_frame_rate,width,height:format=duration")
            .arg("-of").arg("json")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.binary))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!("{} exited with {}: {}", self.binary, out.status, stderr.trim());
        }

        parse_probe_output(&out.stdout)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    r_frame_rate: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub fn parse_probe_output(raw: &[u8]) -> anyhow::Result<ProbedMedia> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).context("ffprobe output is not valid JSON")?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| anyhow::anyhow!("no video stream found"))?;

    let fps = match stream.r_frame_rate.as_deref() {
        Some(rate) => parse_frame_rate(rate)?,
        None => 0.0,
    };

    let duration_secs = match parsed.format.and_then(|f| f.duration) {
        Some(d) => {
            let secs: f64 = d.trim().parse().with_context(|| format!("invalid duration {d:?}"))?;
            (secs.is_finite() && secs > 0.0).then_some(secs)
        }
        None => None,
    };

    Ok(ProbedMedia {
        fps,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        duration_secs,
    })
}

/// `r_frame_rate` is a rational like "24000/1001". "0/0" means unknown.
fn parse_frame_rate(rate: &str) -> anyhow::Result<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let num: f64 = num.trim().parse().with_context(|| format!("invalid frame rate {rate:?}"))?;
    let den: f64 = den.trim().parse().with_context(|| format!("invalid frame rate {rate:?}"))?;
    let fps = num / den;
    Ok(if fps.is_finite() && fps > 0.0 { fps } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_output() {
        let raw = br#"{
            "programs": [],
            "streams": [{"width": 1920, "height": 1080, "r_frame_rate": "24000/1001"}],
            "format": {"duration": "5423.104000"}
        }"#;
        let m = parse_probe_output(raw).unwrap();
        assert_eq!((m.width, m.height), (1920, 1080));
        assert!((m.fps - 23.976).abs() < 0.001);
        assert_eq!(m.duration_secs, Some(5423.104));
    }

    #[test]
    fn zero_over_zero_is_unknown() {
        let raw = br#"{"streams": [{"width": 640, "height": 480, "r_frame_rate": "0/0"}]}"#;
        let m = parse_probe_output(raw).unwrap();
        assert_eq!(m.fps, 0.0);
        assert_eq!(m.duration_secs, None);
    }

    #[test]
    fn missing_stream_is_an_error() {
        assert!(parse_probe_output(br#"{"streams": []}"#).is_err());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[test]
    fn non_numeric_fields_are_errors() {
        let raw = br#"{"streams": [{"width": 640, "height": 480, "r_frame_rate": "abc/1"}]}"#;
        assert!(parse_probe_output(raw).is_err());
        let raw = br#"{"streams": [{"width": "wide", "height": 480}]}"#;
        assert!(parse_probe_output(raw).is_err());
    }
}
