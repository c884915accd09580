use serde::Serialize;

use crate::config::StreamOpts;

/// What the probe learned about a file. Zero (or a non-finite fps) means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProbedMedia {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container duration in seconds, when the probe reports one.
    pub duration_secs: Option<f64>,
}

/// Frame rate and size handed to the encoder.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StreamParams {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

// Size tiers: anything at or above 4K is sent as 1440p, anything at or above
// 1440p as 1080p. Smaller sources pass through untouched.
const UHD: (u32, u32) = (3840, 2160);
const QHD: (u32, u32) = (2560, 1440);
const FHD: (u32, u32) = (1920, 1080);

pub fn effective_params(probed: &ProbedMedia, fallback: &StreamOpts) -> StreamParams {
    let fps = if probed.fps > 0.0 { probed.fps } else { fallback.fps };
    let width = if probed.width > 0 { probed.width } else { fallback.width };
    let height = if probed.height > 0 { probed.height } else { fallback.height };

    let (width, height) = if width >= UHD.0 || height >= UHD.1 {
        QHD
    } else if width >= QHD.0 || height >= QHD.1 {
        FHD
    } else {
        (width, height)
    };

    StreamParams { fps, width, height }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> StreamOpts {
        StreamOpts { fps: 30.0, width: 1280, height: 720, ..StreamOpts::default() }
    }

    fn probed(fps: f64, width: u32, height: u32) -> ProbedMedia {
        ProbedMedia { fps, width, height, duration_secs: None }
    }

    #[test]
    fn unknown_size_uses_fallback() {
        let p = effective_params(&probed(30.0, 0, 0), &fallback());
        assert_eq!(p, StreamParams { fps: 30.0, width: 1280, height: 720 });
    }

    #[test]
    fn unknown_fps_uses_fallback() {
        let p = effective_params(&probed(f64::NAN, 640, 360), &fallback());
        assert_eq!(p.fps, 30.0);
        assert_eq!((p.width, p.height), (640, 360));
    }

    #[test]
    fn uhd_is_capped_to_1440p() {
        let p = effective_params(&probed(24.0, 3840, 2160), &fallback());
        assert_eq!(p, StreamParams { fps: 24.0, width: 2560, height: 1440 });
    }

    #[test]
    fn qhd_is_capped_to_1080p() {
        let p = effective_params(&probed(24.0, 2560, 1440), &fallback());
        assert_eq!(p, StreamParams { fps: 24.0, width: 1920, height: 1080 });
    }

    #[test]
    fn either_dimension_triggers_the_cap() {
        // Ultra-wide 3840x1600 still counts as 4K.
        let p = effective_params(&probed(24.0, 3840, 1600), &fallback());
        assert_eq!((p.width, p.height), (2560, 1440));
        // Portrait 1080x2160.
        let p = effective_params(&probed(24.0, 1080, 2160), &fallback());
        assert_eq!((p.width, p.height), (2560, 1440));
    }

    #[test]
    fn below_qhd_passes_through() {
        for (w, h) in [(1920, 1080), (2559, 1439), (854, 480)] {
            let p = effective_params(&probed(25.0, w, h), &fallback());
            assert_eq!((p.width, p.height), (w, h));
        }
    }
}
