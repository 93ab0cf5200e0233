//! Stream geometry consumed by the timing parsers.

use std::fmt;

use crate::error::{ConfigErrorKind, Result, St2110Error};

/// RTP clock of ST 2110-20 video.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

pub(crate) const NS_PER_S: f64 = 1_000_000_000.0;

/// Video frame rates, with exact rational values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fps {
    P23_98,
    P24,
    P25,
    P29_97,
    P30,
    P50,
    P59_94,
    P60,
    P100,
    P119_88,
    P120,
}

impl Fps {
    pub const ALL: [Fps; 11] = [
        Fps::P23_98,
        Fps::P24,
        Fps::P25,
        Fps::P29_97,
        Fps::P30,
        Fps::P50,
        Fps::P59_94,
        Fps::P60,
        Fps::P100,
        Fps::P119_88,
        Fps::P120,
    ];

    /// Frame rate as `mul / den` frames per second.
    pub fn rational(self) -> (u32, u32) {
        match self {
            Self::P23_98 => (24000, 1001),
            Self::P24 => (24, 1),
            Self::P25 => (25, 1),
            Self::P29_97 => (30000, 1001),
            Self::P30 => (30, 1),
            Self::P50 => (50, 1),
            Self::P59_94 => (60000, 1001),
            Self::P60 => (60, 1),
            Self::P100 => (100, 1),
            Self::P119_88 => (120000, 1001),
            Self::P120 => (120, 1),
        }
    }

    pub fn as_f64(self) -> f64 {
        let (mul, den) = self.rational();
        mul as f64 / den as f64
    }

    /// Frame period in seconds.
    pub fn frame_time_s(self) -> f64 {
        let (mul, den) = self.rational();
        den as f64 / mul as f64
    }

    /// Frame period in nanoseconds.
    pub fn frame_time_ns(self) -> f64 {
        let (mul, den) = self.rational();
        NS_PER_S * den as f64 / mul as f64
    }

    /// Media clock ticks per frame (1501.5 for 59.94 at 90 kHz).
    pub fn frame_time_sampling(self, clock_rate: u32) -> f64 {
        let (mul, den) = self.rational();
        clock_rate as f64 * den as f64 / mul as f64
    }

    /// Parses the usual notations: `59.94`, `59`, `p59`, `29.97`, `25`...
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches(['p', 'P']);
        Some(match s {
            "23.98" | "23.976" | "23" => Self::P23_98,
            "24" => Self::P24,
            "25" => Self::P25,
            "29.97" | "29" => Self::P29_97,
            "30" => Self::P30,
            "50" => Self::P50,
            "59.94" | "59" => Self::P59_94,
            "60" => Self::P60,
            "100" => Self::P100,
            "119.88" | "119" => Self::P119_88,
            "120" => Self::P120,
            _ => return None,
        })
    }
}

impl fmt::Display for Fps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mul, den) = self.rational();
        if den == 1 {
            write!(f, "{mul}")
        } else {
            write!(f, "{:.2}", self.as_f64())
        }
    }
}

/// Nominal geometry of a video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub fps: Fps,
    /// Packets per frame (per field when interlaced), as detected on the wire.
    pub packets_per_frame: u32,
    /// RTP clock rate, 90 kHz for ST 2110-20.
    pub clock_rate: u32,
}

impl VideoGeometry {
    /// Progressive geometry at the 90 kHz video clock.
    pub fn progressive(width: u32, height: u32, fps: Fps, packets_per_frame: u32) -> Self {
        Self {
            width,
            height,
            interlaced: false,
            fps,
            packets_per_frame,
            clock_rate: VIDEO_CLOCK_RATE,
        }
    }

    pub fn interlaced(width: u32, height: u32, fps: Fps, packets_per_frame: u32) -> Self {
        Self {
            interlaced: true,
            ..Self::progressive(width, height, fps, packets_per_frame)
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.clock_rate == 0 {
            return Err(St2110Error::config(ConfigErrorKind::ZeroDimension));
        }
        if self.packets_per_frame == 0 {
            return Err(St2110Error::config(ConfigErrorKind::ZeroPacketsPerFrame));
        }
        Ok(())
    }
}

impl Default for VideoGeometry {
    fn default() -> Self {
        Self::progressive(1920, 1080, Fps::P59_94, 4320)
    }
}

impl fmt::Display for VideoGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}{}{} ({} pkts)",
            self.width,
            self.height,
            if self.interlaced { "i" } else { "p" },
            self.fps,
            self.packets_per_frame
        )
    }
}

/// ST 2110-30 packet time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketTime {
    P1ms,
    P125us,
    P250us,
    P333us,
    P4ms,
    P80us,
}

impl PacketTime {
    /// Packet period in nanoseconds.
    pub fn ns(self) -> f64 {
        match self {
            Self::P1ms => NS_PER_S / 1000.0,
            Self::P125us => NS_PER_S / 8000.0,
            Self::P250us => NS_PER_S / 4000.0,
            Self::P333us => NS_PER_S / 3000.0,
            Self::P4ms => NS_PER_S * 4.0 / 1000.0,
            Self::P80us => NS_PER_S / 12500.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "1ms" | "1" => Self::P1ms,
            "125us" | "0.125" => Self::P125us,
            "250us" | "0.25" => Self::P250us,
            "333us" | "0.333" => Self::P333us,
            "4ms" | "4" => Self::P4ms,
            "80us" | "0.08" => Self::P80us,
            _ => return None,
        })
    }
}

/// ST 2110-30 sampling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioSampling {
    S48k,
    S96k,
}

impl AudioSampling {
    pub fn hz(self) -> u32 {
        match self {
            Self::S48k => 48_000,
            Self::S96k => 96_000,
        }
    }
}

/// Nominal geometry of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioGeometry {
    pub ptime: PacketTime,
    pub sampling: AudioSampling,
}

impl AudioGeometry {
    /// Samples carried by each packet.
    pub fn samples_per_packet(&self) -> u32 {
        let base = match self.ptime {
            PacketTime::P1ms => 48,
            PacketTime::P125us => 6,
            PacketTime::P250us => 12,
            PacketTime::P333us => 16,
            PacketTime::P4ms => 192,
            PacketTime::P80us => 4,
        };
        match self.sampling {
            AudioSampling::S48k => base,
            AudioSampling::S96k => base * 2,
        }
    }
}

impl Default for AudioGeometry {
    fn default() -> Self {
        Self {
            ptime: PacketTime::P1ms,
            sampling: AudioSampling::S48k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_rates() {
        assert_eq!(Fps::P59_94.rational(), (60000, 1001));
        assert!((Fps::P59_94.frame_time_ns() - 16_683_333.333).abs() < 0.001);
        assert_eq!(Fps::P59_94.frame_time_sampling(VIDEO_CLOCK_RATE), 1501.5);
        assert_eq!(Fps::P50.frame_time_sampling(VIDEO_CLOCK_RATE), 1800.0);
        assert_eq!(Fps::P29_97.to_string(), "29.97");
        assert_eq!(Fps::P25.to_string(), "25");
    }

    #[test]
    fn parse_fps() {
        assert_eq!(Fps::parse("p59"), Some(Fps::P59_94));
        assert_eq!(Fps::parse("119.88"), Some(Fps::P119_88));
        assert_eq!(Fps::parse("61"), None);
        for fps in Fps::ALL {
            assert_eq!(Fps::parse(&fps.to_string()), Some(fps));
        }
    }

    #[test]
    fn samples_per_packet_match_rate() {
        for ptime in [
            PacketTime::P1ms,
            PacketTime::P125us,
            PacketTime::P250us,
            PacketTime::P333us,
            PacketTime::P4ms,
        ] {
            for sampling in [AudioSampling::S48k, AudioSampling::S96k] {
                let g = AudioGeometry { ptime, sampling };
                let expected = ptime.ns() * sampling.hz() as f64 / NS_PER_S;
                assert!((g.samples_per_packet() as f64 - expected).abs() < 1e-6);
            }
        }
        // ST 2110-31 80us packets round up to whole samples.
        let aes = AudioGeometry {
            ptime: PacketTime::P80us,
            sampling: AudioSampling::S96k,
        };
        assert_eq!(aes.samples_per_packet(), 8);
    }

    #[test]
    fn zero_packets_rejected() {
        let g = VideoGeometry::progressive(1920, 1080, Fps::P50, 0);
        assert!(matches!(
            g.validate(),
            Err(St2110Error::InvalidConfig {
                kind: ConfigErrorKind::ZeroPacketsPerFrame
            })
        ));
        assert!(VideoGeometry::progressive(0, 1080, Fps::P50, 10).validate().is_err());
        assert_eq!(VideoGeometry::default().to_string(), "1920x1080p59.94 (4320 pkts)");
    }
}
