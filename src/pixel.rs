//! Pixel-to-laser channel mapping.
//!
//! A pixel is one logical laser channel. The map from pixel index to its
//! owning (rack, laser) pair is downloaded once per session from the rack
//! controllers as a `.vfpmap` CSV and is immutable afterwards.

use crate::error::{CalError, CalResult};

/// One row of the pixel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelChannel {
    /// 1-based pixel index.
    pub pixel: u32,
    pub enabled: bool,
    /// 1-based rack index.
    pub rack: u8,
    /// 1-based laser index within the rack.
    pub laser: u8,
}

/// Immutable session map of every pixel's physical channel.
#[derive(Debug, Clone)]
pub struct PixelMap {
    channels: Vec<PixelChannel>,
}

impl PixelMap {
    /// Parse the `.vfpmap` format: a header line, then
    /// `pixel,enabled,rack,laser` rows.
    pub fn parse_vfpmap(text: &str) -> CalResult<Self> {
        let mut channels = Vec::new();
        for (lineno, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return Err(CalError::Configuration(format!(
                    "pixel map line {} has {} fields, expected 4",
                    lineno + 1,
                    fields.len()
                )));
            }
            let parse = |s: &str, what: &str| -> CalResult<i64> {
                s.parse::<f64>()
                    .map(|v| v as i64)
                    .map_err(|_| {
                        CalError::Configuration(format!(
                            "pixel map line {}: bad {what} value '{s}'",
                            lineno + 1
                        ))
                    })
            };
            channels.push(PixelChannel {
                pixel: parse(fields[0], "pixel")? as u32,
                enabled: parse(fields[1], "enable")? != 0,
                rack: parse(fields[2], "rack")? as u8,
                laser: parse(fields[3], "laser")? as u8,
            });
        }
        if channels.is_empty() {
            return Err(CalError::Configuration("pixel map is empty".into()));
        }
        Ok(Self { channels })
    }

    /// Synthetic sequential map used by simulation and tests: pixel i on
    /// rack `(i-1)/lasers_per_rack + 1`, laser `(i-1)%lasers_per_rack + 1`,
    /// all enabled.
    pub fn sequential(num_pixels: usize, lasers_per_rack: usize) -> Self {
        let channels = (1..=num_pixels)
            .map(|p| PixelChannel {
                pixel: p as u32,
                enabled: true,
                rack: ((p - 1) / lasers_per_rack + 1) as u8,
                laser: ((p - 1) % lasers_per_rack + 1) as u8,
            })
            .collect();
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[PixelChannel] {
        &self.channels
    }

    /// Channel for a 1-based pixel index.
    pub fn channel(&self, pixel: u32) -> Option<&PixelChannel> {
        self.channels.iter().find(|c| c.pixel == pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vfpmap_rows() {
        let text = "Pixel,Enable,Rack,Laser\n1,1,1,1\n2,1,1,2\n22,0,2,1\n";
        let map = PixelMap::parse_vfpmap(text).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.channel(22),
            Some(&PixelChannel {
                pixel: 22,
                enabled: false,
                rack: 2,
                laser: 1
            })
        );
    }

    #[test]
    fn rejects_short_rows() {
        assert!(PixelMap::parse_vfpmap("header\n1,1,1\n").is_err());
        assert!(PixelMap::parse_vfpmap("header\n").is_err());
    }

    #[test]
    fn sequential_map_wraps_racks() {
        let map = PixelMap::sequential(84, 21);
        assert_eq!(map.channel(21).map(|c| (c.rack, c.laser)), Some((1, 21)));
        assert_eq!(map.channel(22).map(|c| (c.rack, c.laser)), Some((2, 1)));
        assert_eq!(map.channel(84).map(|c| (c.rack, c.laser)), Some((4, 21)));
    }
}
