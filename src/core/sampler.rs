//! Reading sources.
//!
//! The light is read by an external driver (color sensor or camera pipeline)
//! that writes one reading per line to stdin, a file or a FIFO:
//!
//! ```text
//! 12,187,9            # sensor: 8-bit R,G,B
//! raw 3072,47872,2304 # sensor: 16-bit raw channel counts
//! GREEN=31.5 RED=0.4  # camera: mask coverage in percent
//! ```

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
};
use tracing::{debug, info};

use super::{
    calibration::{Color, DetectionMode, Rgb},
    classifier::ColorSample,
    error::SampleError,
};

/// Produces one reading per call.
#[async_trait]
pub trait Sampler: Send {
    async fn sample(&mut self) -> Result<ColorSample, SampleError>;

    /// Releases the underlying device.
    async fn close(&mut self) {}
}

#[async_trait]
impl<S: Sampler + ?Sized> Sampler for Box<S> {
    async fn sample(&mut self) -> Result<ColorSample, SampleError> {
        (**self).sample().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

pub type SourceReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Parses driver lines from any buffered reader.
pub struct LineSampler<R> {
    lines: Option<Lines<R>>,
    mode: DetectionMode,
    name: String,
}

impl<R: AsyncBufRead + Unpin + Send> LineSampler<R> {
    pub fn new(reader: R, mode: DetectionMode, name: impl Into<String>) -> Self {
        Self {
            lines: Some(reader.lines()),
            mode,
            name: name.into(),
        }
    }
}

impl LineSampler<SourceReader> {
    /// Opens `source`: `-` is stdin, anything else a file or FIFO path.
    pub async fn open(source: &str, mode: DetectionMode) -> io::Result<Self> {
        let reader: SourceReader = if source == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            Box::new(BufReader::new(File::open(Path::new(source)).await?))
        };
        let name = if source == "-" { "stdin" } else { source };
        info!("Reading {} samples from {}", mode, name);
        Ok(Self::new(reader, mode, name))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Sampler for LineSampler<R> {
    async fn sample(&mut self) -> Result<ColorSample, SampleError> {
        let lines = self.lines.as_mut().ok_or(SampleError::Closed)?;
        loop {
            let Some(line) = lines.next_line().await? else {
                return Err(SampleError::Closed);
            };
            let line = strip_comment(&line);
            if line.is_empty() {
                continue;
            }
            return parse_line(line, self.mode);
        }
    }

    async fn close(&mut self) {
        if self.lines.take().is_some() {
            debug!("Closed sample source {}", self.name);
        }
    }
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}

/// Parses one non-empty driver line.
pub fn parse_line(line: &str, mode: DetectionMode) -> Result<ColorSample, SampleError> {
    match mode {
        DetectionMode::Sensor => parse_rgb(line).map(ColorSample::Rgb),
        DetectionMode::Camera => parse_coverage(line).map(ColorSample::Coverage),
    }
}

fn parse_rgb(line: &str) -> Result<Rgb, SampleError> {
    let (raw, body) = match line.strip_prefix("raw") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let channels: Vec<&str> = body.split(',').map(str::trim).collect();
    let [r, g, b] = channels.as_slice() else {
        return Err(SampleError::malformed(line, "expected three channels"));
    };

    if raw {
        let parse = |c: &str| {
            c.parse::<u16>()
                .map_err(|e| SampleError::malformed(line, format!("channel {c:?}: {e}")))
        };
        Ok(Rgb::from_raw16(parse(r)?, parse(g)?, parse(b)?))
    } else {
        let parse = |c: &str| {
            c.parse::<u8>()
                .map_err(|e| SampleError::malformed(line, format!("channel {c:?}: {e}")))
        };
        Ok(Rgb::new(parse(r)?, parse(g)?, parse(b)?))
    }
}

/// Unknown color keys are ignored; absent colors count as 0 %.
fn parse_coverage(line: &str) -> Result<BTreeMap<Color, f64>, SampleError> {
    let mut coverage = BTreeMap::new();
    for token in line.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(SampleError::malformed(line, format!("token {token:?} is not KEY=percent")));
        };
        let value = value.trim_end_matches('%');
        let pct: f64 = value
            .parse()
            .map_err(|_| SampleError::malformed(line, format!("{value:?} is not a number")))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(SampleError::malformed(line, format!("{pct} is outside 0..=100")));
        }
        if let Some(color) = Color::from_key(key) {
            coverage.insert(color, pct);
        }
    }
    Ok(coverage)
}

/// Averages several consecutive readings into one sample.
///
/// Failed sub-readings are dropped; the sample fails only when none succeed
/// or the source closes.
pub struct AveragingSampler<S> {
    inner: S,
    count: u32,
}

impl<S: Sampler> AveragingSampler<S> {
    pub fn new(inner: S, count: u32) -> Self {
        Self {
            inner,
            count: count.max(1),
        }
    }
}

#[async_trait]
impl<S: Sampler> Sampler for AveragingSampler<S> {
    async fn sample(&mut self) -> Result<ColorSample, SampleError> {
        if self.count == 1 {
            return self.inner.sample().await;
        }

        let mut rgb_sum = [0u32; 3];
        let mut rgb_count = 0u32;
        let mut coverage_sum: BTreeMap<Color, f64> = BTreeMap::new();
        let mut coverage_count = 0u32;

        for _ in 0..self.count {
            match self.inner.sample().await {
                Ok(ColorSample::Rgb(rgb)) => {
                    rgb_sum[0] += u32::from(rgb.r);
                    rgb_sum[1] += u32::from(rgb.g);
                    rgb_sum[2] += u32::from(rgb.b);
                    rgb_count += 1;
                }
                Ok(ColorSample::Coverage(coverage)) => {
                    for (color, pct) in coverage {
                        *coverage_sum.entry(color).or_default() += pct;
                    }
                    coverage_count += 1;
                }
                Err(SampleError::Closed) => return Err(SampleError::Closed),
                Err(e) => debug!("Dropping sub-reading: {}", e),
            }
        }

        match (rgb_count, coverage_count) {
            (0, 0) => Err(SampleError::NoValidReadings(self.count)),
            (n, 0) => {
                let avg = |sum: u32| ((sum + n / 2) / n).min(255) as u8;
                Ok(ColorSample::Rgb(Rgb::new(
                    avg(rgb_sum[0]),
                    avg(rgb_sum[1]),
                    avg(rgb_sum[2]),
                )))
            }
            (0, n) => Ok(ColorSample::Coverage(
                coverage_sum
                    .into_iter()
                    .map(|(color, sum)| (color, sum / f64::from(n)))
                    .collect(),
            )),
            _ => Err(SampleError::malformed("", "mixed sensor and camera readings")),
        }
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(input: &'static str, mode: DetectionMode) -> LineSampler<&'static [u8]> {
        LineSampler::new(input.as_bytes(), mode, "test")
    }

    #[test]
    fn test_parse_sensor_lines() {
        assert_eq!(
            parse_line("0, 190 ,10", DetectionMode::Sensor).unwrap(),
            ColorSample::Rgb(Rgb::new(0, 190, 10))
        );
        assert_eq!(
            parse_line("raw 512,65535,100", DetectionMode::Sensor).unwrap(),
            ColorSample::Rgb(Rgb::new(2, 255, 0))
        );
    }

    #[test]
    fn test_parse_garbled_sensor_lines() {
        for line in ["1,2", "1,2,3,4", "300,0,0", "a,b,c", "raw 70000,0,0"] {
            assert!(
                matches!(
                    parse_line(line, DetectionMode::Sensor),
                    Err(SampleError::Malformed { .. })
                ),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_camera_lines() {
        let ColorSample::Coverage(coverage) =
            parse_line("GREEN=12.5 ROSSO=0.3% BLUE=40", DetectionMode::Camera).unwrap()
        else {
            panic!("expected coverage");
        };
        assert_eq!(coverage.get(&Color::Green), Some(&12.5));
        assert_eq!(coverage.get(&Color::Red), Some(&0.3));
        assert_eq!(coverage.len(), 2);

        assert!(parse_line("GREEN", DetectionMode::Camera).is_err());
        assert!(parse_line("GREEN=lots", DetectionMode::Camera).is_err());
        assert!(parse_line("GREEN=140", DetectionMode::Camera).is_err());
    }

    #[tokio::test]
    async fn test_line_sampler_skips_blank_and_comment_lines() {
        let mut sampler = sampler("# header\n\n1,2,3\n4,5,6 # trailing\n", DetectionMode::Sensor);

        assert_eq!(sampler.sample().await.unwrap(), ColorSample::Rgb(Rgb::new(1, 2, 3)));
        assert_eq!(sampler.sample().await.unwrap(), ColorSample::Rgb(Rgb::new(4, 5, 6)));
        assert!(matches!(sampler.sample().await, Err(SampleError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_sampler_stays_closed() {
        let mut sampler = sampler("1,2,3\n", DetectionMode::Sensor);
        sampler.close().await;
        assert!(matches!(sampler.sample().await, Err(SampleError::Closed)));
    }

    #[tokio::test]
    async fn test_averaging_drops_failed_readings() {
        let inner = sampler("10,20,30\nbroken\n20,41,30\n", DetectionMode::Sensor);
        let mut sampler = AveragingSampler::new(inner, 3);

        assert_eq!(
            sampler.sample().await.unwrap(),
            ColorSample::Rgb(Rgb::new(15, 31, 30))
        );
        assert!(matches!(sampler.sample().await, Err(SampleError::Closed)));
    }

    #[tokio::test]
    async fn test_averaging_coverage() {
        let inner = sampler("GREEN=10 RED=2\nGREEN=20\n", DetectionMode::Camera);
        let mut sampler = AveragingSampler::new(inner, 2);

        let ColorSample::Coverage(coverage) = sampler.sample().await.unwrap() else {
            panic!("expected coverage");
        };
        assert_eq!(coverage.get(&Color::Green), Some(&15.0));
        assert_eq!(coverage.get(&Color::Red), Some(&1.0));
    }

    #[tokio::test]
    async fn test_averaging_all_failed() {
        let inner = sampler("x\ny\nz\n", DetectionMode::Sensor);
        let mut sampler = AveragingSampler::new(inner, 2);
        assert!(matches!(
            sampler.sample().await,
            Err(SampleError::NoValidReadings(2))
        ));
    }
}
