//! Decoding of the two-channel frames sent by the acquisition board.
//!
//! The board streams newline terminated ASCII lines of the form
//! `<vertical>,<horizontal>`, where both fields are raw 10-bit ADC counts in
//! `0..=1023`. The [`FrameDecoder`] accumulates raw bytes from the serial
//! port, splits them into lines, and turns each well-formed line into a
//! [`Sample`] with both channels converted to volts. Malformed lines are
//! reported as [`FrameReject`]s, rate limited so a babbling device cannot
//! flood the event stream.

use nom::{
    character::complete::{char, u16},
    combinator::{all_consuming, map, verify},
    error::Error,
    sequence::{preceded, tuple},
    Finish, IResult,
};

use std::str::{self, FromStr};
use std::time::{Duration, Instant, SystemTime};

/// Full scale count of the 10-bit ADC on the acquisition board.
pub const ADC_FULL_SCALE: u16 = 1023;

/// Reference voltage of the ADC, so counts map onto `0.0..=5.0` volts.
pub const REFERENCE_VOLTS: f64 = 5.0;

/// A complete line is never longer than a few bytes. Anything that grows past
/// this without a newline is line noise and gets discarded wholesale.
const MAX_RESIDUAL: usize = 256;

/// Minimum spacing between reported rejects; rejects in between are only
/// counted.
const REJECT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Convert a raw ADC count to volts.
pub fn counts_to_volts(counts: u16) -> f64 {
    counts as f64 * REFERENCE_VOLTS / ADC_FULL_SCALE as f64
}

/// One wire frame, still in raw ADC counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    /// Vertical channel count, `0..=1023`.
    pub vertical: u16,
    /// Horizontal channel count, `0..=1023`.
    pub horizontal: u16,
}

/// One converted two-channel observation.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Monotonic capture instant, used for elapsed-time accounting.
    pub taken_at: Instant,
    /// Wall-clock capture time, used for persisted timestamps.
    pub wall_clock: SystemTime,
    /// Vertical channel in volts.
    pub vertical_volts: f64,
    /// Horizontal channel in volts.
    pub horizontal_volts: f64,
}

/// A malformed frame that was dropped, plus how many rejects were silently
/// dropped since the previous report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReject {
    /// Human readable description of what was wrong with the frame.
    pub detail: String,
    /// Rejects swallowed by rate limiting since the last reported one.
    pub suppressed: u64,
}

fn adc_count(s: &str) -> IResult<&str, u16> {
    verify(u16, |&c| c <= ADC_FULL_SCALE)(s)
}

fn parse_frame(s: &str) -> IResult<&str, RawFrame> {
    map(
        tuple((adc_count, preceded(char(','), adc_count))),
        |(vertical, horizontal)| RawFrame {
            vertical,
            horizontal,
        },
    )(s)
}

impl RawFrame {
    /// Vertical channel converted to volts.
    pub fn vertical_volts(&self) -> f64 {
        counts_to_volts(self.vertical)
    }

    /// Horizontal channel converted to volts.
    pub fn horizontal_volts(&self) -> f64 {
        counts_to_volts(self.horizontal)
    }

    /// Stamp this frame with the current instant and wall clock.
    fn into_sample(self) -> Sample {
        Sample {
            taken_at: Instant::now(),
            wall_clock: SystemTime::now(),
            vertical_volts: self.vertical_volts(),
            horizontal_volts: self.horizontal_volts(),
        }
    }
}

impl FromStr for RawFrame {
    type Err = Error<String>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_frame)(s).finish() {
            Ok((_remaining, frame)) => Ok(frame),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

/// Everything one call to [`FrameDecoder::push_bytes`] produced.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Samples decoded from complete, well-formed lines, in wire order.
    pub samples: Vec<Sample>,
    /// Rejects that survived rate limiting.
    pub rejects: Vec<FrameReject>,
}

/// Incremental line decoder sitting between the serial port and the rest of
/// the pipeline. Owns the partial-line residual so frames split across reads
/// still come out whole.
#[derive(Debug)]
pub struct FrameDecoder {
    residual: Vec<u8>,
    last_reject_report: Option<Instant>,
    suppressed_rejects: u64,
    report_interval: Duration,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// A fresh decoder with an empty residual.
    pub fn new() -> Self {
        FrameDecoder {
            residual: Vec::new(),
            last_reject_report: None,
            suppressed_rejects: 0,
            report_interval: REJECT_REPORT_INTERVAL,
        }
    }

    /// Feed raw bytes from the port. Complete lines become samples, bad ones
    /// become (rate limited) rejects, and a trailing partial line is kept for
    /// the next call.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Decoded {
        let mut out = Decoded::default();

        for &b in bytes {
            if b == b'\n' {
                let line = std::mem::take(&mut self.residual);
                self.take_line(&line, &mut out);
            } else {
                self.residual.push(b);
                if self.residual.len() > MAX_RESIDUAL {
                    self.residual.clear();
                    if let Some(reject) =
                        self.note_reject("oversized frame with no newline".to_string())
                    {
                        out.rejects.push(reject);
                    }
                }
            }
        }

        out
    }

    /// Drop any partial line. Called after a link fault so stale bytes never
    /// prepend to the first frame after a reconnect.
    pub fn reset(&mut self) {
        self.residual.clear();
    }

    fn take_line(&mut self, line: &[u8], out: &mut Decoded) {
        let line = match line.split_last() {
            Some((&b'\r', rest)) => rest,
            _ => line,
        };
        // The board pads the start of a transmission with blank lines.
        if line.is_empty() {
            return;
        }

        let reject = match str::from_utf8(line) {
            Ok(text) => match RawFrame::from_str(text) {
                Ok(frame) => {
                    out.samples.push(frame.into_sample());
                    return;
                }
                Err(e) => format!("unparseable frame {:?}: {}", text, e),
            },
            Err(e) => format!("frame is not utf-8: {}", e),
        };

        if let Some(reject) = self.note_reject(reject) {
            out.rejects.push(reject);
        }
    }

    fn note_reject(&mut self, detail: String) -> Option<FrameReject> {
        let now = Instant::now();
        let due = match self.last_reject_report {
            None => true,
            Some(at) => now.duration_since(at) >= self.report_interval,
        };

        if due {
            self.last_reject_report = Some(now);
            let suppressed = self.suppressed_rejects;
            self.suppressed_rejects = 0;
            Some(FrameReject { detail, suppressed })
        } else {
            self.suppressed_rejects += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_frame() {
        let frame = RawFrame::from_str("512,256").unwrap();
        assert_eq!(
            frame,
            RawFrame {
                vertical: 512,
                horizontal: 256
            }
        );
    }

    #[test]
    fn parses_the_extremes() {
        assert!(RawFrame::from_str("0,0").is_ok());
        assert!(RawFrame::from_str("1023,1023").is_ok());
    }

    #[test]
    fn rejects_out_of_range_counts() {
        assert!(RawFrame::from_str("1024,0").is_err());
        assert!(RawFrame::from_str("0,1024").is_err());
        assert!(RawFrame::from_str("65536,0").is_err());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(RawFrame::from_str("").is_err());
        assert!(RawFrame::from_str("512").is_err());
        assert!(RawFrame::from_str("512,").is_err());
        assert!(RawFrame::from_str(",256").is_err());
        assert!(RawFrame::from_str("512,256,9").is_err());
        assert!(RawFrame::from_str("a,b").is_err());
        assert!(RawFrame::from_str("-1,5").is_err());
        assert!(RawFrame::from_str("512, 256").is_err());
    }

    #[test]
    fn converts_counts_to_volts() {
        assert_eq!(counts_to_volts(0), 0.0);
        assert_eq!(counts_to_volts(1023), 5.0);
        assert!((counts_to_volts(512) - 2.502_443_792_766_373).abs() < 1e-12);
    }

    #[test]
    fn decodes_a_frame_split_across_reads() {
        let mut decoder = FrameDecoder::new();

        let first = decoder.push_bytes(b"51");
        assert!(first.samples.is_empty());
        assert!(first.rejects.is_empty());

        let second = decoder.push_bytes(b"2,256\n");
        assert_eq!(second.samples.len(), 1);
        assert!((second.samples[0].vertical_volts - counts_to_volts(512)).abs() < 1e-12);
        assert!((second.samples[0].horizontal_volts - counts_to_volts(256)).abs() < 1e-12);
    }

    #[test]
    fn decodes_several_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push_bytes(b"1,2\n3,4\n5,6\n");
        assert_eq!(out.samples.len(), 3);
    }

    #[test]
    fn tolerates_carriage_returns_and_blank_lines() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push_bytes(b"\n\r\n100,200\r\n");
        assert_eq!(out.samples.len(), 1);
        assert!(out.rejects.is_empty());
    }

    #[test]
    fn reports_the_first_reject_and_suppresses_the_flood() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push_bytes(b"junk\nmore junk\neven more\n");
        assert_eq!(out.rejects.len(), 1);
        assert_eq!(out.rejects[0].suppressed, 0);

        // Force the report window open again and check the tally carried over.
        decoder.report_interval = Duration::ZERO;
        let out = decoder.push_bytes(b"junk again\n");
        assert_eq!(out.rejects.len(), 1);
        assert_eq!(out.rejects[0].suppressed, 2);
    }

    #[test]
    fn discards_an_oversized_residual() {
        let mut decoder = FrameDecoder::new();
        let garbage = vec![b'x'; MAX_RESIDUAL + 1];
        let out = decoder.push_bytes(&garbage);
        assert_eq!(out.rejects.len(), 1);
        assert!(out.samples.is_empty());

        // The next well-formed frame decodes cleanly against a clear residual.
        let out = decoder.push_bytes(b"7,8\n");
        assert_eq!(out.samples.len(), 1);
    }

    #[test]
    fn reset_clears_a_partial_line() {
        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(b"51");
        decoder.reset();
        let out = decoder.push_bytes(b"2,9\n");
        // Without the reset this would have produced 512,9.
        assert_eq!(out.samples.len(), 1);
        assert!((out.samples[0].vertical_volts - counts_to_volts(2)).abs() < 1e-12);
    }
}
