//! A synthetic signal source for running the pipeline without hardware.
//!
//! [`SimulatedPorts`] plugs in wherever [`SystemPorts`] would, handing out
//! [`SimPort`]s that emit the same `vertical,horizontal\n` text frames an
//! instrumented device would. The waveform is a sine against a cosine around
//! mid-scale with a little count noise, paced with [`spin_sleep`] so the
//! frame rate holds steady. Ports can be scripted to go quiet or fail after
//! a set number of frames, which is how the stall and reconnect paths get
//! exercised end to end.
//!
//! [`SystemPorts`]: crate::link::SystemPorts

use crate::frame::ADC_FULL_SCALE;
use crate::link::{DataPort, PortOpener};

use rand::prelude::*;
use rand::rngs::StdRng;
use spin_sleep::SpinSleeper;
use std::f64::consts::PI;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// The pseudo-device path the simulator answers to.
pub const SIM_PORT_NAME: &str = "sim://scope";

/// Waveform frequency in hertz.
const SIGNAL_HZ: f64 = 0.5;

/// Sleep accuracy hint for the pacing sleeper, in nanoseconds.
const NATIVE_SLEEP_ACCURACY: u32 = 100_000;

/// Opens [`SimPort`]s instead of real devices.
///
/// Every open hands out a fresh port with the same settings, so a
/// reconnect after a scripted stall or fault starts streaming again.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedPorts {
    rate_hz: f64,
    noise_counts: u16,
    stall_after: Option<usize>,
    fail_after: Option<usize>,
}

impl SimulatedPorts {
    /// A simulator emitting `rate_hz` frames per second.
    pub fn new(rate_hz: f64) -> Self {
        SimulatedPorts {
            rate_hz,
            noise_counts: 2,
            stall_after: None,
            fail_after: None,
        }
    }

    /// Add up to this many counts of noise to every reading.
    pub fn with_noise(mut self, counts: u16) -> Self {
        self.noise_counts = counts;
        self
    }

    /// Go quiet after `frames` frames, as an unplugged sensor would.
    pub fn stall_after(mut self, frames: usize) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Report a hard read fault after `frames` frames.
    pub fn fail_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl Default for SimulatedPorts {
    fn default() -> Self {
        SimulatedPorts::new(200.0)
    }
}

impl PortOpener for SimulatedPorts {
    fn list_ports(&self) -> io::Result<Vec<PathBuf>> {
        Ok(vec![PathBuf::from(SIM_PORT_NAME)])
    }

    fn open(
        &self,
        _path: &Path,
        _baud_rate: u32,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn DataPort>> {
        Ok(Box::new(SimPort::new(*self, read_timeout)))
    }
}

/// One open synthetic stream.
pub struct SimPort {
    rng: StdRng,
    sleeper: SpinSleeper,
    period: Duration,
    read_timeout: Duration,
    phase: f64,
    phase_step: f64,
    noise_counts: u16,
    until_stall: Option<usize>,
    until_fail: Option<usize>,
    pending: Vec<u8>,
}

impl SimPort {
    fn new(settings: SimulatedPorts, read_timeout: Duration) -> Self {
        SimPort {
            rng: StdRng::from_entropy(),
            sleeper: SpinSleeper::new(NATIVE_SLEEP_ACCURACY),
            period: Duration::from_secs_f64(1.0 / settings.rate_hz),
            read_timeout,
            phase: 0.0,
            phase_step: 2.0 * PI * SIGNAL_HZ / settings.rate_hz,
            noise_counts: settings.noise_counts,
            until_stall: settings.stall_after,
            until_fail: settings.fail_after,
            pending: Vec::new(),
        }
    }

    fn reading(&mut self, unit: f64) -> u16 {
        let centered = (f64::from(ADC_FULL_SCALE) / 2.0) * (1.0 + unit);
        let noise = if self.noise_counts > 0 {
            let spread = i32::from(self.noise_counts);
            self.rng.gen_range(-spread..=spread)
        } else {
            0
        };
        (centered.round() as i32 + noise).clamp(0, i32::from(ADC_FULL_SCALE)) as u16
    }

    fn next_frame(&mut self) -> Vec<u8> {
        let vertical = self.reading(self.phase.sin());
        let horizontal = self.reading(self.phase.cos());
        self.phase = (self.phase + self.phase_step) % (2.0 * PI);
        format!("{},{}\n", vertical, horizontal).into_bytes()
    }
}

impl DataPort for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            if self.until_stall == Some(0) {
                // A quiet stream, not a broken one.
                thread::sleep(self.read_timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            if self.until_fail == Some(0) {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "simulated device fault",
                ));
            }
            self.sleeper.sleep(self.period);
            self.pending = self.next_frame();
            if let Some(left) = self.until_stall.as_mut() {
                *left -= 1;
            }
            if let Some(left) = self.until_fail.as_mut() {
                *left -= 1;
            }
        }

        let take = buf.len().min(self.pending.len());
        buf[..take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        Ok(take)
    }
}
