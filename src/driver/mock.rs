//! Mock Digitizer
//!
//! Simulated waveform digitizer for testing without physical hardware.
//!
//! The mock follows the arm/trigger cycle of a real board: [`start`] arms it,
//! [`MockDigitizer::fire_trigger`] simulates an external trigger edge (ignored
//! unless armed), and the registered end-of-acquisition callback is invoked
//! once the "acquisition" completes. Downloads return a noisy sine wave per
//! channel, scaled to the channel's input range.
//!
//! [`start`]: Digitizer::start
//!
//! # Example
//!
//! ```rust,ignore
//! let scope = MockDigitizer::new();
//! scope.register_end_of_acquisition(Box::new(|| println!("acquired")))?;
//! scope.start().await?;
//! assert!(scope.fire_trigger());
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    AcquisitionCallback, AcquisitionInfo, AcquisitionSetup, BoardInfo, ChannelSetup,
    ChannelSnapshot, Digitizer, TriggerSetup, TriggerSnapshot,
};

/// ADC code span of the simulated 14-bit converter (inverted codes).
const SAMPLE_RES: i32 = -8192;
/// ADC code for zero volts.
const SAMPLE_OFFSET: i32 = -1;
/// Board type code reported by the mock.
const MOCK_BOARD_TYPE: u32 = 0x24;

#[derive(Debug, Clone)]
struct Settings {
    acquisition: AcquisitionSetup,
    channels: HashMap<u16, ChannelSetup>,
    trigger: TriggerSetup,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionSetup {
                sample_rate_hz: 1e6,
                external_clock_hz: None,
                depth: 1000,
            },
            channels: HashMap::new(),
            trigger: TriggerSetup::default(),
        }
    }
}

/// Simulated digitizer board.
pub struct MockDigitizer {
    staged: Mutex<Settings>,
    active: Mutex<Settings>,
    callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    armed: AtomicBool,
    open: AtomicBool,
    fail_download: AtomicBool,
    fail_start: AtomicBool,
    trigger_count: AtomicU64,
    transfer_delay_ms: AtomicU64,
    signal_hz: f64,
    noise_volts: f64,
}

impl MockDigitizer {
    /// Create a mock board with a 10 kHz test signal and light noise.
    pub fn new() -> Self {
        Self::with_signal(10e3, 0.005)
    }

    /// Create a mock board with a custom test signal.
    ///
    /// # Arguments
    /// * `signal_hz` - Frequency of the simulated sine wave
    /// * `noise_volts` - Peak amplitude of uniform noise added to each sample
    pub fn with_signal(signal_hz: f64, noise_volts: f64) -> Self {
        Self {
            staged: Mutex::new(Settings::default()),
            active: Mutex::new(Settings::default()),
            callback: Mutex::new(None),
            armed: AtomicBool::new(false),
            open: AtomicBool::new(false),
            fail_download: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            trigger_count: AtomicU64::new(0),
            transfer_delay_ms: AtomicU64::new(0),
            signal_hz,
            noise_volts,
        }
    }

    /// Simulate an external trigger edge.
    ///
    /// Returns `true` if the board was armed and the end-of-acquisition
    /// callback ran, `false` if the trigger was ignored.
    pub fn fire_trigger(&self) -> bool {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.trigger_count.fetch_add(1, Ordering::AcqRel);
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Make the next channel download fail.
    pub fn fail_next_download(&self) {
        self.fail_download.store(true, Ordering::Release);
    }

    /// Make the next arm request fail.
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::Release);
    }

    /// Stall every channel download for `delay`, like a slow bus transfer.
    pub fn set_transfer_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.transfer_delay_ms.store(millis, Ordering::Release);
    }

    /// Whether the board is armed.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Number of triggers acquired so far.
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Acquire)
    }

    fn synthesize(&self, setup: &ChannelSetup, rate: f64, length: usize) -> Vec<i16> {
        let mut rng = rand::thread_rng();
        let amplitude = f64::from(setup.input_range_mvpp) / 2000.0 * 0.8;
        let phase = self.trigger_count() as f64 * 0.1 + f64::from(setup.channel);
        let counts_per_volt = 2000.0 / f64::from(setup.input_range_mvpp) * f64::from(SAMPLE_RES);
        let omega = 2.0 * std::f64::consts::PI * self.signal_hz;

        (0..length)
            .map(|i| {
                let t = i as f64 / rate;
                let mut volts = amplitude * (omega * t + phase).sin();
                if self.noise_volts > 0.0 {
                    volts += rng.gen_range(-self.noise_volts..=self.noise_volts);
                }
                // Inverse of the display scaling: raw = offset - volts * counts_per_volt.
                let raw = f64::from(SAMPLE_OFFSET) - volts * counts_per_volt;
                raw.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect()
    }
}

impl Default for MockDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Digitizer for MockDigitizer {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.armed.store(false, Ordering::Release);
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    async fn set_acquisition_config(&self, setup: &AcquisitionSetup) -> Result<()> {
        if setup.depth == 0 {
            bail!("Acquisition depth must be non-zero");
        }
        lock(&self.staged).acquisition = setup.clone();
        Ok(())
    }

    async fn set_channel_config(&self, setup: &ChannelSetup) -> Result<()> {
        lock(&self.staged).channels.insert(setup.channel, setup.clone());
        Ok(())
    }

    async fn set_trigger_config(&self, setup: &TriggerSetup) -> Result<()> {
        lock(&self.staged).trigger = setup.clone();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let staged = lock(&self.staged).clone();
        *lock(&self.active) = staged;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start.swap(false, Ordering::AcqRel) {
            bail!("Mock arm failure");
        }
        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.armed.store(false, Ordering::Release);
        Ok(())
    }

    fn register_end_of_acquisition(&self, callback: AcquisitionCallback) -> Result<()> {
        *lock(&self.callback) = Some(Arc::from(callback));
        Ok(())
    }

    fn clear_end_of_acquisition(&self) {
        *lock(&self.callback) = None;
    }

    async fn download_channel(&self, channel: u16, length: usize) -> Result<Vec<i16>> {
        if self.fail_download.swap(false, Ordering::AcqRel) {
            bail!("Mock transfer error on channel {channel}");
        }
        let delay = self.transfer_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let (setup, rate) = {
            let active = lock(&self.active);
            let setup = active
                .channels
                .get(&channel)
                .cloned()
                .unwrap_or(ChannelSetup {
                    channel,
                    coupling: Default::default(),
                    impedance_ohms: 1_000_000,
                    input_range_mvpp: 2000,
                });
            (setup, active.acquisition.sample_rate_hz)
        };
        Ok(self.synthesize(&setup, rate, length))
    }

    async fn board_info(&self) -> Result<BoardInfo> {
        Ok(BoardInfo {
            board_type: MOCK_BOARD_TYPE,
            name: "MockScope".to_string(),
        })
    }

    async fn acquisition_metadata(&self) -> Result<AcquisitionInfo> {
        let active = lock(&self.active);
        Ok(AcquisitionInfo {
            sample_rate_hz: active.acquisition.sample_rate_hz,
            sample_res: SAMPLE_RES,
            sample_offset: SAMPLE_OFFSET,
            sample_bits: 14,
            depth: active.acquisition.depth,
        })
    }

    async fn trigger_metadata(&self) -> Result<TriggerSnapshot> {
        Ok(lock(&self.active).trigger.clone())
    }

    async fn channel_metadata(&self, channel: u16) -> Result<ChannelSnapshot> {
        let active = lock(&self.active);
        let setup = active
            .channels
            .get(&channel)
            .ok_or_else(|| anyhow!("Channel {channel} is not configured"))?;
        Ok(ChannelSnapshot {
            channel,
            input_range_mvpp: setup.input_range_mvpp,
            dc_offset: 0,
            coupling: setup.coupling,
            impedance_ohms: setup.impedance_ohms,
        })
    }
}
