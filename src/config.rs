/// Represents config for [`SdSpi`](crate::SdSpi).
///
/// Two bounding styles coexist on purpose: response polling is bounded by a
/// fixed number of transfers, while state transitions that may take
/// card-internal time are bounded by clock ticks.
pub trait SdSpiConfig {
    /// Max transfers to poll for an R1 response.
    const READ_R1_ATTEMPTS: usize;
    /// Dummy bytes clocked out before reset, with the card deselected.
    const POWER_UP_CLOCKS: usize;
    /// Tick window for busy and data-start waits.
    const SHORT_WAIT_TICKS: u32;
    /// Tick window for the reset and ready-state negotiations.
    const INIT_WAIT_TICKS: u32;
}

/// Default implementation of [`SdSpiConfig`].
pub struct DefaultSdSpiConfig;

impl SdSpiConfig for DefaultSdSpiConfig {
    const READ_R1_ATTEMPTS: usize = 255;
    const POWER_UP_CLOCKS: usize = 255;
    const SHORT_WAIT_TICKS: u32 = 30;
    const INIT_WAIT_TICKS: u32 = 100;
}
