//! SPI bus rate control.
//!
//! `embedded-hal` 0.2 has no portable way to represcale a live bus, so the
//! SPI peripheral handed to the driver also implements [`BusSpeedControl`].

/// Bus rate classes used across the initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSpeed {
    /// Slowest prescale, required while the card powers up (<= 400 kHz).
    Initialization,
    /// Full bus rate, once the card has reported the idle state.
    Full,
}

/// SPI clock prescale control.
pub trait BusSpeedControl {
    /// Switch the bus to `speed`, taking effect before the next transfer.
    fn set_speed(&mut self, speed: BusSpeed);
}
