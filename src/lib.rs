//! SD/SDHC card read driver over SPI for bare-metal targets.
//!
//! This crate brings a card into SPI mode, classifies it (version 1 or 2,
//! standard or high capacity) and reads single 512-byte blocks or parts of
//! them over a polled SPI bus. Writes are not supported.

#![cfg_attr(not(test), no_std)]

mod bus;
mod clock;
mod config;
mod consts;
mod csd;
mod response;

pub use crate::bus::{BusSpeed, BusSpeedControl};
pub use crate::clock::TickClock;
pub use crate::config::{DefaultSdSpiConfig, SdSpiConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2};
pub use crate::response::R1Response;
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    clock::TickWindow,
    consts::{arguments, checksums, commands, tokens, CRC_LEN},
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::spi::Transfer;
use log::{error, info, warn};
use switch_hal::OutputSwitch;

/// [`SdSpi`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// No R1 response to this command within the attempt budget.
    TimeoutCommand(u8),
    /// Card stayed busy past the wait window.
    TimeoutWaitAvailable,
    /// Card never reported the idle state during reset.
    TimeoutIdleState,
    /// Card never left the idle state during negotiation.
    TimeoutReadyState,
    /// Data start token did not arrive; the payload is the last byte seen.
    TimeoutBlockStart(u8),
    /// CMD8 echoed back a wrong check pattern.
    CheckPatternMismatch(u8),
    /// CSD version field matches neither known layout.
    UnrecognizedCsd,
    /// Command was answered with an error status.
    ErrorCommand(u8),
    /// Offset/length outside the 512-byte block.
    ParameterError,
    /// Can't perform this operation with the card in this state.
    BadState,
}

/// Card type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardType {
    SD1,
    SD2,
    SDHC,
}

impl CardType {
    /// Card accepted CMD8 and speaks the version 2 command set.
    pub fn is_version_2(&self) -> bool {
        !matches!(self, CardType::SD1)
    }

    /// Card is addressed by block index instead of byte offset.
    pub fn is_high_capacity(&self) -> bool {
        matches!(self, CardType::SDHC)
    }
}

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI with bus rate control.
/// `Cs` - Chip select output switch.
/// `Clk` - Coarse tick clock.
/// `Config` - Implementation of the driver config trait.
pub struct SdSpi<Spi, Cs, Clk, Config>
where
    Spi: Transfer<u8> + BusSpeedControl,
    Cs: OutputSwitch,
    Clk: TickClock,
    Config: SdSpiConfig,
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    clock: Clk,
    status: Status,
    card_type: CardType,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Clk, Config> SdSpi<Spi, Cs, Clk, Config>
where
    Spi: Transfer<u8> + BusSpeedControl,
    Cs: OutputSwitch,
    Clk: TickClock,
    Config: SdSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Creates a new [`SdSpi<Spi, Cs, Clk, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `clock` - free-running coarse tick counter.
    pub fn new(spi: Spi, cs: Cs, clock: Clk) -> Self {
        SdSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            clock,
            status: StatusFlag::NotInitialized.into(),
            card_type: CardType::SD1,
            config: PhantomData::<Config>,
        }
    }

    /// Validate buffer for whole-block reads.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Validate initialized, diskio flavour.
    fn validate_initialized(&self) -> Result<(), DiskioError<ErrorFor<Self>>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(DiskioError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Validate initialized, direct-API flavour.
    fn validate_ready(&self) -> Result<(), ErrorFor<Self>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            Err(Error::BadState)
        } else {
            Ok(())
        }
    }

    /// Convert a logical block number into the card's addressing mode.
    fn convert_address(&self, lba: u32) -> u32 {
        match self.card_type {
            CardType::SD1 | CardType::SD2 => lba << 9,
            CardType::SDHC => lba,
        }
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// CS scope: the card is deselected again on every exit path.
    fn cs_scope<R, F>(&self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
    {
        self.select()?;
        let result = f(self);
        self.unselect()?;

        result
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking out an idle byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        self.transfer(tokens::IDLE)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Self>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Skip byte.
    fn skip_byte(&self) -> Result<(), ErrorFor<Self>> {
        self.receive().map(|_| ())
    }

    /// Clock out and discard the CRC trailing a data block.
    fn discard_crc(&self) -> Result<(), ErrorFor<Self>> {
        for _ in 0..CRC_LEN {
            self.skip_byte()?;
        }

        Ok(())
    }

    /// Wait for the card to stop signalling busy.
    ///
    /// Returns `Ok(false)` if the card still looked busy when the window
    /// closed; only transport faults are errors here.
    fn wait_not_busy(&self, window_ticks: u32) -> Result<bool, ErrorFor<Self>> {
        // early success path
        if self.receive()? == tokens::IDLE {
            return Ok(true);
        }

        let window = TickWindow::start(&self.clock, window_ticks);
        while !window.expired() {
            if self.receive()? == tokens::IDLE {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Wait for the data-start token of a read transaction.
    ///
    /// Polling continues only while idle bytes keep appearing; any other
    /// byte ends the wait and is carried in the error for diagnostics.
    fn wait_for_block_start(&self, window_ticks: u32) -> Result<(), ErrorFor<Self>> {
        // early success path
        let mut byte = self.receive()?;
        if byte == tokens::DATA_START_BLOCK {
            return Ok(());
        }

        let window = TickWindow::start(&self.clock, window_ticks);
        while byte == tokens::IDLE && !window.expired() {
            byte = self.receive()?;
        }

        if byte == tokens::DATA_START_BLOCK {
            Ok(())
        } else {
            Err(Error::TimeoutBlockStart(byte))
        }
    }

    /// Send command implementation.
    fn send_command_impl(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        // The outcome of this busy poll is deliberately ignored and the
        // command sent regardless; a card that is still busy answers with
        // its own error status.
        let _ = self.wait_not_busy(Config::SHORT_WAIT_TICKS)?;

        let checksum = match cmd {
            commands::CMD0 => checksums::CMD0,
            commands::CMD8 => checksums::CMD8,
            _ => checksums::DUMMY,
        };
        let frame = [
            cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            checksum,
        ];

        self.send_slice(&frame)?;

        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        Err(Error::TimeoutCommand(cmd))
    }

    /// Send command.
    ///
    /// Commands carrying the ACMD flag are prefixed with CMD55; the prefix
    /// response is discarded and the target command attempted either way.
    fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            match self.send_command_impl(commands::CMD55, 0x0000_0000) {
                Ok(_) | Err(Error::TimeoutCommand(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.send_command_impl(cmd & !commands::ACMD_FLAG, arg)
    }

    /// Reset the card into SPI mode and wait for the idle state.
    fn enter_idle_state(&self) -> Result<(), ErrorFor<Self>> {
        info!("Resetting SD card into SPI mode");

        let window = TickWindow::start(&self.clock, Config::INIT_WAIT_TICKS);
        loop {
            match self.send_command(commands::CMD0, 0x0000_0000) {
                Ok(r1) if r1 == R1Response::IN_IDLE_STATE => {
                    info!("SD card reached idle state");
                    return Ok(());
                }
                Ok(r1) => warn!("Wrong response from CMD0: {:#04X}", r1.0),
                Err(Error::TimeoutCommand(_)) => {}
                Err(err) => return Err(err),
            }

            if window.expired() {
                error!("SD card never reached idle state");
                return Err(Error::TimeoutIdleState);
            }
        }
    }

    /// Verify the card's interface operating condition and probe its version.
    fn probe_version(&self) -> Result<CardType, ErrorFor<Self>> {
        info!("Verifying SD interface operating condition");

        let r1 = self.send_command(commands::CMD8, arguments::CMD8_IF_COND)?;
        if r1.illegal_command() {
            info!("SD version 1 card");
            return Ok(CardType::SD1);
        }

        // R7 trailer; only the echoed check pattern in the last byte matters.
        self.skip_byte()?;
        self.skip_byte()?;
        self.skip_byte()?;
        let pattern = self.receive()?;

        if pattern != arguments::CMD8_PATTERN {
            error!("Wrong CMD8 check pattern: {:#04X}", pattern);
            return Err(Error::CheckPatternMismatch(pattern));
        }

        info!("SD version 2 card");
        Ok(CardType::SD2)
    }

    /// Negotiate the ready state with ACMD41.
    fn wait_ready_state(&self, card_type: CardType) -> Result<(), ErrorFor<Self>> {
        info!("Waiting for SD card ready state");

        let arg = match card_type {
            CardType::SD1 => 0x0000_0000,
            CardType::SD2 | CardType::SDHC => arguments::ACMD41_HIGH_CAPACITY,
        };

        let window = TickWindow::start(&self.clock, Config::INIT_WAIT_TICKS);
        loop {
            match self.send_command(commands::ACMD41, arg) {
                Ok(r1) if r1 == R1Response::READY_STATE => return Ok(()),
                Ok(_) | Err(Error::TimeoutCommand(_)) => {}
                Err(err) => return Err(err),
            }

            if window.expired() {
                error!("SD card never reached ready state");
                return Err(Error::TimeoutReadyState);
            }
        }
    }

    /// Read the OCR to tell high-capacity version 2 cards apart.
    fn classify_capacity(&self, card_type: CardType) -> Result<CardType, ErrorFor<Self>> {
        if card_type != CardType::SD2 {
            return Ok(card_type);
        }

        if self.send_command(commands::CMD58, 0x0000_0000)? != R1Response::READY_STATE {
            return Err(Error::ErrorCommand(commands::CMD58));
        }

        let ocr = self.receive()?;
        self.skip_byte()?;
        self.skip_byte()?;
        self.skip_byte()?;

        if ocr & tokens::OCR_HIGH_CAPACITY == tokens::OCR_HIGH_CAPACITY {
            info!("High-capacity SD card");
            return Ok(CardType::SDHC);
        }

        Ok(card_type)
    }

    /// Issue CMD17 and wait for the data block to start.
    fn start_single_read(&self, lba: u32) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD17, self.convert_address(lba))?;
        if r1 != R1Response::READY_STATE {
            return Err(Error::ErrorCommand(commands::CMD17));
        }

        self.wait_for_block_start(Config::SHORT_WAIT_TICKS)
    }

    /// One whole-block read transaction.
    fn read_single(&self, lba: u32, buf: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        self.cs_scope(|s| {
            s.start_single_read(lba)?;
            s.receive_slice(buf)?;
            s.discard_crc()
        })
    }

    /// Initialize the card: reset, classify and activate it.
    ///
    /// Successful initialization records the card type used by every
    /// subsequent read to pick the addressing mode.
    pub fn init(&mut self) -> Result<CardType, ErrorFor<Self>> {
        info!("SD initialize started");

        self.spi.borrow_mut().set_speed(BusSpeed::Initialization);
        self.unselect()?;

        // Power-up clock train, card deselected.
        for _ in 0..Config::POWER_UP_CLOCKS {
            self.send(tokens::IDLE)?;
        }

        let result = self.cs_scope(|s| {
            s.enter_idle_state()?;
            s.spi.borrow_mut().set_speed(BusSpeed::Full);

            let card_type = s.probe_version()?;
            s.wait_ready_state(card_type)?;
            s.classify_capacity(card_type)
        });

        match result {
            Ok(card_type) => {
                self.card_type = card_type;
                self.status = Status::default();
                info!("SD successfully initialized, version: {:?}", card_type);
                Ok(card_type)
            }
            Err(err) => {
                self.status = StatusFlag::ErrorOccured | StatusFlag::NotInitialized;
                error!("Failed to initialize SD: {:?}", err);
                Err(err)
            }
        }
    }

    /// Returns the card classification recorded by [`init`](Self::init).
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Read one 512-byte block.
    pub fn read_block(&self, lba: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), ErrorFor<Self>> {
        self.validate_ready()?;
        self.read_single(lba, buf)
    }

    /// Read `count` bytes starting `offset` bytes into a block.
    ///
    /// The whole block plus its CRC is clocked out of the card regardless of
    /// `offset` and `count`; bytes outside the requested span are discarded.
    pub fn read_partial(
        &self,
        buf: &mut [u8],
        lba: u32,
        offset: usize,
        count: usize,
    ) -> Result<(), ErrorFor<Self>> {
        if offset.saturating_add(count) > BLOCK_SIZE || buf.len() < count {
            error!(
                "SD partial read out of range, offset: {}, count: {}",
                offset, count
            );
            return Err(Error::ParameterError);
        }
        self.validate_ready()?;

        self.cs_scope(|s| {
            s.start_single_read(lba)?;

            for _ in 0..offset {
                s.skip_byte()?;
            }

            s.receive_slice(&mut buf[..count])?;

            for _ in 0..(BLOCK_SIZE - offset - count + CRC_LEN) {
                s.skip_byte()?;
            }

            Ok(())
        })
    }

    /// Read the raw Card Specific Data register.
    pub fn read_csd(&self) -> Result<CsdData, ErrorFor<Self>> {
        self.validate_ready()?;

        self.cs_scope(|s| {
            if s.send_command(commands::CMD9, 0x0000_0000)? != R1Response::READY_STATE {
                return Err(Error::ErrorCommand(commands::CMD9));
            }

            s.wait_for_block_start(Config::SHORT_WAIT_TICKS)?;

            let mut data = CsdData::default();
            s.receive_slice(&mut data)?;
            s.discard_crc()?;

            Ok(data)
        })
    }

    /// Card capacity in 512-byte blocks, decoded from a fresh CSD read.
    pub fn capacity_blocks(&self) -> Result<u32, ErrorFor<Self>> {
        let data = self.read_csd()?;

        match Csd::parse(data) {
            Some(csd) => {
                info!("SD capacity: {:?}", csd.card_capacity());
                Ok(csd.card_capacity_blocks() as u32)
            }
            None => {
                error!("Unrecognized CSD layout");
                Err(Error::UnrecognizedCsd)
            }
        }
    }
}

impl<Spi, Cs, Clk, Config> DiskioDevice for SdSpi<Spi, Cs, Clk, Config>
where
    Spi: Transfer<u8> + BusSpeedControl,
    Cs: OutputSwitch,
    Clk: TickClock,
    Config: SdSpiConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        self.init().map(|_| ()).map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        self.validate_initialized()?;

        for (index, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.read_single(lba as u32 + index as u32, chunk)
                .map_err(DiskioError::Hardware)?;
        }

        Ok(())
    }

    fn write(&self, _buf: &[u8], _lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        warn!("SD write requested, not supported");
        Err(DiskioError::NotSupported)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => self
                .cs_scope(|s| {
                    if s.wait_not_busy(Config::SHORT_WAIT_TICKS)? {
                        Ok(())
                    } else {
                        Err(Error::TimeoutWaitAvailable)
                    }
                })
                .map_err(DiskioError::Hardware),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csd::{raw_v1, raw_v2};

    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    /// Scripted SD card sitting on the other end of the bus.
    struct SimCard {
        version2: bool,
        high_capacity: bool,
        stuck_idle: bool,
        silent: bool,
        withhold_data: bool,
        check_pattern: u8,
        block: Vec<u8>,
        csd: CsdData,
        frame: Vec<u8>,
        reply: VecDeque<u8>,
        transfers: usize,
        selected: bool,
        speeds: Vec<BusSpeed>,
        read_addresses: Vec<u32>,
    }

    impl Default for SimCard {
        fn default() -> Self {
            SimCard {
                version2: false,
                high_capacity: false,
                stuck_idle: false,
                silent: false,
                withhold_data: false,
                check_pattern: arguments::CMD8_PATTERN,
                block: (0..BLOCK_SIZE).map(|i| i as u8).collect(),
                csd: raw_v2(1023),
                frame: Vec::new(),
                reply: VecDeque::new(),
                transfers: 0,
                selected: false,
                speeds: Vec::new(),
                read_addresses: Vec::new(),
            }
        }
    }

    impl SimCard {
        fn v1_card() -> Self {
            SimCard {
                csd: raw_v1(3879, 7, 9),
                ..SimCard::default()
            }
        }

        fn v2_card() -> Self {
            SimCard {
                version2: true,
                ..SimCard::default()
            }
        }

        fn v2_hc_card() -> Self {
            SimCard {
                version2: true,
                high_capacity: true,
                ..SimCard::default()
            }
        }

        fn exchange(&mut self, mosi: u8) -> u8 {
            self.transfers += 1;
            let miso = self.reply.pop_front().unwrap_or(tokens::IDLE);
            self.feed(mosi);
            miso
        }

        fn feed(&mut self, byte: u8) {
            if self.silent {
                return;
            }

            if !self.frame.is_empty() {
                self.frame.push(byte);
                if self.frame.len() == 6 {
                    self.execute();
                }
            } else if byte & 0xC0 == 0x40 {
                self.frame.push(byte);
            }
        }

        fn execute(&mut self) {
            let index = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([
                self.frame[1],
                self.frame[2],
                self.frame[3],
                self.frame[4],
            ]);
            self.frame.clear();

            // One in-band gap byte before the response, like a real card.
            self.reply.push_back(tokens::IDLE);

            match index {
                0 => self.reply.push_back(0x01),
                8 if self.version2 => {
                    self.reply.push_back(0x01);
                    self.reply.extend([0x00, 0x00, 0x01, self.check_pattern]);
                }
                8 => self.reply.push_back(0x05),
                55 => self.reply.push_back(0x01),
                41 => self
                    .reply
                    .push_back(if self.stuck_idle { 0x01 } else { 0x00 }),
                58 => {
                    self.reply.push_back(0x00);
                    let ocr0 = if self.high_capacity { 0xC0 } else { 0x80 };
                    self.reply.extend([ocr0, 0xFF, 0x80, 0x00]);
                }
                9 => {
                    self.reply.push_back(0x00);
                    self.reply.push_back(tokens::IDLE);
                    self.reply.push_back(tokens::DATA_START_BLOCK);
                    let csd = self.csd;
                    self.reply.extend(csd);
                    self.reply.extend([0xAA, 0xBB]);
                }
                17 => {
                    self.read_addresses.push(arg);
                    self.reply.push_back(0x00);
                    if self.withhold_data {
                        return;
                    }
                    self.reply.push_back(tokens::IDLE);
                    self.reply.push_back(tokens::DATA_START_BLOCK);
                    let block = self.block.clone();
                    self.reply.extend(block);
                    self.reply.extend([0x12, 0x34]);
                }
                _ => self.reply.push_back(0x04),
            }
        }
    }

    type SharedCard = Rc<RefCell<SimCard>>;

    struct SimBus(SharedCard);

    impl Transfer<u8> for SimBus {
        type Error = Infallible;

        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Infallible> {
            let mut card = self.0.borrow_mut();
            for word in words.iter_mut() {
                *word = card.exchange(*word);
            }
            Ok(words)
        }
    }

    impl BusSpeedControl for SimBus {
        fn set_speed(&mut self, speed: BusSpeed) {
            self.0.borrow_mut().speeds.push(speed);
        }
    }

    struct SimCs(SharedCard);

    impl OutputSwitch for SimCs {
        type Error = Infallible;

        fn on(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().selected = true;
            Ok(())
        }

        fn off(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().selected = false;
            Ok(())
        }
    }

    type TestDriver = SdSpi<SimBus, SimCs, Box<dyn Fn() -> u32>, DefaultSdSpiConfig>;

    /// Build a driver over the simulated card with a clock that advances one
    /// tick per read, so bounded waits expire instead of spinning forever.
    fn setup(card: SimCard) -> (SharedCard, TestDriver) {
        let shared = Rc::new(RefCell::new(card));
        let ticks = Cell::new(0u32);
        let clock: Box<dyn Fn() -> u32> = Box::new(move || {
            let now = ticks.get();
            ticks.set(now.wrapping_add(1));
            now
        });
        let driver = SdSpi::new(SimBus(shared.clone()), SimCs(shared.clone()), clock);
        (shared, driver)
    }

    #[test]
    fn init_classifies_v1_card() {
        let (card, mut driver) = setup(SimCard::v1_card());

        let card_type = driver.init().unwrap();

        assert_eq!(card_type, CardType::SD1);
        assert!(!card_type.is_version_2());
        assert!(!card_type.is_high_capacity());
        assert!(!card.borrow().selected);
    }

    #[test]
    fn init_classifies_v2_standard_card() {
        let (_card, mut driver) = setup(SimCard::v2_card());

        assert_eq!(driver.init().unwrap(), CardType::SD2);
        assert!(driver.card_type().is_version_2());
        assert!(!driver.card_type().is_high_capacity());
    }

    #[test]
    fn init_classifies_high_capacity_card() {
        let (_card, mut driver) = setup(SimCard::v2_hc_card());

        assert_eq!(driver.init().unwrap(), CardType::SDHC);
        assert!(driver.card_type().is_high_capacity());
    }

    #[test]
    fn init_switches_bus_speed_slow_then_full() {
        let (card, mut driver) = setup(SimCard::v2_card());

        driver.init().unwrap();

        assert_eq!(
            card.borrow().speeds,
            [BusSpeed::Initialization, BusSpeed::Full]
        );
    }

    #[test]
    fn init_times_out_on_silent_card() {
        let (card, mut driver) = setup(SimCard {
            silent: true,
            ..SimCard::default()
        });

        assert_eq!(driver.init(), Err(Error::TimeoutIdleState));
        assert!(!card.borrow().selected);
    }

    #[test]
    fn init_times_out_on_card_stuck_in_idle() {
        let (card, mut driver) = setup(SimCard {
            version2: true,
            stuck_idle: true,
            ..SimCard::default()
        });

        assert_eq!(driver.init(), Err(Error::TimeoutReadyState));
        assert!(!card.borrow().selected);
    }

    #[test]
    fn init_rejects_wrong_check_pattern() {
        let (_card, mut driver) = setup(SimCard {
            version2: true,
            check_pattern: 0x55,
            ..SimCard::default()
        });

        assert_eq!(driver.init(), Err(Error::CheckPatternMismatch(0x55)));
    }

    #[test]
    fn standard_cards_use_byte_addressing() {
        let (card, mut driver) = setup(SimCard::v2_card());
        driver.init().unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        driver.read_block(5, &mut buf).unwrap();

        assert_eq!(card.borrow().read_addresses, [5 << 9]);
    }

    #[test]
    fn high_capacity_cards_use_block_addressing() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        driver.init().unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        driver.read_block(5, &mut buf).unwrap();

        assert_eq!(card.borrow().read_addresses, [5]);
    }

    #[test]
    fn read_block_returns_payload_without_crc() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        driver.init().unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        driver.read_block(0, &mut buf).unwrap();

        assert_eq!(buf[..], card.borrow().block[..]);
    }

    #[test]
    fn read_block_requires_initialization() {
        let (card, driver) = setup(SimCard::v2_card());

        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(driver.read_block(0, &mut buf), Err(Error::BadState));
        assert_eq!(card.borrow().transfers, 0);
    }

    #[test]
    fn read_block_times_out_without_start_token() {
        let (card, mut driver) = setup(SimCard {
            version2: true,
            withhold_data: true,
            ..SimCard::default()
        });
        driver.init().unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(
            driver.read_block(0, &mut buf),
            Err(Error::TimeoutBlockStart(tokens::IDLE))
        );
        assert!(!card.borrow().selected);
    }

    #[test]
    fn partial_reads_clock_the_same_byte_count_for_any_split() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        driver.init().unwrap();

        let mut counts = Vec::new();
        let mut buf = [0u8; BLOCK_SIZE];
        for (offset, count) in [(0, BLOCK_SIZE), (100, 100), (511, 1)] {
            let before = card.borrow().transfers;
            driver.read_partial(&mut buf, 0, offset, count).unwrap();
            counts.push(card.borrow().transfers - before);
        }

        assert_eq!(counts[0], counts[1]);
        assert_eq!(counts[1], counts[2]);
    }

    #[test]
    fn partial_read_copies_the_requested_span() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        driver.init().unwrap();

        let mut buf = [0u8; 100];
        driver.read_partial(&mut buf, 0, 100, 100).unwrap();

        assert_eq!(buf[..], card.borrow().block[100..200]);
    }

    #[test]
    fn partial_read_rejects_out_of_range_span_without_bus_traffic() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        driver.init().unwrap();

        let before = card.borrow().transfers;
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(
            driver.read_partial(&mut buf, 0, 200, 400),
            Err(Error::ParameterError)
        );
        assert_eq!(card.borrow().transfers, before);
    }

    #[test]
    fn capacity_is_decoded_from_the_csd_version_field() {
        let (_card, mut driver) = setup(SimCard {
            version2: true,
            csd: raw_v2(1023),
            ..SimCard::default()
        });
        driver.init().unwrap();

        assert_eq!(driver.capacity_blocks().unwrap(), 1024 * 1024);
    }

    #[test]
    fn v1_card_capacity_uses_the_legacy_layout() {
        let (_card, mut driver) = setup(SimCard::v1_card());
        driver.init().unwrap();

        assert_eq!(driver.capacity_blocks().unwrap(), 3880 << 9);
    }

    #[test]
    fn unrecognized_csd_version_is_an_error() {
        let mut csd = raw_v1(0, 0, 9);
        csd[0] |= 0x80;
        let (_card, mut driver) = setup(SimCard {
            version2: true,
            csd,
            ..SimCard::default()
        });
        driver.init().unwrap();

        assert_eq!(driver.capacity_blocks(), Err(Error::UnrecognizedCsd));
    }

    #[test]
    fn diskio_read_walks_consecutive_blocks() {
        let (card, mut driver) = setup(SimCard::v2_hc_card());
        DiskioDevice::initialize(&mut driver).unwrap();

        let mut buf = [0u8; 2 * BLOCK_SIZE];
        driver.read(&mut buf, 7).unwrap();

        assert_eq!(card.borrow().read_addresses, [7, 8]);
        assert_eq!(buf[..BLOCK_SIZE], card.borrow().block[..]);
        assert_eq!(buf[BLOCK_SIZE..], card.borrow().block[..]);
    }

    #[test]
    fn diskio_read_rejects_ragged_buffers() {
        let (_card, mut driver) = setup(SimCard::v2_card());
        DiskioDevice::initialize(&mut driver).unwrap();

        let mut buf = [0u8; 100];
        assert!(matches!(
            driver.read(&mut buf, 0),
            Err(DiskioError::InvalidArgument)
        ));
    }

    #[test]
    fn diskio_initialize_twice_is_rejected() {
        let (_card, mut driver) = setup(SimCard::v2_card());
        DiskioDevice::initialize(&mut driver).unwrap();

        assert!(matches!(
            DiskioDevice::initialize(&mut driver),
            Err(DiskioError::AlreadyInitialized)
        ));
    }

    #[test]
    fn write_is_unsupported_and_touches_no_bus() {
        let (card, mut driver) = setup(SimCard::v2_card());
        DiskioDevice::initialize(&mut driver).unwrap();

        let before = card.borrow().transfers;
        let buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            driver.write(&buf, 0),
            Err(DiskioError::NotSupported)
        ));
        assert_eq!(card.borrow().transfers, before);
    }

    #[test]
    fn ioctl_reports_block_size() {
        let (_card, driver) = setup(SimCard::v2_card());

        let mut block_size = 0;
        driver
            .ioctl(IoctlCmd::GetBlockSize(&mut block_size))
            .unwrap();

        assert_eq!(block_size, BLOCK_SIZE);
    }

    #[test]
    fn ioctl_sync_waits_out_the_busy_state() {
        let (card, mut driver) = setup(SimCard::v2_card());
        DiskioDevice::initialize(&mut driver).unwrap();

        driver.ioctl(IoctlCmd::CtrlSync).unwrap();
        assert!(!card.borrow().selected);
    }
}
