//! # Adapter Configuration
//!
//! Static settings for one adapter: what the bus layer learned when it
//! matched the device (board family, DMA reach, channel count) and the
//! operator's tunables. Settings can be built in code or parsed from a
//! `key = value` text block.
//!
//! ```text
//! # MegaRAID adapter 0
//! host = 0
//! quartz = yes
//! 64bit = no
//! max_cmds = 126
//! channels = 2
//! skip_id = 6
//! boot = ld:2
//! drain_poll_ms = 1000
//! ```

use crate::{MAX_CHANNELS, MAX_COMMANDS, NVIRT_CHAN};
use bitflags::bitflags;
use core::fmt;

// =============================================================================
// BOARD FLAGS
// =============================================================================

bitflags! {
    /// Capabilities of the board and its firmware
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoardFlags: u32 {
        /// Doorbell-based (i960/Quartz) register interface
        const QUARTZ = 1 << 0;
        /// 64-bit read/write and pass-through commands
        const BIT64 = 1 << 1;
        /// Firmware supports 40 logical drives
        const LD40 = 1 << 2;
    }
}

// =============================================================================
// BOOT DEVICE
// =============================================================================

/// Drive the system BIOS boots from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    /// A logical drive, exposed as logical drive 0
    Logical(u8),
    /// A physical disk, exposed at target 0 of its channel
    Physical {
        /// Physical channel
        channel: u8,
        /// Target id
        target: u8,
    },
}

impl BootDevice {
    /// Decode the boot drive byte of the adapter BIOS private data
    pub const fn from_bios_byte(value: u8) -> Self {
        if value & 0x80 != 0 {
            let value = value & 0x7F;
            BootDevice::Physical {
                channel: value / 16,
                target: value % 16,
            }
        } else {
            BootDevice::Logical(value)
        }
    }

    /// Parse `ld:<n>` or `pd:<channel>:<target>`
    pub fn from_str(s: &str) -> Result<Option<Self>, ConfigError> {
        let mut parts = s.split(':');
        match parts.next() {
            Some("none") => Ok(None),
            Some("ld") => {
                let drive = parse_u8(parts.next().ok_or(ConfigError::InvalidValue)?)?;
                Ok(Some(BootDevice::Logical(drive)))
            }
            Some("pd") => {
                let channel = parse_u8(parts.next().ok_or(ConfigError::InvalidValue)?)?;
                let target = parse_u8(parts.next().ok_or(ConfigError::InvalidValue)?)?;
                Ok(Some(BootDevice::Physical { channel, target }))
            }
            _ => Err(ConfigError::InvalidValue),
        }
    }
}

// =============================================================================
// ADAPTER CONFIGURATION
// =============================================================================

/// Configuration of one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Host number used in log lines
    pub host_no: u32,
    /// Board family and addressing; `LD40` is discovered at attach
    pub board: BoardFlags,
    /// Command slots to allocate
    pub max_cmds: u16,
    /// Physical SCSI channels present on the board
    pub scsi_channels: u8,
    /// Physical target id hidden from the host
    pub skip_id: Option<u8>,
    /// Boot device override; probed from the adapter BIOS when unset
    pub boot_device: Option<BootDevice>,
    /// Interval between pending-queue checks while quiescing
    pub drain_poll_ms: u32,
    /// Give up quiescing after this long; wait forever when unset
    pub drain_timeout_ms: Option<u32>,
    /// Interval between checks while an ioctl waits for its completion
    pub ioctl_poll_ms: u32,
    /// Iterations of hardware handshakes before declaring the board stuck
    pub spin_limit: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterConfig {
    /// Default configuration for a port-based 32-bit board
    pub const fn new() -> Self {
        Self {
            host_no: 0,
            board: BoardFlags::empty(),
            max_cmds: MAX_COMMANDS,
            scsi_channels: 1,
            skip_id: None,
            boot_device: None,
            drain_poll_ms: 1000,
            drain_timeout_ms: None,
            ioctl_poll_ms: 1,
            spin_limit: 1_000_000,
        }
    }

    /// Set the host number
    pub fn with_host(mut self, host_no: u32) -> Self {
        self.host_no = host_no;
        self
    }

    /// Set board flags
    pub fn with_board(mut self, board: BoardFlags) -> Self {
        self.board = board;
        self
    }

    /// Set the command slot count
    pub fn with_max_cmds(mut self, max_cmds: u16) -> Self {
        self.max_cmds = max_cmds;
        self
    }

    /// Set the number of physical channels
    pub fn with_scsi_channels(mut self, channels: u8) -> Self {
        self.scsi_channels = channels;
        self
    }

    /// Hide a physical target id
    pub fn with_skip_id(mut self, target: u8) -> Self {
        self.skip_id = Some(target);
        self
    }

    /// Override the boot device
    pub fn with_boot_device(mut self, boot: BootDevice) -> Self {
        self.boot_device = Some(boot);
        self
    }

    /// Set the quiescence poll interval and optional deadline
    pub fn with_drain(mut self, poll_ms: u32, timeout_ms: Option<u32>) -> Self {
        self.drain_poll_ms = poll_ms;
        self.drain_timeout_ms = timeout_ms;
        self
    }

    /// Parse from `key = value` text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = parse_key_value(line).ok_or(ConfigError::InvalidSyntax)?;
            config.apply_setting(key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply a setting
    fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "host" => self.host_no = parse_u32(value)?,
            "quartz" => self.board.set(BoardFlags::QUARTZ, parse_bool(value)?),
            "64bit" => self.board.set(BoardFlags::BIT64, parse_bool(value)?),
            "max_cmds" => {
                self.max_cmds = value.parse().map_err(|_| ConfigError::InvalidValue)?
            }
            "channels" => self.scsi_channels = parse_u8(value)?,
            "skip_id" => self.skip_id = Some(parse_u8(value)?),
            "boot" => self.boot_device = BootDevice::from_str(value)?,
            "drain_poll_ms" => self.drain_poll_ms = parse_u32(value)?,
            "drain_timeout_ms" => self.drain_timeout_ms = Some(parse_u32(value)?),
            "ioctl_poll_ms" => self.ioctl_poll_ms = parse_u32(value)?,
            "spin_limit" => self.spin_limit = parse_u32(value)?,
            _ => return Err(ConfigError::UnknownKey),
        }
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cmds == 0 || self.scsi_channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidValue);
        }
        if self.drain_poll_ms == 0 || self.spin_limit == 0 {
            return Err(ConfigError::InvalidValue);
        }
        Ok(())
    }
}

// =============================================================================
// CHANNEL LAYOUT
// =============================================================================

/// Where a host channel/target pair lands on the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A logical drive behind virtual channel `vchan`
    Logical {
        /// Virtual channel index
        vchan: u8,
        /// Target id on that channel
        target: u8,
    },
    /// A physical device
    Physical {
        /// Physical channel
        channel: u8,
        /// Target id after boot-disk exposure
        target: u8,
    },
}

/// Host channel numbering of one adapter
///
/// The host sees `NVIRT_CHAN` virtual channels for logical drives plus one
/// channel per physical bus. Logical channels come first unless the board
/// boots from a physical disk, in which case the physical channels lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    scsi_channels: u8,
    raid_class: u8,
    boot_pdrv: Option<(u8, u8)>,
}

impl ChannelMap {
    /// Build the layout; `raid_class` has one bit per physical channel
    pub fn new(scsi_channels: u8, raid_class: u8, boot: Option<BootDevice>) -> Self {
        let boot_pdrv = match boot {
            Some(BootDevice::Physical { channel, target }) => Some((channel, target)),
            _ => None,
        };
        Self {
            scsi_channels: scsi_channels.min(MAX_CHANNELS),
            raid_class,
            boot_pdrv,
        }
    }

    /// Channels exposed to the host
    pub const fn host_channels(&self) -> u8 {
        self.scsi_channels + NVIRT_CHAN
    }

    /// Whether the board boots from a physical disk
    pub const fn boots_physical(&self) -> bool {
        self.boot_pdrv.is_some()
    }

    fn physical_index(&self, channel: u8) -> Option<u8> {
        let index = if self.boot_pdrv.is_some() {
            channel
        } else {
            channel.checked_sub(NVIRT_CHAN)?
        };
        (index < self.scsi_channels).then_some(index)
    }

    /// Whether a host channel carries logical drives
    pub fn is_logical(&self, channel: u8) -> bool {
        if channel >= self.host_channels() {
            return false;
        }
        self.physical_index(channel).is_none()
    }

    /// Whether a host channel is a physical channel owned by the RAID firmware
    pub fn is_raid(&self, channel: u8) -> bool {
        self.physical_index(channel)
            .map(|index| self.raid_class & (1 << index) != 0)
            .unwrap_or(false)
    }

    /// Translate a host channel/target pair
    pub fn route(&self, channel: u8, target: u8) -> Option<Route> {
        if channel >= self.host_channels() {
            return None;
        }
        if let Some(index) = self.physical_index(channel) {
            let target = match self.boot_pdrv {
                Some((boot_ch, boot_tgt)) if boot_ch == index => {
                    if target == 0 {
                        boot_tgt
                    } else if target == boot_tgt {
                        0
                    } else {
                        target
                    }
                }
                _ => target,
            };
            return Some(Route::Physical { channel: index, target });
        }
        let vchan = if self.boot_pdrv.is_some() {
            channel - self.scsi_channels
        } else {
            channel
        };
        Some(Route::Logical { vchan, target })
    }
}

// =============================================================================
// PARSING HELPERS
// =============================================================================

/// Parse key-value pair
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();

    // Remove quotes
    let value = value.trim_matches('"').trim_matches('\'');

    Some((key, value))
}

fn parse_u32(s: &str) -> Result<u32, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidValue)
}

fn parse_u8(s: &str) -> Result<u8, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidValue)
}

fn parse_bool(s: &str) -> Result<bool, ConfigError> {
    match s {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue),
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Configuration error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Line is not `key = value`
    InvalidSyntax,
    /// Value out of range or malformed
    InvalidValue,
    /// Key not recognised
    UnknownKey,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidSyntax => write!(f, "invalid syntax"),
            ConfigError::InvalidValue => write!(f, "invalid value"),
            ConfigError::UnknownKey => write!(f, "unknown key"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
