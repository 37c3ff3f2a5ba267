//! Generic register abstractions for type-safe DPCD programming

/// Trait for register layouts that can be converted to/from raw DPCD bytes
///
/// DPCD registers are byte-addressed, so every layout packs into exactly one
/// byte. Multi-byte blocks (link status, tunnel info) are decoded by the
/// consumers that read them.
///
/// # Example
///
/// ```ignore
/// use dplink_raw::register::DpcdLayout;
///
/// #[derive(Debug, Default)]
/// struct MyControl {
///     enable: bool,
///     level: u8,
/// }
///
/// impl DpcdLayout for MyControl {
///     fn to_dpcd(&self) -> u8 {
///         (self.level & 0x3) | if self.enable { 1 << 7 } else { 0 }
///     }
///
///     fn from_dpcd(value: u8) -> Self {
///         Self {
///             enable: value & (1 << 7) != 0,
///             level: value & 0x3,
///         }
///     }
/// }
/// ```
pub trait DpcdLayout: Sized {
    /// Convert this register layout to a raw DPCD byte
    fn to_dpcd(&self) -> u8;

    /// Parse a raw DPCD byte into this register layout
    fn from_dpcd(value: u8) -> Self;

    /// Validate that the register fields are within acceptable ranges
    ///
    /// Returns `Ok(())` if valid, or an error message if invalid.
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// A DPCD register with address and typed layout
///
/// # Example
///
/// ```ignore
/// use dplink_raw::register::Register;
/// use dplink_raw::dpcd::link::{addr, TrainLaneSet};
///
/// let reg = Register::new(addr::TRAINING_LANE0_SET, TrainLaneSet::default());
/// let value = reg.to_dpcd();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Register<T: DpcdLayout> {
    /// DPCD address (20 bits)
    pub address: u32,
    /// Typed register layout
    pub layout: T,
}

impl<T: DpcdLayout> Register<T> {
    /// Create a new register with the given address and layout
    pub fn new(address: u32, layout: T) -> Self {
        Self { address, layout }
    }

    /// Validate the register layout
    pub fn validate(&self) -> Result<(), &'static str> {
        self.layout.validate()
    }

    /// Get the DPCD byte for this register
    pub fn to_dpcd(&self) -> u8 {
        self.layout.to_dpcd()
    }
}
