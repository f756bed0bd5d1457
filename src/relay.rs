//! Relay state bit juggling for the `/usrcfg.cgi` endpoint.
//!
//! The endpoint takes two bit patterns which together replace the state of **every** relay: one
//! selects manual (1) or auto (0) mode, the other on (1) or off (0). Changing a single relay
//! therefore requires a snapshot of all the others first, see [`RelayInterpreter::evaluate`].

use crate::category::Category;
use crate::column::Column;
use crate::frame::Frame;
use tracing::debug;

/// Bits of a relay's raw value.
pub const ON_BIT: u16 = 0b01;
pub const MANUAL_BIT: u16 = 0b10;

/// Number of bits the internal relay bank occupies; external relays follow.
const INTERNAL_RELAYS: u32 = 8;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("column {0} is not a relay")]
    NotARelay(usize),
    #[error("relay in column {id} maps to bit {bit}, outside of the {width}-bit relay bank")]
    OutsideBank { id: usize, bit: u32, width: u32 },
    #[error("relay states have not been evaluated yet")]
    NotEvaluated,
}

/// The desired outcome of a relay switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum RelayState {
    Off = 0,
    On = 1,
    Auto = 2,
}

/// Relay view of a plain [`Column`].
pub trait RelayColumn {
    /// Bit of this relay in the masks, `None` for columns outside both relay categories.
    fn bit_index(&self) -> Option<u32>;
    fn raw_bits(&self) -> u16;

    fn bit_mask(&self) -> Option<u16> {
        self.bit_index().and_then(|bit| 1u16.checked_shl(bit))
    }

    fn is_on(&self) -> bool {
        self.raw_bits() & ON_BIT == ON_BIT
    }

    fn is_off(&self) -> bool {
        !self.is_on()
    }

    fn is_manual(&self) -> bool {
        self.raw_bits() & MANUAL_BIT == MANUAL_BIT
    }

    fn is_auto(&self) -> bool {
        !self.is_manual()
    }
}

impl RelayColumn for Column {
    fn bit_index(&self) -> Option<u32> {
        // category_id starts at 1.
        let position = u32::try_from(self.category_id.checked_sub(1)?).ok()?;
        match self.category? {
            Category::Relays => Some(position),
            Category::ExternalRelays => Some(position + INTERNAL_RELAYS),
            _ => None,
        }
    }

    fn raw_bits(&self) -> u16 {
        // The controller only ever reports 0..=3. NaN reads as 0.
        self.raw as i64 as u16
    }
}

/// The pair of bit patterns `/usrcfg.cgi` expects, always sent together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RelayMasks {
    /// Bit set: relay is in manual mode.
    pub mode: u16,
    /// Bit set: relay is switched on.
    pub state: u16,
    /// 8 without, 16 with the relay extension.
    pub width: u32,
}

impl RelayMasks {
    fn all_manual(width: u32) -> Self {
        let mode = if width >= u16::BITS { u16::MAX } else { (1u16 << width) - 1 };
        RelayMasks { mode, state: 0, width }
    }

    /// `ENA` form value: `<mode>,<state>`.
    pub fn ena_value(&self) -> String {
        format!("{},{}", self.mode, self.state)
    }
}

#[derive(Default, Debug)]
pub struct RelayInterpreter {
    masks: Option<RelayMasks>,
}

impl RelayInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the state of the whole relay bank.
    ///
    /// Must be called with the freshest possible frame right before any of the `set_*` methods:
    /// whatever diverges from this snapshot will be overwritten by the subsequent write.
    pub fn evaluate(&mut self, frame: &Frame) -> &mut Self {
        let mut relays = frame.objects_by_category(Category::Relays, false);
        let width = if frame.sys_info.is_ext_relays_enabled() {
            relays.extend(frame.objects_by_category(Category::ExternalRelays, false));
            2 * INTERNAL_RELAYS
        } else {
            INTERNAL_RELAYS
        };
        let mut masks = RelayMasks::all_manual(width);
        for relay in relays {
            let Some(mask) = relay.bit_mask() else { continue };
            debug!(
                relay.id = relay.id,
                relay.label = %relay.label,
                relay.raw = relay.raw,
                mask,
                "evaluating relay"
            );
            if relay.is_auto() {
                masks.mode &= !mask;
            }
            if relay.is_on() {
                masks.state |= mask;
            }
        }
        self.masks = Some(masks);
        self
    }

    pub fn masks(&self) -> Option<RelayMasks> {
        self.masks
    }

    fn target_mask(&self, relay: &Column) -> Result<(RelayMasks, u16), Error> {
        let masks = self.masks.ok_or(Error::NotEvaluated)?;
        let bit = relay.bit_index().ok_or(Error::NotARelay(relay.id))?;
        if bit >= masks.width {
            return Err(Error::OutsideBank { id: relay.id, bit, width: masks.width });
        }
        debug!(?masks, relay.id = relay.id, bit, "relay masks before switching");
        Ok((masks, 1 << bit))
    }

    fn store(&mut self, masks: RelayMasks) -> RelayMasks {
        self.masks = Some(masks);
        masks
    }

    pub fn set_on(&mut self, relay: &Column) -> Result<RelayMasks, Error> {
        let (mut masks, mask) = self.target_mask(relay)?;
        masks.mode |= mask;
        masks.state |= mask;
        Ok(self.store(masks))
    }

    pub fn set_off(&mut self, relay: &Column) -> Result<RelayMasks, Error> {
        let (mut masks, mask) = self.target_mask(relay)?;
        masks.mode |= mask;
        masks.state &= !mask;
        Ok(self.store(masks))
    }

    pub fn set_auto(&mut self, relay: &Column) -> Result<RelayMasks, Error> {
        let (mut masks, mask) = self.target_mask(relay)?;
        masks.mode &= !mask;
        masks.state &= !mask;
        Ok(self.store(masks))
    }

    pub fn set(&mut self, relay: &Column, state: RelayState) -> Result<RelayMasks, Error> {
        match state {
            RelayState::On => self.set_on(relay),
            RelayState::Off => self.set_off(relay),
            RelayState::Auto => self.set_auto(relay),
        }
    }
}

/// Raw value the relay is expected to report once the switch took effect.
///
/// For auto mode the on bit is left to the controller and kept as last seen.
pub fn desired_raw_value(relay: &Column, state: RelayState) -> u16 {
    match state {
        RelayState::Auto => relay.raw_bits() & !MANUAL_BIT,
        RelayState::On => MANUAL_BIT | ON_BIT,
        RelayState::Off => MANUAL_BIT,
    }
}
