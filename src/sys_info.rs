use crate::column::{Column, coerce_number};

bitflags::bitflags! {
    /// Reason for the most recent controller reset.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResetRootCause: u32 {
        const SOFTWARE = 1 << 0;
        const WATCHDOG = 1 << 1;
        const BROWN_OUT = 1 << 2;
        const POWER_UP = 1 << 3;
        const EXTERNAL = 1 << 4;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NtpFaultState: u32 {
        const LOGFILE = 1 << 0;
        const WARNING = 1 << 1;
        const ERROR = 1 << 2;
        const NTP_AVAILABLE = 1 << 16;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConfigOtherEnable: u32 {
        const TCP_IP_BOOST = 1 << 0;
        const SD_CARD = 1 << 1;
        const DMX = 1 << 2;
        const AVATAR = 1 << 3;
        const RELAY_EXTENSION = 1 << 4;
        const HIGH_BUS_LOAD = 1 << 5;
        const FLOW_SENSOR = 1 << 6;
        const REPEATED_MAILS = 1 << 7;
        /// Extension attached over DMX rather than SPI.
        const EXTENSION_DMX = 1 << 8;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DosageControl: u32 {
        const CHLORINE = 1 << 0;
        /// Chlorine is produced by an electrolysis cell instead of dosed by a pump.
        const ELECTROLYSIS = 1 << 4;
        const PH_MINUS = 1 << 8;
        const PH_PLUS = 1 << 12;
    }
}

/// The first row of `/GetState.csv`, which is unrelated to the data columns below it.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct SysInfo {
    pub version: String,
    /// Seconds since the controller booted.
    pub uptime: u64,
    pub reset_root_cause: u32,
    pub ntp_fault_state: u32,
    pub config_other_enable: u32,
    pub dosage_control: u32,
    pub ph_plus_relay: u32,
    pub ph_minus_relay: u32,
    pub chlorine_relay: u32,
}

fn integral<T: TryFrom<u64> + Default>(cell: Option<&String>) -> T {
    let value = cell.map(|c| coerce_number(c)).unwrap_or(0.0);
    if !value.is_finite() || value < 0.0 {
        return T::default();
    }
    T::try_from(value as u64).unwrap_or_default()
}

impl SysInfo {
    /// Derive from the sysinfo row. Field 0 is a tag and ignored.
    pub fn from_row(row: &[String]) -> Self {
        SysInfo {
            version: row.get(1).cloned().unwrap_or_default(),
            uptime: integral(row.get(2)),
            reset_root_cause: integral(row.get(3)),
            ntp_fault_state: integral(row.get(4)),
            config_other_enable: integral(row.get(5)),
            dosage_control: integral(row.get(6)),
            ph_plus_relay: integral(row.get(7)),
            ph_minus_relay: integral(row.get(8)),
            chlorine_relay: integral(row.get(9)),
        }
    }

    pub fn reset_root_cause_flags(&self) -> ResetRootCause {
        ResetRootCause::from_bits_retain(self.reset_root_cause)
    }

    pub fn ntp_fault_state_flags(&self) -> NtpFaultState {
        NtpFaultState::from_bits_retain(self.ntp_fault_state)
    }

    pub fn config_other_enable_flags(&self) -> ConfigOtherEnable {
        ConfigOtherEnable::from_bits_retain(self.config_other_enable)
    }

    pub fn dosage_control_flags(&self) -> DosageControl {
        DosageControl::from_bits_retain(self.dosage_control)
    }

    pub fn is_chlorine_dosage_enabled(&self) -> bool {
        self.dosage_control & DosageControl::CHLORINE.bits() != 0
    }

    pub fn is_electrolysis(&self) -> bool {
        self.dosage_control & DosageControl::ELECTROLYSIS.bits() != 0
    }

    pub fn is_ph_minus_dosage_enabled(&self) -> bool {
        self.dosage_control & DosageControl::PH_MINUS.bits() != 0
    }

    pub fn is_ph_plus_dosage_enabled(&self) -> bool {
        self.dosage_control & DosageControl::PH_PLUS.bits() != 0
    }

    pub fn is_avatar_enabled(&self) -> bool {
        self.config_other_enable & ConfigOtherEnable::AVATAR.bits() != 0
    }

    pub fn is_ext_relays_enabled(&self) -> bool {
        self.config_other_enable & ConfigOtherEnable::RELAY_EXTENSION.bits() != 0
    }

    /// Whether digital input 0 is wired to a flow sensor.
    pub fn is_flow_sensor_enabled(&self) -> bool {
        self.config_other_enable & ConfigOtherEnable::FLOW_SENSOR.bits() != 0
    }

    pub fn is_dmx_enabled(&self) -> bool {
        self.config_other_enable & ConfigOtherEnable::EXTENSION_DMX.bits() != 0
    }

    /// Whether the dosage behind a canister (or canister consumption) column is enabled.
    pub fn is_dosage_enabled(&self, column: &Column) -> bool {
        match column.id {
            36 | 39 => self.is_chlorine_dosage_enabled(),
            37 | 40 => self.is_ph_minus_dosage_enabled(),
            38 | 41 => self.is_ph_plus_dosage_enabled(),
            _ => false,
        }
    }

    /// The configured dosage relay index for a canister (or canister consumption) column.
    pub fn dosage_relay(&self, column: &Column) -> Option<u32> {
        match column.id {
            36 | 39 => Some(self.chlorine_relay),
            37 | 40 => Some(self.ph_minus_relay),
            38 | 41 => Some(self.ph_plus_relay),
            _ => None,
        }
    }

    pub fn to_key_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.clone()),
            ("uptime", humantime::format_duration(std::time::Duration::from_secs(self.uptime)).to_string()),
            ("resetRootCause", format!("{:?}", self.reset_root_cause_flags())),
            ("ntpFaultState", format!("{:?}", self.ntp_fault_state_flags())),
            ("configOtherEnable", format!("{:?}", self.config_other_enable_flags())),
            ("dosageControl", format!("{:?}", self.dosage_control_flags())),
            ("phPlusDosageRelay", self.ph_plus_relay.to_string()),
            ("phMinusDosageRelay", self.ph_minus_relay.to_string()),
            ("chlorineDosageRelay", self.chlorine_relay.to_string()),
        ]
    }
}
