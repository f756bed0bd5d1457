use crate::category::Category;
use std::collections::BTreeMap;

/// Label the controller uses for disabled columns.
pub const INACTIVE_LABEL: &str = "n.a.";

/// One data column of the `/GetState.csv` response (ignoring the sysinfo row).
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Column {
    /// Column index, starting at 0.
    pub id: usize,
    pub label: String,
    pub unit: String,
    pub offset: f64,
    pub gain: f64,
    /// Raw measurement as reported by the controller.
    pub raw: f64,
    /// `offset + gain * raw`.
    pub value: f64,
    pub display_value: String,
    pub category: Option<Category>,
    /// Position within [`Self::category`], starting at 1. Zero while uncategorized.
    pub category_id: usize,
    pub active: bool,
    /// Caller-defined values. Never touched by the parser.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Column {
    pub fn new(id: usize, name: &str, unit: &str, offset: &str, gain: &str, measure: &str) -> Self {
        let mut column = Column {
            id,
            label: String::new(),
            unit: String::new(),
            offset: 0.0,
            gain: 0.0,
            raw: 0.0,
            value: 0.0,
            display_value: String::new(),
            category: None,
            category_id: 0,
            active: false,
            extensions: BTreeMap::new(),
        };
        column.set(id, name, unit, offset, gain, measure);
        column
    }

    /// An inactive stand-in for a column the frame does not know about.
    pub fn placeholder(id: usize) -> Self {
        let mut column = Self::new(id, "", "", "", "", "");
        column.active = false;
        column
    }

    /// Re-set the column from its raw CSV cells.
    ///
    /// Categorization and extensions survive, so references held across polls stay meaningful.
    pub fn set(&mut self, id: usize, name: &str, unit: &str, offset: &str, gain: &str, measure: &str) {
        self.id = id;
        self.label = name.to_string();
        self.unit = unit.to_string();
        self.offset = coerce_number(offset);
        self.gain = coerce_number(gain);
        self.raw = coerce_number(measure);
        self.value = self.offset + self.gain * self.raw;
        self.active = name != INACTIVE_LABEL;
        self.display_value = format_value(self.value, &self.unit);
    }
}

/// Numeric coercion of a CSV cell: blank is zero, garbage is NaN.
pub(crate) fn coerce_number(cell: &str) -> f64 {
    let cell = cell.trim();
    if cell.is_empty() {
        return 0.0;
    }
    cell.parse().unwrap_or(f64::NAN)
}

fn format_value(value: f64, unit: &str) -> String {
    match unit {
        "C" | "F" => format!("{value:.2} °{unit}"),
        "h" => {
            // Packed duration: hours in the high byte, minutes in the low one.
            let packed = value as i64 as i32;
            format!("{:02}:{:02}", packed >> 8, packed & 0xFF)
        }
        "--" => value.to_string(),
        _ => format!("{value:.2} {unit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_display() {
        let column = Column::new(8, "Pool", "C", "0", "0.1", "235");
        assert!((column.value - 23.5).abs() < 1e-9);
        assert_eq!(column.display_value, "23.50 °C");
        let column = Column::new(9, "Air", "F", "32", "1", "45");
        assert_eq!(column.display_value, "77.00 °F");
    }

    #[test]
    fn packed_hours_display() {
        let column = Column::new(0, "Time", "h", "0", "1", "267");
        assert_eq!(column.display_value, "01:11");
        let column = Column::new(0, "Time", "h", "0", "1", "5898");
        assert_eq!(column.display_value, "23:10");
        let column = Column::new(0, "Time", "h", "0", "1", "0");
        assert_eq!(column.display_value, "00:00");
    }

    #[test]
    fn enumeration_display() {
        let column = Column::new(16, "Pump", "--", "0", "1", "3");
        assert_eq!(column.display_value, "3");
        let column = Column::new(16, "Pump", "--", "0", "0.5", "3");
        assert_eq!(column.display_value, "1.5");
    }

    #[test]
    fn other_units_display() {
        let column = Column::new(6, "Redox", "mV", "0", "1", "718");
        assert_eq!(column.display_value, "718.00 mV");
        let column = Column::new(7, "pH", "pH", "0", "0.01", "712");
        assert_eq!(column.display_value, "7.12 pH");
    }

    #[test]
    fn non_numeric_input_propagates_nan() {
        let column = Column::new(3, "Broken", "bar", "0", "x", "12");
        assert!(column.gain.is_nan());
        assert!(column.value.is_nan());
        assert_eq!(column.display_value, "NaN bar");
        assert_eq!(coerce_number("  "), 0.0);
    }

    #[test]
    fn inactive_label() {
        assert!(!Column::new(1, "n.a.", "V", "0", "1", "0").active);
        assert!(Column::new(1, "Analog 1", "V", "0", "1", "0").active);
        assert!(!Column::placeholder(99).active);
    }

    #[test]
    fn set_keeps_category_and_extensions() {
        let mut column = Column::new(16, "Pump", "--", "0", "1", "0");
        column.category = Some(Category::Relays);
        column.category_id = 1;
        column.extensions.insert("room".into(), serde_json::json!("cellar"));
        column.set(16, "Pump", "--", "0", "1", "3");
        assert_eq!(column.raw, 3.0);
        assert_eq!(column.category, Some(Category::Relays));
        assert_eq!(column.category_id, 1);
        assert_eq!(column.extensions["room"], "cellar");
    }
}
