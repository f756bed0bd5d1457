use crate::category::{Category, CategoryIndex};
use crate::column::Column;
use crate::sys_info::SysInfo;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Rows of the CSV body: sysinfo, then names, units, offsets, gains and raw measurements.
const REQUIRED_ROWS: usize = 6;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("state CSV has {0} non-blank rows, expected at least 6")]
    MissingRows(usize),
}

/// Which dosage a relay or canister is responsible for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum DosageTarget {
    Chlorine = 0,
    PhMinus = 1,
    PhPlus = 2,
}

/// One parsed snapshot of the controller's `/GetState.csv` dump.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub raw: String,
    pub parsed: Vec<Vec<String>>,
    pub sys_info: SysInfo,
    /// Ordered by column id.
    pub objects: Vec<Column>,
    /// Ids of columns not labelled `n.a.`, in column order.
    pub active: Vec<usize>,
    /// Caller-defined values. Never touched by the parser.
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn split_rows(csv: &str) -> Vec<Vec<String>> {
    csv.split(['\r', '\n'])
        .map(|row| row.split(',').map(str::to_string).collect::<Vec<_>>())
        .filter(|row| row.len() > 1 || row.first().is_some_and(|c| c.trim().chars().count() > 1))
        .collect()
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

impl Frame {
    pub fn from_csv(csv: &str) -> Result<Frame, Error> {
        let mut frame = Frame::default();
        frame.parse_csv(csv)?;
        Ok(frame)
    }

    /// Replace the frame's contents with the given CSV.
    ///
    /// Columns already known by id are updated in place rather than recreated.
    pub fn parse_csv(&mut self, csv: &str) -> Result<(), Error> {
        let parsed = split_rows(csv);
        if parsed.len() < REQUIRED_ROWS {
            return Err(Error::MissingRows(parsed.len()));
        }
        self.raw = csv.to_string();
        self.sys_info = SysInfo::from_row(&parsed[0]);
        self.parsed = parsed;
        self.resolve_objects();
        self.categorize();
        Ok(())
    }

    fn resolve_objects(&mut self) {
        self.active.clear();
        let [_, names, units, offsets, gains, measures, ..] = &self.parsed[..] else {
            return;
        };
        for (index, name) in names.iter().enumerate() {
            let (unit, offset) = (cell(units, index), cell(offsets, index));
            let (gain, measure) = (cell(gains, index), cell(measures, index));
            match self.objects.get_mut(index) {
                Some(column) => column.set(index, name, unit, offset, gain, measure),
                None => self.objects.push(Column::new(index, name, unit, offset, gain, measure)),
            }
            if self.objects[index].active {
                self.active.push(index);
            }
        }
    }

    fn categorize(&mut self) {
        for (category, ids) in CategoryIndex::get().iter() {
            let mut category_id = 1;
            for &id in ids {
                let Some(column) = self.objects.get_mut(id) else { continue };
                column.category = Some(category);
                column.category_id = category_id;
                category_id += 1;
            }
        }
    }

    pub fn category_of(&self, id: usize) -> Option<Category> {
        CategoryIndex::get().category_of(id)
    }

    /// The column with the given id, or an inactive placeholder if there is none.
    pub fn object(&self, id: usize) -> Cow<'_, Column> {
        match self.objects.get(id) {
            Some(column) => Cow::Borrowed(column),
            None => Cow::Owned(Column::placeholder(id)),
        }
    }

    pub fn objects(&self, ids: &[usize], active_only: bool) -> Vec<&Column> {
        self.objects
            .iter()
            .filter(|c| ids.contains(&c.id))
            .filter(|c| !active_only || self.active.contains(&c.id))
            .collect()
    }

    pub fn objects_by_category(&self, category: Category, active_only: bool) -> Vec<&Column> {
        self.objects(CategoryIndex::get().columns(category), active_only)
    }

    /// Column id of the relay performing the given dosage.
    pub fn dosage_control_id(&self, target: DosageTarget) -> usize {
        let relay = match target {
            DosageTarget::Chlorine => self.sys_info.chlorine_relay,
            DosageTarget::PhMinus => self.sys_info.ph_minus_relay,
            DosageTarget::PhPlus => self.sys_info.ph_plus_relay,
        };
        CategoryIndex::get().first_column(Category::Relays) + relay as usize
    }

    pub fn dosage_control(&self, target: DosageTarget) -> Cow<'_, Column> {
        self.object(self.dosage_control_id(target))
    }

    pub fn chlorine_dosage_control(&self) -> Cow<'_, Column> {
        self.dosage_control(DosageTarget::Chlorine)
    }

    pub fn ph_minus_dosage_control(&self) -> Cow<'_, Column> {
        self.dosage_control(DosageTarget::PhMinus)
    }

    pub fn ph_plus_dosage_control(&self) -> Cow<'_, Column> {
        self.dosage_control(DosageTarget::PhPlus)
    }

    /// Whether the given column id is one of the three dosage control relays.
    pub fn is_dosage_control(&self, id: usize) -> bool {
        [DosageTarget::Chlorine, DosageTarget::PhMinus, DosageTarget::PhPlus]
            .into_iter()
            .any(|target| self.dosage_control_id(target) == id)
    }

    /// Find a column by its label, ignoring ASCII case.
    pub fn object_by_label(&self, label: &str) -> Option<&Column> {
        self.objects.iter().find(|c| c.label.eq_ignore_ascii_case(label))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a CSV body with 42 columns. `relays` and `external` hold raw relay values.
    pub(crate) fn sample_csv(config_other: u32, relays: [u8; 8], external: [u8; 8]) -> String {
        let mut names = Vec::new();
        let mut units = Vec::new();
        let mut offsets = Vec::new();
        let mut gains = Vec::new();
        let mut raws = Vec::new();
        for id in 0..42 {
            let (name, unit, gain, raw) = match id {
                0 => ("Time".to_string(), "h", "1", "267".to_string()),
                1..=5 => (format!("Analog {id}"), "bar", "0.01", "120".to_string()),
                6 => ("Redox".to_string(), "mV", "1", "718".to_string()),
                7 => ("pH".to_string(), "pH", "0.01", "712".to_string()),
                8 => ("Pool".to_string(), "C", "0.1", "235".to_string()),
                9..=15 => ("n.a.".to_string(), "C", "0.1", "0".to_string()),
                16..=23 => (format!("Relay {}", id - 15), "--", "1", relays[id - 16].to_string()),
                24..=27 => (format!("Input {}", id - 23), "--", "1", "0".to_string()),
                28..=35 => (format!("Ext {}", id - 27), "--", "1", external[id - 28].to_string()),
                _ => (format!("Canister {id}"), "%", "1", "50".to_string()),
            };
            names.push(name);
            units.push(unit.to_string());
            offsets.push("0".to_string());
            gains.push(gain.to_string());
            raws.push(raw);
        }
        format!(
            "SYSINFO,1.7.6,291017,8,65536,{config_other},4353,5,6,4\r\n\r\n{}\r\n{}\r\n{}\r\n{}\r\n{}\r\n",
            names.join(","),
            units.join(","),
            offsets.join(","),
            gains.join(","),
            raws.join(","),
        )
    }

    #[test]
    fn parses_rows_and_columns() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        assert_eq!(frame.parsed.len(), 6);
        assert_eq!(frame.objects.len(), 42);
        assert_eq!(frame.sys_info.version, "1.7.6");
        let pool = frame.object(8);
        assert_eq!(pool.label, "Pool");
        assert_eq!(pool.display_value, "23.50 °C");
        assert_eq!(pool.category, Some(Category::Temperatures));
        assert_eq!(pool.category_id, 1);
        assert_eq!(frame.object(0).display_value, "01:11");
    }

    #[test]
    fn parsing_is_idempotent() {
        let csv = sample_csv(16, [0, 1, 2, 3, 0, 1, 2, 3], [3; 8]);
        let once = Frame::from_csv(&csv).unwrap();
        let mut twice = once.clone();
        twice.parse_csv(&csv).unwrap();
        for (a, b) in once.objects.iter().zip(&twice.objects) {
            assert_eq!(a.display_value, b.display_value);
            assert_eq!(a.category, b.category);
            assert_eq!(a.category_id, b.category_id);
            assert!(a.value == b.value || (a.value.is_nan() && b.value.is_nan()));
        }
        assert_eq!(once.active, twice.active);
    }

    #[test]
    fn reparse_updates_columns_in_place() {
        let mut frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        frame.objects[16].extensions.insert("alias".into(), serde_json::json!("pump"));
        frame.parse_csv(&sample_csv(0, [3, 0, 0, 0, 0, 0, 0, 0], [0; 8])).unwrap();
        assert_eq!(frame.objects[16].raw, 3.0);
        assert_eq!(frame.objects[16].extensions["alias"], "pump");
    }

    #[test]
    fn relay_category_ids_increase_with_column() {
        let frame = Frame::from_csv(&sample_csv(16, [0; 8], [0; 8])).unwrap();
        for category in [Category::Relays, Category::ExternalRelays] {
            let ids: Vec<_> = frame.objects_by_category(category, false).iter().map(|c| c.category_id).collect();
            assert_eq!(ids, (1..=8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn inactive_columns_are_excluded() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        for id in 9..=15 {
            assert!(!frame.active.contains(&id));
        }
        assert_eq!(frame.active.len(), 42 - 7);
        let temperatures = frame.objects_by_category(Category::Temperatures, true);
        assert_eq!(temperatures.len(), 1);
        assert_eq!(temperatures[0].id, 8);
        assert_eq!(frame.objects_by_category(Category::Temperatures, false).len(), 8);
    }

    #[test]
    fn missing_ids_yield_placeholders() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        let missing = frame.object(500);
        assert_eq!(missing.id, 500);
        assert!(!missing.active);
        assert!(matches!(missing, Cow::Owned(_)));
        assert!(!Frame::default().object(0).active);
    }

    #[test]
    fn dosage_controls() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        assert_eq!(frame.dosage_control_id(DosageTarget::Chlorine), 20);
        assert_eq!(frame.dosage_control_id(DosageTarget::PhMinus), 22);
        assert_eq!(frame.dosage_control_id(DosageTarget::PhPlus), 21);
        assert_eq!(frame.chlorine_dosage_control().label, "Relay 5");
        assert_eq!(frame.ph_minus_dosage_control().label, "Relay 7");
        assert_eq!(frame.ph_plus_dosage_control().label, "Relay 6");
        assert!(frame.is_dosage_control(21));
        assert!(!frame.is_dosage_control(16));
    }

    #[test]
    fn too_few_rows() {
        let err = Frame::from_csv("SYSINFO,1\n\nTime\n").unwrap_err();
        assert!(matches!(err, Error::MissingRows(2)));
    }

    #[test]
    fn blank_row_filtering() {
        let rows = split_rows("a,b\r\n\r\n \n,\nx\nxy\n");
        assert_eq!(rows, vec![vec!["a", "b"], vec!["", ""], vec!["xy"]]);
    }

    #[test]
    fn label_lookup() {
        let frame = Frame::from_csv(&sample_csv(0, [0; 8], [0; 8])).unwrap();
        assert_eq!(frame.object_by_label("relay 3").map(|c| c.id), Some(18));
        assert!(frame.object_by_label("nothing").is_none());
    }
}
