use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

use crate::column::Column;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode field {0:?} as CSV")]
    EncodeCsv(String),
}

/// Something that can be printed as a row of a table or CSV, or as a JSON line.
pub trait Record: serde::Serialize {
    fn headers() -> &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

impl Record for Column {
    fn headers() -> &'static [&'static str] {
        &["Id", "Category", "#", "Label", "Raw", "Value", "Display", "Unit", "Active"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.category.map(|c| c.to_string()).unwrap_or_default(),
            self.category_id.to_string(),
            self.label.clone(),
            self.raw.to_string(),
            self.value.to_string(),
            self.display_value.clone(),
            self.unit.clone(),
            self.active.to_string(),
        ]
    }
}

#[derive(serde::Serialize, Debug, PartialEq, Eq)]
pub struct KeyValue<'a> {
    pub key: &'a str,
    pub value: String,
}

impl<'a> KeyValue<'a> {
    pub fn new(key: &'a str, value: impl ToString) -> Self {
        Self { key, value: value.to_string() }
    }
}

impl Record for KeyValue<'_> {
    fn headers() -> &'static [&'static str] {
        &["Key", "Value"]
    }

    fn cells(&self) -> Vec<String> {
        vec![self.key.to_string(), self.value.clone()]
    }
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self, io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    /// Headers go out once, before the first record.
    Csv { written_headers: bool },
    /// Rows are buffered until [`Output::flush`].
    Table { comfy: Option<comfy_table::Table> },
    Jsonl,
}

impl Output {
    fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match args.format {
            Format::Table => Formatter::Table { comfy: None },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_headers: false },
        };
        Output { args, io, formatter }
    }

    pub fn record<R: Record>(&mut self, record: &R) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_headers } => {
                if !*written_headers {
                    *written_headers = true;
                    self.write_csv_row(R::headers())?;
                }
                self.write_csv_row(&record.cells())?;
            }
            Formatter::Table { comfy } => {
                comfy
                    .get_or_insert_with(|| {
                        let mut table = comfy_table::Table::new();
                        table
                            .set_header(R::headers().to_vec())
                            .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                        table
                    })
                    .add_row(record.cells());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, record).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    pub fn records<'r, R: Record + 'r>(&mut self, records: impl IntoIterator<Item = &'r R>) -> Result<(), Error> {
        records.into_iter().try_for_each(|r| self.record(r))
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut buffer = vec![0; max_len];
        let mut line = Vec::new();
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            let value = value.as_ref();
            if index != 0 {
                let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                    return Err(Error::EncodeCsv(value.to_string()));
                };
                line.extend_from_slice(&buffer[..written]);
            }
            let (WriteResult::InputEmpty, read, written) = writer.field(value.as_bytes(), &mut buffer) else {
                return Err(Error::EncodeCsv(value.to_string()));
            };
            if read != value.len() {
                return Err(Error::EncodeCsv(value.to_string()));
            }
            line.extend_from_slice(&buffer[..written]);
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
            return Err(Error::EncodeCsv(String::new()));
        };
        line.extend_from_slice(&buffer[..written]);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    /// Write out everything buffered so far.
    ///
    /// Tables are printed as a whole here. Records after a flush start a new table.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &mut self.formatter {
            if let Some(table) = comfy.take() {
                writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
