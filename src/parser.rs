// Parsers for the vendor export files
//
// Reading exports are not tabular: context lines ("Kunde", "Zählernummer",
// "Datum") announce the customer, meter number and unit for the data lines
// that follow them. Each file is folded line by line into an ImportContext,
// which yields at most one Reading per step.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MeterError, Result};
use crate::model::{Customer, Gender, KindOfMeter, Reading};

// ============================================================================
// FILE VOCABULARY
// ============================================================================

pub const CUSTOMER_MARKER: &str = "Kunde";
pub const METER_NUMBER_MARKER: &str = "Zählernummer";
pub const DATE_HEADER_MARKER: &str = "Datum";

/// Comment prefix announcing a meter swap; the new number follows it.
pub const METER_REPLACEMENT_NOTICE: &str = "Zählertausch: neue Nummer";

pub const HEATING_UNIT_LABEL: &str = "Zählerstand in MWh";
pub const WATER_UNIT_LABEL: &str = "Zählerstand in m³";
pub const ELECTRICITY_UNIT_LABEL: &str = "Zählerstand in kWh";

/// day.month.year, used by both export formats
pub const EXPORT_DATE_FORMAT: &str = "%d.%m.%Y";

/// Map a unit label from a date-header line to a meter kind.
///
/// Unrecognized labels are never an error; they yield `KindOfMeter::Unknown`.
pub fn kind_from_unit_label(label: &str) -> KindOfMeter {
    match label {
        HEATING_UNIT_LABEL => KindOfMeter::Heating,
        WATER_UNIT_LABEL => KindOfMeter::Water,
        ELECTRICITY_UNIT_LABEL => KindOfMeter::Electricity,
        _ => KindOfMeter::Unknown,
    }
}

/// Map the customer export's salutation column to a gender
pub fn gender_from_salutation(salutation: &str) -> Gender {
    match salutation {
        "Herr" => Gender::Male,
        "Frau" => Gender::Female,
        _ => Gender::Unspecified,
    }
}

/// Extract the new meter number from a "Zählertausch: neue Nummer X" comment
pub fn meter_replacement(comment: &str) -> Option<&str> {
    let (_, rest) = comment.split_once(METER_REPLACEMENT_NOTICE)?;
    rest.split_whitespace().next()
}

// ============================================================================
// LINE CLASSIFIER
// ============================================================================

/// What a single line of a reading export means
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind<'a> {
    /// Empty first field; skipped
    Blank,
    /// Announces the owning customer (raw identity text)
    Customer(&'a str),
    /// Announces the active meter number
    MeterNumber(&'a str),
    /// Date/unit header; the unit label decides the meter kind
    UnitHeader(KindOfMeter),
    /// A concrete reading: date; measurement; comment
    Data {
        date: &'a str,
        value: &'a str,
        comment: &'a str,
    },
}

/// Classify one line, already split into (marker/date, value, comment).
///
/// Missing trailing fields are treated as empty. No line is rejected here;
/// malformed data lines fail later when their fields are parsed.
pub fn classify<'a>(fields: &[&'a str]) -> LineKind<'a> {
    let field = |i: usize| fields.get(i).copied().unwrap_or("");

    match field(0) {
        "" => LineKind::Blank,
        CUSTOMER_MARKER => LineKind::Customer(field(1)),
        METER_NUMBER_MARKER => LineKind::MeterNumber(field(1)),
        DATE_HEADER_MARKER => LineKind::UnitHeader(kind_from_unit_label(field(1))),
        date => LineKind::Data {
            date,
            value: field(1),
            comment: field(2),
        },
    }
}

/// Normalize a raw CSV record into at most three fields.
///
/// Quote characters are dropped, whitespace and a byte-order mark are
/// trimmed, and any delimiters beyond the second stay inside the comment.
fn normalize_fields(record: &StringRecord) -> Vec<String> {
    let mut fields: Vec<String> = record
        .iter()
        .map(|f| f.replace('"', "").trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    if fields.len() > 3 {
        let comment = fields[2..].join(";");
        fields.truncate(2);
        fields.push(comment);
    }
    fields
}

// ============================================================================
// IMPORT CONTEXT + RECORD BUILDER
// ============================================================================

/// Carry-over state for one reading export.
///
/// A fresh context starts every file; it never outlives the file it was
/// created for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportContext {
    pub customer: Option<Uuid>,
    pub meter_id: String,
    pub kind_of_meter: KindOfMeter,
}

impl ImportContext {
    /// Advance the state machine by one classified line.
    ///
    /// Context lines return the updated context and no reading; data lines
    /// return the (possibly meter-swapped) context and the built reading.
    pub fn step(mut self, line: usize, kind: LineKind<'_>) -> Result<(ImportContext, Option<Reading>)> {
        match kind {
            LineKind::Blank => Ok((self, None)),
            LineKind::Customer(raw) => {
                let id = Uuid::parse_str(raw).map_err(|_| MeterError::InvalidCustomerId {
                    line,
                    value: raw.to_string(),
                })?;
                debug!(line, customer = %id, "customer announced");
                self.customer = Some(id);
                Ok((self, None))
            }
            LineKind::MeterNumber(meter_id) => {
                debug!(line, meter_id, "meter number announced");
                self.meter_id = meter_id.to_string();
                Ok((self, None))
            }
            LineKind::UnitHeader(kind) => {
                if kind == KindOfMeter::Unknown {
                    warn!(line, "unrecognized unit label, meter kind set to UNKNOWN");
                }
                self.kind_of_meter = kind;
                Ok((self, None))
            }
            LineKind::Data { date, value, comment } => {
                if let Some(new_meter) = meter_replacement(comment) {
                    debug!(line, meter_id = new_meter, "meter replaced");
                    self.meter_id = new_meter.to_string();
                }
                let reading = self.build_reading(line, date, value, comment)?;
                Ok((self, Some(reading)))
            }
        }
    }

    /// Build a reading from a data line using the current context.
    ///
    /// Bulk-imported readings are never substitutes.
    pub fn build_reading(&self, line: usize, date: &str, value: &str, comment: &str) -> Result<Reading> {
        let customer_id = self.customer.ok_or(MeterError::MissingCustomer { line })?;

        let date_of_reading = NaiveDate::parse_from_str(date, EXPORT_DATE_FORMAT).map_err(|_| {
            MeterError::InvalidDate {
                line,
                value: date.to_string(),
            }
        })?;

        let meter_count = parse_decimal(value).ok_or_else(|| MeterError::InvalidMeterCount {
            line,
            value: value.to_string(),
        })?;

        Ok(Reading {
            id: Uuid::new_v4(),
            comment: comment.to_string(),
            customer_id,
            date_of_reading,
            kind_of_meter: self.kind_of_meter,
            meter_count,
            meter_id: self.meter_id.clone(),
            substitute: false,
        })
    }
}

/// Parse a measurement written with a decimal comma ("123,45").
///
/// Negative and non-finite values are rejected.
fn parse_decimal(value: &str) -> Option<f64> {
    let parsed: f64 = value.trim().replace(',', ".").parse().ok()?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

// ============================================================================
// READING EXPORT
// ============================================================================

/// Parse a reading export into readings, failing fast on the first bad line.
pub fn parse_readings<R: Read>(reader: R) -> Result<Vec<Reading>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let (_, readings) = rdr.records().try_fold(
        (ImportContext::default(), Vec::new()),
        |(context, mut readings), result| -> Result<_> {
            let record = result?;
            let line = record.position().map_or(0, |p| p.line() as usize);
            let fields = normalize_fields(&record);
            let borrowed: Vec<&str> = fields.iter().map(String::as_str).collect();

            let (context, reading) = context.step(line, classify(&borrowed))?;
            readings.extend(reading);
            Ok((context, readings))
        },
    )?;

    Ok(readings)
}

/// Parse a reading export from disk with its own fresh ImportContext
pub fn parse_reading_file(path: &Path) -> Result<Vec<Reading>> {
    let file = File::open(path)?;
    parse_readings(file)
}

// ============================================================================
// CUSTOMER EXPORT
// ============================================================================

/// Parse the comma-delimited customer export.
///
/// Columns: UUID, salutation, first name, last name, optional birth date.
/// The header row is skipped.
pub fn parse_customers<R: Read>(reader: R) -> Result<Vec<Customer>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b',')
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut customers = Vec::new();

    for result in rdr.records() {
        let record = result?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        let field = |i: usize| record.get(i).unwrap_or("");

        let raw_id = field(0);
        let id = Uuid::parse_str(raw_id).map_err(|_| MeterError::InvalidCustomerId {
            line,
            value: raw_id.to_string(),
        })?;

        let birth_date = match field(4) {
            "" => None,
            raw => Some(
                NaiveDate::parse_from_str(raw, EXPORT_DATE_FORMAT).map_err(|_| {
                    MeterError::InvalidDate {
                        line,
                        value: raw.to_string(),
                    }
                })?,
            ),
        };

        customers.push(Customer {
            id,
            first_name: field(2).to_string(),
            last_name: field(3).to_string(),
            gender: gender_from_salutation(field(1)),
            birth_date,
        });
    }

    Ok(customers)
}

pub fn parse_customer_file(path: &Path) -> Result<Vec<Customer>> {
    let file = File::open(path)?;
    parse_customers(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const C1: &str = "5f0c6f43-0a54-4e1a-9d5f-3b1f0c2b9a11";
    const C2: &str = "a1b2c3d4-0000-4000-8000-000000000002";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_classify_context_markers() {
        assert_eq!(classify(&["Kunde", C1, ""]), LineKind::Customer(C1));
        assert_eq!(classify(&["Zählernummer", "M-42", ""]), LineKind::MeterNumber("M-42"));
        assert_eq!(
            classify(&["Datum", "Zählerstand in m³", "Kommentar"]),
            LineKind::UnitHeader(KindOfMeter::Water)
        );
        assert_eq!(classify(&["", "", ""]), LineKind::Blank);
        assert_eq!(classify(&[]), LineKind::Blank);
    }

    #[test]
    fn test_classify_data_line() {
        assert_eq!(
            classify(&["01.01.2024", "123,45", "ok"]),
            LineKind::Data {
                date: "01.01.2024",
                value: "123,45",
                comment: "ok"
            }
        );

        // Short lines are padded, not rejected
        assert_eq!(
            classify(&["garbage"]),
            LineKind::Data {
                date: "garbage",
                value: "",
                comment: ""
            }
        );
    }

    #[test]
    fn test_unit_labels() {
        assert_eq!(kind_from_unit_label("Zählerstand in MWh"), KindOfMeter::Heating);
        assert_eq!(kind_from_unit_label("Zählerstand in m³"), KindOfMeter::Water);
        assert_eq!(kind_from_unit_label("Zählerstand in kWh"), KindOfMeter::Electricity);
        assert_eq!(kind_from_unit_label("Zählerstand in Litern"), KindOfMeter::Unknown);
        assert_eq!(kind_from_unit_label(""), KindOfMeter::Unknown);
    }

    #[test]
    fn test_meter_replacement_notice() {
        assert_eq!(meter_replacement("Zählertausch: neue Nummer X-99"), Some("X-99"));
        assert_eq!(
            meter_replacement("Zählertausch: neue Nummer 7781 am Vormittag"),
            Some("7781")
        );
        assert_eq!(meter_replacement("nothing to see"), None);
        assert_eq!(meter_replacement("Zählertausch: neue Nummer "), None);
    }

    #[test]
    fn test_concrete_scenario() {
        let input = format!(
            "Kunde;{};\nZählernummer;M-42;\nDatum;Zählerstand in kWh;\n01.01.2024;123,45;comment\n",
            C1
        );

        let readings = parse_readings(input.as_bytes()).unwrap();

        assert_eq!(readings.len(), 1);
        let r = &readings[0];
        assert_eq!(r.customer_id, Uuid::parse_str(C1).unwrap());
        assert_eq!(r.meter_id, "M-42");
        assert_eq!(r.kind_of_meter, KindOfMeter::Electricity);
        assert!((r.meter_count - 123.45).abs() < 1e-9);
        assert_eq!(r.date_of_reading, date(2024, 1, 1));
        assert_eq!(r.comment, "comment");
        assert!(!r.substitute);
    }

    #[test]
    fn test_one_reading_per_data_line() {
        let input = format!(
            "\"Kunde\";\"{}\";\n\
             \"Zählernummer\";\"H-1\";\n\
             \n\
             \"Datum\";\"Zählerstand in MWh\";\"Kommentar\"\n\
             01.01.2023;10,5;\n\
             01.02.2023;11,0;\n\
             ;;\n\
             01.03.2023;12;\n",
            C1
        );

        let readings = parse_readings(input.as_bytes()).unwrap();

        assert_eq!(readings.len(), 3);
        assert!(readings.iter().all(|r| r.kind_of_meter == KindOfMeter::Heating));
        assert!(readings.iter().all(|r| r.meter_id == "H-1"));

        // Identities are freshly generated per record
        assert_ne!(readings[0].id, readings[1].id);
    }

    #[test]
    fn test_context_carries_until_overridden() {
        let input = format!(
            "Kunde;{c1};\n\
             Zählernummer;A;\n\
             Datum;Zählerstand in m³;\n\
             01.01.2024;1;\n\
             02.01.2024;2;\n\
             03.01.2024;3;Zählertausch: neue Nummer B\n\
             04.01.2024;4;\n\
             Zählernummer;C;\n\
             05.01.2024;5;\n\
             Kunde;{c2};\n\
             Datum;Zählerstand in Litern;\n\
             06.01.2024;6;\n",
            c1 = C1,
            c2 = C2
        );

        let readings = parse_readings(input.as_bytes()).unwrap();
        let meters: Vec<&str> = readings.iter().map(|r| r.meter_id.as_str()).collect();

        assert_eq!(meters, vec!["A", "A", "B", "B", "C", "C"]);
        assert_eq!(readings[4].customer_id, Uuid::parse_str(C1).unwrap());
        assert_eq!(readings[5].customer_id, Uuid::parse_str(C2).unwrap());
        assert_eq!(readings[4].kind_of_meter, KindOfMeter::Water);
        assert_eq!(readings[5].kind_of_meter, KindOfMeter::Unknown);
    }

    #[test]
    fn test_context_step_is_pure() {
        let start = ImportContext::default();
        let (after, reading) = start.clone().step(1, LineKind::MeterNumber("Z-1")).unwrap();

        assert!(reading.is_none());
        assert_eq!(start.meter_id, "");
        assert_eq!(after.meter_id, "Z-1");
        assert_eq!(after.kind_of_meter, KindOfMeter::Unknown);
    }

    #[test]
    fn test_leading_bom_does_not_hide_customer_marker() {
        // Spreadsheet exports often start with a UTF-8 byte order mark
        let input = format!(
            "\u{feff}Kunde;{};\nZählernummer;M-7;\nDatum;Zählerstand in m³;\n02.03.2024;10,5;\n",
            C1
        );

        let readings = parse_readings(input.as_bytes()).unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].customer_id, Uuid::parse_str(C1).unwrap());
        assert_eq!(readings[0].meter_id, "M-7");
        assert_eq!(readings[0].kind_of_meter, KindOfMeter::Water);
        assert_eq!(readings[0].date_of_reading, date(2024, 3, 2));
    }

    #[test]
    fn test_extra_delimiters_stay_in_comment() {
        let input = format!("Kunde;{};\n01.01.2024;1,0;a;b;c\n", C1);
        let readings = parse_readings(input.as_bytes()).unwrap();

        assert_eq!(readings[0].comment, "a;b;c");
    }

    #[test]
    fn test_malformed_date_fails_file() {
        let input = format!("Kunde;{};\n2024-01-01;1,0;\n01.02.2024;2,0;\n", C1);
        let err = parse_readings(input.as_bytes()).unwrap_err();

        match err {
            MeterError::InvalidDate { line, value } => {
                assert_eq!(line, 2);
                assert_eq!(value, "2024-01-01");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_count_fails_file() {
        let input = format!("Kunde;{};\n01.01.2024;12a;\n", C1);
        let err = parse_readings(input.as_bytes()).unwrap_err();
        assert!(matches!(err, MeterError::InvalidMeterCount { .. }));

        let negative = format!("Kunde;{};\n01.01.2024;-3,5;\n", C1);
        let err = parse_readings(negative.as_bytes()).unwrap_err();
        assert!(matches!(err, MeterError::InvalidMeterCount { .. }));
    }

    #[test]
    fn test_data_before_customer_fails() {
        let err = parse_readings("01.01.2024;1,0;\n".as_bytes()).unwrap_err();
        assert!(matches!(err, MeterError::MissingCustomer { line: 1 }));
    }

    #[test]
    fn test_bad_customer_reference_fails() {
        let err = parse_readings("Kunde;not-a-uuid;\n".as_bytes()).unwrap_err();
        assert!(matches!(err, MeterError::InvalidCustomerId { .. }));
    }

    #[test]
    fn test_parse_customers() {
        let input = format!(
            "UUID,Anrede,Vorname,Nachname,Geburtsdatum\n\
             {c1},Herr,Hans,Schmidt\n\
             {c2},Frau,Erika,Mustermann,24.12.1980\n\
             b7e3a1f0-1111-4222-8333-444455556666,k.A.,Alex,Meyer,\n",
            c1 = C1,
            c2 = C2
        );

        let customers = parse_customers(input.as_bytes()).unwrap();

        assert_eq!(customers.len(), 3);

        assert_eq!(customers[0].id, Uuid::parse_str(C1).unwrap());
        assert_eq!(customers[0].first_name, "Hans");
        assert_eq!(customers[0].last_name, "Schmidt");
        assert_eq!(customers[0].gender, Gender::Male);
        assert_eq!(customers[0].birth_date, None);

        assert_eq!(customers[1].gender, Gender::Female);
        assert_eq!(customers[1].birth_date, Some(date(1980, 12, 24)));

        assert_eq!(customers[2].gender, Gender::Unspecified);
        assert_eq!(customers[2].birth_date, None);
    }

    #[test]
    fn test_parse_customers_bad_birth_date() {
        let input = format!("UUID,Anrede,Vorname,Nachname,Geburtsdatum\n{},Herr,A,B,1980-12-24\n", C1);
        let err = parse_customers(input.as_bytes()).unwrap_err();
        assert!(matches!(err, MeterError::InvalidDate { .. }));
    }
}
