//! Filtered read path over readings joined to their owning customers.
//!
//! Predicates are collected into an ordered list (customer, start, end,
//! kind) and rendered with numbered placeholders, so each filter always
//! binds at a deterministic position whatever else is present.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;
use uuid::Uuid;

use crate::db::uuid_at;
use crate::error::{MeterError, Result};
use crate::model::{Customer, KindOfMeter, Reading, ReadingDetail};
use crate::parser::EXPORT_DATE_FORMAT;

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

/// Joined projection; column positions are fixed for the hydrator
const SELECT_READING_DETAIL: &str = "SELECT Reading.id, Reading.comment, Reading.customer,
        Reading.dateOfReading, Reading.kindOfMeter, Reading.meterCount,
        Reading.meterId, Reading.substitute,
        Customer.id, Customer.firstName, Customer.lastName, Customer.birthDate, Customer.gender
    FROM Reading
    JOIN Customer ON Reading.customer = Customer.id";

const ORDER_BY: &str = "ORDER BY Reading.dateOfReading, Reading.id";

// ============================================================================
// FILTER QUERY BUILDER
// ============================================================================

/// Optional, independently combinable reading filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub customer: Option<Uuid>,
    /// Inclusive lower bound on the date of reading
    pub start: Option<NaiveDate>,
    /// Inclusive upper bound on the date of reading
    pub end: Option<NaiveDate>,
    pub kind_of_meter: Option<KindOfMeter>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    Customer(Uuid),
    Start(NaiveDate),
    End(NaiveDate),
    Kind(KindOfMeter),
}

impl Predicate {
    /// SQL condition with a `?{n}` slot for the bound value
    fn condition(&self, n: usize) -> String {
        match self {
            Predicate::Customer(_) => format!("Reading.customer = ?{n}"),
            Predicate::Start(_) => format!("Reading.dateOfReading >= ?{n}"),
            Predicate::End(_) => format!("Reading.dateOfReading <= ?{n}"),
            Predicate::Kind(_) => format!("Reading.kindOfMeter = ?{n}"),
        }
    }

    fn value(&self) -> Value {
        match self {
            Predicate::Customer(id) => Value::Text(id.to_string()),
            Predicate::Start(date) | Predicate::End(date) => {
                Value::Text(date.format(ISO_DATE_FORMAT).to_string())
            }
            Predicate::Kind(kind) => Value::Text(kind.as_str().to_string()),
        }
    }
}

impl ReadingFilter {
    pub fn is_empty(&self) -> bool {
        self.predicates().is_empty()
    }

    /// Present filters, always in the order customer, start, end, kind
    pub fn predicates(&self) -> Vec<Predicate> {
        [
            self.customer.map(Predicate::Customer),
            self.start.map(Predicate::Start),
            self.end.map(Predicate::End),
            self.kind_of_meter.map(Predicate::Kind),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// A composed statement and the values to bind, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

pub fn build_query(filter: &ReadingFilter) -> ReadingQuery {
    let predicates = filter.predicates();

    let conditions: Vec<String> = predicates
        .iter()
        .enumerate()
        .map(|(i, p)| p.condition(i + 1))
        .collect();

    let sql = if conditions.is_empty() {
        format!("{SELECT_READING_DETAIL} {ORDER_BY}")
    } else {
        format!(
            "{SELECT_READING_DETAIL} WHERE {} {ORDER_BY}",
            conditions.join(" AND ")
        )
    };

    ReadingQuery {
        sql,
        params: predicates.iter().map(Predicate::value).collect(),
    }
}

// ============================================================================
// RESULT HYDRATOR
// ============================================================================

/// Map one joined row to one aggregate.
///
/// Unknown enum text fails the row instead of defaulting.
pub fn hydrate(row: &Row<'_>) -> rusqlite::Result<ReadingDetail> {
    let reading = Reading {
        id: uuid_at(row, 0)?,
        comment: row.get(1)?,
        customer_id: uuid_at(row, 2)?,
        date_of_reading: row.get(3)?,
        kind_of_meter: row.get(4)?,
        meter_count: row.get(5)?,
        meter_id: row.get(6)?,
        substitute: row.get(7)?,
    };

    let customer = Customer {
        id: uuid_at(row, 8)?,
        first_name: row.get(9)?,
        last_name: row.get(10)?,
        birth_date: row.get(11)?,
        gender: row.get(12)?,
    };

    Ok(ReadingDetail { reading, customer })
}

// ============================================================================
// READ OPERATIONS
// ============================================================================

/// Run the filtered query; zero filters return every reading
pub fn find_readings(conn: &Connection, filter: &ReadingFilter) -> Result<Vec<ReadingDetail>> {
    let query = build_query(filter);
    debug!(sql = %query.sql, params = query.params.len(), "finding readings");

    let mut stmt = conn.prepare(&query.sql)?;
    let readings = stmt
        .query_map(params_from_iter(query.params.iter()), hydrate)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(readings)
}

pub fn read_reading(conn: &Connection, id: Uuid) -> Result<Option<ReadingDetail>> {
    let sql = format!("{SELECT_READING_DETAIL} WHERE Reading.id = ?1");
    let mut stmt = conn.prepare(&sql)?;

    let mut rows = stmt.query_map([id.to_string()], hydrate)?;
    Ok(rows.next().transpose()?)
}

/// Parse a request date in `dd.MM.yyyy` or ISO `yyyy-MM-dd` form
pub fn parse_date_param(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, EXPORT_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(raw, ISO_DATE_FORMAT))
        .map_err(|_| MeterError::InvalidDateParameter(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_customer, insert_customers, insert_readings, setup_database, update_reading};
    use crate::model::Gender;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn reading(customer: &Customer, day: NaiveDate, kind: KindOfMeter, count: f64) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            comment: format!("{kind} on {day}"),
            customer_id: customer.id,
            date_of_reading: day,
            kind_of_meter: kind,
            meter_count: count,
            meter_id: "M-1".to_string(),
            substitute: false,
        }
    }

    /// Two customers, readings spread over Dec 2023 - Feb 2024
    fn seeded() -> (Connection, Customer, Customer) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let hans = Customer::new("Hans", "Schmidt", Gender::Male, None);
        let erika = Customer::new("Erika", "Mustermann", Gender::Female, Some(date(1980, 12, 24)));
        insert_customers(&conn, &[hans.clone(), erika.clone()]).unwrap();

        insert_readings(
            &conn,
            &[
                reading(&hans, date(2023, 12, 31), KindOfMeter::Electricity, 1.0),
                reading(&hans, date(2024, 1, 1), KindOfMeter::Electricity, 2.0),
                reading(&hans, date(2024, 1, 15), KindOfMeter::Water, 3.0),
                reading(&erika, date(2024, 1, 31), KindOfMeter::Heating, 4.0),
                reading(&erika, date(2024, 2, 1), KindOfMeter::Water, 5.0),
            ],
        )
        .unwrap();

        (conn, hans, erika)
    }

    #[test]
    fn test_every_filter_combination() {
        let customer = Uuid::new_v4();
        let start = date(2024, 1, 1);
        let end = date(2024, 1, 31);

        for mask in 0u8..16 {
            let filter = ReadingFilter {
                customer: (mask & 1 != 0).then_some(customer),
                start: (mask & 2 != 0).then_some(start),
                end: (mask & 4 != 0).then_some(end),
                kind_of_meter: (mask & 8 != 0).then_some(KindOfMeter::Water),
            };

            let query = build_query(&filter);

            let expected: Vec<&str> = [
                (mask & 1 != 0, "Reading.customer = ?"),
                (mask & 2 != 0, "Reading.dateOfReading >= ?"),
                (mask & 4 != 0, "Reading.dateOfReading <= ?"),
                (mask & 8 != 0, "Reading.kindOfMeter = ?"),
            ]
            .into_iter()
            .filter_map(|(present, clause)| present.then_some(clause))
            .collect();

            assert_eq!(query.params.len(), expected.len(), "mask {mask:04b}");
            assert_eq!(query.sql.contains(" WHERE "), !expected.is_empty(), "mask {mask:04b}");

            // Each clause appears with its positional placeholder, in order
            let mut cursor = 0;
            for (i, clause) in expected.iter().enumerate() {
                let needle = format!("{clause}{}", i + 1);
                let found = query.sql[cursor..]
                    .find(&needle)
                    .unwrap_or_else(|| panic!("mask {mask:04b}: missing {needle} in {}", query.sql));
                cursor += found + needle.len();
            }

            assert_eq!(query.sql.matches(" AND ").count(), expected.len().saturating_sub(1));
        }
    }

    #[test]
    fn test_parameter_values_follow_predicate_order() {
        let customer = Uuid::new_v4();
        let filter = ReadingFilter {
            customer: Some(customer),
            start: Some(date(2024, 1, 1)),
            end: Some(date(2024, 1, 31)),
            kind_of_meter: Some(KindOfMeter::Heating),
        };

        let query = build_query(&filter);

        assert_eq!(
            query.params,
            vec![
                Value::Text(customer.to_string()),
                Value::Text("2024-01-01".to_string()),
                Value::Text("2024-01-31".to_string()),
                Value::Text("HEATING".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_filters_returns_everything() {
        let (conn, _, _) = seeded();
        let filter = ReadingFilter::default();

        assert!(filter.is_empty());
        let all = find_readings(&conn, &filter).unwrap();
        assert_eq!(all.len(), 5);

        // Ordered by date
        let dates: Vec<NaiveDate> = all.iter().map(|r| r.reading.date_of_reading).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
    }

    #[test]
    fn test_inclusive_date_range() {
        let (conn, _, _) = seeded();
        let filter = ReadingFilter {
            start: Some(date(2024, 1, 1)),
            end: Some(date(2024, 1, 31)),
            ..Default::default()
        };

        let found = find_readings(&conn, &filter).unwrap();
        let counts: Vec<f64> = found.iter().map(|r| r.reading.meter_count).collect();

        assert_eq!(counts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_customer_and_kind_filters() {
        let (conn, hans, erika) = seeded();

        let hans_only = find_readings(
            &conn,
            &ReadingFilter {
                customer: Some(hans.id),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(hans_only.len(), 3);
        assert!(hans_only.iter().all(|r| r.customer == hans));

        let water = find_readings(
            &conn,
            &ReadingFilter {
                kind_of_meter: Some(KindOfMeter::Water),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(water.len(), 2);

        let all_four = find_readings(
            &conn,
            &ReadingFilter {
                customer: Some(erika.id),
                start: Some(date(2024, 1, 1)),
                end: Some(date(2024, 12, 31)),
                kind_of_meter: Some(KindOfMeter::Water),
            },
        )
        .unwrap();
        assert_eq!(all_four.len(), 1);
        assert_eq!(all_four[0].reading.meter_count, 5.0);
        assert_eq!(all_four[0].customer, erika);
    }

    #[test]
    fn test_hydrated_customer_is_complete() {
        let (conn, _, erika) = seeded();
        let found = find_readings(
            &conn,
            &ReadingFilter {
                customer: Some(erika.id),
                ..Default::default()
            },
        )
        .unwrap();

        for detail in &found {
            assert_eq!(detail.reading.customer_id, erika.id);
            assert_eq!(detail.customer.birth_date, Some(date(1980, 12, 24)));
            assert_eq!(detail.customer.gender, Gender::Female);
        }
    }

    #[test]
    fn test_read_reading_round_trip() {
        let (conn, hans, _) = seeded();
        let mut stored = reading(&hans, date(2024, 3, 1), KindOfMeter::Heating, 9.5);
        stored.substitute = true;
        insert_readings(&conn, &[stored.clone()]).unwrap();

        let first = read_reading(&conn, stored.id).unwrap().unwrap();
        let second = read_reading(&conn, stored.id).unwrap().unwrap();

        assert_eq!(first.reading, stored);
        assert_eq!(first.customer, hans);
        assert_eq!(first, second);

        stored.meter_count = 10.0;
        update_reading(&conn, &stored).unwrap();
        assert_eq!(read_reading(&conn, stored.id).unwrap().unwrap().reading.meter_count, 10.0);

        assert_eq!(read_reading(&conn, Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_unknown_stored_enum_is_hydration_error() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let hans = Customer::new("Hans", "Schmidt", Gender::Male, None);
        create_customer(&conn, &hans).unwrap();

        conn.execute(
            "INSERT INTO Reading (id, comment, customer, dateOfReading, kindOfMeter, meterCount, meterId, substitute)
             VALUES (?1, '', ?2, '2024-01-01', 'GAS', 1.0, 'G-1', 0)",
            [Uuid::new_v4().to_string(), hans.id.to_string()],
        )
        .unwrap();

        let err = find_readings(&conn, &ReadingFilter::default()).unwrap_err();
        assert!(matches!(err, MeterError::Hydration { column: 4, .. }));
    }

    #[test]
    fn test_parse_date_param() {
        assert_eq!(parse_date_param("31.01.2024").unwrap(), date(2024, 1, 31));
        assert_eq!(parse_date_param("2024-01-31").unwrap(), date(2024, 1, 31));
        assert!(matches!(
            parse_date_param("01/31/2024"),
            Err(MeterError::InvalidDateParameter(_))
        ));
    }
}
