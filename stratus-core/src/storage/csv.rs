//! CSV encoding of processed artifacts.
//!
//! Output is fully determined by the table: fixed column order, `\n` line endings,
//! RFC 4180 quoting only where a field needs it.

use chrono::SecondsFormat;

use crate::types::{FieldValue, NormalizedTable};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn encode_table(table: &NormalizedTable) -> Vec<u8> {
    let mut out = String::new();
    write_record(&mut out, table.header().iter().map(String::as_str));

    for row in &table.rows {
        let timestamp = row
            .timestamp
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        let ingested_at = row.ingested_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let date = row.date.to_string();
        let values: Vec<String> = row.values.iter().map(encode_value).collect();

        let fields = [
            row.entity.as_str(),
            date.as_str(),
            timestamp.as_str(),
            ingested_at.as_str(),
        ]
        .into_iter()
        .chain(values.iter().map(String::as_str));
        write_record(&mut out, fields);
    }

    out.into_bytes()
}

fn encode_value(value: &FieldValue) -> String {
    value.to_string()
}

fn write_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_field(out, field);
    }
    out.push('\n');
}

fn write_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NormalizedRow;
    use chrono::{NaiveDate, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_table() {
        let table = NormalizedTable {
            columns: vec!["temperature_2m_c".into(), "note".into()],
            rows: vec![
                NormalizedRow {
                    entity: "accra".into(),
                    date: "2024-01-15".parse().unwrap(),
                    timestamp: NaiveDate::from_ymd_opt(2024, 1, 15)
                        .unwrap()
                        .and_hms_opt(0, 0, 0),
                    ingested_at: Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap(),
                    values: vec![FieldValue::Number(26.4), FieldValue::Text("hot, dry".into())],
                },
                NormalizedRow {
                    entity: "accra".into(),
                    date: "2024-01-15".parse().unwrap(),
                    timestamp: None,
                    ingested_at: Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap(),
                    values: vec![FieldValue::Null, FieldValue::Text("say \"hi\"".into())],
                },
            ],
        };
        let csv = String::from_utf8(encode_table(&table)).unwrap();
        assert_eq!(
            csv,
            "entity,date,timestamp,ingested_at,temperature_2m_c,note\n\
             accra,2024-01-15,2024-01-15T00:00:00,2024-01-16T01:00:00Z,26.4,\"hot, dry\"\n\
             accra,2024-01-15,,2024-01-16T01:00:00Z,,\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn test_encode_empty_table_has_header_only() {
        let csv = String::from_utf8(encode_table(&NormalizedTable::default())).unwrap();
        assert_eq!(csv, "entity,date,timestamp,ingested_at\n");
    }
}
