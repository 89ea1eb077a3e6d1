//! Date-hierarchy partition templates.
//!
//! A template such as `year={year}/month={month}/day={day}` is parsed once and
//! rendered per [`TargetDate`]. Rendering is a pure function of the template and
//! the date, so raw and processed addresses always agree on the partition.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::TargetDate;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Year,
    Month,
    Day,
}

/// A parsed partition template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFormat {
    template: String,
    segments: Vec<Segment>,
}

impl PartitionFormat {
    /// Parse a template. It must reference `{year}`, `{month}` and `{day}` and nothing else.
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(format!(
                                    "partition format '{}' has an unclosed '{{'",
                                    template
                                ));
                            }
                        }
                    }
                    let segment = match name.as_str() {
                        "year" => Segment::Year,
                        "month" => Segment::Month,
                        "day" => Segment::Day,
                        other => {
                            return Err(format!(
                                "partition format '{}' has unknown placeholder '{{{}}}'",
                                template, other
                            ));
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => {
                    return Err(format!(
                        "partition format '{}' has an unmatched '}}'",
                        template
                    ));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        for (segment, placeholder) in [
            (Segment::Year, "{year}"),
            (Segment::Month, "{month}"),
            (Segment::Day, "{day}"),
        ] {
            if !segments.contains(&segment) {
                return Err(format!(
                    "partition format '{}' must contain {}",
                    template, placeholder
                ));
            }
        }
        if template.starts_with('/') || template.split('/').any(|part| part == "..") {
            return Err(format!(
                "partition format '{}' must be a relative path without '..'",
                template
            ));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
        })
    }

    /// Render the partition key for `date`. Month and day are zero-padded.
    pub fn render(&self, date: TargetDate) -> PartitionKey {
        let mut out = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Year => out.push_str(&format!("{:04}", date.year())),
                Segment::Month => out.push_str(&format!("{:02}", date.month())),
                Segment::Day => out.push_str(&format!("{:02}", date.day())),
            }
        }
        PartitionKey(out)
    }
}

/// Deterministic storage-address fragment derived from a target date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> TargetDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_render_hive_style() {
        let format = PartitionFormat::parse("year={year}/month={month}/day={day}").unwrap();
        assert_eq!(
            format.render(date("2024-01-15")).as_str(),
            "year=2024/month=01/day=15"
        );
        assert_eq!(
            format.render(date("2023-12-05")).as_str(),
            "year=2023/month=12/day=05"
        );
    }

    #[test]
    fn test_render_plain_and_reordered() {
        let format = PartitionFormat::parse("{day}-{month}-{year}").unwrap();
        assert_eq!(format.render(date("2024-02-09")).as_str(), "09-02-2024");
    }

    #[test]
    fn test_render_is_stable() {
        let format = PartitionFormat::parse("year={year}/month={month}/day={day}").unwrap();
        let a = format.render(date("2024-01-15"));
        let b = format.render(date("2024-01-15"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().as_bytes(), b.as_str().as_bytes());
    }

    #[test]
    fn test_parse_rejects_missing_placeholder() {
        let err = PartitionFormat::parse("year={year}/day={day}").unwrap_err();
        assert!(err.contains("{month}"));
    }

    #[test]
    fn test_parse_rejects_unknown_placeholder() {
        let err = PartitionFormat::parse("{year}/{month}/{day}/{hour}").unwrap_err();
        assert!(err.contains("{hour}"));
    }

    #[test]
    fn test_parse_rejects_unbalanced_braces() {
        assert!(PartitionFormat::parse("{year}/{month}/{day").is_err());
        assert!(PartitionFormat::parse("{year}/{month}/day}").is_err());
    }

    #[test]
    fn test_parse_rejects_escaping_paths() {
        assert!(PartitionFormat::parse("/{year}/{month}/{day}").is_err());
        assert!(PartitionFormat::parse("../{year}/{month}/{day}").is_err());
    }
}
