//! Delimited record codec
//!
//! Maps one delimited line to a typed record and back. Fields are matched by
//! position against the declared field names; there is no header row, no
//! trimming and no coercion beyond what the record type's `Deserialize`
//! implementation does.

use csv::{QuoteStyle, ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use serde::{de::DeserializeOwned, Serialize};
use spool_common::{Result, SpoolError};
use std::marker::PhantomData;

/// Default field delimiter
pub const DEFAULT_DELIMITER: u8 = b',';

/// Positional codec between delimited lines and records of type `R`
pub struct RecordCodec<R> {
    delimiter: u8,
    field_names: Vec<String>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for RecordCodec<R> {
    fn clone(&self) -> Self {
        Self {
            delimiter: self.delimiter,
            field_names: self.field_names.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for RecordCodec<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("delimiter", &(self.delimiter as char))
            .field("field_names", &self.field_names)
            .finish()
    }
}

impl<R> RecordCodec<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn new<I, S>(field_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            delimiter: DEFAULT_DELIMITER,
            field_names: field_names.into_iter().map(Into::into).collect(),
            _record: PhantomData,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Decode a single line into a record
    pub fn decode(&self, line: &str) -> Result<R> {
        self.decode_line(line, 1)
    }

    /// Decode one line of a file, reporting errors against `line_number`
    ///
    /// `line` must not contain its terminator. An empty line carries no
    /// fields and is rejected like any other wrong field count.
    pub fn decode_line(&self, line: &str, line_number: u64) -> Result<R> {
        if line.contains(['\r', '\n']) {
            return Err(SpoolError::Parse {
                line: line_number,
                message: "line break inside record".to_string(),
            });
        }

        let mut reader = self.reader_builder().from_reader(line.as_bytes());
        let mut fields = StringRecord::new();
        let found = reader
            .read_record(&mut fields)
            .map_err(|e| csv_error(e, line_number))?;
        if !found {
            return Err(SpoolError::MalformedRecord {
                line: line_number,
                expected: self.field_names.len(),
                found: 0,
            });
        }
        self.decode_fields(&fields, line_number)
    }

    fn decode_fields(&self, fields: &StringRecord, line: u64) -> Result<R> {
        if fields.len() != self.field_names.len() {
            return Err(SpoolError::MalformedRecord {
                line,
                expected: self.field_names.len(),
                found: fields.len(),
            });
        }

        fields.deserialize(None).map_err(|e| SpoolError::Parse {
            line,
            message: e.to_string(),
        })
    }

    /// Encode a record as a single line without a terminator
    pub fn encode(&self, record: &R) -> Result<String> {
        let mut line = Vec::new();
        self.encode_into(record, &mut line)?;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        String::from_utf8(line).map_err(|e| SpoolError::InvalidInput(e.to_string()))
    }

    /// Append the encoded record plus a `\n` terminator to `out`
    ///
    /// Fields are written verbatim, never quoted, so every line this codec
    /// decodes encodes back to itself. A field holding the delimiter or a
    /// line break has no unquoted form and is rejected; `out` is left as it
    /// was.
    pub fn encode_into(&self, record: &R, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        let written = {
            let mut writer = WriterBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(false)
                .quote_style(QuoteStyle::Never)
                .terminator(Terminator::Any(b'\n'))
                .from_writer(&mut *out);
            writer
                .serialize(record)
                .map_err(|e| SpoolError::InvalidInput(format!("Cannot encode record: {e}")))
                .and_then(|()| writer.flush().map_err(SpoolError::from))
        };
        if let Err(e) = written {
            out.truncate(start);
            return Err(e);
        }

        let body = out[start..].strip_suffix(b"\n").unwrap_or(&out[start..]);
        let delimiters = body.iter().filter(|&&b| b == self.delimiter).count();
        let breaks = body.iter().any(|&b| b == b'\n' || b == b'\r');
        if breaks || delimiters + 1 != self.field_names.len() {
            out.truncate(start);
            return Err(SpoolError::InvalidInput(format!(
                "Cannot encode record: a field contains the delimiter {:?} or a line break",
                self.delimiter as char
            )));
        }
        Ok(())
    }

    /// Reader settings for one unquoted line
    fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .has_headers(false)
            .quoting(false)
            .flexible(true);
        builder
    }
}

/// Translate a csv error into the Spool taxonomy
fn csv_error(err: csv::Error, line: u64) -> SpoolError {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => SpoolError::Io(e),
        other => SpoolError::Parse {
            line,
            message: format!("{other:?}"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::Person;
    use proptest::prelude::*;

    fn person_codec() -> RecordCodec<Person> {
        RecordCodec::new(Person::FIELD_NAMES)
    }

    #[test]
    fn test_decode_positional_fields() {
        let person = person_codec().decode("john,doe").unwrap();
        assert_eq!(person, Person::new("john", "doe"));
    }

    #[test]
    fn test_decode_keeps_whitespace() {
        let person = person_codec().decode(" john , doe").unwrap();
        assert_eq!(person.first_name, " john ");
        assert_eq!(person.last_name, " doe");
    }

    #[test]
    fn test_decode_wrong_field_count() {
        let err = person_codec().decode("john,doe,extra").unwrap_err();
        assert!(matches!(
            err,
            SpoolError::MalformedRecord {
                expected: 2,
                found: 3,
                ..
            }
        ));

        let err = person_codec().decode("john").unwrap_err();
        assert!(matches!(err, SpoolError::MalformedRecord { found: 1, .. }));
    }

    #[test]
    fn test_decode_empty_line_is_malformed() {
        let err = person_codec().decode("").unwrap_err();
        assert!(matches!(err, SpoolError::MalformedRecord { found: 0, .. }));
    }

    #[test]
    fn test_custom_delimiter() {
        let codec = person_codec().with_delimiter(b';');
        let person = codec.decode("jane;smith").unwrap();
        assert_eq!(person, Person::new("jane", "smith"));
        assert_eq!(codec.encode(&person).unwrap(), "jane;smith");
    }

    #[test]
    fn test_quotes_are_plain_characters() {
        let codec = person_codec();
        let person = codec.decode("jo\"hn,\"doe\"").unwrap();
        assert_eq!(person, Person::new("jo\"hn", "\"doe\""));
        assert_eq!(codec.encode(&person).unwrap(), "jo\"hn,\"doe\"");

        let upper = Person::new("JO\"HN", "DOE");
        assert_eq!(codec.encode(&upper).unwrap(), "JO\"HN,DOE");
    }

    #[test]
    fn test_encode_rejects_field_with_delimiter_or_line_break() {
        let codec = person_codec();
        let mut out = b"JOHN,DOE\n".to_vec();

        let err = codec
            .encode_into(&Person::new("smith, jr", "john"), &mut out)
            .unwrap_err();
        assert!(matches!(err, SpoolError::InvalidInput(_)));
        assert!(codec.encode(&Person::new("two\nlines", "x")).is_err());
        assert_eq!(out, b"JOHN,DOE\n");
    }

    #[test]
    fn test_decode_line_reports_line_number() {
        let err = person_codec().decode_line("", 7).unwrap_err();
        assert!(matches!(
            err,
            SpoolError::MalformedRecord {
                line: 7,
                expected: 2,
                found: 0
            }
        ));
    }

    #[test]
    fn test_encode_into_appends_terminated_lines() {
        let codec = person_codec();
        let mut out = Vec::new();
        codec.encode_into(&Person::new("JOHN", "DOE"), &mut out).unwrap();
        codec.encode_into(&Person::new("JANE", "SMITH"), &mut out).unwrap();
        assert_eq!(out, b"JOHN,DOE\nJANE,SMITH\n");
    }

    proptest! {
        #[test]
        fn prop_decode_then_encode_round_trips(
            first in "[A-Za-z0-9 _.;'\"-]{0,16}",
            last in "[A-Za-z0-9 _.;'\"-]{0,16}",
        ) {
            let codec = person_codec();
            let line = format!("{first},{last}");
            let person = codec.decode(&line).unwrap();
            prop_assert_eq!(codec.encode(&person).unwrap(), line);
        }
    }
}
