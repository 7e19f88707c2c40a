//! Per-user profile features derived from the members table.

use std::sync::Arc;

use arrow::array::*;
use arrow::compute::cast;
use arrow::datatypes::DataType;
use chrono::NaiveDate;
use sluice::{SluiceError, TableValue};
use tracing::warn;

pub const GENDER_COLUMN: &str = "gender";
pub const REGISTRATION_COLUMN: &str = "registration_init_time";
pub const TENURE_COLUMN: &str = "tenure_days";

/// Replaces `gender` with its numeric code, adds `tenure_days` and drops the raw registration
/// date. Every other column passes through unchanged.
pub fn derive_member_features(
    members: &TableValue,
    reference: NaiveDate,
) -> Result<TableValue, SluiceError> {
    let gender = members
        .column(GENDER_COLUMN)
        .ok_or_else(|| missing(GENDER_COLUMN))?;
    let registered = members
        .column(REGISTRATION_COLUMN)
        .ok_or_else(|| missing(REGISTRATION_COLUMN))?;

    let gender_codes = encode_gender(gender)?;
    let tenure = tenure_days(registered, reference)?;

    let unparsed = tenure.null_count().saturating_sub(registered.null_count());
    if unparsed > 0 {
        warn!("{unparsed} registration dates were not YYYYMMDD and were treated as missing");
    }

    members
        .with_column(GENDER_COLUMN, Arc::new(gender_codes))?
        .with_column(TENURE_COLUMN, Arc::new(tenure))?
        .without_column(REGISTRATION_COLUMN)
}

/// `male` → 1, `female` → 2, anything else → null.
pub fn encode_gender(values: &ArrayRef) -> Result<Int64Array, SluiceError> {
    let text = cast(values.as_ref(), &DataType::Utf8)?;
    let text = text
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| SluiceError::InvalidTable("gender did not cast to text".into()))?;
    Ok(text
        .iter()
        .map(|v| match v {
            Some("male") => Some(1i64),
            Some("female") => Some(2i64),
            _ => None,
        })
        .collect())
}

/// Days from each registration date to `reference`. Missing or malformed dates give null.
pub fn tenure_days(values: &ArrayRef, reference: NaiveDate) -> Result<Int64Array, SluiceError> {
    let dates = registration_dates(values)?;
    Ok(dates
        .into_iter()
        .map(|d| d.map(|d| (reference - d).num_days()))
        .collect())
}

fn registration_dates(values: &ArrayRef) -> Result<Vec<Option<NaiveDate>>, SluiceError> {
    let dates = match values.data_type() {
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let floats = cast(values.as_ref(), &DataType::Float64)?;
            let floats = floats
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| SluiceError::InvalidTable("registration date cast failed".into()))?;
            floats
                .iter()
                .map(|v| {
                    v.filter(|x| x.fract() == 0.0)
                        .and_then(|x| parse_registration_date(&format!("{}", x as i64)))
                })
                .collect()
        }
        _ => {
            let text = cast(values.as_ref(), &DataType::Utf8)?;
            let text = text
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| SluiceError::InvalidTable("registration date cast failed".into()))?;
            text.iter()
                .map(|v| v.and_then(parse_registration_date))
                .collect()
        }
    };
    Ok(dates)
}

/// Parses an 8-digit `YYYYMMDD` date.
pub fn parse_registration_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

fn missing(column: &str) -> SluiceError {
    SluiceError::InvalidTable(format!("members table has no \"{column}\" column"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 2, 28).unwrap()
    }

    #[test]
    fn test_parse_registration_date() {
        assert_eq!(
            parse_registration_date("20110911"),
            NaiveDate::from_ymd_opt(2011, 9, 11)
        );
        assert_eq!(parse_registration_date("2011-09-11"), None);
        assert_eq!(parse_registration_date("20111311"), None);
        assert_eq!(parse_registration_date("201109"), None);
    }

    #[test]
    fn test_tenure_is_calendar_day_difference() {
        let registered: ArrayRef = Arc::new(Int64Array::from(vec![
            Some(20160101),
            Some(20170228),
            Some(20170201),
            None,
            Some(123),
        ]));
        let tenure = tenure_days(&registered, reference()).unwrap();
        assert_eq!(
            tenure.iter().collect::<Vec<_>>(),
            vec![Some(424), Some(0), Some(27), None, None]
        );
    }

    #[test]
    fn test_tenure_accepts_text_and_float_dates() {
        let text: ArrayRef = Arc::new(StringArray::from(vec![Some(" 20170227 "), Some("")]));
        let floats: ArrayRef = Arc::new(Float64Array::from(vec![Some(20170227.0), Some(2.5)]));
        assert_eq!(
            tenure_days(&text, reference()).unwrap().iter().collect::<Vec<_>>(),
            vec![Some(1), None]
        );
        assert_eq!(
            tenure_days(&floats, reference()).unwrap().iter().collect::<Vec<_>>(),
            vec![Some(1), None]
        );
    }

    #[test]
    fn test_gender_encoding() {
        let gender: ArrayRef = Arc::new(StringArray::from(vec![
            Some("male"),
            Some("female"),
            Some("Male"),
            None,
        ]));
        let codes = encode_gender(&gender).unwrap();
        assert_eq!(
            codes.iter().collect::<Vec<_>>(),
            vec![Some(1), Some(2), None, None]
        );
    }

    #[test]
    fn test_derive_drops_raw_registration_date() {
        let members = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u1", "u2"])) as ArrayRef),
            (
                "gender",
                Arc::new(StringArray::from(vec![Some("female"), None])) as ArrayRef,
            ),
            ("registered_via", Arc::new(Int64Array::from(vec![7, 9])) as ArrayRef),
            (
                "registration_init_time",
                Arc::new(Int64Array::from(vec![Some(20160101), None])) as ArrayRef,
            ),
        ])
        .unwrap();

        let derived = derive_member_features(&members, reference()).unwrap();
        assert_eq!(
            derived.column_names(),
            vec!["msno", "gender", "registered_via", "tenure_days"]
        );
        let tenure = derived
            .column(TENURE_COLUMN)
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(tenure.iter().collect::<Vec<_>>(), vec![Some(424), None]);
    }

    #[test]
    fn test_derive_requires_profile_columns() {
        let members = TableValue::from_columns(vec![(
            "msno",
            Arc::new(StringArray::from(vec!["u1"])) as ArrayRef,
        )])
        .unwrap();
        assert!(derive_member_features(&members, reference()).is_err());
    }
}
