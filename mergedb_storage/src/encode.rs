//! Fixed little-endian encoding of column values inside part files.

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, NaiveDate};
use mergedb_types::{ColumnType, Value};
use std::io::{Read, Write};
use std::path::Path;

pub(crate) fn write_value<W: Write>(w: &mut W, value: &Value, path: &Path) -> Result<()> {
    let res = match value {
        Value::UInt64(v) => w.write_u64::<LittleEndian>(*v),
        Value::Int64(v) => w.write_i64::<LittleEndian>(*v),
        Value::Date(d) => w.write_i32::<LittleEndian>(d.num_days_from_ce()),
        Value::String(s) => w
            .write_u32::<LittleEndian>(s.len() as u32)
            .and_then(|()| w.write_all(s.as_bytes())),
    };
    res.map_err(|e| Error::io(path, e))
}

pub(crate) fn read_value<R: Read>(r: &mut R, ty: ColumnType, path: &Path) -> Result<Value> {
    let io_err = |e| Error::io(path, e);
    match ty {
        ColumnType::UInt64 => Ok(Value::UInt64(r.read_u64::<LittleEndian>().map_err(io_err)?)),
        ColumnType::Int64 => Ok(Value::Int64(r.read_i64::<LittleEndian>().map_err(io_err)?)),
        ColumnType::Date => {
            let days = r.read_i32::<LittleEndian>().map_err(io_err)?;
            let date = NaiveDate::from_num_days_from_ce_opt(days).ok_or_else(|| Error::Corrupt {
                part: path.display().to_string(),
                reason: format!("day number {days} out of range"),
            })?;
            Ok(Value::Date(date))
        }
        ColumnType::String => {
            let len = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).map_err(io_err)?;
            let s = String::from_utf8(buf).map_err(|e| Error::Corrupt {
                part: path.display().to_string(),
                reason: format!("non-utf8 string payload: {e}"),
            })?;
            Ok(Value::String(s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;

    #[test]
    fn value_round_trip() {
        let values = [
            (Value::UInt64(u64::MAX), ColumnType::UInt64),
            (Value::Int64(-5), ColumnType::Int64),
            (
                Value::Date(NaiveDate::from_ymd_opt(2014, 1, 31).unwrap()),
                ColumnType::Date,
            ),
            (Value::String("héllo".into()), ColumnType::String),
            (Value::String(String::new()), ColumnType::String),
        ];
        let path = PathBuf::from("test");
        for (value, ty) in values {
            let mut buf = Vec::new();
            write_value(&mut buf, &value, &path).unwrap();
            let got = read_value(&mut Cursor::new(buf), ty, &path).unwrap();
            assert_eq!(got, value);
        }
    }

    #[test]
    fn truncated_input_is_io_error() {
        let path = PathBuf::from("test");
        let err = read_value(&mut Cursor::new(vec![1u8, 2]), ColumnType::UInt64, &path);
        assert!(matches!(err, Err(Error::Io { .. })));
    }
}
