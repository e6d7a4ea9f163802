//! Decoding of text result columns shared by the SQL backends.
//!
//! Segment queries select every value as canonical text, so both backends
//! reduce their driver rows to `Option<String>` fields and decode them here.
//! Fetched rows are produced by a reader task and handed over through a
//! bounded channel ([`spawn_reader`]).

use std::future::Future;

use futures::{stream, StreamExt};
use tokio::sync::mpsc;

use crate::core::checksum::Checksum;
use crate::core::schema::KeyKind;
use crate::core::traits::RowStream;
use crate::core::value::{DbKey, DbValue, Row};
use crate::error::{DiffError, Result};

/// Rows buffered between a reader task and its consumer.
pub const FETCH_BUFFER: usize = 256;

/// Run `read` on its own task and stream the rows it sends.
///
/// A failed read ends the stream with its error. The reader should stop once
/// a send fails, which happens when the stream has been dropped.
pub fn spawn_reader<F, Fut>(read: F) -> RowStream
where
    F: FnOnce(mpsc::Sender<Result<Row>>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FETCH_BUFFER);
    let reader = read(tx.clone());
    tokio::spawn(async move {
        if let Err(e) = reader.await {
            let _ = tx.send(Err(e)).await;
        }
    });
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Parse a `COUNT(*)` result.
pub fn parse_count(backend: &str, text: Option<&str>) -> Result<u64> {
    let text = text.ok_or_else(|| DiffError::query(backend, "COUNT(*) returned NULL"))?;
    text.trim()
        .parse()
        .map_err(|_| DiffError::query(backend, format!("invalid row count {:?}", text)))
}

/// Parse a checksum `SUM` result; NULL means no rows.
pub fn parse_checksum(backend: &str, text: Option<&str>) -> Result<Checksum> {
    Checksum::from_sum_text(text)
        .ok_or_else(|| DiffError::query(backend, format!("invalid checksum {:?}", text)))
}

/// Parse a key value selected as text.
pub fn parse_key(backend: &str, kind: KeyKind, text: Option<&str>) -> Result<DbKey> {
    let text = text.ok_or_else(|| DiffError::query(backend, "key column contains NULL"))?;
    DbKey::parse(kind, text).ok_or_else(|| {
        DiffError::query(backend, format!("cannot parse {:?} as a {} key", text, kind))
    })
}

/// Build a [`Row`] from a key field followed by normalized column fields.
pub fn text_row(backend: &str, kind: KeyKind, mut fields: Vec<Option<String>>) -> Result<Row> {
    if fields.is_empty() {
        return Err(DiffError::query(backend, "fetched row has no columns"));
    }
    let values = fields
        .split_off(1)
        .into_iter()
        .map(|field| field.map(DbValue::Text).unwrap_or(DbValue::Null))
        .collect();
    let key = parse_key(backend, kind, fields[0].as_deref())?;
    Ok(Row { key, values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("postgres", Some("42")).unwrap(), 42);
        assert!(parse_count("postgres", None).is_err());
        assert!(parse_count("postgres", Some("-1")).is_err());
    }

    #[test]
    fn test_parse_checksum_null_is_empty() {
        assert_eq!(parse_checksum("mysql", None).unwrap(), Checksum::EMPTY);
        assert_eq!(parse_checksum("mysql", Some("17")).unwrap(), Checksum(17));
    }

    #[test]
    fn test_text_row() {
        let row = text_row(
            "postgres",
            KeyKind::Integer,
            vec![Some("7".into()), Some("4.500000".into()), None],
        )
        .unwrap();
        assert_eq!(row.key, DbKey::Int(7));
        assert_eq!(row.values, vec![DbValue::from("4.500000"), DbValue::Null]);
    }

    #[tokio::test]
    async fn test_reader_error_ends_the_stream() {
        let rows: Vec<Result<Row>> = spawn_reader(|tx| async move {
            tx.send(Ok(Row::new(1i64, vec![]))).await.ok();
            Err(DiffError::query("mysql", "connection reset"))
        })
        .collect()
        .await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ok());
        assert!(matches!(rows[1], Err(DiffError::Query { .. })));
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_the_reader() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut rows = spawn_reader(|tx| async move {
            let mut sent = 0u64;
            while tx.send(Ok(Row::new(sent as i64, vec![]))).await.is_ok() {
                sent += 1;
            }
            let _ = done_tx.send(sent);
            Ok(())
        });
        assert!(rows.next().await.is_some());
        drop(rows);

        let sent = done_rx.await.unwrap();
        assert!(sent <= FETCH_BUFFER as u64 + 1, "{} rows sent", sent);
    }

    #[test]
    fn test_null_key_is_query_error() {
        let err = text_row("postgres", KeyKind::Text, vec![None]).unwrap_err();
        assert!(matches!(err, DiffError::Query { .. }));
    }
}
