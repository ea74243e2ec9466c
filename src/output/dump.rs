//! Snapshot dump
//!
//! Writes every committed datum as one JSON object per line, in key order.

use crate::storage::{StorageBackend, StorageResult};
use std::io::Write;

const DUMP_PAGE_SIZE: usize = 512;

/// Dumps the committed snapshot as JSON lines; returns the number of datums written
pub fn dump_datums<B>(backend: &B, out: &mut impl Write) -> StorageResult<u64>
where
    B: StorageBackend + ?Sized,
{
    let mut after: Option<String> = None;
    let mut written = 0;

    loop {
        let page = backend.scan(after.as_deref(), DUMP_PAGE_SIZE)?;
        for datum in &page {
            serde_json::to_writer(&mut *out, datum)?;
            writeln!(out)?;
            written += 1;
        }
        match page.last() {
            Some(last) if page.len() == DUMP_PAGE_SIZE => after = Some(last.key.clone()),
            _ => break,
        }
    }

    out.flush()?;
    Ok(written)
}
