//! CSV export for the trade ledger.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::sim::scheduler::LedgerEntry;

/// Column header for trade-ledger CSV export.
const HEADER: &str = "area,time_slot,trade_id,offer_id,bid_id,seller,buyer,\
                      traded_energy_kwh,traded_price,fee_price,total_price";

/// Exports the trade ledger to a CSV file at the given path.
///
/// Writes a header row followed by one row per trade, in ledger order.
/// Identical ledgers produce identical files apart from the random ids.
///
/// # Arguments
///
/// * `entries` - Trades with the area whose market recorded them
/// * `path` - Output file path
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(entries: &[LedgerEntry], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(entries, buf)
}

/// Writes the trade ledger as CSV to any writer.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv(entries: &[LedgerEntry], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    wtr.write_record(HEADER.split(',').map(str::trim))?;

    for e in entries {
        let t = &e.trade;
        wtr.write_record(&[
            e.area.clone(),
            t.time_slot.to_string(),
            t.id.to_string(),
            t.offer_id.to_string(),
            t.bid_id.map(|id| id.to_string()).unwrap_or_default(),
            t.seller.clone(),
            t.buyer.clone(),
            format!("{:.6}", t.traded_energy),
            format!("{:.4}", t.traded_price),
            format!("{:.4}", t.fee_price),
            format!("{:.6}", t.total_price()),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
