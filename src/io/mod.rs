/// CSV export of the trade ledger.
pub mod export;
