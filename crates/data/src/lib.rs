pub mod candles;
pub mod db;
pub mod queue;
pub mod stream_sinks;
pub mod transactions;

pub use candles::*;
pub use db::*;
pub use queue::*;
pub use stream_sinks::*;
pub use transactions::*;

use std::path::Path;

/// Delimiter chosen by file extension: comma for `.csv`, tab otherwise.
pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => b',',
        _ => b'\t',
    }
}
