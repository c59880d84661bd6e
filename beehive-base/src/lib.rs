mod bitmap256;
mod dedup;
mod error;
mod ids;
#[cfg(test)]
mod test;

pub use bitmap256::{Bitmap256, DoubleBitmap256};
pub use dedup::DedupWindow;
pub use error::{err, Error, Result};
pub use ids::{BeeId, Cell, Epoch, TraceId, TypeTag};
