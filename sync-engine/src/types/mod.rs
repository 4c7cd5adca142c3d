//! Core value types shared by every component.

mod fingerprint;
mod ids;
mod row;
mod value;

pub use fingerprint::Fingerprint;
pub use ids::{ConflictId, JobId};
pub use row::{PrimaryKey, RowImage, TableRow, project};
pub use value::Value;
