pub mod catalog;
pub mod holdings;
pub mod records;
pub mod runs;
pub mod settings;

pub use catalog::{Catalog, CatalogError};
pub use records::CatalogRecord;
