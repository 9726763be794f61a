// Address Base - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod entities;
pub mod errors;
pub mod identifiers;
pub mod import;
pub mod report;
pub mod store;

// Re-export commonly used types
pub use entities::{
    Attributes, ChangeSet, Group, GroupInput, GroupKind, HouseNumber, HouseNumberInput,
    Municipality, MunicipalityInput, ParentRef, Position, PositionInput, PositionKind, Positioning,
    PostCode, PostCodeInput,
};
pub use errors::{ErrorSet, FieldError, FormatError, StoreError};
pub use identifiers::{derive_cia, derive_fantoir, derive_siren, split_fantoir, strip_control_char};
pub use import::{count_records, process_record, run_init, ImportOptions, Outcome};
pub use report::{Entry, Level, Reporter};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
